use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Nv12,
    Nv16,
    Yuv420p,
    Yuv444p,
    P010,
    Rgb24,
    Bgr24,
    Rgba,
}

impl PixelFormat {
    pub fn bit_depth(&self) -> u32 {
        match self {
            PixelFormat::P010 => 10,
            _ => 8,
        }
    }

    fn bytes_per_sample(&self) -> usize {
        match self {
            PixelFormat::P010 => 2,
            _ => 1,
        }
    }

    /// Bytes of one frame with the given row pitch (bytes) and height.
    pub fn frame_size(&self, pitch: u32, height: u32) -> usize {
        let luma = pitch as usize * height as usize;
        match self {
            PixelFormat::Nv12 | PixelFormat::Yuv420p | PixelFormat::P010 => luma * 3 / 2,
            PixelFormat::Nv16 => luma * 2,
            PixelFormat::Yuv444p => luma * 3,
            PixelFormat::Rgb24 | PixelFormat::Bgr24 | PixelFormat::Rgba => luma,
        }
    }

    /// Minimal pitch (bytes per row) for a given width.
    pub fn min_pitch(&self, width: u32) -> u32 {
        let per_pixel = match self {
            PixelFormat::Rgb24 | PixelFormat::Bgr24 => 3,
            PixelFormat::Rgba => 4,
            _ => self.bytes_per_sample(),
        };
        width * per_pixel as u32
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PicStruct {
    #[default]
    Progressive,
    TopFieldFirst,
    BottomFieldFirst,
    Field,
}

impl PicStruct {
    pub fn is_interlaced(&self) -> bool {
        !matches!(self, PicStruct::Progressive)
    }
}

/// Memory a Surface lives in. Fixed for the lifetime of the Surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryDomain {
    Host,
    GpuCompute,
    Native,
}

/// Frame shape used for allocation and device configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FrameInfo {
    pub width: u32,
    pub height: u32,
    /// Row pitch in bytes.
    pub pitch: u32,
    pub format: PixelFormat,
    pub bit_depth: u32,
    #[serde(default)]
    pub pic_struct: PicStruct,
}

impl FrameInfo {
    pub fn new(width: u32, height: u32, format: PixelFormat) -> Self {
        Self {
            width,
            height,
            pitch: format.min_pitch(width),
            format,
            bit_depth: format.bit_depth(),
            pic_struct: PicStruct::Progressive,
        }
    }

    pub fn with_pitch(mut self, pitch: u32) -> Self {
        self.pitch = pitch;
        self
    }

    pub fn with_pic_struct(mut self, pic_struct: PicStruct) -> Self {
        self.pic_struct = pic_struct;
        self
    }

    pub fn frame_size(&self) -> usize {
        self.format.frame_size(self.pitch, self.height)
    }

    /// Same geometry and layout, ignoring field order.
    pub fn same_layout(&self, other: &FrameInfo) -> bool {
        self.width == other.width
            && self.height == other.height
            && self.pitch == other.pitch
            && self.format == other.format
    }
}

impl Display for FrameInfo {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "{}x{} pitch {} {:?} {}bit {:?}",
            self.width, self.height, self.pitch, self.format, self.bit_depth, self.pic_struct
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameFlags(u32);

impl FrameFlags {
    pub const NONE: FrameFlags = FrameFlags(0);
    pub const REPEAT_FIELD: FrameFlags = FrameFlags(1 << 0);
    pub const KEYFRAME: FrameFlags = FrameFlags(1 << 1);
    pub const DISCONTINUITY: FrameFlags = FrameFlags(1 << 2);

    pub fn contains(&self, other: FrameFlags) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn insert(&mut self, other: FrameFlags) {
        self.0 |= other.0;
    }

    pub fn bits(&self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SideDataKind {
    Hdr10Plus,
    DolbyVisionRpu,
    ContentLight,
    Other(u32),
}

/// Metadata blob attached to a frame, keyed by the timestamp it belongs to.
#[derive(Debug, Clone)]
pub struct SideData {
    pub kind: SideDataKind,
    pub pts: i64,
    pub payload: Bytes,
}

/// Backing memory of a Surface.
///
/// `data` is the host-visible mapping of the buffer. Device memory that
/// cannot be mapped keeps it empty and is addressed through `buffer_id`.
#[derive(Debug)]
pub struct Storage {
    domain: MemoryDomain,
    buffer_id: u64,
    data: Vec<u8>,
}

impl Storage {
    pub fn host(len: usize) -> Self {
        Self {
            domain: MemoryDomain::Host,
            buffer_id: 0,
            data: vec![0; len],
        }
    }

    pub fn new(domain: MemoryDomain, buffer_id: u64, data: Vec<u8>) -> Self {
        Self {
            domain,
            buffer_id,
            data,
        }
    }

    pub fn domain(&self) -> MemoryDomain {
        self.domain
    }

    pub fn buffer_id(&self) -> u64 {
        self.buffer_id
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data
    }

    pub fn is_mapped(&self) -> bool {
        !self.data.is_empty()
    }
}

/// A raw video frame plus its metadata.
#[derive(Debug)]
pub struct Surface {
    info: FrameInfo,
    storage: Storage,
    pub pts: Option<i64>,
    pub duration: i64,
    pub input_frame_id: u64,
    pub flags: FrameFlags,
    pub side_data: Vec<SideData>,
}

impl Surface {
    pub fn new(info: FrameInfo, storage: Storage) -> Self {
        Self {
            info,
            storage,
            pts: None,
            duration: 0,
            input_frame_id: 0,
            flags: FrameFlags::NONE,
            side_data: Vec::new(),
        }
    }

    pub fn info(&self) -> &FrameInfo {
        &self.info
    }

    pub fn domain(&self) -> MemoryDomain {
        self.storage.domain()
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn data(&self) -> &[u8] {
        self.storage.data()
    }

    pub fn data_mut(&mut self) -> &mut [u8] {
        self.storage.data_mut()
    }

    /// Reinterprets the frame shape without touching storage. Used by
    /// decoders that report a new stride for an already mapped buffer.
    pub fn set_info(&mut self, info: FrameInfo) {
        self.info = info;
    }

    /// Copies timing, identity, flags and side data from `other`.
    pub fn copy_props_from(&mut self, other: &Surface) {
        self.pts = other.pts;
        self.duration = other.duration;
        self.input_frame_id = other.input_frame_id;
        self.flags = other.flags;
        self.side_data = other.side_data.clone();
        self.info.pic_struct = other.info.pic_struct;
    }

    /// Copies pixel data row by row, honouring both pitches.
    pub fn copy_pixels_from(&mut self, other: &Surface) -> usize {
        let src_pitch = other.info.pitch as usize;
        let dst_pitch = self.info.pitch as usize;
        if src_pitch == 0 || dst_pitch == 0 {
            return 0;
        }
        let row = src_pitch.min(dst_pitch);
        let rows = (other.data().len() / src_pitch).min(self.data().len() / dst_pitch);
        let src = other.storage.data();
        let dst = self.storage.data_mut();
        for r in 0..rows {
            dst[r * dst_pitch..r * dst_pitch + row]
                .copy_from_slice(&src[r * src_pitch..r * src_pitch + row]);
        }
        rows * row
    }
}

impl Display for Surface {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Surface {} {:?} pts: {:?}, duration: {}, id: {}, side_data: {}",
            self.info,
            self.domain(),
            self.pts,
            self.duration,
            self.input_frame_id,
            self.side_data.len()
        )
    }
}

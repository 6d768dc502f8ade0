//! Hardware codec adapter contract.
//!
//! A vendor SDK plugs into the pipeline by implementing [`DeviceBackend`],
//! [`DecoderDevice`] and [`EncoderDevice`]. The stages drive these through
//! non-blocking calls and own every retry.

use std::fmt::{Display, Formatter};

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::frame::{FrameInfo, PixelFormat};
use crate::packet::Bitstream;
use crate::pool::{SurfaceHandle, SurfacePool};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CodingFormat {
    H264,
    Hevc,
    Vp8,
    Vp9,
    Av1,
    Mpeg2,
    Mpeg4,
    Vc1,
    Mjpeg,
    RawVideo,
}

impl CodingFormat {
    /// Resolves the common codec and encoder names to a coding format.
    pub fn from_name(name: &str) -> Option<Self> {
        let format = match name.to_ascii_lowercase().as_str() {
            "h264" | "avc" | "libx264" => CodingFormat::H264,
            "hevc" | "h265" | "libx265" => CodingFormat::Hevc,
            "vp8" | "libvpx" => CodingFormat::Vp8,
            "vp9" | "libvpx-vp9" => CodingFormat::Vp9,
            "av1" | "libaom-av1" | "libsvtav1" => CodingFormat::Av1,
            "mpeg2" | "mpeg2video" => CodingFormat::Mpeg2,
            "mpeg4" => CodingFormat::Mpeg4,
            "vc1" | "wmv3" => CodingFormat::Vc1,
            "mjpeg" | "jpeg" => CodingFormat::Mjpeg,
            "raw" | "rawvideo" => CodingFormat::RawVideo,
            _ => return None,
        };
        Some(format)
    }

    pub fn name(&self) -> &'static str {
        match self {
            CodingFormat::H264 => "h264",
            CodingFormat::Hevc => "hevc",
            CodingFormat::Vp8 => "vp8",
            CodingFormat::Vp9 => "vp9",
            CodingFormat::Av1 => "av1",
            CodingFormat::Mpeg2 => "mpeg2",
            CodingFormat::Mpeg4 => "mpeg4",
            CodingFormat::Vc1 => "vc1",
            CodingFormat::Mjpeg => "mjpeg",
            CodingFormat::RawVideo => "rawvideo",
        }
    }

    /// Whether decoders for this format return usable presentation
    /// timestamps. Field-coded and packed B-frame streams come back with
    /// decode-order or missing values.
    pub fn hw_pts_reliable(&self) -> bool {
        !matches!(
            self,
            CodingFormat::Mpeg2 | CodingFormat::Mpeg4 | CodingFormat::Vc1
        )
    }
}

impl Display for CodingFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutStatus {
    Accepted,
    BufferFull,
}

/// Hardware request to rebuild its buffer group with a new geometry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FormatChange {
    pub info: FrameInfo,
    pub buffer_count: usize,
}

#[derive(Debug)]
pub struct DecodedFrame {
    /// Decoded picture. End-of-stream markers may come without one.
    pub surface: Option<SurfaceHandle>,
    pub pts: Option<i64>,
    pub eos: bool,
}

#[derive(Debug)]
pub enum DecodePoll {
    Timeout,
    NoFrame,
    FormatChange(FormatChange),
    Frame(DecodedFrame),
    DiscardedFrame { code: i32 },
}

pub trait DecoderDevice: Send {
    fn coding_format(&self) -> CodingFormat;

    /// Buffers the device wants in its buffer group before the first
    /// format change arrives.
    fn min_buffers(&self) -> usize {
        4
    }

    /// Hands the device the pool it decodes into.
    fn attach_buffer_group(&mut self, pool: SurfacePool) -> Result<()>;

    fn put_packet(&mut self, data: &[u8], pts: Option<i64>, eos: bool) -> Result<PutStatus>;

    fn get_frame(&mut self) -> Result<DecodePoll>;

    /// Confirms that the buffer group was rebuilt after a format change.
    fn ack_format_change(&mut self) -> Result<()>;
}

/// Input preparation parameters of an encoder.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InputPrep {
    pub width: u32,
    pub height: u32,
    pub hor_stride: u32,
    pub ver_stride: u32,
    pub format: PixelFormat,
}

impl InputPrep {
    pub fn from_info(info: &FrameInfo) -> Self {
        Self {
            width: info.width,
            height: info.height,
            hor_stride: info.pitch,
            ver_stride: info.height,
            format: info.format,
        }
    }

    pub fn matches(&self, info: &FrameInfo) -> bool {
        *self == Self::from_info(info)
    }

    pub fn frame_info(&self) -> FrameInfo {
        FrameInfo::new(self.width, self.height, self.format).with_pitch(self.hor_stride)
    }
}

/// Frame descriptor handed to an encoder. The terminator is a descriptor
/// with `eos` set and no surface.
#[derive(Debug, Clone)]
pub struct EncodeFrame {
    pub surface: Option<SurfaceHandle>,
    pub pts: i64,
    pub duration: i64,
    pub eos: bool,
    pub force_idr: bool,
}

impl EncodeFrame {
    pub fn eos(pts: i64) -> Self {
        Self {
            surface: None,
            pts,
            duration: 0,
            eos: true,
            force_idr: false,
        }
    }
}

#[derive(Debug)]
pub enum EncodePoll {
    Timeout,
    NoPacket,
    Packet(Bitstream),
    Eos,
}

pub trait EncoderDevice: Send {
    fn coding_format(&self) -> CodingFormat;

    fn input_prep(&self) -> InputPrep;

    fn configure_input(&mut self, prep: InputPrep) -> Result<()>;

    fn min_input_buffers(&self) -> usize {
        1
    }

    fn put_frame(&mut self, frame: &EncodeFrame) -> Result<PutStatus>;

    fn get_packet(&mut self) -> Result<EncodePoll>;
}

/// Creates codec sessions. Fails with `Unsupported` for formats the
/// hardware cannot handle and `Device` for everything else.
pub trait DeviceBackend: Send + Sync {
    fn name(&self) -> &str;

    fn init_decoder(&self, format: CodingFormat, hint: &FrameInfo)
    -> Result<Box<dyn DecoderDevice>>;

    fn init_encoder(&self, format: CodingFormat, prep: InputPrep)
    -> Result<Box<dyn EncoderDevice>>;
}

pub mod loopback;

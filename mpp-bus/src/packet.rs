use std::fmt::{Display, Formatter};

use bytes::Bytes;

use crate::frame::SideData;

/// Which elementary stream a packet belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Track {
    #[default]
    Video,
    Audio,
}

/// Compressed bitstream unit, either read from the demuxer or produced by
/// an encoder.
#[derive(Debug, Clone, Default)]
pub struct Bitstream {
    pub data: Bytes,
    pub pts: Option<i64>,
    pub dts: Option<i64>,
    pub duration: i64,
    pub is_key: bool,
    pub avg_qp: Option<f32>,
    pub track: Track,
    pub side_data: Vec<SideData>,
}

impl Bitstream {
    pub fn new(data: impl Into<Bytes>, pts: Option<i64>) -> Self {
        Self {
            data: data.into(),
            pts,
            ..Default::default()
        }
    }

    pub fn audio(data: impl Into<Bytes>, pts: i64, duration: i64) -> Self {
        Self {
            data: data.into(),
            pts: Some(pts),
            dts: Some(pts),
            duration,
            is_key: true,
            track: Track::Audio,
            ..Default::default()
        }
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Display for Bitstream {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "Bitstream {:?} size: {}, pts: {:?}, dts: {:?}, duration: {}, is_key: {}, qp: {:?}",
            self.track,
            self.data.len(),
            self.pts,
            self.dts,
            self.duration,
            self.is_key,
            self.avg_qp
        )
    }
}

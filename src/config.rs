use std::path::{Path, PathBuf};

use anyhow::Context;
use mpp_bus::PipelineConfig;
use mpp_bus::device::CodingFormat;
use mpp_bus::filter::iep::DeinterlaceMode;
use mpp_bus::frame::{FrameInfo, PicStruct, PixelFormat};
use mpp_bus::timestamp::Rational;
use serde::Deserialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum InputLayout {
    /// Back to back raw frames.
    #[default]
    Frames,
    /// Length and pts prefixed records, fed to the decoder.
    Packets,
}

/// Raw PCM played alongside the video.
#[derive(Debug, Clone, Deserialize)]
pub struct AudioInput {
    pub input: PathBuf,
    pub output: PathBuf,
    pub sample_rate: u32,
    #[serde(default = "default_bytes_per_sample_frame")]
    pub bytes_per_sample_frame: usize,
    #[serde(default = "default_samples_per_packet")]
    pub samples_per_packet: usize,
}

fn default_bytes_per_sample_frame() -> usize {
    4
}

fn default_samples_per_packet() -> usize {
    1024
}

/// One transcoding run, as read from the command line JSON file.
#[derive(Debug, Clone, Deserialize)]
pub struct RunConfig {
    pub input: PathBuf,
    pub output: PathBuf,
    #[serde(default)]
    pub timecode: Option<PathBuf>,
    pub width: u32,
    pub height: u32,
    #[serde(default = "default_format")]
    pub format: PixelFormat,
    #[serde(default)]
    pub pitch: Option<u32>,
    #[serde(default)]
    pub pic_struct: PicStruct,
    pub frame_rate: Rational,
    #[serde(default)]
    pub layout: InputLayout,
    /// Time base of the packet timestamps, the inverse frame rate if unset.
    #[serde(default)]
    pub time_base: Option<Rational>,
    #[serde(default)]
    pub decode: Option<CodingFormat>,
    #[serde(default)]
    pub encode: Option<CodingFormat>,
    #[serde(default)]
    pub deinterlace: Option<DeinterlaceMode>,
    #[serde(default)]
    pub audio: Option<AudioInput>,
    #[serde(default)]
    pub pipeline: PipelineConfig,
}

fn default_format() -> PixelFormat {
    PixelFormat::Nv12
}

impl RunConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read run config {}", path.display()))?;
        let run: RunConfig = serde_json::from_str(&json)
            .with_context(|| format!("parse run config {}", path.display()))?;
        run.validate()?;
        Ok(run)
    }

    fn validate(&self) -> anyhow::Result<()> {
        if self.width == 0 || self.height == 0 {
            anyhow::bail!("invalid geometry {}x{}", self.width, self.height);
        }
        if self.layout == InputLayout::Packets && self.decode.is_none() {
            anyhow::bail!("packet input needs a decode format");
        }
        self.pipeline.validate().context("pipeline section")?;
        Ok(())
    }

    pub fn frame_info(&self) -> FrameInfo {
        let info = FrameInfo::new(self.width, self.height, self.format).with_pic_struct(self.pic_struct);
        match self.pitch {
            Some(pitch) => info.with_pitch(pitch),
            None => info,
        }
    }

    pub fn time_base(&self) -> Rational {
        self.time_base.unwrap_or(self.frame_rate.invert())
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

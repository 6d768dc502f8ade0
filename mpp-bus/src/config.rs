//! Pipeline configuration.
//!
//! Built once, validated, then passed by reference into every stage
//! constructor. Nothing mutates it after the pipeline is assembled.

use std::path::Path;
use std::time::Duration;

use anyhow::Context;
use serde::{Deserialize, Serialize};

use crate::error::{PipelineError, Result};
use crate::pool::PoolOptions;
use crate::timestamp::{Rational, frame_duration};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AvSyncMode {
    /// Timestamps are rebuilt from the nominal frame rate.
    #[default]
    Passthrough,
    /// Source timestamps are kept, large discontinuities are absorbed.
    Vfr,
    /// Frames are duplicated or dropped to hit the nominal cadence exactly.
    Cfr,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TimestampConfig {
    pub mode: AvSyncMode,
    pub output_time_base: Rational,
    pub frame_rate: Rational,
    /// Keep the first source timestamp instead of starting at zero.
    pub keep_source_offset: bool,
    /// Consecutive synthetic inserts or drops before a gap is treated as a
    /// discontinuity.
    pub max_insert: u32,
}

impl Default for TimestampConfig {
    fn default() -> Self {
        Self {
            mode: AvSyncMode::Passthrough,
            output_time_base: Rational::MPEG,
            frame_rate: Rational::new(30, 1),
            keep_source_offset: false,
            max_insert: 60,
        }
    }
}

impl TimestampConfig {
    /// Nominal frame duration in the output time base.
    pub fn nominal_duration(&self) -> i64 {
        frame_duration(self.frame_rate, self.output_time_base)
    }
}

/// Inclusive range of input frame ids to keep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrimRange {
    pub start: u64,
    pub end: u64,
}

impl TrimRange {
    pub fn contains(&self, frame_id: u64) -> bool {
        frame_id >= self.start && frame_id <= self.end
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Items a stage keeps queued before the driver may extract them.
    pub output_depth: usize,
    /// Pipelining depth added to every negotiated allocation.
    pub async_depth: usize,
    pub decode_retry_limit: u32,
    pub encode_retry_limit: u32,
    pub poll_interval_us: u64,
    pub pool_retry_limit: u32,
    pub pool_backoff_us: u64,
    /// Frames per second pulled from the first stage, 0 for unlimited.
    pub speed_limit: f64,
    pub timestamp: TimestampConfig,
    pub trims: Vec<TrimRange>,
    /// Substitute source timestamps for decoder output timestamps. `None`
    /// decides from the coding format.
    pub pts_from_input: Option<bool>,
    /// Force an IDR every n frames, 0 to leave it to the encoder.
    pub gop_length: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            output_depth: 1,
            async_depth: 3,
            decode_retry_limit: 10_000,
            encode_retry_limit: 10_000,
            poll_interval_us: 500,
            pool_retry_limit: 10_000,
            pool_backoff_us: 100,
            speed_limit: 0.0,
            timestamp: TimestampConfig::default(),
            trims: Vec::new(),
            pts_from_input: None,
            gop_length: 0,
        }
    }
}

impl PipelineConfig {
    pub fn builder() -> PipelineConfigBuilder {
        PipelineConfigBuilder::default()
    }

    pub fn from_json_str(json: &str) -> anyhow::Result<Self> {
        let config: PipelineConfig =
            serde_json::from_str(json).context("parse pipeline config")?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path)
            .with_context(|| format!("read pipeline config {}", path.display()))?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<()> {
        let ts = &self.timestamp;
        if !ts.frame_rate.is_valid() {
            return Err(PipelineError::Config(format!(
                "invalid frame rate {}",
                ts.frame_rate
            )));
        }
        if !ts.output_time_base.is_valid() {
            return Err(PipelineError::Config(format!(
                "invalid output time base {}",
                ts.output_time_base
            )));
        }
        if let Some(t) = self.trims.iter().find(|t| t.start > t.end) {
            return Err(PipelineError::Config(format!(
                "trim range {}-{} ends before it starts",
                t.start, t.end
            )));
        }
        if self.speed_limit < 0.0 {
            return Err(PipelineError::Config("negative speed limit".to_string()));
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn pool_options(&self) -> PoolOptions {
        PoolOptions {
            retry_limit: self.pool_retry_limit,
            backoff: Duration::from_micros(self.pool_backoff_us),
        }
    }
}

#[derive(Default)]
pub struct PipelineConfigBuilder {
    config: PipelineConfig,
}

impl PipelineConfigBuilder {
    pub fn output_depth(mut self, depth: usize) -> Self {
        self.config.output_depth = depth;
        self
    }

    pub fn async_depth(mut self, depth: usize) -> Self {
        self.config.async_depth = depth;
        self
    }

    pub fn retry_limits(mut self, decode: u32, encode: u32) -> Self {
        self.config.decode_retry_limit = decode;
        self.config.encode_retry_limit = encode;
        self
    }

    pub fn poll_interval_us(mut self, us: u64) -> Self {
        self.config.poll_interval_us = us;
        self
    }

    pub fn pool_retry(mut self, limit: u32, backoff_us: u64) -> Self {
        self.config.pool_retry_limit = limit;
        self.config.pool_backoff_us = backoff_us;
        self
    }

    pub fn speed_limit(mut self, fps: f64) -> Self {
        self.config.speed_limit = fps;
        self
    }

    pub fn avsync(mut self, mode: AvSyncMode) -> Self {
        self.config.timestamp.mode = mode;
        self
    }

    pub fn frame_rate(mut self, rate: Rational) -> Self {
        self.config.timestamp.frame_rate = rate;
        self
    }

    pub fn output_time_base(mut self, time_base: Rational) -> Self {
        self.config.timestamp.output_time_base = time_base;
        self
    }

    pub fn keep_source_offset(mut self, keep: bool) -> Self {
        self.config.timestamp.keep_source_offset = keep;
        self
    }

    pub fn max_insert(mut self, max: u32) -> Self {
        self.config.timestamp.max_insert = max;
        self
    }

    pub fn add_trim(mut self, start: u64, end: u64) -> Self {
        self.config.trims.push(TrimRange { start, end });
        self
    }

    pub fn pts_from_input(mut self, enable: bool) -> Self {
        self.config.pts_from_input = Some(enable);
        self
    }

    pub fn gop_length(mut self, frames: u32) -> Self {
        self.config.gop_length = frames;
        self
    }

    pub fn build(self) -> PipelineConfig {
        self.config
    }
}

#[cfg(test)]
#[path = "config_test.rs"]
mod config_test;

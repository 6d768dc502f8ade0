//! Pipeline assembly.
//!
//! [`PipelineBuilder`] turns a reader, a writer and a description of the
//! work in between into an ordered stage list, negotiates the pools between
//! the stages and hands everything to a [`Driver`].
//!
//! Stage order: input, decode, trim, filters, timestamp correction, audio,
//! encode. Timestamp correction sits right before the stages that consume
//! its timestamps.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::alloc::{AllocationPlan, MemoryAllocator, Negotiator, SurfaceAllocator};
use crate::config::PipelineConfig;
use crate::device::{CodingFormat, DeviceBackend, InputPrep};
use crate::driver::{Driver, RunStats};
use crate::error::{PipelineError, Result};
use crate::filter::{ComputeContext, FrameTransform};
use crate::io::{AudioSource, Reader, SharedWriter, TimecodeWriter};
use crate::stage::{
    AudioStage, CheckPtsStage, DecodeStage, EncodeStage, FilterStage, InputStage, Stage,
    TrimStage,
};

pub struct PipelineBuilder {
    config: PipelineConfig,
    backend: Option<Arc<dyn DeviceBackend>>,
    allocator: Arc<dyn SurfaceAllocator>,
    compute: Option<Arc<dyn ComputeContext>>,
    reader: Option<Box<dyn Reader>>,
    writer: Option<SharedWriter>,
    decode: Option<CodingFormat>,
    filters: Vec<Box<dyn FrameTransform>>,
    encode: Option<CodingFormat>,
    audio: Option<Box<dyn AudioSource>>,
    timecode: Option<Box<dyn TimecodeWriter>>,
    cancel: Option<CancellationToken>,
}

impl PipelineBuilder {
    fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            backend: None,
            allocator: Arc::new(MemoryAllocator::native()),
            compute: None,
            reader: None,
            writer: None,
            decode: None,
            filters: Vec::new(),
            encode: None,
            audio: None,
            timecode: None,
            cancel: None,
        }
    }

    pub fn backend(mut self, backend: Arc<dyn DeviceBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Allocator for accelerator native memory.
    pub fn allocator(mut self, allocator: Arc<dyn SurfaceAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn compute_context(mut self, context: Arc<dyn ComputeContext>) -> Self {
        self.compute = Some(context);
        self
    }

    pub fn reader(mut self, reader: Box<dyn Reader>) -> Self {
        self.reader = Some(reader);
        self
    }

    pub fn writer(mut self, writer: SharedWriter) -> Self {
        self.writer = Some(writer);
        self
    }

    /// Decodes the reader's packets. Without it the reader supplies raw
    /// frames.
    pub fn decode(mut self, format: CodingFormat) -> Self {
        self.decode = Some(format);
        self
    }

    pub fn filter(mut self, transform: Box<dyn FrameTransform>) -> Self {
        self.filters.push(transform);
        self
    }

    /// Encodes the output. Without it the writer receives frames.
    pub fn encode(mut self, format: CodingFormat) -> Self {
        self.encode = Some(format);
        self
    }

    pub fn audio(mut self, source: Box<dyn AudioSource>) -> Self {
        self.audio = Some(source);
        self
    }

    pub fn timecode(mut self, writer: Box<dyn TimecodeWriter>) -> Self {
        self.timecode = Some(writer);
        self
    }

    pub fn cancel(mut self, token: CancellationToken) -> Self {
        self.cancel = Some(token);
        self
    }

    fn backend_for(&self, what: &str) -> Result<&dyn DeviceBackend> {
        self.backend.as_deref().ok_or_else(|| {
            PipelineError::Config(format!("{} requested without a device backend", what))
        })
    }

    pub fn build(mut self) -> Result<Pipeline> {
        self.config.validate()?;
        let config = &self.config;
        let depth = config.output_depth;
        let reader = self
            .reader
            .take()
            .ok_or_else(|| PipelineError::Config("pipeline has no reader".to_string()))?;
        let writer = self
            .writer
            .take()
            .ok_or_else(|| PipelineError::Config("pipeline has no writer".to_string()))?;
        let mut info = reader.frame_info();
        let mut time_base = reader.time_base();
        let reader_pts_reliable = reader.pts_reliable();

        let mut stages: Vec<Stage> = Vec::new();
        match self.decode {
            Some(format) => {
                stages.push(InputStage::bitstream(reader, depth).into());
                let backend = self.backend_for("decode")?;
                let mut decode_config = config.clone();
                // untrusted container timestamps are no better than the decoder's
                if !reader_pts_reliable && decode_config.pts_from_input.is_none() {
                    decode_config.pts_from_input = Some(false);
                }
                let decode =
                    DecodeStage::new(backend, format, info, self.allocator.clone(), &decode_config)?;
                stages.push(decode.into());
            }
            None => stages.push(InputStage::raw(reader, depth).into()),
        }
        if !config.trims.is_empty() {
            stages.push(TrimStage::new(&config.trims, depth).into());
        }
        for transform in std::mem::take(&mut self.filters) {
            let stage = FilterStage::new(transform, info, depth);
            info = stage.output_info();
            time_base = stage.output_time_base(time_base);
            stages.push(stage.into());
        }
        let mut check_pts = CheckPtsStage::new(&config.timestamp, time_base, depth);
        if let Some(timecode) = self.timecode.take() {
            check_pts = check_pts.with_timecode(timecode);
        }
        stages.push(check_pts.into());
        if let Some(source) = self.audio.take() {
            stages.push(
                AudioStage::new(source, writer.clone(), config.timestamp.output_time_base, depth)
                    .into(),
            );
        }
        if let Some(format) = self.encode {
            let backend = self.backend_for("encode")?;
            let encode = EncodeStage::new(
                backend,
                format,
                InputPrep::from_info(&info),
                self.allocator.clone(),
                config,
            )?;
            stages.push(encode.into());
        }

        let mut negotiator = Negotiator::new(self.allocator.clone(), config);
        if let Some(context) = self.compute.clone() {
            negotiator = negotiator.with_compute(context);
        }
        let plans = negotiator.allocate(&mut stages)?;

        let mut driver = Driver::new(stages, writer, config)?;
        if let Some(token) = self.cancel.take() {
            driver = driver.with_cancel(token);
        }
        Ok(Pipeline { driver, plans })
    }
}

/// A fully assembled pipeline, ready to run once.
pub struct Pipeline {
    driver: Driver,
    plans: Vec<AllocationPlan>,
}

impl Pipeline {
    pub fn builder(config: PipelineConfig) -> PipelineBuilder {
        PipelineBuilder::new(config)
    }

    pub fn plans(&self) -> &[AllocationPlan] {
        &self.plans
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.driver.cancel_token()
    }

    pub fn driver(&self) -> &Driver {
        &self.driver
    }

    pub fn run(&mut self) -> Result<RunStats> {
        self.driver.run()
    }
}

#[cfg(test)]
#[path = "bus_test.rs"]
mod bus_test;

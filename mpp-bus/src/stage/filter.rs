use crate::error::{PipelineError, Result, StageStatus};
use crate::filter::{FilterOutput, FrameTransform};
use crate::frame::FrameInfo;
use crate::item::OutputItem;
use crate::pool::SurfacePool;
use crate::timestamp::Rational;

use super::{FrameRequirement, PipelineStage, StageKind, StageQueue};

/// Runs a [`FrameTransform`] between two stages.
pub struct FilterStage {
    transform: Box<dyn FrameTransform>,
    input_info: FrameInfo,
    pool: Option<SurfacePool>,
    queue: StageQueue,
    frames_in: u64,
    frames_out: u64,
}

impl FilterStage {
    pub fn new(transform: Box<dyn FrameTransform>, input_info: FrameInfo, depth: usize) -> Self {
        log::info!(
            "filter {} ({:?}): {} -> {}",
            transform.name(),
            transform.kind(),
            input_info,
            transform.output_info(&input_info)
        );
        Self {
            transform,
            input_info,
            pool: None,
            queue: StageQueue::new(depth),
            frames_in: 0,
            frames_out: 0,
        }
    }

    pub fn output_info(&self) -> FrameInfo {
        self.transform.output_info(&self.input_info)
    }

    /// Time base of the frames this stage emits when its input arrives in
    /// `input`.
    pub fn output_time_base(&self, input: Rational) -> Rational {
        self.transform.output_time_base(input)
    }

    fn push(&mut self, output: FilterOutput) -> bool {
        let produced = !output.frames.is_empty();
        for frame in output.frames {
            self.frames_out += 1;
            self.queue
                .push(OutputItem::surface(frame).with_dependencies(output.fences.iter().cloned()));
        }
        produced
    }
}

impl PipelineStage for FilterStage {
    fn name(&self) -> &str {
        self.transform.name()
    }

    fn kind(&self) -> StageKind {
        StageKind::Filter(self.transform.kind())
    }

    fn required_input(&self) -> Option<FrameRequirement> {
        Some(FrameRequirement {
            info: self.input_info,
            count: self.transform.min_buffers(),
            domain: self.transform.input_domain(),
        })
    }

    fn required_output(&self) -> Option<FrameRequirement> {
        Some(FrameRequirement {
            info: self.output_info(),
            count: self.transform.min_buffers(),
            domain: self.transform.output_domain(),
        })
    }

    fn attach_output_pool(&mut self, pool: SurfacePool) -> Result<()> {
        self.pool = Some(pool);
        Ok(())
    }

    fn pools(&self) -> Vec<SurfacePool> {
        self.pool.iter().cloned().collect()
    }

    fn queue(&self) -> &StageQueue {
        &self.queue
    }

    fn queue_mut(&mut self) -> &mut StageQueue {
        &mut self.queue
    }

    fn send_frame(&mut self, item: Option<OutputItem>) -> Result<StageStatus> {
        let pool = self.pool.clone().ok_or_else(|| {
            PipelineError::InvalidState(format!("{} has no output pool", self.transform.name()))
        })?;
        let Some(mut item) = item else {
            let output = self.transform.process(None, &pool)?;
            self.push(output);
            log::debug!(
                "filter {} flushed: {} in, {} out",
                self.transform.name(),
                self.frames_in,
                self.frames_out
            );
            return Ok(StageStatus::EndOfStream);
        };
        item.wait_dependencies();
        let Some(handle) = item.as_surface() else {
            return Err(PipelineError::InvalidSurface(format!(
                "{} expects frames",
                self.transform.name()
            )));
        };
        self.frames_in += 1;
        let output = self.transform.process(Some(handle), &pool)?;
        Ok(if self.push(output) {
            StageStatus::Accepted
        } else {
            StageStatus::NeedMoreInput
        })
    }
}

#[cfg(test)]
#[path = "filter_test.rs"]
mod filter_test;

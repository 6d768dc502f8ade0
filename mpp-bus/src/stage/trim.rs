use crate::config::TrimRange;
use crate::error::{PipelineError, Result, StageStatus};
use crate::item::OutputItem;

use super::{PipelineStage, StageKind, StageQueue};

/// Drops frames whose input frame id falls outside every trim range.
pub struct TrimStage {
    ranges: Vec<TrimRange>,
    queue: StageQueue,
    passed: u64,
    dropped: u64,
    past_end_logged: bool,
}

impl TrimStage {
    pub fn new(ranges: &[TrimRange], depth: usize) -> Self {
        let mut ranges = ranges.to_vec();
        ranges.sort_by_key(|r| r.start);
        Self {
            ranges,
            queue: StageQueue::new(depth),
            passed: 0,
            dropped: 0,
            past_end_logged: false,
        }
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    fn keep(&self, frame_id: u64) -> bool {
        self.ranges.is_empty() || self.ranges.iter().any(|r| r.contains(frame_id))
    }

    /// Past the last range nothing more will be kept.
    fn past_end(&self, frame_id: u64) -> bool {
        self.ranges
            .iter()
            .map(|r| r.end)
            .max()
            .is_some_and(|end| frame_id > end)
    }
}

impl PipelineStage for TrimStage {
    fn name(&self) -> &str {
        "trim"
    }

    fn kind(&self) -> StageKind {
        StageKind::Trim
    }

    fn is_pass_through(&self) -> bool {
        true
    }

    fn queue(&self) -> &StageQueue {
        &self.queue
    }

    fn queue_mut(&mut self) -> &mut StageQueue {
        &mut self.queue
    }

    fn send_frame(&mut self, item: Option<OutputItem>) -> Result<StageStatus> {
        let Some(item) = item else {
            log::debug!("trim passed {} frames, dropped {}", self.passed, self.dropped);
            return Ok(StageStatus::EndOfStream);
        };
        let Some(handle) = item.as_surface() else {
            return Err(PipelineError::InvalidSurface(
                "trim expects decoded frames".to_string(),
            ));
        };
        let frame_id = handle.read().input_frame_id;
        if self.keep(frame_id) {
            self.passed += 1;
            self.queue.push(item);
            return Ok(StageStatus::Accepted);
        }
        self.dropped += 1;
        if !self.past_end_logged && self.past_end(frame_id) {
            self.past_end_logged = true;
            log::info!("trim: frame {} is past the last range", frame_id);
        }
        Ok(StageStatus::NeedMoreInput)
    }
}

#[cfg(test)]
#[path = "trim_test.rs"]
mod trim_test;

use crate::error::{Result, StageStatus};
use crate::io::{AudioSource, SharedWriter};
use crate::item::OutputItem;
use crate::timestamp::{Rational, rescale};

use super::{PipelineStage, StageKind, StageQueue};

/// Forwards video untouched and writes every audio packet that is due by
/// the time of the current video frame.
pub struct AudioStage {
    source: Box<dyn AudioSource>,
    writer: SharedWriter,
    time_base: Rational,
    queue: StageQueue,
    written: u64,
}

impl AudioStage {
    /// `time_base` is the time base of the video items reaching this stage.
    pub fn new(
        source: Box<dyn AudioSource>,
        writer: SharedWriter,
        time_base: Rational,
        depth: usize,
    ) -> Self {
        Self {
            source,
            writer,
            time_base,
            queue: StageQueue::new(depth),
            written: 0,
        }
    }

    pub fn packets_written(&self) -> u64 {
        self.written
    }

    /// Writes audio up to `until` (video time base), everything when `None`.
    fn forward(&mut self, until: Option<i64>) -> Result<()> {
        let audio_tb = self.source.time_base();
        loop {
            // packets without a timestamp go out with whatever precedes them
            let due = match (self.source.peek_pts()?, until) {
                (Some(pts), Some(until)) => rescale(pts, audio_tb, self.time_base) <= until,
                _ => true,
            };
            if !due {
                return Ok(());
            }
            let Some(packet) = self.source.next_packet()? else {
                return Ok(());
            };
            self.writer
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .write_audio_packet(&packet)?;
            self.written += 1;
        }
    }
}

impl PipelineStage for AudioStage {
    fn name(&self) -> &str {
        "audio"
    }

    fn kind(&self) -> StageKind {
        StageKind::Audio
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
            self.forward(None)?;
            log::debug!("audio: {} packets written", self.written);
            return Ok(StageStatus::EndOfStream);
        };
        if let Some(pts) = item.timestamp() {
            self.forward(Some(pts))?;
        }
        self.queue.push(item);
        Ok(StageStatus::Accepted)
    }
}

#[cfg(test)]
#[path = "audio_test.rs"]
mod audio_test;

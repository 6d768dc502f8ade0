//! Timestamp correction.
//!
//! Rewrites frame timestamps into the output time base and one of three
//! timelines. Surfaces are never touched: the corrected timestamp travels as
//! an override on the item.

use crate::config::{AvSyncMode, TimestampConfig};
use crate::error::{Result, StageStatus};
use crate::item::{Fence, OutputItem, Payload, TimestampOverride};
use crate::io::TimecodeWriter;
use crate::pool::SurfaceHandle;
use crate::timestamp::{Rational, rescale};

use super::{PipelineStage, StageKind, StageQueue};

/// A gap of this many nominal durations is a discontinuity.
const DISCONTINUITY_FRAMES: i64 = 32;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckPtsStats {
    pub emitted: u64,
    pub dropped: u64,
    pub inserted: u64,
    pub reoffsets: u64,
    pub nudged: u64,
}

pub struct CheckPtsStage {
    mode: AvSyncMode,
    in_time_base: Rational,
    out_time_base: Rational,
    duration: i64,
    keep_source_offset: bool,
    max_insert: u32,
    /// Subtracted from every rescaled source timestamp.
    offset: Option<i64>,
    estimated_next: i64,
    previous_emitted: Option<i64>,
    /// Consecutive inserts and drops.
    correction_run: u32,
    queue: StageQueue,
    timecode: Option<Box<dyn TimecodeWriter>>,
    stats: CheckPtsStats,
}

impl CheckPtsStage {
    pub fn new(config: &TimestampConfig, in_time_base: Rational, depth: usize) -> Self {
        Self {
            mode: config.mode,
            in_time_base,
            out_time_base: config.output_time_base,
            duration: config.nominal_duration(),
            keep_source_offset: config.keep_source_offset,
            max_insert: config.max_insert,
            offset: None,
            estimated_next: 0,
            previous_emitted: None,
            correction_run: 0,
            queue: StageQueue::new(depth),
            timecode: None,
            stats: CheckPtsStats::default(),
        }
    }

    pub fn with_timecode(mut self, writer: Box<dyn TimecodeWriter>) -> Self {
        self.timecode = Some(writer);
        self
    }

    pub fn stats(&self) -> CheckPtsStats {
        self.stats
    }

    pub fn nominal_duration(&self) -> i64 {
        self.duration
    }

    /// Over 7/8 of a frame away.
    fn beyond_tolerance(&self, distance: i64) -> bool {
        distance.saturating_mul(8) > self.duration.saturating_mul(7)
    }

    fn is_discontinuity(&self, diff: i64) -> bool {
        diff.saturating_abs() >= self.duration.saturating_mul(DISCONTINUITY_FRAMES)
    }

    /// Position of the frame on the normalized timeline.
    fn position(&mut self, source: Option<i64>) -> i64 {
        let Some(source) = source else {
            return self.estimated_next;
        };
        let source = rescale(source, self.in_time_base, self.out_time_base);
        let offset = match self.offset {
            Some(offset) => offset,
            None => {
                let offset = if self.keep_source_offset { 0 } else { source };
                self.offset = Some(offset);
                self.estimated_next = source - offset;
                offset
            }
        };
        source - offset
    }

    fn emit(&mut self, handle: &SurfaceHandle, fences: &[Fence], pts: i64) -> Result<()> {
        if let Some(tc) = self.timecode.as_mut() {
            tc.write_timecode(pts, self.out_time_base)?;
        }
        let item = OutputItem::surface(handle.clone())
            .with_dependencies(fences.iter().cloned())
            .with_override(TimestampOverride {
                pts,
                duration: self.duration,
            });
        self.queue.push(item);
        self.previous_emitted = Some(pts);
        self.stats.emitted += 1;
        Ok(())
    }

    fn drop_frame(&mut self, pos: i64, reason: &str) -> StageStatus {
        log::warn!(
            "check-pts: dropping frame at {} ({}), expected {}",
            pos,
            reason,
            self.estimated_next
        );
        self.stats.dropped += 1;
        StageStatus::NeedMoreInput
    }

    fn reoffset(&mut self, diff: i64) {
        log::warn!(
            "check-pts: discontinuity of {} at {}, re-offsetting",
            diff,
            self.estimated_next
        );
        if let Some(offset) = self.offset.as_mut() {
            *offset += diff;
        }
        self.stats.reoffsets += 1;
    }

    fn passthrough(&mut self, handle: &SurfaceHandle, fences: &[Fence]) -> Result<StageStatus> {
        let pts = self.estimated_next;
        self.emit(handle, fences, pts)?;
        self.estimated_next += self.duration;
        Ok(StageStatus::Accepted)
    }

    fn vfr(&mut self, handle: &SurfaceHandle, fences: &[Fence], mut pos: i64) -> Result<StageStatus> {
        let diff = pos - self.estimated_next;
        if self.is_discontinuity(diff) && diff < 0 {
            // the source went back in time, shift it so the frame lands on schedule
            self.reoffset(diff);
            pos = self.estimated_next;
        } else if self.is_discontinuity(diff) {
            log::warn!(
                "check-pts: discontinuity of {} at {}, new baseline {}",
                diff,
                self.estimated_next,
                pos
            );
            self.stats.reoffsets += 1;
            self.estimated_next = pos;
        } else if self.beyond_tolerance(-diff) {
            return Ok(self.drop_frame(pos, "behind schedule"));
        }
        let mut pts = pos;
        if let Some(prev) = self.previous_emitted
            && pts <= prev
        {
            let nudged = prev + (self.duration / 4).max(1);
            log::warn!("check-pts: timestamp {} not after {}, using {}", pts, prev, nudged);
            self.stats.nudged += 1;
            pts = nudged;
        }
        self.emit(handle, fences, pts)?;
        self.estimated_next = pts + self.duration;
        Ok(StageStatus::Accepted)
    }

    fn cfr(&mut self, handle: &SurfaceHandle, fences: &[Fence], pos: i64) -> Result<StageStatus> {
        let mut diff = pos - self.estimated_next;
        let mut corrected = false;
        if self.is_discontinuity(diff) {
            self.reoffset(diff);
            diff = 0;
        }
        if self.beyond_tolerance(-diff) {
            if self.correction_run < self.max_insert {
                self.correction_run += 1;
                return Ok(self.drop_frame(pos, "behind schedule"));
            }
            self.reoffset(diff);
            diff = 0;
        }
        while self.beyond_tolerance(diff) {
            if self.correction_run >= self.max_insert {
                self.reoffset(diff);
                break;
            }
            let pts = self.estimated_next;
            log::debug!("check-pts: inserting frame at {}", pts);
            self.emit(handle, fences, pts)?;
            self.stats.inserted += 1;
            self.correction_run += 1;
            self.estimated_next += self.duration;
            diff -= self.duration;
            corrected = true;
        }
        if !corrected {
            self.correction_run = 0;
        }

        let pts = self.estimated_next;
        if let Some(prev) = self.previous_emitted
            && pts <= prev
        {
            return Ok(self.drop_frame(pts, "not after previous"));
        }
        self.emit(handle, fences, pts)?;
        self.estimated_next += self.duration;
        Ok(StageStatus::Accepted)
    }
}

impl PipelineStage for CheckPtsStage {
    fn name(&self) -> &str {
        "check-pts"
    }

    fn kind(&self) -> StageKind {
        StageKind::CheckPts
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
            if let Some(tc) = self.timecode.as_mut() {
                tc.flush()?;
            }
            log::info!(
                "check-pts: {} emitted, {} dropped, {} inserted, {} re-offsets",
                self.stats.emitted,
                self.stats.dropped,
                self.stats.inserted,
                self.stats.reoffsets
            );
            return Ok(StageStatus::EndOfStream);
        };
        let source = item.timestamp();
        let (payload, fences, _) = item.into_parts();
        let handle = match payload {
            Payload::Surface(handle) => handle,
            Payload::Bitstream(packet) => {
                self.queue
                    .push(OutputItem::bitstream(packet).with_dependencies(fences));
                return Ok(StageStatus::Accepted);
            }
        };
        let pos = self.position(source);
        let status = match self.mode {
            AvSyncMode::Passthrough => self.passthrough(&handle, &fences),
            AvSyncMode::Vfr => self.vfr(&handle, &fences, pos),
            AvSyncMode::Cfr => self.cfr(&handle, &fences, pos),
        }?;
        if status == StageStatus::NeedMoreInput {
            // a dropped frame goes back to its pool only once upstream work is done
            fences.iter().for_each(Fence::wait);
        }
        Ok(status)
    }

    /// One item per call: the override is only meaningful for the frame it
    /// was computed for.
    fn get_output(&mut self, sync: bool) -> Vec<OutputItem> {
        self.queue.pop_ready(sync).into_iter().collect()
    }
}

#[cfg(test)]
#[path = "check_pts_test.rs"]
mod check_pts_test;

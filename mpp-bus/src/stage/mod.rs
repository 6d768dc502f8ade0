//! Pipeline stages.
//!
//! Every stage consumes one item per `send_frame` call and parks what it
//! produces in its [`StageQueue`]. The driver pulls items out with
//! `get_output` once the queue is deeper than its configured bound.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};

use crate::error::{PipelineError, Result, StageStatus};
use crate::filter::FilterKind;
use crate::frame::{FrameInfo, MemoryDomain};
use crate::item::OutputItem;
use crate::pool::SurfacePool;

pub mod audio;
pub mod check_pts;
pub mod decode;
pub mod encode;
pub mod filter;
pub mod input;
pub mod trim;

pub use audio::AudioStage;
pub use check_pts::CheckPtsStage;
pub use decode::DecodeStage;
pub use encode::EncodeStage;
pub use filter::FilterStage;
pub use input::InputStage;
pub use trim::TrimStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StageKind {
    Input,
    Decode,
    Trim,
    CheckPts,
    Filter(FilterKind),
    Audio,
    Encode,
}

impl StageKind {
    /// Rank used when two neighbours disagree on the frame shape.
    pub fn priority(&self) -> u8 {
        match self {
            StageKind::Encode => 4,
            StageKind::Decode => 3,
            StageKind::Filter(kind) if kind.is_deinterlacer() => 2,
            StageKind::Filter(_) => 1,
            _ => 0,
        }
    }
}

impl Display for StageKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            StageKind::Input => f.write_str("input"),
            StageKind::Decode => f.write_str("decode"),
            StageKind::Trim => f.write_str("trim"),
            StageKind::CheckPts => f.write_str("check-pts"),
            StageKind::Filter(kind) => write!(f, "filter({:?})", kind),
            StageKind::Audio => f.write_str("audio"),
            StageKind::Encode => f.write_str("encode"),
        }
    }
}

/// Frame shape and count a stage needs on one of its sides.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameRequirement {
    pub info: FrameInfo,
    pub count: usize,
    pub domain: MemoryDomain,
}

/// Bounded FIFO of produced items. Items beyond `max_depth` are ready for
/// the driver.
#[derive(Debug)]
pub struct StageQueue {
    items: VecDeque<OutputItem>,
    max_depth: usize,
}

impl StageQueue {
    pub fn new(max_depth: usize) -> Self {
        Self {
            items: VecDeque::new(),
            max_depth,
        }
    }

    pub fn push(&mut self, item: OutputItem) {
        self.items.push_back(item);
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn max_depth(&self) -> usize {
        self.max_depth
    }

    pub fn set_max_depth(&mut self, depth: usize) {
        self.max_depth = depth;
    }

    /// Whether an item is beyond the depth bound.
    pub fn has_ready(&self) -> bool {
        self.items.len() > self.max_depth
    }

    fn ready(mut item: OutputItem, sync: bool) -> OutputItem {
        if sync {
            item.wait_dependencies();
        }
        item
    }

    /// Every item beyond the depth bound, oldest first.
    pub fn drain_ready(&mut self, sync: bool) -> Vec<OutputItem> {
        let mut out = Vec::new();
        while self.items.len() > self.max_depth {
            if let Some(item) = self.items.pop_front() {
                out.push(Self::ready(item, sync));
            }
        }
        out
    }

    /// At most one item beyond the depth bound.
    pub fn pop_ready(&mut self, sync: bool) -> Option<OutputItem> {
        if self.items.len() > self.max_depth {
            self.items.pop_front().map(|item| Self::ready(item, sync))
        } else {
            None
        }
    }

    pub fn clear(&mut self) {
        self.items.clear();
    }
}

/// Contract every stage implements.
///
/// `send_frame(None)` tells the stage its upstream ended. A stage answers
/// `EndOfStream` once it has queued its last item.
pub trait PipelineStage: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> StageKind;

    fn required_input(&self) -> Option<FrameRequirement> {
        None
    }

    fn required_output(&self) -> Option<FrameRequirement> {
        None
    }

    /// Forwards the storage it receives instead of producing new frames.
    fn is_pass_through(&self) -> bool {
        false
    }

    /// Receives the pool negotiated for this stage's output.
    fn attach_output_pool(&mut self, pool: SurfacePool) -> Result<()> {
        Err(PipelineError::InvalidState(format!(
            "{} does not take an output pool ({})",
            self.name(),
            pool.name()
        )))
    }

    /// Pools owned by the stage, checked after the flush.
    fn pools(&self) -> Vec<SurfacePool> {
        Vec::new()
    }

    fn queue(&self) -> &StageQueue;

    fn queue_mut(&mut self) -> &mut StageQueue;

    fn send_frame(&mut self, item: Option<OutputItem>) -> Result<StageStatus>;

    fn get_output(&mut self, sync: bool) -> Vec<OutputItem> {
        self.queue_mut().drain_ready(sync)
    }

    fn set_max_depth(&mut self, depth: usize) {
        self.queue_mut().set_max_depth(depth);
    }

    /// Cooperative cancellation. Returns whether the stage will wind down
    /// through a regular end of stream.
    fn abort(&mut self) -> bool {
        false
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// The closed set of stages the driver runs.
pub enum Stage {
    Input(InputStage),
    Decode(DecodeStage),
    Trim(TrimStage),
    CheckPts(CheckPtsStage),
    Filter(FilterStage),
    Audio(AudioStage),
    Encode(EncodeStage),
}

impl Stage {
    pub fn as_dyn(&self) -> &dyn PipelineStage {
        match self {
            Stage::Input(s) => s,
            Stage::Decode(s) => s,
            Stage::Trim(s) => s,
            Stage::CheckPts(s) => s,
            Stage::Filter(s) => s,
            Stage::Audio(s) => s,
            Stage::Encode(s) => s,
        }
    }

    pub fn as_dyn_mut(&mut self) -> &mut dyn PipelineStage {
        match self {
            Stage::Input(s) => s,
            Stage::Decode(s) => s,
            Stage::Trim(s) => s,
            Stage::CheckPts(s) => s,
            Stage::Filter(s) => s,
            Stage::Audio(s) => s,
            Stage::Encode(s) => s,
        }
    }

    pub fn name(&self) -> &str {
        self.as_dyn().name()
    }

    pub fn kind(&self) -> StageKind {
        self.as_dyn().kind()
    }

    pub fn is_pass_through(&self) -> bool {
        self.as_dyn().is_pass_through()
    }

    pub fn send_frame(&mut self, item: Option<OutputItem>) -> Result<StageStatus> {
        self.as_dyn_mut().send_frame(item)
    }

    pub fn get_output(&mut self, sync: bool) -> Vec<OutputItem> {
        self.as_dyn_mut().get_output(sync)
    }

    /// Items still parked in the stage queue.
    pub fn pending(&self) -> usize {
        self.as_dyn().queue().len()
    }

    pub fn has_ready(&self) -> bool {
        self.as_dyn().queue().has_ready()
    }

    pub fn set_max_depth(&mut self, depth: usize) {
        self.as_dyn_mut().set_max_depth(depth);
    }

    pub fn abort(&mut self) -> bool {
        self.as_dyn_mut().abort()
    }

    pub fn pools(&self) -> Vec<SurfacePool> {
        self.as_dyn().pools()
    }

    pub fn close(&mut self) -> Result<()> {
        self.as_dyn_mut().close()
    }
}

impl From<InputStage> for Stage {
    fn from(s: InputStage) -> Self {
        Stage::Input(s)
    }
}

impl From<DecodeStage> for Stage {
    fn from(s: DecodeStage) -> Self {
        Stage::Decode(s)
    }
}

impl From<TrimStage> for Stage {
    fn from(s: TrimStage) -> Self {
        Stage::Trim(s)
    }
}

impl From<CheckPtsStage> for Stage {
    fn from(s: CheckPtsStage) -> Self {
        Stage::CheckPts(s)
    }
}

impl From<FilterStage> for Stage {
    fn from(s: FilterStage) -> Self {
        Stage::Filter(s)
    }
}

impl From<AudioStage> for Stage {
    fn from(s: AudioStage) -> Self {
        Stage::Audio(s)
    }
}

impl From<EncodeStage> for Stage {
    fn from(s: EncodeStage) -> Self {
        Stage::Encode(s)
    }
}

#[cfg(test)]
#[path = "stage_test.rs"]
mod stage_test;

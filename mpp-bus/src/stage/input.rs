use crate::error::{PipelineError, Result, StageStatus};
use crate::frame::MemoryDomain;
use crate::io::Reader;
use crate::item::OutputItem;
use crate::pool::SurfacePool;

use super::{FrameRequirement, PipelineStage, StageKind, StageQueue};

/// First stage. Pulls compressed packets from the reader, or raw frames
/// when nothing downstream decodes.
pub struct InputStage {
    reader: Box<dyn Reader>,
    raw: bool,
    pool: Option<SurfacePool>,
    queue: StageQueue,
    next_frame_id: u64,
    eos: bool,
    abort_requested: bool,
}

impl InputStage {
    /// Emits one bitstream item per packet.
    pub fn bitstream(reader: Box<dyn Reader>, depth: usize) -> Self {
        Self::new(reader, false, depth)
    }

    /// Emits one surface per raw frame, loaded into the negotiated pool.
    pub fn raw(reader: Box<dyn Reader>, depth: usize) -> Self {
        Self::new(reader, true, depth)
    }

    fn new(reader: Box<dyn Reader>, raw: bool, depth: usize) -> Self {
        Self {
            reader,
            raw,
            pool: None,
            queue: StageQueue::new(depth),
            next_frame_id: 0,
            eos: false,
            abort_requested: false,
        }
    }

    pub fn frames_read(&self) -> u64 {
        self.reader.frames_read()
    }

    fn read_packet(&mut self) -> Result<bool> {
        let Some(packet) = self.reader.get_next_bitstream()? else {
            return Ok(false);
        };
        self.queue.push(OutputItem::bitstream(packet));
        Ok(true)
    }

    fn read_frame(&mut self) -> Result<bool> {
        let pool = self.pool.as_ref().ok_or_else(|| {
            PipelineError::InvalidState("raw input has no output pool".to_string())
        })?;
        let handle = pool.acquire_free()?;
        {
            let mut surface = handle.write()?;
            if !self.reader.load_next_frame(&mut surface)? {
                return Ok(false);
            }
            surface.input_frame_id = self.next_frame_id;
        }
        self.next_frame_id += 1;
        self.queue.push(OutputItem::surface(handle));
        Ok(true)
    }
}

impl PipelineStage for InputStage {
    fn name(&self) -> &str {
        "input"
    }

    fn kind(&self) -> StageKind {
        StageKind::Input
    }

    fn required_output(&self) -> Option<FrameRequirement> {
        self.raw.then(|| FrameRequirement {
            info: self.reader.frame_info(),
            count: 1,
            domain: MemoryDomain::Native,
        })
    }

    fn attach_output_pool(&mut self, pool: SurfacePool) -> Result<()> {
        if !self.raw {
            return Err(PipelineError::InvalidState(
                "bitstream input does not allocate frames".to_string(),
            ));
        }
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

    fn send_frame(&mut self, _item: Option<OutputItem>) -> Result<StageStatus> {
        if self.eos {
            return Ok(StageStatus::EndOfStream);
        }
        if self.abort_requested {
            log::info!("input stopped on abort after {} reads", self.frames_read());
            self.eos = true;
            return Ok(StageStatus::EndOfStream);
        }
        let more = if self.raw {
            self.read_frame()?
        } else {
            self.read_packet()?
        };
        if more {
            Ok(StageStatus::Accepted)
        } else {
            log::debug!("input reached end of stream after {} reads", self.frames_read());
            self.eos = true;
            Ok(StageStatus::EndOfStream)
        }
    }

    fn abort(&mut self) -> bool {
        self.abort_requested = true;
        true
    }
}

#[cfg(test)]
#[path = "input_test.rs"]
mod input_test;

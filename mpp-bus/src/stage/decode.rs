//! Hardware decode stage.
//!
//! Feeds one packet per `send_frame` and then polls the decoder until it has
//! nothing more to give, or until a frame is ready for the next stage. The
//! hardware may ask for a new buffer group at any time; the stage rebuilds the
//! pool in place and acknowledges.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;

use crate::alloc::SurfaceAllocator;
use crate::config::PipelineConfig;
use crate::device::{CodingFormat, DecodePoll, DecoderDevice, DeviceBackend, FormatChange, PutStatus};
use crate::error::{PipelineError, Result, StageStatus, code};
use crate::frame::{FrameInfo, MemoryDomain, SideData};
use crate::item::{OutputItem, Payload};
use crate::pool::{SurfaceHandle, SurfacePool};

use super::{FrameRequirement, PipelineStage, StageKind, StageQueue};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DecodeState {
    Idle,
    Feeding,
    Draining,
    Eos,
}

/// Source timestamps seen at feed time, handed back in ascending order.
#[derive(Debug, Default)]
struct PtsQueue {
    sorted: Vec<i64>,
    first: Option<i64>,
}

impl PtsQueue {
    fn push(&mut self, pts: i64) {
        self.first.get_or_insert(pts);
        let at = self.sorted.partition_point(|p| *p <= pts);
        self.sorted.insert(at, pts);
    }

    fn pop(&mut self) -> Option<i64> {
        if self.sorted.is_empty() {
            return self.first;
        }
        Some(self.sorted.remove(0))
    }
}

enum Polled {
    Frame,
    Reconfigured,
    Eos,
    Empty,
    Timeout,
}

pub struct DecodeStage {
    device: Box<dyn DecoderDevice>,
    pool: SurfacePool,
    allocator: Arc<dyn SurfaceAllocator>,
    negotiated_count: usize,
    hint: FrameInfo,
    state: DecodeState,
    queue: StageQueue,
    retry_limit: u32,
    poll_interval: Duration,
    pts_queue: Option<PtsQueue>,
    side_data: Vec<SideData>,
    next_frame_id: u64,
    abort_requested: bool,
    format_changes: u32,
}

impl DecodeStage {
    pub fn new(
        backend: &dyn DeviceBackend,
        format: CodingFormat,
        hint: FrameInfo,
        allocator: Arc<dyn SurfaceAllocator>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let device = backend.init_decoder(format, &hint)?;
        log::info!("decoder {} created on {} for {}", format, backend.name(), hint);
        Self::with_device(device, hint, allocator, config)
    }

    pub fn with_device(
        mut device: Box<dyn DecoderDevice>,
        hint: FrameInfo,
        allocator: Arc<dyn SurfaceAllocator>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let pool = SurfacePool::new("decode", config.pool_options());
        device.attach_buffer_group(pool.clone())?;
        let pts_from_input = config
            .pts_from_input
            .unwrap_or(!device.coding_format().hw_pts_reliable());
        if pts_from_input {
            log::info!("decoder {}: using source timestamps", device.coding_format());
        }
        Ok(Self {
            device,
            pool,
            allocator,
            negotiated_count: 0,
            hint,
            state: DecodeState::Idle,
            queue: StageQueue::new(config.output_depth),
            retry_limit: config.decode_retry_limit,
            poll_interval: config.poll_interval(),
            pts_queue: pts_from_input.then(PtsQueue::default),
            side_data: Vec::new(),
            next_frame_id: 0,
            abort_requested: false,
            format_changes: 0,
        })
    }

    pub fn state(&self) -> DecodeState {
        self.state
    }

    pub fn format_changes(&self) -> u32 {
        self.format_changes
    }

    fn reconfigure(&mut self, change: FormatChange) -> Result<()> {
        let count = change.buffer_count.max(self.negotiated_count).max(1);
        log::info!(
            "decoder format change: {} x{} (pool {} had {} entries)",
            change.info,
            count,
            self.pool.name(),
            self.pool.len()
        );
        self.pool.retire_all();
        let surfaces = self.allocator.allocate(&change.info, count)?;
        self.pool.extend(surfaces);
        self.device.ack_format_change()?;
        self.format_changes += 1;
        Ok(())
    }

    fn enqueue(&mut self, handle: SurfaceHandle, pts: Option<i64>) -> Result<()> {
        {
            let mut surface = handle.write()?;
            surface.input_frame_id = self.next_frame_id;
            let pts = match self.pts_queue.as_mut() {
                Some(queue) => queue.pop().or(pts),
                None => pts.or(surface.pts),
            };
            surface.pts = pts;
            if let Some(pts) = pts {
                let (matched, rest): (Vec<_>, Vec<_>) =
                    self.side_data.drain(..).partition(|sd| sd.pts == pts);
                surface.side_data.extend(matched);
                self.side_data = rest;
                self.side_data.retain(|sd| sd.pts > pts);
            }
        }
        self.next_frame_id += 1;
        self.queue.push(OutputItem::surface(handle));
        Ok(())
    }

    fn poll_once(&mut self) -> Result<Polled> {
        match self.device.get_frame()? {
            DecodePoll::Timeout => Ok(Polled::Timeout),
            DecodePoll::NoFrame => Ok(Polled::Empty),
            DecodePoll::FormatChange(change) => {
                self.reconfigure(change)?;
                Ok(Polled::Reconfigured)
            }
            DecodePoll::DiscardedFrame { code } => {
                log::error!("decoder discarded a frame (code {})", code);
                Err(PipelineError::Unknown { code })
            }
            DecodePoll::Frame(frame) => {
                let has_surface = frame.surface.is_some();
                if let Some(handle) = frame.surface {
                    self.enqueue(handle, frame.pts)?;
                }
                if frame.eos && self.state == DecodeState::Draining {
                    log::debug!("decoder reached end of stream after {} frames", self.next_frame_id);
                    self.state = DecodeState::Eos;
                    return Ok(Polled::Eos);
                }
                if frame.eos {
                    log::warn!(
                        "decoder flagged end of stream before the end marker was sent, ignoring"
                    );
                }
                Ok(if has_surface { Polled::Frame } else { Polled::Empty })
            }
        }
    }

    fn wait(&self, retries: &mut u32) -> Result<()> {
        *retries += 1;
        if *retries > self.retry_limit {
            log::error!("decoder not ready after {} polls", self.retry_limit);
            return Err(PipelineError::Unknown {
                code: code::TIMEOUT,
            });
        }
        std::thread::sleep(self.poll_interval);
        Ok(())
    }

    fn feed(&mut self, data: &[u8], pts: Option<i64>, eos: bool) -> Result<()> {
        let mut retries = 0;
        loop {
            match self.device.put_packet(data, pts, eos)? {
                PutStatus::Accepted => return Ok(()),
                PutStatus::BufferFull => {
                    // make room by taking finished frames off the device
                    if let Polled::Eos = self.poll_once()? {
                        return Ok(());
                    }
                    self.wait(&mut retries)?;
                }
            }
        }
    }

    fn drain_device(&mut self) -> Result<StageStatus> {
        let mut produced = false;
        let mut retries = 0;
        loop {
            match self.poll_once()? {
                // hand frames on before the device runs out of surfaces
                Polled::Frame if self.queue.has_ready() => {
                    return Ok(StageStatus::NeedMoreOutputSpace);
                }
                Polled::Frame => produced = true,
                Polled::Reconfigured => {}
                Polled::Eos => return Ok(StageStatus::EndOfStream),
                Polled::Timeout => self.wait(&mut retries)?,
                Polled::Empty if self.state == DecodeState::Draining => self.wait(&mut retries)?,
                Polled::Empty => break,
            }
        }
        Ok(if produced {
            StageStatus::Accepted
        } else {
            StageStatus::NeedMoreInput
        })
    }
}

impl PipelineStage for DecodeStage {
    fn name(&self) -> &str {
        "decode"
    }

    fn kind(&self) -> StageKind {
        StageKind::Decode
    }

    fn required_output(&self) -> Option<FrameRequirement> {
        Some(FrameRequirement {
            info: self.hint,
            count: self.device.min_buffers(),
            domain: MemoryDomain::Native,
        })
    }

    fn attach_output_pool(&mut self, pool: SurfacePool) -> Result<()> {
        self.negotiated_count = pool.len();
        self.device.attach_buffer_group(pool.clone())?;
        self.pool = pool;
        Ok(())
    }

    fn pools(&self) -> Vec<SurfacePool> {
        vec![self.pool.clone()]
    }

    fn queue(&self) -> &StageQueue {
        &self.queue
    }

    fn queue_mut(&mut self) -> &mut StageQueue {
        &mut self.queue
    }

    fn send_frame(&mut self, item: Option<OutputItem>) -> Result<StageStatus> {
        if self.state == DecodeState::Eos {
            return Ok(StageStatus::EndOfStream);
        }
        let (data, pts, eos) = match item {
            _ if self.abort_requested => (Bytes::new(), None, true),
            None => (Bytes::new(), None, true),
            Some(item) => match item.into_parts() {
                (Payload::Bitstream(packet), _, _) => {
                    self.side_data.extend(packet.side_data);
                    (packet.data, packet.pts, false)
                }
                (Payload::Surface(_), _, _) => {
                    return Err(PipelineError::InvalidSurface(
                        "decoder expects a bitstream".to_string(),
                    ));
                }
            },
        };
        if eos {
            if self.state == DecodeState::Draining {
                // end marker already sent, keep collecting what is left
                return self.drain_device();
            }
            log::debug!("decoder draining");
            self.state = DecodeState::Draining;
        } else {
            self.state = DecodeState::Feeding;
            if let (Some(queue), Some(pts)) = (self.pts_queue.as_mut(), pts) {
                queue.push(pts);
            }
        }
        self.feed(&data, pts, eos)?;
        if self.state == DecodeState::Eos {
            return Ok(StageStatus::EndOfStream);
        }
        self.drain_device()
    }

    fn abort(&mut self) -> bool {
        self.abort_requested = true;
        true
    }
}

#[cfg(test)]
#[path = "decode_test.rs"]
mod decode_test;

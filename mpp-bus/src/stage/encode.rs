//! Hardware encode stage.
//!
//! Takes one frame per `send_frame`, converts it to native memory when it
//! lives elsewhere, submits it and collects whatever packets the encoder has
//! ready. The terminator is an explicit end-of-stream descriptor.

use std::sync::Arc;
use std::time::Duration;

use crate::alloc::SurfaceAllocator;
use crate::config::PipelineConfig;
use crate::device::{
    CodingFormat, DeviceBackend, EncodeFrame, EncodePoll, EncoderDevice, InputPrep, PutStatus,
};
use crate::error::{PipelineError, Result, StageStatus};
use crate::frame::{FrameInfo, MemoryDomain};
use crate::item::{Fence, OutputItem, Payload};
use crate::packet::Bitstream;
use crate::pool::{PoolOptions, SurfaceHandle, SurfacePool};
use crate::timestamp::TimestampRegistry;

use super::{FrameRequirement, PipelineStage, StageKind, StageQueue};

/// Surfaces kept for copies into native memory.
const CONVERT_POOL_SIZE: usize = 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncodeState {
    Idle,
    Encoding,
    Draining,
    Eos,
}

enum Polled {
    Packet,
    Eos,
    Empty,
    Timeout,
}

pub struct EncodeStage {
    device: Box<dyn EncoderDevice>,
    allocator: Arc<dyn SurfaceAllocator>,
    pool_options: PoolOptions,
    convert_pool: Option<SurfacePool>,
    state: EncodeState,
    queue: StageQueue,
    retry_limit: u32,
    poll_interval: Duration,
    registry: TimestampRegistry,
    gop_length: u32,
    frames_in: u64,
    packets_out: u64,
    last_pts: i64,
    reconfigurations: u32,
}

impl EncodeStage {
    pub fn new(
        backend: &dyn DeviceBackend,
        format: CodingFormat,
        prep: InputPrep,
        allocator: Arc<dyn SurfaceAllocator>,
        config: &PipelineConfig,
    ) -> Result<Self> {
        let device = backend.init_encoder(format, prep)?;
        log::info!(
            "encoder {} created on {} for {}",
            format,
            backend.name(),
            prep.frame_info()
        );
        Ok(Self::with_device(device, allocator, config))
    }

    pub fn with_device(
        device: Box<dyn EncoderDevice>,
        allocator: Arc<dyn SurfaceAllocator>,
        config: &PipelineConfig,
    ) -> Self {
        Self {
            device,
            allocator,
            pool_options: config.pool_options(),
            convert_pool: None,
            state: EncodeState::Idle,
            queue: StageQueue::new(config.output_depth),
            retry_limit: config.encode_retry_limit,
            poll_interval: config.poll_interval(),
            registry: TimestampRegistry::new(),
            gop_length: config.gop_length,
            frames_in: 0,
            packets_out: 0,
            last_pts: 0,
            reconfigurations: 0,
        }
    }

    pub fn state(&self) -> EncodeState {
        self.state
    }

    pub fn reconfigurations(&self) -> u32 {
        self.reconfigurations
    }

    pub fn packets_out(&self) -> u64 {
        self.packets_out
    }

    /// Copies `handle` into a native surface unless it already is one.
    fn to_native(&mut self, handle: SurfaceHandle) -> Result<SurfaceHandle> {
        if handle.domain() == MemoryDomain::Native {
            return Ok(handle);
        }
        let info = handle.info();
        let pool = self.convert_pool(&info)?;
        let native = pool.acquire_free()?;
        {
            let src = handle.read();
            let mut dst = native.write()?;
            dst.copy_pixels_from(&src);
            dst.copy_props_from(&src);
        }
        log::trace!("encoder copied {:?} frame into native memory", handle.domain());
        Ok(native)
    }

    fn convert_pool(&mut self, info: &FrameInfo) -> Result<SurfacePool> {
        if let Some(pool) = &self.convert_pool
            && pool.frame_info().is_some_and(|i| i.same_layout(info))
        {
            return Ok(pool.clone());
        }
        let options = self.pool_options;
        let pool = self
            .convert_pool
            .get_or_insert_with(|| SurfacePool::new("encode-convert", options));
        pool.retire_all();
        pool.extend(self.allocator.allocate(info, CONVERT_POOL_SIZE)?);
        log::debug!("encoder conversion pool sized for {}", info);
        Ok(pool.clone())
    }

    /// Updates the input preparation when the incoming geometry moved away
    /// from what the encoder was set up for.
    fn reconfigure_if_needed(&mut self, info: &FrameInfo) -> Result<()> {
        let current = self.device.input_prep();
        if current.matches(info) {
            return Ok(());
        }
        let prep = InputPrep::from_info(info);
        log::info!(
            "encoder input changed: {}x{} stride {} -> {}x{} stride {}",
            current.width,
            current.height,
            current.hor_stride,
            prep.width,
            prep.height,
            prep.hor_stride
        );
        self.device.configure_input(prep)?;
        self.reconfigurations += 1;
        Ok(())
    }

    fn enqueue(&mut self, mut packet: Bitstream) {
        match (packet.dts, packet.pts) {
            (None, _) => packet.dts = self.registry.next_dts(),
            (Some(_), Some(pts)) => self.registry.remove(pts),
            (Some(_), None) => {}
        }
        self.packets_out += 1;
        self.queue.push(OutputItem::bitstream(packet));
    }

    fn poll_once(&mut self) -> Result<Polled> {
        match self.device.get_packet()? {
            EncodePoll::Timeout => Ok(Polled::Timeout),
            EncodePoll::NoPacket => Ok(Polled::Empty),
            EncodePoll::Packet(packet) => {
                self.enqueue(packet);
                Ok(Polled::Packet)
            }
            EncodePoll::Eos => {
                log::debug!(
                    "encoder reached end of stream: {} frames, {} packets",
                    self.frames_in,
                    self.packets_out
                );
                self.state = EncodeState::Eos;
                Ok(Polled::Eos)
            }
        }
    }

    fn wait(&self, retries: &mut u32) -> Result<()> {
        *retries += 1;
        if *retries > self.retry_limit {
            log::error!("encoder not ready after {} polls", self.retry_limit);
            return Err(PipelineError::Timeout {
                retries: self.retry_limit,
            });
        }
        std::thread::sleep(self.poll_interval);
        Ok(())
    }

    fn submit(&mut self, frame: &EncodeFrame) -> Result<()> {
        let mut retries = 0;
        loop {
            match self.device.put_frame(frame)? {
                PutStatus::Accepted => return Ok(()),
                // a packet taken off the device frees a slot for the frame
                PutStatus::BufferFull => match self.poll_once()? {
                    Polled::Eos => return Ok(()),
                    Polled::Packet => {}
                    Polled::Empty | Polled::Timeout => self.wait(&mut retries)?,
                },
            }
        }
    }

    fn drain_device(&mut self) -> Result<StageStatus> {
        let mut produced = false;
        let mut retries = 0;
        loop {
            match self.poll_once()? {
                Polled::Packet => produced = true,
                Polled::Eos => return Ok(StageStatus::EndOfStream),
                Polled::Timeout => self.wait(&mut retries)?,
                Polled::Empty if self.state == EncodeState::Draining => self.wait(&mut retries)?,
                Polled::Empty => break,
            }
        }
        Ok(if produced {
            StageStatus::Accepted
        } else {
            StageStatus::NeedMoreInput
        })
    }

    fn encode(
        &mut self,
        handle: SurfaceHandle,
        pts: Option<i64>,
        duration: Option<i64>,
    ) -> Result<StageStatus> {
        let handle = self.to_native(handle)?;
        self.reconfigure_if_needed(&handle.info())?;
        let (pts, duration) = {
            let surface = handle.read();
            let pts = pts.or(surface.pts).unwrap_or(self.last_pts + 1);
            (pts, duration.unwrap_or(surface.duration))
        };
        let force_idr = self.gop_length > 0 && self.frames_in % u64::from(self.gop_length) == 0;
        let frame = EncodeFrame {
            surface: Some(handle),
            pts,
            duration,
            eos: false,
            force_idr,
        };
        self.registry.push(pts);
        self.last_pts = pts;
        self.frames_in += 1;
        self.state = EncodeState::Encoding;
        self.submit(&frame)?;
        drop(frame);
        if self.state == EncodeState::Eos {
            return Ok(StageStatus::EndOfStream);
        }
        self.drain_device()
    }
}

impl PipelineStage for EncodeStage {
    fn name(&self) -> &str {
        "encode"
    }

    fn kind(&self) -> StageKind {
        StageKind::Encode
    }

    fn required_input(&self) -> Option<FrameRequirement> {
        Some(FrameRequirement {
            info: self.device.input_prep().frame_info(),
            count: self.device.min_input_buffers(),
            domain: MemoryDomain::Native,
        })
    }

    fn pools(&self) -> Vec<SurfacePool> {
        self.convert_pool.iter().cloned().collect()
    }

    fn queue(&self) -> &StageQueue {
        &self.queue
    }

    fn queue_mut(&mut self) -> &mut StageQueue {
        &mut self.queue
    }

    fn send_frame(&mut self, item: Option<OutputItem>) -> Result<StageStatus> {
        if self.state == EncodeState::Eos {
            return Ok(StageStatus::EndOfStream);
        }
        let Some(item) = item else {
            if self.state != EncodeState::Draining {
                log::debug!("encoder draining");
            }
            self.state = EncodeState::Draining;
            self.submit(&EncodeFrame::eos(self.last_pts))?;
            if self.state == EncodeState::Eos {
                return Ok(StageStatus::EndOfStream);
            }
            return self.drain_device();
        };
        let (payload, fences, ts) = item.into_parts();
        fences.iter().for_each(Fence::wait);
        match payload {
            Payload::Bitstream(packet) => {
                // already encoded upstream
                self.queue.push(OutputItem::bitstream(packet));
                Ok(StageStatus::Accepted)
            }
            Payload::Surface(handle) => {
                self.encode(handle, ts.map(|t| t.pts), ts.map(|t| t.duration))
            }
        }
    }
}

#[cfg(test)]
#[path = "encode_test.rs"]
mod encode_test;

//! Software codec that implements the device contract for raw video.
//!
//! A "packet" is one frame's worth of bytes. The decoder copies it into a
//! surface of its buffer group, the encoder copies a surface back out. Both
//! keep a bounded queue so back-pressure paths run the same way they do on
//! hardware.

use std::collections::VecDeque;

use bytes::Bytes;

use super::{
    CodingFormat, DecodePoll, DecodedFrame, DecoderDevice, DeviceBackend, EncodeFrame,
    EncodePoll, EncoderDevice, FormatChange, InputPrep, PutStatus,
};
use crate::error::{PipelineError, Result};
use crate::frame::{FrameInfo, MemoryDomain};
use crate::packet::Bitstream;
use crate::pool::SurfacePool;

#[derive(Debug, Clone, Copy)]
pub struct LoopbackOptions {
    /// Packets or frames a session holds before reporting `BufferFull`.
    pub queue_depth: usize,
    /// Buffers requested in the decoder's format change.
    pub buffer_count: usize,
}

impl Default for LoopbackOptions {
    fn default() -> Self {
        Self {
            queue_depth: 4,
            buffer_count: 4,
        }
    }
}

#[derive(Default)]
pub struct LoopbackBackend {
    options: LoopbackOptions,
}

impl LoopbackBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_options(options: LoopbackOptions) -> Self {
        Self { options }
    }
}

impl DeviceBackend for LoopbackBackend {
    fn name(&self) -> &str {
        "loopback"
    }

    fn init_decoder(
        &self,
        format: CodingFormat,
        hint: &FrameInfo,
    ) -> Result<Box<dyn DecoderDevice>> {
        if format != CodingFormat::RawVideo {
            return Err(PipelineError::Unsupported(format!(
                "loopback decoder: {}",
                format
            )));
        }
        Ok(Box::new(LoopbackDecoder::new(*hint, self.options)))
    }

    fn init_encoder(&self, format: CodingFormat, prep: InputPrep) -> Result<Box<dyn EncoderDevice>> {
        if format != CodingFormat::RawVideo {
            return Err(PipelineError::Unsupported(format!(
                "loopback encoder: {}",
                format
            )));
        }
        Ok(Box::new(LoopbackEncoder::new(prep, self.options)))
    }
}

struct PendingPacket {
    data: Bytes,
    pts: Option<i64>,
    eos: bool,
}

pub struct LoopbackDecoder {
    info: FrameInfo,
    options: LoopbackOptions,
    pool: Option<SurfacePool>,
    announced: bool,
    acked: bool,
    pending: VecDeque<PendingPacket>,
    eos_returned: bool,
}

impl LoopbackDecoder {
    pub fn new(info: FrameInfo, options: LoopbackOptions) -> Self {
        Self {
            info,
            options,
            pool: None,
            announced: false,
            acked: false,
            pending: VecDeque::new(),
            eos_returned: false,
        }
    }
}

impl DecoderDevice for LoopbackDecoder {
    fn coding_format(&self) -> CodingFormat {
        CodingFormat::RawVideo
    }

    fn min_buffers(&self) -> usize {
        self.options.buffer_count
    }

    fn attach_buffer_group(&mut self, pool: SurfacePool) -> Result<()> {
        self.pool = Some(pool);
        Ok(())
    }

    fn put_packet(&mut self, data: &[u8], pts: Option<i64>, eos: bool) -> Result<PutStatus> {
        if self.pending.len() >= self.options.queue_depth {
            return Ok(PutStatus::BufferFull);
        }
        self.pending.push_back(PendingPacket {
            data: Bytes::copy_from_slice(data),
            pts,
            eos,
        });
        Ok(PutStatus::Accepted)
    }

    fn get_frame(&mut self) -> Result<DecodePoll> {
        if self.eos_returned {
            return Ok(DecodePoll::NoFrame);
        }
        let Some(front) = self.pending.front() else {
            return Ok(DecodePoll::NoFrame);
        };
        if !front.data.is_empty() && !self.announced {
            self.announced = true;
            return Ok(DecodePoll::FormatChange(FormatChange {
                info: self.info,
                buffer_count: self.options.buffer_count,
            }));
        }
        if self.announced && !self.acked {
            return Err(PipelineError::InvalidState(
                "format change not acknowledged".to_string(),
            ));
        }
        if front.data.is_empty() {
            let packet = self.pending.pop_front();
            let eos = packet.as_ref().is_some_and(|p| p.eos);
            if !eos {
                // empty non-terminal packets produce nothing
                return Ok(DecodePoll::NoFrame);
            }
            self.eos_returned = true;
            return Ok(DecodePoll::Frame(DecodedFrame {
                surface: None,
                pts: None,
                eos: true,
            }));
        }

        let pool = self
            .pool
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidState("no buffer group attached".to_string()))?;
        let Some(handle) = pool.try_acquire_free() else {
            return Ok(DecodePoll::Timeout);
        };
        let Some(packet) = self.pending.pop_front() else {
            return Ok(DecodePoll::NoFrame);
        };
        {
            let mut surface = handle.write()?;
            let dst = surface.data_mut();
            let n = dst.len().min(packet.data.len());
            dst[..n].copy_from_slice(&packet.data[..n]);
            surface.pts = packet.pts;
        }
        if packet.eos {
            self.eos_returned = true;
        }
        Ok(DecodePoll::Frame(DecodedFrame {
            surface: Some(handle),
            pts: packet.pts,
            eos: packet.eos,
        }))
    }

    fn ack_format_change(&mut self) -> Result<()> {
        if !self.announced {
            return Err(PipelineError::InvalidState(
                "no format change pending".to_string(),
            ));
        }
        self.acked = true;
        Ok(())
    }
}

enum Pending {
    Packet(Bitstream),
    Eos,
}

pub struct LoopbackEncoder {
    prep: InputPrep,
    options: LoopbackOptions,
    pending: VecDeque<Pending>,
    frames: u64,
    eos_returned: bool,
}

impl LoopbackEncoder {
    pub fn new(prep: InputPrep, options: LoopbackOptions) -> Self {
        Self {
            prep,
            options,
            pending: VecDeque::new(),
            frames: 0,
            eos_returned: false,
        }
    }
}

impl EncoderDevice for LoopbackEncoder {
    fn coding_format(&self) -> CodingFormat {
        CodingFormat::RawVideo
    }

    fn input_prep(&self) -> InputPrep {
        self.prep
    }

    fn configure_input(&mut self, prep: InputPrep) -> Result<()> {
        self.prep = prep;
        Ok(())
    }

    fn put_frame(&mut self, frame: &EncodeFrame) -> Result<PutStatus> {
        if self.pending.len() >= self.options.queue_depth {
            return Ok(PutStatus::BufferFull);
        }
        if frame.eos && frame.surface.is_none() {
            self.pending.push_back(Pending::Eos);
            return Ok(PutStatus::Accepted);
        }
        let handle = frame
            .surface
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidSurface("frame without surface".to_string()))?;
        let surface = handle.read();
        if surface.domain() != MemoryDomain::Native {
            return Err(PipelineError::InvalidSurface(format!(
                "loopback encoder needs native memory, got {:?}",
                surface.domain()
            )));
        }
        if !self.prep.matches(surface.info()) {
            return Err(PipelineError::InvalidSurface(format!(
                "input prep {}x{} stride {} does not match {}",
                self.prep.width,
                self.prep.height,
                self.prep.hor_stride,
                surface.info()
            )));
        }
        let mut packet = Bitstream::new(surface.data().to_vec(), Some(frame.pts));
        packet.duration = frame.duration;
        packet.is_key = frame.force_idr || self.frames == 0;
        packet.avg_qp = Some(0.0);
        packet.side_data = surface.side_data.clone();
        self.frames += 1;
        self.pending.push_back(Pending::Packet(packet));
        if frame.eos {
            self.pending.push_back(Pending::Eos);
        }
        Ok(PutStatus::Accepted)
    }

    fn get_packet(&mut self) -> Result<EncodePoll> {
        if self.eos_returned {
            return Ok(EncodePoll::Eos);
        }
        match self.pending.pop_front() {
            Some(Pending::Packet(packet)) => Ok(EncodePoll::Packet(packet)),
            Some(Pending::Eos) => {
                self.eos_returned = true;
                Ok(EncodePoll::Eos)
            }
            None => Ok(EncodePoll::NoPacket),
        }
    }
}

#[cfg(test)]
#[path = "loopback_test.rs"]
mod loopback_test;

//! Collaborators at the edges of the pipeline: where packets come from,
//! where packets and frames go, and the optional timecode and audio side
//! channels. File-backed implementations are used by the runner and tests.

use std::collections::VecDeque;
use std::io::{ErrorKind, Read, Write};
use std::sync::{Arc, Mutex};

use bytes::Bytes;

use crate::error::{PipelineError, Result};
use crate::frame::{FrameInfo, Surface};
use crate::packet::Bitstream;
use crate::timestamp::{Rational, rescale};

pub trait Reader: Send {
    fn frame_info(&self) -> FrameInfo;

    /// Time base of every timestamp this reader returns.
    fn time_base(&self) -> Rational;

    fn frame_rate(&self) -> Rational;

    /// Next compressed packet, `None` at end of stream.
    fn get_next_bitstream(&mut self) -> Result<Option<Bitstream>>;

    /// Fills `surface` with the next raw frame. Returns `false` at end of
    /// stream.
    fn load_next_frame(&mut self, surface: &mut Surface) -> Result<bool>;

    /// Packets or frames handed out so far.
    fn frames_read(&self) -> u64;

    /// Whether the container timestamps can be trusted.
    fn pts_reliable(&self) -> bool {
        true
    }
}

pub trait Writer: Send {
    fn write_next_packet(&mut self, packet: &Bitstream) -> Result<()>;

    fn write_next_frame(&mut self, surface: &Surface) -> Result<()>;

    fn write_audio_packet(&mut self, packet: &Bitstream) -> Result<()> {
        log::trace!("writer ignores audio packet {}", packet);
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}

/// Writer shared between the driver and the audio stage.
pub type SharedWriter = Arc<Mutex<dyn Writer>>;

pub fn shared_writer<W: Writer + 'static>(writer: W) -> SharedWriter {
    Arc::new(Mutex::new(writer))
}

pub trait TimecodeWriter: Send {
    fn write_timecode(&mut self, pts: i64, time_base: Rational) -> Result<()>;

    fn flush(&mut self) -> Result<()> {
        Ok(())
    }
}

pub trait AudioSource: Send {
    fn time_base(&self) -> Rational;

    /// Timestamp of the next packet without consuming it.
    fn peek_pts(&mut self) -> Result<Option<i64>>;

    fn next_packet(&mut self) -> Result<Option<Bitstream>>;
}

/// How a [`RawFileReader`] splits its input.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawLayout {
    /// Back to back frames of `FrameInfo::frame_size` bytes, timestamps
    /// counted in frames.
    Frames,
    /// Records of `u32` length, `i64` pts (little endian) and payload.
    Packets,
}

pub struct RawFileReader<R> {
    inner: R,
    info: FrameInfo,
    frame_rate: Rational,
    time_base: Rational,
    layout: RawLayout,
    count: u64,
}

impl<R: Read + Send> RawFileReader<R> {
    pub fn frames(inner: R, info: FrameInfo, frame_rate: Rational) -> Self {
        Self {
            inner,
            info,
            frame_rate,
            time_base: frame_rate.invert(),
            layout: RawLayout::Frames,
            count: 0,
        }
    }

    pub fn packets(inner: R, info: FrameInfo, frame_rate: Rational, time_base: Rational) -> Self {
        Self {
            inner,
            info,
            frame_rate,
            time_base,
            layout: RawLayout::Packets,
            count: 0,
        }
    }

    pub fn layout(&self) -> RawLayout {
        self.layout
    }

    /// Reads exactly `buf.len()` bytes. A clean end before the first byte
    /// is `Ok(false)`, a truncated record is logged and treated the same.
    fn read_full(&mut self, buf: &mut [u8]) -> Result<bool> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.inner.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e.into()),
            }
        }
        if filled == buf.len() {
            return Ok(true);
        }
        if filled > 0 {
            log::warn!(
                "raw input truncated: {} of {} bytes after {} records",
                filled,
                buf.len(),
                self.count
            );
        }
        Ok(false)
    }

    fn read_record(&mut self) -> Result<Option<(Vec<u8>, i64)>> {
        match self.layout {
            RawLayout::Frames => {
                let mut data = vec![0u8; self.info.frame_size()];
                if !self.read_full(&mut data)? {
                    return Ok(None);
                }
                Ok(Some((data, self.count as i64)))
            }
            RawLayout::Packets => {
                let mut header = [0u8; 12];
                if !self.read_full(&mut header)? {
                    return Ok(None);
                }
                let mut len = [0u8; 4];
                len.copy_from_slice(&header[..4]);
                let mut pts = [0u8; 8];
                pts.copy_from_slice(&header[4..]);
                let mut data = vec![0u8; u32::from_le_bytes(len) as usize];
                if !self.read_full(&mut data)? {
                    return Ok(None);
                }
                Ok(Some((data, i64::from_le_bytes(pts))))
            }
        }
    }
}

impl<R: Read + Send> Reader for RawFileReader<R> {
    fn frame_info(&self) -> FrameInfo {
        self.info
    }

    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn frame_rate(&self) -> Rational {
        self.frame_rate
    }

    fn get_next_bitstream(&mut self) -> Result<Option<Bitstream>> {
        let Some((data, pts)) = self.read_record()? else {
            return Ok(None);
        };
        self.count += 1;
        let mut packet = Bitstream::new(data, Some(pts));
        packet.dts = Some(pts);
        Ok(Some(packet))
    }

    fn load_next_frame(&mut self, surface: &mut Surface) -> Result<bool> {
        let Some((data, pts)) = self.read_record()? else {
            return Ok(false);
        };
        let src_pitch = self.info.pitch as usize;
        let dst_pitch = surface.info().pitch as usize;
        if src_pitch == 0 || dst_pitch == 0 {
            return Err(PipelineError::InvalidSurface(format!(
                "zero pitch loading {}",
                surface.info()
            )));
        }
        let row = src_pitch.min(dst_pitch);
        let dst = surface.data_mut();
        let rows = (data.len() / src_pitch).min(dst.len() / dst_pitch);
        for r in 0..rows {
            dst[r * dst_pitch..r * dst_pitch + row]
                .copy_from_slice(&data[r * src_pitch..r * src_pitch + row]);
        }
        surface.pts = Some(pts);
        surface.duration = rescale(1, self.frame_rate.invert(), self.time_base).max(1);
        self.count += 1;
        Ok(true)
    }

    fn frames_read(&self) -> u64 {
        self.count
    }
}

/// Writes video payload to one sink and, optionally, audio to another.
pub struct FileWriter<W> {
    video: W,
    audio: Option<W>,
    packets: u64,
    frames: u64,
    bytes: u64,
}

impl<W: Write + Send> FileWriter<W> {
    pub fn new(video: W) -> Self {
        Self {
            video,
            audio: None,
            packets: 0,
            frames: 0,
            bytes: 0,
        }
    }

    pub fn with_audio(mut self, audio: W) -> Self {
        self.audio = Some(audio);
        self
    }

    pub fn packets_written(&self) -> u64 {
        self.packets
    }

    pub fn frames_written(&self) -> u64 {
        self.frames
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }

    pub fn into_inner(self) -> W {
        self.video
    }
}

impl<W: Write + Send> Writer for FileWriter<W> {
    fn write_next_packet(&mut self, packet: &Bitstream) -> Result<()> {
        self.video.write_all(&packet.data)?;
        self.packets += 1;
        self.bytes += packet.size() as u64;
        Ok(())
    }

    fn write_next_frame(&mut self, surface: &Surface) -> Result<()> {
        let size = surface.info().frame_size().min(surface.data().len());
        self.video.write_all(&surface.data()[..size])?;
        self.frames += 1;
        self.bytes += size as u64;
        Ok(())
    }

    fn write_audio_packet(&mut self, packet: &Bitstream) -> Result<()> {
        match self.audio.as_mut() {
            Some(audio) => {
                audio.write_all(&packet.data)?;
                self.bytes += packet.size() as u64;
            }
            None => log::trace!("no audio sink, dropping {}", packet),
        }
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        self.video.flush()?;
        if let Some(audio) = self.audio.as_mut() {
            audio.flush()?;
        }
        log::info!(
            "writer closed: {} packets, {} frames, {} bytes",
            self.packets,
            self.frames,
            self.bytes
        );
        Ok(())
    }
}

/// Matroska style `timecode format v2` file, one millisecond timestamp
/// per line.
pub struct TimecodeFile<W> {
    inner: W,
    header_written: bool,
}

impl<W: Write + Send> TimecodeFile<W> {
    pub fn new(inner: W) -> Self {
        Self {
            inner,
            header_written: false,
        }
    }

    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write + Send> TimecodeWriter for TimecodeFile<W> {
    fn write_timecode(&mut self, pts: i64, time_base: Rational) -> Result<()> {
        if !self.header_written {
            writeln!(self.inner, "# timecode format v2")?;
            self.header_written = true;
        }
        let ms = pts as f64 * time_base.as_f64() * 1000.0;
        writeln!(self.inner, "{:.6}", ms)?;
        Ok(())
    }

    fn flush(&mut self) -> Result<()> {
        self.inner.flush()?;
        Ok(())
    }
}

/// Audio packets held in memory, already ordered by timestamp.
pub struct QueuedAudio {
    time_base: Rational,
    packets: VecDeque<Bitstream>,
}

impl QueuedAudio {
    pub fn new(time_base: Rational, packets: impl IntoIterator<Item = Bitstream>) -> Self {
        Self {
            time_base,
            packets: packets.into_iter().collect(),
        }
    }

    /// Splits a raw PCM buffer into packets of `samples_per_packet` frames.
    pub fn from_pcm(
        pcm: Bytes,
        sample_rate: u32,
        bytes_per_sample_frame: usize,
        samples_per_packet: usize,
    ) -> Self {
        let chunk = (bytes_per_sample_frame * samples_per_packet).max(1);
        let time_base = Rational::new(1, sample_rate as i64);
        let mut packets = VecDeque::new();
        let mut offset = 0;
        while offset < pcm.len() {
            let end = (offset + chunk).min(pcm.len());
            let pts = (offset / bytes_per_sample_frame.max(1)) as i64;
            let samples = ((end - offset) / bytes_per_sample_frame.max(1)) as i64;
            packets.push_back(Bitstream::audio(pcm.slice(offset..end), pts, samples));
            offset = end;
        }
        Self { time_base, packets }
    }
}

impl AudioSource for QueuedAudio {
    fn time_base(&self) -> Rational {
        self.time_base
    }

    fn peek_pts(&mut self) -> Result<Option<i64>> {
        Ok(self.packets.front().and_then(|p| p.pts))
    }

    fn next_packet(&mut self) -> Result<Option<Bitstream>> {
        Ok(self.packets.pop_front())
    }
}

#[cfg(test)]
#[path = "io_test.rs"]
mod io_test;

use std::sync::{Arc, Mutex};

use super::*;
use crate::frame::{FrameInfo, PixelFormat, Storage, Surface};
use crate::io::{QueuedAudio, Writer};
use crate::item::TimestampOverride;
use crate::packet::Bitstream;
use crate::pool::SurfaceHandle;

#[derive(Default)]
struct Recorded {
    audio: Vec<Option<i64>>,
}

struct RecordingWriter(Arc<Mutex<Recorded>>);

impl Writer for RecordingWriter {
    fn write_next_packet(&mut self, _: &Bitstream) -> Result<()> {
        Ok(())
    }

    fn write_next_frame(&mut self, _: &Surface) -> Result<()> {
        Ok(())
    }

    fn write_audio_packet(&mut self, packet: &Bitstream) -> Result<()> {
        self.0.lock().unwrap().audio.push(packet.pts);
        Ok(())
    }
}

fn video(pts: i64) -> OutputItem {
    let info = FrameInfo::new(2, 2, PixelFormat::Nv12);
    let surface = Surface::new(info, Storage::host(info.frame_size()));
    OutputItem::surface(SurfaceHandle::detached(surface))
        .with_override(TimestampOverride { pts, duration: 40 })
}

fn stage() -> (AudioStage, Arc<Mutex<Recorded>>) {
    // millisecond time base, one packet every 20 ms
    let packets = (0..10).map(|i| Bitstream::audio(vec![0u8; 4], i * 20, 20));
    let source = QueuedAudio::new(Rational::MILLISECONDS, packets);
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let writer: SharedWriter = Arc::new(Mutex::new(RecordingWriter(recorded.clone())));
    let stage = AudioStage::new(Box::new(source), writer, Rational::new(1, 1000), 0);
    (stage, recorded)
}

#[test]
fn test_writes_audio_due_by_video() -> anyhow::Result<()> {
    let (mut stage, recorded) = stage();
    assert!(stage.is_pass_through());

    stage.send_frame(Some(video(0)))?;
    assert_eq!(recorded.lock().unwrap().audio, vec![Some(0)]);
    stage.send_frame(Some(video(40)))?;
    assert_eq!(recorded.lock().unwrap().audio, vec![Some(0), Some(20), Some(40)]);

    let forwarded = stage.get_output(false);
    assert_eq!(
        forwarded.iter().map(|i| i.timestamp()).collect::<Vec<_>>(),
        vec![Some(0), Some(40)]
    );
    Ok(())
}

#[test]
fn test_flush_writes_the_rest() -> anyhow::Result<()> {
    let (mut stage, recorded) = stage();
    stage.send_frame(Some(video(60)))?;
    assert_eq!(stage.packets_written(), 4);
    assert_eq!(stage.send_frame(None)?, StageStatus::EndOfStream);
    assert_eq!(stage.packets_written(), 10);
    assert_eq!(recorded.lock().unwrap().audio.len(), 10);
    Ok(())
}

#[test]
fn test_rescales_audio_time_base() -> anyhow::Result<()> {
    let packets = (0..4).map(|i| Bitstream::audio(vec![0u8; 4], i * 1024, 1024));
    let source = QueuedAudio::new(Rational::new(1, 48_000), packets);
    let recorded = Arc::new(Mutex::new(Recorded::default()));
    let writer: SharedWriter = Arc::new(Mutex::new(RecordingWriter(recorded.clone())));
    let mut stage = AudioStage::new(Box::new(source), writer, Rational::MPEG, 0);

    // 1024 samples at 48 kHz is 1920 ticks of 90 kHz
    stage.send_frame(Some(video(1920)))?;
    assert_eq!(stage.packets_written(), 2);
    stage.send_frame(Some(video(3839)))?;
    assert_eq!(stage.packets_written(), 2);
    Ok(())
}

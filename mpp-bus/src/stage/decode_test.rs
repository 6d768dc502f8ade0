use std::collections::VecDeque;
use std::sync::Mutex;

use super::*;
use crate::alloc::MemoryAllocator;
use crate::device::DecodedFrame;
use crate::frame::{PixelFormat, SideDataKind};
use crate::packet::Bitstream;

// ==================== scripted decoder ====================

enum Step {
    Timeout,
    NoFrame,
    Change(FrameInfo, usize),
    Frame(Option<i64>),
    EosFrame,
    Discard(i32),
}

#[derive(Default)]
struct Log {
    puts: Vec<(usize, Option<i64>, bool)>,
    gets: usize,
    acks: usize,
}

struct Scripted {
    steps: VecDeque<Step>,
    log: Arc<Mutex<Log>>,
    pool: Option<SurfacePool>,
    format: CodingFormat,
}

impl Scripted {
    fn new(steps: Vec<Step>) -> (Box<dyn DecoderDevice>, Arc<Mutex<Log>>) {
        let log = Arc::new(Mutex::new(Log::default()));
        let device = Scripted {
            steps: steps.into(),
            log: log.clone(),
            pool: None,
            format: CodingFormat::H264,
        };
        (Box::new(device), log)
    }
}

impl DecoderDevice for Scripted {
    fn coding_format(&self) -> CodingFormat {
        self.format
    }

    fn attach_buffer_group(&mut self, pool: SurfacePool) -> Result<()> {
        self.pool = Some(pool);
        Ok(())
    }

    fn put_packet(&mut self, data: &[u8], pts: Option<i64>, eos: bool) -> Result<PutStatus> {
        self.log.lock().unwrap().puts.push((data.len(), pts, eos));
        Ok(PutStatus::Accepted)
    }

    fn get_frame(&mut self) -> Result<DecodePoll> {
        self.log.lock().unwrap().gets += 1;
        let poll = match self.steps.pop_front() {
            None | Some(Step::NoFrame) => DecodePoll::NoFrame,
            Some(Step::Timeout) => DecodePoll::Timeout,
            Some(Step::Change(info, buffer_count)) => {
                DecodePoll::FormatChange(FormatChange { info, buffer_count })
            }
            Some(Step::Frame(pts)) => {
                let pool = self.pool.as_ref().expect("buffer group");
                DecodePoll::Frame(DecodedFrame {
                    surface: Some(pool.try_acquire_free().expect("free surface")),
                    pts,
                    eos: false,
                })
            }
            Some(Step::EosFrame) => DecodePoll::Frame(DecodedFrame {
                surface: None,
                pts: None,
                eos: true,
            }),
            Some(Step::Discard(code)) => DecodePoll::DiscardedFrame { code },
        };
        Ok(poll)
    }

    fn ack_format_change(&mut self) -> Result<()> {
        self.log.lock().unwrap().acks += 1;
        Ok(())
    }
}

fn info() -> FrameInfo {
    FrameInfo::new(16, 8, PixelFormat::Nv12)
}

fn config() -> PipelineConfig {
    PipelineConfig::builder()
        .output_depth(0)
        .poll_interval_us(0)
        .retry_limits(5, 5)
        .build()
}

fn stage(steps: Vec<Step>, config: &PipelineConfig) -> (DecodeStage, Arc<Mutex<Log>>) {
    let (device, log) = Scripted::new(steps);
    let stage = DecodeStage::with_device(device, info(), Arc::new(MemoryAllocator::native()), config)
        .expect("decode stage");
    (stage, log)
}

fn packet(pts: i64) -> Option<OutputItem> {
    Some(OutputItem::bitstream(Bitstream::new(vec![0u8; 8], Some(pts))))
}

// ==================== tests ====================

#[test]
fn test_eos_then_no_more_hardware_calls() -> anyhow::Result<()> {
    let (mut dec, log) = stage(vec![Step::EosFrame], &config());
    assert_eq!(dec.send_frame(None)?, StageStatus::EndOfStream);
    assert_eq!(dec.state(), DecodeState::Eos);
    {
        let log = log.lock().unwrap();
        assert_eq!(log.puts, vec![(0, None, true)]);
        assert_eq!(log.gets, 1);
    }

    assert_eq!(dec.send_frame(None)?, StageStatus::EndOfStream);
    assert_eq!(dec.send_frame(packet(9))?, StageStatus::EndOfStream);
    let log = log.lock().unwrap();
    assert_eq!(log.puts.len(), 1);
    assert_eq!(log.gets, 1);
    Ok(())
}

#[test]
fn test_format_change_rebuilds_pool() -> anyhow::Result<()> {
    let bigger = FrameInfo::new(32, 16, PixelFormat::Nv12);
    let steps = vec![
        Step::Change(info(), 3),
        Step::Frame(Some(5)),
        Step::Change(bigger, 2),
        Step::Frame(Some(6)),
    ];
    let (mut dec, log) = stage(steps, &config());

    assert_eq!(dec.send_frame(packet(5))?, StageStatus::NeedMoreOutputSpace);
    let pool = dec.pools().remove(0);
    assert_eq!(pool.len(), 3);
    let first = dec.get_output(true);
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].timestamp(), Some(5));
    assert_eq!(first[0].as_surface().map(|h| h.read().input_frame_id), Some(0));

    // the old frame stays valid while the group is rebuilt
    assert_eq!(dec.send_frame(packet(6))?, StageStatus::NeedMoreOutputSpace);
    let second = dec.get_output(true);
    let handle = second[0].as_surface().expect("surface");
    assert_eq!(handle.info(), bigger);
    assert_eq!(handle.read().input_frame_id, 1);
    assert_eq!(first[0].as_surface().map(|h| h.info()), Some(info()));
    assert_eq!(dec.format_changes(), 2);
    assert_eq!(log.lock().unwrap().acks, 2);

    drop(first);
    drop(second);
    pool.compact();
    assert_eq!(pool.len(), 2);
    assert!(pool.is_all_free());
    Ok(())
}

#[test]
fn test_discarded_frame_is_fatal() {
    let (mut dec, _) = stage(vec![Step::Discard(-9)], &config());
    let err = dec.send_frame(packet(0)).expect_err("discard");
    assert!(matches!(err, PipelineError::Unknown { code: -9 }));
}

#[test]
fn test_timeouts_are_bounded() {
    let steps = (0..10).map(|_| Step::Timeout).collect();
    let (mut dec, log) = stage(steps, &config());
    let err = dec.send_frame(packet(0)).expect_err("timeout");
    assert!(matches!(
        err,
        PipelineError::Unknown {
            code: code::TIMEOUT
        }
    ));
    assert_eq!(log.lock().unwrap().gets, 6);
}

#[test]
fn test_source_timestamps_substitute_hardware_ones() -> anyhow::Result<()> {
    let config = PipelineConfig::builder()
        .output_depth(0)
        .poll_interval_us(0)
        .pts_from_input(true)
        .build();
    let steps = vec![
        Step::Change(info(), 4),
        Step::NoFrame,
        Step::NoFrame,
        Step::Frame(Some(999)),
        Step::Frame(None),
        Step::Frame(Some(0)),
        Step::NoFrame,
    ];
    let (mut dec, log) = stage(steps, &config);
    assert_eq!(dec.send_frame(packet(30))?, StageStatus::NeedMoreInput);
    assert_eq!(dec.send_frame(packet(10))?, StageStatus::NeedMoreInput);
    assert_eq!(dec.send_frame(packet(20))?, StageStatus::NeedMoreOutputSpace);
    let mut pts: Vec<Option<i64>> = dec.get_output(false).iter().map(|i| i.timestamp()).collect();
    for _ in 0..2 {
        assert_eq!(dec.send_frame(None)?, StageStatus::NeedMoreOutputSpace);
        pts.extend(dec.get_output(false).iter().map(|i| i.timestamp()));
    }
    assert_eq!(pts, vec![Some(10), Some(20), Some(30)]);
    // the end marker goes out once
    let log = log.lock().unwrap();
    assert_eq!(log.puts.iter().filter(|(_, _, eos)| *eos).count(), 1);
    Ok(())
}

#[test]
fn test_flush_releases_more_frames_than_the_pool_holds() -> anyhow::Result<()> {
    let mut steps = vec![Step::Change(info(), 2), Step::NoFrame];
    steps.extend((0..5).map(|i| Step::Frame(Some(i))));
    steps.push(Step::EosFrame);
    let (mut dec, log) = stage(steps, &config());
    assert_eq!(dec.send_frame(packet(0))?, StageStatus::NeedMoreInput);

    let mut written = Vec::new();
    loop {
        let status = dec.send_frame(None)?;
        // downstream consumes the frame and gives the surface back
        written.extend(dec.get_output(true).iter().map(|i| i.timestamp()));
        if status.is_eos() {
            break;
        }
        assert_eq!(status, StageStatus::NeedMoreOutputSpace);
    }
    assert_eq!(written, (0..5).map(Some).collect::<Vec<_>>());
    assert_eq!(dec.state(), DecodeState::Eos);
    assert!(dec.pools()[0].is_all_free());
    assert_eq!(log.lock().unwrap().puts.len(), 2);
    Ok(())
}

#[test]
fn test_end_flag_without_end_marker_keeps_decoding() -> anyhow::Result<()> {
    let steps = vec![
        Step::Change(info(), 2),
        Step::EosFrame,
        Step::Frame(Some(1)),
        Step::EosFrame,
    ];
    let (mut dec, _) = stage(steps, &config());
    assert_eq!(dec.send_frame(packet(0))?, StageStatus::NeedMoreInput);
    assert_eq!(dec.state(), DecodeState::Feeding);

    assert_eq!(dec.send_frame(packet(1))?, StageStatus::NeedMoreOutputSpace);
    assert_eq!(dec.get_output(false).len(), 1);
    assert_eq!(dec.send_frame(None)?, StageStatus::EndOfStream);
    Ok(())
}

#[test]
fn test_side_data_follows_matching_frame() -> anyhow::Result<()> {
    let steps = vec![Step::Change(info(), 2), Step::Frame(Some(7)), Step::NoFrame];
    let (mut dec, _) = stage(steps, &config());
    let mut bs = Bitstream::new(vec![1u8; 4], Some(7));
    bs.side_data.push(SideData {
        kind: SideDataKind::Hdr10Plus,
        pts: 7,
        payload: bytes::Bytes::from_static(b"hdr"),
    });
    dec.send_frame(Some(OutputItem::bitstream(bs)))?;
    let out = dec.get_output(false);
    let handle = out[0].as_surface().expect("surface");
    assert_eq!(handle.read().side_data.len(), 1);
    Ok(())
}

#[test]
fn test_abort_sends_end_marker() -> anyhow::Result<()> {
    let (mut dec, log) = stage(vec![Step::EosFrame], &config());
    assert!(dec.abort());
    assert_eq!(dec.send_frame(packet(3))?, StageStatus::EndOfStream);
    assert_eq!(log.lock().unwrap().puts, vec![(0, None, true)]);
    Ok(())
}

#[test]
fn test_rejects_surface_input() -> anyhow::Result<()> {
    let (mut dec, _) = stage(vec![], &config());
    let handle = SurfaceHandle::detached(crate::frame::Surface::new(
        info(),
        crate::frame::Storage::host(info().frame_size()),
    ));
    assert!(matches!(
        dec.send_frame(Some(OutputItem::surface(handle))),
        Err(PipelineError::InvalidSurface(_))
    ));
    Ok(())
}

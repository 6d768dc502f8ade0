use std::time::Duration;

use super::*;
use crate::frame::{MemoryDomain, PixelFormat, Storage};
use crate::pool::PoolOptions;

fn interlaced() -> FrameInfo {
    FrameInfo::new(4, 2, PixelFormat::Nv12).with_pic_struct(PicStruct::TopFieldFirst)
}

fn pool(name: &str, count: usize) -> SurfacePool {
    let surfaces = (0..count)
        .map(|i| {
            Surface::new(
                interlaced(),
                Storage::new(MemoryDomain::Native, i as u64, vec![0; interlaced().frame_size()]),
            )
        })
        .collect();
    SurfacePool::with_surfaces(name, PoolOptions::default(), surfaces)
}

fn frame(pool: &SurfacePool, pts: i64) -> anyhow::Result<SurfaceHandle> {
    timed_frame(pool, pts, 40)
}

fn timed_frame(pool: &SurfacePool, pts: i64, duration: i64) -> anyhow::Result<SurfaceHandle> {
    let handle = pool.acquire_free()?;
    {
        let mut s = handle.write()?;
        s.pts = Some(pts);
        s.duration = duration;
    }
    Ok(handle)
}

/// Processor that takes a while, like the real hardware call.
struct Slow(SoftField);

impl FieldProcessor for Slow {
    fn outputs_per_frame(&self) -> usize {
        self.0.outputs_per_frame()
    }

    fn process(&mut self, src: &Surface, dst: &mut Surface, index: usize) -> Result<()> {
        std::thread::sleep(Duration::from_millis(5));
        self.0.process(src, dst, index)
    }
}

struct Failing;

impl FieldProcessor for Failing {
    fn outputs_per_frame(&self) -> usize {
        1
    }

    fn process(&mut self, _: &Surface, _: &mut Surface, _: usize) -> Result<()> {
        Err(PipelineError::Device { code: -7 })
    }
}

#[test]
fn test_bob_doubles_frames_in_order() -> anyhow::Result<()> {
    let input = pool("in", 4);
    let output = pool("out", 8);
    let mut iep = IepWorker::spawn(Slow(SoftField::new(DeinterlaceMode::Bob)), 2)?;
    assert_eq!(iep.kind(), FilterKind::Iep);
    assert_eq!(iep.min_buffers(), 4);
    assert_eq!(
        iep.output_info(&interlaced()).pic_struct,
        PicStruct::Progressive
    );

    let mut frames = Vec::new();
    for pts in [0, 40, 80] {
        let src = frame(&input, pts)?;
        frames.extend(iep.process(Some(&src), &output)?.frames);
        assert!(iep.in_flight() <= 2);
    }
    frames.extend(iep.process(None, &output)?.frames);
    assert_eq!(iep.in_flight(), 0);

    // fields land on a timeline twice as fine as the input's
    let pts: Vec<Option<i64>> = frames.iter().map(|f| f.pts()).collect();
    assert_eq!(
        pts,
        vec![Some(0), Some(40), Some(80), Some(120), Some(160), Some(200)]
    );
    assert!(frames.iter().all(|f| f.read().duration == 40));
    assert!(frames.iter().all(|f| !f.info().pic_struct.is_interlaced()));
    drop(frames);
    assert!(input.is_all_free());
    assert!(output.is_all_free());
    Ok(())
}

#[test]
fn test_worker_error_surfaces() -> anyhow::Result<()> {
    let input = pool("in", 1);
    let output = pool("out", 1);
    let mut iep = IepWorker::spawn(Failing, 1)?;
    let src = frame(&input, 0)?;
    let first = iep.process(Some(&src), &output);
    let flushed = iep.process(None, &output);
    assert!(first.is_err() || flushed.is_err());
    Ok(())
}

#[test]
fn test_bob_fields_stay_apart_at_one_tick_per_frame() -> anyhow::Result<()> {
    let input = pool("in", 4);
    let output = pool("out", 8);
    let mut iep = IepWorker::spawn(SoftField::new(DeinterlaceMode::Bob), 2)?;
    assert_eq!(iep.output_time_base(Rational::new(1, 25)), Rational::new(1, 50));

    let mut frames = Vec::new();
    for pts in 0..3 {
        let src = timed_frame(&input, pts, 1)?;
        frames.extend(iep.process(Some(&src), &output)?.frames);
    }
    frames.extend(iep.process(None, &output)?.frames);
    let pts: Vec<Option<i64>> = frames.iter().map(|f| f.pts()).collect();
    assert_eq!(pts, (0..6).map(Some).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn test_frame_mode_keeps_time_base() -> anyhow::Result<()> {
    let iep = IepWorker::spawn(SoftField::new(DeinterlaceMode::Frame), 1)?;
    assert_eq!(iep.output_time_base(Rational::new(1, 25)), Rational::new(1, 25));
    Ok(())
}

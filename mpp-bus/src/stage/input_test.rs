use std::io::Cursor;

use super::*;
use crate::frame::{FrameInfo, PixelFormat, Storage, Surface};
use crate::io::RawFileReader;
use crate::pool::PoolOptions;
use crate::timestamp::Rational;

fn info() -> FrameInfo {
    FrameInfo::new(4, 2, PixelFormat::Nv12)
}

fn raw_bytes(frames: u8) -> Vec<u8> {
    (0..frames)
        .flat_map(|i| vec![i; info().frame_size()])
        .collect()
}

fn native_pool(count: usize) -> SurfacePool {
    let surfaces = (0..count)
        .map(|i| {
            Surface::new(
                info(),
                Storage::new(MemoryDomain::Native, i as u64, vec![0; info().frame_size()]),
            )
        })
        .collect();
    SurfacePool::with_surfaces("input-out", PoolOptions::default(), surfaces)
}

#[test]
fn test_raw_frames_get_ids_and_timestamps() -> anyhow::Result<()> {
    let reader = RawFileReader::frames(Cursor::new(raw_bytes(3)), info(), Rational::new(25, 1));
    let mut input = InputStage::raw(Box::new(reader), 0);
    let pool = native_pool(3);
    input.attach_output_pool(pool.clone())?;

    let mut seen = Vec::new();
    while input.send_frame(None)? == StageStatus::Accepted {
        for item in input.get_output(false) {
            let surface = item.as_surface().expect("raw frame").read();
            seen.push((surface.input_frame_id, surface.pts, surface.data()[0]));
        }
    }
    assert_eq!(seen, vec![(0, Some(0), 0), (1, Some(1), 1), (2, Some(2), 2)]);
    assert_eq!(input.frames_read(), 3);
    assert_eq!(input.send_frame(None)?, StageStatus::EndOfStream);
    assert!(pool.is_all_free());
    Ok(())
}

#[test]
fn test_raw_input_needs_a_pool() {
    let reader = RawFileReader::frames(Cursor::new(raw_bytes(1)), info(), Rational::new(25, 1));
    let mut input = InputStage::raw(Box::new(reader), 0);
    let err = input.send_frame(None).expect_err("no pool");
    assert!(matches!(err, PipelineError::InvalidState(_)));
}

#[test]
fn test_bitstream_input_and_abort() -> anyhow::Result<()> {
    let reader = RawFileReader::frames(Cursor::new(raw_bytes(4)), info(), Rational::new(25, 1));
    let mut input = InputStage::bitstream(Box::new(reader), 0);
    assert!(input.required_output().is_none());
    assert!(input.attach_output_pool(native_pool(1)).is_err());

    assert_eq!(input.send_frame(None)?, StageStatus::Accepted);
    let items = input.get_output(false);
    assert_eq!(items[0].as_bitstream().map(|b| b.size()), Some(info().frame_size()));

    assert!(input.abort());
    assert_eq!(input.send_frame(None)?, StageStatus::EndOfStream);
    assert_eq!(input.frames_read(), 1);
    Ok(())
}

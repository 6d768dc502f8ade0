use std::sync::{Arc, Mutex};

use super::*;
use crate::frame::{FrameInfo, PixelFormat, Storage, Surface};

fn ms_config(mode: AvSyncMode) -> TimestampConfig {
    TimestampConfig {
        mode,
        output_time_base: Rational::MILLISECONDS,
        frame_rate: Rational::new(1, 1),
        keep_source_offset: false,
        max_insert: 60,
    }
}

fn stage(config: &TimestampConfig) -> CheckPtsStage {
    CheckPtsStage::new(config, config.output_time_base, 0)
}

fn frame(pts: i64) -> OutputItem {
    let info = FrameInfo::new(2, 2, PixelFormat::Nv12);
    let mut surface = Surface::new(info, Storage::host(info.frame_size()));
    surface.pts = Some(pts);
    OutputItem::surface(SurfaceHandle::detached(surface))
}

fn run(stage: &mut CheckPtsStage, input: &[i64]) -> anyhow::Result<Vec<i64>> {
    let mut out = Vec::new();
    for &pts in input {
        stage.send_frame(Some(frame(pts)))?;
        while stage.queue().has_ready() {
            out.extend(stage.get_output(false).iter().filter_map(|i| i.timestamp()));
        }
    }
    assert_eq!(stage.send_frame(None)?, StageStatus::EndOfStream);
    Ok(out)
}

#[derive(Clone, Default)]
struct Recorder(Arc<Mutex<Vec<i64>>>);

impl TimecodeWriter for Recorder {
    fn write_timecode(&mut self, pts: i64, _: Rational) -> Result<()> {
        self.0.lock().unwrap().push(pts);
        Ok(())
    }
}

// ==================== vfr ====================

#[test]
fn test_vfr_large_gap_becomes_new_baseline() -> anyhow::Result<()> {
    let mut s = stage(&ms_config(AvSyncMode::Vfr));
    let out = run(&mut s, &[0, 1000, 2000, 40000, 41000, 42000, 43000])?;
    assert_eq!(out, vec![0, 1000, 2000, 40000, 41000, 42000, 43000]);
    assert_eq!(s.stats().dropped, 0);
    assert_eq!(s.stats().reoffsets, 1);
    Ok(())
}

#[test]
fn test_vfr_drops_late_duplicate_field() -> anyhow::Result<()> {
    let mut s = stage(&ms_config(AvSyncMode::Vfr));
    let out = run(&mut s, &[0, 1000, 1100, 2000, 2900])?;
    assert_eq!(out, vec![0, 1000, 2000, 2900]);
    assert_eq!(s.stats().dropped, 1);
    Ok(())
}

#[test]
fn test_vfr_backwards_jump_keeps_cadence() -> anyhow::Result<()> {
    let mut s = stage(&ms_config(AvSyncMode::Vfr));
    let out = run(&mut s, &[0, 1000, 2000, -40000, -39000, -38000, -37000])?;
    assert_eq!(out, vec![0, 1000, 2000, 3000, 4000, 5000, 6000]);
    assert_eq!(s.stats().reoffsets, 1);
    assert_eq!(s.stats().nudged, 0);
    assert_eq!(s.stats().dropped, 0);
    Ok(())
}

#[test]
fn test_vfr_backwards_jump_keeps_source_spacing() -> anyhow::Result<()> {
    let mut s = stage(&ms_config(AvSyncMode::Vfr));
    let out = run(&mut s, &[0, 1000, -50000, -48500, -47000, -46000])?;
    assert_eq!(out, vec![0, 1000, 2000, 3500, 5000, 6000]);
    Ok(())
}

#[test]
fn test_keep_source_offset() -> anyhow::Result<()> {
    let mut config = ms_config(AvSyncMode::Vfr);
    config.keep_source_offset = true;
    let mut s = stage(&config);
    assert_eq!(run(&mut s, &[5000, 6000, 7000])?, vec![5000, 6000, 7000]);

    let mut s = stage(&ms_config(AvSyncMode::Vfr));
    assert_eq!(run(&mut s, &[5000, 6000, 7000])?, vec![0, 1000, 2000]);
    Ok(())
}

// ==================== cfr ====================

#[test]
fn test_cfr_fills_gap_with_duplicates() -> anyhow::Result<()> {
    let mut s = stage(&ms_config(AvSyncMode::Cfr));
    let out = run(&mut s, &[0, 2100, 3000])?;
    assert_eq!(out, vec![0, 1000, 2000, 3000]);
    assert_eq!(s.stats().inserted, 1);
    assert_eq!(s.stats().emitted, 4);
    Ok(())
}

#[test]
fn test_cfr_drops_early_frame() -> anyhow::Result<()> {
    let mut s = stage(&ms_config(AvSyncMode::Cfr));
    let out = run(&mut s, &[0, 1000, 1100, 2000])?;
    assert_eq!(out, vec![0, 1000, 2000]);
    assert_eq!(s.stats().dropped, 1);
    Ok(())
}

#[test]
fn test_cfr_insert_bound_turns_into_reoffset() -> anyhow::Result<()> {
    let mut config = ms_config(AvSyncMode::Cfr);
    config.max_insert = 2;
    let mut s = stage(&config);
    let out = run(&mut s, &[0, 5000, 6000])?;
    assert_eq!(out, vec![0, 1000, 2000, 3000, 4000]);
    assert_eq!(s.stats().inserted, 2);
    assert_eq!(s.stats().reoffsets, 1);
    Ok(())
}

#[test]
fn test_cfr_discontinuities_keep_cadence() -> anyhow::Result<()> {
    for jump in [40000, -40000] {
        let mut s = stage(&ms_config(AvSyncMode::Cfr));
        let input = [0, 1000, 2000, jump, jump + 1000, jump + 2000, jump + 3000];
        let out = run(&mut s, &input)?;
        assert_eq!(out, vec![0, 1000, 2000, 3000, 4000, 5000, 6000], "jump {}", jump);
        assert_eq!(s.stats().reoffsets, 1);
        assert_eq!(s.stats().inserted + s.stats().dropped, 0);
    }
    Ok(())
}

#[test]
fn test_cfr_output_is_strictly_nominal() -> anyhow::Result<()> {
    let mut input = Vec::new();
    let mut t = 0i64;
    for i in 0..200i64 {
        let jitter = (i * 7919 % 601) - 300;
        let gap = if i % 37 == 0 { 3 } else { 1 };
        t += gap * 1000;
        input.push(t + jitter);
    }
    // one discontinuity far beyond the 32 frame window
    input.push(t + 100_000);
    input.push(t + 101_000);

    let mut s = stage(&ms_config(AvSyncMode::Cfr));
    let out = run(&mut s, &input)?;
    assert!(out.len() > 2);
    for pair in out.windows(2) {
        assert_eq!(pair[1] - pair[0], 1000, "at {:?}", pair);
    }
    Ok(())
}

#[test]
fn test_normalized_stream_is_unchanged() -> anyhow::Result<()> {
    let input: Vec<i64> = (0..20).map(|i| i * 1000).collect();
    for mode in [AvSyncMode::Passthrough, AvSyncMode::Vfr, AvSyncMode::Cfr] {
        let mut s = stage(&ms_config(mode));
        let once = run(&mut s, &input)?;
        assert_eq!(once, input, "{:?}", mode);
        let mut s = stage(&ms_config(mode));
        assert_eq!(run(&mut s, &once)?, once, "{:?}", mode);
    }
    Ok(())
}

// ==================== common ====================

#[test]
fn test_passthrough_rebuilds_cadence() -> anyhow::Result<()> {
    let mut s = stage(&ms_config(AvSyncMode::Passthrough));
    assert_eq!(run(&mut s, &[0, 1500, 2100])?, vec![0, 1000, 2000]);
    Ok(())
}

#[test]
fn test_rescales_into_output_time_base() -> anyhow::Result<()> {
    let config = TimestampConfig {
        frame_rate: Rational::new(25, 1),
        ..ms_config(AvSyncMode::Vfr)
    };
    let mut s = CheckPtsStage::new(&config, Rational::MPEG, 0);
    assert_eq!(s.nominal_duration(), 40);
    assert_eq!(run(&mut s, &[900, 4500, 8100])?, vec![0, 40, 80]);
    Ok(())
}

#[test]
fn test_one_item_per_get_output() -> anyhow::Result<()> {
    let mut s = stage(&ms_config(AvSyncMode::Cfr));
    s.send_frame(Some(frame(0)))?;
    s.send_frame(Some(frame(2100)))?;
    assert_eq!(s.queue().len(), 3);
    assert_eq!(s.get_output(false).len(), 1);
    assert_eq!(s.get_output(false).len(), 1);
    assert_eq!(s.get_output(false).len(), 1);
    assert!(s.get_output(false).is_empty());
    Ok(())
}

#[test]
fn test_timecodes_follow_emitted_timestamps() -> anyhow::Result<()> {
    let recorder = Recorder::default();
    let mut s = stage(&ms_config(AvSyncMode::Cfr)).with_timecode(Box::new(recorder.clone()));
    let out = run(&mut s, &[0, 2100, 3000])?;
    assert_eq!(*recorder.0.lock().unwrap(), out);
    Ok(())
}

#[test]
fn test_duplicates_share_surface() -> anyhow::Result<()> {
    let mut s = stage(&ms_config(AvSyncMode::Cfr));
    s.send_frame(Some(frame(0)))?;
    s.send_frame(Some(frame(2100)))?;
    let _first = s.get_output(false);
    let dup = s.get_output(false).remove(0);
    let real = s.get_output(false).remove(0);
    let (a, b) = (dup.as_surface().expect("dup"), real.as_surface().expect("real"));
    assert!(a.ptr_eq(b));
    assert_eq!(a.pts(), Some(2100));
    assert_eq!((dup.timestamp(), real.timestamp()), (Some(1000), Some(2000)));
    Ok(())
}

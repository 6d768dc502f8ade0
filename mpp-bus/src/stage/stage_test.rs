use super::*;
use crate::config::TimestampConfig;
use crate::frame::{PixelFormat, Storage, Surface};
use crate::item::Fence;
use crate::pool::SurfaceHandle;
use crate::timestamp::Rational;

fn frame(pts: i64) -> OutputItem {
    let info = FrameInfo::new(2, 2, PixelFormat::Nv12);
    let mut surface = Surface::new(info, Storage::host(info.frame_size()));
    surface.pts = Some(pts);
    OutputItem::surface(SurfaceHandle::detached(surface))
}

// ==================== queue ====================

#[test]
fn test_queue_releases_beyond_depth() {
    let mut queue = StageQueue::new(2);
    for pts in 0..3 {
        queue.push(frame(pts));
    }
    assert!(queue.has_ready());
    let out = queue.drain_ready(false);
    assert_eq!(out.iter().map(|i| i.timestamp()).collect::<Vec<_>>(), vec![Some(0)]);
    assert!(!queue.has_ready());
    assert_eq!(queue.len(), 2);

    queue.set_max_depth(0);
    assert_eq!(queue.pop_ready(false).and_then(|i| i.timestamp()), Some(1));
    assert_eq!(queue.drain_ready(false).len(), 1);
    assert!(queue.is_empty());
    assert!(queue.pop_ready(false).is_none());
}

#[test]
fn test_sync_waits_on_dependencies() {
    let fence = Fence::new();
    let mut queue = StageQueue::new(0);
    queue.push(frame(0).with_dependency(fence.clone()));

    let signal = std::thread::spawn(move || {
        std::thread::sleep(std::time::Duration::from_millis(10));
        fence.signal();
    });
    let out = queue.drain_ready(true);
    assert!(out[0].dependencies().is_empty());
    signal.join().expect("signal thread");
}

#[test]
fn test_unsynced_items_keep_fences() {
    let fence = Fence::signaled();
    let mut queue = StageQueue::new(0);
    queue.push(frame(0).with_dependency(fence));
    let out = queue.drain_ready(false);
    assert_eq!(out[0].dependencies().len(), 1);
}

// ==================== kinds ====================

#[test]
fn test_priority_order() {
    let ranked = [
        StageKind::Encode,
        StageKind::Decode,
        StageKind::Filter(FilterKind::Iep),
        StageKind::Filter(FilterKind::Rga),
        StageKind::Trim,
    ];
    for pair in ranked.windows(2) {
        assert!(pair[0].priority() > pair[1].priority(), "{} vs {}", pair[0], pair[1]);
    }
    assert_eq!(
        StageKind::Filter(FilterKind::Deinterlace).priority(),
        StageKind::Filter(FilterKind::Iep).priority()
    );
    assert_eq!(StageKind::CheckPts.to_string(), "check-pts");
}

#[test]
fn test_stage_dispatch() -> anyhow::Result<()> {
    let mut stage: Stage = CheckPtsStage::new(&TimestampConfig::default(), Rational::MPEG, 1).into();
    assert_eq!(stage.name(), "check-pts");
    assert_eq!(stage.kind(), StageKind::CheckPts);
    assert!(stage.is_pass_through());
    assert!(!stage.abort());

    stage.send_frame(Some(frame(0)))?;
    assert_eq!(stage.pending(), 1);
    assert!(!stage.has_ready());
    stage.set_max_depth(0);
    assert!(stage.has_ready());
    assert_eq!(stage.get_output(false).len(), 1);
    assert!(stage.pools().is_empty());

    let err = stage
        .as_dyn_mut()
        .attach_output_pool(SurfacePool::new("x", Default::default()))
        .expect_err("pass-through stages take no pool");
    assert!(matches!(err, PipelineError::InvalidState(_)));
    stage.close()?;
    Ok(())
}

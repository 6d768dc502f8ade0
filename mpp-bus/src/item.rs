//! Items flowing between stages.

use std::sync::{Arc, Condvar, Mutex};
use std::time::Duration;

use crate::packet::Bitstream;
use crate::pool::SurfaceHandle;

/// How long dropping an item may wait for outstanding fences before giving up.
const FENCE_DROP_TIMEOUT: Duration = Duration::from_secs(5);

/// Completion signal of an asynchronous operation (filter run, memory copy,
/// worker job). Clones observe the same signal.
#[derive(Clone, Default)]
pub struct Fence {
    inner: Arc<(Mutex<bool>, Condvar)>,
}

impl Fence {
    pub fn new() -> Self {
        Self::default()
    }

    /// A fence for work that already completed.
    pub fn signaled() -> Self {
        let fence = Self::new();
        fence.signal();
        fence
    }

    pub fn signal(&self) {
        let (lock, cvar) = &*self.inner;
        *lock.lock().unwrap_or_else(|e| e.into_inner()) = true;
        cvar.notify_all();
    }

    pub fn is_signaled(&self) -> bool {
        *self.inner.0.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn wait(&self) {
        let (lock, cvar) = &*self.inner;
        let mut done = lock.lock().unwrap_or_else(|e| e.into_inner());
        while !*done {
            done = cvar.wait(done).unwrap_or_else(|e| e.into_inner());
        }
    }

    /// Returns whether the fence was signaled within `timeout`.
    pub fn wait_timeout(&self, timeout: Duration) -> bool {
        let (lock, cvar) = &*self.inner;
        let done = lock.lock().unwrap_or_else(|e| e.into_inner());
        let (done, _) = cvar
            .wait_timeout_while(done, timeout, |done| !*done)
            .unwrap_or_else(|e| e.into_inner());
        *done
    }
}

impl std::fmt::Debug for Fence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "Fence({})", self.is_signaled())
    }
}

/// Timestamp rewrite applied by timestamp correction. Consumers use it in
/// place of the surface's own timing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimestampOverride {
    pub pts: i64,
    pub duration: i64,
}

#[derive(Debug)]
pub enum Payload {
    Surface(SurfaceHandle),
    Bitstream(Bitstream),
}

#[derive(Debug)]
pub struct OutputItem {
    payload: Payload,
    dependencies: Vec<Fence>,
    ts_override: Option<TimestampOverride>,
}

impl OutputItem {
    pub fn surface(handle: SurfaceHandle) -> Self {
        Self {
            payload: Payload::Surface(handle),
            dependencies: Vec::new(),
            ts_override: None,
        }
    }

    pub fn bitstream(bitstream: Bitstream) -> Self {
        Self {
            payload: Payload::Bitstream(bitstream),
            dependencies: Vec::new(),
            ts_override: None,
        }
    }

    pub fn with_dependency(mut self, fence: Fence) -> Self {
        self.dependencies.push(fence);
        self
    }

    pub fn with_dependencies(mut self, fences: impl IntoIterator<Item = Fence>) -> Self {
        self.dependencies.extend(fences);
        self
    }

    pub fn with_override(mut self, ts: TimestampOverride) -> Self {
        self.ts_override = Some(ts);
        self
    }

    pub fn payload(&self) -> &Payload {
        &self.payload
    }

    pub fn as_surface(&self) -> Option<&SurfaceHandle> {
        match &self.payload {
            Payload::Surface(h) => Some(h),
            Payload::Bitstream(_) => None,
        }
    }

    pub fn as_bitstream(&self) -> Option<&Bitstream> {
        match &self.payload {
            Payload::Bitstream(b) => Some(b),
            Payload::Surface(_) => None,
        }
    }

    pub fn ts_override(&self) -> Option<TimestampOverride> {
        self.ts_override
    }

    pub fn dependencies(&self) -> &[Fence] {
        &self.dependencies
    }

    /// Presentation timestamp as a consumer should see it.
    pub fn timestamp(&self) -> Option<i64> {
        if let Some(ts) = self.ts_override {
            return Some(ts.pts);
        }
        match &self.payload {
            Payload::Surface(h) => h.pts(),
            Payload::Bitstream(b) => b.pts,
        }
    }

    /// Blocks until every dependency is signaled, then forgets them.
    pub fn wait_dependencies(&mut self) {
        for fence in self.dependencies.drain(..) {
            fence.wait();
        }
    }

    /// Splits the item, handing the outstanding fences to the caller.
    pub fn into_parts(mut self) -> (Payload, Vec<Fence>, Option<TimestampOverride>) {
        let dependencies = std::mem::take(&mut self.dependencies);
        let ts_override = self.ts_override;
        let payload = std::mem::replace(&mut self.payload, Payload::Bitstream(Bitstream::default()));
        (payload, dependencies, ts_override)
    }
}

impl Drop for OutputItem {
    /// Storage must not go back to its pool while asynchronous work still
    /// reads or writes it.
    fn drop(&mut self) {
        for fence in self.dependencies.drain(..) {
            if !fence.wait_timeout(FENCE_DROP_TIMEOUT) {
                log::warn!("dropping item with a fence still pending");
            }
        }
    }
}

#[cfg(test)]
#[path = "item_test.rs"]
mod item_test;

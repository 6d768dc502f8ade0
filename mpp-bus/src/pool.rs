//! Reference-counted surface pool.
//!
//! The pool is an arena of slots. A [`SurfaceHandle`] is shared ownership of
//! one slot: cloning increments the slot count, dropping decrements it. A
//! slot is only ever handed out by [`SurfacePool::acquire_free`] when its
//! count is zero, and the zero -> one transition is a compare-and-swap so two
//! callers can never win the same slot.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, RwLock, RwLockReadGuard, RwLockWriteGuard};
use std::time::Duration;

use crate::error::{PipelineError, Result};
use crate::frame::{FrameInfo, MemoryDomain, Surface};

struct Slot {
    refs: AtomicUsize,
    retired: AtomicBool,
    surface: RwLock<Surface>,
}

impl Slot {
    fn new(surface: Surface, refs: usize) -> Self {
        Self {
            refs: AtomicUsize::new(refs),
            retired: AtomicBool::new(false),
            surface: RwLock::new(surface),
        }
    }

    fn try_claim(&self) -> bool {
        !self.retired.load(Ordering::Acquire)
            && self
                .refs
                .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
                .is_ok()
    }
}

struct PoolInner {
    name: String,
    slots: Mutex<Vec<Arc<Slot>>>,
    retry_limit: u32,
    backoff: Duration,
}

/// Retry policy for [`SurfacePool::acquire_free`].
#[derive(Debug, Clone, Copy)]
pub struct PoolOptions {
    pub retry_limit: u32,
    pub backoff: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            retry_limit: 10_000,
            backoff: Duration::from_micros(100),
        }
    }
}

/// Shared handle to the pool itself. Cloning shares the same slots.
#[derive(Clone)]
pub struct SurfacePool {
    inner: Arc<PoolInner>,
}

impl SurfacePool {
    pub fn new(name: &str, options: PoolOptions) -> Self {
        Self {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                slots: Mutex::new(Vec::new()),
                retry_limit: options.retry_limit,
                backoff: options.backoff,
            }),
        }
    }

    /// Builds a pool that starts with `surfaces` as free entries.
    pub fn with_surfaces(name: &str, options: PoolOptions, surfaces: Vec<Surface>) -> Self {
        let pool = Self::new(name, options);
        pool.extend(surfaces);
        pool
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    fn slots(&self) -> MutexGuard<'_, Vec<Arc<Slot>>> {
        self.inner.slots.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn try_acquire(&self) -> Option<SurfaceHandle> {
        let slots = self.slots();
        slots.iter().find(|slot| slot.try_claim()).map(|slot| SurfaceHandle {
            slot: slot.clone(),
        })
    }

    /// Hands out any zero-count entry, retrying with backoff while every
    /// entry is busy.
    pub fn acquire_free(&self) -> Result<SurfaceHandle> {
        for attempt in 0..=self.inner.retry_limit {
            if let Some(handle) = self.try_acquire() {
                if attempt > 0 {
                    log::trace!("pool {}: acquired after {} retries", self.name(), attempt);
                }
                return Ok(handle);
            }
            std::thread::sleep(self.inner.backoff);
        }
        Err(PipelineError::ResourceExhausted(format!(
            "pool {}: no free surface after {} retries ({} entries)",
            self.name(),
            self.inner.retry_limit,
            self.len()
        )))
    }

    /// Non-blocking variant of [`acquire_free`](Self::acquire_free).
    pub fn try_acquire_free(&self) -> Option<SurfaceHandle> {
        self.try_acquire()
    }

    /// Inserts new storage and returns the only handle to it.
    pub fn add_entry(&self, surface: Surface) -> SurfaceHandle {
        let slot = Arc::new(Slot::new(surface, 1));
        let mut slots = self.slots();
        Self::compact_locked(&mut slots);
        slots.push(slot.clone());
        SurfaceHandle { slot }
    }

    /// Inserts new storage as free entries.
    pub fn extend(&self, surfaces: Vec<Surface>) {
        let mut slots = self.slots();
        Self::compact_locked(&mut slots);
        slots.extend(surfaces.into_iter().map(|s| Arc::new(Slot::new(s, 0))));
    }

    /// Marks every current entry as no longer eligible for issuance. Busy
    /// entries stay alive until their last handle is dropped and are then
    /// reclaimed by the next compaction.
    pub fn retire_all(&self) {
        let mut slots = self.slots();
        for slot in slots.iter() {
            slot.retired.store(true, Ordering::Release);
        }
        Self::compact_locked(&mut slots);
    }

    /// Frees retired entries whose count dropped to zero.
    pub fn compact(&self) {
        let mut slots = self.slots();
        Self::compact_locked(&mut slots);
    }

    fn compact_locked(slots: &mut Vec<Arc<Slot>>) {
        slots.retain(|slot| {
            !(slot.retired.load(Ordering::Acquire) && slot.refs.load(Ordering::Acquire) == 0)
        });
    }

    pub fn is_all_free(&self) -> bool {
        self.slots()
            .iter()
            .all(|slot| slot.refs.load(Ordering::Acquire) == 0)
    }

    pub fn len(&self) -> usize {
        self.slots().len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots().is_empty()
    }

    pub fn free_count(&self) -> usize {
        self.slots()
            .iter()
            .filter(|slot| {
                !slot.retired.load(Ordering::Acquire) && slot.refs.load(Ordering::Acquire) == 0
            })
            .count()
    }

    /// Frame shape of the first live entry.
    pub fn frame_info(&self) -> Option<FrameInfo> {
        self.slots()
            .iter()
            .find(|slot| !slot.retired.load(Ordering::Acquire))
            .map(|slot| *read_surface(slot).info())
    }

    /// Drops every entry. Outstanding handles mean a stage leaked a frame,
    /// which is a logic error rather than a runtime condition.
    pub fn clear(&self) -> Result<()> {
        let mut slots = self.slots();
        let busy = slots
            .iter()
            .filter(|slot| slot.refs.load(Ordering::Acquire) != 0)
            .count();
        if busy != 0 {
            log::error!("pool {}: clear with {} surfaces in use", self.name(), busy);
            return Err(PipelineError::InvalidState(format!(
                "pool {} cleared with {} surfaces in use",
                self.name(),
                busy
            )));
        }
        slots.clear();
        Ok(())
    }
}

fn read_surface(slot: &Slot) -> RwLockReadGuard<'_, Surface> {
    slot.surface.read().unwrap_or_else(|e| e.into_inner())
}

/// Shared ownership of one pool entry.
pub struct SurfaceHandle {
    slot: Arc<Slot>,
}

impl SurfaceHandle {
    /// A handle that does not belong to any pool. Used for surfaces that
    /// are created on the fly and freed with their last handle.
    pub fn detached(surface: Surface) -> Self {
        Self {
            slot: Arc::new(Slot::new(surface, 1)),
        }
    }

    pub fn read(&self) -> RwLockReadGuard<'_, Surface> {
        read_surface(&self.slot)
    }

    /// Write access, granted only to the sole owner of the entry.
    pub fn write(&self) -> Result<RwLockWriteGuard<'_, Surface>> {
        let refs = self.ref_count();
        if refs != 1 {
            return Err(PipelineError::InvalidSurface(format!(
                "write to shared surface ({} handles)",
                refs
            )));
        }
        Ok(self.slot.surface.write().unwrap_or_else(|e| e.into_inner()))
    }

    pub fn ref_count(&self) -> usize {
        self.slot.refs.load(Ordering::Acquire)
    }

    pub fn is_unique(&self) -> bool {
        self.ref_count() == 1
    }

    pub fn domain(&self) -> MemoryDomain {
        self.read().domain()
    }

    pub fn info(&self) -> FrameInfo {
        *self.read().info()
    }

    pub fn pts(&self) -> Option<i64> {
        self.read().pts
    }

    pub fn ptr_eq(&self, other: &SurfaceHandle) -> bool {
        Arc::ptr_eq(&self.slot, &other.slot)
    }
}

impl Clone for SurfaceHandle {
    fn clone(&self) -> Self {
        self.slot.refs.fetch_add(1, Ordering::AcqRel);
        Self {
            slot: self.slot.clone(),
        }
    }
}

impl Drop for SurfaceHandle {
    fn drop(&mut self) {
        self.slot.refs.fetch_sub(1, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for SurfaceHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SurfaceHandle")
            .field("refs", &self.ref_count())
            .field("surface", &*self.read())
            .finish()
    }
}

#[cfg(test)]
#[path = "pool_test.rs"]
mod pool_test;

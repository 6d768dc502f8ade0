//! Frame transform adapters.
//!
//! A transform takes one surface and produces zero or more new surfaces in
//! the pool the negotiator attached to it. `process(None)` flushes anything
//! the transform still holds.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::error::{PipelineError, Result};
use crate::frame::{FrameInfo, MemoryDomain, Storage, Surface};
use crate::item::Fence;
use crate::pool::{SurfaceHandle, SurfacePool};
use crate::timestamp::Rational;

pub mod iep;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterKind {
    /// 2D blitter: scale, crop, colour conversion.
    Rga,
    /// Image enhancement processor, used for deinterlacing.
    Iep,
    /// Any other deinterlacer.
    Deinterlace,
    /// Kernel running on a compute context.
    GpuCompute,
    /// Memory domain conversion and other generic transforms.
    Transform,
}

impl FilterKind {
    pub fn is_deinterlacer(&self) -> bool {
        matches!(self, FilterKind::Iep | FilterKind::Deinterlace)
    }
}

#[derive(Debug, Default)]
pub struct FilterOutput {
    pub frames: Vec<SurfaceHandle>,
    /// Completion of the work that wrote `frames`.
    pub fences: Vec<Fence>,
}

pub trait FrameTransform: Send {
    fn name(&self) -> &str;

    fn kind(&self) -> FilterKind;

    /// Shape of the frames produced for an input of shape `input`.
    fn output_info(&self, input: &FrameInfo) -> FrameInfo;

    /// Time base of the timestamps on produced frames, given the one they
    /// arrive in.
    fn output_time_base(&self, input: Rational) -> Rational {
        input
    }

    /// Memory the transform reads from.
    fn input_domain(&self) -> MemoryDomain {
        MemoryDomain::Native
    }

    /// Memory the transform writes into.
    fn output_domain(&self) -> MemoryDomain {
        MemoryDomain::Native
    }

    fn min_buffers(&self) -> usize {
        1
    }

    fn process(&mut self, input: Option<&SurfaceHandle>, out: &SurfacePool) -> Result<FilterOutput>;
}

/// GPU compute device the pipeline can allocate in and copy through.
pub trait ComputeContext: Send + Sync {
    fn name(&self) -> &str;

    fn create_frame_buffer(&self, info: &FrameInfo) -> Result<Surface>;

    /// Queues a copy of `src` into `dst` and returns its completion.
    fn copy_frame(&self, dst: &mut Surface, src: &Surface) -> Result<Fence>;

    /// Waits for every queued operation.
    fn finish(&self) -> Result<()>;
}

/// Compute context backed by host memory. Copies complete immediately.
#[derive(Default)]
pub struct HostComputeContext {
    next_id: AtomicU64,
}

impl HostComputeContext {
    pub fn new() -> Self {
        Self::default()
    }
}

impl ComputeContext for HostComputeContext {
    fn name(&self) -> &str {
        "host-compute"
    }

    fn create_frame_buffer(&self, info: &FrameInfo) -> Result<Surface> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        Ok(Surface::new(
            *info,
            Storage::new(MemoryDomain::GpuCompute, id, vec![0; info.frame_size()]),
        ))
    }

    fn copy_frame(&self, dst: &mut Surface, src: &Surface) -> Result<Fence> {
        if dst.info().width < src.info().width || dst.info().height < src.info().height {
            return Err(PipelineError::InvalidSurface(format!(
                "copy {} into smaller {}",
                src.info(),
                dst.info()
            )));
        }
        dst.copy_pixels_from(src);
        dst.copy_props_from(src);
        Ok(Fence::signaled())
    }

    fn finish(&self) -> Result<()> {
        Ok(())
    }
}

/// Copies frames into another memory domain. The result is always a new
/// surface from the output pool.
pub struct DomainCopy {
    name: String,
    from: MemoryDomain,
    to: MemoryDomain,
    context: Option<Arc<dyn ComputeContext>>,
}

impl DomainCopy {
    pub fn new(from: MemoryDomain, to: MemoryDomain) -> Self {
        Self {
            name: format!("copy {:?}->{:?}", from, to),
            from,
            to,
            context: None,
        }
    }

    /// Routes copies through `context`. Required when either side is
    /// GPU compute memory.
    pub fn with_context(mut self, context: Arc<dyn ComputeContext>) -> Self {
        self.context = Some(context);
        self
    }
}

impl FrameTransform for DomainCopy {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> FilterKind {
        if self.from == MemoryDomain::GpuCompute || self.to == MemoryDomain::GpuCompute {
            FilterKind::GpuCompute
        } else {
            FilterKind::Transform
        }
    }

    fn output_info(&self, input: &FrameInfo) -> FrameInfo {
        *input
    }

    fn input_domain(&self) -> MemoryDomain {
        self.from
    }

    fn output_domain(&self) -> MemoryDomain {
        self.to
    }

    fn process(&mut self, input: Option<&SurfaceHandle>, out: &SurfacePool) -> Result<FilterOutput> {
        let Some(input) = input else {
            if let Some(ctx) = &self.context {
                ctx.finish()?;
            }
            return Ok(FilterOutput::default());
        };
        let target = out.acquire_free()?;
        let fence = {
            let mut dst = target.write()?;
            if dst.domain() != self.to {
                return Err(PipelineError::InvalidSurface(format!(
                    "{}: output pool holds {:?} memory",
                    self.name,
                    dst.domain()
                )));
            }
            let src = input.read();
            let compute = self.from == MemoryDomain::GpuCompute || self.to == MemoryDomain::GpuCompute;
            match (&self.context, compute) {
                (Some(ctx), true) => ctx.copy_frame(&mut dst, &src)?,
                (None, true) => {
                    return Err(PipelineError::Config(format!(
                        "{}: no compute context",
                        self.name
                    )));
                }
                _ => {
                    dst.copy_pixels_from(&src);
                    dst.copy_props_from(&src);
                    Fence::signaled()
                }
            }
        };
        Ok(FilterOutput {
            frames: vec![target],
            fences: vec![fence],
        })
    }
}

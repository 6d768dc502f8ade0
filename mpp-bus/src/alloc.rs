//! Surface allocation and the negotiation between neighbouring stages.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result};
use crate::filter::ComputeContext;
use crate::frame::{FrameInfo, MemoryDomain, Storage, Surface};
use crate::pool::{PoolOptions, SurfacePool};
use crate::stage::{FrameRequirement, Stage};

pub trait SurfaceAllocator: Send + Sync {
    fn domain(&self) -> MemoryDomain;

    fn allocate(&self, info: &FrameInfo, count: usize) -> Result<Vec<Surface>>;
}

/// Allocates plain memory tagged with a domain. Stands in for the
/// accelerator's buffer allocator and for host memory.
pub struct MemoryAllocator {
    domain: MemoryDomain,
    next_id: AtomicU64,
}

impl MemoryAllocator {
    pub fn native() -> Self {
        Self::new(MemoryDomain::Native)
    }

    pub fn host() -> Self {
        Self::new(MemoryDomain::Host)
    }

    fn new(domain: MemoryDomain) -> Self {
        Self {
            domain,
            next_id: AtomicU64::new(0),
        }
    }
}

impl SurfaceAllocator for MemoryAllocator {
    fn domain(&self) -> MemoryDomain {
        self.domain
    }

    fn allocate(&self, info: &FrameInfo, count: usize) -> Result<Vec<Surface>> {
        let size = info.frame_size();
        if size == 0 {
            return Err(PipelineError::InvalidSurface(format!(
                "cannot allocate empty frame {}",
                info
            )));
        }
        Ok((0..count)
            .map(|_| {
                let id = self.next_id.fetch_add(1, Ordering::Relaxed);
                Surface::new(*info, Storage::new(self.domain, id, vec![0; size]))
            })
            .collect())
    }
}

/// Allocates frame buffers through a compute context.
pub struct ComputeAllocator {
    context: Arc<dyn ComputeContext>,
}

impl ComputeAllocator {
    pub fn new(context: Arc<dyn ComputeContext>) -> Self {
        Self { context }
    }
}

impl SurfaceAllocator for ComputeAllocator {
    fn domain(&self) -> MemoryDomain {
        MemoryDomain::GpuCompute
    }

    fn allocate(&self, info: &FrameInfo, count: usize) -> Result<Vec<Surface>> {
        (0..count)
            .map(|_| self.context.create_frame_buffer(info))
            .collect()
    }
}

/// What the negotiator decided for one producer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocationPlan {
    pub producer: usize,
    pub consumer: Option<usize>,
    pub info: FrameInfo,
    pub count: usize,
    pub domain: MemoryDomain,
}

pub struct Negotiator {
    native: Arc<dyn SurfaceAllocator>,
    host: Arc<dyn SurfaceAllocator>,
    compute: Option<Arc<dyn SurfaceAllocator>>,
    async_depth: usize,
    pool_options: PoolOptions,
}

impl Negotiator {
    pub fn new(native: Arc<dyn SurfaceAllocator>, config: &PipelineConfig) -> Self {
        Self {
            native,
            host: Arc::new(MemoryAllocator::host()),
            compute: None,
            async_depth: config.async_depth,
            pool_options: config.pool_options(),
        }
    }

    pub fn with_compute(mut self, context: Arc<dyn ComputeContext>) -> Self {
        self.compute = Some(Arc::new(ComputeAllocator::new(context)));
        self
    }

    /// Pairs every allocating producer with the next stage that does not
    /// just forward storage, and sizes the pool between them.
    pub fn plan(&self, stages: &[Stage]) -> Result<Vec<AllocationPlan>> {
        let mut plans = Vec::new();
        for (i, producer) in stages.iter().enumerate() {
            if producer.is_pass_through() {
                continue;
            }
            let Some(output) = producer.as_dyn().required_output() else {
                continue;
            };
            let consumer = stages
                .iter()
                .enumerate()
                .skip(i + 1)
                .find(|(_, s)| !s.is_pass_through());
            let input = consumer.and_then(|(_, s)| s.as_dyn().required_input());
            let plan = self.reconcile(i, producer, output, consumer.map(|(j, s)| (j, s, input)))?;
            log::info!(
                "allocation {} -> {}: {} x{} in {:?}",
                producer.name(),
                consumer.map(|(_, s)| s.name()).unwrap_or("writer"),
                plan.info,
                plan.count,
                plan.domain
            );
            plans.push(plan);
        }
        Ok(plans)
    }

    fn reconcile(
        &self,
        index: usize,
        producer: &Stage,
        output: FrameRequirement,
        consumer: Option<(usize, &Stage, Option<FrameRequirement>)>,
    ) -> Result<AllocationPlan> {
        let (consumer_index, input) = match consumer {
            Some((j, stage, input)) => (Some(j), input.map(|req| (stage, req))),
            None => (None, None),
        };
        let mut info = output.info;
        let mut count = output.count + self.async_depth + 1;
        let mut domain = output.domain;
        if let Some((stage, req)) = input {
            if stage.kind().priority() > producer.kind().priority() {
                info = req.info;
            }
            count += req.count;
            if req.domain == MemoryDomain::GpuCompute {
                domain = MemoryDomain::GpuCompute;
            }
        }
        Ok(AllocationPlan {
            producer: index,
            consumer: consumer_index,
            info,
            count,
            domain,
        })
    }

    fn allocator_for(&self, domain: MemoryDomain) -> Result<&Arc<dyn SurfaceAllocator>> {
        match domain {
            MemoryDomain::Native => Ok(&self.native),
            MemoryDomain::Host => Ok(&self.host),
            MemoryDomain::GpuCompute => self.compute.as_ref().ok_or_else(|| {
                PipelineError::Config("GPU compute memory requested but no compute context".to_string())
            }),
        }
    }

    /// Plans, allocates and hands every pool to its producer. Runs before
    /// the first frame so a requirement nothing can satisfy fails early.
    pub fn allocate(&self, stages: &mut [Stage]) -> Result<Vec<AllocationPlan>> {
        let plans = self.plan(stages)?;
        for plan in &plans {
            let allocator = self.allocator_for(plan.domain)?;
            let surfaces = allocator.allocate(&plan.info, plan.count)?;
            let stage = &mut stages[plan.producer];
            let name = format!("{}-out", stage.name());
            let pool = SurfacePool::with_surfaces(&name, self.pool_options, surfaces);
            stage
                .as_dyn_mut()
                .attach_output_pool(pool)
                .map_err(|e| e.in_stage(stage.name()))?;
        }
        Ok(plans)
    }
}

#[cfg(test)]
#[path = "alloc_test.rs"]
mod alloc_test;

//! Deinterlacer running on its own worker thread.
//!
//! The processor call blocks until the hardware is done, so it runs off the
//! driver thread. Jobs go in over a bounded channel, finished frames come
//! back through a mutex guarded deque and each job signals its own fence.

use std::collections::VecDeque;
use std::sync::mpsc::{Receiver, SyncSender, sync_channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;

use serde::{Deserialize, Serialize};

use super::{FilterKind, FilterOutput, FrameTransform};
use crate::error::{PipelineError, Result};
use crate::frame::{FrameInfo, PicStruct, Surface};
use crate::item::Fence;
use crate::pool::{SurfaceHandle, SurfacePool};
use crate::timestamp::Rational;

/// Blocking field processor.
pub trait FieldProcessor: Send + 'static {
    /// Frames produced per interlaced input frame.
    fn outputs_per_frame(&self) -> usize;

    /// Writes output `index` of `src` into `dst`.
    fn process(&mut self, src: &Surface, dst: &mut Surface, index: usize) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeinterlaceMode {
    /// One progressive frame per input frame.
    Frame,
    /// One progressive frame per field, doubling the frame rate.
    Bob,
}

/// Field processor that builds progressive frames by line copying.
pub struct SoftField {
    mode: DeinterlaceMode,
}

impl SoftField {
    pub fn new(mode: DeinterlaceMode) -> Self {
        Self { mode }
    }
}

impl FieldProcessor for SoftField {
    fn outputs_per_frame(&self) -> usize {
        match self.mode {
            DeinterlaceMode::Frame => 1,
            DeinterlaceMode::Bob => 2,
        }
    }

    fn process(&mut self, src: &Surface, dst: &mut Surface, _index: usize) -> Result<()> {
        dst.copy_pixels_from(src);
        dst.copy_props_from(src);
        let mut info = *dst.info();
        info.pic_struct = PicStruct::Progressive;
        dst.set_info(info);
        Ok(())
    }
}

struct Job {
    input: SurfaceHandle,
    outputs: Vec<SurfaceHandle>,
    fence: Fence,
}

struct Done {
    outputs: Vec<SurfaceHandle>,
    result: Result<()>,
}

type DoneQueue = Arc<Mutex<VecDeque<Done>>>;

pub struct IepWorker {
    name: String,
    per_frame: usize,
    depth: usize,
    jobs: Option<SyncSender<Job>>,
    done: DoneQueue,
    in_flight: VecDeque<Fence>,
    thread: Option<JoinHandle<()>>,
}

impl IepWorker {
    /// Starts the worker thread. At most `depth` jobs are in flight.
    pub fn spawn<P: FieldProcessor>(processor: P, depth: usize) -> Result<Self> {
        let depth = depth.max(1);
        let per_frame = processor.outputs_per_frame().max(1);
        let (tx, rx) = sync_channel::<Job>(depth);
        let done: DoneQueue = Arc::new(Mutex::new(VecDeque::new()));
        let worker_done = done.clone();
        let thread = std::thread::Builder::new()
            .name("iep-worker".to_string())
            .spawn(move || worker_loop(processor, per_frame, rx, worker_done))?;
        log::info!("iep worker started, depth {}, {} outputs per frame", depth, per_frame);
        Ok(Self {
            name: "iep".to_string(),
            per_frame,
            depth,
            jobs: Some(tx),
            done,
            in_flight: VecDeque::new(),
            thread: Some(thread),
        })
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    fn submit(&mut self, input: &SurfaceHandle, out: &SurfacePool) -> Result<()> {
        let outputs = (0..self.per_frame)
            .map(|_| out.acquire_free())
            .collect::<Result<Vec<_>>>()?;
        let fence = Fence::new();
        let job = Job {
            input: input.clone(),
            outputs,
            fence: fence.clone(),
        };
        let jobs = self
            .jobs
            .as_ref()
            .ok_or_else(|| PipelineError::InvalidState("iep worker stopped".to_string()))?;
        jobs.send(job)
            .map_err(|_| PipelineError::InvalidState("iep worker exited".to_string()))?;
        self.in_flight.push_back(fence);
        Ok(())
    }

    /// Moves finished jobs into `output`, retiring their fences.
    fn collect(&mut self, output: &mut FilterOutput) -> Result<()> {
        let finished: Vec<Done> = {
            let mut done = self.done.lock().unwrap_or_else(|e| e.into_inner());
            done.drain(..).collect()
        };
        self.in_flight.drain(..finished.len().min(self.in_flight.len()));
        let mut first_error = None;
        for job in finished {
            match job.result {
                Ok(()) => output.frames.extend(job.outputs),
                Err(e) => {
                    first_error.get_or_insert(e);
                }
            }
        }
        first_error.map_or(Ok(()), Err)
    }

    fn wait_oldest(&mut self) {
        if let Some(fence) = self.in_flight.front() {
            fence.wait();
        }
    }
}

/// Places output `index` of `src` on the output timeline, whose time base
/// is `per_frame` times finer than the input's.
fn retime(src: &Surface, dst: &mut Surface, index: usize, per_frame: usize) {
    let field = src.duration.max(1);
    dst.pts = src
        .pts
        .map(|pts| pts * per_frame as i64 + field * index as i64);
    dst.duration = field;
}

fn worker_loop<P: FieldProcessor>(
    mut processor: P,
    per_frame: usize,
    rx: Receiver<Job>,
    done: DoneQueue,
) {
    while let Ok(job) = rx.recv() {
        let Job {
            input,
            outputs,
            fence,
        } = job;
        let result = {
            let src = input.read();
            outputs.iter().enumerate().try_for_each(|(index, handle)| {
                let mut dst = handle.write()?;
                processor.process(&src, &mut dst, index)?;
                retime(&src, &mut dst, index, per_frame);
                Ok(())
            })
        };
        if let Err(e) = &result {
            log::error!("iep job failed: {}", e);
        }
        drop(input);
        done.lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(Done { outputs, result });
        fence.signal();
    }
    log::debug!("iep worker exiting");
}

impl FrameTransform for IepWorker {
    fn name(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> FilterKind {
        FilterKind::Iep
    }

    fn output_info(&self, input: &FrameInfo) -> FrameInfo {
        input.with_pic_struct(PicStruct::Progressive)
    }

    fn output_time_base(&self, input: Rational) -> Rational {
        Rational::new(input.num, input.den * self.per_frame as i64)
    }

    fn min_buffers(&self) -> usize {
        self.depth * self.per_frame
    }

    fn process(&mut self, input: Option<&SurfaceHandle>, out: &SurfacePool) -> Result<FilterOutput> {
        let mut output = FilterOutput::default();
        match input {
            Some(input) => {
                if self.in_flight.len() >= self.depth {
                    self.wait_oldest();
                    self.collect(&mut output)?;
                }
                self.submit(input, out)?;
                self.collect(&mut output)?;
            }
            None => {
                while !self.in_flight.is_empty() {
                    self.wait_oldest();
                    self.collect(&mut output)?;
                }
            }
        }
        Ok(output)
    }
}

impl Drop for IepWorker {
    fn drop(&mut self) {
        self.jobs.take();
        if let Some(thread) = self.thread.take()
            && thread.join().is_err()
        {
            log::error!("iep worker panicked");
        }
    }
}

#[cfg(test)]
#[path = "iep_test.rs"]
mod iep_test;

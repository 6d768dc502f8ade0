//! Pipeline driver.
//!
//! One thread threads every item through the stage list. Work is a FIFO of
//! tokens; whatever a stage produces goes to the front, tagged for the next
//! stage, so each item travels as far as it can before the next pull and the
//! stage queues stay shallow.

use std::collections::VecDeque;
use std::fmt::{Display, Formatter};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio_util::sync::CancellationToken;

use crate::config::PipelineConfig;
use crate::error::{PipelineError, Result, StageStatus};
use crate::io::SharedWriter;
use crate::item::{OutputItem, Payload};
use crate::stage::Stage;

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RunStats {
    /// Items produced by the first stage.
    pub frames_in: u64,
    /// Items handed to the writer.
    pub frames_out: u64,
    /// Of `frames_out`, the encoded packets.
    pub packets_written: u64,
    /// Frames removed by trimming and timestamp correction.
    pub frames_dropped: u64,
    /// Duplicates synthesized by timestamp correction.
    pub frames_inserted: u64,
    pub aborted: bool,
    pub elapsed: Duration,
}

impl Display for RunStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} in, {} out ({} packets), {} dropped, {} inserted in {:.3}s{}",
            self.frames_in,
            self.frames_out,
            self.packets_written,
            self.frames_dropped,
            self.frames_inserted,
            self.elapsed.as_secs_f64(),
            if self.aborted { " (aborted)" } else { "" }
        )
    }
}

enum Work {
    /// Ask the first stage for its next item.
    Pull,
    Item { stage: usize, item: OutputItem },
    /// Collect more output from a stage that still has ready items.
    Drain { stage: usize },
}

/// Spaces pulls to at most `fps` per second.
struct Throttle {
    interval: Option<Duration>,
    next: Option<Instant>,
}

impl Throttle {
    fn new(fps: f64) -> Self {
        let interval = (fps > 0.0).then(|| Duration::from_secs_f64(1.0 / fps));
        Self {
            interval,
            next: None,
        }
    }

    fn wait(&mut self) {
        let Some(interval) = self.interval else {
            return;
        };
        let now = Instant::now();
        if let Some(next) = self.next
            && next > now
        {
            std::thread::sleep(next - now);
        }
        let base = self.next.map_or(now, |next| next.max(now));
        self.next = Some(base + interval);
    }
}

pub struct Driver {
    stages: Vec<Stage>,
    writer: SharedWriter,
    cancel: CancellationToken,
    speed_limit: f64,
    stats: RunStats,
    finished: bool,
}

impl Driver {
    pub fn new(stages: Vec<Stage>, writer: SharedWriter, config: &PipelineConfig) -> Result<Self> {
        if stages.is_empty() {
            return Err(PipelineError::Config("pipeline has no stages".to_string()));
        }
        Ok(Self {
            stages,
            writer,
            cancel: CancellationToken::new(),
            speed_limit: config.speed_limit,
            stats: RunStats::default(),
            finished: false,
        })
    }

    /// Uses `cancel` instead of the driver's own token.
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    pub fn stats(&self) -> &RunStats {
        &self.stats
    }

    /// Every stage queue is empty and every pool has all its surfaces back.
    pub fn is_drained(&self) -> bool {
        self.stages
            .iter()
            .all(|s| s.pending() == 0 && s.pools().iter().all(|p| p.is_all_free()))
    }

    /// Runs the pipeline to the end of the input, then flushes it.
    pub fn run(&mut self) -> Result<RunStats> {
        if self.finished {
            return Err(PipelineError::InvalidState(
                "pipeline already ran".to_string(),
            ));
        }
        self.finished = true;
        let started = Instant::now();
        log::info!(
            "pipeline start: {}",
            self.stages
                .iter()
                .map(|s| s.name().to_string())
                .collect::<Vec<_>>()
                .join(" -> ")
        );

        let result = self.main_phase().and_then(|_| self.flush_phase());
        let closed = self.close();
        self.stats.elapsed = started.elapsed();
        self.collect_stage_stats();
        result?;
        closed?;

        if !self.is_drained() {
            log::warn!("pipeline finished with items or surfaces still held");
        }
        log::info!("pipeline done: {}", self.stats);
        Ok(self.stats.clone())
    }

    fn main_phase(&mut self) -> Result<()> {
        let mut work = VecDeque::from([Work::Pull]);
        let mut throttle = Throttle::new(self.speed_limit);
        while let Some(next) = work.pop_front() {
            if self.cancel.is_cancelled() && !self.stats.aborted {
                self.stats.aborted = true;
                let honored = self.stages[0].abort();
                log::info!(
                    "abort requested, {} {}",
                    self.stages[0].name(),
                    if honored { "winds down" } else { "cannot stop" }
                );
                if !honored {
                    return Err(PipelineError::Aborted);
                }
            }
            match next {
                Work::Pull => {
                    throttle.wait();
                    if !self.dispatch(0, None, &mut work)?.is_eos() {
                        work.push_back(Work::Pull);
                    } else {
                        log::debug!("{} reached end of stream", self.stages[0].name());
                    }
                }
                other => self.step(other, &mut work)?,
            }
        }
        Ok(())
    }

    /// Sends end of stream into each stage in turn until it reports it is
    /// done, carrying everything it still releases down the line.
    fn flush_phase(&mut self) -> Result<()> {
        for stage in self.stages.iter_mut() {
            stage.set_max_depth(0);
        }
        for index in 0..self.stages.len() {
            let mut work = VecDeque::new();
            loop {
                let status = self.dispatch(index, None, &mut work)?;
                while let Some(next) = work.pop_front() {
                    self.step(next, &mut work)?;
                }
                if status.is_eos() {
                    break;
                }
            }
            log::debug!("{} flushed", self.stages[index].name());
        }
        log::info!("flush complete");
        Ok(())
    }

    fn step(&mut self, work: Work, queue: &mut VecDeque<Work>) -> Result<()> {
        match work {
            Work::Pull => Ok(()),
            Work::Item { stage, item } => self.dispatch(stage, Some(item), queue).map(|_| ()),
            Work::Drain { stage } => self.collect(stage, queue),
        }
    }

    fn dispatch(
        &mut self,
        index: usize,
        item: Option<OutputItem>,
        queue: &mut VecDeque<Work>,
    ) -> Result<StageStatus> {
        let stage = &mut self.stages[index];
        let status = stage.send_frame(item).map_err(|e| {
            log::error!("stage {} failed: {}", stage.name(), e);
            e.in_stage(stage.name())
        })?;
        self.collect(index, queue)?;
        Ok(status)
    }

    /// Moves the ready output of stage `index` on: into the work queue for
    /// the next stage, or to the writer after the last one.
    fn collect(&mut self, index: usize, queue: &mut VecDeque<Work>) -> Result<()> {
        let last = index + 1 == self.stages.len();
        let sync = last || !self.stages[index + 1].is_pass_through();
        let outputs = self.stages[index].get_output(sync);
        if index == 0 {
            self.stats.frames_in += outputs.len() as u64;
        }
        if self.stages[index].has_ready() {
            queue.push_front(Work::Drain { stage: index });
        }
        if last {
            for item in outputs {
                self.write(item)?;
            }
        } else {
            for item in outputs.into_iter().rev() {
                queue.push_front(Work::Item {
                    stage: index + 1,
                    item,
                });
            }
        }
        Ok(())
    }

    fn write(&mut self, mut item: OutputItem) -> Result<()> {
        item.wait_dependencies();
        let mut writer = self.writer.lock().unwrap_or_else(|e| e.into_inner());
        match item.payload() {
            Payload::Bitstream(packet) => {
                writer.write_next_packet(packet)?;
                self.stats.packets_written += 1;
            }
            Payload::Surface(handle) => writer.write_next_frame(&handle.read())?,
        }
        self.stats.frames_out += 1;
        Ok(())
    }

    fn close(&mut self) -> Result<()> {
        let mut first_err = None;
        for stage in self.stages.iter_mut() {
            if let Err(e) = stage.close() {
                log::error!("closing {}: {}", stage.name(), e);
                first_err.get_or_insert(e.in_stage(stage.name()));
            }
        }
        let closed = self.writer.lock().unwrap_or_else(|e| e.into_inner()).close();
        match (first_err, closed) {
            (Some(e), _) => Err(e),
            (None, closed) => closed,
        }
    }

    fn collect_stage_stats(&mut self) {
        let mut dropped = 0;
        let mut inserted = 0;
        for stage in &self.stages {
            match stage {
                Stage::Trim(trim) => dropped += trim.dropped(),
                Stage::CheckPts(check) => {
                    dropped += check.stats().dropped;
                    inserted += check.stats().inserted;
                }
                _ => {}
            }
        }
        self.stats.frames_dropped = dropped;
        self.stats.frames_inserted = inserted;
    }
}

use std::fmt::{Display, Formatter};
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::Context;
use tokio_util::sync::CancellationToken;

use crate::buffer::{BufferPool, DeviceAllocator, HeapAllocator};
use crate::detect::{BoxStyle, Detector, NullDetector};
use crate::dispatcher::{Dispatcher, Submitted};
use crate::frame::{Frame, FrameRef};
use crate::reorder::ReorderBuffer;
use crate::sink::{FrameSink, NoOverlay, Overlay, StreamInfo, spawn_sink_stage};
use crate::worker::{WorkerHandle, completion_callback};

#[derive(Clone, Copy, Debug)]
pub struct PipelineConfig {
    /// Number of analysis workers, at least one.
    pub workers: usize,
    /// Target frame rate. Metadata for the sink and the fps gauge only.
    pub fps: u32,
    /// How long the sink waits for a missing frame while later frames are
    /// ready. `None` waits forever.
    pub stall_timeout: Option<Duration>,
    pub box_style: BoxStyle,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            fps: 30,
            stall_timeout: None,
            box_style: BoxStyle::default(),
        }
    }
}

#[derive(Debug, Default)]
pub struct PipelineCounters {
    pub submitted: AtomicU64,
    pub dispatched: AtomicU64,
    pub fallbacks: AtomicU64,
    pub allocation_failures: AtomicU64,
    pub analysis_failures: AtomicU64,
    pub forwarded: AtomicU64,
    pub gaps: AtomicU64,
    pub sink_errors: AtomicU64,
    fps_bits: AtomicU64,
}

impl PipelineCounters {
    pub fn set_fps(&self, fps: f64) {
        self.fps_bits.store(fps.to_bits(), Ordering::Relaxed);
    }

    pub fn fps(&self) -> f64 {
        f64::from_bits(self.fps_bits.load(Ordering::Relaxed))
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PipelineStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub fallbacks: u64,
    pub allocation_failures: u64,
    pub analysis_failures: u64,
    pub forwarded: u64,
    pub gaps: u64,
    pub stale_dropped: u64,
    pub sink_errors: u64,
    pub fps: f64,
}

impl Display for PipelineStats {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "submitted: {}, dispatched: {}, fallbacks: {}, forwarded: {}, gaps: {}, \
             allocation_failures: {}, analysis_failures: {}, stale_dropped: {}, sink_errors: {}, fps: {:.1}",
            self.submitted,
            self.dispatched,
            self.fallbacks,
            self.forwarded,
            self.gaps,
            self.allocation_failures,
            self.analysis_failures,
            self.stale_dropped,
            self.sink_errors,
            self.fps
        )
    }
}

/// Cloneable read-only view of a running pipeline's counters.
#[derive(Clone)]
pub struct StatsHandle {
    counters: Arc<PipelineCounters>,
    reorder: Arc<ReorderBuffer>,
}

impl StatsHandle {
    pub fn snapshot(&self) -> PipelineStats {
        let c = &self.counters;
        PipelineStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            dispatched: c.dispatched.load(Ordering::Relaxed),
            fallbacks: c.fallbacks.load(Ordering::Relaxed),
            allocation_failures: c.allocation_failures.load(Ordering::Relaxed),
            analysis_failures: c.analysis_failures.load(Ordering::Relaxed),
            forwarded: c.forwarded.load(Ordering::Relaxed),
            gaps: c.gaps.load(Ordering::Relaxed),
            stale_dropped: self.reorder.stale_dropped(),
            sink_errors: c.sink_errors.load(Ordering::Relaxed),
            fps: c.fps(),
        }
    }
}

type DetectorFactory = Box<dyn FnMut(usize) -> anyhow::Result<Box<dyn Detector>>>;

fn null_detector(_worker: usize) -> anyhow::Result<Box<dyn Detector>> {
    Ok(Box::new(NullDetector))
}

pub struct FramePipelineBuilder {
    config: PipelineConfig,
    detector_factory: Option<DetectorFactory>,
    allocator: Arc<dyn DeviceAllocator>,
    overlay: Option<Box<dyn Overlay>>,
    sink: Option<Box<dyn FrameSink>>,
}

impl FramePipelineBuilder {
    fn new() -> Self {
        Self {
            config: PipelineConfig::default(),
            detector_factory: None,
            allocator: Arc::new(HeapAllocator),
            overlay: None,
            sink: None,
        }
    }

    pub fn config(mut self, config: PipelineConfig) -> Self {
        self.config = config;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.config.fps = fps;
        self
    }

    pub fn stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.stall_timeout = timeout;
        self
    }

    pub fn box_style(mut self, style: BoxStyle) -> Self {
        self.config.box_style = style;
        self
    }

    /// Builds one detector per worker; called with the worker index.
    pub fn detector<F>(mut self, factory: F) -> Self
    where
        F: FnMut(usize) -> anyhow::Result<Box<dyn Detector>> + 'static,
    {
        self.detector_factory = Some(Box::new(factory));
        self
    }

    pub fn allocator(mut self, allocator: Arc<dyn DeviceAllocator>) -> Self {
        self.allocator = allocator;
        self
    }

    pub fn overlay(mut self, overlay: impl Overlay + 'static) -> Self {
        self.overlay = Some(Box::new(overlay));
        self
    }

    pub fn sink(mut self, sink: impl FrameSink + 'static) -> Self {
        self.sink = Some(Box::new(sink));
        self
    }

    /// Opens the sink, then spawns the workers and the sink thread. Nothing
    /// is left running if any step fails.
    pub fn start(self) -> anyhow::Result<FramePipeline> {
        let FramePipelineBuilder {
            config,
            detector_factory,
            allocator,
            overlay,
            sink,
        } = self;

        if config.workers == 0 {
            anyhow::bail!("pipeline needs at least one worker");
        }
        let mut sink = sink.context("pipeline has no sink")?;
        let overlay = overlay.unwrap_or_else(|| Box::new(NoOverlay));
        let mut detector_factory: DetectorFactory =
            detector_factory.unwrap_or_else(|| Box::new(null_detector));

        sink.open(&StreamInfo { fps: config.fps })
            .context("open frame sink")?;

        let reorder = Arc::new(ReorderBuffer::new(config.stall_timeout));
        let counters = Arc::new(PipelineCounters::default());

        let callback = {
            let reorder = reorder.clone();
            let counters = counters.clone();
            completion_callback(move |done| {
                if !done.analyzed {
                    counters.analysis_failures.fetch_add(1, Ordering::Relaxed);
                }
                let Some(buffer) = done.buffer else {
                    reorder.insert_gap(done.seq);
                    return;
                };
                match Frame::copy_from_buffer(done.seq, done.pts, buffer, done.analyzed) {
                    Ok(frame) => {
                        reorder.insert(frame);
                    }
                    Err(e) => {
                        log::error!("Pipeline: worker {} lost frame {}: {:#}", done.worker, done.seq, e);
                        reorder.insert_gap(done.seq);
                    }
                }
            })
        };

        let mut workers = Vec::with_capacity(config.workers);
        for index in 0..config.workers {
            let spawned = detector_factory(index)
                .with_context(|| format!("create detector for worker {}", index))
                .and_then(|detector| {
                    let pool = BufferPool::new(format!("worker-{}", index), allocator.clone());
                    WorkerHandle::spawn(index, detector, config.box_style, pool, callback.clone())
                });
            match spawned {
                Ok(worker) => workers.push(worker),
                Err(e) => {
                    // dropping the handles joins the workers already running
                    drop(workers);
                    if let Err(close) = sink.close() {
                        log::warn!("Pipeline: closing sink after failed start: {:#}", close);
                    }
                    return Err(e);
                }
            }
        }

        let sink_thread = spawn_sink_stage(reorder.clone(), sink, overlay, counters.clone())?;

        log::info!(
            "Pipeline: started, workers: {}, fps: {}, stall_timeout: {:?}",
            config.workers,
            config.fps,
            config.stall_timeout
        );

        Ok(FramePipeline {
            config,
            dispatcher: Dispatcher::new(workers, reorder.clone(), allocator, counters.clone()),
            reorder,
            counters,
            sink_thread: Some(sink_thread),
            cancel: CancellationToken::new(),
        })
    }
}

pub struct FramePipeline {
    config: PipelineConfig,
    dispatcher: Dispatcher,
    reorder: Arc<ReorderBuffer>,
    counters: Arc<PipelineCounters>,
    sink_thread: Option<JoinHandle<anyhow::Result<()>>>,
    cancel: CancellationToken,
}

impl FramePipeline {
    pub fn builder() -> FramePipelineBuilder {
        FramePipelineBuilder::new()
    }

    /// Sequences the frame and hands it to an idle worker, or copies it
    /// straight to the reorder buffer when every worker is busy. The frame
    /// data is no longer referenced when this returns.
    pub fn submit(&mut self, frame: &FrameRef<'_>) -> anyhow::Result<Submitted> {
        if self.cancel.is_cancelled() {
            anyhow::bail!("pipeline is shut down");
        }
        self.dispatcher.submit(frame)
    }

    /// Cancelling the token makes further `submit` calls fail.
    pub fn cancel_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub fn stats_handle(&self) -> StatsHandle {
        StatsHandle {
            counters: self.counters.clone(),
            reorder: self.reorder.clone(),
        }
    }

    pub fn stats(&self) -> PipelineStats {
        self.stats_handle().snapshot()
    }

    pub fn busy_workers(&self) -> usize {
        self.dispatcher.busy_workers()
    }

    pub fn next_seq(&self) -> u64 {
        self.dispatcher.next_seq()
    }

    /// Stops accepting frames, lets in-flight work finish and drains every
    /// completed frame into the sink before returning.
    pub fn shutdown(mut self) -> anyhow::Result<PipelineStats> {
        self.finish()?;
        let stats = self.stats();
        log::info!("Pipeline: stopped, {}", stats);
        Ok(stats)
    }

    fn finish(&mut self) -> anyhow::Result<()> {
        self.cancel.cancel();
        let workers = self.dispatcher.stop_workers();
        self.reorder.close();
        let sink = match self.sink_thread.take() {
            Some(thread) => thread
                .join()
                .map_err(|_| anyhow::anyhow!("frame sink thread panicked"))
                .and_then(|closed| closed.context("close frame sink")),
            None => Ok(()),
        };
        workers.and(sink)
    }
}

impl Drop for FramePipeline {
    fn drop(&mut self) {
        if self.sink_thread.is_some() {
            if let Err(e) = self.finish() {
                log::error!("Pipeline: shutdown on drop: {:#}", e);
            }
        }
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;

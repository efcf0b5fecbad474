use std::sync::{
    atomic::{AtomicBool, Ordering},
    Arc, Mutex, PoisonError,
};
use std::time::{Duration, Instant};

use anyhow::Context;
use frame_bus::{
    BoxStyle, Detector, FpsOverlay, FramePipeline, PipelineConfig, PipelineStats, PixelFormat,
    StatsHandle,
};
use tokio_util::sync::CancellationToken;

use crate::media::{
    source::{open_source, FrameSource},
    stream::{FanoutSink, RawFileSink, RawSinkSource, RawSinkWriter},
    types::{DetectorFactory, InputConfig, OutputConfig, OutputDest, PipeConfig},
};

/// Drives one input through a `FramePipeline` into the configured outputs.
pub struct Pipe {
    config: PipeConfig,
    cancel: CancellationToken,
    started: AtomicBool,
    stats: Mutex<Option<StatsHandle>>,
}

impl Pipe {
    pub fn new(config: PipeConfig) -> Self {
        Self {
            config,
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            stats: Mutex::new(None),
        }
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Check if the pipeline has been started
    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Relaxed)
    }

    /// Check if the pipeline has been cancelled
    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn config(&self) -> &PipeConfig {
        &self.config
    }

    /// Live counters of the current (or last) run.
    pub fn stats(&self) -> Option<PipelineStats> {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(StatsHandle::snapshot)
    }

    /// Runs until the input ends or the pipe is cancelled, then drains the
    /// pipeline and returns its final counters.
    pub async fn start(&self) -> anyhow::Result<PipelineStats> {
        if self.started.swap(true, Ordering::Relaxed) {
            log::warn!("Pipe already started");
            anyhow::bail!("pipe already started");
        }

        let result = self.run().await;
        self.started.store(false, Ordering::Relaxed);
        match &result {
            Ok(stats) => log::info!("Pipe: finished, {}", stats),
            Err(e) => log::error!("Pipe: failed: {:#}", e),
        }
        result
    }

    async fn run(&self) -> anyhow::Result<PipelineStats> {
        log::info!("Pipe: starting with input {}", input_name(&self.config.input));

        let source = open_source(&self.config.input)?;
        let pipeline = self.build_pipeline()?;
        *self.stats.lock().unwrap_or_else(PoisonError::into_inner) = Some(pipeline.stats_handle());

        let cancel = self.cancel.clone();
        let interval = self
            .config
            .realtime
            .then(|| Duration::from_secs_f64(1.0 / self.config.pipeline.fps.max(1) as f64));

        tokio::task::spawn_blocking(move || feed_pipeline(source, pipeline, cancel, interval))
            .await
            .context("pipe task")?
    }

    fn build_pipeline(&self) -> anyhow::Result<FramePipeline> {
        let mut sink = FanoutSink::new();
        for output in &self.config.outputs {
            match &output.dest {
                OutputDest::RawFrame { sink: raw } => sink.push(RawSinkWriter(raw.clone())),
                OutputDest::File { path } => sink.push(RawFileSink::new(path.clone())),
            }
        }
        if sink.is_empty() {
            log::warn!("Pipe: no outputs configured, frames are discarded");
        }

        let mut builder = FramePipeline::builder()
            .config(self.config.pipeline)
            .sink(sink);
        if self.config.fps_overlay {
            builder = builder.overlay(FpsOverlay::new(self.config.pipeline.fps));
        }
        if let Some(factory) = self.config.detector.clone() {
            builder = builder.detector(move |index: usize| factory(index));
        }
        builder.start()
    }
}

/// Blocking submit loop, the decoder side of the pipeline.
fn feed_pipeline(
    mut source: Box<dyn FrameSource>,
    mut pipeline: FramePipeline,
    cancel: CancellationToken,
    interval: Option<Duration>,
) -> anyhow::Result<PipelineStats> {
    let mut next_tick = Instant::now();
    let mut fed = Ok(());
    while !cancel.is_cancelled() {
        let frame = match source.next_frame() {
            Ok(Some(frame)) => frame,
            Ok(None) => {
                log::info!("Pipe: end of input");
                break;
            }
            Err(e) => {
                fed = Err(e);
                break;
            }
        };
        if let Err(e) = pipeline.submit(&frame.as_frame_ref()) {
            log::warn!("Pipe: frame rejected: {:#}", e);
        }
        if let Some(interval) = interval {
            next_tick += interval;
            let now = Instant::now();
            if next_tick > now {
                std::thread::sleep(next_tick - now);
            } else {
                next_tick = now;
            }
        }
    }
    if cancel.is_cancelled() {
        log::info!("Pipe: cancelled");
    }

    let stats = pipeline.shutdown()?;
    fed.map(|_| stats)
}

/// Get input name for logging.
pub fn input_name(input: &InputConfig) -> String {
    match input {
        InputConfig::File { path, .. } => path.clone(),
        InputConfig::TestPattern {
            width,
            height,
            format,
            ..
        } => format!("test pattern {}x{} {}", width, height, format),
    }
}

/// Get destination name for logging (used by tests).
pub fn dest_name(dest: &OutputDest) -> String {
    match dest {
        OutputDest::RawFrame { .. } => "RawFrame".to_string(),
        OutputDest::File { path } => path.clone(),
    }
}

impl PipeConfig {
    pub fn builder() -> PipeConfigBuilder {
        PipeConfigBuilder::default()
    }
}

#[derive(Default)]
pub struct PipeConfigBuilder {
    input: Option<InputConfig>,
    outputs: Vec<OutputConfig>,
    pipeline: PipelineConfig,
    no_overlay: bool,
    realtime: bool,
    detector: Option<DetectorFactory>,
}

impl PipeConfigBuilder {
    /// Set raw video file input
    pub fn input_file(
        mut self,
        path: impl Into<String>,
        width: u32,
        height: u32,
        format: PixelFormat,
    ) -> Self {
        self.input = Some(InputConfig::File {
            path: path.into(),
            width,
            height,
            format,
        });
        self
    }

    /// Set synthetic input, `frames == 0` runs until cancelled
    pub fn input_test_pattern(mut self, width: u32, height: u32, frames: u64) -> Self {
        self.input = Some(InputConfig::TestPattern {
            width,
            height,
            format: PixelFormat::Nv12,
            frames,
        });
        self
    }

    pub fn input(mut self, input: InputConfig) -> Self {
        self.input = Some(input);
        self
    }

    /// Add raw frame output
    pub fn add_raw_frame_output(mut self, sink: Arc<RawSinkSource>) -> Self {
        self.outputs.push(OutputConfig {
            dest: OutputDest::RawFrame { sink },
        });
        self
    }

    /// Add raw video file output
    pub fn add_file_output(mut self, path: impl Into<String>) -> Self {
        self.outputs.push(OutputConfig {
            dest: OutputDest::File { path: path.into() },
        });
        self
    }

    pub fn pipeline(mut self, pipeline: PipelineConfig) -> Self {
        self.pipeline = pipeline;
        self
    }

    pub fn workers(mut self, workers: usize) -> Self {
        self.pipeline.workers = workers;
        self
    }

    pub fn fps(mut self, fps: u32) -> Self {
        self.pipeline.fps = fps;
        self
    }

    pub fn stall_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.pipeline.stall_timeout = timeout;
        self
    }

    pub fn box_style(mut self, style: BoxStyle) -> Self {
        self.pipeline.box_style = style;
        self
    }

    pub fn fps_overlay(mut self, enabled: bool) -> Self {
        self.no_overlay = !enabled;
        self
    }

    pub fn realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Install the analysis stage, one detector per worker
    pub fn detector<F>(mut self, factory: F) -> Self
    where
        F: Fn(usize) -> anyhow::Result<Box<dyn Detector>> + Send + Sync + 'static,
    {
        self.detector = Some(Arc::new(factory));
        self
    }

    pub fn build(self) -> anyhow::Result<PipeConfig> {
        Ok(PipeConfig {
            input: self.input.context("input is required")?,
            outputs: self.outputs,
            pipeline: self.pipeline,
            fps_overlay: !self.no_overlay,
            realtime: self.realtime,
            detector: self.detector,
        })
    }
}

#[cfg(test)]
#[path = "pipe_test.rs"]
mod pipe_test;

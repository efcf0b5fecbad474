use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::draw::{Color, Rect, fill_rect};
use crate::frame::Frame;
use crate::pipeline::PipelineCounters;
use crate::reorder::{ReorderBuffer, Released};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StreamInfo {
    pub fps: u32,
}

/// Downstream consumer of ordered frames (encoder, file, channel...).
pub trait FrameSink: Send {
    fn open(&mut self, _info: &StreamInfo) -> anyhow::Result<()> {
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> anyhow::Result<()>;

    fn close(&mut self) -> anyhow::Result<()> {
        Ok(())
    }
}

pub trait Overlay: Send {
    fn draw(&mut self, frame: &mut Frame);

    /// Last measured output rate, if the overlay measures one.
    fn fps(&self) -> Option<f64> {
        None
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct NoOverlay;

impl Overlay for NoOverlay {
    fn draw(&mut self, _frame: &mut Frame) {}
}

/// Frames per second over one-second windows.
#[derive(Debug, Default)]
pub struct FpsCounter {
    window_start: Option<Instant>,
    frames: u32,
    fps: f64,
}

impl FpsCounter {
    const WINDOW: Duration = Duration::from_secs(1);

    pub fn tick(&mut self) -> f64 {
        self.tick_at(Instant::now())
    }

    pub fn tick_at(&mut self, now: Instant) -> f64 {
        let start = *self.window_start.get_or_insert(now);
        self.frames += 1;
        let elapsed = now.saturating_duration_since(start);
        if elapsed >= Self::WINDOW {
            self.fps = self.frames as f64 / elapsed.as_secs_f64();
            self.frames = 0;
            self.window_start = Some(now);
        }
        self.fps
    }

    pub fn fps(&self) -> f64 {
        self.fps
    }
}

/// Draws a translucent panel in the top-left corner with a bar showing the
/// measured rate against the target rate.
pub struct FpsOverlay {
    counter: FpsCounter,
    target_fps: u32,
    panel: Rect,
    background: Color,
    alpha: u8,
    bar: Color,
}

impl FpsOverlay {
    pub fn new(target_fps: u32) -> Self {
        Self {
            counter: FpsCounter::default(),
            target_fps: target_fps.max(1),
            panel: Rect::new(10, 10, 160, 24),
            background: Color::BLACK,
            alpha: 180,
            bar: Color::GREEN,
        }
    }

    pub fn with_panel(mut self, panel: Rect) -> Self {
        self.panel = panel;
        self
    }

    fn gauge(&self, fps: f64) -> Rect {
        let inner = (self.panel.width - 8).max(0);
        let ratio = (fps / self.target_fps as f64).clamp(0.0, 1.0);
        let width = (inner as f64 * ratio).round() as i32;
        Rect::new(self.panel.x + 4, self.panel.y + 4, width, (self.panel.height - 8).max(0))
    }

    fn paint(&self, frame: &mut Frame, fps: f64) {
        let geometry = frame.geometry;
        fill_rect(&mut frame.data, &geometry, self.panel, self.background, self.alpha);
        fill_rect(&mut frame.data, &geometry, self.gauge(fps), self.bar, 255);
    }
}

impl Overlay for FpsOverlay {
    fn draw(&mut self, frame: &mut Frame) {
        let fps = self.counter.tick();
        self.paint(frame, fps);
    }

    fn fps(&self) -> Option<f64> {
        Some(self.counter.fps())
    }
}

/// Spawns the `frame-sink` thread. It pulls frames in sequence order until
/// the reorder buffer is closed and drained, then closes the sink.
pub(crate) fn spawn_sink_stage(
    reorder: Arc<ReorderBuffer>,
    mut sink: Box<dyn FrameSink>,
    mut overlay: Box<dyn Overlay>,
    counters: Arc<PipelineCounters>,
) -> anyhow::Result<JoinHandle<anyhow::Result<()>>> {
    let thread = std::thread::Builder::new()
        .name("frame-sink".to_string())
        .spawn(move || {
            log::debug!("Sink: started");
            while let Some(released) = reorder.next() {
                match released {
                    Released::Frame(mut frame) => {
                        overlay.draw(&mut frame);
                        if let Some(fps) = overlay.fps() {
                            counters.set_fps(fps);
                        }
                        match sink.write(&frame) {
                            Ok(()) => {
                                counters.forwarded.fetch_add(1, Ordering::Relaxed);
                            }
                            Err(e) => {
                                counters.sink_errors.fetch_add(1, Ordering::Relaxed);
                                log::warn!("Sink: write of frame {} failed: {:#}", frame.seq, e);
                            }
                        }
                    }
                    Released::Gap(seq) => {
                        counters.gaps.fetch_add(1, Ordering::Relaxed);
                        log::warn!("Sink: frame {} skipped", seq);
                    }
                }
            }
            log::debug!("Sink: reorder buffer drained, closing");
            sink.close()
        })?;
    Ok(thread)
}

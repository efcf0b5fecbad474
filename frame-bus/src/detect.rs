use crate::buffer::FrameBuffer;
use crate::draw::{Color, Rect, stroke_rect};

#[derive(Clone, Debug, PartialEq)]
pub struct Detection {
    pub class_id: i32,
    pub confidence: f32,
    pub left: i32,
    pub top: i32,
    pub right: i32,
    pub bottom: i32,
}

impl Detection {
    pub fn new(class_id: i32, confidence: f32, left: i32, top: i32, right: i32, bottom: i32) -> Self {
        Self {
            class_id,
            confidence,
            left,
            top,
            right,
            bottom,
        }
    }
}

/// Per-worker analysis step. Each worker owns its own detector, so
/// implementations need `Send` but not `Sync`.
pub trait Detector: Send {
    fn detect(&mut self, frame: &FrameBuffer) -> anyhow::Result<Vec<Detection>>;
}

impl<F> Detector for F
where
    F: FnMut(&FrameBuffer) -> anyhow::Result<Vec<Detection>> + Send,
{
    fn detect(&mut self, frame: &FrameBuffer) -> anyhow::Result<Vec<Detection>> {
        self(frame)
    }
}

/// Finds nothing. Frames still travel through the worker path.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullDetector;

impl Detector for NullDetector {
    fn detect(&mut self, _frame: &FrameBuffer) -> anyhow::Result<Vec<Detection>> {
        Ok(Vec::new())
    }
}

#[derive(Clone, Copy, Debug)]
pub struct BoxStyle {
    pub color: Color,
    pub thickness: i32,
}

impl Default for BoxStyle {
    fn default() -> Self {
        Self {
            color: Color::rgb(255, 100, 100),
            thickness: 2,
        }
    }
}

pub fn draw_detections(buffer: &mut FrameBuffer, detections: &[Detection], style: &BoxStyle) {
    let geometry = *buffer.geometry();
    let max_x = geometry.width as i32 - 1;
    let max_y = geometry.height as i32 - 1;
    for det in detections {
        let left = det.left.clamp(0, max_x);
        let top = det.top.clamp(0, max_y);
        let right = det.right.clamp(0, max_x);
        let bottom = det.bottom.clamp(0, max_y);
        if right < left || bottom < top {
            log::debug!("skip degenerate detection {:?}", det);
            continue;
        }
        let rect = Rect::new(left, top, right - left + 1, bottom - top + 1);
        stroke_rect(buffer.data_mut(), &geometry, rect, style.color, style.thickness);
    }
}

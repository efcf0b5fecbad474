#![allow(dead_code)]

pub mod buffer;
pub mod detect;
pub mod dispatcher;
pub mod draw;
pub mod frame;
pub mod pipeline;
pub mod reorder;
pub mod sink;
pub mod worker;

pub use buffer::{BufferPool, DeviceAllocator, FrameBuffer, HeapAllocator};
pub use detect::{BoxStyle, Detection, Detector, NullDetector};
pub use dispatcher::{Route, Submitted};
pub use draw::Color;
pub use frame::{Frame, FrameGeometry, FrameRef, PixelFormat};
pub use pipeline::{FramePipeline, PipelineConfig, PipelineStats, StatsHandle};
pub use sink::{FpsOverlay, FrameSink, NoOverlay, Overlay, StreamInfo};

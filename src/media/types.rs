use std::fmt::{Display, Formatter};
use std::sync::Arc;

use bytes::Bytes;
use frame_bus::{Detector, Frame, PipelineConfig, PixelFormat};

use crate::media::stream::RawSinkSource;

/// Input configuration
#[derive(Clone, Debug, PartialEq)]
pub enum InputConfig {
    /// Raw video file, frames of one geometry back to back
    File {
        path: String,
        width: u32,
        height: u32,
        format: PixelFormat,
    },
    /// Synthetic moving gradient, `frames == 0` runs until cancelled
    TestPattern {
        width: u32,
        height: u32,
        format: PixelFormat,
        frames: u64,
    },
}

/// Output destination
#[derive(Clone)]
pub enum OutputDest {
    /// Annotated frames delivered to an in-process consumer
    RawFrame { sink: Arc<RawSinkSource> },
    /// Annotated frames appended to a raw video file
    File { path: String },
}

/// Configuration for a single output
#[derive(Clone)]
pub struct OutputConfig {
    pub dest: OutputDest,
}

/// Builds the detector for worker `index`; shared by every run of the pipe.
pub type DetectorFactory = Arc<dyn Fn(usize) -> anyhow::Result<Box<dyn Detector>> + Send + Sync>;

/// Pipe configuration
#[derive(Clone)]
pub struct PipeConfig {
    pub input: InputConfig,
    pub outputs: Vec<OutputConfig>,
    pub pipeline: PipelineConfig,
    pub fps_overlay: bool,
    /// Feed the pipeline at `pipeline.fps` instead of as fast as possible
    pub realtime: bool,
    /// Without one, frames pass through the workers unannotated and
    /// `pipeline.box_style` has no effect.
    pub detector: Option<DetectorFactory>,
}

#[derive(Clone, Debug)]
pub struct VideoRawFrame {
    pub data: Bytes,
    pub width: u32,
    pub height: u32,
    pub width_stride: u32,
    pub height_stride: u32,
    pub format: PixelFormat,
    pub seq: u64,
    pub pts: i64,
    pub analyzed: bool,
}

impl VideoRawFrame {
    pub fn from_frame(frame: &Frame) -> Self {
        Self {
            data: Bytes::copy_from_slice(&frame.data),
            width: frame.geometry.width,
            height: frame.geometry.height,
            width_stride: frame.geometry.width_stride,
            height_stride: frame.geometry.height_stride,
            format: frame.geometry.format,
            seq: frame.seq,
            pts: frame.pts,
            analyzed: frame.analyzed,
        }
    }

    pub fn data(&self) -> &[u8] {
        &self.data
    }
}

impl Display for VideoRawFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> Result<(), std::fmt::Error> {
        write!(
            f,
            "VideoRawFrame {{ seq: {}, {}x{} {}, data: {} }}",
            self.seq,
            self.width,
            self.height,
            self.format,
            self.data.len()
        )
    }
}

//! Application side of the detection pipeline.
//!
//! Data Flow:
//! ```text
//! FrameSource ──► Pipe (spawn_blocking) ──► FramePipeline ──► FanoutSink ─┬─► RawSinkSource (Stream)
//!  (file / test pattern)                    (frame-bus)                   └─► RawFileSink
//! ```

pub mod pipe;
pub mod source;
pub mod stream;
pub mod types;

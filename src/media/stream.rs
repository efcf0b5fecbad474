use futures::{Sink, Stream};
use std::{
    fs::File,
    io::{BufWriter, Write},
    pin::Pin,
    sync::{Arc, Mutex, PoisonError},
    task::{Context, Poll},
};

use anyhow::Context as _;
use frame_bus::{Frame, FrameSink, StreamInfo};
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::PollSender;

use crate::media::types::VideoRawFrame;

/// Channel between the pipeline's sink thread and an async consumer.
pub struct RawSinkSource {
    pub writer: tokio::sync::mpsc::Sender<VideoRawFrame>,
    sender: Mutex<PollSender<VideoRawFrame>>,
    inner: Mutex<tokio::sync::mpsc::Receiver<VideoRawFrame>>,
}

impl RawSinkSource {
    pub fn new() -> Self {
        Self::with_capacity(32)
    }

    pub fn with_capacity(buffer_size: usize) -> Self {
        let (writer, receiver) = tokio::sync::mpsc::channel(buffer_size);
        Self {
            sender: Mutex::new(PollSender::new(writer.clone())),
            writer,
            inner: Mutex::new(receiver),
        }
    }

    fn poll_sender(self: Pin<&mut Self>) -> &mut PollSender<VideoRawFrame> {
        self.get_mut()
            .sender
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn poll_frame(&self, cx: &mut Context<'_>) -> Poll<Option<VideoRawFrame>> {
        let mut guard = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        guard.poll_recv(cx)
    }

    /// Returns a stream that yields VideoRawFrame. Use this when you have `Arc<RawSinkSource>`.
    pub fn as_stream(this: Arc<Self>) -> RawSinkSourceStream {
        RawSinkSourceStream(this)
    }
}

impl Default for RawSinkSource {
    fn default() -> Self {
        Self::new()
    }
}

impl Stream for RawSinkSource {
    type Item = VideoRawFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.poll_frame(cx)
    }
}

/// Wrapper to use `Arc<RawSinkSource>` as Stream (orphan rule workaround).
pub struct RawSinkSourceStream(pub Arc<RawSinkSource>);

impl Stream for RawSinkSourceStream {
    type Item = VideoRawFrame;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.0.poll_frame(cx)
    }
}

/// Async producer side. Waits for channel capacity instead of failing.
impl Sink<VideoRawFrame> for RawSinkSource {
    type Error = std::io::Error;

    fn poll_ready(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.poll_sender().poll_reserve(cx).map_err(|_| closed())
    }

    fn start_send(self: Pin<&mut Self>, item: VideoRawFrame) -> Result<(), Self::Error> {
        self.poll_sender().send_item(item).map_err(|_| closed())
    }

    fn poll_flush(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn poll_close(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.poll_sender().close();
        Poll::Ready(Ok(()))
    }
}

fn closed() -> std::io::Error {
    std::io::Error::new(std::io::ErrorKind::BrokenPipe, "channel closed")
}

/// Pipeline sink feeding a `RawSinkSource`. Never blocks the sink thread: a
/// full channel drops the frame and reports a write error.
pub struct RawSinkWriter(pub Arc<RawSinkSource>);

impl FrameSink for RawSinkWriter {
    fn write(&mut self, frame: &Frame) -> anyhow::Result<()> {
        match self.0.writer.try_send(VideoRawFrame::from_frame(frame)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => {
                anyhow::bail!("raw consumer lagging, frame {} dropped", frame.seq)
            }
            Err(TrySendError::Closed(_)) => {
                anyhow::bail!("raw consumer gone, frame {} dropped", frame.seq)
            }
        }
    }
}

/// Appends the full buffer of every frame to a file.
pub struct RawFileSink {
    path: String,
    file: Option<BufWriter<File>>,
}

impl RawFileSink {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            file: None,
        }
    }
}

impl FrameSink for RawFileSink {
    fn open(&mut self, info: &StreamInfo) -> anyhow::Result<()> {
        let file = File::create(&self.path).with_context(|| format!("create {}", self.path))?;
        log::info!("RawFileSink: writing {} ({} fps)", self.path, info.fps);
        self.file = Some(BufWriter::new(file));
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let file = self
            .file
            .as_mut()
            .with_context(|| format!("{} is not open", self.path))?;
        file.write_all(&frame.data)
            .with_context(|| format!("write frame {} to {}", frame.seq, self.path))
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let Some(mut file) = self.file.take() {
            file.flush().with_context(|| format!("flush {}", self.path))?;
        }
        Ok(())
    }
}

/// Delivers every frame to several sinks.
#[derive(Default)]
pub struct FanoutSink {
    sinks: Vec<Box<dyn FrameSink>>,
}

impl FanoutSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, sink: impl FrameSink + 'static) {
        self.sinks.push(Box::new(sink));
    }

    pub fn len(&self) -> usize {
        self.sinks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sinks.is_empty()
    }
}

impl FrameSink for FanoutSink {
    fn open(&mut self, info: &StreamInfo) -> anyhow::Result<()> {
        for (i, sink) in self.sinks.iter_mut().enumerate() {
            sink.open(info).with_context(|| format!("open output {}", i))?;
        }
        Ok(())
    }

    /// Every sink sees the frame even if an earlier one fails.
    fn write(&mut self, frame: &Frame) -> anyhow::Result<()> {
        let mut first_error = None;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.write(frame) {
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        let mut first_error = None;
        for sink in self.sinks.iter_mut() {
            if let Err(e) = sink.close() {
                log::warn!("FanoutSink: close failed: {:#}", e);
                first_error.get_or_insert(e);
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use super::*;
use crate::buffer::{DeviceAllocator, FrameBuffer};
use crate::detect::Detection;
use crate::dispatcher::Route;
use crate::frame::{FrameGeometry, PixelFormat};

const WIDTH: u32 = 16;
const HEIGHT: u32 = 16;

/// Records every frame the pipeline delivers.
#[derive(Clone, Default)]
struct CollectSink {
    frames: Arc<Mutex<Vec<Frame>>>,
    fail_open: bool,
    fail_on_seq: Option<u64>,
}

impl CollectSink {
    fn seqs(&self) -> Vec<u64> {
        self.frames.lock().unwrap().iter().map(|f| f.seq).collect()
    }
}

impl FrameSink for CollectSink {
    fn open(&mut self, info: &StreamInfo) -> anyhow::Result<()> {
        if self.fail_open {
            anyhow::bail!("encoder init failed at {} fps", info.fps);
        }
        Ok(())
    }

    fn write(&mut self, frame: &Frame) -> anyhow::Result<()> {
        if self.fail_on_seq == Some(frame.seq) {
            anyhow::bail!("write error on {}", frame.seq);
        }
        self.frames.lock().unwrap().push(frame.clone());
        Ok(())
    }
}

/// RGB frame whose every byte is the low byte of `tag`.
fn frame_data(tag: u64) -> Vec<u8> {
    vec![tag as u8; (WIDTH * HEIGHT * 3) as usize]
}

fn frame_ref(data: &[u8]) -> FrameRef<'_> {
    FrameRef::new(data, WIDTH, HEIGHT, PixelFormat::Rgb24)
}

fn tag_of(buffer: &FrameBuffer) -> u64 {
    buffer.data()[0] as u64
}

/// Detector that sleeps `latency(tag)` and records completion order.
fn sleeping_detector(
    latency: fn(u64) -> Duration,
    completed: Arc<Mutex<Vec<u64>>>,
) -> impl FnMut(usize) -> anyhow::Result<Box<dyn Detector>> {
    move |_: usize| {
        let completed = completed.clone();
        let detector = move |buffer: &FrameBuffer| -> anyhow::Result<Vec<Detection>> {
            let tag = tag_of(buffer);
            std::thread::sleep(latency(tag));
            completed.lock().unwrap().push(tag);
            Ok(Vec::new())
        };
        Ok(Box::new(detector) as Box<dyn Detector>)
    }
}

fn wait_idle(pipeline: &FramePipeline) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while pipeline.busy_workers() > 0 {
        assert!(Instant::now() < deadline, "workers never became idle");
        std::thread::sleep(Duration::from_millis(1));
    }
}

#[test]
fn test_reversed_completion_keeps_order() -> anyhow::Result<()> {
    let sink = CollectSink::default();
    let completed = Arc::new(Mutex::new(Vec::new()));
    let latency: fn(u64) -> Duration = |tag| match tag {
        0 => Duration::from_millis(150),
        _ => Duration::from_millis(10),
    };
    let mut pipeline = FramePipeline::builder()
        .workers(2)
        .detector(sleeping_detector(latency, completed.clone()))
        .sink(sink.clone())
        .start()?;

    let mut routes = Vec::new();
    for seq in 0..5u64 {
        let data = frame_data(seq);
        routes.push(pipeline.submit(&frame_ref(&data))?);
    }
    let stats = pipeline.shutdown()?;

    assert_eq!(routes[0], Submitted { seq: 0, route: Route::Worker(0) });
    assert_eq!(routes[1], Submitted { seq: 1, route: Route::Worker(1) });
    assert_eq!(completed.lock().unwrap()[0], 1);
    assert_eq!(sink.seqs(), vec![0, 1, 2, 3, 4]);
    assert_eq!(stats.forwarded, 5);
    assert_eq!(stats.submitted, 5);
    Ok(())
}

#[test]
fn test_saturated_workers_use_fallback() -> anyhow::Result<()> {
    let sink = CollectSink::default();
    let completed = Arc::new(Mutex::new(Vec::new()));
    let latency: fn(u64) -> Duration = |tag| {
        if tag % 2 == 0 {
            Duration::from_millis(60)
        } else {
            Duration::from_millis(1)
        }
    };
    let mut pipeline = FramePipeline::builder()
        .workers(2)
        .detector(sleeping_detector(latency, completed))
        .sink(sink.clone())
        .start()?;

    let mut fallbacks = 0;
    for seq in 0..10u64 {
        let data = frame_data(seq);
        if pipeline.submit(&frame_ref(&data))?.route == Route::Fallback {
            fallbacks += 1;
        }
        std::thread::sleep(Duration::from_millis(5));
    }
    let stats = pipeline.shutdown()?;

    assert!(fallbacks > 0);
    assert_eq!(stats.fallbacks, fallbacks);
    assert_eq!(stats.dispatched + stats.fallbacks, 10);
    assert_eq!(sink.seqs(), (0..10).collect::<Vec<_>>());
    // fallback frames skip analysis, worker frames do not
    let frames = sink.frames.lock().unwrap();
    assert_eq!(
        frames.iter().filter(|f| !f.analyzed).count() as u64,
        stats.fallbacks
    );
    Ok(())
}

#[test]
fn test_fully_reversed_completion_with_one_worker_per_frame() -> anyhow::Result<()> {
    let sink = CollectSink::default();
    let completed = Arc::new(Mutex::new(Vec::new()));
    let latency: fn(u64) -> Duration = |tag| Duration::from_millis((4 - tag) * 40);
    let mut pipeline = FramePipeline::builder()
        .workers(4)
        .detector(sleeping_detector(latency, completed.clone()))
        .sink(sink.clone())
        .start()?;

    for seq in 0..4u64 {
        let data = frame_data(seq);
        let submitted = pipeline.submit(&frame_ref(&data))?;
        assert_eq!(submitted.route, Route::Worker(seq as usize));
    }
    let stats = pipeline.shutdown()?;

    assert_eq!(*completed.lock().unwrap(), vec![3, 2, 1, 0]);
    assert_eq!(sink.seqs(), vec![0, 1, 2, 3]);
    assert_eq!(stats.fallbacks, 0);
    Ok(())
}

#[test]
fn test_bounded_concurrency() -> anyhow::Result<()> {
    let workers = 3;
    let active = Arc::new(AtomicUsize::new(0));
    let peak = Arc::new(AtomicUsize::new(0));
    let sink = CollectSink::default();

    let factory = {
        let active = active.clone();
        let peak = peak.clone();
        move |_: usize| -> anyhow::Result<Box<dyn Detector>> {
            let active = active.clone();
            let peak = peak.clone();
            let detector = move |_: &FrameBuffer| -> anyhow::Result<Vec<Detection>> {
                let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                peak.fetch_max(now, Ordering::SeqCst);
                std::thread::sleep(Duration::from_millis(3));
                active.fetch_sub(1, Ordering::SeqCst);
                Ok(Vec::new())
            };
            Ok(Box::new(detector) as Box<dyn Detector>)
        }
    };
    let mut pipeline = FramePipeline::builder()
        .workers(workers)
        .detector(factory)
        .sink(sink.clone())
        .start()?;

    for seq in 0..50u64 {
        let data = frame_data(seq);
        pipeline.submit(&frame_ref(&data))?;
        assert!(pipeline.busy_workers() <= workers);
        std::thread::sleep(Duration::from_micros(500));
    }
    let stats = pipeline.shutdown()?;

    assert!(peak.load(Ordering::SeqCst) <= workers);
    assert!(stats.dispatched > 0);
    assert_eq!(stats.forwarded, 50);
    assert_eq!(sink.seqs(), (0..50).collect::<Vec<_>>());
    Ok(())
}

#[derive(Default)]
struct CountingAllocator {
    allocations: AtomicUsize,
}

impl DeviceAllocator for CountingAllocator {
    fn allocate(&self, size: usize) -> anyhow::Result<Vec<u8>> {
        self.allocations.fetch_add(1, Ordering::SeqCst);
        Ok(vec![0; size])
    }
}

#[test]
fn test_buffer_reallocated_only_on_size_change() -> anyhow::Result<()> {
    let allocator = Arc::new(CountingAllocator::default());
    let sink = CollectSink::default();
    let mut pipeline = FramePipeline::builder()
        .workers(1)
        .allocator(allocator.clone())
        .sink(sink.clone())
        .start()?;

    for _ in 0..5 {
        let data = frame_data(1);
        let submitted = pipeline.submit(&frame_ref(&data))?;
        assert_eq!(submitted.route, Route::Worker(0));
        wait_idle(&pipeline);
    }
    assert_eq!(allocator.allocations.load(Ordering::SeqCst), 1);

    let large = vec![2u8; 32 * 32 * 3];
    for _ in 0..3 {
        let frame = FrameRef::new(&large, 32, 32, PixelFormat::Rgb24);
        pipeline.submit(&frame)?;
        wait_idle(&pipeline);
    }
    assert_eq!(allocator.allocations.load(Ordering::SeqCst), 2);

    let stats = pipeline.shutdown()?;
    assert_eq!(stats.forwarded, 8);
    let frames = sink.frames.lock().unwrap();
    assert_eq!(frames[7].width(), 32);
    assert_eq!(frames[7].geometry.width_stride, 32);
    Ok(())
}

/// Fails the next `fail_next` allocations, then hands out heap memory.
#[derive(Default)]
struct ScriptedAllocator {
    failures: AtomicUsize,
}

impl ScriptedAllocator {
    fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }
}

impl DeviceAllocator for ScriptedAllocator {
    fn allocate(&self, size: usize) -> anyhow::Result<Vec<u8>> {
        let failing = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            anyhow::bail!("no device memory for {} bytes", size);
        }
        Ok(vec![0; size])
    }
}

#[test]
fn test_allocation_failure_falls_back_in_order() -> anyhow::Result<()> {
    let allocator = Arc::new(ScriptedAllocator::default());
    let sink = CollectSink::default();
    let mut pipeline = FramePipeline::builder()
        .workers(2)
        .allocator(allocator.clone())
        .sink(sink.clone())
        .start()?;

    for seq in 0..6u64 {
        // both worker buffers fail, the fallback copy succeeds
        allocator.fail_next(2);
        let data = frame_data(seq);
        let submitted = pipeline.submit(&frame_ref(&data))?;
        assert_eq!(submitted.route, Route::Fallback);
    }
    let stats = pipeline.shutdown()?;

    assert_eq!(stats.allocation_failures, 12);
    assert_eq!(stats.fallbacks, 6);
    assert_eq!(stats.gaps, 0);
    assert_eq!(sink.seqs(), (0..6).collect::<Vec<_>>());
    let frames = sink.frames.lock().unwrap();
    assert!(frames.iter().all(|f| f.data[0] == f.seq as u8));
    Ok(())
}

#[test]
fn test_fallback_allocation_failure_leaves_gap() -> anyhow::Result<()> {
    let allocator = Arc::new(ScriptedAllocator::default());
    let sink = CollectSink::default();
    let mut pipeline = FramePipeline::builder()
        .workers(1)
        .allocator(allocator.clone())
        .sink(sink.clone())
        .start()?;

    let first = frame_data(0);
    assert_eq!(pipeline.submit(&frame_ref(&first))?.route, Route::Worker(0));
    wait_idle(&pipeline);

    // a new size forces a worker reallocation; it and the fallback copy fail
    allocator.fail_next(2);
    let large = vec![1u8; 32 * 32 * 3];
    let dropped = pipeline.submit(&FrameRef::new(&large, 32, 32, PixelFormat::Rgb24))?;
    assert_eq!(dropped, Submitted { seq: 1, route: Route::Dropped });

    let last = frame_data(2);
    assert_eq!(pipeline.submit(&frame_ref(&last))?.route, Route::Worker(0));
    let stats = pipeline.shutdown()?;

    assert_eq!(stats.submitted, 3);
    assert_eq!(stats.allocation_failures, 2);
    assert_eq!(stats.fallbacks, 1);
    assert_eq!(stats.gaps, 1);
    assert_eq!(stats.forwarded, 2);
    assert_eq!(sink.seqs(), vec![0, 2]);
    Ok(())
}

#[test]
fn test_unaligned_frames_share_one_layout() -> anyhow::Result<()> {
    let sink = CollectSink::default();
    let completed = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = FramePipeline::builder()
        .workers(1)
        .detector(sleeping_detector(|_| Duration::from_millis(100), completed))
        .sink(sink.clone())
        .start()?;

    // 20x10 nv12 is 300 bytes packed, 32x16 strides once aligned
    let mut routes = Vec::new();
    for tag in [5u8, 6] {
        let data = vec![tag; 300];
        let frame = FrameRef::new(&data, 20, 10, PixelFormat::Nv12);
        routes.push(pipeline.submit(&frame)?.route);
    }
    let stats = pipeline.shutdown()?;

    assert_eq!(routes, vec![Route::Worker(0), Route::Fallback]);
    assert_eq!(stats.forwarded, 2);
    let frames = sink.frames.lock().unwrap();
    let expected = FrameGeometry::aligned(20, 10, PixelFormat::Nv12)?;
    for (frame, tag) in frames.iter().zip([5u8, 6]) {
        assert_eq!(frame.geometry, expected);
        assert_eq!(frame.data.len(), 32 * 16 * 3 / 2);
        // second luma row starts one aligned stride in
        assert!(frame.data[32..52].iter().all(|&b| b == tag));
        assert!(frame.data[52..64].iter().all(|&b| b == 0));
        let uv = 32 * 16;
        assert!(frame.data[uv..uv + 20].iter().all(|&b| b == tag));
    }
    Ok(())
}

#[test]
fn test_analysis_failure_forwards_unchanged_frame() -> anyhow::Result<()> {
    let sink = CollectSink::default();
    let mut pipeline = FramePipeline::builder()
        .workers(1)
        .detector(|_| {
            let detector = |buffer: &FrameBuffer| -> anyhow::Result<Vec<Detection>> {
                if tag_of(buffer) == 7 {
                    anyhow::bail!("inference failed");
                }
                Ok(vec![Detection::new(0, 0.8, 2, 2, 9, 9)])
            };
            Ok(Box::new(detector) as Box<dyn Detector>)
        })
        .sink(sink.clone())
        .start()?;

    let failing = frame_data(7);
    let annotated = frame_data(9);
    pipeline.submit(&frame_ref(&failing))?;
    wait_idle(&pipeline);
    pipeline.submit(&frame_ref(&annotated))?;
    let stats = pipeline.shutdown()?;

    assert_eq!(stats.analysis_failures, 1);
    assert_eq!(stats.forwarded, 2);
    let frames = sink.frames.lock().unwrap();
    assert!(!frames[0].analyzed);
    assert_eq!(frames[0].data, failing);
    assert!(frames[1].analyzed);
    assert_ne!(frames[1].data, annotated);
    Ok(())
}

#[test]
fn test_sink_open_failure_fails_start() {
    let sink = CollectSink {
        fail_open: true,
        ..Default::default()
    };
    let result = FramePipeline::builder().sink(sink).start();
    assert!(result.is_err());
}

#[test]
fn test_start_rejects_zero_workers_and_missing_sink() {
    assert!(FramePipeline::builder().workers(0).sink(CollectSink::default()).start().is_err());
    assert!(FramePipeline::builder().start().is_err());
}

#[test]
fn test_sink_write_errors_are_counted() -> anyhow::Result<()> {
    let sink = CollectSink {
        fail_on_seq: Some(2),
        ..Default::default()
    };
    let mut pipeline = FramePipeline::builder().workers(1).sink(sink.clone()).start()?;
    for seq in 0..4u64 {
        let data = frame_data(seq);
        pipeline.submit(&frame_ref(&data))?;
    }
    let stats = pipeline.shutdown()?;

    assert_eq!(stats.sink_errors, 1);
    assert_eq!(stats.forwarded, 3);
    assert_eq!(sink.seqs(), vec![0, 1, 3]);
    Ok(())
}

#[test]
fn test_invalid_frame_consumes_no_sequence() -> anyhow::Result<()> {
    let sink = CollectSink::default();
    let mut pipeline = FramePipeline::builder().sink(sink.clone()).start()?;

    let short = vec![0u8; 10];
    assert!(pipeline.submit(&frame_ref(&short)).is_err());
    assert_eq!(pipeline.next_seq(), 0);

    let data = frame_data(0);
    assert_eq!(pipeline.submit(&frame_ref(&data))?.seq, 0);
    pipeline.shutdown()?;
    assert_eq!(sink.seqs(), vec![0]);
    Ok(())
}

#[test]
fn test_shutdown_drains_and_rejects_late_frames() -> anyhow::Result<()> {
    let sink = CollectSink::default();
    let completed = Arc::new(Mutex::new(Vec::new()));
    let mut pipeline = FramePipeline::builder()
        .workers(2)
        .detector(sleeping_detector(|_| Duration::from_millis(30), completed))
        .sink(sink.clone())
        .start()?;

    for seq in 0..4u64 {
        let data = frame_data(seq);
        pipeline.submit(&frame_ref(&data))?;
    }
    pipeline.cancel_token().cancel();
    let late = frame_data(99);
    assert!(pipeline.submit(&frame_ref(&late)).is_err());

    let started = Instant::now();
    let stats = pipeline.shutdown()?;
    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(stats.forwarded, 4);
    assert_eq!(stats.submitted, 4);
    assert_eq!(sink.seqs(), vec![0, 1, 2, 3]);
    Ok(())
}

#[test]
fn test_drop_without_shutdown_stops_threads() -> anyhow::Result<()> {
    let sink = CollectSink::default();
    let mut pipeline = FramePipeline::builder().workers(2).sink(sink.clone()).start()?;
    let stats = pipeline.stats_handle();
    let data = frame_data(0);
    pipeline.submit(&frame_ref(&data))?;
    drop(pipeline);

    assert_eq!(stats.snapshot().forwarded, 1);
    assert_eq!(sink.seqs(), vec![0]);
    Ok(())
}

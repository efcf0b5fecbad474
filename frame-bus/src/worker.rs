use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::JoinHandle;

use crossbeam_channel::{Receiver, Sender, TryRecvError, TrySendError};

use crate::buffer::{BufferPool, FrameBuffer};
use crate::detect::{BoxStyle, Detector, draw_detections};

/// One frame handed to a worker. The pool travels with the job and comes
/// back through the worker's return channel once the completion ran.
pub struct Job {
    pub seq: u64,
    pub pts: i64,
    pub pool: BufferPool,
}

pub struct Completion<'a> {
    pub worker: usize,
    pub seq: u64,
    pub pts: i64,
    /// `None` only if a job arrived without a buffer
    pub buffer: Option<&'a FrameBuffer>,
    /// false when analysis failed and the buffer is forwarded unchanged
    pub analyzed: bool,
}

/// Runs on the worker thread after every job, success or not, before the
/// worker is marked idle again.
pub type CompletionCallback = Arc<dyn Fn(Completion<'_>) + Send + Sync>;

pub fn completion_callback<F>(f: F) -> CompletionCallback
where
    F: Fn(Completion<'_>) + Send + Sync + 'static,
{
    Arc::new(f)
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum WorkerState {
    Idle,
    Busy,
    Stopped,
}

pub struct WorkerHandle {
    index: usize,
    busy: Arc<AtomicBool>,
    stopped: Arc<AtomicBool>,
    job_tx: Option<Sender<Job>>,
    return_rx: Receiver<BufferPool>,
    pool: Option<BufferPool>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerHandle {
    pub fn spawn(
        index: usize,
        detector: Box<dyn Detector>,
        style: BoxStyle,
        pool: BufferPool,
        callback: CompletionCallback,
    ) -> anyhow::Result<Self> {
        let (job_tx, job_rx) = crossbeam_channel::bounded::<Job>(1);
        let (return_tx, return_rx) = crossbeam_channel::bounded::<BufferPool>(1);
        let busy = Arc::new(AtomicBool::new(false));
        let stopped = Arc::new(AtomicBool::new(false));

        let thread = {
            let busy = busy.clone();
            let stopped = stopped.clone();
            std::thread::Builder::new()
                .name(format!("analysis-{}", index))
                .spawn(move || {
                    worker_loop(index, detector, style, job_rx, return_tx, &busy, callback);
                    stopped.store(true, Ordering::Release);
                })?
        };

        Ok(Self {
            index,
            busy,
            stopped,
            job_tx: Some(job_tx),
            return_rx,
            pool: Some(pool),
            thread: Some(thread),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn is_busy(&self) -> bool {
        self.busy.load(Ordering::Acquire)
    }

    pub fn state(&self) -> WorkerState {
        if self.stopped.load(Ordering::Acquire) || self.job_tx.is_none() {
            WorkerState::Stopped
        } else if self.is_busy() {
            WorkerState::Busy
        } else {
            WorkerState::Idle
        }
    }

    /// Takes the worker's buffer pool if the worker is idle. The pool is
    /// either still held here or waiting in the return channel.
    pub fn try_claim(&mut self) -> Option<BufferPool> {
        if self.job_tx.is_none() || self.is_busy() {
            return None;
        }
        if let Some(pool) = self.pool.take() {
            return Some(pool);
        }
        match self.return_rx.try_recv() {
            Ok(pool) => Some(pool),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => {
                log::warn!("Worker {}: return channel closed", self.index);
                None
            }
        }
    }

    /// Gives back a pool obtained from `try_claim` without running a job.
    pub fn restore(&mut self, pool: BufferPool) {
        self.pool = Some(pool);
    }

    pub fn dispatch(&mut self, job: Job) -> anyhow::Result<()> {
        let Some(job_tx) = self.job_tx.as_ref() else {
            self.pool = Some(job.pool);
            anyhow::bail!("worker {} is stopped", self.index);
        };

        self.busy.store(true, Ordering::Release);
        match job_tx.try_send(job) {
            Ok(()) => Ok(()),
            Err(e) => {
                self.busy.store(false, Ordering::Release);
                let full = matches!(e, TrySendError::Full(_));
                self.pool = Some(e.into_inner().pool);
                if full {
                    anyhow::bail!("worker {} still has a pending job", self.index)
                }
                anyhow::bail!("worker {} has exited", self.index)
            }
        }
    }

    /// Closes the job channel; the worker finishes its current job and exits.
    pub fn stop(&mut self) {
        self.job_tx.take();
    }

    pub fn join(&mut self) -> anyhow::Result<()> {
        self.stop();
        if let Some(thread) = self.thread.take() {
            thread
                .join()
                .map_err(|_| anyhow::anyhow!("analysis worker {} panicked", self.index))?;
        }
        Ok(())
    }
}

impl Drop for WorkerHandle {
    fn drop(&mut self) {
        if let Err(e) = self.join() {
            log::error!("Worker {}: {:#}", self.index, e);
        }
    }
}

fn worker_loop(
    index: usize,
    mut detector: Box<dyn Detector>,
    style: BoxStyle,
    job_rx: Receiver<Job>,
    return_tx: Sender<BufferPool>,
    busy: &AtomicBool,
    callback: CompletionCallback,
) {
    log::debug!("Worker {}: started", index);
    while let Ok(mut job) = job_rx.recv() {
        let analyzed = match job.pool.buffer_mut() {
            Some(buffer) => {
                let result = catch_unwind(AssertUnwindSafe(|| detector.detect(buffer)));
                match result {
                    Ok(Ok(detections)) => {
                        draw_detections(buffer, &detections, &style);
                        true
                    }
                    Ok(Err(e)) => {
                        log::warn!("Worker {}: analysis of frame {} failed: {:#}", index, job.seq, e);
                        false
                    }
                    Err(_) => {
                        log::error!("Worker {}: detector panicked on frame {}", index, job.seq);
                        false
                    }
                }
            }
            None => {
                log::error!("Worker {}: frame {} arrived without a buffer", index, job.seq);
                false
            }
        };

        callback(Completion {
            worker: index,
            seq: job.seq,
            pts: job.pts,
            buffer: job.pool.buffer(),
            analyzed,
        });

        // the pool must be back before the worker reads as idle
        if return_tx.send(job.pool).is_err() {
            log::warn!("Worker {}: handle dropped, exiting", index);
            busy.store(false, Ordering::Release);
            break;
        }
        busy.store(false, Ordering::Release);
    }
    log::debug!("Worker {}: stopped", index);
}

use std::sync::Arc;
use std::sync::atomic::Ordering;

use crate::buffer::DeviceAllocator;
use crate::frame::{Frame, FrameRef};
use crate::pipeline::PipelineCounters;
use crate::reorder::ReorderBuffer;
use crate::worker::{Job, WorkerHandle};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Route {
    Worker(usize),
    /// copied straight into the reorder buffer, not analysed
    Fallback,
    /// no memory for even the fallback copy; the sequence becomes a gap
    Dropped,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Submitted {
    pub seq: u64,
    pub route: Route,
}

/// Assigns sequence numbers and hands each frame to the first idle worker,
/// starting from the worker after the last one used. Never waits on a worker.
pub struct Dispatcher {
    workers: Vec<WorkerHandle>,
    cursor: usize,
    next_seq: u64,
    reorder: Arc<ReorderBuffer>,
    /// backs fallback copies, same memory source as the worker pools
    allocator: Arc<dyn DeviceAllocator>,
    counters: Arc<PipelineCounters>,
}

impl Dispatcher {
    pub fn new(
        workers: Vec<WorkerHandle>,
        reorder: Arc<ReorderBuffer>,
        allocator: Arc<dyn DeviceAllocator>,
        counters: Arc<PipelineCounters>,
    ) -> Self {
        Self {
            workers,
            cursor: 0,
            next_seq: 0,
            reorder,
            allocator,
            counters,
        }
    }

    pub fn submit(&mut self, frame: &FrameRef<'_>) -> anyhow::Result<Submitted> {
        frame.validate()?;

        let seq = self.next_seq;
        self.next_seq += 1;
        self.counters.submitted.fetch_add(1, Ordering::Relaxed);

        let geometry = frame.geometry;
        let count = self.workers.len();
        for step in 0..count {
            let index = (self.cursor + step) % count;
            let worker = &mut self.workers[index];
            let Some(mut pool) = worker.try_claim() else {
                continue;
            };

            match pool.ensure_capacity(geometry.width, geometry.height, geometry.format) {
                Ok(buffer) => buffer.copy_from(frame),
                Err(e) => {
                    log::warn!("Dispatcher: worker {} cannot take frame {}: {:#}", index, seq, e);
                    self.counters.allocation_failures.fetch_add(1, Ordering::Relaxed);
                    worker.restore(pool);
                    continue;
                }
            }

            let job = Job {
                seq,
                pts: frame.pts,
                pool,
            };
            match worker.dispatch(job) {
                Ok(()) => {
                    self.cursor = (index + 1) % count;
                    self.counters.dispatched.fetch_add(1, Ordering::Relaxed);
                    log::trace!("Dispatcher: frame {} -> worker {}", seq, index);
                    return Ok(Submitted {
                        seq,
                        route: Route::Worker(index),
                    });
                }
                Err(e) => log::warn!("Dispatcher: {:#}", e),
            }
        }

        Ok(self.fallback(seq, frame))
    }

    fn fallback(&mut self, seq: u64, frame: &FrameRef<'_>) -> Submitted {
        self.counters.fallbacks.fetch_add(1, Ordering::Relaxed);
        match Frame::copy_from_ref(seq, frame, self.allocator.as_ref()) {
            Ok(copy) => {
                log::trace!("Dispatcher: frame {} -> fallback", seq);
                self.reorder.insert(copy);
                Submitted {
                    seq,
                    route: Route::Fallback,
                }
            }
            Err(e) => {
                log::error!("Dispatcher: dropping frame {}: {:#}", seq, e);
                self.counters.allocation_failures.fetch_add(1, Ordering::Relaxed);
                self.reorder.insert_gap(seq);
                Submitted {
                    seq,
                    route: Route::Dropped,
                }
            }
        }
    }

    /// The sequence number the next accepted frame will get.
    pub fn next_seq(&self) -> u64 {
        self.next_seq
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn busy_workers(&self) -> usize {
        self.workers.iter().filter(|w| w.is_busy()).count()
    }

    /// Drops every job channel first so all workers wind down together, then
    /// joins them. Returns the first join error.
    pub fn stop_workers(&mut self) -> anyhow::Result<()> {
        for worker in self.workers.iter_mut() {
            worker.stop();
        }
        let mut result = Ok(());
        for worker in self.workers.iter_mut() {
            if let Err(e) = worker.join() {
                log::error!("Dispatcher: {:#}", e);
                if result.is_ok() {
                    result = Err(e);
                }
            }
        }
        result
    }
}

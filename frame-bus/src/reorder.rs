use std::collections::HashMap;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::frame::Frame;

enum Entry {
    Frame(Frame),
    Gap,
}

#[derive(Debug)]
pub enum Released {
    Frame(Frame),
    /// A sequence number that will never produce a frame
    Gap(u64),
}

impl Released {
    pub fn seq(&self) -> u64 {
        match self {
            Released::Frame(frame) => frame.seq,
            Released::Gap(seq) => *seq,
        }
    }
}

struct ReorderState {
    pending: HashMap<u64, Entry>,
    expected: u64,
    closed: bool,
    stale_dropped: u64,
}

/// Holds frames that completed out of order and releases them strictly by
/// sequence number. Producers are the worker threads and the submit thread;
/// the single consumer is the sink thread.
pub struct ReorderBuffer {
    state: Mutex<ReorderState>,
    ready: Condvar,
    stall_timeout: Option<Duration>,
}

impl ReorderBuffer {
    pub fn new(stall_timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(ReorderState {
                pending: HashMap::new(),
                expected: 0,
                closed: false,
                stale_dropped: 0,
            }),
            ready: Condvar::new(),
            stall_timeout,
        }
    }

    fn lock(&self) -> MutexGuard<'_, ReorderState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns false when the frame was dropped as stale or duplicate.
    pub fn insert(&self, frame: Frame) -> bool {
        let seq = frame.seq;
        self.insert_entry(seq, Entry::Frame(frame))
    }

    /// Marks `seq` as permanently missing so later frames are not held back.
    pub fn insert_gap(&self, seq: u64) -> bool {
        self.insert_entry(seq, Entry::Gap)
    }

    fn insert_entry(&self, seq: u64, entry: Entry) -> bool {
        let mut state = self.lock();
        if seq < state.expected {
            state.stale_dropped += 1;
            log::warn!(
                "Reorder: dropping stale frame {} (expecting {})",
                seq,
                state.expected
            );
            return false;
        }
        if state.pending.contains_key(&seq) {
            state.stale_dropped += 1;
            log::warn!("Reorder: dropping duplicate frame {}", seq);
            return false;
        }
        state.pending.insert(seq, entry);
        drop(state);
        self.ready.notify_one();
        true
    }

    /// Blocks until the next sequence number can be released. Returns `None`
    /// once the buffer is closed and fully drained.
    pub fn next(&self) -> Option<Released> {
        let mut state = self.lock();
        let mut stalled_since: Option<Instant> = None;
        loop {
            let seq = state.expected;
            if let Some(entry) = state.pending.remove(&seq) {
                state.expected += 1;
                return Some(match entry {
                    Entry::Frame(frame) => Released::Frame(frame),
                    Entry::Gap => Released::Gap(seq),
                });
            }

            if state.pending.is_empty() {
                if state.closed {
                    return None;
                }
                stalled_since = None;
                state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            }

            if state.closed {
                log::warn!("Reorder: frame {} never arrived, skipping on close", seq);
                state.expected += 1;
                return Some(Released::Gap(seq));
            }

            let Some(timeout) = self.stall_timeout else {
                state = self.ready.wait(state).unwrap_or_else(PoisonError::into_inner);
                continue;
            };
            let since = *stalled_since.get_or_insert_with(Instant::now);
            let elapsed = since.elapsed();
            if elapsed >= timeout {
                log::warn!(
                    "Reorder: frame {} missing for {:?}, {} frames waiting behind it",
                    seq,
                    elapsed,
                    state.pending.len()
                );
                state.expected += 1;
                return Some(Released::Gap(seq));
            }
            state = self
                .ready
                .wait_timeout(state, timeout - elapsed)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
    }

    /// Wakes the consumer so it drains what is left and then stops.
    pub fn close(&self) {
        self.lock().closed = true;
        self.ready.notify_all();
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    pub fn expected(&self) -> u64 {
        self.lock().expected
    }

    pub fn pending_len(&self) -> usize {
        self.lock().pending.len()
    }

    pub fn stale_dropped(&self) -> u64 {
        self.lock().stale_dropped
    }
}

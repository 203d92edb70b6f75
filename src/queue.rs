// ABOUTME: Thread-safe queues shared between application threads, the sender thread, and the
// ABOUTME: event-loop thread: the outbound send queue and the ack-wait tracker

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

use bytes::Bytes;

use crate::message::MessageBuffer;

/// One outbound frame plus whether it must be tracked until the peer
/// acknowledges it.
pub struct SendItem {
    pub buffer: MessageBuffer,
    pub needs_ack: bool,
}

struct SendQueueState {
    items: VecDeque<SendItem>,
    running: bool,
}

/// Mutex-protected FIFO of pending outbound frames with a condition variable.
/// Any thread may `push`; only the sender thread `pop`s.
pub struct SendQueue {
    state: Mutex<SendQueueState>,
    condvar: Condvar,
}

impl SendQueue {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(SendQueueState { items: VecDeque::new(), running: true }),
            condvar: Condvar::new(),
        }
    }

    /// Append `item` and wake the sender thread.
    pub fn push(&self, item: SendItem) {
        let mut state = self.state.lock().unwrap();
        state.items.push_back(item);
        self.condvar.notify_one();
    }

    /// Block until an item is available or the queue is stopped. Returns
    /// `None` once `stop` has been called and no items remain.
    pub fn pop_blocking(&self) -> Option<SendItem> {
        let mut state = self.state.lock().unwrap();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Some(item);
            }
            if !state.running {
                return None;
            }
            state = self.condvar.wait(state).unwrap();
        }
    }

    /// Stop accepting further pops; wakes a thread blocked in `pop_blocking`.
    /// Pending items are dropped, not drained.
    pub fn stop(&self) {
        let mut state = self.state.lock().unwrap();
        state.running = false;
        self.condvar.notify_all();
    }
}

impl Default for SendQueue {
    fn default() -> Self {
        Self::new()
    }
}

/// Mutex-protected FIFO of frames awaiting peer acknowledgement. The sender
/// thread appends before transmitting a `needs_ack` frame; the event-loop
/// thread pops when an `Acknowledgement` is parsed.
///
/// Only the encoded bytes are kept, not the descriptors: the tracker exists
/// to count outstanding acks, never to retransmit, and `OwnedFd` isn't
/// `Clone`.
#[derive(Default)]
pub struct AckTracker {
    pending: Mutex<VecDeque<Bytes>>,
}

impl AckTracker {
    pub fn new() -> Self {
        Self { pending: Mutex::new(VecDeque::new()) }
    }

    /// Record a frame as awaiting acknowledgement.
    pub fn append(&self, data: Bytes) {
        self.pending.lock().unwrap().push_back(data);
    }

    /// Remove up to `count` oldest entries, as reported by a received
    /// `Acknowledgement(ack_count)`. A peer acking more than is outstanding
    /// simply pops what exists.
    pub fn pop_n(&self, count: u32) {
        let mut pending = self.pending.lock().unwrap();
        for _ in 0..count {
            if pending.pop_front().is_none() {
                break;
            }
        }
    }

    /// Current number of frames awaiting acknowledgement. Exposed for tests
    /// checking that the tracker drains back to zero once acks catch up.
    pub fn len(&self) -> usize {
        self.pending.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

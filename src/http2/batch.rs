//! Read-complete batching across channels
//!
//! While the parent connection is inside one read cycle, many channels may
//! become readable. Rather than each of them completing its read (and
//! flushing) on its own, they queue here and are completed together when
//! the connection's read cycle ends, followed by a single flush.

use std::collections::VecDeque;

use crate::event::ChannelId;

/// Outcome of [`ReadCompleteBatcher::enqueue`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enqueue {
    /// Queued for the end of the read cycle
    Queued,
    /// The queue is at capacity: drain it, then enqueue again
    Full,
    /// A drain is running; complete the read directly
    Draining,
}

/// Bounded FIFO of channels awaiting a read-complete notification
#[derive(Debug)]
pub struct ReadCompleteBatcher {
    queue: VecDeque<ChannelId>,
    capacity: usize,
    draining: bool,
}

impl ReadCompleteBatcher {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            queue: VecDeque::with_capacity(capacity),
            capacity,
            draining: false,
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Lower the cap (e.g. to the peer's concurrent stream limit)
    pub fn set_capacity(&mut self, capacity: usize) {
        self.capacity = capacity.max(1);
    }

    pub fn len(&self) -> usize {
        self.queue.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    pub fn is_draining(&self) -> bool {
        self.draining
    }

    pub fn enqueue(&mut self, channel: ChannelId) -> Enqueue {
        if self.draining {
            return Enqueue::Draining;
        }
        if self.queue.len() >= self.capacity {
            return Enqueue::Full;
        }
        self.queue.push_back(channel);
        Enqueue::Queued
    }

    /// Start a drain: take the queued channels in FIFO order
    ///
    /// The caller fires read complete on each, then calls
    /// [`finish_drain`](Self::finish_drain) and flushes once.
    pub fn begin_drain(&mut self) -> VecDeque<ChannelId> {
        self.draining = true;
        std::mem::take(&mut self.queue)
    }

    pub fn finish_drain(&mut self) {
        self.draining = false;
    }

    pub fn clear(&mut self) {
        self.queue.clear();
        self.draining = false;
    }

    /// Forget a channel (it closed before its turn)
    pub fn remove(&mut self, channel: ChannelId) {
        self.queue.retain(|c| *c != channel);
    }
}

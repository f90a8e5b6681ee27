//! In-memory batch accumulation with size and age flush triggers.

use std::time::Duration;

use tokio::time::Instant;

use kurisu_core::QueueItem;

/// Why a batch is being flushed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushReason {
    /// The batch reached its maximum size.
    Size,
    /// The flush timeout elapsed since the last flush.
    Timeout,
    /// The worker is shutting down.
    Shutdown,
}

/// Accumulates items until a size or time threshold is reached.
///
/// Owned by the worker loop task; never shared.
#[derive(Debug)]
pub struct Batcher {
    items: Vec<QueueItem>,
    max_size: usize,
    flush_timeout: Duration,
    last_flush: Instant,
}

impl Batcher {
    /// `max_size` is clamped to at least 1.
    pub fn new(max_size: usize, flush_timeout: Duration, now: Instant) -> Self {
        let max_size = max_size.max(1);
        Self {
            items: Vec::with_capacity(max_size),
            max_size,
            flush_timeout,
            last_flush: now,
        }
    }

    /// Add an item. The caller flushes once [`Batcher::flush_reason`] says so,
    /// so the batch never grows past `max_size`.
    pub fn append(&mut self, item: QueueItem) {
        debug_assert!(self.items.len() < self.max_size, "batch appended past its limit");
        self.items.push(item);
    }

    pub fn flush_reason(&self, now: Instant) -> Option<FlushReason> {
        if self.items.len() >= self.max_size {
            Some(FlushReason::Size)
        } else if !self.items.is_empty()
            && now.saturating_duration_since(self.last_flush) >= self.flush_timeout
        {
            Some(FlushReason::Timeout)
        } else {
            None
        }
    }

    pub fn should_flush(&self, now: Instant) -> bool {
        self.flush_reason(now).is_some()
    }

    /// Move the current batch out, leaving an empty one behind.
    pub fn take_and_clear(&mut self) -> Vec<QueueItem> {
        std::mem::replace(&mut self.items, Vec::with_capacity(self.max_size))
    }

    /// Put a batch that could not be written back in front of any newer items.
    pub fn restore(&mut self, mut items: Vec<QueueItem>) {
        items.append(&mut self.items);
        self.items = items;
    }

    /// Reset the flush timer. Called after every flush attempt, failed ones
    /// included.
    pub fn mark_flushed(&mut self, now: Instant) {
        self.last_flush = now;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }
}

//! Lock-free consumer buffer queue for the capture scheduler.
//!
//! The scheduler's frame-boundary handler runs in interrupt context: it may
//! not allocate and may not block. [`FrameQueue`] is the hand-off point
//! between that context (which dequeues a buffer per completed frame) and the
//! producer context in which a consumer returns buffers. It is a plain FIFO
//! over a lock-free queue, so the "lock" held while feeding the hardware is
//! a single CAS, never a critical section that could stall a slot update.
//!
//! Ordering matters: consumers expect frames back in the order they queued
//! buffers, and `SegQueue` preserves FIFO per producer, which is all the
//! scheduler requires (one producer side, one consumer side per channel).
//!
//! # Example
//!
//! ```
//! use capture_pool::FrameQueue;
//!
//! let queue: FrameQueue<u64> = FrameQueue::new("chan0");
//! queue.push(0xdead_0000);
//! queue.push(0xbeef_0000);
//! assert_eq!(queue.pop(), Some(0xdead_0000));
//! assert_eq!(queue.depth(), 1);
//! ```

use crossbeam_queue::SegQueue;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tracing::debug;

/// FIFO of consumer-owned buffers waiting to receive a frame.
///
/// Thread-safe and non-blocking on both ends. Designed to be shared between
/// a process-context producer (consumer enqueueing buffers) and an
/// interrupt-context consumer (the ping-pong assigner).
pub struct FrameQueue<T> {
    items: SegQueue<T>,
    /// Label used in log lines, typically the channel name.
    label: &'static str,
    depth: AtomicUsize,
    peak_depth: AtomicUsize,
    total_pushed: AtomicU64,
    total_popped: AtomicU64,
}

impl<T> FrameQueue<T> {
    /// Create an empty queue. `label` shows up in log output.
    #[must_use]
    pub fn new(label: &'static str) -> Self {
        Self {
            items: SegQueue::new(),
            label,
            depth: AtomicUsize::new(0),
            peak_depth: AtomicUsize::new(0),
            total_pushed: AtomicU64::new(0),
            total_popped: AtomicU64::new(0),
        }
    }

    /// Enqueue a buffer at the tail (producer side, process context).
    pub fn push(&self, item: T) {
        self.items.push(item);
        let depth = self.depth.fetch_add(1, Ordering::Relaxed) + 1;
        self.peak_depth.fetch_max(depth, Ordering::Relaxed);
        self.total_pushed.fetch_add(1, Ordering::Relaxed);
        debug!(queue = self.label, depth, "buffer enqueued");
    }

    /// Dequeue the oldest buffer, if any (consumer side, interrupt context).
    ///
    /// Never blocks; `None` is the starvation signal the assigner reacts to.
    #[must_use]
    pub fn pop(&self) -> Option<T> {
        let item = self.items.pop()?;
        self.depth.fetch_sub(1, Ordering::Relaxed);
        self.total_popped.fetch_add(1, Ordering::Relaxed);
        Some(item)
    }

    /// Number of buffers currently waiting.
    #[must_use]
    pub fn depth(&self) -> usize {
        self.depth.load(Ordering::Relaxed)
    }

    /// Whether the queue is currently empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.depth() == 0
    }

    /// Highest depth observed since creation.
    #[must_use]
    pub fn peak_depth(&self) -> usize {
        self.peak_depth.load(Ordering::Relaxed)
    }

    /// Total buffers enqueued since creation.
    #[must_use]
    pub fn total_pushed(&self) -> u64 {
        self.total_pushed.load(Ordering::Relaxed)
    }

    /// Total buffers dequeued since creation.
    #[must_use]
    pub fn total_popped(&self) -> u64 {
        self.total_popped.load(Ordering::Relaxed)
    }

    /// Drain every queued buffer, returning them in FIFO order.
    ///
    /// Used on stream stop and on watchdog recovery, where queued buffers
    /// must be handed back to the consumer rather than left dangling.
    pub fn drain(&self) -> Vec<T> {
        let mut out = Vec::new();
        while let Some(item) = self.pop() {
            out.push(item);
        }
        out
    }
}

impl<T> std::fmt::Debug for FrameQueue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FrameQueue")
            .field("label", &self.label)
            .field("depth", &self.depth())
            .field("peak_depth", &self.peak_depth())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fifo_order() {
        let queue = FrameQueue::new("test");
        queue.push(1);
        queue.push(2);
        queue.push(3);

        assert_eq!(queue.pop(), Some(1));
        assert_eq!(queue.pop(), Some(2));
        assert_eq!(queue.pop(), Some(3));
        assert_eq!(queue.pop(), None);
    }

    #[test]
    fn test_depth_tracking() {
        let queue = FrameQueue::new("test");
        assert!(queue.is_empty());

        queue.push("a");
        queue.push("b");
        assert_eq!(queue.depth(), 2);
        assert_eq!(queue.peak_depth(), 2);

        let _ = queue.pop();
        assert_eq!(queue.depth(), 1);
        // Peak is sticky
        assert_eq!(queue.peak_depth(), 2);
    }

    #[test]
    fn test_counters() {
        let queue = FrameQueue::new("test");
        queue.push(10);
        queue.push(20);
        let _ = queue.pop();

        assert_eq!(queue.total_pushed(), 2);
        assert_eq!(queue.total_popped(), 1);
    }

    #[test]
    fn test_drain_preserves_order() {
        let queue = FrameQueue::new("test");
        for i in 0..5 {
            queue.push(i);
        }

        let drained = queue.drain();
        assert_eq!(drained, vec![0, 1, 2, 3, 4]);
        assert!(queue.is_empty());
        assert_eq!(queue.total_popped(), 5);
    }

    #[test]
    fn test_concurrent_push_pop() {
        use std::sync::Arc;

        let queue = Arc::new(FrameQueue::new("test"));
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                for i in 0..1000u32 {
                    queue.push(i);
                }
            })
        };

        let mut seen = 0;
        while seen < 1000 {
            if queue.pop().is_some() {
                seen += 1;
            } else {
                std::thread::yield_now();
            }
        }
        producer.join().unwrap();

        assert_eq!(queue.total_pushed(), 1000);
        assert_eq!(queue.total_popped(), 1000);
        assert!(queue.is_empty());
    }
}

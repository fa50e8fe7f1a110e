//! Thread-safe frame ring buffer.
//!
//! This is the bounded, drop-oldest FIFO shared by the PCM and MP3 sides of
//! the pipeline. It stores complete frames only (no partials), never blocks
//! on push, and offers a bounded async wait on pop. The MP3 instance provides
//! several seconds of buffering depth to ride out encoder restarts and
//! scheduling delays; the PCM instance is locked to the canonical 4608-byte
//! frame size.

use std::collections::VecDeque;
use std::time::Duration;

use bytes::Bytes;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::Notify;

/// Errors raised by buffer construction and push operations.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum BufferError {
    /// Capacity must be at least one frame.
    #[error("ring buffer capacity must be > 0")]
    ZeroCapacity,

    /// Empty frames are never valid.
    #[error("cannot push an empty frame")]
    EmptyFrame,

    /// The buffer is locked to a fixed frame size and the pushed frame does
    /// not match it.
    #[error("frame size must be exactly {expected} bytes, got {actual}")]
    InvalidFrameSize { expected: usize, actual: usize },
}

/// Snapshot of buffer state and statistics.
#[derive(Debug, Clone, Copy, Serialize, PartialEq, Eq)]
pub struct FrameRingBufferStats {
    /// Maximum number of frames the buffer can hold.
    pub capacity: usize,
    /// Current number of buffered frames.
    pub count: usize,
    /// Total frames dropped due to overflow since construction.
    pub overflow_count: u64,
}

struct Inner {
    frames: VecDeque<Bytes>,
    overflow_count: u64,
}

/// Bounded, thread-safe, non-blocking, drop-oldest FIFO of whole frames.
///
/// All operations are O(1) under a single mutex and perform no I/O. When
/// full, `push` discards the *oldest* frame to keep latency low while
/// preserving buffering depth. `pop_timeout` is woken by pushes so consumers
/// never poll.
pub struct FrameRingBuffer {
    capacity: usize,
    expected_frame_size: Option<usize>,
    inner: Mutex<Inner>,
    notify: Notify,
}

impl FrameRingBuffer {
    /// Creates a buffer accepting frames of any non-zero size.
    pub fn new(capacity: usize) -> Result<Self, BufferError> {
        Self::build(capacity, None)
    }

    /// Creates a buffer locked to a fixed frame size (used for PCM buffers
    /// at the canonical 4608 bytes).
    pub fn with_frame_size(capacity: usize, frame_size: usize) -> Result<Self, BufferError> {
        if frame_size == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        Self::build(capacity, Some(frame_size))
    }

    fn build(capacity: usize, expected_frame_size: Option<usize>) -> Result<Self, BufferError> {
        if capacity == 0 {
            return Err(BufferError::ZeroCapacity);
        }
        Ok(Self {
            capacity,
            expected_frame_size,
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                overflow_count: 0,
            }),
            notify: Notify::new(),
        })
    }

    fn validate(&self, frame: &Bytes) -> Result<(), BufferError> {
        if frame.is_empty() {
            return Err(BufferError::EmptyFrame);
        }
        if let Some(expected) = self.expected_frame_size {
            if frame.len() != expected {
                return Err(BufferError::InvalidFrameSize {
                    expected,
                    actual: frame.len(),
                });
            }
        }
        Ok(())
    }

    /// Pushes a frame, dropping the oldest on overflow. Never blocks.
    pub fn push(&self, frame: Bytes) -> Result<(), BufferError> {
        self.validate(&frame)?;
        {
            let mut inner = self.inner.lock();
            if inner.frames.len() >= self.capacity {
                inner.frames.pop_front();
                inner.overflow_count += 1;
            }
            inner.frames.push_back(frame);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pushes a frame at the head (high priority). On overflow the *newest*
    /// element is dropped so the prioritized frame is next to pop.
    pub fn push_front(&self, frame: Bytes) -> Result<(), BufferError> {
        self.validate(&frame)?;
        {
            let mut inner = self.inner.lock();
            if inner.frames.len() >= self.capacity {
                inner.frames.pop_back();
                inner.overflow_count += 1;
            }
            inner.frames.push_front(frame);
        }
        self.notify.notify_one();
        Ok(())
    }

    /// Pops the oldest frame, or `None` when empty. Never blocks.
    pub fn pop(&self) -> Option<Bytes> {
        self.inner.lock().frames.pop_front()
    }

    /// Pops the oldest frame, waiting up to `timeout` for one to arrive.
    ///
    /// A zero timeout behaves exactly like [`pop`](Self::pop).
    pub async fn pop_timeout(&self, timeout: Duration) -> Option<Bytes> {
        if let Some(frame) = self.pop() {
            return Some(frame);
        }
        if timeout.is_zero() {
            return None;
        }

        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            // Register the waiter before re-checking so a push between the
            // check and the await cannot be missed.
            let notified = self.notify.notified();
            if let Some(frame) = self.pop() {
                return Some(frame);
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                // Deadline hit; one final non-blocking attempt.
                return self.pop();
            }
        }
    }

    /// Empties the buffer. Statistics are preserved.
    pub fn clear(&self) {
        self.inner.lock().frames.clear();
    }

    /// Returns a snapshot of buffer state and statistics.
    pub fn stats(&self) -> FrameRingBufferStats {
        let inner = self.inner.lock();
        FrameRingBufferStats {
            capacity: self.capacity,
            count: inner.frames.len(),
            overflow_count: inner.overflow_count,
        }
    }

    /// Current number of buffered frames.
    pub fn len(&self) -> usize {
        self.inner.lock().frames.len()
    }

    /// Whether the buffer holds no frames.
    pub fn is_empty(&self) -> bool {
        self.inner.lock().frames.is_empty()
    }

    /// Maximum number of frames the buffer can hold.
    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(byte: u8, len: usize) -> Bytes {
        Bytes::from(vec![byte; len])
    }

    #[test]
    fn rejects_zero_capacity() {
        assert_eq!(FrameRingBuffer::new(0).err(), Some(BufferError::ZeroCapacity));
    }

    #[test]
    fn push_then_pop_returns_original_bytes() {
        let buf = FrameRingBuffer::new(4).unwrap();
        let original = frame(7, 16);
        buf.push(original.clone()).unwrap();
        assert_eq!(buf.pop(), Some(original));
        assert_eq!(buf.pop(), None);
    }

    #[test]
    fn rejects_empty_frames() {
        let buf = FrameRingBuffer::new(4).unwrap();
        assert_eq!(buf.push(Bytes::new()).err(), Some(BufferError::EmptyFrame));
    }

    #[test]
    fn rejects_mismatched_frame_size() {
        let buf = FrameRingBuffer::with_frame_size(4, 4608).unwrap();
        let err = buf.push(frame(0, 4607)).unwrap_err();
        assert_eq!(
            err,
            BufferError::InvalidFrameSize {
                expected: 4608,
                actual: 4607
            }
        );
        buf.push(frame(0, 4608)).unwrap();
        assert_eq!(buf.len(), 1);
    }

    #[test]
    fn overflow_drops_oldest_and_counts() {
        let buf = FrameRingBuffer::new(2).unwrap();
        buf.push(frame(1, 8)).unwrap();
        buf.push(frame(2, 8)).unwrap();
        buf.push(frame(3, 8)).unwrap();

        let stats = buf.stats();
        assert_eq!(stats.count, 2);
        assert_eq!(stats.overflow_count, 1);
        assert_eq!(buf.pop().unwrap()[0], 2);
        assert_eq!(buf.pop().unwrap()[0], 3);
    }

    #[test]
    fn capacity_one_full_buffer_replaces_prior_element() {
        let buf = FrameRingBuffer::new(1).unwrap();
        buf.push(frame(1, 8)).unwrap();
        buf.push(frame(2, 8)).unwrap();
        assert_eq!(buf.pop().unwrap()[0], 2);
        assert_eq!(buf.stats().overflow_count, 1);
    }

    #[test]
    fn push_front_is_next_to_pop_and_drops_newest_on_overflow() {
        let buf = FrameRingBuffer::new(2).unwrap();
        buf.push(frame(1, 8)).unwrap();
        buf.push(frame(2, 8)).unwrap();
        buf.push_front(frame(9, 8)).unwrap();

        assert_eq!(buf.pop().unwrap()[0], 9);
        assert_eq!(buf.pop().unwrap()[0], 1);
        assert_eq!(buf.stats().overflow_count, 1);
    }

    #[test]
    fn clear_preserves_overflow_count() {
        let buf = FrameRingBuffer::new(1).unwrap();
        buf.push(frame(1, 8)).unwrap();
        buf.push(frame(2, 8)).unwrap();
        buf.clear();

        let stats = buf.stats();
        assert_eq!(stats.count, 0);
        assert_eq!(stats.overflow_count, 1);
    }

    #[tokio::test]
    async fn pop_timeout_zero_returns_immediately() {
        let buf = FrameRingBuffer::new(2).unwrap();
        let start = std::time::Instant::now();
        assert_eq!(buf.pop_timeout(Duration::ZERO).await, None);
        assert!(start.elapsed() < Duration::from_millis(1));
    }

    #[tokio::test]
    async fn pop_timeout_returns_none_at_deadline() {
        let buf = FrameRingBuffer::new(2).unwrap();
        assert_eq!(buf.pop_timeout(Duration::from_millis(10)).await, None);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn concurrent_producers_and_consumers_preserve_frames() {
        let buf = std::sync::Arc::new(FrameRingBuffer::new(256).unwrap());

        let mut producers = Vec::new();
        for producer in 0..4u8 {
            let buf = std::sync::Arc::clone(&buf);
            producers.push(tokio::spawn(async move {
                for _ in 0..50 {
                    buf.push(frame(producer, 16)).unwrap();
                    tokio::task::yield_now().await;
                }
            }));
        }

        let mut consumers = Vec::new();
        for consumer in 0..2 {
            let buf = std::sync::Arc::clone(&buf);
            consumers.push(tokio::spawn(async move {
                let mut count = 0usize;
                while let Some(f) = buf.pop_timeout(Duration::from_millis(50)).await {
                    assert_eq!(f.len(), 16, "consumer {consumer} saw a torn frame");
                    count += 1;
                }
                count
            }));
        }

        for handle in producers {
            handle.await.expect("producer panicked");
        }
        let mut popped = 0usize;
        for handle in consumers {
            popped += handle.await.expect("consumer panicked");
        }

        // 200 pushed, capacity 256: every frame is either consumed or still
        // buffered, none fabricated.
        assert_eq!(popped + buf.len(), 200);
        assert_eq!(buf.stats().overflow_count, 0);
    }

    #[tokio::test]
    async fn pop_timeout_woken_by_push() {
        let buf = std::sync::Arc::new(FrameRingBuffer::new(2).unwrap());
        let pusher = std::sync::Arc::clone(&buf);
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            pusher.push(frame(42, 8)).unwrap();
        });

        let popped = buf.pop_timeout(Duration::from_secs(1)).await;
        assert_eq!(popped.unwrap()[0], 42);
    }
}

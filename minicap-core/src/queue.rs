//! Bounded, drop-oldest hand-off between the stream reader and the
//! frame consumer.
//!
//! `push` never waits: at capacity the oldest frame is evicted first.
//! `take` suspends until a frame arrives or the queue is closed.
//! A single consumer is assumed.

use std::collections::VecDeque;
use std::sync::{Mutex, MutexGuard};

use tokio::sync::Notify;
use tracing::debug;

use crate::decoder::Frame;
use crate::error::CaptureError;

/// Default number of frames buffered before eviction starts.
pub const DEFAULT_QUEUE_CAPACITY: usize = 50;

#[derive(Debug)]
struct Inner {
    frames: VecDeque<Frame>,
    closed: bool,
    dropped: u64,
}

/// Fixed-capacity frame queue with drop-oldest backpressure.
#[derive(Debug)]
pub struct FrameQueue {
    inner: Mutex<Inner>,
    capacity: usize,
    available: Notify,
}

impl FrameQueue {
    /// Create a queue holding at most `capacity` frames (minimum 1).
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                frames: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            capacity,
            available: Notify::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total frames evicted to make room for newer ones.
    pub fn dropped(&self) -> u64 {
        self.lock().dropped
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Append `frame`, evicting the oldest entry if the queue is full.
    ///
    /// Frames pushed after [`close`](Self::close) are discarded.
    pub fn push(&self, frame: Frame) {
        {
            let mut inner = self.lock();
            if inner.closed {
                return;
            }
            if inner.frames.len() >= self.capacity {
                inner.frames.pop_front();
                inner.dropped += 1;
                debug!(capacity = self.capacity, "frame queue full, dropped oldest frame");
            }
            inner.frames.push_back(frame);
        }
        self.available.notify_one();
    }

    /// Return the oldest queued frame without waiting.
    pub fn try_take(&self) -> Option<Frame> {
        self.lock().frames.pop_front()
    }

    /// Wait for the next frame.
    ///
    /// Returns [`CaptureError::Cancelled`] once the queue is closed.
    pub async fn take(&self) -> Result<Frame, CaptureError> {
        loop {
            // Registered before the check so a close() in between is not missed.
            let notified = self.available.notified();
            {
                let mut inner = self.lock();
                if inner.closed {
                    return Err(CaptureError::Cancelled);
                }
                if let Some(frame) = inner.frames.pop_front() {
                    return Ok(frame);
                }
            }
            notified.await;
        }
    }

    /// Close the queue, drop buffered frames and wake the consumer.
    pub fn close(&self) {
        {
            let mut inner = self.lock();
            inner.closed = true;
            inner.frames.clear();
        }
        self.available.notify_waiters();
        // Leaves a permit for a consumer that is between its check and its await.
        self.available.notify_one();
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

impl Default for FrameQueue {
    fn default() -> Self {
        Self::new(DEFAULT_QUEUE_CAPACITY)
    }
}

// ── Tests ────────────────────────────────────────────────────────

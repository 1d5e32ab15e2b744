//! Bounded frame queues
//!
//! Fixed-capacity rings of [`CanFrame`] sized once at startup. The producer
//! side never blocks and never allocates, so it is safe to call from a
//! driver's receive interrupt or callback. The consumer side can block on the
//! queue's `ready` event, which is set on every successful push.

use crate::sync::Event;
use crate::types::CanFrame;
use crossbeam::queue::ArrayQueue;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Returned when a frame could not be queued; the frame has been dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("frame queue is full")]
pub struct QueueFull;

/// A bounded frame ring with overflow accounting
pub struct FrameQueue {
    name: &'static str,
    frames: ArrayQueue<CanFrame>,
    ready: Arc<Event>,
    space: Event,
    overflows: AtomicU64,
}

impl FrameQueue {
    /// Create a queue of `capacity` frames whose pushes set `ready`
    ///
    /// A capacity of zero is rounded up to one.
    pub fn new(name: &'static str, capacity: usize, ready: Arc<Event>) -> Self {
        Self {
            name,
            frames: ArrayQueue::new(capacity.max(1)),
            ready,
            space: Event::auto(),
            overflows: AtomicU64::new(0),
        }
    }

    /// Queue name used in log messages
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Non-blocking push
    ///
    /// When the ring is full the new frame is dropped and the overflow
    /// counter incremented.
    pub fn push(&self, frame: CanFrame) -> Result<(), QueueFull> {
        match self.frames.push(frame) {
            Ok(()) => {
                self.ready.set();
                Ok(())
            }
            Err(_) => {
                self.overflows.fetch_add(1, Ordering::Relaxed);
                Err(QueueFull)
            }
        }
    }

    /// Push, waiting up to `timeout` for space to become available
    ///
    /// Overflow is only counted when the wait expires without space.
    pub fn push_timeout(&self, frame: CanFrame, timeout: Duration) -> Result<(), QueueFull> {
        let deadline = Instant::now() + timeout;
        let mut frame = frame;

        loop {
            match self.frames.push(frame) {
                Ok(()) => {
                    self.ready.set();
                    return Ok(());
                }
                Err(rejected) => {
                    frame = rejected;
                    let now = Instant::now();
                    if now >= deadline {
                        self.overflows.fetch_add(1, Ordering::Relaxed);
                        return Err(QueueFull);
                    }
                    self.space.wait(deadline - now);
                }
            }
        }
    }

    /// Non-blocking pop
    pub fn pop(&self) -> Option<CanFrame> {
        let frame = self.frames.pop();
        if frame.is_some() {
            self.space.set();
        }
        frame
    }

    /// Pop, waiting up to `timeout` for a frame
    pub fn pop_timeout(&self, timeout: Duration) -> Option<CanFrame> {
        if let Some(frame) = self.pop() {
            return Some(frame);
        }
        if self.ready.wait(timeout) {
            self.pop()
        } else {
            None
        }
    }

    /// Number of queued frames
    pub fn len(&self) -> usize {
        self.frames.len()
    }

    /// True if no frames are queued
    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Fixed capacity
    pub fn capacity(&self) -> usize {
        self.frames.capacity()
    }

    /// Frames dropped because the ring was full
    pub fn overflows(&self) -> u64 {
        self.overflows.load(Ordering::Relaxed)
    }
}

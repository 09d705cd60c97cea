//! Thread-safe bounded queues.
//!
//! - [`PacketQueue`]: router → pipeline hand-off. A slot stays occupied from `push` until the
//!   consumer calls [`PacketQueue::complete`], so depth 1 means submit-and-wait-for-consumption.
//! - [`SampleQueue`]: audio writer → device callback. The callback side never blocks.
//!
//! Every blocking call takes an `abort` predicate and wakes at least once per poll interval,
//! so pause/seek/stop interrupt a wait promptly even if a notification is missed.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Bounded hand-off queue with explicit consumption acknowledgement.
pub struct PacketQueue<T> {
    inner: Mutex<PacketInner<T>>,
    cv: Condvar,
    depth: usize,
    poll: Duration,
}

struct PacketInner<T> {
    items: VecDeque<T>,
    in_flight: usize,
    closed: bool,
}

impl<T> PacketQueue<T> {
    pub fn new(depth: usize, poll: Duration) -> Self {
        Self {
            inner: Mutex::new(PacketInner {
                items: VecDeque::new(),
                in_flight: 0,
                closed: false,
            }),
            cv: Condvar::new(),
            depth: depth.max(1),
            poll,
        }
    }

    /// Submit one item, blocking while every slot is occupied.
    ///
    /// Returns the item back when `abort` fires or the queue is closed first.
    pub fn push(&self, item: T, abort: impl Fn() -> bool) -> Result<(), T> {
        loop {
            if abort() {
                return Err(item);
            }
            let g = self.inner.lock().unwrap();
            if g.closed {
                return Err(item);
            }
            if g.items.len() + g.in_flight < self.depth {
                let mut g = g;
                g.items.push_back(item);
                drop(g);
                self.cv.notify_all();
                return Ok(());
            }
            let _ = self.cv.wait_timeout(g, self.poll).unwrap();
        }
    }

    /// Take the next item and mark it in flight.
    ///
    /// Returns `None` when `abort` fires or the queue is closed and empty.
    pub fn pop(&self, abort: impl Fn() -> bool) -> Option<T> {
        loop {
            if abort() {
                return None;
            }
            let mut g = self.inner.lock().unwrap();
            if let Some(item) = g.items.pop_front() {
                g.in_flight += 1;
                return Some(item);
            }
            if g.closed {
                return None;
            }
            let _ = self.cv.wait_timeout(g, self.poll).unwrap();
        }
    }

    /// Release the slot of one item previously returned by [`pop`](Self::pop).
    pub fn complete(&self) {
        let mut g = self.inner.lock().unwrap();
        g.in_flight = g.in_flight.saturating_sub(1);
        drop(g);
        self.cv.notify_all();
    }

    /// Drop all queued (not yet popped) items. Returns how many were discarded.
    pub fn clear(&self) -> usize {
        let mut g = self.inner.lock().unwrap();
        let dropped = g.items.len();
        g.items.clear();
        drop(g);
        self.cv.notify_all();
        dropped
    }

    /// Whether no item is queued or in flight.
    pub fn is_idle(&self) -> bool {
        let g = self.inner.lock().unwrap();
        g.items.is_empty() && g.in_flight == 0
    }

    /// Block until every pushed item has been completed.
    ///
    /// Returns `false` when `abort` fired first.
    pub fn wait_idle(&self, abort: impl Fn() -> bool) -> bool {
        loop {
            if abort() {
                return false;
            }
            let g = self.inner.lock().unwrap();
            if g.items.is_empty() && g.in_flight == 0 {
                return true;
            }
            let _ = self.cv.wait_timeout(g, self.poll).unwrap();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Refuse further pushes and wake all waiters. Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.closed = true;
        drop(g);
        self.cv.notify_all();
    }

    /// Wake every waiter so it re-evaluates its abort predicate.
    pub fn wake(&self) {
        self.cv.notify_all();
    }
}

/// Bounded queue of interleaved `f32` samples feeding a real-time callback.
///
/// Producers check [`free_samples`](Self::free_samples) before pushing; the callback pops
/// without blocking and fills gaps with silence.
pub struct SampleQueue {
    channels: usize,
    inner: Mutex<VecDeque<f32>>,
    max_buffered_samples: usize,
    low_watermark_ms: AtomicU64,
    started: Instant,
}

/// Queue capacity in samples for `(rate, channels, millis)`. Never zero.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_ms: u32) -> usize {
    let ms = if buffer_ms == 0 { 200 } else { buffer_ms };
    let frames = (rate_hz as u64 * ms as u64).div_ceil(1000) as usize;
    frames.max(1).saturating_mul(channels.max(1))
}

impl SampleQueue {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(VecDeque::with_capacity(max_buffered_samples)),
            max_buffered_samples: max_buffered_samples.max(channels),
            low_watermark_ms: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn capacity_samples(&self) -> usize {
        self.max_buffered_samples
    }

    pub fn len_frames(&self) -> usize {
        self.inner.lock().unwrap().len() / self.channels
    }

    pub fn free_samples(&self) -> usize {
        let g = self.inner.lock().unwrap();
        self.max_buffered_samples.saturating_sub(g.len())
    }

    /// Append as many samples as fit. Returns how many were accepted.
    pub fn push_available(&self, samples: &[f32]) -> usize {
        let mut g = self.inner.lock().unwrap();
        let room = self.max_buffered_samples.saturating_sub(g.len());
        let take = room.min(samples.len());
        g.extend(&samples[..take]);
        take
    }

    /// Pop up to `max_frames` whole frames, or `None` if nothing is buffered.
    pub fn pop_up_to(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();
        let take_frames = (g.len() / self.channels).min(max_frames);
        if take_frames == 0 {
            return None;
        }
        let out: Vec<f32> = g.drain(..take_frames * self.channels).collect();
        let queued = g.len();
        drop(g);
        self.log_low_watermark(queued);
        Some(out)
    }

    /// Drop everything buffered (seek / stop).
    pub fn clear(&self) {
        self.inner.lock().unwrap().clear();
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.max_buffered_samples / 8).max(self.channels * 16);
        if queued > 0 && queued < threshold {
            let now = self.started.elapsed().as_millis() as u64;
            let last = self.low_watermark_ms.load(Ordering::Relaxed);
            if now.saturating_sub(last) > 1000 {
                self.low_watermark_ms.store(now, Ordering::Relaxed);
                tracing::debug!(
                    queued_samples = queued,
                    threshold_samples = threshold,
                    "audio queue low watermark"
                );
            }
        }
    }
}

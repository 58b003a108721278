//! Bounded sample queue between a sink and a real-time device callback.
//!
//! The sink pushes with [`SampleQueue::push_blocking`], which is where the decode thread
//! stalls when the device falls behind. The callback drains with
//! [`SampleQueue::pop_into`], which never waits.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

/// Thread-safe bounded FIFO of interleaved `f32` samples.
///
/// A single [`Condvar`] signals every state change (push, pop, discard, close).
pub struct SampleQueue {
    channels: usize,
    capacity: usize,
    inner: Mutex<QueueInner>,
    cv: Condvar,
    created: Instant,
    low_watermark_logged_ms: AtomicU64,
}

struct QueueInner {
    samples: VecDeque<f32>,
    closed: bool,
}

impl SampleQueue {
    /// `capacity` is in samples; it is rounded up to a whole frame.
    pub fn new(channels: usize, capacity: usize) -> Self {
        let channels = channels.max(1);
        let capacity = capacity.max(channels).div_ceil(channels) * channels;
        Self {
            channels,
            capacity,
            inner: Mutex::new(QueueInner {
                samples: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            cv: Condvar::new(),
            created: Instant::now(),
            low_watermark_logged_ms: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, QueueInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Buffered samples (snapshot).
    pub fn len(&self) -> usize {
        self.lock().samples.len()
    }

    /// Stop accepting samples and wake every waiter. Buffered samples stay poppable.
    pub fn close(&self) {
        self.lock().closed = true;
        self.cv.notify_all();
    }

    /// Drop everything buffered; returns how many samples were discarded.
    pub fn discard(&self) -> usize {
        let mut g = self.lock();
        let n = g.samples.len();
        g.samples.clear();
        drop(g);
        self.cv.notify_all();
        n
    }

    /// Append samples, blocking while the queue is full.
    ///
    /// Returns `false` if the queue was closed before every sample was accepted; the rest
    /// are dropped.
    pub fn push_blocking(&self, samples: &[f32]) -> bool {
        let mut offset = 0;
        while offset < samples.len() {
            let mut g = self.lock();
            while g.samples.len() >= self.capacity && !g.closed {
                g = self.cv.wait(g).unwrap_or_else(PoisonError::into_inner);
            }
            if g.closed {
                return false;
            }
            let room = self.capacity - g.samples.len();
            let n = room.min(samples.len() - offset);
            g.samples.extend(&samples[offset..offset + n]);
            offset += n;
            drop(g);
            self.cv.notify_all();
        }
        true
    }

    /// Move up to `max_frames` whole frames into `out` without waiting.
    ///
    /// Returns the number of samples moved (zero when fewer than one frame is buffered).
    pub fn pop_into(&self, out: &mut Vec<f32>, max_frames: usize) -> usize {
        let mut g = self.lock();
        let frames = (g.samples.len() / self.channels).min(max_frames);
        let n = frames * self.channels;
        if n == 0 {
            return 0;
        }
        out.extend(g.samples.drain(..n));
        let remaining = g.samples.len();
        drop(g);
        self.cv.notify_all();
        self.log_low_watermark(remaining);
        n
    }

    /// Block until the queue is empty or `timeout` elapses. Returns `true` if it drained.
    pub fn wait_drained(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut g = self.lock();
        while !g.samples.is_empty() {
            let now = Instant::now();
            if now >= deadline {
                return false;
            }
            let (ng, _) = self
                .cv
                .wait_timeout(g, deadline - now)
                .unwrap_or_else(PoisonError::into_inner);
            g = ng;
        }
        true
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.capacity / 8).max(self.channels * 16);
        if queued == 0 || queued >= threshold {
            return;
        }
        let now = self.created.elapsed().as_millis() as u64;
        let last = self.low_watermark_logged_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.low_watermark_logged_ms.store(now, Ordering::Relaxed);
            tracing::debug!(
                queued_samples = queued,
                threshold_samples = threshold,
                "output queue low watermark"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::{Arc, Barrier};
    use std::thread;

    #[test]
    fn capacity_rounds_up_to_whole_frames() {
        let q = SampleQueue::new(2, 7);
        assert_eq!(q.capacity, 8);
        assert_eq!(SampleQueue::new(0, 0).capacity, 1);
    }

    #[test]
    fn pop_into_empty_returns_zero() {
        let q = SampleQueue::new(2, 16);
        let mut out = Vec::new();
        assert_eq!(q.pop_into(&mut out, 4), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn pop_into_takes_whole_frames_only() {
        let q = SampleQueue::new(2, 64);
        assert!(q.push_blocking(&[1.0, 2.0, 3.0, 4.0, 5.0]));
        let mut out = Vec::new();
        assert_eq!(q.pop_into(&mut out, 8), 4);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn push_blocks_until_consumer_makes_room() {
        let q = Arc::new(SampleQueue::new(1, 4));
        let producer = q.clone();
        let barrier = Arc::new(Barrier::new(2));
        let start = barrier.clone();

        let handle = thread::spawn(move || {
            start.wait();
            producer.push_blocking(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0])
        });

        barrier.wait();
        let mut out = Vec::new();
        while out.len() < 6 {
            q.pop_into(&mut out, 2);
            thread::yield_now();
        }
        assert!(handle.join().unwrap());
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0]);
    }

    #[test]
    fn close_releases_a_blocked_producer() {
        let q = Arc::new(SampleQueue::new(1, 2));
        assert!(q.push_blocking(&[1.0, 2.0]));
        let producer = q.clone();
        let handle = thread::spawn(move || producer.push_blocking(&[3.0]));
        thread::sleep(Duration::from_millis(20));
        q.close();
        assert!(!handle.join().unwrap());
        assert!(q.lock().closed);
        assert_eq!(q.len(), 2);
    }

    #[test]
    fn discard_empties_and_unblocks() {
        let q = Arc::new(SampleQueue::new(1, 2));
        assert!(q.push_blocking(&[1.0, 2.0]));
        let producer = q.clone();
        let handle = thread::spawn(move || producer.push_blocking(&[3.0]));
        thread::sleep(Duration::from_millis(20));
        assert_eq!(q.discard(), 2);
        assert!(handle.join().unwrap());
        assert_eq!(q.len(), 1);
    }

    #[test]
    fn wait_drained_times_out_with_data() {
        let q = SampleQueue::new(1, 8);
        q.push_blocking(&[1.0]);
        assert!(!q.wait_drained(Duration::from_millis(10)));
    }

    #[test]
    fn wait_drained_returns_once_consumed() {
        let q = Arc::new(SampleQueue::new(1, 8));
        q.push_blocking(&[1.0, 2.0]);
        let consumer = q.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(10));
            let mut out = Vec::new();
            consumer.pop_into(&mut out, 8);
        });
        assert!(q.wait_drained(Duration::from_secs(2)));
        handle.join().unwrap();
    }
}

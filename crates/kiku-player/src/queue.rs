//! Bounded sample queue between the worker thread and the device callback.
//!
//! The worker pushes converted samples with a blocking, interruptible push; the
//! CPAL callback drains without ever waiting on the condition variable.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, Instant};

/// Poll interval for producers blocked on a full queue.
const PUSH_WAIT_SLICE: Duration = Duration::from_millis(20);

/// Thread-safe bounded queue for interleaved `f32` samples.
///
/// A single [`Condvar`] signals "state changed"; the `done` flag lives under
/// the same mutex as the samples so close and push cannot race.
pub struct SharedAudio {
    channels: usize,
    inner: Mutex<SharedInner>,
    cv: Condvar,
    max_buffered_samples: usize,
    started: Instant,
    low_watermark_ms: AtomicU64,
}

struct SharedInner {
    queue: VecDeque<f32>,
    done: bool,
}

/// Queue capacity in samples for `buffer_seconds` of audio.
///
/// Non-finite or non-positive durations fall back to half a second.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        0.5
    };

    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels).max(channels)
}

impl SharedAudio {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        Self {
            channels,
            inner: Mutex::new(SharedInner {
                queue: VecDeque::with_capacity(max_buffered_samples),
                done: false,
            }),
            cv: Condvar::new(),
            max_buffered_samples: max_buffered_samples.max(channels),
            started: Instant::now(),
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn is_done(&self) -> bool {
        self.inner.lock().unwrap().done
    }

    /// Mark the queue finished, drop buffered audio, and wake all waiters.
    ///
    /// Idempotent.
    pub fn close(&self) {
        let mut g = self.inner.lock().unwrap();
        g.done = true;
        g.queue.clear();
        drop(g);
        self.cv.notify_all();
    }

    /// Push samples, blocking while the queue is full.
    ///
    /// Returns early when the queue is closed or `interrupted()` turns true;
    /// the predicate is re-checked every wait slice. The return value is the
    /// number of samples accepted.
    pub fn push_interleaved_interruptible(
        &self,
        samples: &[f32],
        interrupted: &dyn Fn() -> bool,
    ) -> usize {
        let mut offset = 0;

        while offset < samples.len() {
            let mut g = self.inner.lock().unwrap();

            while g.queue.len() >= self.max_buffered_samples && !g.done {
                if interrupted() {
                    return offset;
                }
                let (ng, _timeout) = self.cv.wait_timeout(g, PUSH_WAIT_SLICE).unwrap();
                g = ng;
            }
            if g.done || interrupted() {
                return offset;
            }

            let room = self.max_buffered_samples - g.queue.len();
            let take = room.min(samples.len() - offset);
            g.queue.extend(&samples[offset..offset + take]);
            offset += take;

            drop(g);
            self.cv.notify_all();
        }
        offset
    }

    /// Pop up to `max_frames` whole frames without blocking.
    ///
    /// Returns `None` when no complete frame is buffered.
    pub fn pop_nonblocking(&self, max_frames: usize) -> Option<Vec<f32>> {
        let mut g = self.inner.lock().unwrap();

        let available_frames = g.queue.len() / self.channels;
        let take_samples = available_frames.min(max_frames) * self.channels;
        if take_samples == 0 {
            return None;
        }

        let out: Vec<f32> = g.queue.drain(..take_samples).collect();
        let remaining = g.queue.len();
        drop(g);
        self.cv.notify_all();
        self.log_low_watermark(remaining);
        Some(out)
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
                    "output queue low watermark"
                );
            }
        }
    }
}

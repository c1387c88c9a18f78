//! Bounded sample queue between the output stage and a device callback.
//!
//! The output stage pushes interleaved `f32` frames with a bounded wait; the real-time
//! callback pops without ever blocking. A full queue is what paces the engine to the
//! device clock.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::interrupt::Interrupt;

/// How long a drain wait sleeps before re-checking the interrupt flag.
const DRAIN_POLL: Duration = Duration::from_millis(20);

/// Thread-safe bounded queue of interleaved `f32` samples.
///
/// Capacity is counted in samples and always holds whole frames.
pub struct SharedAudio {
    channels: usize,
    inner: Mutex<VecDeque<f32>>,
    cv: Condvar,
    max_buffered_samples: usize,
    low_watermark_ms: AtomicU64,
}

/// Queue capacity in samples for `buffer_seconds` of audio at `rate_hz`.
///
/// Non-finite or non-positive durations fall back to two seconds.
pub fn calc_max_buffered_samples(rate_hz: u32, channels: usize, buffer_seconds: f32) -> usize {
    let secs = if buffer_seconds.is_finite() && buffer_seconds > 0.0 {
        buffer_seconds
    } else {
        2.0
    };
    let frames = (rate_hz as f32 * secs).ceil() as usize;
    frames.saturating_mul(channels)
}

impl SharedAudio {
    pub fn new(channels: usize, max_buffered_samples: usize) -> Self {
        let channels = channels.max(1);
        let max_buffered_samples = (max_buffered_samples / channels).max(1) * channels;
        Self {
            channels,
            inner: Mutex::new(VecDeque::with_capacity(max_buffered_samples)),
            cv: Condvar::new(),
            max_buffered_samples,
            low_watermark_ms: AtomicU64::new(0),
        }
    }

    pub fn channels(&self) -> usize {
        self.channels
    }

    pub fn max_frames(&self) -> usize {
        self.max_buffered_samples / self.channels
    }

    /// Buffered frames (best-effort snapshot).
    pub fn len_frames(&self) -> usize {
        self.inner.lock().unwrap().len() / self.channels
    }

    /// Push as many whole frames of `samples` as fit, waiting at most `wait` for room.
    ///
    /// Returns the number of samples accepted (a multiple of the channel count).
    pub fn push_for(&self, samples: &[f32], wait: Duration) -> usize {
        let mut queue = self.inner.lock().unwrap();
        if queue.len() + self.channels > self.max_buffered_samples {
            queue = self.cv.wait_timeout(queue, wait).unwrap().0;
        }
        let room = self.max_buffered_samples.saturating_sub(queue.len());
        let take = (room.min(samples.len()) / self.channels) * self.channels;
        queue.extend(&samples[..take]);
        take
    }

    /// Move up to `max_frames` buffered frames into `out` without blocking.
    ///
    /// Returns the frames moved.
    pub fn pop_into(&self, out: &mut Vec<f32>, max_frames: usize) -> usize {
        let mut queue = self.inner.lock().unwrap();
        let frames = (queue.len() / self.channels).min(max_frames);
        out.extend(queue.drain(..frames * self.channels));
        let remaining = queue.len();
        drop(queue);
        if frames > 0 {
            self.cv.notify_all();
            self.log_low_watermark(remaining);
        }
        frames
    }

    /// Drop everything buffered. Returns the frames discarded.
    pub fn clear(&self) -> usize {
        let mut queue = self.inner.lock().unwrap();
        let frames = queue.len() / self.channels;
        queue.clear();
        drop(queue);
        self.cv.notify_all();
        frames
    }

    /// Wait at most `wait` for the queue to empty. Returns `true` once it is empty.
    pub fn wait_empty_for(&self, wait: Duration) -> bool {
        let mut queue = self.inner.lock().unwrap();
        if !queue.is_empty() {
            queue = self.cv.wait_timeout(queue, wait).unwrap().0;
        }
        queue.is_empty()
    }

    /// Block until the consumer has taken everything, or `interrupt` is raised.
    ///
    /// Returns `true` if the queue drained.
    pub fn wait_until_empty(&self, interrupt: &Interrupt) -> bool {
        loop {
            if interrupt.is_set() {
                return false;
            }
            if self.wait_empty_for(DRAIN_POLL) {
                return true;
            }
        }
    }

    fn log_low_watermark(&self, queued: usize) {
        let threshold = (self.max_buffered_samples / 8).max(self.channels * 16);
        if queued == 0 || queued >= threshold {
            return;
        }
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis() as u64;
        let last = self.low_watermark_ms.load(Ordering::Relaxed);
        if now.saturating_sub(last) > 1000 {
            self.low_watermark_ms.store(now, Ordering::Relaxed);
            tracing::info!(
                queued_samples = queued,
                threshold_samples = threshold,
                "audio queue low watermark"
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
    fn calc_max_buffered_samples_fallbacks() {
        assert_eq!(calc_max_buffered_samples(48_000, 2, 2.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, -1.0), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::NAN), 192_000);
        assert_eq!(calc_max_buffered_samples(48_000, 2, f32::INFINITY), 192_000);
    }

    #[test]
    fn capacity_rounds_to_whole_frames() {
        let q = SharedAudio::new(2, 7);
        assert_eq!(q.max_frames(), 3);
        assert_eq!(q.push_for(&[0.0; 10], Duration::ZERO), 6);
        assert_eq!(q.len_frames(), 3);
    }

    #[test]
    fn push_times_out_when_full() {
        let q = SharedAudio::new(1, 4);
        assert_eq!(q.push_for(&[1.0; 4], Duration::ZERO), 4);
        assert_eq!(q.push_for(&[1.0], Duration::from_millis(5)), 0);
    }

    #[test]
    fn pop_into_takes_up_to_max_frames() {
        let q = SharedAudio::new(2, 64);
        q.push_for(&[1.0, 2.0, 3.0, 4.0, 5.0, 6.0], Duration::ZERO);
        let mut out = Vec::new();
        assert_eq!(q.pop_into(&mut out, 2), 2);
        assert_eq!(out, vec![1.0, 2.0, 3.0, 4.0]);
        assert_eq!(q.len_frames(), 1);
    }

    #[test]
    fn pop_into_empty_returns_zero() {
        let q = SharedAudio::new(2, 16);
        let mut out = Vec::new();
        assert_eq!(q.pop_into(&mut out, 4), 0);
        assert!(out.is_empty());
    }

    #[test]
    fn blocked_push_resumes_when_consumer_pops() {
        let q = Arc::new(SharedAudio::new(1, 2));
        q.push_for(&[1.0, 2.0], Duration::ZERO);
        let consumer = q.clone();
        let barrier = Arc::new(Barrier::new(2));
        let start = barrier.clone();
        let handle = thread::spawn(move || {
            start.wait();
            thread::sleep(Duration::from_millis(10));
            let mut out = Vec::new();
            consumer.pop_into(&mut out, 1);
        });
        barrier.wait();
        let mut pushed = 0;
        for _ in 0..100 {
            pushed = q.push_for(&[3.0], Duration::from_millis(50));
            if pushed > 0 {
                break;
            }
        }
        assert_eq!(pushed, 1);
        handle.join().unwrap();
    }

    #[test]
    fn clear_reports_dropped_frames() {
        let q = SharedAudio::new(2, 16);
        q.push_for(&[0.0; 8], Duration::ZERO);
        assert_eq!(q.clear(), 4);
        assert_eq!(q.len_frames(), 0);
    }

    #[test]
    fn wait_until_empty_respects_interrupt() {
        let q = SharedAudio::new(1, 4);
        q.push_for(&[1.0], Duration::ZERO);
        let interrupt = Interrupt::new();
        interrupt.trigger();
        assert!(!q.wait_until_empty(&interrupt));
        q.clear();
        assert!(q.wait_until_empty(&Interrupt::new()));
    }
}

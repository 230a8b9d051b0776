//! Blocking sample queue for the loopback backend.
//!
//! A `HeapRb` behind a mutex with a condvar for waiting. Real-time callbacks
//! use split ring halves instead (see the cpal backend).

use ringbuf::traits::{Consumer, Observer, Producer};
use ringbuf::HeapRb;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub(crate) struct SampleQueue {
    samples: Mutex<HeapRb<i16>>,
    changed: Condvar,
    capacity: usize,
    dropped: AtomicU64,
}

impl SampleQueue {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            samples: Mutex::new(HeapRb::new(capacity)),
            changed: Condvar::new(),
            capacity,
            dropped: AtomicU64::new(0),
        }
    }

    fn lock(&self) -> MutexGuard<'_, HeapRb<i16>> {
        self.samples.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn len(&self) -> usize {
        self.lock().occupied_len()
    }

    /// Samples discarded by `push_overwrite` since creation.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Append, discarding the oldest samples when full. Never blocks.
    pub fn push_overwrite(&self, input: &[i16]) {
        let mut queue = self.lock();
        let overflow = (queue.occupied_len() + input.len()).saturating_sub(self.capacity);
        if overflow > 0 {
            let from_queue = overflow.min(queue.occupied_len());
            queue.skip(from_queue);
            self.dropped.fetch_add(overflow as u64, Ordering::Relaxed);
        }
        let skip = input.len().saturating_sub(self.capacity);
        queue.push_slice(&input[skip..]);
        drop(queue);
        self.changed.notify_all();
    }

    /// Append as much as fits, waiting up to `timeout` for room.
    ///
    /// Returns the number of samples accepted; the caller keeps the rest.
    pub fn push_bounded(&self, input: &[i16], timeout: Duration) -> usize {
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        loop {
            if queue.vacant_len() > 0 || input.is_empty() {
                let accepted = queue.push_slice(input);
                drop(queue);
                self.changed.notify_all();
                return accepted;
            }
            let now = Instant::now();
            if now >= deadline {
                return 0;
            }
            queue = self
                .changed
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }
    }

    /// Append as much as fits without waiting.
    pub fn try_push(&self, input: &[i16]) -> usize {
        self.push_bounded(input, Duration::ZERO)
    }

    /// Wait until at least `min` samples are queued (or the timeout passes),
    /// then move up to `out.len()` of them into `out`.
    pub fn pop_into(&self, out: &mut [i16], min: usize, timeout: Duration) -> usize {
        let want = min.min(out.len());
        let deadline = Instant::now() + timeout;
        let mut queue = self.lock();
        while queue.occupied_len() < want {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            queue = self
                .changed
                .wait_timeout(queue, deadline - now)
                .unwrap_or_else(|e| e.into_inner())
                .0;
        }

        let count = queue.pop_slice(out);
        drop(queue);
        if count > 0 {
            self.changed.notify_all();
        }
        count
    }

    /// Discard up to `count` samples from the front.
    pub fn discard(&self, count: usize) -> usize {
        let count = self.lock().skip(count);
        if count > 0 {
            self.changed.notify_all();
        }
        count
    }

    pub fn clear(&self) {
        self.lock().clear();
        self.changed.notify_all();
    }
}

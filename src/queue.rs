//! Bounded FIFO with a drop policy for overflow.
//!
//! Each item declares whether it may be sacrificed when the queue is full and
//! in which order. On overflow the oldest item of the lowest drop rank goes
//! first; items without a rank are never dropped to make room, and pushing one
//! into a queue full of other unrankable items is refused and counted. An
//! incoming item never evicts one that ranks above it: a ping arriving at a
//! queue full of statistics is refused instead.

use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};

pub trait Droppable {
    /// `None` = must not be dropped. Lower ranks are dropped first.
    fn drop_rank(&self) -> Option<u8>;
}

impl Droppable for control_protocol::OutboundMessage {
    fn drop_rank(&self) -> Option<u8> {
        use control_protocol::OutboundMessage::*;
        match self {
            Ping(_) => Some(0),
            DeviceStatistics(_) => Some(1),
            WakeWordDetection(_) | TtsPlaybackStatus(_) => None,
        }
    }
}

/// Whether an item of rank `incoming` may take the place of one of rank `victim`.
fn may_evict(incoming: Option<u8>, victim: u8) -> bool {
    incoming.map_or(true, |rank| rank >= victim)
}

#[derive(Debug, PartialEq)]
pub enum PushOutcome<T> {
    Queued,
    /// Queued after evicting this older item.
    Evicted(T),
    /// Not queued; handed back to the caller.
    Rejected(T),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub pushed: u64,
    pub popped: u64,
    pub evicted: u64,
    pub rejected: u64,
    pub max_depth: usize,
}

impl QueueStats {
    pub fn overflows(&self) -> u64 {
        self.evicted + self.rejected
    }
}

struct Inner<T> {
    items: VecDeque<T>,
    stats: QueueStats,
}

pub struct DropQueue<T> {
    inner: Mutex<Inner<T>>,
    ready: Condvar,
    capacity: usize,
}

impl<T: Droppable> DropQueue<T> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(capacity),
                stats: QueueStats::default(),
            }),
            ready: Condvar::new(),
            capacity,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<T>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        self.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().items.is_empty()
    }

    pub fn stats(&self) -> QueueStats {
        self.lock().stats
    }

    pub fn push(&self, item: T) -> PushOutcome<T> {
        let mut inner = self.lock();
        let mut outcome = PushOutcome::Queued;

        if inner.items.len() >= self.capacity {
            let victim = inner
                .items
                .iter()
                .enumerate()
                .filter_map(|(i, queued)| queued.drop_rank().map(|rank| (rank, i)))
                .min();

            match victim {
                Some((rank, index)) if may_evict(item.drop_rank(), rank) => {
                    if let Some(evicted) = inner.items.remove(index) {
                        inner.stats.evicted += 1;
                        outcome = PushOutcome::Evicted(evicted);
                    }
                }
                _ => {
                    inner.stats.rejected += 1;
                    return PushOutcome::Rejected(item);
                }
            }
        }

        inner.items.push_back(item);
        inner.stats.pushed += 1;
        inner.stats.max_depth = inner.stats.max_depth.max(inner.items.len());
        drop(inner);
        self.ready.notify_one();
        outcome
    }

    /// Put an item back at the head, e.g. after a failed send.
    pub fn requeue_front(&self, item: T) -> PushOutcome<T> {
        let mut inner = self.lock();
        if inner.items.len() >= self.capacity {
            // Make room at the tail end for the older item.
            let victim = inner
                .items
                .iter()
                .enumerate()
                .rev()
                .filter_map(|(i, queued)| queued.drop_rank().map(|rank| (rank, i)))
                .min_by_key(|(rank, _)| *rank);
            match victim {
                Some((rank, index)) if may_evict(item.drop_rank(), rank) => {
                    inner.items.remove(index);
                    inner.stats.evicted += 1;
                }
                _ => {
                    inner.stats.rejected += 1;
                    return PushOutcome::Rejected(item);
                }
            }
        }
        inner.items.push_front(item);
        drop(inner);
        self.ready.notify_one();
        PushOutcome::Queued
    }

    pub fn try_pop(&self) -> Option<T> {
        let mut inner = self.lock();
        let item = inner.items.pop_front();
        if item.is_some() {
            inner.stats.popped += 1;
        }
        item
    }

    pub fn pop_timeout(&self, timeout: Duration) -> Option<T> {
        let deadline = Instant::now() + timeout;
        let mut inner = self.lock();
        loop {
            if let Some(item) = inner.items.pop_front() {
                inner.stats.popped += 1;
                return Some(item);
            }
            let now = Instant::now();
            if now >= deadline {
                return None;
            }
            inner = self
                .ready
                .wait_timeout(inner, deadline - now)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }

    /// Remove everything matching `predicate`, returning how many went.
    pub fn remove_where(&self, predicate: impl Fn(&T) -> bool) -> usize {
        let mut inner = self.lock();
        let before = inner.items.len();
        inner.items.retain(|item| !predicate(item));
        before - inner.items.len()
    }

    pub fn clear(&self) -> usize {
        let mut inner = self.lock();
        let count = inner.items.len();
        inner.items.clear();
        count
    }
}

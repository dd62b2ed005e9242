//! Single-slot "latest value" channel between producer threads and the tick.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

/// Holds the most recent value published by a producer.
///
/// Readers never block on the producer and never consume the value: every tick
/// sees whatever was published last. Publishing over a value no reader has seen
/// yet drops it, so a producer running faster than the tick loses frames. The
/// slot is empty until the first publish.
pub struct LatestSlot<T> {
    inner: Arc<SlotInner<T>>,
}

struct SlotInner<T> {
    value: Mutex<SlotValue<T>>,
    dropped: AtomicU64,
}

struct SlotValue<T> {
    latest: Option<Arc<T>>,
    generation: u64,
    seen: bool,
}

impl<T> LatestSlot<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(SlotInner {
                value: Mutex::new(SlotValue {
                    latest: None,
                    generation: 0,
                    seen: true,
                }),
                dropped: AtomicU64::new(0),
            }),
        }
    }

    fn lock(&self) -> MutexGuard<'_, SlotValue<T>> {
        // A producer that panicked mid-publish leaves a valid Option behind.
        self.inner.value.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Replaces the slot's value. Returns true if an unseen value was dropped.
    pub fn publish(&self, value: T) -> bool {
        let mut slot = self.lock();
        let dropped = !slot.seen;
        if dropped {
            self.inner.dropped.fetch_add(1, Ordering::Relaxed);
        }
        slot.latest = Some(Arc::new(value));
        slot.generation += 1;
        slot.seen = false;
        dropped
    }

    /// Returns the latest value without removing it.
    pub fn latest(&self) -> Option<Arc<T>> {
        let mut slot = self.lock();
        slot.seen = true;
        slot.latest.clone()
    }

    /// Returns the latest value only if it was published after `generation`,
    /// together with its generation number.
    pub fn latest_since(&self, generation: u64) -> Option<(u64, Arc<T>)> {
        let mut slot = self.lock();
        if slot.generation <= generation {
            return None;
        }
        slot.seen = true;
        slot.latest.clone().map(|v| (slot.generation, v))
    }

    /// Number of publishes so far.
    pub fn generation(&self) -> u64 {
        self.lock().generation
    }

    /// Number of values overwritten before any reader saw them.
    pub fn dropped(&self) -> u64 {
        self.inner.dropped.load(Ordering::Relaxed)
    }
}

impl<T> Clone for LatestSlot<T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
        }
    }
}

impl<T> Default for LatestSlot<T> {
    fn default() -> Self {
        Self::new()
    }
}

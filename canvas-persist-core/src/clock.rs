//! Timestamp sources for snapshot keys.

use chrono::Utc;
use std::sync::atomic::{AtomicU64, Ordering};

/// Source of millisecond wall-clock timestamps
pub trait Clock: Send + Sync {
    fn now_millis(&self) -> u64;
}

/// Wall clock backed by [`chrono::Utc`]
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> u64 {
        Utc::now().timestamp_millis().max(0) as u64
    }
}

/// Clock that only moves when told to
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicU64,
}

impl ManualClock {
    pub fn new(start: u64) -> Self {
        Self {
            now: AtomicU64::new(start),
        }
    }

    pub fn advance(&self, millis: u64) {
        self.now.fetch_add(millis, Ordering::SeqCst);
    }

    pub fn set(&self, millis: u64) {
        self.now.store(millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> u64 {
        self.now.load(Ordering::SeqCst)
    }
}

impl<C: Clock + ?Sized> Clock for std::sync::Arc<C> {
    fn now_millis(&self) -> u64 {
        (**self).now_millis()
    }
}

/// Issues strictly increasing timestamps from a [`Clock`]
///
/// Two requests within the same millisecond (or a clock that steps
/// backwards) get `last + 1`, so every snapshot key is unique and creation
/// order is total.
#[derive(Debug, Default)]
pub struct MonotonicStamp {
    last: u64,
}

impl MonotonicStamp {
    /// Start after `last`, typically the newest timestamp already persisted
    pub fn after(last: u64) -> Self {
        Self { last }
    }

    pub fn next(&mut self, clock: &dyn Clock) -> u64 {
        let now = clock.now_millis();
        self.last = if now > self.last { now } else { self.last + 1 };
        self.last
    }

    pub fn observe(&mut self, timestamp: u64) {
        self.last = self.last.max(timestamp);
    }
}

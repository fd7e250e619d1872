//! Millisecond clock used for timestamps, round deadlines and rate-limit windows.

use std::sync::atomic::{AtomicI64, Ordering};
use std::time::{Duration, Instant};

pub trait Clock: Send + Sync {
    fn now_ms(&self) -> i64;
}

/// Wall-clock anchored at construction, advanced by a monotonic [`Instant`].
#[derive(Debug)]
pub struct SystemClock {
    base_ms: i64,
    started: Instant,
}

impl SystemClock {
    pub fn new() -> Self { Self { base_ms: chrono::Utc::now().timestamp_millis(), started: Instant::now() } }
}

impl Default for SystemClock {
    fn default() -> Self { Self::new() }
}

impl Clock for SystemClock {
    fn now_ms(&self) -> i64 { self.base_ms + self.started.elapsed().as_millis() as i64 }
}

/// Manually driven clock for deterministic deadline and window tests.
#[derive(Debug, Default)]
pub struct ManualClock {
    now: AtomicI64,
}

impl ManualClock {
    pub fn new(start_ms: i64) -> Self { Self { now: AtomicI64::new(start_ms) } }
    pub fn advance(&self, by: Duration) { self.now.fetch_add(by.as_millis() as i64, Ordering::SeqCst); }
    pub fn set(&self, ms: i64) { self.now.store(ms, Ordering::SeqCst); }
}

impl Clock for ManualClock {
    fn now_ms(&self) -> i64 { self.now.load(Ordering::SeqCst) }
}

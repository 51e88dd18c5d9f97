//! Wall-clock abstraction.
//!
//! Step rotation is defined in terms of wall-clock milliseconds
//! (`floor(t/step)`), not a monotonic `Instant`, so meters and the registry
//! depend on this trait rather than `std::time::Instant` directly. Tests use
//! [`ManualClock`] to drive rotation deterministically, the same way the
//! teacher SDK's `ManualReader` lets tests force a collection without
//! waiting on a real interval.

use std::fmt;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

/// A source of the current wall-clock time, in milliseconds since the Unix
/// epoch.
pub trait Clock: Send + Sync + fmt::Debug {
    fn now_millis(&self) -> i64;
}

/// The real wall clock.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_millis(&self) -> i64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system clock before unix epoch")
            .as_millis() as i64
    }
}

/// A clock whose value is set explicitly. Used by tests (and by registry
/// shutdown, which advances an overridable clock to flush the final window)
/// to exercise step rotation without waiting in real time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<AtomicI64>,
}

impl ManualClock {
    pub fn new(start_millis: i64) -> Self {
        ManualClock {
            now: Arc::new(AtomicI64::new(start_millis)),
        }
    }

    pub fn set(&self, millis: i64) {
        self.now.store(millis, Ordering::SeqCst);
    }

    pub fn advance(&self, delta_millis: i64) {
        self.now.fetch_add(delta_millis, Ordering::SeqCst);
    }
}

impl Clock for ManualClock {
    fn now_millis(&self) -> i64 {
        self.now.load(Ordering::SeqCst)
    }
}

/// A shared, clonable handle to any [`Clock`] implementation.
pub type SharedClock = Arc<dyn Clock>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manual_clock_advances() {
        let clock = ManualClock::new(1_000);
        assert_eq!(clock.now_millis(), 1_000);
        clock.advance(500);
        assert_eq!(clock.now_millis(), 1_500);
        clock.set(9_999);
        assert_eq!(clock.now_millis(), 9_999);
    }
}

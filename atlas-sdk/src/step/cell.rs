//! Two-slot rotating accumulators keyed on wall-clock step boundaries.
//!
//! Each cell tracks which step index its `current` slot belongs to in a
//! single atomic word. A writer that observes a stale index attempts a CAS
//! from the old index to the new one; whichever writer wins performs the
//! rotation (`previous <- current`, or the identity value if more than one
//! step elapsed), everyone else just proceeds to update the now-current
//! slot. `poll` always rotates first so an idle cell reports the identity
//! value for a just-completed window instead of stale data.

use std::sync::atomic::{AtomicI64, Ordering};

use super::atomic_double::AtomicDouble;

/// A step cell over `i64`, combined by summation. Backs `Counter`-adjacent
/// long-sum statistics (e.g. distribution summary `count`).
#[derive(Debug)]
pub struct StepLong {
    step_millis: i64,
    window_step: AtomicI64,
    previous: AtomicI64,
    current: AtomicI64,
}

impl StepLong {
    pub fn new(step_millis: i64) -> Self {
        StepLong {
            step_millis,
            window_step: AtomicI64::new(0),
            previous: AtomicI64::new(0),
            current: AtomicI64::new(0),
        }
    }

    fn rotate(&self, now: i64) {
        let idx = now.div_euclid(self.step_millis);
        let observed = self.window_step.load(Ordering::Acquire);
        if idx == observed {
            return;
        }
        if self
            .window_step
            .compare_exchange(observed, idx, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let rotated = if idx - observed == 1 {
                self.current.swap(0, Ordering::AcqRel)
            } else {
                self.current.store(0, Ordering::Release);
                0
            };
            self.previous.store(rotated, Ordering::Release);
        }
    }

    pub fn add_and_get(&self, now: i64, delta: i64) -> i64 {
        self.rotate(now);
        self.current.fetch_add(delta, Ordering::AcqRel) + delta
    }

    pub fn poll(&self, now: i64) -> i64 {
        self.rotate(now);
        self.previous.load(Ordering::Acquire)
    }

    /// Start of the window whose value `poll` currently returns.
    pub fn timestamp(&self) -> i64 {
        (self.window_step.load(Ordering::Acquire) - 1) * self.step_millis
    }
}

/// A step cell over `f64`, combined by summation. Backs rate-style gauges
/// such as `Counter` and the amount/square-sum statistics of distribution
/// summaries and timers.
#[derive(Debug)]
pub struct StepDouble {
    step_millis: i64,
    window_step: AtomicI64,
    previous: AtomicDouble,
    current: AtomicDouble,
}

impl StepDouble {
    pub fn new(step_millis: i64) -> Self {
        StepDouble {
            step_millis,
            window_step: AtomicI64::new(0),
            previous: AtomicDouble::new(0.0),
            current: AtomicDouble::new(0.0),
        }
    }

    fn rotate(&self, now: i64) {
        let idx = now.div_euclid(self.step_millis);
        let observed = self.window_step.load(Ordering::Acquire);
        if idx == observed {
            return;
        }
        if self
            .window_step
            .compare_exchange(observed, idx, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let rotated = if idx - observed == 1 {
                self.current.get_and_set(0.0)
            } else {
                self.current.set(0.0);
                0.0
            };
            self.previous.set(rotated);
        }
    }

    pub fn add_and_get(&self, now: i64, delta: f64) -> f64 {
        self.rotate(now);
        self.current.add(delta)
    }

    pub fn poll(&self, now: i64) -> f64 {
        self.rotate(now);
        self.previous.get()
    }

    pub fn timestamp(&self) -> i64 {
        (self.window_step.load(Ordering::Acquire) - 1) * self.step_millis
    }
}

/// A step cell over `f64`, combined by max. Identity is `NaN` so that the
/// first `max()` in a window establishes the value regardless of sign.
#[derive(Debug)]
pub struct StepMax {
    step_millis: i64,
    window_step: AtomicI64,
    previous: AtomicDouble,
    current: AtomicDouble,
}

impl StepMax {
    pub fn new(step_millis: i64) -> Self {
        StepMax {
            step_millis,
            window_step: AtomicI64::new(0),
            previous: AtomicDouble::new(f64::NAN),
            current: AtomicDouble::new(f64::NAN),
        }
    }

    fn rotate(&self, now: i64) {
        let idx = now.div_euclid(self.step_millis);
        let observed = self.window_step.load(Ordering::Acquire);
        if idx == observed {
            return;
        }
        if self
            .window_step
            .compare_exchange(observed, idx, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            let rotated = if idx - observed == 1 {
                self.current.get_and_set(f64::NAN)
            } else {
                self.current.set(f64::NAN);
                f64::NAN
            };
            self.previous.set(rotated);
        }
    }

    pub fn max(&self, now: i64, value: f64) -> f64 {
        self.rotate(now);
        self.current.max(value)
    }

    pub fn get_and_set(&self, now: i64, value: f64) -> f64 {
        self.rotate(now);
        self.current.get_and_set(value)
    }

    pub fn poll(&self, now: i64) -> f64 {
        self.rotate(now);
        self.previous.get()
    }

    pub fn timestamp(&self) -> i64 {
        (self.window_step.load(Ordering::Acquire) - 1) * self.step_millis
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn step_long_rolls_window_on_poll() {
        let cell = StepLong::new(1_000);
        cell.add_and_get(10_000, 2);
        cell.add_and_get(10_500, 3);
        assert_eq!(cell.poll(10_999), 0, "window not complete yet");
        assert_eq!(cell.poll(11_000), 5, "completed window reports the sum");
        assert_eq!(cell.poll(12_000), 0, "idle window reports identity");
    }

    #[test]
    fn step_double_gap_clears_previous() {
        let cell = StepDouble::new(1_000);
        cell.add_and_get(10_000, 1.0);
        // Skip straight past the next window boundary without updates.
        assert_eq!(cell.poll(13_000), 0.0);
    }

    #[test]
    fn step_max_first_set_wins_regardless_of_sign() {
        let cell = StepMax::new(1_000);
        cell.max(10_000, -4.0);
        cell.max(10_500, -9.0);
        assert_eq!(cell.poll(11_000), -4.0);
    }

    #[test]
    fn timestamp_is_non_decreasing() {
        let cell = StepLong::new(1_000);
        let t1 = cell.timestamp();
        cell.poll(10_000);
        let t2 = cell.timestamp();
        cell.poll(11_000);
        let t3 = cell.timestamp();
        assert!(t2 >= t1);
        assert!(t3 >= t2);
    }
}

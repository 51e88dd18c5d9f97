use std::cell::Cell;
use std::sync::Arc;
use std::time::Duration;

use super::{is_valid_amount, Counter, DistributionSummary, Timer};

/// Local, non-atomic accumulation in front of a [`Counter`], flushed once
/// every `threshold` increments (or on `flush`/drop). Meant to be held
/// thread-locally by a hot loop that would otherwise pay one CAS retry per
/// increment; batching trades timeliness (values are invisible to
/// `measure` until flushed) for throughput.
///
/// The wrapped counter's reference count is bumped for the updater's
/// lifetime, so it cannot be reaped by the registry's expiration sweep
/// between construction and the first flush even if nothing has been
/// recorded on it directly.
#[derive(Debug)]
pub struct BatchUpdater {
    counter: Arc<Counter>,
    threshold: u64,
    local_sum: Cell<f64>,
    local_count: Cell<u64>,
}

impl BatchUpdater {
    pub fn new(counter: Arc<Counter>, threshold: u64) -> Self {
        counter.base().inc_ref();
        BatchUpdater {
            counter,
            threshold: threshold.max(1),
            local_sum: Cell::new(0.0),
            local_count: Cell::new(0),
        }
    }

    pub fn increment(&self) {
        self.add(1.0);
    }

    pub fn add(&self, amount: f64) {
        self.local_sum.set(self.local_sum.get() + amount);
        let count = self.local_count.get() + 1;
        if count >= self.threshold {
            self.flush();
        } else {
            self.local_count.set(count);
        }
    }

    /// Pushes the local accumulator into the wrapped counter and resets it.
    /// A no-op when nothing has accumulated since the last flush.
    pub fn flush(&self) {
        let sum = self.local_sum.replace(0.0);
        self.local_count.set(0);
        if sum != 0.0 {
            self.counter.add(sum);
        }
    }
}

impl Drop for BatchUpdater {
    fn drop(&mut self) {
        self.flush();
        self.counter.base().dec_ref();
    }
}

/// Local accumulation in front of a [`DistributionSummary`], flushed once
/// every `threshold` records (or on `flush`/drop). Tracks count, sum,
/// sum-of-squares and max locally and folds them into the summary's step
/// cells in one shot via `record_aggregate`, rather than replaying each
/// buffered amount through `record` individually.
#[derive(Debug)]
pub struct DistributionSummaryBatchUpdater {
    summary: Arc<DistributionSummary>,
    threshold: u64,
    local_count: Cell<u64>,
    local_sum: Cell<f64>,
    local_sum_of_squares: Cell<f64>,
    local_max: Cell<f64>,
}

impl DistributionSummaryBatchUpdater {
    pub fn new(summary: Arc<DistributionSummary>, threshold: u64) -> Self {
        summary.base().inc_ref();
        DistributionSummaryBatchUpdater {
            summary,
            threshold: threshold.max(1),
            local_count: Cell::new(0),
            local_sum: Cell::new(0.0),
            local_sum_of_squares: Cell::new(0.0),
            local_max: Cell::new(f64::NAN),
        }
    }

    pub fn record(&self, amount: f64) {
        if is_valid_amount(amount) {
            self.local_sum.set(self.local_sum.get() + amount);
            self.local_sum_of_squares.set(self.local_sum_of_squares.get() + amount * amount);
            let max = self.local_max.get();
            if amount > max || max.is_nan() {
                self.local_max.set(amount);
            }
        }
        let count = self.local_count.get() + 1;
        if count >= self.threshold {
            self.local_count.set(count);
            self.flush();
        } else {
            self.local_count.set(count);
        }
    }

    /// Pushes the local accumulator into the wrapped summary and resets it.
    /// A no-op when nothing has accumulated since the last flush.
    pub fn flush(&self) {
        let count = self.local_count.replace(0);
        let sum = self.local_sum.replace(0.0);
        let sum_of_squares = self.local_sum_of_squares.replace(0.0);
        let max = self.local_max.replace(f64::NAN);
        if count > 0 {
            self.summary.record_aggregate(count, sum, sum_of_squares, max);
        }
    }
}

impl Drop for DistributionSummaryBatchUpdater {
    fn drop(&mut self) {
        self.flush();
        self.summary.base().dec_ref();
    }
}

/// Local accumulation in front of a [`Timer`], flushed once every
/// `threshold` records (or on `flush`/drop). Same shape as
/// [`DistributionSummaryBatchUpdater`], over nanosecond durations.
#[derive(Debug)]
pub struct TimerBatchUpdater {
    timer: Arc<Timer>,
    threshold: u64,
    local_count: Cell<u64>,
    local_sum_nanos: Cell<f64>,
    local_sum_of_squares_nanos: Cell<f64>,
    local_max_nanos: Cell<f64>,
}

impl TimerBatchUpdater {
    pub fn new(timer: Arc<Timer>, threshold: u64) -> Self {
        timer.base().inc_ref();
        TimerBatchUpdater {
            timer,
            threshold: threshold.max(1),
            local_count: Cell::new(0),
            local_sum_nanos: Cell::new(0.0),
            local_sum_of_squares_nanos: Cell::new(0.0),
            local_max_nanos: Cell::new(f64::NAN),
        }
    }

    pub fn record(&self, duration: Duration) {
        let nanos = duration.as_nanos() as f64;
        if is_valid_amount(nanos) {
            self.local_sum_nanos.set(self.local_sum_nanos.get() + nanos);
            self.local_sum_of_squares_nanos
                .set(self.local_sum_of_squares_nanos.get() + nanos * nanos);
            let max = self.local_max_nanos.get();
            if nanos > max || max.is_nan() {
                self.local_max_nanos.set(nanos);
            }
        }
        let count = self.local_count.get() + 1;
        if count >= self.threshold {
            self.local_count.set(count);
            self.flush();
        } else {
            self.local_count.set(count);
        }
    }

    /// Pushes the local accumulator into the wrapped timer and resets it.
    /// A no-op when nothing has accumulated since the last flush.
    pub fn flush(&self) {
        let count = self.local_count.replace(0);
        let sum = self.local_sum_nanos.replace(0.0);
        let sum_of_squares = self.local_sum_of_squares_nanos.replace(0.0);
        let max = self.local_max_nanos.replace(f64::NAN);
        if count > 0 {
            self.timer.record_aggregate(count, sum, sum_of_squares, max);
        }
    }
}

impl Drop for TimerBatchUpdater {
    fn drop(&mut self) {
        self.flush();
        self.timer.base().dec_ref();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::meters::Meter;
    use atlas_core::Id;

    #[test]
    fn flushes_automatically_once_threshold_is_reached() {
        let clock = Arc::new(ManualClock::new(10_000));
        let counter = Arc::new(Counter::new(Id::new("x", []), clock.clone(), 60_000, 10_000));
        let updater = BatchUpdater::new(counter.clone(), 3);
        updater.increment();
        updater.increment();
        assert_eq!(counter.base().has_expired(10_000), false);
        updater.increment(); // hits threshold, flushes
        clock.set(20_000);
        let mut out = Vec::new();
        counter.measure(clock.now_millis(), &mut |m| out.push(m));
        assert_eq!(out[0].value, 0.3); // 3 / 10s
    }

    #[test]
    fn drop_flushes_any_remainder_and_releases_the_ref_count() {
        let clock = Arc::new(ManualClock::new(10_000));
        let counter = Arc::new(Counter::new(Id::new("x", []), clock.clone(), 60_000, 10_000));
        {
            let updater = BatchUpdater::new(counter.clone(), 100);
            updater.increment();
            assert!(!counter.base().has_expired(999_999));
        }
        assert!(counter.base().has_expired(999_999));
        clock.set(20_000);
        let mut out = Vec::new();
        counter.measure(clock.now_millis(), &mut |m| out.push(m));
        assert_eq!(out[0].value, 0.1);
    }

    #[test]
    fn distribution_summary_updater_folds_count_sum_squares_and_max_on_flush() {
        let clock = Arc::new(ManualClock::new(10_000));
        let summary = Arc::new(DistributionSummary::new(Id::new("payload", []), clock.clone(), 60_000, 10_000));
        let updater = DistributionSummaryBatchUpdater::new(summary.clone(), 3);
        updater.record(100.0);
        updater.record(200.0);
        assert_eq!(summary.base().has_expired(10_000), false);
        updater.record(300.0); // hits threshold, flushes
        clock.set(20_000);
        let mut out = Vec::new();
        summary.measure(clock.now_millis(), &mut |m| out.push(m));
        let get = |stat: &str| out.iter().find(|m| m.id.get("statistic") == Some(stat)).unwrap();
        assert_eq!(get("count").value, 0.3); // 3 / 10s
        assert_eq!(get("totalAmount").value, 60.0); // 600 / 10s
        assert_eq!(get("max").value, 300.0);
        let expected_squares = (100f64 * 100.0 + 200.0 * 200.0 + 300.0 * 300.0) / 10.0;
        assert_eq!(get("totalOfSquares").value, expected_squares);
    }

    #[test]
    fn distribution_summary_updater_drop_flushes_remainder_and_releases_ref_count() {
        let clock = Arc::new(ManualClock::new(10_000));
        let summary = Arc::new(DistributionSummary::new(Id::new("payload", []), clock.clone(), 60_000, 10_000));
        {
            let updater = DistributionSummaryBatchUpdater::new(summary.clone(), 100);
            updater.record(5.0);
            assert!(!summary.base().has_expired(999_999));
        }
        assert!(summary.base().has_expired(999_999));
        clock.set(20_000);
        let mut out = Vec::new();
        summary.measure(clock.now_millis(), &mut |m| out.push(m));
        let get = |stat: &str| out.iter().find(|m| m.id.get("statistic") == Some(stat)).unwrap();
        assert_eq!(get("count").value, 0.1);
        assert_eq!(get("max").value, 5.0);
    }

    #[test]
    fn timer_updater_folds_count_sum_squares_and_max_on_flush() {
        let clock = Arc::new(ManualClock::new(10_000));
        let timer = Arc::new(Timer::new(Id::new("latency", []), clock.clone(), 60_000, 10_000));
        let updater = TimerBatchUpdater::new(timer.clone(), 2);
        updater.record(Duration::from_millis(100));
        assert_eq!(timer.base().has_expired(10_000), false);
        updater.record(Duration::from_millis(200)); // hits threshold, flushes
        clock.set(20_000);
        let mut out = Vec::new();
        timer.measure(clock.now_millis(), &mut |m| out.push(m));
        let get = |stat: &str| out.iter().find(|m| m.id.get("statistic") == Some(stat)).unwrap();
        assert_eq!(get("count").value, 0.2);
        assert!((get("totalTime").value - 0.03).abs() < 1e-9); // (0.1+0.2)s / 10s
        assert!((get("max").value - 0.2).abs() < 1e-9);
    }

    #[test]
    fn timer_updater_drop_flushes_remainder_and_releases_ref_count() {
        let clock = Arc::new(ManualClock::new(10_000));
        let timer = Arc::new(Timer::new(Id::new("latency", []), clock.clone(), 60_000, 10_000));
        {
            let updater = TimerBatchUpdater::new(timer.clone(), 100);
            updater.record(Duration::from_millis(50));
            assert!(!timer.base().has_expired(999_999));
        }
        assert!(timer.base().has_expired(999_999));
        clock.set(20_000);
        let mut out = Vec::new();
        timer.measure(clock.now_millis(), &mut |m| out.push(m));
        let get = |stat: &str| out.iter().find(|m| m.id.get("statistic") == Some(stat)).unwrap();
        assert_eq!(get("count").value, 0.1);
    }
}

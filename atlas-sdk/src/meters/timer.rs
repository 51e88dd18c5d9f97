use std::sync::Arc;
use std::time::Duration;

use atlas_core::{Id, Measurement};

use crate::clock::SharedClock;
use crate::step::{StepDouble, StepLong, StepMax};

use super::{is_valid_amount, Meter, MeterBase};

const NANOS_PER_SECOND: f64 = 1e-9;
const NANOS_SQUARED_PER_SECOND_SQUARED: f64 = 1e-18;

/// Same shape as [`DistributionSummary`](super::DistributionSummary) but
/// recorded in nanoseconds: `record` takes a [`Duration`], and `measure`
/// converts `totalTime` and `max` back to seconds (scale `1e-9`) and
/// `totalOfSquares` to seconds squared (scale `1e-18`) on the way out.
#[derive(Debug)]
pub struct Timer {
    base: MeterBase,
    count: StepLong,
    total_time: StepLong,
    total_of_squares: StepDouble,
    max: StepMax,
    step_millis: i64,
}

impl Timer {
    pub fn new(id: Id, clock: SharedClock, ttl_millis: i64, step_millis: i64) -> Self {
        Timer {
            base: MeterBase::new(id, clock, ttl_millis),
            count: StepLong::new(step_millis),
            total_time: StepLong::new(step_millis),
            total_of_squares: StepDouble::new(step_millis),
            max: StepMax::new(step_millis),
            step_millis,
        }
    }

    pub fn record(&self, duration: Duration) {
        let now = self.base.now();
        self.count.add_and_get(now, 1);
        let nanos = duration.as_nanos() as f64;
        if is_valid_amount(nanos) {
            self.total_time.add_and_get(now, nanos as i64);
            self.total_of_squares.add_and_get(now, nanos * nanos);
            self.max.max(now, nanos);
        }
        self.base.touch(now);
    }

    /// Folds a locally pre-aggregated batch of nanosecond durations (see
    /// [`super::BatchUpdater`]'s timer counterpart) straight into the step
    /// cells in one shot, the same count-everything/accumulate-valid-only
    /// split as `record`.
    pub(crate) fn record_aggregate(
        &self,
        total_count: u64,
        valid_sum_nanos: f64,
        valid_sum_of_squares_nanos: f64,
        valid_max_nanos: f64,
    ) {
        let now = self.base.now();
        self.count.add_and_get(now, total_count as i64);
        self.total_time.add_and_get(now, valid_sum_nanos as i64);
        self.total_of_squares.add_and_get(now, valid_sum_of_squares_nanos);
        self.max.max(now, valid_max_nanos);
        self.base.touch(now);
    }

    pub(crate) fn base(&self) -> &MeterBase {
        &self.base
    }

    fn rate(&self, value: f64) -> f64 {
        value / (self.step_millis as f64 / 1_000.0)
    }
}

impl Meter for Timer {
    fn id(&self) -> &Id {
        self.base.id()
    }

    fn measure(&self, now: i64, sink: &mut dyn FnMut(Measurement)) {
        let count = self.count.poll(now);
        sink(Measurement::new(
            self.base
                .id()
                .with_tag("statistic", "count")
                .with_tag("atlas.dstype", "rate"),
            self.count.timestamp(),
            self.rate(count as f64),
        ));

        let total_time = self.total_time.poll(now);
        sink(Measurement::new(
            self.base
                .id()
                .with_tag("statistic", "totalTime")
                .with_tag("atlas.dstype", "rate"),
            self.total_time.timestamp(),
            self.rate(total_time as f64 * NANOS_PER_SECOND),
        ));

        let squares = self.total_of_squares.poll(now);
        sink(Measurement::new(
            self.base
                .id()
                .with_tag("statistic", "totalOfSquares")
                .with_tag("atlas.dstype", "rate"),
            self.total_of_squares.timestamp(),
            self.rate(squares * NANOS_SQUARED_PER_SECOND_SQUARED),
        ));

        let max = self.max.poll(now);
        sink(Measurement::new(
            self.base
                .id()
                .with_tag("statistic", "max")
                .with_tag("atlas.dstype", "gauge"),
            self.max.timestamp(),
            max * NANOS_PER_SECOND,
        ));
    }

    fn has_expired(&self, now: i64) -> bool {
        self.base.has_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    #[test]
    fn converts_nanoseconds_to_seconds_on_emit() {
        let clock = Arc::new(ManualClock::new(0));
        let t = Timer::new(Id::new("latency", []), clock.clone(), 60_000, 10_000);
        clock.set(10_000);
        t.record(Duration::from_millis(100));
        t.record(Duration::from_millis(200));
        clock.set(20_000);
        let mut out = Vec::new();
        t.measure(clock.now_millis(), &mut |m| out.push(m));
        let get = |stat: &str| out.iter().find(|m| m.id.get("statistic") == Some(stat)).unwrap();
        assert_eq!(get("count").value, 0.2);
        assert!((get("totalTime").value - 0.03).abs() < 1e-9); // (0.1+0.2)s / 10s
        assert!((get("max").value - 0.2).abs() < 1e-9);
        let expected_squares = (0.1f64 * 0.1 + 0.2 * 0.2) / 10.0;
        assert!((get("totalOfSquares").value - expected_squares).abs() < 1e-9);
    }
}

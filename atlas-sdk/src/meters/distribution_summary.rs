use std::sync::Arc;

use atlas_core::{Id, Measurement};

use crate::clock::SharedClock;
use crate::step::{StepLong, StepMax};

use super::{is_valid_amount, Meter, MeterBase};

/// Tracks the distribution of a stream of non-negative amounts with four
/// cells: `count` and `totalAmount` (long sums), `totalOfSquares` (a double
/// sum, since squaring a large amount easily overflows `i64`), and `max`.
#[derive(Debug)]
pub struct DistributionSummary {
    base: MeterBase,
    count: StepLong,
    total_amount: StepLong,
    total_of_squares: crate::step::StepDouble,
    max: StepMax,
    step_millis: i64,
}

impl DistributionSummary {
    pub fn new(id: Id, clock: SharedClock, ttl_millis: i64, step_millis: i64) -> Self {
        DistributionSummary {
            base: MeterBase::new(id, clock, ttl_millis),
            count: StepLong::new(step_millis),
            total_amount: StepLong::new(step_millis),
            total_of_squares: crate::step::StepDouble::new(step_millis),
            max: StepMax::new(step_millis),
            step_millis,
        }
    }

    pub fn record(&self, amount: f64) {
        let now = self.base.now();
        self.count.add_and_get(now, 1);
        if is_valid_amount(amount) {
            self.total_amount.add_and_get(now, amount as i64);
            self.total_of_squares.add_and_get(now, amount * amount);
            self.max.max(now, amount);
        }
        self.base.touch(now);
    }

    /// Folds a locally pre-aggregated batch (see [`super::BatchUpdater`]'s
    /// distribution-summary counterpart) straight into the step cells in
    /// one shot: `valid_sum`/`valid_sum_of_squares`/`valid_max` cover only
    /// the amounts that passed [`is_valid_amount`], `total_count` every
    /// recorded amount including rejected ones, matching `record`'s own
    /// count-everything/accumulate-valid-only split.
    pub(crate) fn record_aggregate(&self, total_count: u64, valid_sum: f64, valid_sum_of_squares: f64, valid_max: f64) {
        let now = self.base.now();
        self.count.add_and_get(now, total_count as i64);
        self.total_amount.add_and_get(now, valid_sum as i64);
        self.total_of_squares.add_and_get(now, valid_sum_of_squares);
        self.max.max(now, valid_max);
        self.base.touch(now);
    }

    pub(crate) fn base(&self) -> &MeterBase {
        &self.base
    }

    fn rate(&self, value: f64) -> f64 {
        value / (self.step_millis as f64 / 1_000.0)
    }
}

impl Meter for DistributionSummary {
    fn id(&self) -> &Id {
        self.base.id()
    }

    fn measure(&self, now: i64, sink: &mut dyn FnMut(Measurement)) {
        let count = self.count.poll(now);
        let count_ts = self.count.timestamp();
        sink(Measurement::new(
            self.base
                .id()
                .with_tag("statistic", "count")
                .with_tag("atlas.dstype", "rate"),
            count_ts,
            self.rate(count as f64),
        ));

        let amount = self.total_amount.poll(now);
        let amount_ts = self.total_amount.timestamp();
        sink(Measurement::new(
            self.base
                .id()
                .with_tag("statistic", "totalAmount")
                .with_tag("atlas.dstype", "rate"),
            amount_ts,
            self.rate(amount as f64),
        ));

        let squares = self.total_of_squares.poll(now);
        let squares_ts = self.total_of_squares.timestamp();
        sink(Measurement::new(
            self.base
                .id()
                .with_tag("statistic", "totalOfSquares")
                .with_tag("atlas.dstype", "rate"),
            squares_ts,
            self.rate(squares),
        ));

        let max = self.max.poll(now);
        let max_ts = self.max.timestamp();
        sink(Measurement::new(
            self.base
                .id()
                .with_tag("statistic", "max")
                .with_tag("atlas.dstype", "gauge"),
            max_ts,
            max,
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
    fn emits_four_cells_with_expected_rates_and_max() {
        let clock = Arc::new(ManualClock::new(0));
        let ds = DistributionSummary::new(Id::new("payload", []), clock.clone(), 60_000, 10_000);
        clock.set(10_000);
        ds.record(100.0);
        ds.record(200.0);
        clock.set(20_000);
        let mut out = Vec::new();
        ds.measure(clock.now_millis(), &mut |m| out.push(m));
        assert_eq!(out.len(), 4);
        let get = |stat: &str| out.iter().find(|m| m.id.get("statistic") == Some(stat)).unwrap();
        assert_eq!(get("count").value, 0.2);
        assert_eq!(get("totalAmount").value, 30.0); // 300 / 10s
        assert_eq!(get("totalOfSquares").value, (100f64 * 100.0 + 200.0 * 200.0) / 10.0);
        assert_eq!(get("max").value, 200.0);
    }

    #[test]
    fn negative_amounts_still_count_but_skip_amount_cells() {
        let clock = Arc::new(ManualClock::new(0));
        let ds = DistributionSummary::new(Id::new("payload", []), clock.clone(), 60_000, 10_000);
        clock.set(10_000);
        ds.record(-5.0);
        clock.set(20_000);
        let mut out = Vec::new();
        ds.measure(clock.now_millis(), &mut |m| out.push(m));
        let get = |stat: &str| out.iter().find(|m| m.id.get("statistic") == Some(stat)).unwrap();
        assert_eq!(get("count").value, 0.1);
        assert_eq!(get("totalAmount").value, 0.0);
        assert!(get("max").value.is_nan());
    }
}

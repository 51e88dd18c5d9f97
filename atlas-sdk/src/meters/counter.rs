use std::sync::Arc;

use atlas_core::{Id, Measurement};

use crate::clock::SharedClock;
use crate::step::StepDouble;

use super::{is_valid_amount, Meter, MeterBase};

/// Monotonic rate counter. `increment`/`add` accumulate into a per-step
/// sum; `measure` emits the completed window as a rate (value divided by
/// the step duration in seconds), tagged `statistic=count,
/// atlas.dstype=rate`.
#[derive(Debug)]
pub struct Counter {
    base: MeterBase,
    step: StepDouble,
    step_millis: i64,
}

impl Counter {
    pub fn new(id: Id, clock: SharedClock, ttl_millis: i64, step_millis: i64) -> Self {
        Counter {
            base: MeterBase::new(id, clock, ttl_millis),
            step: StepDouble::new(step_millis),
            step_millis,
        }
    }

    pub fn increment(&self) {
        self.add(1.0);
    }

    pub fn add(&self, amount: f64) {
        if !is_valid_amount(amount) {
            return;
        }
        let now = self.base.now();
        self.step.add_and_get(now, amount);
        self.base.touch(now);
    }

    pub(crate) fn base(&self) -> &MeterBase {
        &self.base
    }

    fn emit(&self, now: i64, sink: &mut dyn FnMut(Measurement)) {
        let value = self.step.poll(now);
        let ts = self.step.timestamp();
        let rate = value / (self.step_millis as f64 / 1_000.0);
        let id = self
            .base
            .id()
            .with_tag("statistic", "count")
            .with_tag("atlas.dstype", "rate");
        sink(Measurement::new(id, ts, rate));
    }
}

impl Meter for Counter {
    fn id(&self) -> &Id {
        self.base.id()
    }

    fn measure(&self, now: i64, sink: &mut dyn FnMut(Measurement)) {
        self.emit(now, sink);
    }

    fn has_expired(&self, now: i64) -> bool {
        self.base.has_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn counter() -> (Arc<ManualClock>, Counter) {
        let clock = Arc::new(ManualClock::new(0));
        let c = Counter::new(Id::new("requests", []), clock.clone(), 60_000, 10_000);
        (clock, c)
    }

    #[test]
    fn increment_accumulates_and_emits_as_rate() {
        let (clock, c) = counter();
        clock.set(10_000);
        c.increment();
        c.increment();
        clock.set(20_000);
        let mut out = Vec::new();
        c.measure(clock.now_millis(), &mut |m| out.push(m));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 0.2); // 2 / 10s
        assert_eq!(out[0].id.get("statistic"), Some("count"));
        assert_eq!(out[0].id.get("atlas.dstype"), Some("rate"));
    }

    #[test]
    fn negative_and_nonfinite_amounts_are_ignored() {
        let (clock, c) = counter();
        clock.set(10_000);
        c.add(-5.0);
        c.add(f64::NAN);
        clock.set(20_000);
        let mut out = Vec::new();
        c.measure(clock.now_millis(), &mut |m| out.push(m));
        assert_eq!(out[0].value, 0.0);
    }
}

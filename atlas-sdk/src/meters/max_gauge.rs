use atlas_core::{Id, Measurement};

use crate::clock::SharedClock;
use crate::step::StepMax;

use super::{Meter, MeterBase};

/// A gauge that reports the largest value `set` within each step window,
/// rather than the last one, useful for things like "peak queue depth
/// this interval" where overwrite-gauge semantics would lose spikes that
/// happen between polls.
#[derive(Debug)]
pub struct MaxGauge {
    base: MeterBase,
    step: StepMax,
}

impl MaxGauge {
    pub fn new(id: Id, clock: SharedClock, ttl_millis: i64, step_millis: i64) -> Self {
        MaxGauge {
            base: MeterBase::new(id, clock, ttl_millis),
            step: StepMax::new(step_millis),
        }
    }

    pub fn set(&self, value: f64) {
        let now = self.base.now();
        self.step.max(now, value);
        self.base.touch(now);
    }
}

impl Meter for MaxGauge {
    fn id(&self) -> &Id {
        self.base.id()
    }

    fn measure(&self, now: i64, sink: &mut dyn FnMut(Measurement)) {
        let value = self.step.poll(now);
        let ts = self.step.timestamp();
        let id = self
            .base
            .id()
            .with_tag("statistic", "max")
            .with_tag("atlas.dstype", "gauge");
        sink(Measurement::new(id, ts, value));
    }

    fn has_expired(&self, now: i64) -> bool {
        self.base.has_expired(now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use std::sync::Arc;

    #[test]
    fn reports_the_largest_set_value_in_the_window() {
        let clock = Arc::new(ManualClock::new(0));
        let g = MaxGauge::new(Id::new("peak", []), clock.clone(), 60_000, 10_000);
        clock.set(10_000);
        g.set(3.0);
        g.set(9.0);
        g.set(-1.0);
        clock.set(20_000);
        let mut out = Vec::new();
        g.measure(clock.now_millis(), &mut |m| out.push(m));
        assert_eq!(out[0].value, 9.0);
    }
}

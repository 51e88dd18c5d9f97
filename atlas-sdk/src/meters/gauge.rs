use atlas_core::{Id, Measurement};

use crate::clock::SharedClock;
use crate::step::AtomicDouble;

use super::{Meter, MeterBase};

/// A plain overwrite gauge: `set` replaces the current value outright, with
/// no per-step accumulation. `measure` always reports whatever was last
/// set, tagged `statistic=gauge, atlas.dstype=gauge`, at the current time , 
/// unlike the step-cell meters there's no "completed window" to wait for.
#[derive(Debug)]
pub struct Gauge {
    base: MeterBase,
    value: AtomicDouble,
}

impl Gauge {
    pub fn new(id: Id, clock: SharedClock, ttl_millis: i64) -> Self {
        Gauge {
            base: MeterBase::new(id, clock, ttl_millis),
            value: AtomicDouble::new(f64::NAN),
        }
    }

    pub fn set(&self, value: f64) {
        self.value.set(value);
        self.base.touch(self.base.now());
    }

    pub fn get(&self) -> f64 {
        self.value.get()
    }
}

impl Meter for Gauge {
    fn id(&self) -> &Id {
        self.base.id()
    }

    fn measure(&self, now: i64, sink: &mut dyn FnMut(Measurement)) {
        let id = self
            .base
            .id()
            .with_tag("statistic", "gauge")
            .with_tag("atlas.dstype", "gauge");
        sink(Measurement::new(id, now, self.value.get()));
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
    fn set_overwrites_and_emits_immediately() {
        let clock = Arc::new(ManualClock::new(1_000));
        let g = Gauge::new(Id::new("queueSize", []), clock.clone(), 60_000);
        g.set(4.0);
        g.set(7.0);
        let mut out = Vec::new();
        g.measure(clock.now_millis(), &mut |m| out.push(m));
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].value, 7.0);
        assert_eq!(out[0].id.get("statistic"), Some("gauge"));
    }

    #[test]
    fn unset_gauge_reports_nan() {
        let clock = Arc::new(ManualClock::new(0));
        let g = Gauge::new(Id::new("x", []), clock.clone(), 60_000);
        let mut out = Vec::new();
        g.measure(clock.now_millis(), &mut |m| out.push(m));
        assert!(out[0].value.is_nan());
    }
}

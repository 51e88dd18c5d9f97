use std::fmt;

use crate::Id;

/// Names which statistic a particular emitted value represents. Carried as
/// the `statistic` tag on emitted measurements, and used to pick a
/// consolidation function (sum-average vs. max) when rolling fine steps up
/// into a coarser publish step.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Statistic {
    Count,
    TotalAmount,
    TotalTime,
    TotalOfSquares,
    Max,
    Percentile,
    Gauge,
}

impl Statistic {
    /// `true` for statistics that consolidate by summation and averaging
    /// across the multiple (count, totalAmount, totalTime, totalOfSquares,
    /// percentile); `false` for statistics that consolidate by max (max,
    /// gauge).
    pub fn is_sum_based(self) -> bool {
        matches!(
            self,
            Statistic::Count
                | Statistic::TotalAmount
                | Statistic::TotalTime
                | Statistic::TotalOfSquares
                | Statistic::Percentile
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Statistic::Count => "count",
            Statistic::TotalAmount => "totalAmount",
            Statistic::TotalTime => "totalTime",
            Statistic::TotalOfSquares => "totalOfSquares",
            Statistic::Max => "max",
            Statistic::Percentile => "percentile",
            Statistic::Gauge => "gauge",
        }
    }

    /// Parses a `statistic` tag value back into a [`Statistic`]. Used
    /// wherever a consolidator's sum-vs-max selection has to be recovered
    /// from an already-tagged [`crate::Id`] rather than from the meter
    /// that produced it (the registry's publish path, the evaluator's
    /// per-subscription consolidators).
    pub fn parse(tag_value: &str) -> Option<Statistic> {
        match tag_value {
            "count" => Some(Statistic::Count),
            "totalAmount" => Some(Statistic::TotalAmount),
            "totalTime" => Some(Statistic::TotalTime),
            "totalOfSquares" => Some(Statistic::TotalOfSquares),
            "max" => Some(Statistic::Max),
            "percentile" => Some(Statistic::Percentile),
            "gauge" => Some(Statistic::Gauge),
            _ => None,
        }
    }
}

impl fmt::Display for Statistic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The datum-shape tag: whether an emitted value is a per-second rate or an
/// instantaneous gauge reading.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum DsType {
    Rate,
    Gauge,
}

impl DsType {
    pub fn as_str(self) -> &'static str {
        match self {
            DsType::Rate => "rate",
            DsType::Gauge => "gauge",
        }
    }
}

impl fmt::Display for DsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A transient `(id, timestamp, value)` triple emitted by a meter (or read
/// back out of a consolidator) at a step boundary. Measurements are never
/// stored beyond the tick that produces them, they're the unit the
/// registry ships to the publish and streaming-eval sinks.
#[derive(Clone, Debug, PartialEq)]
pub struct Measurement {
    pub id: Id,
    pub timestamp: i64,
    pub value: f64,
}

impl Measurement {
    pub fn new(id: Id, timestamp: i64, value: f64) -> Self {
        Measurement {
            id,
            timestamp,
            value,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn statistic_parse_round_trips_every_known_tag() {
        for s in [
            Statistic::Count,
            Statistic::TotalAmount,
            Statistic::TotalTime,
            Statistic::TotalOfSquares,
            Statistic::Max,
            Statistic::Percentile,
            Statistic::Gauge,
        ] {
            assert_eq!(Statistic::parse(s.as_str()), Some(s));
        }
    }

    #[test]
    fn statistic_parse_rejects_unknown_tags() {
        assert_eq!(Statistic::parse("bogus"), None);
    }

    #[test]
    fn is_sum_based_matches_the_consolidator_selection_rule() {
        assert!(Statistic::Count.is_sum_based());
        assert!(Statistic::Percentile.is_sum_based());
        assert!(!Statistic::Max.is_sum_based());
        assert!(!Statistic::Gauge.is_sum_based());
    }
}

//! The publish and streaming-eval payload shapes (spec §6) plus the
//! `Publisher`/`EvalPublisher` transport seams the registry hands batches
//! to. HTTP transport is out of scope for the core design beyond these
//! interface contracts; [`HttpPublisher`]/[`HttpEvalPublisher`] (behind the
//! `http` feature) are the production implementations built on
//! [`atlas_http::HttpClient`].

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use atlas_core::{AtlasError, Measurement};

#[cfg(feature = "http")]
mod http_sink;
#[cfg(feature = "http")]
pub use http_sink::{HttpEvalPublisher, HttpPublisher};

/// One measurement's tags (including `name`), timestamp and value, shaped
/// for the publish payload.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PublishMetric {
    pub tags: BTreeMap<Arc<str>, Arc<str>>,
    pub timestamp: i64,
    pub value: f64,
}

/// `{"tags": {k:v,...}, "metrics": [...]}`, common tags appear once at
/// top level, per-measurement tags carry everything else.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct PublishPayload {
    pub tags: BTreeMap<Arc<str>, Arc<str>>,
    pub metrics: Vec<PublishMetric>,
}

impl PublishPayload {
    /// Converts a [`Measurement`] into a [`PublishMetric`], defaulting
    /// `atlas.dstype` to `gauge` when the measurement didn't already carry
    /// one (spec §6: "`atlas.dstype` defaults to `gauge` if not otherwise
    /// present").
    pub fn metric_from_measurement(m: &Measurement) -> PublishMetric {
        let mut tags: BTreeMap<Arc<str>, Arc<str>> = m
            .id
            .entries()
            .map(|(k, v)| (Arc::from(k), Arc::from(v)))
            .collect();
        tags.entry(Arc::from("atlas.dstype")).or_insert_with(|| Arc::from("gauge"));
        PublishMetric {
            tags,
            timestamp: m.timestamp,
            value: m.value,
        }
    }
}

/// One subscription's matched id, tags and value, shaped for the eval
/// payload.
#[derive(Clone, Debug, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EvalMetric {
    pub id: Arc<str>,
    pub tags: BTreeMap<Arc<str>, Arc<str>>,
    pub value: f64,
}

/// `{"timestamp": ms, "metrics": [...]}`.
#[derive(Clone, Debug, Default, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct EvalPayload {
    pub timestamp: i64,
    pub metrics: Vec<EvalMetric>,
}

/// How a publish attempt was classified, per the design's error-handling
/// section: a `202`/`400` validation response's `errorCount` is attributed
/// to `dropped_invalid`, the remainder to `sent`.
#[derive(Clone, Copy, Debug, Default, PartialEq)]
pub struct PublishOutcome {
    pub sent: u64,
    pub dropped_invalid: u64,
    pub clock_skew_millis: Option<i64>,
}

/// The periodic-publish sink. One call per (rollup-partitioned,
/// batch-sliced) group of measurements per publish tick.
#[async_trait]
pub trait Publisher: std::fmt::Debug + Send + Sync {
    async fn publish(&self, payload: PublishPayload) -> Result<PublishOutcome, AtlasError>;
}

/// The streaming-evaluation sink. One call per batch-sliced group of
/// subscription results per LWC tick.
#[async_trait]
pub trait EvalPublisher: std::fmt::Debug + Send + Sync {
    async fn publish_eval(&self, payload: EvalPayload) -> Result<(), AtlasError>;
}

/// The latest observed skew between this process's clock and a publish
/// endpoint's `Date` response header, read-only, for diagnostics only;
/// nothing in the registry corrects for it.
#[derive(Debug, Default)]
pub struct ClockSkewTracker {
    last_skew_millis: std::sync::Mutex<Option<i64>>,
}

impl ClockSkewTracker {
    pub fn new() -> Self {
        ClockSkewTracker::default()
    }

    pub fn record(&self, skew_millis: Option<i64>) {
        if let Some(skew) = skew_millis {
            *self.last_skew_millis.lock().expect("clock skew lock poisoned") = Some(skew);
        }
    }

    pub fn last_skew_millis(&self) -> Option<i64> {
        *self.last_skew_millis.lock().expect("clock skew lock poisoned")
    }
}

/// Parses an RFC 7231 IMF-fixdate (`"Sun, 06 Nov 1994 08:49:37 GMT"`, the
/// only format `Date` response headers are required to use) into Unix
/// milliseconds. Returns `None` for anything else rather than failing the
/// publish over a diagnostic-only field.
pub(crate) fn parse_http_date_millis(value: &str) -> Option<i64> {
    let mut parts = value.split_whitespace();
    let _weekday = parts.next()?;
    let day: i64 = parts.next()?.parse().ok()?;
    let month = month_index(parts.next()?)?;
    let year: i64 = parts.next()?.parse().ok()?;
    let mut time = parts.next()?.split(':');
    let hour: i64 = time.next()?.parse().ok()?;
    let minute: i64 = time.next()?.parse().ok()?;
    let second: i64 = time.next()?.parse().ok()?;

    let days = days_from_civil(year, month, day);
    Some(((days * 86_400 + hour * 3_600 + minute * 60 + second) * 1000) as i64)
}

fn month_index(name: &str) -> Option<i64> {
    const MONTHS: [&str; 12] = [
        "Jan", "Feb", "Mar", "Apr", "May", "Jun", "Jul", "Aug", "Sep", "Oct", "Nov", "Dec",
    ];
    MONTHS.iter().position(|m| *m == name).map(|i| i as i64 + 1)
}

/// Howard Hinnant's `days_from_civil`: days since the Unix epoch for a
/// proleptic-Gregorian `(year, month, day)`.
fn days_from_civil(y: i64, m: i64, d: i64) -> i64 {
    let y = if m <= 2 { y - 1 } else { y };
    let era = if y >= 0 { y } else { y - 399 } / 400;
    let yoe = y - era * 400;
    let mp = (m + 9) % 12;
    let doy = (153 * mp + 2) / 5 + d - 1;
    let doe = yoe * 365 + yoe / 4 - yoe / 100 + doy;
    era * 146_097 + doe - 719_468
}

#[cfg(test)]
mod tests {
    use super::*;
    use atlas_core::Id;

    #[test]
    fn metric_from_measurement_defaults_dstype_to_gauge() {
        let m = Measurement::new(Id::new("queueSize", []), 1_000, 3.0);
        let metric = PublishPayload::metric_from_measurement(&m);
        assert_eq!(metric.tags.get("atlas.dstype").map(|v| v.as_ref()), Some("gauge"));
    }

    #[test]
    fn metric_from_measurement_keeps_an_explicit_dstype() {
        let m = Measurement::new(Id::new("requests", [("atlas.dstype", "rate")]), 1_000, 3.0);
        let metric = PublishPayload::metric_from_measurement(&m);
        assert_eq!(metric.tags.get("atlas.dstype").map(|v| v.as_ref()), Some("rate"));
    }

    #[test]
    fn parses_imf_fixdate() {
        let millis = parse_http_date_millis("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        assert_eq!(millis, 784_111_777_000);
    }

    #[test]
    fn rejects_unparseable_dates() {
        assert!(parse_http_date_millis("not a date").is_none());
    }

    #[test]
    fn clock_skew_tracker_keeps_the_latest_recorded_value() {
        let tracker = ClockSkewTracker::new();
        assert_eq!(tracker.last_skew_millis(), None);
        tracker.record(Some(120));
        tracker.record(None); // a failed parse must not clobber the last good reading
        assert_eq!(tracker.last_skew_millis(), Some(120));
        tracker.record(Some(-50));
        assert_eq!(tracker.last_skew_millis(), Some(-50));
    }
}

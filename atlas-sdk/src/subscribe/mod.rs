//! Pulls and caches the live subscription list via an ETag-conditional
//! request (component J).
//!
//! The wire format and transport are kept behind a small [`SubscriptionSource`]
//! seam so the registry's refresh task never depends on a concrete HTTP
//! stack directly; [`HttpSubscriptionSource`] (behind the `http` feature)
//! is the production implementation, built on [`atlas_http::HttpClient`]
//! the same way the registry's publisher is.

use std::sync::{Arc, RwLock};

use atlas_core::AtlasError;

#[cfg(feature = "http")]
mod http_source;
#[cfg(feature = "http")]
pub use http_source::HttpSubscriptionSource;

/// A server-issued `(id, query expression, frequency)` selecting a slice
/// of the meter stream for streaming evaluation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Subscription {
    pub id: Arc<str>,
    pub expression: Arc<str>,
    pub frequency_millis: i64,
}

/// The result of one conditional pull.
#[derive(Debug)]
pub enum FetchOutcome {
    /// The server returned `304 Not Modified`; the caller's cached list is
    /// still current.
    NotModified,
    /// The server returned a new list (and, typically, a new `ETag` to
    /// present on the next pull).
    Updated {
        subscriptions: Vec<Subscription>,
        etag: Option<String>,
    },
}

/// The transport seam the subscription manager pulls through. Implemented
/// by [`HttpSubscriptionSource`] for production use and by test doubles
/// for registry integration tests.
pub trait SubscriptionSource: std::fmt::Debug + Send + Sync {
    fn fetch(&self, etag: Option<&str>) -> Result<FetchOutcome, AtlasError>;
}

/// Returns `true` if a raw subscription frequency should be kept: it must
/// be a strictly positive multiple of the LWC step, and, unless
/// `ignore_publish_step` is set, it must not equal the publish step (the
/// spec's inconsistent-across-versions `ignorePublishStep` flag, resolved
/// per the design notes as "accept a subscription whose frequency equals
/// publish step only when this flag is set").
pub fn accept_frequency(frequency_millis: i64, lwc_step_millis: i64, publish_step_millis: i64, ignore_publish_step: bool) -> bool {
    if frequency_millis <= 0 || frequency_millis % lwc_step_millis != 0 {
        return false;
    }
    if frequency_millis == publish_step_millis && !ignore_publish_step {
        return false;
    }
    true
}

/// Pulls and caches the subscription list. Holds the most recently seen
/// `ETag` and the last successfully parsed, frequency-filtered list;
/// `subscriptions()` is a point-in-time, lock-free-to-read snapshot.
#[derive(Debug)]
pub struct SubscriptionManager {
    source: Arc<dyn SubscriptionSource>,
    lwc_step_millis: i64,
    publish_step_millis: i64,
    ignore_publish_step: bool,
    etag: RwLock<Option<String>>,
    subscriptions: RwLock<Arc<[Subscription]>>,
}

impl SubscriptionManager {
    pub fn new(
        source: Arc<dyn SubscriptionSource>,
        lwc_step_millis: i64,
        publish_step_millis: i64,
        ignore_publish_step: bool,
    ) -> Self {
        SubscriptionManager {
            source,
            lwc_step_millis,
            publish_step_millis,
            ignore_publish_step,
            etag: RwLock::new(None),
            subscriptions: RwLock::new(Arc::from(Vec::new())),
        }
    }

    /// Pulls the latest list, filters out any subscription whose
    /// frequency can't be honored at this LWC step, and caches the
    /// result. A `304` leaves the cached list untouched.
    pub fn refresh(&self) -> Result<(), AtlasError> {
        let current_etag = self.etag.read().expect("subscription etag lock poisoned").clone();
        match self.source.fetch(current_etag.as_deref())? {
            FetchOutcome::NotModified => Ok(()),
            FetchOutcome::Updated { subscriptions, etag } => {
                let filtered: Vec<Subscription> = subscriptions
                    .into_iter()
                    .filter(|s| {
                        accept_frequency(
                            s.frequency_millis,
                            self.lwc_step_millis,
                            self.publish_step_millis,
                            self.ignore_publish_step,
                        )
                    })
                    .collect();
                *self.subscriptions.write().expect("subscription list lock poisoned") = filtered.into();
                *self.etag.write().expect("subscription etag lock poisoned") = etag;
                Ok(())
            }
        }
    }

    /// A point-in-time snapshot of the currently cached subscription list.
    pub fn subscriptions(&self) -> Arc<[Subscription]> {
        self.subscriptions.read().expect("subscription list lock poisoned").clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    #[derive(Debug)]
    struct FixedSource {
        outcomes: Mutex<Vec<Result<FetchOutcome, AtlasError>>>,
    }

    impl SubscriptionSource for FixedSource {
        fn fetch(&self, _etag: Option<&str>) -> Result<FetchOutcome, AtlasError> {
            self.outcomes.lock().unwrap().pop().unwrap()
        }
    }

    fn sub(id: &str, frequency_millis: i64) -> Subscription {
        Subscription {
            id: id.into(),
            expression: "name,cpu,:eq,:sum".into(),
            frequency_millis,
        }
    }

    #[test]
    fn accept_frequency_requires_a_positive_multiple_of_the_lwc_step() {
        assert!(accept_frequency(10_000, 10_000, 60_000, false));
        assert!(!accept_frequency(15_000, 10_000, 60_000, false));
        assert!(!accept_frequency(0, 10_000, 60_000, false));
    }

    #[test]
    fn accept_frequency_excludes_the_publish_step_unless_ignored() {
        assert!(!accept_frequency(60_000, 10_000, 60_000, false));
        assert!(accept_frequency(60_000, 10_000, 60_000, true));
    }

    #[test]
    fn refresh_filters_out_unusable_frequencies_and_caches_the_rest() {
        let source = Arc::new(FixedSource {
            outcomes: Mutex::new(vec![Ok(FetchOutcome::Updated {
                subscriptions: vec![sub("s1", 10_000), sub("s2", 15_000)],
                etag: Some("v1".into()),
            })]),
        });
        let manager = SubscriptionManager::new(source, 10_000, 60_000, false);
        manager.refresh().unwrap();
        let subs = manager.subscriptions();
        assert_eq!(subs.len(), 1);
        assert_eq!(subs[0].id.as_ref(), "s1");
    }

    #[test]
    fn not_modified_keeps_the_previously_cached_list() {
        let source = Arc::new(FixedSource {
            outcomes: Mutex::new(vec![Ok(FetchOutcome::NotModified), Ok(FetchOutcome::Updated {
                subscriptions: vec![sub("s1", 10_000)],
                etag: Some("v1".into()),
            })]),
        });
        let manager = SubscriptionManager::new(source, 10_000, 60_000, false);
        manager.refresh().unwrap(); // consumes the Updated outcome
        manager.refresh().unwrap(); // consumes the NotModified outcome
        assert_eq!(manager.subscriptions().len(), 1);
    }
}

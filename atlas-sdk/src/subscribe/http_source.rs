//! The production [`SubscriptionSource`]: an ETag-conditional `GET` against
//! a config server, parsed into the wire shape from spec §6
//! (`{"expressions":[{"id","expression","frequency"}]}`).

use std::sync::Arc;

use atlas_core::AtlasError;
use bytes::Bytes;
use http::{header, Request, StatusCode};
use serde::Deserialize;

use atlas_http::HttpClient;

use super::{FetchOutcome, Subscription, SubscriptionSource};

#[derive(Deserialize)]
struct SubscriptionListWire {
    expressions: Vec<SubscriptionWire>,
}

#[derive(Deserialize)]
struct SubscriptionWire {
    id: String,
    expression: String,
    frequency: i64,
}

/// Pulls the subscription list over HTTP, blocking the calling thread via
/// [`futures_executor::block_on`], the same pattern the registry uses to
/// call its (async) [`HttpClient`]-backed publisher from a synchronous
/// scheduler task.
#[derive(Debug)]
pub struct HttpSubscriptionSource {
    config_uri: String,
    client: Arc<dyn HttpClient>,
}

impl HttpSubscriptionSource {
    pub fn new(config_uri: impl Into<String>, client: Arc<dyn HttpClient>) -> Self {
        HttpSubscriptionSource {
            config_uri: config_uri.into(),
            client,
        }
    }

    async fn fetch_async(&self, etag: Option<&str>) -> Result<FetchOutcome, AtlasError> {
        let mut builder = Request::builder().method("GET").uri(self.config_uri.as_str());
        if let Some(etag) = etag {
            builder = builder.header(header::IF_NONE_MATCH, etag);
        }
        let request = builder
            .body(Bytes::new())
            .map_err(|e| AtlasError::Http(e.to_string()))?;
        let response = self.client.send(request).await?;

        if response.status() == StatusCode::NOT_MODIFIED {
            return Ok(FetchOutcome::NotModified);
        }
        if !response.status().is_success() {
            return Err(AtlasError::Http(format!(
                "subscription pull failed with status {}",
                response.status()
            )));
        }

        let etag = response
            .headers()
            .get(header::ETAG)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string);
        let parsed: SubscriptionListWire =
            serde_json::from_slice(response.body()).map_err(|e| AtlasError::Http(e.to_string()))?;
        let subscriptions = parsed
            .expressions
            .into_iter()
            .map(|w| Subscription {
                id: w.id.into(),
                expression: w.expression.into(),
                frequency_millis: w.frequency,
            })
            .collect();
        Ok(FetchOutcome::Updated { subscriptions, etag })
    }
}

impl SubscriptionSource for HttpSubscriptionSource {
    fn fetch(&self, etag: Option<&str>) -> Result<FetchOutcome, AtlasError> {
        futures_executor::block_on(self.fetch_async(etag))
    }
}

//! The production [`Publisher`]/[`EvalPublisher`]: JSON over
//! [`atlas_http::HttpClient`], with `202`/`400` validation-body accounting
//! and `Date`-header clock skew tracking (spec §6-7).

use std::sync::Arc;

use atlas_core::AtlasError;
use bytes::Bytes;
use http::{header, Request, StatusCode};
use serde::Deserialize;

use atlas_http::HttpClient;

use super::{parse_http_date_millis, ClockSkewTracker, EvalPayload, Publisher, PublishOutcome, PublishPayload};

#[derive(Deserialize, Default)]
struct ValidationResponse {
    #[serde(rename = "errorCount", default)]
    error_count: u64,
    #[serde(default)]
    #[allow(dead_code)]
    message: Vec<String>,
}

fn response_skew_millis(now_millis: i64, date_header: Option<&str>) -> Option<i64> {
    date_header
        .and_then(parse_http_date_millis)
        .map(|server_millis| server_millis - now_millis)
}

/// Posts publish payloads to a configured URI. A `200`/`204` counts every
/// metric as sent; a `202`/`400` carries a validation body
/// (`{"errorCount", "message"}`) whose count is attributed to
/// `dropped_invalid`, the remainder to `sent`. Any other status is a hard
/// error.
#[derive(Debug)]
pub struct HttpPublisher {
    publish_uri: String,
    client: Arc<dyn HttpClient>,
    clock_skew: ClockSkewTracker,
}

impl HttpPublisher {
    pub fn new(publish_uri: impl Into<String>, client: Arc<dyn HttpClient>) -> Self {
        HttpPublisher {
            publish_uri: publish_uri.into(),
            client,
            clock_skew: ClockSkewTracker::new(),
        }
    }

    pub fn clock_skew_millis(&self) -> Option<i64> {
        self.clock_skew.last_skew_millis()
    }

    async fn publish_async(&self, payload: PublishPayload, now_millis: i64) -> Result<PublishOutcome, AtlasError> {
        let total = payload.metrics.len() as u64;
        let body = serde_json::to_vec(&payload).map_err(|e| AtlasError::Http(e.to_string()))?;
        let request = Request::builder()
            .method("POST")
            .uri(self.publish_uri.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(body))
            .map_err(|e| AtlasError::Http(e.to_string()))?;
        let response = self.client.send(request).await?;

        let date_header = response.headers().get(header::DATE).and_then(|v| v.to_str().ok());
        let skew = response_skew_millis(now_millis, date_header);
        self.clock_skew.record(skew);

        match response.status() {
            StatusCode::OK | StatusCode::NO_CONTENT => Ok(PublishOutcome {
                sent: total,
                dropped_invalid: 0,
                clock_skew_millis: skew,
            }),
            StatusCode::ACCEPTED | StatusCode::BAD_REQUEST => {
                let validation: ValidationResponse = serde_json::from_slice(response.body()).unwrap_or_default();
                let dropped = validation.error_count.min(total);
                Ok(PublishOutcome {
                    sent: total - dropped,
                    dropped_invalid: dropped,
                    clock_skew_millis: skew,
                })
            }
            other => Err(AtlasError::Http(format!("publish failed with status {other}"))),
        }
    }
}

#[async_trait::async_trait]
impl Publisher for HttpPublisher {
    async fn publish(&self, payload: PublishPayload) -> Result<PublishOutcome, AtlasError> {
        let now_millis = payload.metrics.first().map(|m| m.timestamp).unwrap_or(0);
        self.publish_async(payload, now_millis).await
    }
}

/// Posts streaming-eval payloads to a configured URI. Any non-success
/// status is a hard error; there is no validation-body accounting for
/// the eval stream.
#[derive(Debug)]
pub struct HttpEvalPublisher {
    eval_uri: String,
    client: Arc<dyn HttpClient>,
}

impl HttpEvalPublisher {
    pub fn new(eval_uri: impl Into<String>, client: Arc<dyn HttpClient>) -> Self {
        HttpEvalPublisher {
            eval_uri: eval_uri.into(),
            client,
        }
    }
}

#[async_trait::async_trait]
impl super::EvalPublisher for HttpEvalPublisher {
    async fn publish_eval(&self, payload: EvalPayload) -> Result<(), AtlasError> {
        let body = serde_json::to_vec(&payload).map_err(|e| AtlasError::Http(e.to_string()))?;
        let request = Request::builder()
            .method("POST")
            .uri(self.eval_uri.as_str())
            .header(header::CONTENT_TYPE, "application/json")
            .body(Bytes::from(body))
            .map_err(|e| AtlasError::Http(e.to_string()))?;
        let response = self.client.send(request).await?;
        if !response.status().is_success() {
            return Err(AtlasError::Http(format!(
                "eval publish failed with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn response_skew_is_the_difference_between_server_and_local_time() {
        let server_millis = parse_http_date_millis("Sun, 06 Nov 1994 08:49:37 GMT").unwrap();
        let skew = response_skew_millis(server_millis - 500, Some("Sun, 06 Nov 1994 08:49:37 GMT"));
        assert_eq!(skew, Some(500));
    }

    #[test]
    fn missing_or_unparseable_date_header_yields_no_skew_reading() {
        assert_eq!(response_skew_millis(0, None), None);
        assert_eq!(response_skew_millis(0, Some("garbage")), None);
    }
}

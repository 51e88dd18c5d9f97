//! A minimal HTTP transport abstraction used by the registry's publish path
//! and by the subscription manager's ETag-conditional pull.
//!
//! Both need to read the response, the publisher inspects the `Date`
//! header for clock-skew tracking and an optional validation body; the
//! subscription manager needs the status code (200 vs. 304) and the `ETag`
//! header, so unlike a fire-and-forget span exporter, [`HttpClient::send`]
//! returns the full response rather than `()`.

use std::fmt::Debug;

use async_trait::async_trait;
use atlas_core::AtlasError;
use bytes::Bytes;
use http::{Request, Response};

/// A minimal interface necessary to publish measurements or pull
/// subscriptions over HTTP.
///
/// Users may bring their own client bound to whatever async runtime they
/// already run; a `reqwest`-backed default is provided behind the
/// `reqwest` feature.
#[async_trait]
pub trait HttpClient: Debug + Send + Sync {
    async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, AtlasError>;
}

#[cfg(feature = "reqwest")]
mod reqwest_client {
    use super::*;
    use std::convert::TryInto;

    /// The default [`HttpClient`], backed by an async `reqwest::Client`.
    #[derive(Debug, Clone, Default)]
    pub struct ReqwestClient {
        inner: reqwest::Client,
    }

    impl ReqwestClient {
        pub fn new() -> Self {
            ReqwestClient {
                inner: reqwest::Client::new(),
            }
        }

        pub fn from_client(inner: reqwest::Client) -> Self {
            ReqwestClient { inner }
        }
    }

    #[async_trait]
    impl HttpClient for ReqwestClient {
        async fn send(&self, request: Request<Bytes>) -> Result<Response<Bytes>, AtlasError> {
            let request: reqwest::Request = request
                .try_into()
                .map_err(|e: http::Error| AtlasError::Http(e.to_string()))?;

            let response = self
                .inner
                .execute(request)
                .await
                .map_err(|e| AtlasError::Http(e.to_string()))?;

            let mut builder = Response::builder().status(response.status());
            for (name, value) in response.headers().iter() {
                builder = builder.header(name, value);
            }
            let body = response
                .bytes()
                .await
                .map_err(|e| AtlasError::Http(e.to_string()))?;
            builder
                .body(body)
                .map_err(|e| AtlasError::Http(e.to_string()))
        }
    }
}

#[cfg(feature = "reqwest")]
pub use reqwest_client::ReqwestClient;

#[cfg(all(test, feature = "reqwest"))]
mod tests {
    use super::*;

    #[test]
    fn reqwest_client_is_debug_and_default() {
        let client = ReqwestClient::new();
        assert!(format!("{client:?}").contains("ReqwestClient"));
    }
}

use std::result;
use std::sync::PoisonError;
use thiserror::Error;

/// A specialized `Result` type for atlas operations.
pub type Result<T> = result::Result<T, AtlasError>;

/// Errors returned by the atlas client.
///
/// Mirrors the classification in the design's error-handling section:
/// user-input errors are distinguished from transient IO failures so
/// callers can decide whether to retry or to fix their query.
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum AtlasError {
    /// A query expression failed to parse, or referenced an unknown operator.
    #[error("invalid query: {0}")]
    InvalidQuery(String),

    /// Invalid instrument or registry configuration (e.g. `lwcStep` not
    /// dividing `step`, a non-finite `step` duration).
    #[error("config error: {0}")]
    Config(String),

    /// The publish or subscription-pull transport failed. Wraps whatever
    /// the `HttpClient` implementation reported; never retried at this
    /// layer per the design's "retries: none" rule.
    #[error("transport error: {0}")]
    Http(String),

    /// Catch-all for conditions that don't fit a more specific variant.
    #[error("atlas error: {0}")]
    Other(String),
}

impl<T> From<PoisonError<T>> for AtlasError {
    fn from(err: PoisonError<T>) -> Self {
        AtlasError::Other(err.to_string())
    }
}

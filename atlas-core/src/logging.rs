#![allow(unused_macros)]

//! Internal diagnostic macros, gated behind the `internal-logs` feature.
//!
//! These are for the client's own background machinery (sync failures,
//! dropped batches, rollup rule errors), not a general application logging
//! facade. When the feature is disabled every call compiles away to nothing
//! but a use of its arguments, so callers never pay for formatting they
//! didn't ask for.

/// Logs an info-level lifecycle event from internal atlas machinery (e.g.
/// registry startup/shutdown, subscription sync summaries).
///
/// ```
/// atlas_core::atlas_info!(name: "registry_started", step_millis = 60_000i64);
/// ```
#[macro_export]
macro_rules! atlas_info {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            tracing::info!(name: $name, target: env!("CARGO_PKG_NAME"), "");
        }
        #[cfg(not(feature = "internal-logs"))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            tracing::info!(name: $name, target: env!("CARGO_PKG_NAME"), $($key = $value),+, "");
        }
        #[cfg(not(feature = "internal-logs"))]
        {
            let _ = ($name, $($value),+);
        }
    };
}

/// Logs a warning from internal atlas machinery.
///
/// ```
/// atlas_core::atlas_warn!(name: "subscription_sync_failed", id = "abc");
/// ```
#[macro_export]
macro_rules! atlas_warn {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            tracing::warn!(name: $name, target: env!("CARGO_PKG_NAME"), "");
        }
        #[cfg(not(feature = "internal-logs"))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            tracing::warn!(name: $name, target: env!("CARGO_PKG_NAME"), $($key = $value),+, "");
        }
        #[cfg(not(feature = "internal-logs"))]
        {
            let _ = ($name, $($value),+);
        }
    };
}

/// Logs a debug-level trace from internal atlas machinery.
#[macro_export]
macro_rules! atlas_debug {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            tracing::debug!(name: $name, target: env!("CARGO_PKG_NAME"), "");
        }
        #[cfg(not(feature = "internal-logs"))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            tracing::debug!(name: $name, target: env!("CARGO_PKG_NAME"), $($key = $value),+, "");
        }
        #[cfg(not(feature = "internal-logs"))]
        {
            let _ = ($name, $($value),+);
        }
    };
}

/// Logs an error from internal atlas machinery. Reserved for conditions the
/// design classifies as transient IO failures, never for programmer errors
/// (those panic, per the design's "internal invariant violation" rule).
#[macro_export]
macro_rules! atlas_error {
    (name: $name:expr $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            tracing::error!(name: $name, target: env!("CARGO_PKG_NAME"), "");
        }
        #[cfg(not(feature = "internal-logs"))]
        {
            let _ = $name;
        }
    };
    (name: $name:expr, $($key:ident = $value:expr),+ $(,)?) => {
        #[cfg(feature = "internal-logs")]
        {
            tracing::error!(name: $name, target: env!("CARGO_PKG_NAME"), $($key = $value),+, "");
        }
        #[cfg(not(feature = "internal-logs"))]
        {
            let _ = ($name, $($value),+);
        }
    };
}

//! Core data model shared by the atlas metrics client: dimensional
//! identifiers, transient measurements, and the error type returned by
//! every fallible operation in `atlas-sdk`.
//!
//! This crate has no IO and no background threads; it exists so that
//! `atlas-sdk` and `atlas-http` (and anything consuming published data) can
//! agree on the same `Id`/`Measurement` shapes without depending on the
//! scheduler or registry machinery.

mod error;
mod id;
pub mod logging;
mod measurement;

pub use error::{AtlasError, Result};
pub use id::{compare_keys, Id, Tag};
pub use measurement::{DsType, Measurement, Statistic};

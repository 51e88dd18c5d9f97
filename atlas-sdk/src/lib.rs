//! The atlas metrics SDK: step-aligned meters, a consolidator that rolls
//! fine-grained steps up into a coarser publish step, a subscription query
//! engine with a sub-linear dispatch index, and the registry orchestrator
//! that ties meter polling, consolidation, rollup and publish/eval
//! scheduling together.
//!
//! See `atlas-core` for the shared `Id`/`Measurement` data model.

pub mod clock;
pub mod consolidation;
pub mod evaluator;
pub mod meters;
pub mod publish;
pub mod query;
pub mod registry;
pub mod rollup;
pub mod scheduler;
pub mod step;
pub mod subscribe;
pub mod tags;

pub use atlas_core::{AtlasError, DsType, Id, Measurement, Result, Statistic, Tag};
pub use registry::{AtlasRegistry, RegistryConfig};

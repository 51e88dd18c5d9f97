//! Step-aligned rotating accumulators (component B).

mod atomic_double;
mod cell;

pub use atomic_double::AtomicDouble;
pub use cell::{StepDouble, StepLong, StepMax};

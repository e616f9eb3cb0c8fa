//! Statistics and energy model for benchmark campaigns.
//!
//! Everything here is a pure function of its inputs.

pub mod energy;
pub mod summary;

pub use energy::{EnergyModel, duty_cycle};
pub use summary::{DISPERSION_RATIO, EmptyInputError, SummaryStat, summarize};

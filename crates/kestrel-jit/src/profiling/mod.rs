//! Profiling infrastructure for hot function detection

pub mod counters;
pub mod policy;

pub use counters::{FunctionProfile, ProfileData, ProgramProfile};
pub use policy::{Tier, TierPolicy};

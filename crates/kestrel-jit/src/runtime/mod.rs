//! Runtime side of compiled code: installed entry points, the bailout
//! recovery protocol, and the per-site statistics that drive rejits.

pub mod entry;
pub mod install;
pub mod recovery;
pub mod rejit;
pub mod stats;

pub use entry::{EntryKey, EntryPoint, EntryTable};
pub use install::EntryInstaller;
pub use recovery::{restore, RecoveryError};
pub use rejit::{RejitPolicy, Relaxed};
pub use stats::{OverrideSnapshot, Relax, SiteKey, SiteStats, SpeculationOverrides};

//! Analyses over bytecode and IR
//!
//! - `cfg`: basic blocks and loop regions of a bytecode body
//! - `resume`: registers the interpreter reads after a bailout
//! - `backward`: liveness, dead stores and bailout captures on the IR

pub mod backward;
pub mod bitset;
pub mod cfg;
pub mod resume;

pub use backward::{AnalysisError, AnalysisStats, BackwardPass};
pub use cfg::{build_cfg, ControlFlowGraph, LoopRegion};
pub use resume::ResumeLiveness;

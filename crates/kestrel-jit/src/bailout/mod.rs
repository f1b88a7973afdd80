//! Bailout data model
//!
//! Describes what must be restored when speculative code gives up:
//! compile-time descriptors (`arena`), their frozen runtime form (`record`),
//! the per-entry-point location table (`table`) and the inlined frame chain
//! (`frame`).

pub mod arena;
pub mod frame;
pub mod record;
pub mod table;

pub use arena::{BailoutArena, BailoutHandle, BailoutInfo, PendingCall};
pub use frame::{ArgProvenance, FrameTable, InlineeFrameRecord};
pub use record::{BailoutRecord, NativeLocation};
pub use table::{GlobalBailoutTable, TableBuilder, TableRow};

use crate::ir::SymId;

/// When the captured state is taken and where the interpreter resumes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BailoutKind {
    /// Before the instruction; the interpreter re-executes it
    Eager,
    /// After an op that ran script code; resumes at the next op
    OnImplicitCall,
    /// After a call returns, values captured in spill slots; resumes at the next op
    Lazy,
    /// The instruction threw; the interpreter dispatches the exception
    Exception,
}

impl BailoutKind {
    pub fn is_post_state(self) -> bool {
        matches!(self, BailoutKind::OnImplicitCall | BailoutKind::Lazy)
    }
}

/// Why a bailout fired
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum BailoutReason {
    ShapeMismatch = 0,
    NotAnInt = 1,
    IntOverflow = 2,
    NegativeZero = 3,
    CallTargetMismatch = 4,
    NoProfile = 5,
    ImplicitCall = 6,
    LazyInvalidation = 7,
    LoopExit = 8,
    Throw = 9,
}

impl BailoutReason {
    /// Whether repeated firing means a speculation was wrong
    pub fn counts_toward_rejit(self) -> bool {
        !matches!(self, BailoutReason::LoopExit | BailoutReason::Throw)
    }

    pub fn from_u8(v: u8) -> Option<Self> {
        use BailoutReason::*;
        Some(match v {
            0 => ShapeMismatch,
            1 => NotAnInt,
            2 => IntOverflow,
            3 => NegativeZero,
            4 => CallTargetMismatch,
            5 => NoProfile,
            6 => ImplicitCall,
            7 => LazyInvalidation,
            8 => LoopExit,
            9 => Throw,
            _ => return None,
        })
    }
}

/// Misuse of bailout descriptors or tables
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BailoutError {
    #[error("bailout descriptor {0} is frozen")]
    Frozen(u32),
    #[error("table row for {sym} at bailout {id} is out of order")]
    OutOfOrder { sym: SymId, id: u32 },
}

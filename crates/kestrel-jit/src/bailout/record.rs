//! Frozen runtime form of a bailout descriptor

use crate::bytecode::{FuncId, Offset};
use crate::interp::value::Value;
use crate::ir::{FrameIdx, SymId};

use super::{BailoutInfo, BailoutKind, BailoutReason, PendingCall};

/// Where a captured symbol lives when a bailout fires
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NativeLocation {
    /// Register save area filled by the exit stub
    RegSave(u8),
    /// Stack slot of the optimized frame
    Stack(u16),
    /// Constant embedded in the code
    Const(Value),
}

/// Immutable bailout record referenced by an exit stub
#[derive(Debug, Clone, PartialEq)]
pub struct BailoutRecord {
    /// Index in the entry point's record list; table rows are keyed by it
    pub id: u32,
    pub func: FuncId,
    pub offset: Offset,
    pub site: Offset,
    pub kind: BailoutKind,
    pub reason: BailoutReason,
    pub frame: FrameIdx,
    pub captured: Vec<SymId>,
    pub pending_call: Option<PendingCall>,
}

impl BailoutRecord {
    pub fn freeze(id: u32, func: FuncId, info: &BailoutInfo) -> Self {
        BailoutRecord {
            id,
            func,
            offset: info.offset,
            site: info.site,
            kind: info.kind,
            reason: info.reason,
            frame: info.frame,
            captured: info.captured.clone(),
            pending_call: info.pending_call.clone(),
        }
    }

    pub fn resume_offset(&self) -> Offset {
        if self.kind.is_post_state() {
            self.offset + 1
        } else {
            self.offset
        }
    }
}

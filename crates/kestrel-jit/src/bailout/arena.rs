//! Compile-time bailout descriptors
//!
//! Descriptors live in a per-function arena and are referenced through
//! `BailoutHandle`s, which are deliberately not `Clone`. Two guard sites only
//! ever point at the same descriptor through an explicit `share`; an
//! independent copy requires an explicit `clone_info`. Updating a shared
//! descriptor copies it first, so one site can never change another site's
//! recovery data.

use crate::bytecode::Offset;
use crate::ir::{FrameIdx, SymId};

use super::{BailoutError, BailoutKind, BailoutReason};

/// Arguments of a call that were already moved to their outgoing temps
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PendingCall {
    pub call_offset: Offset,
    pub argc: u16,
    pub materialized: Vec<SymId>,
}

/// What to restore and where to resume
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BailoutInfo {
    /// Offset the state is captured at
    pub offset: Offset,
    /// Offset whose speculation this bailout protects, for per-site stats
    pub site: Offset,
    pub kind: BailoutKind,
    /// Primary reason; guards report the precise one when they fire
    pub reason: BailoutReason,
    /// Innermost logical frame
    pub frame: FrameIdx,
    /// Sorted symbols needed to rebuild every frame of the chain
    pub captured: Vec<SymId>,
    pub pending_call: Option<PendingCall>,
}

impl BailoutInfo {
    pub fn new(offset: Offset, kind: BailoutKind, reason: BailoutReason, frame: FrameIdx) -> Self {
        BailoutInfo {
            offset,
            site: offset,
            kind,
            reason,
            frame,
            captured: Vec::new(),
            pending_call: None,
        }
    }

    /// Byte-code offset the interpreter continues from
    pub fn resume_offset(&self) -> Offset {
        if self.kind.is_post_state() {
            self.offset + 1
        } else {
            self.offset
        }
    }

    /// Identical recovery requirements (the reason is not part of recovery)
    pub fn same_recovery(&self, other: &BailoutInfo) -> bool {
        self.offset == other.offset
            && self.site == other.site
            && self.kind == other.kind
            && self.frame == other.frame
            && self.captured == other.captured
            && self.pending_call == other.pending_call
    }
}

/// Owning reference to a descriptor in a `BailoutArena`
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct BailoutHandle(u32);

impl BailoutHandle {
    pub fn index(&self) -> u32 {
        self.0
    }
}

#[derive(Debug)]
struct Slot {
    info: BailoutInfo,
    refs: u32,
    frozen: bool,
}

/// Per-function storage for bailout descriptors
#[derive(Debug, Default)]
pub struct BailoutArena {
    slots: Vec<Slot>,
}

impl BailoutArena {
    pub fn new() -> Self {
        BailoutArena { slots: Vec::new() }
    }

    pub fn alloc(&mut self, info: BailoutInfo) -> BailoutHandle {
        self.slots.push(Slot {
            info,
            refs: 1,
            frozen: false,
        });
        BailoutHandle(self.slots.len() as u32 - 1)
    }

    pub fn get(&self, handle: &BailoutHandle) -> &BailoutInfo {
        &self.slots[handle.0 as usize].info
    }

    /// A second reference to the same descriptor, tagged shared
    pub fn share(&mut self, handle: &BailoutHandle) -> BailoutHandle {
        self.slots[handle.0 as usize].refs += 1;
        BailoutHandle(handle.0)
    }

    /// An independent copy of the descriptor
    pub fn clone_info(&mut self, handle: &BailoutHandle) -> BailoutHandle {
        let info = self.get(handle).clone();
        self.alloc(info)
    }

    pub fn release(&mut self, handle: BailoutHandle) {
        let slot = &mut self.slots[handle.0 as usize];
        slot.refs = slot.refs.saturating_sub(1);
    }

    pub fn is_shared(&self, handle: &BailoutHandle) -> bool {
        self.slots[handle.0 as usize].refs > 1
    }

    pub fn refs(&self, handle: &BailoutHandle) -> u32 {
        self.slots[handle.0 as usize].refs
    }

    pub fn is_frozen(&self, handle: &BailoutHandle) -> bool {
        self.slots[handle.0 as usize].frozen
    }

    /// Apply `f` to the descriptor behind `handle`.
    ///
    /// Returns whether anything changed. A shared descriptor is copied before
    /// it is changed and `handle` is redirected to the copy.
    pub fn update(
        &mut self,
        handle: &mut BailoutHandle,
        f: impl FnOnce(&mut BailoutInfo),
    ) -> Result<bool, BailoutError> {
        let slot = &self.slots[handle.0 as usize];
        if slot.frozen {
            return Err(BailoutError::Frozen(handle.0));
        }
        let mut next = slot.info.clone();
        f(&mut next);
        if next == slot.info {
            return Ok(false);
        }
        if slot.refs > 1 {
            self.slots[handle.0 as usize].refs -= 1;
            *handle = self.alloc(next);
        } else {
            self.slots[handle.0 as usize].info = next;
        }
        Ok(true)
    }

    pub fn freeze(&mut self, handle: &BailoutHandle) {
        self.slots[handle.0 as usize].frozen = true;
    }

    /// Descriptors still referenced by at least one handle
    pub fn live_count(&self) -> usize {
        self.slots.iter().filter(|s| s.refs > 0).count()
    }
}

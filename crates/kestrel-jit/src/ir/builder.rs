//! Cursor-style helpers for constructing IR
//!
//! Utilities used by the lifter and the inliner. The builder remembers the
//! byte-code location being translated so every instruction and descriptor
//! is stamped with it.

use crate::bailout::{BailoutHandle, BailoutInfo, BailoutKind, BailoutReason};
use crate::bytecode::Offset;
use crate::interp::value::Value;

use super::instr::{BlockId, FrameIdx, Inst, InstKind, IrFunc, SymId, Terminator};

pub struct IrBuilder<'a> {
    func: &'a mut IrFunc,
    current_block: BlockId,
    offset: Offset,
    frame: FrameIdx,
}

impl<'a> IrBuilder<'a> {
    pub fn new(func: &'a mut IrFunc, block: BlockId, frame: FrameIdx) -> Self {
        IrBuilder {
            func,
            current_block: block,
            offset: 0,
            frame,
        }
    }

    pub fn switch_to_block(&mut self, block: BlockId) {
        self.current_block = block;
    }

    pub fn current_block(&self) -> BlockId {
        self.current_block
    }

    /// Byte-code location stamped on everything emitted next
    pub fn set_location(&mut self, offset: Offset, frame: FrameIdx) {
        self.offset = offset;
        self.frame = frame;
    }

    pub fn offset(&self) -> Offset {
        self.offset
    }

    pub fn frame(&self) -> FrameIdx {
        self.frame
    }

    pub fn create_block(&mut self) -> BlockId {
        self.func.add_block()
    }

    pub fn temp(&mut self) -> SymId {
        let frame = self.frame;
        self.func.new_sym(frame, None)
    }

    /// Descriptor for a bailout at the current location
    pub fn bailout(&mut self, kind: BailoutKind, reason: BailoutReason) -> BailoutHandle {
        self.bailout_at(self.offset, kind, reason)
    }

    pub fn bailout_at(&mut self, offset: Offset, kind: BailoutKind, reason: BailoutReason) -> BailoutHandle {
        let frame = self.frame;
        self.func
            .arena
            .alloc(BailoutInfo::new(offset, kind, reason, frame))
    }

    pub fn inst(&self, kind: InstKind) -> Inst {
        Inst::new(kind, self.offset, self.frame)
    }

    pub fn push(&mut self, inst: Inst) {
        self.func.block_mut(self.current_block).insts.push(inst);
    }

    pub fn emit(&mut self, kind: InstKind) {
        let inst = self.inst(kind);
        self.push(inst);
    }

    /// Emit an instruction guarded by an eager bailout
    pub fn emit_guard(&mut self, kind: InstKind, reason: BailoutReason) {
        let mut inst = self.inst(kind);
        inst.bailout = Some(self.bailout(BailoutKind::Eager, reason));
        self.push(inst);
    }

    pub fn const_value(&mut self, value: Value) -> SymId {
        let dst = self.temp();
        self.emit(InstKind::Const { dst, value });
        dst
    }

    pub fn terminate(&mut self, term: Terminator) {
        let (offset, frame) = (self.offset, self.frame);
        let block = self.func.block_mut(self.current_block);
        block.term = term;
        block.term_offset = offset;
        block.term_frame = frame;
    }

    pub fn is_terminated(&self) -> bool {
        self.func.block(self.current_block).term != Terminator::None
    }

    pub fn func(&self) -> &IrFunc {
        self.func
    }

    pub fn func_mut(&mut self) -> &mut IrFunc {
        self.func
    }
}

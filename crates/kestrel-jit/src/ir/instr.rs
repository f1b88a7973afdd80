//! IR instructions, blocks and functions

use crate::bailout::{BailoutArena, BailoutHandle, FrameTable};
use crate::bytecode::{BinaryOp, FuncId, NameId, Offset};
use crate::interp::heap::ShapeId;
use crate::interp::value::Value;

/// Symbol: a byte-code register of one frame, or a compiler temporary
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct SymId(pub u32);

impl std::fmt::Display for SymId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "s{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct BlockId(pub u32);

impl std::fmt::Display for BlockId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "bb{}", self.0)
    }
}

/// Index of a logical frame; 0 is the compiled function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameIdx(pub u32);

impl FrameIdx {
    pub const ROOT: FrameIdx = FrameIdx(0);
}

impl std::fmt::Display for FrameIdx {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Where compiled code is entered
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryKind {
    /// Normal call entry
    Function,
    /// On-stack entry at a loop header
    Loop(Offset),
}

#[derive(Debug, Clone, Copy)]
pub struct SymInfo {
    pub frame: FrameIdx,
    /// Byte-code register, `None` for temporaries
    pub reg: Option<u16>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum InstKind {
    Const { dst: SymId, value: Value },
    Move { dst: SymId, src: SymId },
    /// Incoming argument of the compiled function (undefined when absent)
    LoadParam { dst: SymId, index: u16 },
    /// Interpreter register at a loop entry
    LoadIncoming { dst: SymId, reg: u16 },
    LoadThis { dst: SymId },
    ArgCount { dst: SymId },
    LoadArg { dst: SymId, index: SymId },
    /// Full semantics; objects call `valueOf`
    Binary { op: BinaryOp, dst: SymId, lhs: SymId, rhs: SymId },
    /// Operands are known ints
    IntBinary {
        op: BinaryOp,
        dst: SymId,
        lhs: SymId,
        rhs: SymId,
        check_overflow: bool,
        check_negzero: bool,
    },
    Not { dst: SymId, src: SymId },
    CheckInt { value: SymId },
    CheckShape { obj: SymId, shape: ShapeId },
    CheckCallTarget { callee: SymId, func: FuncId },
    /// Leave unconditionally; the reason is in the descriptor
    Bail,
    IsFunction { dst: SymId, value: SymId, func: FuncId },
    /// `slot` is set once a shape guard covers `obj`
    LoadProp { dst: SymId, obj: SymId, name: NameId, slot: Option<u32> },
    StoreProp { obj: SymId, name: NameId, value: SymId, slot: Option<u32> },
    DeleteProp { obj: SymId, name: NameId },
    NewObject { dst: SymId },
    /// Receiver allocated for an inlined constructor call
    AllocForCtor { dst: SymId },
    /// Outgoing argument of a call, kept alive for frame rebuilding
    ArgOut { dst: SymId, src: SymId },
    /// `this` is absent for `new`, which allocates its own receiver
    Call {
        dst: SymId,
        callee: SymId,
        this: Option<SymId>,
        args: Vec<SymId>,
        construct: bool,
    },
    InlineeStart { frame: FrameIdx },
    InlineeEnd { frame: FrameIdx },
    /// Constructor result: `value` if it is an object, otherwise `this`
    CtorResult { dst: SymId, value: SymId, this: SymId },
    Throw { value: SymId },
    /// Placeholder left by a removed instruction whose interpreter reads
    /// must stay live
    BytecodeUses,
}

impl InstKind {
    /// Get the destination symbol if this instruction produces a value
    pub fn dst(&self) -> Option<SymId> {
        match self {
            InstKind::Const { dst, .. }
            | InstKind::Move { dst, .. }
            | InstKind::LoadParam { dst, .. }
            | InstKind::LoadIncoming { dst, .. }
            | InstKind::LoadThis { dst }
            | InstKind::ArgCount { dst }
            | InstKind::LoadArg { dst, .. }
            | InstKind::Binary { dst, .. }
            | InstKind::IntBinary { dst, .. }
            | InstKind::Not { dst, .. }
            | InstKind::IsFunction { dst, .. }
            | InstKind::LoadProp { dst, .. }
            | InstKind::NewObject { dst }
            | InstKind::AllocForCtor { dst }
            | InstKind::ArgOut { dst, .. }
            | InstKind::Call { dst, .. }
            | InstKind::CtorResult { dst, .. } => Some(*dst),

            InstKind::CheckInt { .. }
            | InstKind::CheckShape { .. }
            | InstKind::CheckCallTarget { .. }
            | InstKind::Bail
            | InstKind::StoreProp { .. }
            | InstKind::DeleteProp { .. }
            | InstKind::InlineeStart { .. }
            | InstKind::InlineeEnd { .. }
            | InstKind::Throw { .. }
            | InstKind::BytecodeUses => None,
        }
    }

    /// Append the symbols this instruction reads
    pub fn uses(&self, out: &mut Vec<SymId>) {
        match self {
            InstKind::Const { .. }
            | InstKind::LoadParam { .. }
            | InstKind::LoadIncoming { .. }
            | InstKind::LoadThis { .. }
            | InstKind::ArgCount { .. }
            | InstKind::Bail
            | InstKind::NewObject { .. }
            | InstKind::AllocForCtor { .. }
            | InstKind::InlineeStart { .. }
            | InstKind::InlineeEnd { .. }
            | InstKind::BytecodeUses => {}

            InstKind::Move { src, .. }
            | InstKind::Not { src, .. }
            | InstKind::ArgOut { src, .. } => out.push(*src),
            InstKind::LoadArg { index, .. } => out.push(*index),
            InstKind::Binary { lhs, rhs, .. } | InstKind::IntBinary { lhs, rhs, .. } => {
                out.push(*lhs);
                out.push(*rhs);
            }
            InstKind::CheckInt { value } => out.push(*value),
            InstKind::CheckShape { obj, .. } => out.push(*obj),
            InstKind::CheckCallTarget { callee, .. } => out.push(*callee),
            InstKind::IsFunction { value, .. } => out.push(*value),
            InstKind::LoadProp { obj, .. } | InstKind::DeleteProp { obj, .. } => out.push(*obj),
            InstKind::StoreProp { obj, value, .. } => {
                out.push(*obj);
                out.push(*value);
            }
            InstKind::Call { callee, this, args, .. } => {
                out.push(*callee);
                out.extend(*this);
                out.extend(args.iter().copied());
            }
            InstKind::CtorResult { value, this, .. } => {
                out.push(*value);
                out.push(*this);
            }
            InstKind::Throw { value } => out.push(*value),
        }
    }

    /// Whether this instruction must stay even when its result is unused
    pub fn has_side_effects(&self) -> bool {
        match self {
            InstKind::Const { .. }
            | InstKind::Move { .. }
            | InstKind::LoadParam { .. }
            | InstKind::LoadIncoming { .. }
            | InstKind::LoadThis { .. }
            | InstKind::ArgCount { .. }
            | InstKind::LoadArg { .. }
            | InstKind::Not { .. }
            | InstKind::IsFunction { .. }
            | InstKind::ArgOut { .. }
            | InstKind::CtorResult { .. }
            | InstKind::BytecodeUses => false,

            // An unused speculative result needs no checking
            InstKind::IntBinary { .. } => false,

            // Cached loads cannot fail or run code
            InstKind::LoadProp { slot, .. } => slot.is_none(),
            InstKind::NewObject { .. } | InstKind::AllocForCtor { .. } => false,

            InstKind::Binary { op, .. } => op.may_call_implicitly(),

            _ => true,
        }
    }

    /// Whether running this may invoke script code
    pub fn may_call_implicitly(&self) -> bool {
        match self {
            InstKind::Binary { op, .. } => op.may_call_implicitly(),
            InstKind::Call { .. } => true,
            _ => false,
        }
    }

    pub fn may_throw(&self) -> bool {
        match self {
            InstKind::Binary { op, .. } => op.may_call_implicitly(),
            InstKind::LoadProp { slot, .. } | InstKind::StoreProp { slot, .. } => slot.is_none(),
            InstKind::DeleteProp { .. } | InstKind::Call { .. } | InstKind::Throw { .. } => true,
            _ => false,
        }
    }

    pub fn is_guard(&self) -> bool {
        matches!(
            self,
            InstKind::CheckInt { .. }
                | InstKind::CheckShape { .. }
                | InstKind::CheckCallTarget { .. }
                | InstKind::Bail
                | InstKind::IntBinary { .. }
        )
    }

    pub fn is_call(&self) -> bool {
        matches!(self, InstKind::Call { .. })
    }
}

#[derive(Debug)]
pub struct Inst {
    pub kind: InstKind,
    pub offset: Offset,
    pub frame: FrameIdx,
    /// Register symbols the byte-code op reads; they stay live for bailouts
    /// even if the instruction itself is removed
    pub bc_uses: Vec<SymId>,
    /// Guard, implicit-call or lazy bailout
    pub bailout: Option<BailoutHandle>,
    /// Exception bailout, present when a handler exists in the frame chain
    pub on_throw: Option<BailoutHandle>,
}

impl Inst {
    pub fn new(kind: InstKind, offset: Offset, frame: FrameIdx) -> Self {
        Inst {
            kind,
            offset,
            frame,
            bc_uses: Vec::new(),
            bailout: None,
            on_throw: None,
        }
    }

    pub fn with_bc_uses(mut self, uses: Vec<SymId>) -> Self {
        self.bc_uses = uses;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Terminator {
    Jump(BlockId),
    Branch {
        cond: SymId,
        then_block: BlockId,
        else_block: BlockId,
    },
    Return(SymId),
    Unreachable,
    /// Placeholder while lifting
    None,
}

impl Terminator {
    pub fn successors(&self) -> Vec<BlockId> {
        match self {
            Terminator::Jump(b) => vec![*b],
            Terminator::Branch {
                then_block,
                else_block,
                ..
            } => {
                if then_block == else_block {
                    vec![*then_block]
                } else {
                    vec![*then_block, *else_block]
                }
            }
            _ => vec![],
        }
    }

    pub fn uses(&self) -> Option<SymId> {
        match self {
            Terminator::Branch { cond, .. } => Some(*cond),
            Terminator::Return(s) => Some(*s),
            _ => None,
        }
    }
}

#[derive(Debug)]
pub struct Block {
    pub id: BlockId,
    pub insts: Vec<Inst>,
    pub term: Terminator,
    pub term_offset: Offset,
    pub term_frame: FrameIdx,
    /// Pruned; kept in place so block ids stay stable
    pub dead: bool,
}

/// One function being optimized, including its inlined callees
#[derive(Debug)]
pub struct IrFunc {
    pub func: FuncId,
    pub name: String,
    pub entry: EntryKind,
    pub blocks: Vec<Block>,
    pub entry_block: BlockId,
    pub syms: Vec<SymInfo>,
    pub frames: FrameTable,
    pub arena: BailoutArena,
}

impl IrFunc {
    /// Create a function whose root frame owns `register_count` register symbols
    pub fn new(func: FuncId, name: impl Into<String>, entry: EntryKind, register_count: u16) -> Self {
        let syms: Vec<SymInfo> = (0..register_count)
            .map(|r| SymInfo {
                frame: FrameIdx::ROOT,
                reg: Some(r),
            })
            .collect();
        let reg_syms = (0..register_count as u32).map(SymId).collect();
        IrFunc {
            func,
            name: name.into(),
            entry,
            blocks: Vec::new(),
            entry_block: BlockId(0),
            syms,
            frames: FrameTable::new(func, reg_syms),
            arena: BailoutArena::new(),
        }
    }

    pub fn new_sym(&mut self, frame: FrameIdx, reg: Option<u16>) -> SymId {
        self.syms.push(SymInfo { frame, reg });
        SymId(self.syms.len() as u32 - 1)
    }

    pub fn sym(&self, s: SymId) -> SymInfo {
        self.syms[s.0 as usize]
    }

    /// Whether `s` holds a byte-code register (as opposed to a temporary)
    pub fn is_register(&self, s: SymId) -> bool {
        self.syms[s.0 as usize].reg.is_some()
    }

    pub fn add_block(&mut self) -> BlockId {
        let id = BlockId(self.blocks.len() as u32);
        self.blocks.push(Block {
            id,
            insts: Vec::new(),
            term: Terminator::None,
            term_offset: 0,
            term_frame: FrameIdx::ROOT,
            dead: false,
        });
        id
    }

    pub fn block(&self, id: BlockId) -> &Block {
        &self.blocks[id.0 as usize]
    }

    pub fn block_mut(&mut self, id: BlockId) -> &mut Block {
        &mut self.blocks[id.0 as usize]
    }

    pub fn successors(&self, id: BlockId) -> Vec<BlockId> {
        self.block(id).term.successors()
    }

    /// Predecessor lists of live blocks
    pub fn predecessors(&self) -> Vec<Vec<BlockId>> {
        let mut preds = vec![Vec::new(); self.blocks.len()];
        for block in self.blocks.iter().filter(|b| !b.dead) {
            for succ in block.term.successors() {
                preds[succ.0 as usize].push(block.id);
            }
        }
        preds
    }

    /// Live blocks reachable from the entry in reverse postorder
    pub fn reverse_postorder(&self) -> Vec<BlockId> {
        let mut visited = vec![false; self.blocks.len()];
        let mut order = Vec::new();
        let mut stack = vec![(self.entry_block, 0usize)];
        visited[self.entry_block.0 as usize] = true;
        while let Some((block, next)) = stack.pop() {
            let succs = self.successors(block);
            if let Some(&succ) = succs.get(next) {
                stack.push((block, next + 1));
                if !visited[succ.0 as usize] && !self.block(succ).dead {
                    visited[succ.0 as usize] = true;
                    stack.push((succ, 0));
                }
            } else {
                order.push(block);
            }
        }
        order.reverse();
        order
    }

    pub fn live_blocks(&self) -> impl Iterator<Item = &Block> {
        self.blocks.iter().filter(|b| !b.dead)
    }

    /// Total number of instructions across live blocks
    pub fn inst_count(&self) -> usize {
        self.live_blocks().map(|b| b.insts.len()).sum()
    }

    /// Bailout descriptors referenced by live instructions
    pub fn bailout_sites(&self) -> usize {
        self.live_blocks()
            .flat_map(|b| b.insts.iter())
            .map(|i| i.bailout.is_some() as usize + i.on_throw.is_some() as usize)
            .sum()
    }

    /// Drop an instruction, returning its descriptors to the arena
    pub fn release_inst(&mut self, inst: Inst) {
        if let Some(h) = inst.bailout {
            self.arena.release(h);
        }
        if let Some(h) = inst.on_throw {
            self.arena.release(h);
        }
    }

    /// Mark a block dead and release everything it holds
    pub fn kill_block(&mut self, id: BlockId) {
        let insts = std::mem::take(&mut self.block_mut(id).insts);
        for inst in insts {
            self.release_inst(inst);
        }
        let block = self.block_mut(id);
        block.term = Terminator::Unreachable;
        block.dead = true;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bailout::{BailoutInfo, BailoutKind, BailoutReason};

    #[test]
    fn test_reverse_postorder_skips_unreachable() {
        let mut f = IrFunc::new(FuncId(0), "f", EntryKind::Function, 1);
        let a = f.add_block();
        let b = f.add_block();
        let c = f.add_block();
        let _orphan = f.add_block();
        f.block_mut(a).term = Terminator::Branch {
            cond: SymId(0),
            then_block: b,
            else_block: c,
        };
        f.block_mut(b).term = Terminator::Jump(c);
        f.block_mut(c).term = Terminator::Return(SymId(0));
        let rpo = f.reverse_postorder();
        assert_eq!(rpo[0], a);
        assert_eq!(rpo.len(), 3);
        let pos = |x: BlockId| rpo.iter().position(|y| *y == x).unwrap();
        assert!(pos(b) < pos(c));
    }

    #[test]
    fn test_kill_block_releases_bailouts() {
        let mut f = IrFunc::new(FuncId(0), "f", EntryKind::Function, 1);
        let a = f.add_block();
        let h = f.arena.alloc(BailoutInfo::new(
            0,
            BailoutKind::Eager,
            BailoutReason::NotAnInt,
            FrameIdx::ROOT,
        ));
        let mut inst = Inst::new(InstKind::CheckInt { value: SymId(0) }, 0, FrameIdx::ROOT);
        inst.bailout = Some(h);
        f.block_mut(a).insts.push(inst);
        assert_eq!(f.arena.live_count(), 1);
        f.kill_block(a);
        assert_eq!(f.arena.live_count(), 0);
        assert!(f.block(a).dead);
    }

    #[test]
    fn test_side_effects() {
        let int_add = InstKind::IntBinary {
            op: BinaryOp::Add,
            dst: SymId(0),
            lhs: SymId(1),
            rhs: SymId(2),
            check_overflow: false,
            check_negzero: false,
        };
        assert!(!int_add.has_side_effects());
        let generic = InstKind::Binary {
            op: BinaryOp::Add,
            dst: SymId(0),
            lhs: SymId(1),
            rhs: SymId(2),
        };
        assert!(generic.has_side_effects());
        assert!(generic.may_call_implicitly());
        let strict = InstKind::Binary {
            op: BinaryOp::StrictEq,
            dst: SymId(0),
            lhs: SymId(1),
            rhs: SymId(2),
        };
        assert!(!strict.has_side_effects());
    }
}

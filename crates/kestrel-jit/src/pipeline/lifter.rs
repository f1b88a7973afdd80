//! Byte code to IR lifter
//!
//! Translates one function body into IR blocks of a given logical frame.
//! Registers map one-to-one onto symbols. In the full tier the lifter
//! specializes on the value profile: int-only arithmetic gets int guards,
//! monomorphic property sites get a shape guard plus a cached slot access,
//! and branch sides that never ran become unconditional bailouts.

use std::sync::Arc;

use rustc_hash::{FxHashMap, FxHashSet};

use crate::analysis::cfg::{build_cfg, ControlFlowGraph, LoopRegion};
use crate::bailout::{BailoutHandle, BailoutInfo, BailoutKind, BailoutReason};
use crate::bytecode::{BinaryOp, FuncId, FunctionBody, Offset, Op};
use crate::interp::heap::ShapeId;
use crate::interp::value::Value;
use crate::ir::{BlockId, EntryKind, FrameIdx, Inst, InstKind, IrBuilder, IrFunc, SymId, Terminator};
use crate::profiling::ProfileData;
use crate::runtime::stats::Relax;

use super::context::CompileContext;

/// Error during lifting
#[derive(Debug, thiserror::Error)]
pub enum LiftError {
    #[error("unknown function {0}")]
    UnknownFunction(FuncId),
    #[error("no loop is headed at offset {0}")]
    NotALoop(Offset),
    #[error("{op} at offset {offset} needs its own frame")]
    NotInlinable { offset: Offset, op: &'static str },
}

/// What a `Return` op turns into
#[derive(Debug, Clone, Copy)]
pub(crate) enum ReturnMode {
    Root,
    /// Store into `ret_tmp` and continue at `return_block`
    Inlinee {
        ret_tmp: SymId,
        return_block: BlockId,
        this_value: SymId,
    },
}

/// Lift the body of the compiled function
pub fn lift_function(ctx: &mut CompileContext<'_>, func: FuncId, entry: EntryKind) -> Result<IrFunc, LiftError> {
    let body = ctx.body(func)?;
    let mut ir = IrFunc::new(func, body.name.clone(), entry, body.register_count);
    let entry_block = ir.add_block();
    ir.entry_block = entry_block;

    let cfg = build_cfg(body);
    let (start, region) = match entry {
        EntryKind::Function => (0, None),
        EntryKind::Loop(header) => (header, Some(cfg.loop_at(header).ok_or(LiftError::NotALoop(header))?)),
    };
    let lifter = FrameLifter::new(ctx, body, cfg, FrameIdx::ROOT, ReturnMode::Root, region);
    let first = lifter.lift(&mut ir, start)?;

    let mut b = IrBuilder::new(&mut ir, entry_block, FrameIdx::ROOT);
    b.set_location(start, FrameIdx::ROOT);
    for reg in 0..body.register_count {
        let dst = SymId(reg as u32);
        let kind = match entry {
            EntryKind::Loop(_) => InstKind::LoadIncoming { dst, reg },
            EntryKind::Function if reg < body.param_count => InstKind::LoadParam { dst, index: reg },
            EntryKind::Function => InstKind::Const {
                dst,
                value: Value::UNDEFINED,
            },
        };
        b.emit(kind);
    }
    b.terminate(Terminator::Jump(first));

    tracing::trace!(func = %func, blocks = ir.blocks.len(), "lifted\n{}", ir);
    Ok(ir)
}

pub(crate) struct FrameLifter<'c, 'a> {
    ctx: &'c mut CompileContext<'a>,
    body: &'a FunctionBody,
    cfg: ControlFlowGraph,
    frame: FrameIdx,
    profile: Arc<ProfileData>,
    ret: ReturnMode,
    region: Option<LoopRegion>,
    blocks: FxHashMap<Offset, BlockId>,
    exits: FxHashMap<Offset, BlockId>,
    work: Vec<Offset>,
    known_int: FxHashSet<SymId>,
    reg_syms: Vec<SymId>,
}

impl<'c, 'a> FrameLifter<'c, 'a> {
    pub(crate) fn new(
        ctx: &'c mut CompileContext<'a>,
        body: &'a FunctionBody,
        cfg: ControlFlowGraph,
        frame: FrameIdx,
        ret: ReturnMode,
        region: Option<LoopRegion>,
    ) -> Self {
        let profile = ctx.profile(body.id);
        FrameLifter {
            ctx,
            body,
            cfg,
            frame,
            profile,
            ret,
            region,
            blocks: FxHashMap::default(),
            exits: FxHashMap::default(),
            work: Vec::new(),
            known_int: FxHashSet::default(),
            reg_syms: Vec::new(),
        }
    }

    /// Lift every block reachable from `start`; returns the block for `start`
    pub(crate) fn lift(mut self, func: &mut IrFunc, start: Offset) -> Result<BlockId, LiftError> {
        self.reg_syms = func.frames.get(self.frame).reg_syms.clone();
        let entry = self.block_for(func, start);
        while let Some(offset) = self.work.pop() {
            self.lift_block(func, offset)?;
        }
        Ok(entry)
    }

    fn reg(&self, r: u16) -> SymId {
        self.reg_syms[r as usize]
    }

    /// Block that starts at `offset`, or a loop-exit bailout outside the region
    fn block_for(&mut self, func: &mut IrFunc, offset: Offset) -> BlockId {
        if let Some(region) = self.region {
            if !region.contains(offset) {
                if let Some(&b) = self.exits.get(&offset) {
                    return b;
                }
                let b = self.bail_block(func, offset, offset, BailoutReason::LoopExit);
                self.exits.insert(offset, b);
                return b;
            }
        }
        if let Some(&b) = self.blocks.get(&offset) {
            return b;
        }
        let b = func.add_block();
        self.blocks.insert(offset, b);
        self.work.push(offset);
        b
    }

    /// A block that leaves compiled code and resumes the interpreter at `at`
    fn bail_block(&mut self, func: &mut IrFunc, at: Offset, site: Offset, reason: BailoutReason) -> BlockId {
        let block = func.add_block();
        let mut uses = Vec::new();
        self.ctx
            .liveness
            .resume_syms(&func.frames, self.frame, at, &mut uses);
        let mut info = BailoutInfo::new(at, BailoutKind::Eager, reason, self.frame);
        info.site = site;
        let handle = func.arena.alloc(info);
        let mut inst = Inst::new(InstKind::Bail, site, self.frame).with_bc_uses(uses);
        inst.bailout = Some(handle);
        let b = func.block_mut(block);
        b.insts.push(inst);
        b.term = Terminator::Unreachable;
        b.term_offset = site;
        b.term_frame = self.frame;
        block
    }

    fn lift_block(&mut self, func: &mut IrFunc, start: Offset) -> Result<(), LiftError> {
        let Some(&block) = self.blocks.get(&start) else {
            return Ok(());
        };
        let end = match self.cfg.block_at(start) {
            Some(cfg_block) => cfg_block.end,
            None => start + 1,
        };
        self.known_int.clear();
        let mut b = IrBuilder::new(func, block, self.frame);
        for pc in start..end {
            b.set_location(pc, self.frame);
            let op = self.body.code[pc as usize];
            self.lift_op(&mut b, pc, op)?;
            if b.is_terminated() {
                return Ok(());
            }
        }
        let next = self.block_for(b.func_mut(), end);
        b.terminate(Terminator::Jump(next));
        Ok(())
    }

    fn reads(&self, op: &Op) -> Vec<SymId> {
        let mut regs = Vec::new();
        op.reads(&mut regs);
        regs.into_iter().map(|r| self.reg(r)).collect()
    }

    /// Exception bailout for a throwing op when some frame would catch it
    fn on_throw(&mut self, b: &mut IrBuilder<'_>, pc: Offset) -> Option<BailoutHandle> {
        let caught = self
            .ctx
            .liveness
            .is_caught(&b.func().frames, self.frame, pc);
        caught.then(|| b.bailout(BailoutKind::Exception, BailoutReason::Throw))
    }

    fn emit_throwing(&mut self, b: &mut IrBuilder<'_>, pc: Offset, kind: InstKind, uses: Vec<SymId>) {
        let mut inst = b.inst(kind).with_bc_uses(uses);
        inst.on_throw = self.on_throw(b, pc);
        b.push(inst);
    }

    fn define(&mut self, dst: SymId, is_int: bool) {
        if is_int {
            self.known_int.insert(dst);
        } else {
            self.known_int.remove(&dst);
        }
    }

    fn speculate_int(&self, pc: Offset, op: BinaryOp) -> bool {
        op.may_call_implicitly()
            && op != BinaryOp::Div
            && self.ctx.config.phases.int_specialization
            && self.profile.int_only(pc)
            && self.ctx.allows(self.body.id, pc, Relax::NoIntSpec)
    }

    fn monomorphic_shape(&self, pc: Offset) -> Option<(ShapeId, u32)> {
        if !self.ctx.config.phases.shape_specialization
            || !self.ctx.allows(self.body.id, pc, Relax::NoShapeSpec)
        {
            return None;
        }
        self.profile.prop(pc).and_then(|p| p.monomorphic())
    }

    /// Which side of the branch at `pc` never ran: `Some(true)` for the taken side
    fn never_taken(&self, pc: Offset) -> Option<bool> {
        if !self.ctx.config.phases.bail_on_no_profile
            || !self.ctx.allows(self.body.id, pc, Relax::NoBranchPrune)
        {
            return None;
        }
        let profile = self.profile.branch(pc)?;
        match (profile.taken, profile.not_taken) {
            (0, n) if n > 0 => Some(true),
            (t, 0) if t > 0 => Some(false),
            _ => None,
        }
    }

    fn lift_op(&mut self, b: &mut IrBuilder<'_>, pc: Offset, op: Op) -> Result<(), LiftError> {
        let uses = self.reads(&op);
        match op {
            Op::LoadInt { dst, value } => self.constant(b, dst, Value::int(value)),
            Op::LoadFloat { dst, value } => self.constant(b, dst, Value::number(value)),
            Op::LoadBool { dst, value } => self.constant(b, dst, Value::bool(value)),
            Op::LoadUndefined { dst } => self.constant(b, dst, Value::UNDEFINED),
            Op::LoadNull { dst } => self.constant(b, dst, Value::NULL),
            Op::LoadFunction { dst, func } => self.constant(b, dst, Value::function(func)),
            Op::Catch { dst } => self.constant(b, dst, Value::UNDEFINED),
            Op::Move { dst, src } => {
                let (d, s) = (self.reg(dst), self.reg(src));
                let is_int = self.known_int.contains(&s);
                b.push(b.inst(InstKind::Move { dst: d, src: s }).with_bc_uses(uses));
                self.define(d, is_int);
            }
            Op::Binary { op, dst, lhs, rhs } => self.binary(b, pc, op, dst, lhs, rhs, uses),
            Op::Not { dst, src } => {
                let (d, s) = (self.reg(dst), self.reg(src));
                b.push(b.inst(InstKind::Not { dst: d, src: s }).with_bc_uses(uses));
                self.define(d, false);
            }
            Op::GetProp { dst, obj, name } => {
                let (d, o) = (self.reg(dst), self.reg(obj));
                match self.monomorphic_shape(pc) {
                    Some((shape, slot)) => {
                        let mut guard = b.inst(InstKind::CheckShape { obj: o, shape }).with_bc_uses(uses.clone());
                        guard.bailout = Some(b.bailout(BailoutKind::Eager, BailoutReason::ShapeMismatch));
                        b.push(guard);
                        let load = InstKind::LoadProp {
                            dst: d,
                            obj: o,
                            name,
                            slot: Some(slot),
                        };
                        b.push(b.inst(load).with_bc_uses(uses));
                    }
                    None => {
                        let load = InstKind::LoadProp {
                            dst: d,
                            obj: o,
                            name,
                            slot: None,
                        };
                        self.emit_throwing(b, pc, load, uses);
                    }
                }
                self.define(d, false);
            }
            Op::SetProp { obj, name, value } => {
                let (o, v) = (self.reg(obj), self.reg(value));
                match self.monomorphic_shape(pc) {
                    Some((shape, slot)) => {
                        let mut guard = b.inst(InstKind::CheckShape { obj: o, shape }).with_bc_uses(uses.clone());
                        guard.bailout = Some(b.bailout(BailoutKind::Eager, BailoutReason::ShapeMismatch));
                        b.push(guard);
                        let store = InstKind::StoreProp {
                            obj: o,
                            name,
                            value: v,
                            slot: Some(slot),
                        };
                        b.push(b.inst(store).with_bc_uses(uses));
                    }
                    None => {
                        let store = InstKind::StoreProp {
                            obj: o,
                            name,
                            value: v,
                            slot: None,
                        };
                        self.emit_throwing(b, pc, store, uses);
                    }
                }
            }
            Op::DeleteProp { obj, name } => {
                let o = self.reg(obj);
                self.emit_throwing(b, pc, InstKind::DeleteProp { obj: o, name }, uses);
            }
            Op::NewObject { dst } => {
                let d = self.reg(dst);
                b.emit(InstKind::NewObject { dst: d });
                self.define(d, false);
            }
            Op::LoadThis { dst } => {
                let d = self.reg(dst);
                let kind = match self.ret {
                    ReturnMode::Root => InstKind::LoadThis { dst: d },
                    ReturnMode::Inlinee { this_value, .. } => InstKind::Move { dst: d, src: this_value },
                };
                b.emit(kind);
                self.define(d, false);
            }
            Op::ArgCount { dst } => {
                self.require_root(pc, "ArgCount")?;
                let d = self.reg(dst);
                b.emit(InstKind::ArgCount { dst: d });
                self.define(d, true);
            }
            Op::LoadArg { dst, index } => {
                self.require_root(pc, "LoadArg")?;
                let (d, i) = (self.reg(dst), self.reg(index));
                b.push(b.inst(InstKind::LoadArg { dst: d, index: i }).with_bc_uses(uses));
                self.define(d, false);
            }
            Op::Call { dst, callee, this, first_arg, argc } => {
                let d = self.reg(dst);
                let call = InstKind::Call {
                    dst: d,
                    callee: self.reg(callee),
                    this: Some(self.reg(this)),
                    args: (first_arg..first_arg + argc).map(|r| self.reg(r)).collect(),
                    construct: false,
                };
                self.emit_throwing(b, pc, call, uses);
                self.define(d, false);
            }
            Op::New { dst, callee, first_arg, argc } => {
                let d = self.reg(dst);
                let call = InstKind::Call {
                    dst: d,
                    callee: self.reg(callee),
                    this: None,
                    args: (first_arg..first_arg + argc).map(|r| self.reg(r)).collect(),
                    construct: true,
                };
                self.emit_throwing(b, pc, call, uses);
                self.define(d, false);
            }
            Op::Jump { target } => {
                let t = self.block_for(b.func_mut(), target);
                b.terminate(Terminator::Jump(t));
            }
            Op::JumpIfTrue { cond, target } | Op::JumpIfFalse { cond, target } => {
                let fall = pc + 1;
                let never = self.never_taken(pc);
                let taken = match never {
                    Some(true) => self.bail_block(b.func_mut(), target, pc, BailoutReason::NoProfile),
                    _ => self.block_for(b.func_mut(), target),
                };
                let not_taken = match never {
                    Some(false) => self.bail_block(b.func_mut(), fall, pc, BailoutReason::NoProfile),
                    _ => self.block_for(b.func_mut(), fall),
                };
                let (then_block, else_block) = match op {
                    Op::JumpIfTrue { .. } => (taken, not_taken),
                    _ => (not_taken, taken),
                };
                b.terminate(Terminator::Branch {
                    cond: self.reg(cond),
                    then_block,
                    else_block,
                });
            }
            Op::Return { src } => {
                let s = self.reg(src);
                match self.ret {
                    ReturnMode::Root => b.terminate(Terminator::Return(s)),
                    ReturnMode::Inlinee {
                        ret_tmp, return_block, ..
                    } => {
                        b.push(b.inst(InstKind::Move { dst: ret_tmp, src: s }).with_bc_uses(uses));
                        b.terminate(Terminator::Jump(return_block));
                    }
                }
            }
            Op::EnterTry { .. } | Op::LeaveTry => {}
            Op::Throw { src } => {
                let s = self.reg(src);
                self.emit_throwing(b, pc, InstKind::Throw { value: s }, uses);
                b.terminate(Terminator::Unreachable);
            }
        }
        Ok(())
    }

    fn require_root(&self, offset: Offset, op: &'static str) -> Result<(), LiftError> {
        match self.ret {
            ReturnMode::Root => Ok(()),
            ReturnMode::Inlinee { .. } => Err(LiftError::NotInlinable { offset, op }),
        }
    }

    fn constant(&mut self, b: &mut IrBuilder<'_>, dst: u16, value: Value) {
        let d = self.reg(dst);
        b.emit(InstKind::Const { dst: d, value });
        self.define(d, value.is_int());
    }

    #[allow(clippy::too_many_arguments)]
    fn binary(
        &mut self,
        b: &mut IrBuilder<'_>,
        pc: Offset,
        op: BinaryOp,
        dst: u16,
        lhs: u16,
        rhs: u16,
        uses: Vec<SymId>,
    ) {
        let (d, l, r) = (self.reg(dst), self.reg(lhs), self.reg(rhs));
        if !self.speculate_int(pc, op) {
            let kind = InstKind::Binary { op, dst: d, lhs: l, rhs: r };
            if op.may_call_implicitly() {
                self.emit_throwing(b, pc, kind, uses);
            } else {
                b.push(b.inst(kind).with_bc_uses(uses));
            }
            self.define(d, false);
            return;
        }

        for s in [l, r] {
            if self.known_int.insert(s) {
                let mut guard = b.inst(InstKind::CheckInt { value: s }).with_bc_uses(uses.clone());
                guard.bailout = Some(b.bailout(BailoutKind::Eager, BailoutReason::NotAnInt));
                b.push(guard);
            }
        }
        let check_overflow = matches!(op, BinaryOp::Add | BinaryOp::Sub | BinaryOp::Mul);
        let check_negzero = op == BinaryOp::Mul;
        let mut inst = b
            .inst(InstKind::IntBinary {
                op,
                dst: d,
                lhs: l,
                rhs: r,
                check_overflow,
                check_negzero,
            })
            .with_bc_uses(uses);
        if check_overflow || check_negzero {
            inst.bailout = Some(b.bailout(BailoutKind::Eager, BailoutReason::IntOverflow));
        }
        b.push(inst);
        self.define(d, !op.is_compare());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::BytecodeBuilder;
    use crate::bytecode::Program;
    use crate::config::JitConfig;
    use crate::profiling::{ProgramProfile, Tier};
    use crate::runtime::stats::OverrideSnapshot;

    fn add_function() -> Program {
        let mut b = BytecodeBuilder::new("add", 2, 3);
        b.emit(Op::Binary { op: BinaryOp::Add, dst: 2, lhs: 0, rhs: 1 });
        b.emit(Op::Return { src: 2 });
        Program::new(vec![b.finish(FuncId(0)).unwrap()], vec![]).unwrap()
    }

    fn count(ir: &IrFunc, pred: impl Fn(&InstKind) -> bool) -> usize {
        ir.live_blocks()
            .flat_map(|b| b.insts.iter())
            .filter(|i| pred(&i.kind))
            .count()
    }

    #[test]
    fn test_int_profile_adds_guards() {
        let program = add_function();
        let profiles = ProgramProfile::new(1);
        profiles.functions[0].with_data(|d| d.record_arith(0, true));
        let config = JitConfig::default();
        let overrides = OverrideSnapshot::default();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        let ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();
        assert_eq!(count(&ir, |k| matches!(k, InstKind::CheckInt { .. })), 2);
        assert_eq!(count(&ir, |k| matches!(k, InstKind::IntBinary { .. })), 1);
    }

    #[test]
    fn test_simple_tier_does_not_speculate() {
        let program = add_function();
        let profiles = ProgramProfile::new(1);
        profiles.functions[0].with_data(|d| d.record_arith(0, true));
        let config = JitConfig::default();
        let overrides = OverrideSnapshot::default();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Simple);
        let ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();
        assert_eq!(count(&ir, |k| matches!(k, InstKind::CheckInt { .. })), 0);
        assert_eq!(count(&ir, |k| matches!(k, InstKind::Binary { .. })), 1);
        assert_eq!(ir.arena.live_count(), 0);
    }

    #[test]
    fn test_never_taken_branch_becomes_bailout() {
        let mut b = BytecodeBuilder::new("f", 1, 2);
        let other = b.label();
        b.jump_if_true(0, other);
        b.emit(Op::LoadInt { dst: 1, value: 1 });
        b.emit(Op::Return { src: 1 });
        b.bind(other);
        b.emit(Op::LoadInt { dst: 1, value: 2 });
        b.emit(Op::Return { src: 1 });
        let program = Program::new(vec![b.finish(FuncId(0)).unwrap()], vec![]).unwrap();
        let profiles = ProgramProfile::new(1);
        profiles.functions[0].with_data(|d| d.record_branch(0, false));
        let config = JitConfig::default();
        let overrides = OverrideSnapshot::default();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        let ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();

        let bail = ir
            .live_blocks()
            .flat_map(|b| b.insts.iter())
            .find(|i| i.kind == InstKind::Bail)
            .unwrap();
        let info = ir.arena.get(bail.bailout.as_ref().unwrap());
        assert_eq!(info.reason, BailoutReason::NoProfile);
        assert_eq!(info.offset, 3);
        assert_eq!(info.site, 0);
        // only the taken-side constant load was never lifted
        assert_eq!(count(&ir, |k| matches!(k, InstKind::Const { value, .. } if *value == Value::int(2))), 0);
    }

    #[test]
    fn test_loop_entry_exits_bail() {
        let mut b = BytecodeBuilder::new("f", 1, 3);
        let head = b.label();
        let exit = b.label();
        b.emit(Op::LoadInt { dst: 1, value: 0 });
        b.bind(head);
        b.emit(Op::Binary { op: BinaryOp::Lt, dst: 2, lhs: 1, rhs: 0 });
        b.jump_if_false(2, exit);
        b.emit(Op::Binary { op: BinaryOp::Add, dst: 1, lhs: 1, rhs: 1 });
        b.jump(head);
        b.bind(exit);
        b.emit(Op::Return { src: 1 });
        let program = Program::new(vec![b.finish(FuncId(0)).unwrap()], vec![]).unwrap();
        let profiles = ProgramProfile::new(1);
        let config = JitConfig::default();
        let overrides = OverrideSnapshot::default();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        let ir = lift_function(&mut ctx, FuncId(0), EntryKind::Loop(1)).unwrap();
        assert_eq!(count(&ir, |k| matches!(k, InstKind::LoadIncoming { .. })), 3);
        let exit = ir
            .live_blocks()
            .flat_map(|b| b.insts.iter())
            .find(|i| i.kind == InstKind::Bail)
            .unwrap();
        let info = ir.arena.get(exit.bailout.as_ref().unwrap());
        assert_eq!(info.reason, BailoutReason::LoopExit);
        assert_eq!(info.offset, 5);
        assert!(exit.bc_uses.contains(&SymId(1)));
        assert!(!ir.live_blocks().any(|b| matches!(b.term, Terminator::Return(_))));
    }
}

//! Inlining decider and frame composer
//!
//! Call sites whose profile names one or a few targets get the callees'
//! bodies spliced in. A monomorphic site is protected by a call-target
//! guard; a polymorphic site dispatches over its targets and keeps a generic
//! call as fallback. Every inlined body runs in a logical frame whose record
//! tells recovery how to rebuild the callee's interpreter frame.
//!
//! Composition is transactional. New symbols, frames and blocks are built
//! first and the call site is only rewritten once everything succeeded;
//! otherwise all of it is rolled back and the call stays as it was.

use rustc_hash::FxHashSet;

use crate::analysis::cfg::build_cfg;
use crate::bailout::{ArgProvenance, BailoutInfo, BailoutKind, BailoutReason, InlineeFrameRecord, PendingCall};
use crate::bytecode::{FuncId, Offset};
use crate::interp::value::Value;
use crate::ir::{BlockId, FrameIdx, Inst, InstKind, IrFunc, SymId, Terminator};
use crate::runtime::stats::Relax;

use super::context::CompileContext;
use super::lifter::{FrameLifter, ReturnMode};

/// Why a call site was left alone
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    Disabled,
    Overridden,
    NoProfile,
    Megamorphic,
    TooDeep,
    TooManyArguments,
    Recursive,
    TooLarge,
    OverBudget,
    UsesArguments,
    UnknownTarget,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InlineDecision {
    Monomorphic(FuncId),
    Polymorphic(Vec<FuncId>),
    Reject(RejectReason),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InlineStats {
    pub inlined: usize,
    pub polymorphic: usize,
    pub rejected: usize,
    pub rolled_back: usize,
}

/// Decide what to do with the call at `offset` in `frame`
pub fn decide(
    ctx: &mut CompileContext<'_>,
    func: &IrFunc,
    frame: FrameIdx,
    offset: Offset,
    argc: usize,
    budget_used: usize,
) -> InlineDecision {
    let config = ctx.config;
    let inlining = &config.inlining;
    if !config.phases.inlining || !ctx.tier.speculates() {
        return InlineDecision::Reject(RejectReason::Disabled);
    }
    let caller = func.frames.get(frame);
    if !ctx.allows(caller.func, offset, Relax::NoInline) {
        return InlineDecision::Reject(RejectReason::Overridden);
    }
    if caller.depth + 1 > inlining.max_depth {
        return InlineDecision::Reject(RejectReason::TooDeep);
    }
    if argc > config.limits.max_args as usize {
        return InlineDecision::Reject(RejectReason::TooManyArguments);
    }
    let profile = ctx.profile(caller.func);
    let Some(site) = profile.call_site(offset).filter(|s| s.count > 0) else {
        return InlineDecision::Reject(RejectReason::NoProfile);
    };
    if site.megamorphic || site.targets.is_empty() {
        return InlineDecision::Reject(RejectReason::Megamorphic);
    }

    // Hot sites may pull in larger bodies
    let size_limit = if site.count >= inlining.hot_site_calls {
        inlining.max_inlinee_size * 2
    } else {
        inlining.max_inlinee_size
    };
    let mut used = budget_used;
    let mut accepted = Vec::new();
    let mut first_reject = None;
    for &target in &site.targets {
        let verdict = match ctx.program.function(target) {
            None => Err(RejectReason::UnknownTarget),
            Some(body) if body.uses_arguments() => Err(RejectReason::UsesArguments),
            Some(_) if func.frames.recursion_count(frame, target) > inlining.max_inline_recursion as usize => {
                Err(RejectReason::Recursive)
            }
            Some(body) if body.len() > size_limit => Err(RejectReason::TooLarge),
            Some(body) if used + body.len() > inlining.max_total_size => Err(RejectReason::OverBudget),
            Some(body) => Ok(body.len()),
        };
        match verdict {
            Ok(size) => {
                used += size;
                accepted.push(target);
            }
            Err(reason) => {
                first_reject.get_or_insert(reason);
            }
        }
    }

    if accepted.is_empty() {
        return InlineDecision::Reject(first_reject.unwrap_or(RejectReason::NoProfile));
    }
    if site.targets.len() == 1 {
        return InlineDecision::Monomorphic(accepted[0]);
    }
    if inlining.max_polymorphic_targets == 0 {
        return InlineDecision::Reject(RejectReason::Megamorphic);
    }
    accepted.truncate(inlining.max_polymorphic_targets);
    InlineDecision::Polymorphic(accepted)
}

/// A call instruction being considered
#[derive(Debug, Clone)]
struct CallSite {
    block: BlockId,
    index: usize,
    offset: Offset,
    frame: FrameIdx,
    dst: SymId,
    callee: SymId,
    this: Option<SymId>,
    args: Vec<SymId>,
    construct: bool,
    bc_uses: Vec<SymId>,
}

/// Outgoing values shared by every inlined target of one site
struct Outgoing {
    temps: Vec<SymId>,
    provenance: Vec<ArgProvenance>,
    this_temp: Option<SymId>,
    this_provenance: ArgProvenance,
}

struct Checkpoint {
    syms: usize,
    frames: usize,
    blocks: usize,
}

pub struct Inliner<'c, 'a> {
    ctx: &'c mut CompileContext<'a>,
    budget_used: usize,
    /// Blocks holding the generic call of a dispatch chain
    fallbacks: FxHashSet<BlockId>,
    stats: InlineStats,
}

impl<'c, 'a> Inliner<'c, 'a> {
    pub fn new(ctx: &'c mut CompileContext<'a>) -> Self {
        Inliner {
            ctx,
            budget_used: 0,
            fallbacks: FxHashSet::default(),
            stats: InlineStats::default(),
        }
    }

    /// Visit every call once, including calls inside freshly inlined bodies
    pub fn run(mut self, func: &mut IrFunc) -> InlineStats {
        let mut idx = 0;
        while idx < func.blocks.len() {
            let block = BlockId(idx as u32);
            idx += 1;
            if self.fallbacks.contains(&block) {
                continue;
            }
            let mut i = 0;
            while !func.block(block).dead && i < func.block(block).insts.len() {
                if func.block(block).insts[i].kind.is_call() && self.try_inline(func, block, i) {
                    // the rest of the block moved to a continuation block
                    break;
                }
                i += 1;
            }
        }
        self.stats
    }

    fn try_inline(&mut self, func: &mut IrFunc, block: BlockId, index: usize) -> bool {
        let inst = &func.block(block).insts[index];
        let InstKind::Call {
            dst,
            callee,
            this,
            ref args,
            construct,
        } = inst.kind
        else {
            return false;
        };
        let site = CallSite {
            block,
            index,
            offset: inst.offset,
            frame: inst.frame,
            dst,
            callee,
            this,
            args: args.clone(),
            construct,
            bc_uses: inst.bc_uses.clone(),
        };

        let decision = decide(self.ctx, func, site.frame, site.offset, site.args.len(), self.budget_used);
        let monomorphic = matches!(decision, InlineDecision::Monomorphic(_));
        let targets = match decision {
            InlineDecision::Reject(reason) => {
                tracing::trace!(offset = site.offset, reason = ?reason, "call not inlined");
                self.stats.rejected += 1;
                return false;
            }
            InlineDecision::Monomorphic(target) => vec![target],
            InlineDecision::Polymorphic(targets) => targets,
        };

        let checkpoint = Checkpoint {
            syms: func.syms.len(),
            frames: func.frames.len(),
            blocks: func.blocks.len(),
        };
        let mut dispatch = Vec::new();
        let out = self.outgoing(func, &site, &mut dispatch);
        let join = func.add_block();

        let mut arms = Vec::with_capacity(targets.len());
        for &target in &targets {
            match self.compose_arm(func, &site, &out, target, join) {
                Ok(arm) => arms.push(arm),
                Err(err) => {
                    tracing::debug!(offset = site.offset, callee = %target, error = %err, "inlining rolled back");
                    self.rollback(func, checkpoint, dispatch);
                    return false;
                }
            }
        }

        let pending = dispatch.len() + targets.len() * 2;
        if func.inst_count() + pending > self.ctx.config.limits.max_ir_size {
            tracing::debug!(offset = site.offset, "inlining rolled back: IR too large");
            self.rollback(func, checkpoint, dispatch);
            return false;
        }

        if monomorphic {
            self.commit_monomorphic(func, &site, &out, targets[0], dispatch, arms[0], join);
        } else {
            self.commit_polymorphic(func, &site, &targets, dispatch, &arms, join);
            self.stats.polymorphic += 1;
        }
        self.stats.inlined += targets.len();
        for target in &targets {
            if let Some(body) = self.ctx.program.function(*target) {
                self.budget_used += body.len();
            }
        }
        tracing::trace!(offset = site.offset, targets = ?targets, "call inlined");
        true
    }

    /// Outgoing argument temps and how each value can be recomputed
    fn outgoing(&mut self, func: &mut IrFunc, site: &CallSite, dispatch: &mut Vec<Inst>) -> Outgoing {
        let parent = func.frames.get(site.frame).func;
        let parent_body = self.ctx.program.function(parent);
        let mut temps = Vec::with_capacity(site.args.len());
        let mut provenance = Vec::with_capacity(site.args.len());
        for &arg in &site.args {
            let t = func.new_sym(site.frame, None);
            dispatch.push(Inst::new(InstKind::ArgOut { dst: t, src: arg }, site.offset, site.frame));
            let prov = match constant_def(func, site, arg) {
                Some(v) => ArgProvenance::Constant(v),
                None => {
                    let info = func.sym(arg);
                    let passthrough = match (info.reg, parent_body) {
                        (Some(reg), Some(body)) if info.frame == site.frame => {
                            (reg < body.param_count && !body.writes_register(reg)).then_some(reg)
                        }
                        _ => None,
                    };
                    match passthrough {
                        Some(i) => ArgProvenance::PassThrough(i),
                        None => ArgProvenance::Sym(t),
                    }
                }
            };
            temps.push(t);
            provenance.push(prov);
        }
        let (this_temp, this_provenance) = match site.this {
            Some(this) => {
                let t = func.new_sym(site.frame, None);
                dispatch.push(Inst::new(InstKind::ArgOut { dst: t, src: this }, site.offset, site.frame));
                let prov = match constant_def(func, site, this) {
                    Some(v) => ArgProvenance::Constant(v),
                    None => ArgProvenance::Sym(t),
                };
                (Some(t), prov)
            }
            None => (None, ArgProvenance::Constant(Value::UNDEFINED)),
        };
        Outgoing {
            temps,
            provenance,
            this_temp,
            this_provenance,
        }
    }

    /// Build one inlined target: a prologue block, the callee body and a
    /// return block jumping to `join`. Returns the prologue block.
    fn compose_arm(
        &mut self,
        func: &mut IrFunc,
        site: &CallSite,
        out: &Outgoing,
        target: FuncId,
        join: BlockId,
    ) -> Result<BlockId, super::lifter::LiftError> {
        let body = self.ctx.body(target)?;
        let arm = func.add_block();
        let mut prologue = Vec::new();

        let (this_value, this_prov) = match (site.construct, out.this_temp) {
            (false, Some(t)) => (t, out.this_provenance),
            _ => {
                let t = func.new_sym(site.frame, None);
                prologue.push(Inst::new(InstKind::AllocForCtor { dst: t }, site.offset, site.frame));
                (t, ArgProvenance::Sym(t))
            }
        };

        let record = InlineeFrameRecord {
            parent: site.frame,
            call_offset: site.offset,
            result_reg: func.sym(site.dst).reg.unwrap_or(0),
            construct: site.construct,
            this: this_prov,
            args: out.provenance.clone(),
        };
        let frame = func.frames.push(target, Vec::new(), record);
        let reg_syms: Vec<SymId> = (0..body.register_count)
            .map(|r| func.new_sym(frame, Some(r)))
            .collect();
        func.frames.get_mut(frame).reg_syms = reg_syms.clone();

        prologue.push(Inst::new(InstKind::InlineeStart { frame }, 0, frame));
        for (reg, &sym) in reg_syms.iter().enumerate() {
            let kind = match out.temps.get(reg) {
                Some(&t) if reg < body.param_count as usize => InstKind::Move { dst: sym, src: t },
                _ => InstKind::Const {
                    dst: sym,
                    value: Value::UNDEFINED,
                },
            };
            prologue.push(Inst::new(kind, 0, frame));
        }

        let ret_tmp = func.new_sym(site.frame, None);
        let ret_block = func.add_block();
        let mode = ReturnMode::Inlinee {
            ret_tmp,
            return_block: ret_block,
            this_value,
        };
        let entry = FrameLifter::new(self.ctx, body, build_cfg(body), frame, mode, None).lift(func, 0)?;

        let result = if site.construct {
            InstKind::CtorResult {
                dst: site.dst,
                value: ret_tmp,
                this: this_value,
            }
        } else {
            InstKind::Move {
                dst: site.dst,
                src: ret_tmp,
            }
        };
        let ret = func.block_mut(ret_block);
        ret.insts.push(Inst::new(InstKind::InlineeEnd { frame }, site.offset, site.frame));
        ret.insts.push(Inst::new(result, site.offset, site.frame));
        ret.term = Terminator::Jump(join);
        ret.term_offset = site.offset;
        ret.term_frame = site.frame;

        let a = func.block_mut(arm);
        a.insts = prologue;
        a.term = Terminator::Jump(entry);
        a.term_offset = 0;
        a.term_frame = frame;
        Ok(arm)
    }

    fn rollback(&mut self, func: &mut IrFunc, cp: Checkpoint, dispatch: Vec<Inst>) {
        for idx in cp.blocks..func.blocks.len() {
            func.kill_block(BlockId(idx as u32));
        }
        func.blocks.truncate(cp.blocks);
        func.syms.truncate(cp.syms);
        func.frames.truncate(cp.frames);
        for inst in dispatch {
            func.release_inst(inst);
        }
        self.stats.rolled_back += 1;
    }

    /// Move everything after the call into `join` and drop the call
    fn split_at_call(func: &mut IrFunc, site: &CallSite, join: BlockId) -> Inst {
        let block = func.block_mut(site.block);
        let tail: Vec<Inst> = block.insts.drain(site.index + 1..).collect();
        let call = block.insts.remove(site.index);
        let term = std::mem::replace(&mut block.term, Terminator::Unreachable);
        let (term_offset, term_frame) = (block.term_offset, block.term_frame);
        let j = func.block_mut(join);
        j.insts = tail;
        j.term = term;
        j.term_offset = term_offset;
        j.term_frame = term_frame;
        call
    }

    #[allow(clippy::too_many_arguments)]
    fn commit_monomorphic(
        &mut self,
        func: &mut IrFunc,
        site: &CallSite,
        out: &Outgoing,
        target: FuncId,
        mut dispatch: Vec<Inst>,
        arm: BlockId,
        join: BlockId,
    ) {
        let call = Self::split_at_call(func, site, join);
        func.release_inst(call);

        let mut info = BailoutInfo::new(site.offset, BailoutKind::Eager, BailoutReason::CallTargetMismatch, site.frame);
        info.pending_call = Some(PendingCall {
            call_offset: site.offset,
            argc: site.args.len() as u16,
            materialized: out.temps.clone(),
        });
        let mut guard = Inst::new(
            InstKind::CheckCallTarget {
                callee: site.callee,
                func: target,
            },
            site.offset,
            site.frame,
        )
        .with_bc_uses(site.bc_uses.clone());
        guard.bailout = Some(func.arena.alloc(info));
        dispatch.push(guard);

        let block = func.block_mut(site.block);
        block.insts.extend(dispatch);
        block.term = Terminator::Jump(arm);
        block.term_offset = site.offset;
        block.term_frame = site.frame;
    }

    fn commit_polymorphic(
        &mut self,
        func: &mut IrFunc,
        site: &CallSite,
        targets: &[FuncId],
        dispatch: Vec<Inst>,
        arms: &[BlockId],
        join: BlockId,
    ) {
        let call = Self::split_at_call(func, site, join);

        let fallback = func.add_block();
        self.fallbacks.insert(fallback);
        let fb = func.block_mut(fallback);
        fb.insts.push(call);
        fb.term = Terminator::Jump(join);
        fb.term_offset = site.offset;
        fb.term_frame = site.frame;

        // test blocks, the first one being the call's own block
        let mut tests = vec![site.block];
        for _ in 1..targets.len() {
            tests.push(func.add_block());
        }
        func.block_mut(site.block).insts.extend(dispatch);
        for (j, (&target, &arm)) in targets.iter().zip(arms).enumerate() {
            let cond = func.new_sym(site.frame, None);
            let else_block = tests.get(j + 1).copied().unwrap_or(fallback);
            let test = func.block_mut(tests[j]);
            test.insts.push(Inst::new(
                InstKind::IsFunction {
                    dst: cond,
                    value: site.callee,
                    func: target,
                },
                site.offset,
                site.frame,
            ));
            test.term = Terminator::Branch {
                cond,
                then_block: arm,
                else_block,
            };
            test.term_offset = site.offset;
            test.term_frame = site.frame;
        }
    }
}

/// Constant assigned to `sym` earlier in the call's block, if still current
fn constant_def(func: &IrFunc, site: &CallSite, sym: SymId) -> Option<Value> {
    func.block(site.block).insts[..site.index]
        .iter()
        .rev()
        .find(|i| i.kind.dst() == Some(sym))
        .and_then(|i| match i.kind {
            InstKind::Const { value, .. } => Some(value),
            _ => None,
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::BytecodeBuilder;
    use crate::bytecode::{BinaryOp, Op, Program};
    use crate::config::JitConfig;
    use crate::ir::EntryKind;
    use crate::pipeline::lifter::lift_function;
    use crate::profiling::{ProgramProfile, Tier};
    use crate::runtime::stats::OverrideSnapshot;

    /// f0(x) = f1(x, 2); f1(a, b) = a + b
    fn program() -> Program {
        let mut m = BytecodeBuilder::new("main", 1, 5);
        m.emit(Op::LoadFunction { dst: 1, func: FuncId(1) });
        m.emit(Op::Move { dst: 3, src: 0 });
        m.emit(Op::LoadInt { dst: 4, value: 2 });
        m.emit(Op::Call { dst: 2, callee: 1, this: 1, first_arg: 3, argc: 2 });
        m.emit(Op::Return { src: 2 });
        let mut a = BytecodeBuilder::new("add", 2, 3);
        a.emit(Op::Binary { op: BinaryOp::Add, dst: 2, lhs: 0, rhs: 1 });
        a.emit(Op::Return { src: 2 });
        Program::new(vec![m.finish(FuncId(0)).unwrap(), a.finish(FuncId(1)).unwrap()], vec![]).unwrap()
    }

    fn profiled(targets: &[FuncId]) -> ProgramProfile {
        let profiles = ProgramProfile::new(2);
        profiles.functions[0].with_data(|d| {
            for t in targets {
                d.record_call_target(3, Some(*t));
            }
        });
        profiles
    }

    #[test]
    fn test_monomorphic_inline_adds_frame_and_guard() {
        let program = program();
        let profiles = profiled(&[FuncId(1)]);
        let config = JitConfig::default();
        let overrides = OverrideSnapshot::default();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        let mut ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();
        let stats = Inliner::new(&mut ctx).run(&mut ir);
        assert_eq!(stats.inlined, 1);
        assert_eq!(ir.frames.len(), 2);

        let frame = ir.frames.get(FrameIdx(1));
        assert_eq!(frame.depth, 1);
        let record = frame.inlinee.as_ref().unwrap();
        assert_eq!(record.call_offset, 3);
        assert_eq!(record.result_reg, 2);
        assert_eq!(record.args[1], ArgProvenance::Constant(Value::int(2)));
        assert!(matches!(record.args[0], ArgProvenance::Sym(_)));

        let kinds: Vec<&InstKind> = ir.live_blocks().flat_map(|b| b.insts.iter()).map(|i| &i.kind).collect();
        assert!(kinds.iter().any(|k| matches!(k, InstKind::CheckCallTarget { func, .. } if *func == FuncId(1))));
        assert!(!kinds.iter().any(|k| k.is_call()));
    }

    #[test]
    fn test_overridden_site_is_left_alone() {
        let program = program();
        let profiles = profiled(&[FuncId(1)]);
        let config = JitConfig::default();
        let overrides_src = crate::runtime::stats::SpeculationOverrides::new();
        overrides_src.add(crate::runtime::stats::SiteKey::new(FuncId(0), 3), Relax::NoInline);
        let overrides = overrides_src.snapshot();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        let mut ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();
        let stats = Inliner::new(&mut ctx).run(&mut ir);
        assert_eq!(stats.inlined, 0);
        assert_eq!(stats.rejected, 1);
        assert_eq!(ir.frames.len(), 1);
    }

    #[test]
    fn test_ir_limit_rolls_back() {
        let program = program();
        let profiles = profiled(&[FuncId(1)]);
        let mut config = JitConfig::default();
        config.limits.max_ir_size = 12;
        let overrides = OverrideSnapshot::default();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        let mut ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();
        let (syms, blocks, live) = (ir.syms.len(), ir.blocks.len(), ir.arena.live_count());
        let stats = Inliner::new(&mut ctx).run(&mut ir);
        assert_eq!(stats.rolled_back, 1);
        assert_eq!(ir.syms.len(), syms);
        assert_eq!(ir.blocks.len(), blocks);
        assert_eq!(ir.frames.len(), 1);
        assert_eq!(ir.arena.live_count(), live);
        assert!(ir.live_blocks().flat_map(|b| b.insts.iter()).any(|i| i.kind.is_call()));
    }

    #[test]
    fn test_decider_rejects_arguments_users() {
        let mut m = BytecodeBuilder::new("main", 0, 2);
        m.emit(Op::LoadFunction { dst: 0, func: FuncId(1) });
        m.emit(Op::Call { dst: 1, callee: 0, this: 0, first_arg: 0, argc: 0 });
        m.emit(Op::Return { src: 1 });
        let mut v = BytecodeBuilder::new("variadic", 0, 1);
        v.emit(Op::ArgCount { dst: 0 });
        v.emit(Op::Return { src: 0 });
        let program = Program::new(vec![m.finish(FuncId(0)).unwrap(), v.finish(FuncId(1)).unwrap()], vec![]).unwrap();
        let profiles = ProgramProfile::new(2);
        profiles.functions[0].with_data(|d| d.record_call_target(1, Some(FuncId(1))));
        let config = JitConfig::default();
        let overrides = OverrideSnapshot::default();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        let ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();
        assert_eq!(
            decide(&mut ctx, &ir, FrameIdx::ROOT, 1, 0, 0),
            InlineDecision::Reject(RejectReason::UsesArguments)
        );
    }

    /// f0(f, x) = f(x, 2); f1(a, b) = a + b; f2(a, b) = a - b
    fn two_target_program() -> Program {
        let mut m = BytecodeBuilder::new("main", 2, 5);
        m.emit(Op::Move { dst: 3, src: 1 });
        m.emit(Op::LoadInt { dst: 4, value: 2 });
        m.emit(Op::Call { dst: 2, callee: 0, this: 0, first_arg: 3, argc: 2 });
        m.emit(Op::Return { src: 2 });
        let body = |name: &str, op: BinaryOp| {
            let mut b = BytecodeBuilder::new(name, 2, 3);
            b.emit(Op::Binary { op, dst: 2, lhs: 0, rhs: 1 });
            b.emit(Op::Return { src: 2 });
            b
        };
        Program::new(
            vec![
                m.finish(FuncId(0)).unwrap(),
                body("add", BinaryOp::Add).finish(FuncId(1)).unwrap(),
                body("sub", BinaryOp::Sub).finish(FuncId(2)).unwrap(),
            ],
            vec![],
        )
        .unwrap()
    }

    fn two_target_profile() -> ProgramProfile {
        let profiles = ProgramProfile::new(3);
        profiles.functions[0].with_data(|d| {
            for t in [FuncId(1), FuncId(2), FuncId(1), FuncId(2)] {
                d.record_call_target(2, Some(t));
            }
        });
        profiles
    }

    #[test]
    fn test_polymorphic_site_gets_one_dispatch_chain() {
        let program = two_target_program();
        let profiles = two_target_profile();
        let config = JitConfig::default();
        let overrides = OverrideSnapshot::default();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        let mut ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();
        let stats = Inliner::new(&mut ctx).run(&mut ir);

        assert_eq!(stats.polymorphic, 1);
        assert_eq!(stats.inlined, 2);
        assert_eq!(ir.frames.len(), 3, "one frame per target plus the root");
        let kinds: Vec<&InstKind> = ir.live_blocks().flat_map(|b| b.insts.iter()).map(|i| &i.kind).collect();
        let tests: Vec<FuncId> = kinds
            .iter()
            .filter_map(|k| match k {
                InstKind::IsFunction { func, .. } => Some(*func),
                _ => None,
            })
            .collect();
        assert_eq!(tests, vec![FuncId(1), FuncId(2)]);
        assert_eq!(kinds.iter().filter(|k| k.is_call()).count(), 1, "generic fallback");
        assert!(!kinds.iter().any(|k| matches!(k, InstKind::CheckCallTarget { .. })));
    }

    #[test]
    fn test_polymorphic_targets_are_capped() {
        let program = two_target_program();
        let profiles = two_target_profile();
        let mut config = JitConfig::default();
        config.inlining.max_polymorphic_targets = 1;
        let overrides = OverrideSnapshot::default();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        let mut ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();
        let stats = Inliner::new(&mut ctx).run(&mut ir);
        assert_eq!(stats.polymorphic, 1);
        assert_eq!(stats.inlined, 1);
        assert_eq!(ir.frames.len(), 2);
    }

    /// f0(x) = new Point(x).x; f1 Point(v) { this.x = v }
    fn ctor_program() -> Program {
        let mut m = BytecodeBuilder::new("make", 1, 5);
        m.emit(Op::LoadFunction { dst: 1, func: FuncId(1) });
        m.emit(Op::Move { dst: 2, src: 0 });
        m.emit(Op::New { dst: 3, callee: 1, first_arg: 2, argc: 1 });
        m.emit(Op::GetProp { dst: 4, obj: 3, name: crate::bytecode::NameId(0) });
        m.emit(Op::Return { src: 4 });
        let mut p = BytecodeBuilder::new("Point", 1, 3);
        p.emit(Op::LoadThis { dst: 1 });
        p.emit(Op::SetProp { obj: 1, name: crate::bytecode::NameId(0), value: 0 });
        p.emit(Op::LoadUndefined { dst: 2 });
        p.emit(Op::Return { src: 2 });
        Program::new(
            vec![m.finish(FuncId(0)).unwrap(), p.finish(FuncId(1)).unwrap()],
            vec!["x".to_string()],
        )
        .unwrap()
    }

    #[test]
    fn test_construct_site_allocates_and_selects_result() {
        let program = ctor_program();
        let profiles = ProgramProfile::new(2);
        profiles.functions[0].with_data(|d| d.record_call_target(2, Some(FuncId(1))));
        let config = JitConfig::default();
        let overrides = OverrideSnapshot::default();
        let mut ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        let mut ir = lift_function(&mut ctx, FuncId(0), EntryKind::Function).unwrap();
        let stats = Inliner::new(&mut ctx).run(&mut ir);
        assert_eq!(stats.inlined, 1);
        assert_eq!(ir.frames.len(), 2);

        let record = ir.frames.get(FrameIdx(1)).inlinee.clone().unwrap();
        assert!(record.construct);
        let ArgProvenance::Sym(this) = record.this else {
            panic!("constructed receiver has no symbol: {:?}", record.this);
        };

        let kinds: Vec<&InstKind> = ir.live_blocks().flat_map(|b| b.insts.iter()).map(|i| &i.kind).collect();
        assert!(kinds.iter().any(|k| matches!(k, InstKind::AllocForCtor { dst } if *dst == this)));
        assert!(kinds
            .iter()
            .any(|k| matches!(k, InstKind::CtorResult { this: t, .. } if *t == this)));
        // LoadThis inside the body reads the allocated receiver
        assert!(kinds.iter().any(|k| matches!(k, InstKind::Move { src, .. } if *src == this)));
        assert!(!kinds.iter().any(|k| k.is_call()));
    }
}

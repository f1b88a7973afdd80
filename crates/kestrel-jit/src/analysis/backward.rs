//! Backward liveness and bailout-need analysis
//!
//! One backward pass decides, for every instruction of an optimized body,
//! what the interpreter would need if compiled code were abandoned there.
//! Two sets flow backward together: `ir` holds symbols later instructions
//! read, `bc` holds symbols a bailout could hand to the interpreter (register
//! values read by the remaining bytecode, handler-live registers, inlinee
//! argument provenance). Captures are the `bc` set at the bailout point.
//!
//! The pass also removes dead stores, drops overflow and negative-zero
//! checks nobody depends on, and places post-state bailouts after
//! instructions that may run script code while a cached property access
//! further down still relies on an earlier shape guard.
//!
//! The collection phase iterates block transfer functions to a fixpoint
//! without touching the IR; the final walk applies the same decisions.
//! Running the pass twice changes nothing the second time.

use thiserror::Error;

use crate::bailout::{BailoutError, BailoutHandle, BailoutInfo, BailoutKind, BailoutReason};
use crate::bytecode::BinaryOp;
use crate::interp::value::Value;
use crate::ir::{BlockId, Inst, InstKind, IrFunc, SymId, Terminator};
use crate::pipeline::context::CompileContext;

use super::bitset::BitSet;

#[derive(Debug, Error, Clone, PartialEq)]
pub enum AnalysisError {
    #[error(transparent)]
    Bailout(#[from] BailoutError),
}

/// What one run changed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AnalysisStats {
    pub folded_branches: usize,
    pub pruned_blocks: usize,
    pub removed: usize,
    pub checks_dropped: usize,
    pub escalated: usize,
    pub escalations_dropped: usize,
    pub captures_changed: usize,
    pub shared: usize,
}

impl AnalysisStats {
    pub fn is_unchanged(&self) -> bool {
        *self == AnalysisStats::default()
    }
}

#[derive(Debug, Clone, Default)]
struct LiveState {
    ir: BitSet,
    bc: BitSet,
    /// Symbols with a consumer that relies on an int32 result
    overflow: BitSet,
    /// Symbols with a consumer that can tell -0 from 0
    negzero: BitSet,
    /// Objects whose cached accesses below still rely on a shape guard above
    pending: BitSet,
}

impl PartialEq for LiveState {
    fn eq(&self, other: &LiveState) -> bool {
        self.ir.same_as(&other.ir)
            && self.bc.same_as(&other.bc)
            && self.overflow.same_as(&other.overflow)
            && self.negzero.same_as(&other.negzero)
            && self.pending.same_as(&other.pending)
    }
}

impl LiveState {
    fn merge(&mut self, other: &LiveState) {
        self.ir.union_with(&other.ir);
        self.bc.union_with(&other.bc);
        self.overflow.union_with(&other.overflow);
        self.negzero.union_with(&other.negzero);
        self.pending.union_with(&other.pending);
    }

    fn kill(&mut self, s: SymId) {
        let i = s.0 as usize;
        self.ir.remove(i);
        self.bc.remove(i);
        self.overflow.remove(i);
        self.negzero.remove(i);
        self.pending.remove(i);
    }

    /// A read by ordinary code that observes the exact value
    fn read(&mut self, s: SymId) {
        let i = s.0 as usize;
        self.ir.insert(i);
        self.bc.insert(i);
        self.overflow.insert(i);
        self.negzero.insert(i);
    }
}

/// Per-instruction outcome, shared by both phases
#[derive(Debug, Default)]
struct Decision {
    dead: bool,
    post: Option<Vec<SymId>>,
    pre: Option<Vec<SymId>>,
    throw: Option<Vec<SymId>>,
    keep_overflow: bool,
    keep_negzero: bool,
}

fn sorted(mut syms: Vec<SymId>) -> Vec<SymId> {
    syms.sort_unstable();
    syms.dedup();
    syms
}

fn members(set: &BitSet) -> Vec<SymId> {
    set.iter().map(|i| SymId(i as u32)).collect()
}

/// Whether an operand of `kind` is only observed through ToInt32
fn truncates(kind: &InstKind) -> bool {
    matches!(
        kind,
        InstKind::Binary { op: BinaryOp::BitOr, .. } | InstKind::IntBinary { op: BinaryOp::BitOr, .. }
    )
}

/// Whether `kind` cannot tell -0 from 0 in its operands
fn ignores_sign_of_zero(kind: &InstKind) -> bool {
    match kind {
        InstKind::Binary { op, .. } | InstKind::IntBinary { op, .. } => {
            op.is_compare() || *op == BinaryOp::BitOr
        }
        _ => false,
    }
}

pub struct BackwardPass<'c, 'a> {
    ctx: &'c mut CompileContext<'a>,
    stats: AnalysisStats,
}

impl<'c, 'a> BackwardPass<'c, 'a> {
    pub fn new(ctx: &'c mut CompileContext<'a>) -> Self {
        BackwardPass {
            ctx,
            stats: AnalysisStats::default(),
        }
    }

    pub fn run(mut self, func: &mut IrFunc) -> Result<AnalysisStats, AnalysisError> {
        self.fold_branches(func);
        self.prune_unreachable(func);

        let order = func.reverse_postorder();
        let mut live_in: Vec<LiveState> = vec![LiveState::default(); func.blocks.len()];
        loop {
            let mut changed = false;
            for &block in order.iter().rev() {
                let exit = exit_state(func, block, &live_in);
                let entry = self.collect_block(func, block, exit);
                if entry != live_in[block.0 as usize] {
                    live_in[block.0 as usize] = entry;
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        for &block in &order {
            let exit = exit_state(func, block, &live_in);
            self.finalize_block(func, block, exit)?;
            if self.ctx.config.phases.bailout_sharing {
                self.share_block(func, block);
            }
        }

        tracing::trace!(func = %func.func, stats = ?self.stats, "backward pass\n{}", func);
        Ok(self.stats)
    }

    /// Branches on a constant assigned in the same block become jumps
    fn fold_branches(&mut self, func: &mut IrFunc) {
        for idx in 0..func.blocks.len() {
            let block = &func.blocks[idx];
            if block.dead {
                continue;
            }
            let Terminator::Branch {
                cond,
                then_block,
                else_block,
            } = block.term
            else {
                continue;
            };
            let value: Option<Value> = block
                .insts
                .iter()
                .rev()
                .find(|i| i.kind.dst() == Some(cond))
                .and_then(|i| match i.kind {
                    InstKind::Const { value, .. } => Some(value),
                    _ => None,
                });
            if let Some(value) = value {
                let target = if value.to_boolean() { then_block } else { else_block };
                func.blocks[idx].term = Terminator::Jump(target);
                self.stats.folded_branches += 1;
            }
        }
    }

    fn prune_unreachable(&mut self, func: &mut IrFunc) {
        let mut reachable = vec![false; func.blocks.len()];
        for b in func.reverse_postorder() {
            reachable[b.0 as usize] = true;
        }
        for (idx, live) in reachable.into_iter().enumerate() {
            if !live && !func.blocks[idx].dead {
                func.kill_block(BlockId(idx as u32));
                self.stats.pruned_blocks += 1;
            }
        }
    }

    fn terminator(func: &IrFunc, block: BlockId, st: &mut LiveState) {
        if let Some(s) = func.block(block).term.uses() {
            st.read(s);
        }
    }

    fn collect_block(&mut self, func: &IrFunc, block: BlockId, exit: LiveState) -> LiveState {
        let mut st = exit;
        Self::terminator(func, block, &mut st);
        for inst in func.block(block).insts.iter().rev() {
            self.step(func, inst, &mut st);
        }
        st
    }

    fn finalize_block(&mut self, func: &mut IrFunc, block: BlockId, exit: LiveState) -> Result<(), AnalysisError> {
        let mut st = exit;
        Self::terminator(func, block, &mut st);
        let insts = std::mem::take(&mut func.block_mut(block).insts);
        let mut kept = Vec::with_capacity(insts.len());
        for inst in insts.into_iter().rev() {
            let decision = self.step(func, &inst, &mut st);
            if let Some(inst) = self.apply(func, inst, decision)? {
                kept.push(inst);
            }
        }
        kept.reverse();
        func.block_mut(block).insts = kept;
        Ok(())
    }

    /// Backward transfer of one instruction
    fn step(&mut self, func: &IrFunc, inst: &Inst, st: &mut LiveState) -> Decision {
        let mut d = Decision::default();
        let phases = &self.ctx.config.phases;
        let mut provenance = Vec::new();
        func.frames.provenance_syms(inst.frame, &mut provenance);

        // post-state: the interpreter continues after this instruction
        if inst.kind.may_call_implicitly() && !st.pending.is_empty() {
            let mut cap = members(&st.bc);
            cap.extend(provenance.iter().copied());
            for s in &provenance {
                st.bc.insert(s.0 as usize);
            }
            d.post = Some(sorted(cap));
        }

        if let Some(dst) = inst.kind.dst() {
            let i = dst.0 as usize;
            if phases.dead_store_elimination
                && !st.ir.contains(i)
                && !st.bc.contains(i)
                && !inst.kind.has_side_effects()
            {
                d.dead = true;
                for s in &inst.bc_uses {
                    st.bc.insert(s.0 as usize);
                }
                return d;
            }
        }

        if let InstKind::IntBinary {
            dst,
            check_overflow,
            check_negzero,
            ..
        } = inst.kind
        {
            d.keep_overflow = check_overflow && st.overflow.contains(dst.0 as usize);
            d.keep_negzero = check_negzero && st.negzero.contains(dst.0 as usize);
        }

        if let Some(dst) = inst.kind.dst() {
            st.kill(dst);
        }

        let mut uses = Vec::new();
        inst.kind.uses(&mut uses);
        let exact = !truncates(&inst.kind);
        let signed = !ignores_sign_of_zero(&inst.kind);
        for u in uses {
            let i = u.0 as usize;
            st.ir.insert(i);
            if exact {
                st.overflow.insert(i);
            }
            if signed {
                st.negzero.insert(i);
            }
        }
        for s in &inst.bc_uses {
            st.bc.insert(s.0 as usize);
        }

        // pre-state: the interpreter re-runs this instruction's op
        let pre_slot = !inst.kind.may_call_implicitly();
        if let (true, Some(h)) = (pre_slot, &inst.bailout) {
            let info = func.arena.get(h);
            let mut extra = provenance.clone();
            if let Some(call) = &info.pending_call {
                extra.extend(call.materialized.iter().copied());
            }
            for s in &extra {
                st.bc.insert(s.0 as usize);
            }
            d.pre = Some(sorted(members(&st.bc)));
        }
        if inst.on_throw.is_some() {
            let mut cap = provenance.clone();
            self.ctx
                .liveness
                .handler_syms(&func.frames, inst.frame, inst.offset, &mut cap);
            for s in &cap {
                st.bc.insert(s.0 as usize);
            }
            d.throw = Some(sorted(cap));
        }

        match inst.kind {
            InstKind::LoadProp { obj, slot: Some(_), .. } | InstKind::StoreProp { obj, slot: Some(_), .. } => {
                st.pending.insert(obj.0 as usize);
            }
            InstKind::CheckShape { obj, .. } => {
                st.pending.remove(obj.0 as usize);
            }
            _ => {}
        }
        d
    }

    fn set_captured(func: &mut IrFunc, handle: &mut BailoutHandle, captured: Vec<SymId>) -> Result<bool, BailoutError> {
        func.arena.update(handle, |info| info.captured = captured)
    }

    /// Apply a decision to the instruction; `None` when it goes away
    fn apply(&mut self, func: &mut IrFunc, mut inst: Inst, d: Decision) -> Result<Option<Inst>, AnalysisError> {
        if d.dead {
            self.stats.removed += 1;
            let bc_uses = std::mem::take(&mut inst.bc_uses);
            let (offset, frame) = (inst.offset, inst.frame);
            func.release_inst(inst);
            if bc_uses.is_empty() {
                return Ok(None);
            }
            return Ok(Some(Inst::new(InstKind::BytecodeUses, offset, frame).with_bc_uses(bc_uses)));
        }

        if inst.kind.may_call_implicitly() {
            match (d.post, inst.bailout.take()) {
                (Some(cap), Some(mut h)) => {
                    if Self::set_captured(func, &mut h, cap)? {
                        self.stats.captures_changed += 1;
                    }
                    inst.bailout = Some(h);
                }
                (Some(cap), None) => {
                    let (kind, reason) = if inst.kind.is_call() && self.ctx.config.phases.lazy_bailouts {
                        (BailoutKind::Lazy, BailoutReason::LazyInvalidation)
                    } else {
                        (BailoutKind::OnImplicitCall, BailoutReason::ImplicitCall)
                    };
                    let mut info = BailoutInfo::new(inst.offset, kind, reason, inst.frame);
                    info.captured = cap;
                    inst.bailout = Some(func.arena.alloc(info));
                    self.stats.escalated += 1;
                }
                (None, Some(h)) => {
                    func.arena.release(h);
                    self.stats.escalations_dropped += 1;
                }
                (None, None) => {}
            }
        }

        if let InstKind::IntBinary {
            ref mut check_overflow,
            ref mut check_negzero,
            ..
        } = inst.kind
        {
            if *check_overflow != d.keep_overflow || *check_negzero != d.keep_negzero {
                *check_overflow = d.keep_overflow;
                *check_negzero = d.keep_negzero;
                self.stats.checks_dropped += 1;
                if !d.keep_overflow && !d.keep_negzero {
                    if let Some(h) = inst.bailout.take() {
                        func.arena.release(h);
                    }
                }
            }
        }

        if let (Some(cap), Some(mut h)) = (d.pre, inst.bailout.take()) {
            if Self::set_captured(func, &mut h, cap)? {
                self.stats.captures_changed += 1;
            }
            inst.bailout = Some(h);
        }
        if let (Some(cap), Some(mut h)) = (d.throw, inst.on_throw.take()) {
            if Self::set_captured(func, &mut h, cap)? {
                self.stats.captures_changed += 1;
            }
            inst.on_throw = Some(h);
        }
        Ok(Some(inst))
    }

    /// Point descriptors with identical recovery at one shared descriptor
    fn share_block(&mut self, func: &mut IrFunc, block: BlockId) {
        let mut insts = std::mem::take(&mut func.block_mut(block).insts);
        // (instruction, on_throw slot)
        let mut reps: Vec<(usize, bool)> = Vec::new();
        for j in 0..insts.len() {
            for slot in [false, true] {
                let taken = if slot { insts[j].on_throw.take() } else { insts[j].bailout.take() };
                let Some(h) = taken else {
                    continue;
                };
                let mut replacement = None;
                for &(i, rep_slot) in &reps {
                    let rep = if rep_slot { &insts[i].on_throw } else { &insts[i].bailout };
                    let Some(rep) = rep else {
                        continue;
                    };
                    if rep.index() != h.index() && func.arena.get(rep).same_recovery(func.arena.get(&h)) {
                        replacement = Some(func.arena.share(rep));
                        break;
                    }
                }
                let h = match replacement {
                    Some(shared) => {
                        func.arena.release(h);
                        self.stats.shared += 1;
                        shared
                    }
                    None => {
                        reps.push((j, slot));
                        h
                    }
                };
                if slot {
                    insts[j].on_throw = Some(h);
                } else {
                    insts[j].bailout = Some(h);
                }
            }
        }
        func.block_mut(block).insts = insts;
    }
}

fn exit_state(func: &IrFunc, block: BlockId, live_in: &[LiveState]) -> LiveState {
    let mut st = LiveState::default();
    for succ in func.successors(block) {
        if !func.block(succ).dead {
            st.merge(&live_in[succ.0 as usize]);
        }
    }
    st
}

//! Optimization passes on JIT IR
//!
//! Each pass implements the `OptPass` trait and transforms an `IrFunc` in place.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::BinaryOp;
use crate::interp::heap::ShapeId;
use crate::ir::{BlockId, Inst, InstKind, IrFunc, SymId};
use crate::runtime::stats::Relax;

use super::context::CompileContext;

/// An optimization pass on JIT IR
pub trait OptPass: Send + Sync {
    /// Name of this pass (for diagnostics)
    fn name(&self) -> &str;
    /// Run the pass, returning how many instructions it changed
    fn run(&self, ctx: &CompileContext<'_>, func: &mut IrFunc) -> usize;
}

/// Optimizer that runs a sequence of passes
pub struct JitOptimizer {
    passes: Vec<Box<dyn OptPass>>,
}

impl JitOptimizer {
    /// Create an optimizer with the default pass pipeline
    pub fn new() -> Self {
        JitOptimizer {
            passes: vec![Box::new(ConstantFolding), Box::new(GuardMerging)],
        }
    }

    /// Create an empty optimizer (no passes)
    pub fn empty() -> Self {
        JitOptimizer { passes: vec![] }
    }

    /// Add a pass to the pipeline
    pub fn add_pass(&mut self, pass: Box<dyn OptPass>) {
        self.passes.push(pass);
    }

    /// Run all passes in order
    pub fn optimize(&self, ctx: &CompileContext<'_>, func: &mut IrFunc) {
        for pass in &self.passes {
            let changed = pass.run(ctx, func);
            tracing::trace!(pass = pass.name(), changed, "optimization pass");
        }
    }
}

impl Default for JitOptimizer {
    fn default() -> Self {
        Self::new()
    }
}

// ===== Pass 1: Constant Folding =====

/// Folds int arithmetic and compares whose operands are constants in the
/// same block.
///
/// Only results that stay int32 are folded, so the speculative form and the
/// folded form agree. A folded instruction becomes a `Const` and gives its
/// bailout descriptor back.
pub struct ConstantFolding;

impl OptPass for ConstantFolding {
    fn name(&self) -> &str {
        "constant-folding"
    }

    fn run(&self, _ctx: &CompileContext<'_>, func: &mut IrFunc) -> usize {
        let mut folded = 0;
        for idx in 0..func.blocks.len() {
            if func.blocks[idx].dead {
                continue;
            }
            let mut consts: FxHashMap<SymId, i32> = FxHashMap::default();
            let mut released = Vec::new();
            for inst in func.blocks[idx].insts.iter_mut() {
                if let InstKind::IntBinary { op, dst, lhs, rhs, .. } = inst.kind {
                    if let (Some(&a), Some(&b)) = (consts.get(&lhs), consts.get(&rhs)) {
                        if let Some(value) = fold_int(op, a, b) {
                            inst.kind = InstKind::Const { dst, value };
                            released.extend(inst.bailout.take());
                            folded += 1;
                        }
                    }
                }
                if let Some(dst) = inst.kind.dst() {
                    match inst.kind {
                        InstKind::Const { value, .. } => match value.as_int() {
                            Some(v) => consts.insert(dst, v),
                            None => consts.remove(&dst),
                        },
                        _ => consts.remove(&dst),
                    };
                }
            }
            for h in released {
                func.arena.release(h);
            }
        }
        folded
    }
}

fn fold_int(op: BinaryOp, a: i32, b: i32) -> Option<crate::interp::value::Value> {
    use crate::interp::value::Value;
    let v = match op {
        BinaryOp::Add => Value::int(a.checked_add(b)?),
        BinaryOp::Sub => Value::int(a.checked_sub(b)?),
        BinaryOp::Mul => {
            let r = a.checked_mul(b)?;
            if r == 0 && (a < 0 || b < 0) {
                return None;
            }
            Value::int(r)
        }
        BinaryOp::BitOr => Value::int(a | b),
        BinaryOp::Lt => Value::bool(a < b),
        BinaryOp::Le => Value::bool(a <= b),
        BinaryOp::StrictEq => Value::bool(a == b),
        BinaryOp::Div => return None,
    };
    Some(v)
}

// ===== Pass 2: Guard Merging =====

/// Removes guards already established on every path to them.
///
/// A shape guard covers later cached accesses to the same object until
/// something may change the object's layout: a redefinition of the symbol, a
/// delete, a generic store, or script code run by a call or an implicit
/// call. Calls and implicit calls keep coverage when their post-state
/// bailouts are enabled and the site has not been relaxed; the backward pass
/// then protects them. Int guards survive everything but redefinition.
pub struct GuardMerging;

#[derive(Debug, Clone, Default, PartialEq)]
struct Facts {
    shapes: FxHashMap<SymId, ShapeId>,
    ints: FxHashSet<SymId>,
}

impl Facts {
    fn intersect(&mut self, other: &Facts) {
        self.shapes.retain(|s, shape| other.shapes.get(s) == Some(shape));
        self.ints.retain(|s| other.ints.contains(s));
    }
}

impl GuardMerging {
    fn keeps_coverage(ctx: &CompileContext<'_>, func: &IrFunc, inst: &Inst) -> bool {
        let phases = &ctx.config.phases;
        let enabled = match inst.kind {
            InstKind::Call { .. } => phases.lazy_bailouts,
            _ => phases.implicit_call_bailouts,
        };
        let caller = func.frames.get(inst.frame).func;
        enabled && ctx.allows(caller, inst.offset, Relax::KillCoverage)
    }

    /// Apply one instruction; returns true when it is a redundant guard
    fn transfer(ctx: &CompileContext<'_>, func: &IrFunc, inst: &Inst, facts: &mut Facts) -> bool {
        match inst.kind {
            InstKind::CheckShape { obj, shape } => {
                if facts.shapes.get(&obj) == Some(&shape) {
                    return true;
                }
                facts.shapes.insert(obj, shape);
                return false;
            }
            InstKind::CheckInt { value } => {
                return !facts.ints.insert(value);
            }
            InstKind::DeleteProp { .. } | InstKind::StoreProp { slot: None, .. } => facts.shapes.clear(),
            _ if inst.kind.may_call_implicitly() && !Self::keeps_coverage(ctx, func, inst) => {
                facts.shapes.clear()
            }
            _ => {}
        }
        if let Some(dst) = inst.kind.dst() {
            facts.shapes.remove(&dst);
            facts.ints.remove(&dst);
            let is_int = match inst.kind {
                InstKind::Const { value, .. } => value.is_int(),
                InstKind::IntBinary {
                    op, check_overflow, ..
                } => op == BinaryOp::BitOr || (check_overflow && !op.is_compare()),
                InstKind::Move { src, .. } => facts.ints.contains(&src),
                _ => false,
            };
            if is_int {
                facts.ints.insert(dst);
            }
        }
        false
    }
}

impl OptPass for GuardMerging {
    fn name(&self) -> &str {
        "guard-merging"
    }

    fn run(&self, ctx: &CompileContext<'_>, func: &mut IrFunc) -> usize {
        if !ctx.config.phases.guard_merging {
            return 0;
        }
        let order = func.reverse_postorder();
        let preds = func.predecessors();
        // None means "not reached yet", the top of the lattice
        let mut out: Vec<Option<Facts>> = vec![None; func.blocks.len()];

        let entry_facts = |out: &[Option<Facts>], block: BlockId| -> Facts {
            let mut facts: Option<Facts> = None;
            for p in &preds[block.0 as usize] {
                if let Some(pf) = &out[p.0 as usize] {
                    match &mut facts {
                        None => facts = Some(pf.clone()),
                        Some(f) => f.intersect(pf),
                    }
                }
            }
            facts.unwrap_or_default()
        };

        loop {
            let mut changed = false;
            for &block in &order {
                let mut facts = if block == func.entry_block {
                    Facts::default()
                } else {
                    entry_facts(&out, block)
                };
                for inst in &func.block(block).insts {
                    Self::transfer(ctx, func, inst, &mut facts);
                }
                if out[block.0 as usize].as_ref() != Some(&facts) {
                    out[block.0 as usize] = Some(facts);
                    changed = true;
                }
            }
            if !changed {
                break;
            }
        }

        let mut merged = 0;
        for &block in &order {
            let mut facts = if block == func.entry_block {
                Facts::default()
            } else {
                entry_facts(&out, block)
            };
            let insts = std::mem::take(&mut func.block_mut(block).insts);
            let mut kept = Vec::with_capacity(insts.len());
            for inst in insts {
                if Self::transfer(ctx, func, &inst, &mut facts) {
                    merged += 1;
                    func.release_inst(inst);
                } else {
                    kept.push(inst);
                }
            }
            func.block_mut(block).insts = kept;
        }
        merged
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bailout::{BailoutInfo, BailoutKind, BailoutReason};
    use crate::bytecode::builder::BytecodeBuilder;
    use crate::bytecode::{FuncId, NameId, Op, Program};
    use crate::config::JitConfig;
    use crate::interp::value::Value;
    use crate::ir::{EntryKind, FrameIdx, Terminator};
    use crate::profiling::{ProgramProfile, Tier};
    use crate::runtime::stats::OverrideSnapshot;

    fn program() -> Program {
        let mut b = BytecodeBuilder::new("f", 1, 4);
        b.emit(Op::Return { src: 0 });
        Program::new(vec![b.finish(FuncId(0)).unwrap()], vec!["x".into()]).unwrap()
    }

    fn guard(func: &mut IrFunc, kind: InstKind, offset: u32) -> Inst {
        let mut inst = Inst::new(kind, offset, FrameIdx::ROOT);
        inst.bailout = Some(func.arena.alloc(BailoutInfo::new(
            offset,
            BailoutKind::Eager,
            BailoutReason::ShapeMismatch,
            FrameIdx::ROOT,
        )));
        inst
    }

    fn shape_check(obj: u32) -> InstKind {
        InstKind::CheckShape {
            obj: SymId(obj),
            shape: ShapeId(3),
        }
    }

    fn load(dst: u32, obj: u32) -> InstKind {
        InstKind::LoadProp {
            dst: SymId(dst),
            obj: SymId(obj),
            name: NameId(0),
            slot: Some(0),
        }
    }

    fn call() -> InstKind {
        InstKind::Call {
            dst: SymId(2),
            callee: SymId(3),
            this: None,
            args: vec![],
            construct: false,
        }
    }

    fn run_merging(config: &JitConfig, func: &mut IrFunc) -> usize {
        let program = program();
        let profiles = ProgramProfile::new(1);
        let overrides = OverrideSnapshot::default();
        let ctx = CompileContext::new(&program, &profiles, config, &overrides, Tier::Full);
        GuardMerging.run(&ctx, func)
    }

    fn straight_line(config: &JitConfig, middle: InstKind) -> (usize, IrFunc) {
        let mut f = IrFunc::new(FuncId(0), "f", EntryKind::Function, 4);
        let b = f.add_block();
        f.entry_block = b;
        let g1 = guard(&mut f, shape_check(0), 0);
        let g2 = guard(&mut f, shape_check(0), 2);
        let insts = vec![
            g1,
            Inst::new(load(1, 0), 0, FrameIdx::ROOT),
            Inst::new(middle, 1, FrameIdx::ROOT),
            g2,
            Inst::new(load(1, 0), 2, FrameIdx::ROOT),
        ];
        f.block_mut(b).insts = insts;
        f.block_mut(b).term = Terminator::Return(SymId(1));
        let merged = run_merging(config, &mut f);
        (merged, f)
    }

    #[test]
    fn test_repeated_shape_guard_is_merged_across_call() {
        let (merged, f) = straight_line(&JitConfig::default(), call());
        assert_eq!(merged, 1);
        assert_eq!(f.arena.live_count(), 1);
    }

    #[test]
    fn test_call_kills_coverage_without_lazy_bailouts() {
        let mut config = JitConfig::default();
        config.phases.lazy_bailouts = false;
        let (merged, _) = straight_line(&config, call());
        assert_eq!(merged, 0);
    }

    #[test]
    fn test_delete_kills_coverage() {
        let delete = InstKind::DeleteProp {
            obj: SymId(3),
            name: NameId(0),
        };
        let (merged, _) = straight_line(&JitConfig::default(), delete);
        assert_eq!(merged, 0);
    }

    #[test]
    fn test_constant_int_arithmetic_folds() {
        let mut f = IrFunc::new(FuncId(0), "f", EntryKind::Function, 4);
        let b = f.add_block();
        f.entry_block = b;
        let mut add = guard(
            &mut f,
            InstKind::IntBinary {
                op: BinaryOp::Add,
                dst: SymId(2),
                lhs: SymId(0),
                rhs: SymId(1),
                check_overflow: true,
                check_negzero: false,
            },
            2,
        );
        add.bc_uses = vec![SymId(0), SymId(1)];
        f.block_mut(b).insts = vec![
            Inst::new(InstKind::Const { dst: SymId(0), value: Value::int(40) }, 0, FrameIdx::ROOT),
            Inst::new(InstKind::Const { dst: SymId(1), value: Value::int(2) }, 1, FrameIdx::ROOT),
            add,
        ];
        f.block_mut(b).term = Terminator::Return(SymId(2));
        let program = program();
        let profiles = ProgramProfile::new(1);
        let overrides = OverrideSnapshot::default();
        let config = JitConfig::default();
        let ctx = CompileContext::new(&program, &profiles, &config, &overrides, Tier::Full);
        assert_eq!(ConstantFolding.run(&ctx, &mut f), 1);
        assert_eq!(
            f.block(b).insts[2].kind,
            InstKind::Const {
                dst: SymId(2),
                value: Value::int(42)
            }
        );
        assert_eq!(f.arena.live_count(), 0);
    }
}

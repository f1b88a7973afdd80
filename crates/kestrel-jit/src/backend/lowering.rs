//! IR to machine code
//!
//! Gives every symbol one home for the whole body: symbols defined once by
//! a constant are embedded, symbols captured by a lazy bailout live on the
//! stack (the call may clobber registers), everything else takes registers
//! first. Each distinct bailout descriptor becomes one frozen record, one
//! exit stub, and one id in the global bailout table.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::bailout::{
    BailoutHandle, BailoutKind, BailoutRecord, FrameTable, GlobalBailoutTable, NativeLocation, TableBuilder,
};
use crate::bytecode::FuncId;
use crate::interp::value::Value;
use crate::ir::{BlockId, EntryKind, FrameIdx, Inst, InstKind, IrFunc, SymId, Terminator};

use super::traits::{CodegenError, Loc, MInst, Operand, PostCheck, Target, Watch};

/// Output of the emitter for one entry point
#[derive(Debug)]
pub struct CompiledBody {
    pub func: FuncId,
    pub entry: EntryKind,
    pub code: Vec<u8>,
    /// Stack slots of the optimized frame
    pub frame_size: usize,
    /// Indexed by bailout id
    pub records: Vec<Arc<BailoutRecord>>,
    pub table: GlobalBailoutTable,
    pub frames: FrameTable,
    pub inst_count: usize,
}

/// Generate code for `func`, freezing its bailout descriptors
pub fn emit<T: Target + ?Sized>(target: &T, func: &mut IrFunc) -> Result<CompiledBody, CodegenError> {
    let layout = func.reverse_postorder();
    let constants = single_constants(func, &layout);
    let homes = assign_homes(target, func, &layout, &constants)?;
    let (ids, records) = freeze_records(func, &layout);
    let table = build_table(&records, &homes, &constants)?;

    let mut emitter = Emitter {
        func,
        homes: &homes,
        constants: &constants,
        ids: &ids,
        labels: layout.iter().enumerate().map(|(i, b)| (*b, i as u32)).collect(),
        stub_base: layout.len() as u32,
        out: Vec::new(),
        starts: Vec::with_capacity(layout.len() + records.len()),
    };
    for (i, &block) in layout.iter().enumerate() {
        emitter.starts.push(emitter.out.len() as u32);
        let next = layout.get(i + 1).copied();
        emitter.block(target, block, next)?;
    }
    for record in &records {
        emitter.starts.push(emitter.out.len() as u32);
        emitter.out.push(MInst::Exit { record: record.id });
    }

    let starts = emitter.starts;
    let mut insts = emitter.out;
    let mut bad_label = None;
    for inst in &mut insts {
        inst.map_targets(|label| match starts.get(label as usize) {
            Some(pos) => *pos,
            None => {
                bad_label = Some(label);
                0
            }
        });
    }
    if let Some(label) = bad_label {
        return Err(CodegenError::Malformed(format!("unbound label {}", label)));
    }

    let mut code = Vec::new();
    for inst in &insts {
        target.encode(inst, &mut code)?;
    }
    tracing::trace!(
        func = %func.func,
        insts = insts.len(),
        bytes = code.len(),
        bailouts = records.len(),
        "emitted"
    );

    Ok(CompiledBody {
        func: func.func,
        entry: func.entry,
        code,
        frame_size: homes.frame_size,
        records,
        table,
        frames: func.frames.clone(),
        inst_count: insts.len(),
    })
}

/// Symbols whose only definition in live code is a constant
fn single_constants(func: &IrFunc, layout: &[BlockId]) -> FxHashMap<SymId, Value> {
    let mut defs: FxHashMap<SymId, (u32, Option<Value>)> = FxHashMap::default();
    for inst in layout.iter().flat_map(|b| func.block(*b).insts.iter()) {
        if let Some(dst) = inst.kind.dst() {
            let entry = defs.entry(dst).or_insert((0, None));
            entry.0 += 1;
            entry.1 = match inst.kind {
                InstKind::Const { value, .. } => Some(value),
                _ => None,
            };
        }
    }
    defs.into_iter()
        .filter_map(|(sym, (count, value))| if count == 1 { value.map(|v| (sym, v)) } else { None })
        .collect()
}

struct Homes {
    locs: FxHashMap<SymId, Loc>,
    frame_size: usize,
}

impl Homes {
    fn get(&self, sym: SymId) -> Option<Loc> {
        self.locs.get(&sym).copied()
    }
}

fn assign_homes<T: Target + ?Sized>(
    target: &T,
    func: &IrFunc,
    layout: &[BlockId],
    constants: &FxHashMap<SymId, Value>,
) -> Result<Homes, CodegenError> {
    let mut spilled = Vec::new();
    let mut order = Vec::new();
    let mut uses = Vec::new();
    for block in layout.iter().map(|b| func.block(*b)) {
        for inst in &block.insts {
            order.extend(inst.kind.dst());
            uses.clear();
            inst.kind.uses(&mut uses);
            order.extend(uses.iter().copied());
            for handle in inst.bailout.iter().chain(inst.on_throw.iter()) {
                let info = func.arena.get(handle);
                order.extend(info.captured.iter().copied());
                if info.kind == BailoutKind::Lazy {
                    spilled.extend(info.captured.iter().copied());
                }
            }
        }
        order.extend(block.term.uses());
    }

    let mut regs = target.calling_convention().allocatable.into_iter();
    let mut homes = Homes {
        locs: FxHashMap::default(),
        frame_size: 0,
    };
    // slots are u16; wrapping would alias captured values
    let stack_slot = |homes: &mut Homes| -> Result<Loc, CodegenError> {
        let slot = u16::try_from(homes.frame_size).map_err(|_| CodegenError::FrameTooLarge(homes.frame_size + 1))?;
        homes.frame_size += 1;
        Ok(Loc::Stack(slot))
    };
    for sym in spilled {
        if !constants.contains_key(&sym) && !homes.locs.contains_key(&sym) {
            let loc = stack_slot(&mut homes)?;
            homes.locs.insert(sym, loc);
        }
    }
    for sym in order {
        if constants.contains_key(&sym) || homes.locs.contains_key(&sym) {
            continue;
        }
        let loc = match regs.next() {
            Some(r) => Loc::Reg(r),
            None => stack_slot(&mut homes)?,
        };
        homes.locs.insert(sym, loc);
    }
    Ok(homes)
}

/// Number descriptors by first appearance and freeze them
fn freeze_records(func: &mut IrFunc, layout: &[BlockId]) -> (FxHashMap<u32, u32>, Vec<Arc<BailoutRecord>>) {
    let IrFunc {
        func: root,
        blocks,
        arena,
        ..
    } = func;
    let mut ids = FxHashMap::default();
    let mut records = Vec::new();
    for block in layout {
        for inst in &blocks[block.0 as usize].insts {
            for handle in inst.bailout.iter().chain(inst.on_throw.iter()) {
                if !ids.contains_key(&handle.index()) {
                    let id = records.len() as u32;
                    ids.insert(handle.index(), id);
                    records.push(Arc::new(BailoutRecord::freeze(id, *root, arena.get(handle))));
                }
                arena.freeze(handle);
            }
        }
    }
    (ids, records)
}

fn build_table(
    records: &[Arc<BailoutRecord>],
    homes: &Homes,
    constants: &FxHashMap<SymId, Value>,
) -> Result<GlobalBailoutTable, CodegenError> {
    let mut table = TableBuilder::new();
    for record in records {
        for &sym in &record.captured {
            let location = match (constants.get(&sym), homes.get(sym)) {
                (Some(v), _) => NativeLocation::Const(*v),
                (None, Some(Loc::Reg(r))) => NativeLocation::RegSave(r),
                (None, Some(Loc::Stack(s))) => NativeLocation::Stack(s),
                (None, None) => {
                    return Err(CodegenError::Malformed(format!("{} captured without a home", sym)));
                }
            };
            table.record(sym, record.id, location)?;
        }
    }
    Ok(table.build())
}

struct Emitter<'f> {
    func: &'f IrFunc,
    homes: &'f Homes,
    constants: &'f FxHashMap<SymId, Value>,
    /// Arena index to bailout id
    ids: &'f FxHashMap<u32, u32>,
    labels: FxHashMap<BlockId, u32>,
    stub_base: u32,
    out: Vec<MInst>,
    /// Instruction index of every label
    starts: Vec<u32>,
}

impl<'f> Emitter<'f> {
    fn home(&self, sym: SymId) -> Result<Loc, CodegenError> {
        self.homes
            .get(sym)
            .ok_or_else(|| CodegenError::Malformed(format!("{} has no home", sym)))
    }

    fn operand(&self, sym: SymId) -> Result<Operand, CodegenError> {
        match self.homes.get(sym) {
            Some(loc) => Ok(Operand::Loc(loc)),
            None => self.constant(sym).map(Operand::Imm),
        }
    }

    fn constant(&self, sym: SymId) -> Result<Value, CodegenError> {
        self.constants
            .get(&sym)
            .copied()
            .ok_or_else(|| CodegenError::Malformed(format!("{} is neither homed nor constant", sym)))
    }

    fn label(&self, block: BlockId) -> Result<u32, CodegenError> {
        self.labels
            .get(&block)
            .copied()
            .ok_or_else(|| CodegenError::Malformed(format!("jump to unlaid {}", block)))
    }

    fn stub(&self, handle: &BailoutHandle) -> Result<u32, CodegenError> {
        self.ids
            .get(&handle.index())
            .map(|id| self.stub_base + id)
            .ok_or_else(|| CodegenError::MissingBailout(format!("descriptor {}", handle.index())))
    }

    fn exit(&self, inst: &Inst) -> Result<u32, CodegenError> {
        match &inst.bailout {
            Some(h) => self.stub(h),
            None => Err(CodegenError::MissingBailout(format!("{:?}", inst.kind))),
        }
    }

    fn on_throw(&self, inst: &Inst) -> Result<Option<u32>, CodegenError> {
        inst.on_throw.as_ref().map(|h| self.stub(h)).transpose()
    }

    /// Post-op exit for ops that may run script code
    fn post(&self, inst: &Inst, watch: Watch) -> Result<Option<PostCheck>, CodegenError> {
        let Some(h) = &inst.bailout else {
            return Ok(None);
        };
        if !self.func.arena.get(h).kind.is_post_state() {
            return Ok(None);
        }
        Ok(Some(PostCheck {
            exit: self.stub(h)?,
            watch,
        }))
    }

    fn push<T: Target + ?Sized>(&mut self, target: &T, inst: MInst) {
        self.out.extend(target.legalize(inst));
    }

    fn block<T: Target + ?Sized>(&mut self, target: &T, id: BlockId, next: Option<BlockId>) -> Result<(), CodegenError> {
        let func = self.func;
        let block = func.block(id);
        let before = self.out.len();
        for inst in &block.insts {
            if let Some(m) = self.lower(inst)? {
                self.push(target, m);
            }
        }
        let ended = self.out.len() > before && self.out.last().is_some_and(|m| m.is_terminator());
        let term = match &block.term {
            Terminator::Jump(b) if Some(*b) == next => return Ok(()),
            Terminator::Jump(b) => MInst::Jump { target: self.label(*b)? },
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => MInst::Branch {
                cond: self.operand(*cond)?,
                then_target: self.label(*then_block)?,
                else_target: self.label(*else_block)?,
            },
            Terminator::Return(s) => MInst::Return {
                value: self.operand(*s)?,
            },
            Terminator::Unreachable if ended => return Ok(()),
            Terminator::Unreachable => MInst::Trap,
            Terminator::None => return Err(CodegenError::Malformed(format!("{} is unterminated", id))),
        };
        self.push(target, term);
        Ok(())
    }

    fn lower(&self, inst: &Inst) -> Result<Option<MInst>, CodegenError> {
        let m = match &inst.kind {
            InstKind::Const { dst, value } => match self.homes.get(*dst) {
                Some(loc) => MInst::Mov {
                    dst: loc,
                    src: Operand::Imm(*value),
                },
                None => return Ok(None),
            },
            InstKind::Move { dst, src } | InstKind::ArgOut { dst, src } => MInst::Mov {
                dst: self.home(*dst)?,
                src: self.operand(*src)?,
            },
            InstKind::LoadParam { dst, index } => MInst::LoadParam {
                dst: self.home(*dst)?,
                index: *index,
            },
            InstKind::LoadIncoming { dst, reg } => MInst::LoadIncoming {
                dst: self.home(*dst)?,
                reg: *reg,
            },
            InstKind::LoadThis { dst } => MInst::LoadThis { dst: self.home(*dst)? },
            InstKind::ArgCount { dst } => MInst::ArgCount { dst: self.home(*dst)? },
            InstKind::LoadArg { dst, index } => MInst::LoadArg {
                dst: self.home(*dst)?,
                index: self.operand(*index)?,
            },
            InstKind::Binary { op, dst, lhs, rhs } => MInst::Binary {
                op: *op,
                dst: self.home(*dst)?,
                lhs: self.operand(*lhs)?,
                rhs: self.operand(*rhs)?,
                on_throw: self.on_throw(inst)?,
                post: self.post(inst, Watch::ImplicitCalls)?,
            },
            InstKind::IntBinary {
                op,
                dst,
                lhs,
                rhs,
                check_overflow,
                check_negzero,
            } => {
                let exit = if *check_overflow || *check_negzero {
                    Some(self.exit(inst)?)
                } else {
                    None
                };
                MInst::IntBinary {
                    op: *op,
                    dst: self.home(*dst)?,
                    lhs: self.operand(*lhs)?,
                    rhs: self.operand(*rhs)?,
                    overflow: exit.filter(|_| *check_overflow),
                    negzero: exit.filter(|_| *check_negzero),
                }
            }
            InstKind::Not { dst, src } => MInst::Not {
                dst: self.home(*dst)?,
                src: self.operand(*src)?,
            },
            InstKind::CheckInt { value } => MInst::CheckInt {
                value: self.operand(*value)?,
                exit: self.exit(inst)?,
            },
            InstKind::CheckShape { obj, shape } => MInst::CheckShape {
                obj: self.operand(*obj)?,
                shape: shape.0,
                exit: self.exit(inst)?,
            },
            InstKind::CheckCallTarget { callee, func } => MInst::CheckCallTarget {
                callee: self.operand(*callee)?,
                func: func.0,
                exit: self.exit(inst)?,
            },
            InstKind::Bail => MInst::Jump {
                target: self.exit(inst)?,
            },
            InstKind::IsFunction { dst, value, func } => MInst::IsFunction {
                dst: self.home(*dst)?,
                value: self.operand(*value)?,
                func: func.0,
            },
            InstKind::LoadProp { dst, obj, name, slot } => match slot {
                Some(slot) => MInst::LoadSlot {
                    dst: self.home(*dst)?,
                    obj: self.operand(*obj)?,
                    slot: *slot,
                },
                None => MInst::LoadProp {
                    dst: self.home(*dst)?,
                    obj: self.operand(*obj)?,
                    name: name.0,
                    on_throw: self.on_throw(inst)?,
                },
            },
            InstKind::StoreProp { obj, name, value, slot } => match slot {
                Some(slot) => MInst::StoreSlot {
                    obj: self.operand(*obj)?,
                    slot: *slot,
                    value: self.operand(*value)?,
                },
                None => MInst::StoreProp {
                    obj: self.operand(*obj)?,
                    name: name.0,
                    value: self.operand(*value)?,
                    on_throw: self.on_throw(inst)?,
                },
            },
            InstKind::DeleteProp { obj, name } => MInst::DeleteProp {
                obj: self.operand(*obj)?,
                name: name.0,
                on_throw: self.on_throw(inst)?,
            },
            InstKind::NewObject { dst } | InstKind::AllocForCtor { dst } => MInst::NewObject { dst: self.home(*dst)? },
            InstKind::Call {
                dst,
                callee,
                this,
                args,
                construct,
            } => MInst::Call {
                dst: self.home(*dst)?,
                callee: self.operand(*callee)?,
                this: match (construct, this) {
                    (true, _) => None,
                    (false, Some(t)) => Some(self.operand(*t)?),
                    (false, None) => Some(Operand::Imm(Value::UNDEFINED)),
                },
                args: args.iter().map(|a| self.operand(*a)).collect::<Result<_, _>>()?,
                on_throw: self.on_throw(inst)?,
                post: self.post(inst, Watch::ShapeEpoch)?,
                site: (inst.frame == FrameIdx::ROOT).then_some(inst.offset),
            },
            InstKind::CtorResult { dst, value, this } => MInst::CtorResult {
                dst: self.home(*dst)?,
                value: self.operand(*value)?,
                this: self.operand(*this)?,
            },
            InstKind::Throw { value } => MInst::Throw {
                value: self.operand(*value)?,
                on_throw: self.on_throw(inst)?,
            },
            InstKind::InlineeStart { .. } | InstKind::InlineeEnd { .. } | InstKind::BytecodeUses => return Ok(None),
        };
        Ok(Some(m))
    }
}

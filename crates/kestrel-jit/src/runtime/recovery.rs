//! Rebuilding interpreter frames after a bailout
//!
//! Every symbol the record captured is looked up in the entry's global
//! bailout table and read from wherever the exit stub left it. One
//! interpreter frame is produced per logical frame of the chain, innermost
//! first: the innermost resumes at the record's offset, each outer frame
//! waits for the result of the call that inlined its child.

use thiserror::Error;

use crate::backend::BailoutExit;
use crate::bailout::{ArgProvenance, BailoutKind, BailoutRecord, NativeLocation};
use crate::bytecode::{FuncId, Program};
use crate::interp::value::Value;
use crate::interp::{InterpreterFrame, RestoredState, Resume};
use crate::ir::{FrameIdx, SymId};

use super::entry::EntryPoint;

/// Bailout state that cannot be rebuilt. Always a compiler bug.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RecoveryError {
    #[error("no bailout record {0}")]
    UnknownRecord(u32),
    #[error("{sym} has no location for bailout {id}")]
    MissingLocation { sym: SymId, id: u32 },
    #[error("frame {frame} needs {sym}, which bailout {id} did not capture")]
    MissingProvenance { frame: FrameIdx, sym: SymId, id: u32 },
    #[error("unknown function {0}")]
    UnknownFunction(FuncId),
    #[error("exception bailout {0} carries no exception")]
    MissingException(u32),
    #[error("bailout rebuilt no frames")]
    NoFrames,
}

/// Values of the captured symbols of one exit
struct Captured<'a> {
    entry: &'a EntryPoint,
    record: &'a BailoutRecord,
    exit: &'a BailoutExit,
}

impl Captured<'_> {
    fn value(&self, sym: SymId) -> Result<Value, RecoveryError> {
        let id = self.record.id;
        let missing = RecoveryError::MissingLocation { sym, id };
        let value = match self.entry.table.lookup(sym, id).ok_or(missing.clone())? {
            NativeLocation::RegSave(r) => self.exit.regs.get(r as usize).copied(),
            NativeLocation::Stack(s) => self.exit.stack.get(s as usize).copied(),
            NativeLocation::Const(v) => Some(v),
        };
        value.ok_or(missing)
    }

    fn contains(&self, sym: SymId) -> bool {
        self.record.captured.binary_search(&sym).is_ok()
    }
}

/// Rebuild the interpreter state for `exit` from an activation of `entry`
/// that was called with `this` and `args`.
pub fn restore(
    program: &Program,
    entry: &EntryPoint,
    exit: &BailoutExit,
    this: Value,
    args: &[Value],
) -> Result<RestoredState, RecoveryError> {
    let record = entry
        .record(exit.record)
        .ok_or(RecoveryError::UnknownRecord(exit.record))?;
    let captured = Captured { entry, record, exit };
    let frames = &entry.frames;

    // Outermost first so provenance can refer to the parent's arguments
    let mut chain = frames.chain(record.frame);
    chain.reverse();
    let mut rebuilt: Vec<InterpreterFrame> = Vec::with_capacity(chain.len());
    for (depth, &idx) in chain.iter().enumerate() {
        let frame = frames.get(idx);
        let body = program
            .function(frame.func)
            .ok_or(RecoveryError::UnknownFunction(frame.func))?;

        let (frame_this, frame_args, construct) = match (&frame.inlinee, rebuilt.last()) {
            (Some(inlinee), Some(parent)) => {
                let resolve = |prov: &ArgProvenance| -> Result<Value, RecoveryError> {
                    match *prov {
                        ArgProvenance::Constant(v) => Ok(v),
                        ArgProvenance::PassThrough(i) => Ok(parent.args.get(i as usize).copied().unwrap_or(Value::UNDEFINED)),
                        ArgProvenance::Sym(sym) if captured.contains(sym) => captured.value(sym),
                        ArgProvenance::Sym(sym) => Err(RecoveryError::MissingProvenance {
                            frame: idx,
                            sym,
                            id: record.id,
                        }),
                    }
                };
                let this = resolve(&inlinee.this)?;
                let args = inlinee.args.iter().map(resolve).collect::<Result<Vec<_>, _>>()?;
                (this, args, inlinee.construct)
            }
            _ => (this, args.to_vec(), false),
        };

        let mut regs = vec![Value::UNDEFINED; body.register_count as usize];
        for (reg, sym) in frame.reg_syms.iter().enumerate() {
            if captured.contains(*sym) {
                if let Some(slot) = regs.get_mut(reg) {
                    *slot = captured.value(*sym)?;
                }
            }
        }

        // The child of this frame, if any, is the next one in the chain
        let (pc, awaiting) = match chain.get(depth + 1).and_then(|c| frames.get(*c).inlinee.as_ref()) {
            Some(child) => (child.call_offset, Some(child.result_reg)),
            None => (record.resume_offset(), None),
        };
        rebuilt.push(InterpreterFrame {
            func: frame.func,
            pc,
            regs,
            this: frame_this,
            args: frame_args,
            construct,
            awaiting,
        });
    }
    rebuilt.reverse();

    let action = match record.kind {
        BailoutKind::Exception => Resume::Throw(exit.exception.ok_or(RecoveryError::MissingException(record.id))?),
        _ => Resume::Start,
    };
    tracing::trace!(
        func = %record.func,
        offset = record.resume_offset(),
        frames = rebuilt.len(),
        kind = ?record.kind,
        "frames rebuilt"
    );
    Ok(RestoredState {
        frames: rebuilt,
        action,
    })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::backend::{emit, CodeAllocator, HeapCodeAllocator, PortableTarget};
    use crate::bailout::{BailoutInfo, BailoutReason, InlineeFrameRecord};
    use crate::bytecode::builder::BytecodeBuilder;
    use crate::bytecode::Op;
    use crate::ir::{EntryKind, Inst, InstKind, IrFunc, Terminator};
    use crate::profiling::Tier;

    /// outer(a): r1 = inner(a); return r1     inner(x): return x
    fn program() -> Program {
        let mut o = BytecodeBuilder::new("outer", 1, 3);
        o.emit(Op::LoadFunction { dst: 2, func: FuncId(1) });
        o.emit(Op::Call { dst: 1, callee: 2, this: 2, first_arg: 0, argc: 1 });
        o.emit(Op::Return { src: 1 });
        let mut i = BytecodeBuilder::new("inner", 1, 2);
        i.emit(Op::LoadInt { dst: 1, value: 3 });
        i.emit(Op::Return { src: 0 });
        Program::new(vec![o.finish(FuncId(0)).unwrap(), i.finish(FuncId(1)).unwrap()], vec![]).unwrap()
    }

    /// Compiled outer with inner inlined; a bailout inside inner captures
    /// inner's r1 and outer's r2.
    fn inlined_entry(capture_arg: bool) -> EntryPoint {
        let mut f = IrFunc::new(FuncId(0), "outer", EntryKind::Function, 3);
        let arg_tmp = f.new_sym(FrameIdx::ROOT, None);
        let inner_r0 = f.new_sym(FrameIdx(1), Some(0));
        let inner_r1 = f.new_sym(FrameIdx(1), Some(1));
        f.frames.push(
            FuncId(1),
            vec![inner_r0, inner_r1],
            InlineeFrameRecord {
                parent: FrameIdx::ROOT,
                call_offset: 1,
                result_reg: 1,
                construct: false,
                this: ArgProvenance::Constant(Value::function(FuncId(1))),
                args: vec![ArgProvenance::Sym(arg_tmp)],
            },
        );
        let b = f.add_block();
        let at = |kind, frame| Inst::new(kind, 0, frame);
        f.block_mut(b).insts.push(at(InstKind::LoadParam { dst: SymId(0), index: 0 }, FrameIdx::ROOT));
        f.block_mut(b).insts.push(at(
            InstKind::Const {
                dst: SymId(2),
                value: Value::function(FuncId(1)),
            },
            FrameIdx::ROOT,
        ));
        f.block_mut(b).insts.push(at(InstKind::ArgOut { dst: arg_tmp, src: SymId(0) }, FrameIdx::ROOT));
        f.block_mut(b).insts.push(at(InstKind::Move { dst: inner_r0, src: arg_tmp }, FrameIdx(1)));
        f.block_mut(b).insts.push(at(
            InstKind::Const {
                dst: inner_r1,
                value: Value::int(3),
            },
            FrameIdx(1),
        ));
        let mut info = BailoutInfo::new(1, BailoutKind::Eager, BailoutReason::NotAnInt, FrameIdx(1));
        info.captured = if capture_arg {
            vec![SymId(2), arg_tmp, inner_r0, inner_r1]
        } else {
            vec![SymId(2), inner_r0, inner_r1]
        };
        info.captured.sort();
        let mut check = at(InstKind::CheckInt { value: inner_r0 }, FrameIdx(1));
        check.bailout = Some(f.arena.alloc(info));
        f.block_mut(b).insts.push(check);
        f.block_mut(b).term = Terminator::Return(inner_r0);

        let target = PortableTarget::new();
        let body = emit(&target, &mut f).unwrap();
        let region = HeapCodeAllocator::default().allocate(&body.code).unwrap();
        EntryPoint::new(&target, body, Tier::Full, region).unwrap()
    }

    fn run_to_exit(entry: &EntryPoint, arg: Value) -> BailoutExit {
        use crate::backend::{execute, Activation, MachineExit, MachineHost};
        use crate::error::ExecError;
        use crate::interp::heap::Heap;
        use crate::interp::{Host, LoopTransfer};
        use crate::profiling::ProgramProfile;

        struct H(Arc<Program>, Arc<ProgramProfile>, Heap);
        impl Host for H {
            fn program(&self) -> Arc<Program> {
                self.0.clone()
            }
            fn profile(&self) -> Arc<ProgramProfile> {
                self.1.clone()
            }
            fn heap(&mut self) -> &mut Heap {
                &mut self.2
            }
            fn call(&mut self, _: Value, _: Value, _: &[Value]) -> Result<Value, ExecError> {
                unreachable!()
            }
            fn implicit_call(&mut self) {}
            fn loop_back_edge(&mut self, _: &mut InterpreterFrame) -> Result<LoopTransfer, ExecError> {
                Ok(LoopTransfer::Stay)
            }
        }
        impl MachineHost for H {
            fn implicit_calls(&self) -> u64 {
                0
            }
        }
        let mut host = H(Arc::new(program()), Arc::new(ProgramProfile::new(2)), Heap::new());
        let args = [arg];
        let act = Activation {
            this: Value::UNDEFINED,
            args: &args,
            incoming: &[],
            profile: None,
        };
        match execute(&mut host, &entry.code, entry.frame_size, act).unwrap() {
            MachineExit::Bailout(exit) => exit,
            other => panic!("expected a bailout, got {:?}", other),
        }
    }

    #[test]
    fn test_restore_rebuilds_inlined_chain() {
        let entry = inlined_entry(true);
        let exit = run_to_exit(&entry, Value::float(1.5));
        let state = restore(&program(), &entry, &exit, Value::UNDEFINED, &[Value::float(1.5)]).unwrap();
        assert_eq!(state.action, Resume::Start);
        assert_eq!(state.frames.len(), 2);

        let inner = &state.frames[0];
        assert_eq!(inner.func, FuncId(1));
        assert_eq!(inner.pc, 1);
        assert_eq!(inner.regs, vec![Value::float(1.5), Value::int(3)]);
        assert_eq!(inner.args, vec![Value::float(1.5)]);
        assert_eq!(inner.this, Value::function(FuncId(1)));

        let outer = &state.frames[1];
        assert_eq!(outer.func, FuncId(0));
        assert_eq!(outer.pc, 1);
        assert_eq!(outer.awaiting, Some(1));
        assert_eq!(outer.regs[2], Value::function(FuncId(1)));
        assert_eq!(outer.regs[1], Value::UNDEFINED);
    }

    #[test]
    fn test_uncaptured_provenance_is_fatal() {
        let entry = inlined_entry(false);
        let exit = run_to_exit(&entry, Value::float(1.5));
        let err = restore(&program(), &entry, &exit, Value::UNDEFINED, &[Value::float(1.5)]).unwrap_err();
        assert!(matches!(err, RecoveryError::MissingProvenance { frame: FrameIdx(1), .. }));
    }

    #[test]
    fn test_unknown_record() {
        let entry = inlined_entry(true);
        let mut exit = run_to_exit(&entry, Value::float(1.5));
        exit.record = 42;
        assert_eq!(
            restore(&program(), &entry, &exit, Value::UNDEFINED, &[]),
            Err(RecoveryError::UnknownRecord(42))
        );
    }
}

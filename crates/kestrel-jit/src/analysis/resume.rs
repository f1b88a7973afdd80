//! Registers the interpreter reads after a bailout
//!
//! A bailout resumes the innermost frame at some offset and every outer
//! frame right after its pending call. Byte-code liveness at those points
//! says which register symbols must be captured.

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::bailout::FrameTable;
use crate::bytecode::{liveness, FuncId, Offset, Program};
use crate::ir::{FrameIdx, SymId};

use super::bitset::BitSet;

/// Per-function byte-code liveness, computed on first use
pub struct ResumeLiveness<'a> {
    program: &'a Program,
    cache: FxHashMap<FuncId, Arc<Vec<BitSet>>>,
}

impl<'a> ResumeLiveness<'a> {
    pub fn new(program: &'a Program) -> Self {
        ResumeLiveness {
            program,
            cache: FxHashMap::default(),
        }
    }

    fn live_in(&mut self, func: FuncId) -> Arc<Vec<BitSet>> {
        let program = self.program;
        self.cache
            .entry(func)
            .or_insert_with(|| {
                Arc::new(
                    program
                        .function(func)
                        .map(liveness::live_in)
                        .unwrap_or_default(),
                )
            })
            .clone()
    }

    fn add_live(&mut self, frames: &FrameTable, frame: FrameIdx, offset: Offset, skip: Option<u16>, out: &mut Vec<SymId>) {
        let record = frames.get(frame);
        let live = self.live_in(record.func);
        if let Some(set) = live.get(offset as usize) {
            for reg in set.iter() {
                if Some(reg as u16) == skip {
                    continue;
                }
                if let Some(sym) = record.reg_syms.get(reg) {
                    out.push(*sym);
                }
            }
        }
    }

    /// Outer frames continue after the call that created `frame`, or in
    /// the handler covering that call when the callee throws
    fn add_continuations(&mut self, frames: &FrameTable, frame: FrameIdx, out: &mut Vec<SymId>) {
        let mut cur = frame;
        while let Some(inlinee) = frames.get(cur).inlinee.clone() {
            self.add_live(frames, inlinee.parent, inlinee.call_offset + 1, Some(inlinee.result_reg), out);
            let handler = self
                .program
                .function(frames.get(inlinee.parent).func)
                .and_then(|body| body.handler_for(inlinee.call_offset));
            if let Some(handler) = handler {
                self.add_live(frames, inlinee.parent, handler, None, out);
            }
            cur = inlinee.parent;
        }
    }

    /// Symbols read when `frame` resumes at `offset`
    pub fn resume_syms(&mut self, frames: &FrameTable, frame: FrameIdx, offset: Offset, out: &mut Vec<SymId>) {
        self.add_live(frames, frame, offset, None, out);
        self.add_continuations(frames, frame, out);
    }

    /// Symbols read when the op at `offset` in `frame` throws
    pub fn handler_syms(&mut self, frames: &FrameTable, frame: FrameIdx, offset: Offset, out: &mut Vec<SymId>) {
        let mut cur = frame;
        let mut at = offset;
        loop {
            let record = frames.get(cur);
            let handler = self
                .program
                .function(record.func)
                .and_then(|body| body.handler_for(at));
            if let Some(handler) = handler {
                self.add_live(frames, cur, handler, None, out);
                self.add_continuations(frames, cur, out);
                return;
            }
            match &record.inlinee {
                Some(inlinee) => {
                    at = inlinee.call_offset;
                    cur = inlinee.parent;
                }
                None => return,
            }
        }
    }

    /// Whether a throw at `offset` in `frame` is caught anywhere in the chain
    pub fn is_caught(&self, frames: &FrameTable, frame: FrameIdx, offset: Offset) -> bool {
        let mut cur = frame;
        let mut at = offset;
        loop {
            let record = frames.get(cur);
            let caught = self
                .program
                .function(record.func)
                .is_some_and(|body| body.handler_for(at).is_some());
            if caught {
                return true;
            }
            match &record.inlinee {
                Some(inlinee) => {
                    at = inlinee.call_offset;
                    cur = inlinee.parent;
                }
                None => return false,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bailout::{ArgProvenance, InlineeFrameRecord};
    use crate::bytecode::builder::BytecodeBuilder;
    use crate::bytecode::{BinaryOp, Op};
    use crate::interp::value::Value;

    /// f0(a): r4 = 100; try { r2 = f1(a) } catch (r5) { return r5 + r4 } return r2
    /// f1(a): throw a
    fn program(with_try: bool) -> Program {
        let mut m = BytecodeBuilder::new("entry", 1, 6);
        let handler = m.label();
        m.emit(Op::LoadInt { dst: 4, value: 100 });
        m.emit(Op::LoadFunction { dst: 1, func: FuncId(1) });
        m.emit(Op::Move { dst: 3, src: 0 });
        if with_try {
            m.enter_try(handler);
        } else {
            m.emit(Op::LoadUndefined { dst: 5 });
        }
        m.emit(Op::Call { dst: 2, callee: 1, this: 1, first_arg: 3, argc: 1 });
        if with_try {
            m.emit(Op::LeaveTry);
        } else {
            m.emit(Op::LoadUndefined { dst: 5 });
        }
        m.emit(Op::Return { src: 2 });
        m.bind(handler);
        m.emit(Op::Catch { dst: 5 });
        m.emit(Op::Binary { op: BinaryOp::Add, dst: 5, lhs: 5, rhs: 4 });
        m.emit(Op::Return { src: 5 });
        let mut t = BytecodeBuilder::new("thrower", 1, 1);
        t.emit(Op::Throw { src: 0 });
        Program::new(vec![m.finish(FuncId(0)).unwrap(), t.finish(FuncId(1)).unwrap()], vec![]).unwrap()
    }

    fn frames() -> (FrameTable, FrameIdx) {
        let mut frames = FrameTable::new(FuncId(0), (0..6).map(SymId).collect());
        let record = InlineeFrameRecord {
            parent: FrameIdx::ROOT,
            call_offset: 4,
            result_reg: 2,
            construct: false,
            this: ArgProvenance::Constant(Value::UNDEFINED),
            args: vec![ArgProvenance::PassThrough(0)],
        };
        let child = frames.push(FuncId(1), vec![SymId(6)], record);
        (frames, child)
    }

    #[test]
    fn test_inlinee_resume_keeps_caller_handler_registers() {
        let program = program(true);
        let (frames, child) = frames();
        let mut liveness = ResumeLiveness::new(&program);
        let mut out = Vec::new();
        liveness.resume_syms(&frames, child, 0, &mut out);
        assert!(out.contains(&SymId(6)));
        assert!(out.contains(&SymId(4)), "handler reads r4: {:?}", out);
        assert!(!out.contains(&SymId(2)));
    }

    #[test]
    fn test_uncovered_call_only_keeps_continuation() {
        let program = program(false);
        let (frames, child) = frames();
        let mut liveness = ResumeLiveness::new(&program);
        let mut out = Vec::new();
        liveness.resume_syms(&frames, child, 0, &mut out);
        assert_eq!(out, vec![SymId(6)]);
    }
}

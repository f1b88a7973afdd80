//! Logical frames of an optimized body
//!
//! Frame 0 is the compiled function itself. Every inlined call adds a frame
//! whose record says where the call happened in its parent and how the
//! callee's `this` and arguments can be recomputed when it is rebuilt.

use crate::bytecode::{FuncId, Offset};
use crate::interp::value::Value;
use crate::ir::{FrameIdx, SymId};

/// How an inlinee's incoming value is recomputed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArgProvenance {
    /// A constant known at compile time
    Constant(Value),
    /// The parent frame's incoming argument at this index
    PassThrough(u16),
    /// A symbol captured by every bailout inside the inlinee
    Sym(SymId),
}

/// Where an inlined frame came from
#[derive(Debug, Clone, PartialEq)]
pub struct InlineeFrameRecord {
    pub parent: FrameIdx,
    /// Offset of the call op in the parent
    pub call_offset: Offset,
    /// Parent register receiving the call's result
    pub result_reg: u16,
    pub construct: bool,
    pub this: ArgProvenance,
    pub args: Vec<ArgProvenance>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FrameRecord {
    pub func: FuncId,
    /// Number of logical frames above this one
    pub depth: u32,
    /// Symbol holding each byte-code register of the frame
    pub reg_syms: Vec<SymId>,
    pub inlinee: Option<InlineeFrameRecord>,
}

impl FrameRecord {
    pub fn parent(&self) -> Option<FrameIdx> {
        self.inlinee.as_ref().map(|i| i.parent)
    }
}

/// All logical frames of one compiled body, indexed by `FrameIdx`
#[derive(Debug, Clone, PartialEq)]
pub struct FrameTable {
    frames: Vec<FrameRecord>,
}

impl FrameTable {
    pub fn new(root: FuncId, reg_syms: Vec<SymId>) -> Self {
        FrameTable {
            frames: vec![FrameRecord {
                func: root,
                depth: 0,
                reg_syms,
                inlinee: None,
            }],
        }
    }

    pub fn push(&mut self, func: FuncId, reg_syms: Vec<SymId>, inlinee: InlineeFrameRecord) -> FrameIdx {
        let depth = self.get(inlinee.parent).depth + 1;
        self.frames.push(FrameRecord {
            func,
            depth,
            reg_syms,
            inlinee: Some(inlinee),
        });
        FrameIdx(self.frames.len() as u32 - 1)
    }

    pub fn get(&self, idx: FrameIdx) -> &FrameRecord {
        &self.frames[idx.0 as usize]
    }

    pub fn get_mut(&mut self, idx: FrameIdx) -> &mut FrameRecord {
        &mut self.frames[idx.0 as usize]
    }

    pub fn len(&self) -> usize {
        self.frames.len()
    }

    pub fn is_empty(&self) -> bool {
        self.frames.is_empty()
    }

    /// Drop frames added after a checkpoint
    pub fn truncate(&mut self, len: usize) {
        self.frames.truncate(len.max(1));
    }

    /// Frames from `idx` out to the root, innermost first
    pub fn chain(&self, idx: FrameIdx) -> Vec<FrameIdx> {
        let mut out = vec![idx];
        let mut cur = idx;
        while let Some(parent) = self.get(cur).parent() {
            out.push(parent);
            cur = parent;
        }
        out
    }

    /// Symbols the frame chain needs to recompute inlinee `this` and arguments
    pub fn provenance_syms(&self, idx: FrameIdx, out: &mut Vec<SymId>) {
        for frame in self.chain(idx) {
            if let Some(inlinee) = &self.get(frame).inlinee {
                let all = std::iter::once(&inlinee.this).chain(inlinee.args.iter());
                for prov in all {
                    if let ArgProvenance::Sym(s) = prov {
                        out.push(*s);
                    }
                }
            }
        }
    }

    /// How many frames of the chain ending at `idx` run `func`
    pub fn recursion_count(&self, idx: FrameIdx, func: FuncId) -> usize {
        self.chain(idx)
            .into_iter()
            .filter(|f| self.get(*f).func == func)
            .count()
    }

    pub fn iter(&self) -> impl Iterator<Item = (FrameIdx, &FrameRecord)> {
        self.frames
            .iter()
            .enumerate()
            .map(|(i, f)| (FrameIdx(i as u32), f))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inlinee(parent: FrameIdx, arg: ArgProvenance) -> InlineeFrameRecord {
        InlineeFrameRecord {
            parent,
            call_offset: 3,
            result_reg: 0,
            construct: false,
            this: ArgProvenance::Constant(Value::UNDEFINED),
            args: vec![arg],
        }
    }

    #[test]
    fn test_chain_and_depth() {
        let mut table = FrameTable::new(FuncId(0), vec![SymId(0)]);
        let a = table.push(FuncId(1), vec![], inlinee(FrameIdx::ROOT, ArgProvenance::Sym(SymId(7))));
        let b = table.push(FuncId(2), vec![], inlinee(a, ArgProvenance::PassThrough(0)));
        assert_eq!(table.get(b).depth, 2);
        assert_eq!(table.chain(b), vec![b, a, FrameIdx::ROOT]);
        assert_eq!(table.chain(FrameIdx::ROOT).len(), 1);

        let mut syms = Vec::new();
        table.provenance_syms(b, &mut syms);
        assert_eq!(syms, vec![SymId(7)]);
    }

    #[test]
    fn test_truncate_keeps_root() {
        let mut table = FrameTable::new(FuncId(0), vec![]);
        table.push(FuncId(1), vec![], inlinee(FrameIdx::ROOT, ArgProvenance::PassThrough(0)));
        table.truncate(0);
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_recursion_count() {
        let mut table = FrameTable::new(FuncId(0), vec![]);
        let a = table.push(FuncId(0), vec![], inlinee(FrameIdx::ROOT, ArgProvenance::PassThrough(0)));
        assert_eq!(table.recursion_count(a, FuncId(0)), 2);
        assert_eq!(table.recursion_count(a, FuncId(5)), 0);
    }
}

//! Control-flow graph over byte code
//!
//! Splits a function body into basic blocks and connects them via normal
//! control flow. Exception handlers start blocks of their own but are only
//! reached through the interpreter, so they get no incoming edges.

use rustc_hash::{FxHashMap, FxHashSet};

use crate::bytecode::{FunctionBody, Offset, Op};

/// A basic block of byte code: ops `start..end`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CfgBlock {
    pub start: Offset,
    pub end: Offset,
    pub successors: Vec<Offset>,
    pub predecessors: Vec<Offset>,
}

#[derive(Debug)]
pub struct ControlFlowGraph {
    /// Blocks keyed by start offset, in offset order
    pub blocks: Vec<CfgBlock>,
    pub offset_to_block: FxHashMap<Offset, usize>,
}

/// A natural loop found from its back edges
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoopRegion {
    pub header: Offset,
    /// Last op of the loop (the latest back-edge source)
    pub last: Offset,
}

impl LoopRegion {
    pub fn contains(&self, offset: Offset) -> bool {
        self.header <= offset && offset <= self.last
    }
}

/// Build a control-flow graph for `body`
pub fn build_cfg(body: &FunctionBody) -> ControlFlowGraph {
    let starts = collect_block_starts(body);
    let mut sorted: Vec<Offset> = starts.into_iter().collect();
    sorted.sort_unstable();

    let len = body.code.len() as Offset;
    let mut blocks = Vec::with_capacity(sorted.len());
    let mut offset_to_block = FxHashMap::default();
    for (idx, &start) in sorted.iter().enumerate() {
        let end = sorted.get(idx + 1).copied().unwrap_or(len);
        let last = body.code[(end - 1) as usize];
        let mut successors = Vec::with_capacity(2);
        if last.falls_through() && end < len {
            successors.push(end);
        }
        if let Some(target) = last.branch_target() {
            if !successors.contains(&target) {
                successors.push(target);
            }
        }
        offset_to_block.insert(start, idx);
        blocks.push(CfgBlock {
            start,
            end,
            successors,
            predecessors: Vec::new(),
        });
    }

    for idx in 0..blocks.len() {
        let start = blocks[idx].start;
        for succ in blocks[idx].successors.clone() {
            if let Some(&s) = offset_to_block.get(&succ) {
                blocks[s].predecessors.push(start);
            }
        }
    }

    ControlFlowGraph {
        blocks,
        offset_to_block,
    }
}

/// Collect all offsets that start a new basic block
fn collect_block_starts(body: &FunctionBody) -> FxHashSet<Offset> {
    let mut starts = FxHashSet::default();
    starts.insert(0);
    let len = body.code.len() as Offset;
    for (offset, op) in body.code.iter().enumerate() {
        let offset = offset as Offset;
        if let Some(target) = op.branch_target() {
            starts.insert(target);
        }
        if let Op::EnterTry { handler } = *op {
            starts.insert(handler);
        }
        if op.ends_block() && offset + 1 < len {
            starts.insert(offset + 1);
        }
    }
    starts
}

impl ControlFlowGraph {
    pub fn block_at(&self, start: Offset) -> Option<&CfgBlock> {
        self.offset_to_block.get(&start).map(|&i| &self.blocks[i])
    }

    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Loop headered at `header`, spanning every back edge that targets it
    pub fn loop_at(&self, header: Offset) -> Option<LoopRegion> {
        let block = self.block_at(header)?;
        let last = block
            .predecessors
            .iter()
            .filter_map(|&p| self.block_at(p))
            .filter(|p| p.start >= header)
            .map(|p| p.end - 1)
            .max()?;
        Some(LoopRegion { header, last })
    }

    /// Block starts reachable from the entry along normal control flow
    pub fn reachable(&self) -> FxHashSet<Offset> {
        let mut seen = FxHashSet::default();
        let mut work = vec![0];
        while let Some(start) = work.pop() {
            if !seen.insert(start) {
                continue;
            }
            if let Some(block) = self.block_at(start) {
                work.extend(block.successors.iter().copied());
            }
        }
        seen
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::BytecodeBuilder;
    use crate::bytecode::{BinaryOp, FuncId};

    fn counting_loop() -> FunctionBody {
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
        b.finish(FuncId(0)).unwrap()
    }

    #[test]
    fn test_linear_code() {
        let mut b = BytecodeBuilder::new("f", 0, 1);
        b.emit(Op::LoadInt { dst: 0, value: 1 });
        b.emit(Op::Return { src: 0 });
        let cfg = build_cfg(&b.finish(FuncId(0)).unwrap());
        assert_eq!(cfg.block_count(), 1);
        assert!(cfg.blocks[0].successors.is_empty());
    }

    #[test]
    fn test_loop() {
        let cfg = build_cfg(&counting_loop());
        let starts: Vec<Offset> = cfg.blocks.iter().map(|b| b.start).collect();
        assert_eq!(starts, vec![0, 1, 3, 5]);
        assert_eq!(cfg.block_at(1).unwrap().successors, vec![3, 5]);
        assert_eq!(cfg.loop_at(1), Some(LoopRegion { header: 1, last: 4 }));
        assert_eq!(cfg.loop_at(0), None);
    }

    #[test]
    fn test_handler_not_reachable() {
        let mut b = BytecodeBuilder::new("f", 1, 1);
        let handler = b.label();
        b.enter_try(handler);
        b.emit(Op::Throw { src: 0 });
        b.emit(Op::LeaveTry);
        b.bind(handler);
        b.emit(Op::Catch { dst: 0 });
        b.emit(Op::Return { src: 0 });
        let cfg = build_cfg(&b.finish(FuncId(0)).unwrap());
        assert!(cfg.block_at(3).is_some());
        assert!(!cfg.reachable().contains(&3));
    }
}

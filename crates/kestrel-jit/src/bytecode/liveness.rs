//! Register liveness over raw bytecode
//!
//! Tells which registers the interpreter will read when it resumes at an
//! offset: an exception handler, the far side of a pruned branch or a loop
//! exit. Bailouts to those offsets keep exactly these registers.

use crate::analysis::bitset::BitSet;

use super::{FunctionBody, Offset, Op};

/// Live-in register set for every offset of `body`
pub fn live_in(body: &FunctionBody) -> Vec<BitSet> {
    let len = body.code.len();
    let mut live = vec![BitSet::new(); len];
    let mut reads = Vec::new();
    let mut changed = true;
    while changed {
        changed = false;
        for offset in (0..len).rev() {
            let op = &body.code[offset];
            let mut out = BitSet::new();
            for succ in successors(body, offset as Offset, op) {
                out.union_with(&live[succ as usize]);
            }
            if let Some(dst) = op.writes() {
                out.remove(dst as usize);
            }
            reads.clear();
            op.reads(&mut reads);
            for r in &reads {
                out.insert(*r as usize);
            }
            if !out.same_as(&live[offset]) {
                live[offset] = out;
                changed = true;
            }
        }
    }
    live
}

fn successors(body: &FunctionBody, offset: Offset, op: &Op) -> Vec<Offset> {
    let mut succs = Vec::with_capacity(3);
    if op.falls_through() && (offset as usize) + 1 < body.code.len() {
        succs.push(offset + 1);
    }
    if let Some(target) = op.branch_target() {
        succs.push(target);
    }
    if op.may_throw() {
        succs.extend(body.handler_for(offset));
    }
    succs
}

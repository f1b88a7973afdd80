//! Pretty-printing for IR
//!
//! Display implementations used for trace-level dumps.

use std::fmt;

use super::instr::{Block, Inst, InstKind, IrFunc, Terminator};

impl fmt::Display for IrFunc {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(
            f,
            "function @{} [{}] ({:?}, syms: {}, frames: {}) {{",
            self.name,
            self.func,
            self.entry,
            self.syms.len(),
            self.frames.len()
        )?;
        for block in self.live_blocks() {
            write_block(f, self, block)?;
        }
        writeln!(f, "}}")
    }
}

fn write_block(f: &mut fmt::Formatter<'_>, func: &IrFunc, block: &Block) -> fmt::Result {
    writeln!(f, "  {}:", block.id)?;
    for inst in &block.insts {
        write!(f, "    {}", inst)?;
        if let Some(h) = &inst.bailout {
            let info = func.arena.get(h);
            write!(f, " ; bail {:?}/{:?} @{} [", info.kind, info.reason, info.offset)?;
            for (i, s) in info.captured.iter().enumerate() {
                if i > 0 {
                    write!(f, ", ")?;
                }
                write!(f, "{}", s)?;
            }
            write!(f, "]")?;
            if func.arena.is_shared(h) {
                write!(f, " shared")?;
            }
        }
        if inst.on_throw.is_some() {
            write!(f, " ; on-throw")?;
        }
        writeln!(f)?;
    }
    writeln!(f, "    {}", block.term)
}

impl fmt::Display for Inst {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:>4}{} {}", self.offset, self.frame, self.kind)
    }
}

impl fmt::Display for InstKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InstKind::Const { dst, value } => write!(f, "{} = const {}", dst, value),
            InstKind::Move { dst, src } => write!(f, "{} = {}", dst, src),
            InstKind::LoadParam { dst, index } => write!(f, "{} = param {}", dst, index),
            InstKind::LoadIncoming { dst, reg } => write!(f, "{} = incoming r{}", dst, reg),
            InstKind::LoadThis { dst } => write!(f, "{} = this", dst),
            InstKind::ArgCount { dst } => write!(f, "{} = argc", dst),
            InstKind::LoadArg { dst, index } => write!(f, "{} = arguments[{}]", dst, index),
            InstKind::Binary { op, dst, lhs, rhs } => {
                write!(f, "{} = {} {} {}", dst, lhs, op.symbol(), rhs)
            }
            InstKind::IntBinary {
                op,
                dst,
                lhs,
                rhs,
                check_overflow,
                check_negzero,
            } => {
                write!(f, "{} = int {} {} {}", dst, lhs, op.symbol(), rhs)?;
                if *check_overflow {
                    write!(f, " !ovf")?;
                }
                if *check_negzero {
                    write!(f, " !negzero")?;
                }
                Ok(())
            }
            InstKind::Not { dst, src } => write!(f, "{} = !{}", dst, src),
            InstKind::CheckInt { value } => write!(f, "check_int {}", value),
            InstKind::CheckShape { obj, shape } => write!(f, "check_shape {}, shape{}", obj, shape.0),
            InstKind::CheckCallTarget { callee, func } => write!(f, "check_target {}, {}", callee, func),
            InstKind::Bail => write!(f, "bail"),
            InstKind::IsFunction { dst, value, func } => write!(f, "{} = is_function {}, {}", dst, value, func),
            InstKind::LoadProp { dst, obj, name, slot } => match slot {
                Some(slot) => write!(f, "{} = {}.n{} @slot{}", dst, obj, name.0, slot),
                None => write!(f, "{} = {}.n{}", dst, obj, name.0),
            },
            InstKind::StoreProp { obj, name, value, slot } => match slot {
                Some(slot) => write!(f, "{}.n{} = {} @slot{}", obj, name.0, value, slot),
                None => write!(f, "{}.n{} = {}", obj, name.0, value),
            },
            InstKind::DeleteProp { obj, name } => write!(f, "delete {}.n{}", obj, name.0),
            InstKind::NewObject { dst } => write!(f, "{} = new_object", dst),
            InstKind::AllocForCtor { dst } => write!(f, "{} = alloc_for_ctor", dst),
            InstKind::ArgOut { dst, src } => write!(f, "{} = arg_out {}", dst, src),
            InstKind::Call {
                dst,
                callee,
                this,
                args,
                construct,
            } => {
                let kw = if *construct { "new" } else { "call" };
                write!(f, "{} = {} {}(", dst, kw, callee)?;
                if let Some(this) = this {
                    write!(f, "this: {}", this)?;
                }
                for (i, a) in args.iter().enumerate() {
                    if i > 0 || this.is_some() {
                        write!(f, ", ")?;
                    }
                    write!(f, "{}", a)?;
                }
                write!(f, ")")
            }
            InstKind::InlineeStart { frame } => write!(f, "inlinee_start {}", frame),
            InstKind::InlineeEnd { frame } => write!(f, "inlinee_end {}", frame),
            InstKind::CtorResult { dst, value, this } => write!(f, "{} = ctor_result {}, {}", dst, value, this),
            InstKind::Throw { value } => write!(f, "throw {}", value),
            InstKind::BytecodeUses => write!(f, "bc_uses"),
        }
    }
}

impl fmt::Display for Terminator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Terminator::Jump(target) => write!(f, "jump {}", target),
            Terminator::Branch {
                cond,
                then_block,
                else_block,
            } => write!(f, "br {}, {}, {}", cond, then_block, else_block),
            Terminator::Return(s) => write!(f, "ret {}", s),
            Terminator::Unreachable => write!(f, "unreachable"),
            Terminator::None => write!(f, "<none>"),
        }
    }
}

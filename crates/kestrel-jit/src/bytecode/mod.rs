//! Register-based bytecode consumed by the JIT
//!
//! The bytecode compiler is an external collaborator; this module only
//! defines the shape of its output: ops, function bodies with their register
//! counts (the symbol table of locals and arguments), static try regions,
//! and a program-wide property name table.

pub mod builder;
pub mod liveness;

use std::fmt;

/// Function identifier (index into `Program::functions`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FuncId(pub u32);

impl fmt::Display for FuncId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "f{}", self.0)
    }
}

/// Property name identifier (index into `Program::names`)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct NameId(pub u32);

/// Byte-code offset (op index)
pub type Offset = u32;

/// Binary operators
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BinaryOp {
    Add,
    Sub,
    Mul,
    Div,
    BitOr,
    Lt,
    Le,
    StrictEq,
}

impl BinaryOp {
    pub fn is_compare(self) -> bool {
        matches!(self, BinaryOp::Lt | BinaryOp::Le | BinaryOp::StrictEq)
    }

    /// Whether the generic form may run script code through `valueOf`
    pub fn may_call_implicitly(self) -> bool {
        !matches!(self, BinaryOp::StrictEq)
    }

    pub fn symbol(self) -> &'static str {
        match self {
            BinaryOp::Add => "+",
            BinaryOp::Sub => "-",
            BinaryOp::Mul => "*",
            BinaryOp::Div => "/",
            BinaryOp::BitOr => "|",
            BinaryOp::Lt => "<",
            BinaryOp::Le => "<=",
            BinaryOp::StrictEq => "===",
        }
    }
}

/// A bytecode instruction. Register operands are `u16` indices.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Op {
    LoadInt { dst: u16, value: i32 },
    LoadFloat { dst: u16, value: f64 },
    LoadBool { dst: u16, value: bool },
    LoadUndefined { dst: u16 },
    LoadNull { dst: u16 },
    LoadFunction { dst: u16, func: FuncId },
    Move { dst: u16, src: u16 },
    Binary { op: BinaryOp, dst: u16, lhs: u16, rhs: u16 },
    Not { dst: u16, src: u16 },
    GetProp { dst: u16, obj: u16, name: NameId },
    SetProp { obj: u16, name: NameId, value: u16 },
    DeleteProp { obj: u16, name: NameId },
    NewObject { dst: u16 },
    LoadThis { dst: u16 },
    ArgCount { dst: u16 },
    LoadArg { dst: u16, index: u16 },
    /// Arguments are `first_arg..first_arg + argc`
    Call { dst: u16, callee: u16, this: u16, first_arg: u16, argc: u16 },
    New { dst: u16, callee: u16, first_arg: u16, argc: u16 },
    Jump { target: Offset },
    JumpIfTrue { cond: u16, target: Offset },
    JumpIfFalse { cond: u16, target: Offset },
    Return { src: u16 },
    EnterTry { handler: Offset },
    LeaveTry,
    Throw { src: u16 },
    /// First op of a handler: stores the pending exception
    Catch { dst: u16 },
}

impl Op {
    /// Registers read by this op
    pub fn reads(&self, out: &mut Vec<u16>) {
        match *self {
            Op::Move { src, .. } | Op::Not { src, .. } => out.push(src),
            Op::Binary { lhs, rhs, .. } => {
                out.push(lhs);
                out.push(rhs);
            }
            Op::GetProp { obj, .. } | Op::DeleteProp { obj, .. } => out.push(obj),
            Op::SetProp { obj, value, .. } => {
                out.push(obj);
                out.push(value);
            }
            Op::Call { callee, this, first_arg, argc, .. } => {
                out.push(callee);
                out.push(this);
                out.extend(first_arg..first_arg + argc);
            }
            Op::New { callee, first_arg, argc, .. } => {
                out.push(callee);
                out.extend(first_arg..first_arg + argc);
            }
            Op::JumpIfTrue { cond, .. } | Op::JumpIfFalse { cond, .. } => out.push(cond),
            Op::Return { src } | Op::Throw { src } => out.push(src),
            _ => {}
        }
    }

    /// Register written by this op
    pub fn writes(&self) -> Option<u16> {
        match *self {
            Op::LoadInt { dst, .. }
            | Op::LoadFloat { dst, .. }
            | Op::LoadBool { dst, .. }
            | Op::LoadUndefined { dst }
            | Op::LoadNull { dst }
            | Op::LoadFunction { dst, .. }
            | Op::Move { dst, .. }
            | Op::Binary { dst, .. }
            | Op::Not { dst, .. }
            | Op::GetProp { dst, .. }
            | Op::NewObject { dst }
            | Op::LoadThis { dst }
            | Op::ArgCount { dst }
            | Op::LoadArg { dst, .. }
            | Op::Call { dst, .. }
            | Op::New { dst, .. }
            | Op::Catch { dst } => Some(dst),
            _ => None,
        }
    }

    /// Explicit branch target, if any
    pub fn branch_target(&self) -> Option<Offset> {
        match *self {
            Op::Jump { target }
            | Op::JumpIfTrue { target, .. }
            | Op::JumpIfFalse { target, .. } => Some(target),
            _ => None,
        }
    }

    /// Whether control can continue to the next op
    pub fn falls_through(&self) -> bool {
        !matches!(self, Op::Jump { .. } | Op::Return { .. } | Op::Throw { .. })
    }

    pub fn ends_block(&self) -> bool {
        self.branch_target().is_some() || !self.falls_through()
    }

    /// Whether executing this op can raise an exception
    pub fn may_throw(&self) -> bool {
        match self {
            Op::Binary { op, .. } => op.may_call_implicitly(),
            Op::GetProp { .. }
            | Op::SetProp { .. }
            | Op::DeleteProp { .. }
            | Op::Call { .. }
            | Op::New { .. }
            | Op::Throw { .. } => true,
            _ => false,
        }
    }

    /// Reads the caller's argument collection directly
    pub fn uses_arguments(&self) -> bool {
        matches!(self, Op::ArgCount { .. } | Op::LoadArg { .. })
    }
}

/// Statically nested try region: ops in `start..end` are protected by `handler`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TryRegion {
    pub start: Offset,
    pub end: Offset,
    pub handler: Offset,
}

/// Errors detected while validating bytecode
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum BytecodeError {
    #[error("function {0} has an empty body")]
    Empty(String),
    #[error("register r{reg} out of range at offset {offset}")]
    RegisterOutOfRange { offset: Offset, reg: u16 },
    #[error("jump target {target} out of range at offset {offset}")]
    TargetOutOfRange { offset: Offset, target: Offset },
    #[error("control falls off the end of function {0}")]
    FallsOffEnd(String),
    #[error("unbalanced try region at offset {0}")]
    UnbalancedTry(Offset),
    #[error("more parameters than registers in {0}")]
    TooManyParams(String),
    #[error("function id {found} stored at index {index}")]
    MisplacedFunction { index: usize, found: u32 },
    #[error("unknown function f{0}")]
    UnknownFunction(u32),
}

/// A function's bytecode plus its local symbol table
#[derive(Debug, Clone)]
pub struct FunctionBody {
    pub id: FuncId,
    pub name: String,
    pub param_count: u16,
    pub register_count: u16,
    pub code: Vec<Op>,
    pub try_regions: Vec<TryRegion>,
}

impl FunctionBody {
    pub fn new(
        id: FuncId,
        name: impl Into<String>,
        param_count: u16,
        register_count: u16,
        code: Vec<Op>,
    ) -> Result<Self, BytecodeError> {
        let name = name.into();
        if code.is_empty() {
            return Err(BytecodeError::Empty(name));
        }
        if param_count > register_count {
            return Err(BytecodeError::TooManyParams(name));
        }
        let len = code.len() as Offset;
        let mut regs = Vec::new();
        for (offset, op) in code.iter().enumerate() {
            let offset = offset as Offset;
            regs.clear();
            op.reads(&mut regs);
            regs.extend(op.writes());
            if let Some(&reg) = regs.iter().find(|r| **r >= register_count) {
                return Err(BytecodeError::RegisterOutOfRange { offset, reg });
            }
            let target = match *op {
                Op::EnterTry { handler } => Some(handler),
                _ => op.branch_target(),
            };
            if let Some(target) = target {
                if target >= len {
                    return Err(BytecodeError::TargetOutOfRange { offset, target });
                }
            }
        }
        if code[code.len() - 1].falls_through() {
            return Err(BytecodeError::FallsOffEnd(name));
        }
        let try_regions = scan_try_regions(&code)?;
        Ok(FunctionBody {
            id,
            name,
            param_count,
            register_count,
            code,
            try_regions,
        })
    }

    pub fn len(&self) -> usize {
        self.code.len()
    }

    pub fn is_empty(&self) -> bool {
        self.code.is_empty()
    }

    /// Innermost handler protecting `offset`
    pub fn handler_for(&self, offset: Offset) -> Option<Offset> {
        self.try_regions
            .iter()
            .filter(|r| r.start <= offset && offset < r.end)
            .min_by_key(|r| r.end - r.start)
            .map(|r| r.handler)
    }

    pub fn uses_arguments(&self) -> bool {
        self.code.iter().any(Op::uses_arguments)
    }

    /// Whether register `reg` is ever written
    pub fn writes_register(&self, reg: u16) -> bool {
        self.code.iter().any(|op| op.writes() == Some(reg))
    }
}

fn scan_try_regions(code: &[Op]) -> Result<Vec<TryRegion>, BytecodeError> {
    let mut open: Vec<(Offset, Offset)> = Vec::new();
    let mut regions = Vec::new();
    for (offset, op) in code.iter().enumerate() {
        let offset = offset as Offset;
        match *op {
            Op::EnterTry { handler } => open.push((offset, handler)),
            Op::LeaveTry => {
                let (start, handler) = open.pop().ok_or(BytecodeError::UnbalancedTry(offset))?;
                regions.push(TryRegion {
                    start,
                    end: offset,
                    handler,
                });
            }
            _ => {}
        }
    }
    if let Some((start, _)) = open.pop() {
        return Err(BytecodeError::UnbalancedTry(start));
    }
    Ok(regions)
}

/// All functions of a script plus the property name table
#[derive(Debug, Clone)]
pub struct Program {
    pub functions: Vec<FunctionBody>,
    pub names: Vec<String>,
}

impl Program {
    pub fn new(functions: Vec<FunctionBody>, names: Vec<String>) -> Result<Self, BytecodeError> {
        for (index, f) in functions.iter().enumerate() {
            if f.id.0 as usize != index {
                return Err(BytecodeError::MisplacedFunction { index, found: f.id.0 });
            }
            for op in &f.code {
                if let Op::LoadFunction { func, .. } = op {
                    if func.0 as usize >= functions.len() {
                        return Err(BytecodeError::UnknownFunction(func.0));
                    }
                }
            }
        }
        Ok(Program { functions, names })
    }

    pub fn function(&self, id: FuncId) -> Option<&FunctionBody> {
        self.functions.get(id.0 as usize)
    }

    pub fn name(&self, id: NameId) -> &str {
        self.names.get(id.0 as usize).map(String::as_str).unwrap_or("<unknown>")
    }

    pub fn lookup_name(&self, name: &str) -> Option<NameId> {
        self.names
            .iter()
            .position(|n| n == name)
            .map(|i| NameId(i as u32))
    }
}

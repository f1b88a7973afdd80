//! Reference machine for the portable target
//!
//! Executes decoded `MInst`s against a register file and a stack of value
//! slots. Guards that fail and throws with an exception bailout jump to
//! their exit stub; the stub hands the saved registers and stack back to
//! the runtime as a `BailoutExit`.

use crate::bailout::BailoutReason;
use crate::bytecode::{FuncId, NameId};
use crate::error::ExecError;
use crate::interp::heap::{ObjId, ShapeId};
use crate::interp::value::{ErrorKind, Value};
use crate::interp::{ops, Host};

use super::portable::REGISTER_COUNT;
use super::traits::{CodegenError, Loc, MInst, Operand, PostCheck, Watch};

/// What compiled code needs beyond the interpreter host
pub trait MachineHost: Host {
    /// Number of implicit calls so far; only ever grows
    fn implicit_calls(&self) -> u64;
}

/// Incoming state of one activation
#[derive(Debug, Clone, Copy)]
pub struct Activation<'a> {
    pub this: Value,
    pub args: &'a [Value],
    /// Interpreter registers for loop entries
    pub incoming: &'a [Value],
    /// Function whose call sites keep collecting target profiles
    pub profile: Option<FuncId>,
}

/// State handed to the runtime when an exit stub runs
#[derive(Debug, Clone, PartialEq)]
pub struct BailoutExit {
    pub record: u32,
    /// Precise reason reported by the guard, if it knows better than the record
    pub reason: Option<BailoutReason>,
    /// Pending exception for exception bailouts
    pub exception: Option<Value>,
    /// Register save area
    pub regs: Vec<Value>,
    pub stack: Vec<Value>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MachineExit {
    Return(Value),
    Bailout(BailoutExit),
}

struct Machine<'a> {
    code: &'a [MInst],
    regs: Vec<Value>,
    stack: Vec<Value>,
    act: Activation<'a>,
    pc: usize,
    reason: Option<BailoutReason>,
    exception: Option<Value>,
}

/// Run compiled code until it returns or exits through a bailout
pub fn execute<H: MachineHost + ?Sized>(
    host: &mut H,
    code: &[MInst],
    frame_size: usize,
    act: Activation<'_>,
) -> Result<MachineExit, ExecError> {
    let mut m = Machine {
        code,
        regs: vec![Value::UNDEFINED; REGISTER_COUNT as usize],
        stack: vec![Value::UNDEFINED; frame_size],
        act,
        pc: 0,
        reason: None,
        exception: None,
    };
    loop {
        if let Some(exit) = m.step(host)? {
            return Ok(exit);
        }
    }
}

fn malformed(what: impl Into<String>) -> ExecError {
    ExecError::Codegen(CodegenError::Malformed(what.into()))
}

/// Watched counters before an op that may run script code
#[derive(Clone, Copy)]
struct Marks {
    implicit: u64,
    epoch: u64,
}

impl<'a> Machine<'a> {
    fn read(&self, op: Operand) -> Result<Value, ExecError> {
        match op {
            Operand::Imm(v) => Ok(v),
            Operand::Loc(Loc::Reg(r)) => self
                .regs
                .get(r as usize)
                .copied()
                .ok_or_else(|| malformed(format!("register r{}", r))),
            Operand::Loc(Loc::Stack(s)) => self
                .stack
                .get(s as usize)
                .copied()
                .ok_or_else(|| malformed(format!("stack slot {}", s))),
        }
    }

    fn write(&mut self, loc: Loc, v: Value) -> Result<(), ExecError> {
        let slot = match loc {
            Loc::Reg(r) => self.regs.get_mut(r as usize),
            Loc::Stack(s) => self.stack.get_mut(s as usize),
        };
        *slot.ok_or_else(|| malformed(format!("{:?}", loc)))? = v;
        Ok(())
    }

    fn jump(&mut self, target: u32) {
        self.pc = target as usize;
    }

    fn exit_to(&mut self, target: u32, reason: Option<BailoutReason>) {
        self.reason = reason;
        self.jump(target);
    }

    /// Route a script exception to the exception exit, or propagate it
    fn raise(&mut self, err: ExecError, on_throw: Option<u32>) -> Result<(), ExecError> {
        match (err, on_throw) {
            (ExecError::Thrown(e), Some(exit)) => {
                self.exception = Some(e);
                self.exit_to(exit, Some(BailoutReason::Throw));
                Ok(())
            }
            (err, _) => Err(err),
        }
    }

    fn marks<H: MachineHost + ?Sized>(host: &mut H) -> Marks {
        Marks {
            implicit: host.implicit_calls(),
            epoch: host.heap().shape_epoch(),
        }
    }

    /// After a value-producing op: leave if a watched counter moved
    fn post_check<H: MachineHost + ?Sized>(&mut self, host: &mut H, before: Marks, post: Option<PostCheck>) {
        let Some(post) = post else {
            return;
        };
        let fired = match post.watch {
            Watch::ImplicitCalls => host.implicit_calls() != before.implicit,
            Watch::ShapeEpoch => host.heap().shape_epoch() != before.epoch,
        };
        if fired {
            let reason = match post.watch {
                Watch::ImplicitCalls => Some(BailoutReason::ImplicitCall),
                Watch::ShapeEpoch => None,
            };
            self.exit_to(post.exit, reason);
        }
    }

    fn object(&self, op: Operand) -> Result<Option<ObjId>, ExecError> {
        Ok(self.read(op)?.as_object())
    }

    fn step<H: MachineHost + ?Sized>(&mut self, host: &mut H) -> Result<Option<MachineExit>, ExecError> {
        let code = self.code;
        let inst = code
            .get(self.pc)
            .ok_or_else(|| malformed(format!("pc {} past end", self.pc)))?;
        self.pc += 1;
        match inst {
            MInst::Mov { dst, src } => {
                let v = self.read(*src)?;
                self.write(*dst, v)?;
            }
            MInst::LoadParam { dst, index } => {
                let v = self.act.args.get(*index as usize).copied().unwrap_or(Value::UNDEFINED);
                self.write(*dst, v)?;
            }
            MInst::LoadIncoming { dst, reg } => {
                let v = self.act.incoming.get(*reg as usize).copied().unwrap_or(Value::UNDEFINED);
                self.write(*dst, v)?;
            }
            MInst::LoadThis { dst } => self.write(*dst, self.act.this)?,
            MInst::ArgCount { dst } => self.write(*dst, Value::int(self.act.args.len() as i32))?,
            MInst::LoadArg { dst, index } => {
                let v = self
                    .read(*index)?
                    .as_int()
                    .and_then(|i| usize::try_from(i).ok())
                    .and_then(|i| self.act.args.get(i).copied())
                    .unwrap_or(Value::UNDEFINED);
                self.write(*dst, v)?;
            }
            MInst::Binary {
                op,
                dst,
                lhs,
                rhs,
                on_throw,
                post,
            } => {
                let (a, b) = (self.read(*lhs)?, self.read(*rhs)?);
                let before = Self::marks(host);
                match ops::binary(host, *op, a, b) {
                    Ok(v) => {
                        self.write(*dst, v)?;
                        self.post_check(host, before, *post);
                    }
                    Err(e) => self.raise(e, *on_throw)?,
                }
            }
            MInst::IntBinary {
                op,
                dst,
                lhs,
                rhs,
                overflow,
                negzero,
            } => {
                let (a, b) = (self.read(*lhs)?, self.read(*rhs)?);
                let (Some(x), Some(y)) = (a.as_f64(), b.as_f64()) else {
                    return Err(malformed(format!("int op on {:?}, {:?}", a, b)));
                };
                let v = ops::numeric(*op, x, y);
                let negative_zero = v.as_f64().is_some_and(|f| f == 0.0 && f.is_sign_negative());
                if negative_zero && !v.is_int() {
                    if let Some(exit) = negzero {
                        self.exit_to(*exit, Some(BailoutReason::NegativeZero));
                        return Ok(None);
                    }
                } else if v.as_f64().is_some() && !v.is_int() {
                    if let Some(exit) = overflow {
                        self.exit_to(*exit, Some(BailoutReason::IntOverflow));
                        return Ok(None);
                    }
                }
                self.write(*dst, v)?;
            }
            MInst::Not { dst, src } => {
                let v = self.read(*src)?;
                self.write(*dst, Value::bool(!v.to_boolean()))?;
            }
            MInst::CheckInt { value, exit } => {
                if !self.read(*value)?.is_int() {
                    self.exit_to(*exit, Some(BailoutReason::NotAnInt));
                }
            }
            MInst::CheckShape { obj, shape, exit } => {
                let current = self.object(*obj)?.and_then(|o| host.heap().shape_of(o));
                if current != Some(ShapeId(*shape)) {
                    self.exit_to(*exit, Some(BailoutReason::ShapeMismatch));
                }
            }
            MInst::CheckCallTarget { callee, func, exit } => {
                if self.read(*callee)?.as_function() != Some(FuncId(*func)) {
                    self.exit_to(*exit, Some(BailoutReason::CallTargetMismatch));
                }
            }
            MInst::IsFunction { dst, value, func } => {
                let is = self.read(*value)?.as_function() == Some(FuncId(*func));
                self.write(*dst, Value::bool(is))?;
            }
            MInst::LoadProp {
                dst,
                obj,
                name,
                on_throw,
            } => match self.object(*obj)? {
                Some(o) => {
                    let v = host
                        .heap()
                        .get(o, NameId(*name))
                        .map(|(_, v)| v)
                        .unwrap_or(Value::UNDEFINED);
                    self.write(*dst, v)?;
                }
                None => self.raise(ExecError::Thrown(Value::error(ErrorKind::NotAnObject)), *on_throw)?,
            },
            MInst::LoadSlot { dst, obj, slot } => {
                let o = self.object(*obj)?.ok_or_else(|| malformed("cached load on a non-object"))?;
                let v = host.heap().load_slot(o, *slot);
                self.write(*dst, v)?;
            }
            MInst::StoreProp {
                obj,
                name,
                value,
                on_throw,
            } => match self.object(*obj)? {
                Some(o) => {
                    let v = self.read(*value)?;
                    host.heap().set(o, NameId(*name), v);
                }
                None => self.raise(ExecError::Thrown(Value::error(ErrorKind::NotAnObject)), *on_throw)?,
            },
            MInst::StoreSlot { obj, slot, value } => {
                let o = self.object(*obj)?.ok_or_else(|| malformed("cached store on a non-object"))?;
                let v = self.read(*value)?;
                host.heap().store_slot(o, *slot, v);
            }
            MInst::DeleteProp { obj, name, on_throw } => match self.object(*obj)? {
                Some(o) => {
                    host.heap().delete(o, NameId(*name));
                }
                None => self.raise(ExecError::Thrown(Value::error(ErrorKind::NotAnObject)), *on_throw)?,
            },
            MInst::NewObject { dst } => {
                let o = host.heap().alloc_object();
                self.write(*dst, Value::object(o))?;
            }
            MInst::Call {
                dst,
                callee,
                this,
                args,
                on_throw,
                post,
                site,
            } => {
                let target = self.read(*callee)?;
                if let (Some(func), Some(offset)) = (self.act.profile, *site) {
                    if let Some(p) = host.profile().get(func) {
                        p.with_data(|d| d.record_call_target(offset, target.as_function()));
                    }
                }
                if target.as_function().is_none() {
                    self.raise(ExecError::Thrown(Value::error(ErrorKind::NotAFunction)), *on_throw)?;
                    return Ok(None);
                }
                let args = args.iter().map(|a| self.read(*a)).collect::<Result<Vec<_>, _>>()?;
                let before = Self::marks(host);
                let outcome = match this {
                    Some(t) => {
                        let receiver = self.read(*t)?;
                        host.call(target, receiver, &args)
                    }
                    None => {
                        let receiver = Value::object(host.heap().alloc_object());
                        host.call(target, receiver, &args)
                            .map(|r| if r.as_object().is_some() { r } else { receiver })
                    }
                };
                match outcome {
                    Ok(v) => {
                        self.write(*dst, v)?;
                        self.post_check(host, before, *post);
                    }
                    Err(e) => self.raise(e, *on_throw)?,
                }
            }
            MInst::CtorResult { dst, value, this } => {
                let v = self.read(*value)?;
                let result = if v.as_object().is_some() { v } else { self.read(*this)? };
                self.write(*dst, result)?;
            }
            MInst::Throw { value, on_throw } => {
                let v = self.read(*value)?;
                self.raise(ExecError::Thrown(v), *on_throw)?;
            }
            MInst::Jump { target } => self.jump(*target),
            MInst::Branch {
                cond,
                then_target,
                else_target,
            } => {
                let target = if self.read(*cond)?.to_boolean() {
                    *then_target
                } else {
                    *else_target
                };
                self.jump(target);
            }
            MInst::Return { value } => return Ok(Some(MachineExit::Return(self.read(*value)?))),
            MInst::Exit { record } => {
                return Ok(Some(MachineExit::Bailout(BailoutExit {
                    record: *record,
                    reason: self.reason.take(),
                    exception: self.exception.take(),
                    regs: std::mem::take(&mut self.regs),
                    stack: std::mem::take(&mut self.stack),
                })))
            }
            MInst::Trap => return Err(malformed(format!("trap at {}", self.pc - 1))),
        }
        Ok(None)
    }
}

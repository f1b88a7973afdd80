//! Reference interpreter
//!
//! Executes byte code one op at a time, records value profiles for the
//! optimizer, and continues execution from frames rebuilt by a bailout.

pub mod heap;
pub mod ops;
pub mod value;

use std::sync::Arc;

use crate::bytecode::{FuncId, FunctionBody, Offset, Op, Program};
use crate::error::ExecError;
use crate::profiling::ProgramProfile;

use heap::{Heap, PropStore};
use value::{ErrorKind, Value};

/// Services the interpreter needs from the engine that runs it
pub trait Host {
    fn program(&self) -> Arc<Program>;
    fn profile(&self) -> Arc<ProgramProfile>;
    fn heap(&mut self) -> &mut Heap;

    /// Call `callee` through the engine's normal dispatch
    fn call(&mut self, callee: Value, this: Value, args: &[Value]) -> Result<Value, ExecError>;

    /// Note that script code ran as a side effect of an operator
    fn implicit_call(&mut self);

    /// A loop back edge to `frame.pc` was taken; the engine may run the rest
    /// of the loop in compiled code and update `frame` with where it stopped.
    fn loop_back_edge(&mut self, frame: &mut InterpreterFrame) -> Result<LoopTransfer, ExecError>;
}

/// Outcome of offering a loop to compiled code
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LoopTransfer {
    /// Keep interpreting from `frame.pc`
    Stay,
    /// The function returned while in compiled code
    Returned(Value),
}

/// One activation of a byte-code function
#[derive(Debug, Clone, PartialEq)]
pub struct InterpreterFrame {
    pub func: FuncId,
    pub pc: Offset,
    pub regs: Vec<Value>,
    pub this: Value,
    pub args: Vec<Value>,
    /// Entered through `new`: a non-object result yields `this`
    pub construct: bool,
    /// Register receiving the result of the call at `pc`, for rebuilt
    /// frames whose callee is still running
    pub awaiting: Option<u16>,
}

impl InterpreterFrame {
    /// Fresh activation with parameters bound from `args`
    pub fn new(body: &FunctionBody, this: Value, args: &[Value]) -> Self {
        let mut regs = vec![Value::UNDEFINED; body.register_count as usize];
        for (reg, arg) in regs.iter_mut().zip(args.iter().take(body.param_count as usize)) {
            *reg = *arg;
        }
        InterpreterFrame {
            func: body.id,
            pc: 0,
            regs,
            this,
            args: args.to_vec(),
            construct: false,
            awaiting: None,
        }
    }

    fn reg(&self, r: u16) -> Value {
        self.regs[r as usize]
    }

    fn set(&mut self, r: u16, v: Value) {
        self.regs[r as usize] = v;
    }

    /// Result seen by the caller for a value returned from this frame
    pub fn completion(&self, returned: Value) -> Value {
        if self.construct && returned.as_object().is_none() {
            self.this
        } else {
            returned
        }
    }
}

/// How a frame starts running
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Resume {
    /// Execute from `pc`
    Start,
    /// The call at `pc` produced a value
    Deliver(Value),
    /// The op at `pc` threw
    Throw(Value),
}

/// Interpreter state rebuilt by a bailout, innermost frame first
#[derive(Debug, Clone, PartialEq)]
pub struct RestoredState {
    pub frames: Vec<InterpreterFrame>,
    pub action: Resume,
}

/// Run `func` in the interpreter
pub fn call_function<H: Host + ?Sized>(
    host: &mut H,
    func: FuncId,
    this: Value,
    args: &[Value],
) -> Result<Value, ExecError> {
    let program = host.program();
    let body = program.function(func).ok_or(ExecError::UnknownFunction(func))?;
    let mut frame = InterpreterFrame::new(body, this, args);
    run_frame(host, &mut frame, Resume::Start)
}

/// Continue from a rebuilt state: each frame's result feeds the next outer
/// frame, and uncaught exceptions unwind outward.
pub fn resume<H: Host + ?Sized>(host: &mut H, state: RestoredState) -> Result<Value, ExecError> {
    let mut frames = state.frames.into_iter();
    let Some(mut innermost) = frames.next() else {
        return Err(ExecError::Thrown(Value::UNDEFINED));
    };
    let mut outcome = run_frame(host, &mut innermost, state.action)
        .map(|v| innermost.completion(v));
    for mut frame in frames {
        let start = match outcome {
            Ok(v) => Resume::Deliver(v),
            Err(ExecError::Thrown(e)) => Resume::Throw(e),
            Err(fatal) => return Err(fatal),
        };
        outcome = run_frame(host, &mut frame, start).map(|v| frame.completion(v));
    }
    outcome
}

/// Run one frame until it returns or throws past its handlers
pub fn run_frame<H: Host + ?Sized>(
    host: &mut H,
    frame: &mut InterpreterFrame,
    start: Resume,
) -> Result<Value, ExecError> {
    let program = host.program();
    let body = program
        .function(frame.func)
        .ok_or(ExecError::UnknownFunction(frame.func))?;
    let mut pending: Option<Value> = None;
    let mut incoming = match start {
        Resume::Start => None,
        Resume::Deliver(v) => {
            if let Some(dst) = frame.awaiting.take() {
                frame.set(dst, v);
            }
            frame.pc += 1;
            None
        }
        Resume::Throw(e) => {
            frame.awaiting = None;
            Some(ExecError::Thrown(e))
        }
    };
    loop {
        let result = match incoming.take() {
            Some(err) => Err(err),
            None => step(host, body, frame, &mut pending),
        };
        match result {
            Ok(None) => {}
            Ok(Some(v)) => return Ok(v),
            Err(ExecError::Thrown(e)) => match body.handler_for(frame.pc) {
                Some(handler) => {
                    tracing::trace!(func = %frame.func, offset = frame.pc, handler, "exception caught");
                    pending = Some(e);
                    frame.pc = handler;
                }
                None => return Err(ExecError::Thrown(e)),
            },
            Err(fatal) => return Err(fatal),
        }
    }
}

fn throw(kind: ErrorKind) -> ExecError {
    ExecError::Thrown(Value::error(kind))
}

/// Execute the op at `frame.pc`. On error `frame.pc` still names the op.
fn step<H: Host + ?Sized>(
    host: &mut H,
    body: &FunctionBody,
    frame: &mut InterpreterFrame,
    pending: &mut Option<Value>,
) -> Result<Option<Value>, ExecError> {
    let pc = frame.pc;
    let op = body.code[pc as usize];
    let mut next = pc + 1;
    match op {
        Op::LoadInt { dst, value } => frame.set(dst, Value::int(value)),
        Op::LoadFloat { dst, value } => frame.set(dst, Value::number(value)),
        Op::LoadBool { dst, value } => frame.set(dst, Value::bool(value)),
        Op::LoadUndefined { dst } => frame.set(dst, Value::UNDEFINED),
        Op::LoadNull { dst } => frame.set(dst, Value::NULL),
        Op::LoadFunction { dst, func } => frame.set(dst, Value::function(func)),
        Op::Move { dst, src } => {
            let v = frame.reg(src);
            frame.set(dst, v);
        }
        Op::Binary { op, dst, lhs, rhs } => {
            let (a, b) = (frame.reg(lhs), frame.reg(rhs));
            let result = ops::binary(host, op, a, b)?;
            if op.may_call_implicitly() {
                let int_only = ops::int_only(op, a, b, result);
                record(host, frame.func, |d| d.record_arith(pc, int_only));
            }
            frame.set(dst, result);
        }
        Op::Not { dst, src } => {
            let v = frame.reg(src);
            frame.set(dst, Value::bool(!v.to_boolean()));
        }
        Op::GetProp { dst, obj, name } => {
            let Some(id) = frame.reg(obj).as_object() else {
                record(host, frame.func, |d| d.record_prop(pc, None));
                return Err(throw(ErrorKind::NotAnObject));
            };
            let heap = host.heap();
            let shape = heap.shape_of(id);
            let found = heap.get(id, name);
            let seen = shape.zip(found.map(|(slot, _)| slot));
            record(host, frame.func, |d| d.record_prop(pc, seen));
            frame.set(dst, found.map(|(_, v)| v).unwrap_or(Value::UNDEFINED));
        }
        Op::SetProp { obj, name, value } => {
            let Some(id) = frame.reg(obj).as_object() else {
                record(host, frame.func, |d| d.record_prop(pc, None));
                return Err(throw(ErrorKind::NotAnObject));
            };
            let v = frame.reg(value);
            let heap = host.heap();
            let shape = heap.shape_of(id);
            let seen = match heap.set(id, name, v) {
                PropStore::Existing(slot) => shape.map(|s| (s, slot)),
                PropStore::Added => None,
            };
            record(host, frame.func, |d| d.record_prop(pc, seen));
        }
        Op::DeleteProp { obj, name } => {
            let Some(id) = frame.reg(obj).as_object() else {
                return Err(throw(ErrorKind::NotAnObject));
            };
            host.heap().delete(id, name);
        }
        Op::NewObject { dst } => {
            let id = host.heap().alloc_object();
            frame.set(dst, Value::object(id));
        }
        Op::LoadThis { dst } => frame.set(dst, frame.this),
        Op::ArgCount { dst } => frame.set(dst, Value::int(frame.args.len() as i32)),
        Op::LoadArg { dst, index } => {
            let v = frame
                .reg(index)
                .as_int()
                .and_then(|i| usize::try_from(i).ok())
                .and_then(|i| frame.args.get(i).copied())
                .unwrap_or(Value::UNDEFINED);
            frame.set(dst, v);
        }
        Op::Call { dst, callee, this, first_arg, argc } => {
            let target = frame.reg(callee);
            record(host, frame.func, |d| d.record_call_target(pc, target.as_function()));
            if target.as_function().is_none() {
                return Err(throw(ErrorKind::NotAFunction));
            }
            let args = &frame.regs[first_arg as usize..(first_arg + argc) as usize];
            let result = host.call(target, frame.reg(this), args)?;
            frame.set(dst, result);
        }
        Op::New { dst, callee, first_arg, argc } => {
            let target = frame.reg(callee);
            record(host, frame.func, |d| d.record_call_target(pc, target.as_function()));
            if target.as_function().is_none() {
                return Err(throw(ErrorKind::NotAFunction));
            }
            let this = Value::object(host.heap().alloc_object());
            let args = &frame.regs[first_arg as usize..(first_arg + argc) as usize];
            let result = host.call(target, this, args)?;
            let result = if result.as_object().is_some() { result } else { this };
            frame.set(dst, result);
        }
        Op::Jump { target } => next = target,
        Op::JumpIfTrue { cond, target } | Op::JumpIfFalse { cond, target } => {
            let truthy = frame.reg(cond).to_boolean();
            let taken = truthy == matches!(op, Op::JumpIfTrue { .. });
            record(host, frame.func, |d| d.record_branch(pc, taken));
            if taken {
                next = target;
            }
        }
        Op::Return { src } => return Ok(Some(frame.reg(src))),
        Op::EnterTry { .. } | Op::LeaveTry => {}
        Op::Throw { src } => return Err(ExecError::Thrown(frame.reg(src))),
        Op::Catch { dst } => {
            let e = pending.take().unwrap_or(Value::UNDEFINED);
            frame.set(dst, e);
        }
    }

    frame.pc = next;
    if next <= pc {
        if let Some(p) = host.profile().get(frame.func) {
            p.record_loop(next);
        }
        if let LoopTransfer::Returned(v) = host.loop_back_edge(frame)? {
            return Ok(Some(v));
        }
    }
    Ok(None)
}

fn record<H: Host + ?Sized>(host: &H, func: FuncId, f: impl FnOnce(&mut crate::profiling::ProfileData)) {
    if let Some(p) = host.profile().get(func) {
        p.with_data(f);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bytecode::builder::BytecodeBuilder;
    use crate::bytecode::BinaryOp;

    /// Interpreter-only host
    struct TestHost {
        program: Arc<Program>,
        profile: Arc<ProgramProfile>,
        heap: Heap,
        implicit_calls: u32,
    }

    impl TestHost {
        fn new(functions: Vec<FunctionBody>, names: &[&str]) -> Self {
            let n = functions.len();
            let names = names.iter().map(|s| s.to_string()).collect();
            TestHost {
                program: Arc::new(Program::new(functions, names).unwrap()),
                profile: Arc::new(ProgramProfile::new(n)),
                heap: Heap::new(),
                implicit_calls: 0,
            }
        }
    }

    impl Host for TestHost {
        fn program(&self) -> Arc<Program> {
            self.program.clone()
        }
        fn profile(&self) -> Arc<ProgramProfile> {
            self.profile.clone()
        }
        fn heap(&mut self) -> &mut Heap {
            &mut self.heap
        }
        fn call(&mut self, callee: Value, this: Value, args: &[Value]) -> Result<Value, ExecError> {
            let func = callee.as_function().unwrap();
            call_function(self, func, this, args)
        }
        fn implicit_call(&mut self) {
            self.implicit_calls += 1;
        }
        fn loop_back_edge(&mut self, _frame: &mut InterpreterFrame) -> Result<LoopTransfer, ExecError> {
            Ok(LoopTransfer::Stay)
        }
    }

    fn sum_to() -> FunctionBody {
        // r1 = 0; r2 = 0; while (r2 < r0) { r1 = r1 + r2; r2 = r2 + 1 } return r1
        let mut b = BytecodeBuilder::new("sum", 1, 5);
        let head = b.label();
        let exit = b.label();
        b.emit(Op::LoadInt { dst: 1, value: 0 });
        b.emit(Op::LoadInt { dst: 2, value: 0 });
        b.emit(Op::LoadInt { dst: 4, value: 1 });
        b.bind(head);
        b.emit(Op::Binary { op: BinaryOp::Lt, dst: 3, lhs: 2, rhs: 0 });
        b.jump_if_false(3, exit);
        b.emit(Op::Binary { op: BinaryOp::Add, dst: 1, lhs: 1, rhs: 2 });
        b.emit(Op::Binary { op: BinaryOp::Add, dst: 2, lhs: 2, rhs: 4 });
        b.jump(head);
        b.bind(exit);
        b.emit(Op::Return { src: 1 });
        b.finish(FuncId(0)).unwrap()
    }

    #[test]
    fn test_loop_and_profiles() {
        let mut host = TestHost::new(vec![sum_to()], &[]);
        let v = call_function(&mut host, FuncId(0), Value::UNDEFINED, &[Value::int(10)]).unwrap();
        assert_eq!(v, Value::int(45));
        let data = host.profile.get(FuncId(0)).unwrap().snapshot();
        assert!(data.int_only(5));
        assert_eq!(data.loops.get(&3).copied(), Some(10));
    }

    #[test]
    fn test_value_of_is_implicit_call() {
        // valueOf returns 41; main: o = {}; o.valueOf = f1; return o + 1
        let mut m = BytecodeBuilder::new("main", 0, 3);
        m.emit(Op::NewObject { dst: 0 });
        m.emit(Op::LoadFunction { dst: 1, func: FuncId(1) });
        m.emit(Op::SetProp { obj: 0, name: crate::bytecode::NameId(0), value: 1 });
        m.emit(Op::LoadInt { dst: 2, value: 1 });
        m.emit(Op::Binary { op: BinaryOp::Add, dst: 2, lhs: 0, rhs: 2 });
        m.emit(Op::Return { src: 2 });
        let mut v = BytecodeBuilder::new("valueOf", 0, 1);
        v.emit(Op::LoadInt { dst: 0, value: 41 });
        v.emit(Op::Return { src: 0 });
        let mut host = TestHost::new(
            vec![m.finish(FuncId(0)).unwrap(), v.finish(FuncId(1)).unwrap()],
            &["valueOf"],
        );
        let r = call_function(&mut host, FuncId(0), Value::UNDEFINED, &[]).unwrap();
        assert_eq!(r, Value::int(42));
        assert_eq!(host.implicit_calls, 1);
    }

    #[test]
    fn test_exception_caught_by_handler() {
        let mut b = BytecodeBuilder::new("f", 0, 2);
        let handler = b.label();
        b.enter_try(handler);
        b.emit(Op::LoadNull { dst: 0 });
        b.emit(Op::GetProp { dst: 1, obj: 0, name: crate::bytecode::NameId(0) });
        b.emit(Op::LeaveTry);
        b.emit(Op::Return { src: 1 });
        b.bind(handler);
        b.emit(Op::Catch { dst: 1 });
        b.emit(Op::Return { src: 1 });
        let mut host = TestHost::new(vec![b.finish(FuncId(0)).unwrap()], &["x"]);
        let r = call_function(&mut host, FuncId(0), Value::UNDEFINED, &[]).unwrap();
        assert_eq!(r.as_error(), Some(ErrorKind::NotAnObject));
    }

    #[test]
    fn test_resume_delivers_into_outer_frame() {
        // outer: r1 = call r0(); r1 = r1 + r1; return r1
        let mut o = BytecodeBuilder::new("outer", 0, 2);
        o.emit(Op::LoadFunction { dst: 0, func: FuncId(1) });
        o.emit(Op::Call { dst: 1, callee: 0, this: 0, first_arg: 0, argc: 0 });
        o.emit(Op::Binary { op: BinaryOp::Add, dst: 1, lhs: 1, rhs: 1 });
        o.emit(Op::Return { src: 1 });
        let mut i = BytecodeBuilder::new("inner", 0, 1);
        i.emit(Op::LoadInt { dst: 0, value: 5 });
        i.emit(Op::Return { src: 0 });
        let outer = o.finish(FuncId(0)).unwrap();
        let inner = i.finish(FuncId(1)).unwrap();

        let mut inner_frame = InterpreterFrame::new(&inner, Value::UNDEFINED, &[]);
        inner_frame.pc = 1;
        inner_frame.regs[0] = Value::int(21);
        let mut outer_frame = InterpreterFrame::new(&outer, Value::UNDEFINED, &[]);
        outer_frame.pc = 1;
        outer_frame.awaiting = Some(1);
        outer_frame.regs[0] = Value::function(FuncId(1));

        let mut host = TestHost::new(vec![outer, inner], &[]);
        let state = RestoredState {
            frames: vec![inner_frame, outer_frame],
            action: Resume::Start,
        };
        assert_eq!(resume(&mut host, state).unwrap(), Value::int(42));
    }

    #[test]
    fn test_resume_throw_unwinds_to_outer_handler() {
        let mut o = BytecodeBuilder::new("outer", 0, 2);
        let handler = o.label();
        o.enter_try(handler);
        o.emit(Op::LoadFunction { dst: 0, func: FuncId(1) });
        o.emit(Op::Call { dst: 1, callee: 0, this: 0, first_arg: 0, argc: 0 });
        o.emit(Op::LeaveTry);
        o.emit(Op::Return { src: 1 });
        o.bind(handler);
        o.emit(Op::Catch { dst: 1 });
        o.emit(Op::Return { src: 1 });
        let mut i = BytecodeBuilder::new("inner", 0, 1);
        i.emit(Op::Throw { src: 0 });
        let outer = o.finish(FuncId(0)).unwrap();
        let inner = i.finish(FuncId(1)).unwrap();

        let inner_frame = InterpreterFrame::new(&inner, Value::UNDEFINED, &[]);
        let mut outer_frame = InterpreterFrame::new(&outer, Value::UNDEFINED, &[]);
        outer_frame.pc = 2;
        outer_frame.awaiting = Some(1);

        let mut host = TestHost::new(vec![outer, inner], &[]);
        let state = RestoredState {
            frames: vec![inner_frame, outer_frame],
            action: Resume::Throw(Value::int(9)),
        };
        assert_eq!(resume(&mut host, state).unwrap(), Value::int(9));
    }
}

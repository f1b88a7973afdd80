//! Programs and configurations shared by the integration tests

#![allow(dead_code)]

use kestrel_jit::bytecode::builder::BytecodeBuilder;
use kestrel_jit::bytecode::{BinaryOp, FuncId, NameId, Op, Program};
use kestrel_jit::JitConfig;

/// Compile in the foreground so every promotion is installed before the
/// promoting call runs
pub fn eager_config(simple: u32, full: u32) -> JitConfig {
    let mut config = JitConfig::default();
    config.scheduler.background = false;
    config.tiering.simple_call_threshold = simple;
    config.tiering.full_call_threshold = full;
    config
}

/// f0 caller(f, x) = f(x); f1 inc(x) = x + 1; f2 big(x) = x + 100
pub fn caller_program() -> Program {
    let mut c = BytecodeBuilder::new("caller", 2, 4);
    c.emit(Op::LoadUndefined { dst: 2 });
    c.emit(Op::Call {
        dst: 3,
        callee: 0,
        this: 2,
        first_arg: 1,
        argc: 1,
    });
    c.emit(Op::Return { src: 3 });
    Program::new(
        vec![
            c.finish(FuncId(0)).unwrap(),
            add_const("inc", 1).finish(FuncId(1)).unwrap(),
            add_const("big", 100).finish(FuncId(2)).unwrap(),
        ],
        vec![],
    )
    .unwrap()
}

/// Offset of the call in `caller_program`'s caller
pub const CALLER_CALL_OFFSET: u32 = 1;

fn add_const(name: &str, value: i32) -> BytecodeBuilder {
    let mut b = BytecodeBuilder::new(name, 1, 3);
    b.emit(Op::LoadInt { dst: 1, value });
    b.emit(Op::Binary {
        op: BinaryOp::Add,
        dst: 2,
        lhs: 0,
        rhs: 1,
    });
    b.emit(Op::Return { src: 2 });
    b
}

/// f0 madd(a, b) = a * b + 1, with a dead store to r3 at offset 0
pub fn dead_store_program() -> Program {
    let mut b = BytecodeBuilder::new("madd", 2, 5);
    b.emit(Op::LoadInt { dst: 3, value: 9 });
    b.emit(Op::Binary {
        op: BinaryOp::Mul,
        dst: 2,
        lhs: 0,
        rhs: 1,
    });
    b.emit(Op::LoadInt { dst: 3, value: 1 });
    b.emit(Op::Binary {
        op: BinaryOp::Add,
        dst: 2,
        lhs: 2,
        rhs: 3,
    });
    b.emit(Op::Return { src: 2 });
    Program::new(vec![b.finish(FuncId(0)).unwrap()], vec![]).unwrap()
}

/// f0 sum(n): s = 0; i = 0; while (i < n) { s = s + i; i = i + 1 } return s
///
/// The loop header is at offset 3.
pub fn sum_program() -> Program {
    let mut b = BytecodeBuilder::new("sum", 1, 5);
    let head = b.label();
    let exit = b.label();
    b.emit(Op::LoadInt { dst: 1, value: 0 });
    b.emit(Op::LoadInt { dst: 2, value: 0 });
    b.emit(Op::LoadInt { dst: 4, value: 1 });
    b.bind(head);
    b.emit(Op::Binary {
        op: BinaryOp::Lt,
        dst: 3,
        lhs: 2,
        rhs: 0,
    });
    b.jump_if_false(3, exit);
    b.emit(Op::Binary {
        op: BinaryOp::Add,
        dst: 1,
        lhs: 1,
        rhs: 2,
    });
    b.emit(Op::Binary {
        op: BinaryOp::Add,
        dst: 2,
        lhs: 2,
        rhs: 4,
    });
    b.jump(head);
    b.bind(exit);
    b.emit(Op::Return { src: 1 });
    Program::new(vec![b.finish(FuncId(0)).unwrap()], vec![]).unwrap()
}

pub const SUM_LOOP_HEADER: u32 = 3;

/// f0 pick(a, b): if (a < b) return b - a; else return a * b
pub fn branch_program() -> Program {
    let mut b = BytecodeBuilder::new("pick", 2, 4);
    let other = b.label();
    b.emit(Op::Binary {
        op: BinaryOp::Lt,
        dst: 2,
        lhs: 0,
        rhs: 1,
    });
    b.jump_if_false(2, other);
    b.emit(Op::Binary {
        op: BinaryOp::Sub,
        dst: 3,
        lhs: 1,
        rhs: 0,
    });
    b.emit(Op::Return { src: 3 });
    b.bind(other);
    b.emit(Op::Binary {
        op: BinaryOp::Mul,
        dst: 3,
        lhs: 0,
        rhs: 1,
    });
    b.emit(Op::Return { src: 3 });
    Program::new(vec![b.finish(FuncId(0)).unwrap()], vec![]).unwrap()
}

/// f0 outer(x) = mid(x) * 2; f1 mid(x) = leaf(x) + 1; f2 leaf(x) = x + x
pub fn nested_program() -> Program {
    let mut o = BytecodeBuilder::new("outer", 1, 5);
    o.emit(Op::LoadFunction { dst: 1, func: FuncId(1) });
    o.emit(Op::Move { dst: 2, src: 0 });
    o.emit(Op::Call {
        dst: 3,
        callee: 1,
        this: 1,
        first_arg: 2,
        argc: 1,
    });
    o.emit(Op::LoadInt { dst: 4, value: 2 });
    o.emit(Op::Binary {
        op: BinaryOp::Mul,
        dst: 3,
        lhs: 3,
        rhs: 4,
    });
    o.emit(Op::Return { src: 3 });

    let mut m = BytecodeBuilder::new("mid", 1, 5);
    m.emit(Op::LoadFunction { dst: 1, func: FuncId(2) });
    m.emit(Op::Move { dst: 2, src: 0 });
    m.emit(Op::Call {
        dst: 3,
        callee: 1,
        this: 1,
        first_arg: 2,
        argc: 1,
    });
    m.emit(Op::LoadInt { dst: 4, value: 1 });
    m.emit(Op::Binary {
        op: BinaryOp::Add,
        dst: 3,
        lhs: 3,
        rhs: 4,
    });
    m.emit(Op::Return { src: 3 });

    let mut l = BytecodeBuilder::new("leaf", 1, 2);
    l.emit(Op::Binary {
        op: BinaryOp::Add,
        dst: 1,
        lhs: 0,
        rhs: 0,
    });
    l.emit(Op::Return { src: 1 });

    Program::new(
        vec![
            o.finish(FuncId(0)).unwrap(),
            m.finish(FuncId(1)).unwrap(),
            l.finish(FuncId(2)).unwrap(),
        ],
        vec![],
    )
    .unwrap()
}

/// Offset of the call in `nested_program`'s outer and mid
pub const NESTED_CALL_OFFSET: u32 = 2;

/// f0 guarded(a): r4 = 100; try { r2 = thrower(a) } catch (e) { return e + r4 } return r2
/// f1 thrower(a): if (a < 10) return a + 1; throw a
pub fn try_catch_program() -> Program {
    let mut g = BytecodeBuilder::new("guarded", 1, 6);
    let handler = g.label();
    g.emit(Op::LoadInt { dst: 4, value: 100 });
    g.emit(Op::LoadFunction { dst: 1, func: FuncId(1) });
    g.emit(Op::Move { dst: 3, src: 0 });
    g.enter_try(handler);
    g.emit(Op::Call {
        dst: 2,
        callee: 1,
        this: 1,
        first_arg: 3,
        argc: 1,
    });
    g.emit(Op::LeaveTry);
    g.emit(Op::Return { src: 2 });
    g.bind(handler);
    g.emit(Op::Catch { dst: 5 });
    g.emit(Op::Binary {
        op: BinaryOp::Add,
        dst: 5,
        lhs: 5,
        rhs: 4,
    });
    g.emit(Op::Return { src: 5 });

    let mut t = BytecodeBuilder::new("thrower", 1, 3);
    let throw = t.label();
    t.emit(Op::LoadInt { dst: 1, value: 10 });
    t.emit(Op::Binary {
        op: BinaryOp::Lt,
        dst: 2,
        lhs: 0,
        rhs: 1,
    });
    t.jump_if_false(2, throw);
    t.emit(Op::LoadInt { dst: 1, value: 1 });
    t.emit(Op::Binary {
        op: BinaryOp::Add,
        dst: 2,
        lhs: 0,
        rhs: 1,
    });
    t.emit(Op::Return { src: 2 });
    t.bind(throw);
    t.emit(Op::Throw { src: 0 });

    Program::new(vec![g.finish(FuncId(0)).unwrap(), t.finish(FuncId(1)).unwrap()], vec![]).unwrap()
}

/// f0 make(v): p = new Point(v); s = p.x; delete p.x; return s + p.y
/// f1 Point(v): this.x = v; this.y = v * 3; return this.y
pub fn constructor_program() -> Program {
    let (x, y) = (NameId(0), NameId(1));
    let mut m = BytecodeBuilder::new("make", 1, 6);
    m.emit(Op::LoadFunction { dst: 1, func: FuncId(1) });
    m.emit(Op::Move { dst: 2, src: 0 });
    m.emit(Op::New {
        dst: 3,
        callee: 1,
        first_arg: 2,
        argc: 1,
    });
    m.emit(Op::GetProp { dst: 4, obj: 3, name: x });
    m.emit(Op::DeleteProp { obj: 3, name: x });
    m.emit(Op::GetProp { dst: 5, obj: 3, name: y });
    m.emit(Op::Binary {
        op: BinaryOp::Add,
        dst: 4,
        lhs: 4,
        rhs: 5,
    });
    m.emit(Op::Return { src: 4 });

    let mut p = BytecodeBuilder::new("Point", 1, 3);
    p.emit(Op::LoadThis { dst: 1 });
    p.emit(Op::SetProp {
        obj: 1,
        name: x,
        value: 0,
    });
    p.emit(Op::LoadInt { dst: 2, value: 3 });
    p.emit(Op::Binary {
        op: BinaryOp::Mul,
        dst: 2,
        lhs: 0,
        rhs: 2,
    });
    p.emit(Op::SetProp {
        obj: 1,
        name: y,
        value: 2,
    });
    p.emit(Op::Return { src: 2 });

    Program::new(
        vec![m.finish(FuncId(0)).unwrap(), p.finish(FuncId(1)).unwrap()],
        vec!["x".to_string(), "y".to_string()],
    )
    .unwrap()
}

//! Generic operator semantics shared by the interpreter and compiled code

use crate::bytecode::BinaryOp;
use crate::error::ExecError;
use crate::interp::value::Value;

use super::Host;

/// Numeric conversion of a primitive; objects must go through `to_number`
pub fn primitive_to_number(v: Value) -> f64 {
    if let Some(n) = v.as_f64() {
        n
    } else if let Some(b) = v.as_bool() {
        if b {
            1.0
        } else {
            0.0
        }
    } else if v.is_null() {
        0.0
    } else {
        f64::NAN
    }
}

/// Numeric conversion; objects run their `valueOf` method
pub fn to_number<H: Host + ?Sized>(host: &mut H, v: Value) -> Result<f64, ExecError> {
    let Some(obj) = v.as_object() else {
        return Ok(primitive_to_number(v));
    };
    let Some(name) = host.program().lookup_name("valueOf") else {
        return Ok(f64::NAN);
    };
    let method = match host.heap().get(obj, name) {
        Some((_, method)) if method.as_function().is_some() => method,
        _ => return Ok(f64::NAN),
    };
    host.implicit_call();
    let result = host.call(method, v, &[])?;
    if result.as_object().is_some() {
        return Ok(f64::NAN);
    }
    Ok(primitive_to_number(result))
}

pub fn to_int32(n: f64) -> i32 {
    if !n.is_finite() {
        return 0;
    }
    let m = n.trunc().rem_euclid(4_294_967_296.0);
    m as u64 as u32 as i32
}

/// Numeric result of `op` once both operands are numbers
pub fn numeric(op: BinaryOp, a: f64, b: f64) -> Value {
    match op {
        BinaryOp::Add => Value::number(a + b),
        BinaryOp::Sub => Value::number(a - b),
        BinaryOp::Mul => Value::number(a * b),
        BinaryOp::Div => Value::number(a / b),
        BinaryOp::BitOr => Value::int(to_int32(a) | to_int32(b)),
        BinaryOp::Lt => Value::bool(a < b),
        BinaryOp::Le => Value::bool(a <= b),
        BinaryOp::StrictEq => Value::bool(a == b),
    }
}

/// Full semantics of a binary operator
pub fn binary<H: Host + ?Sized>(host: &mut H, op: BinaryOp, lhs: Value, rhs: Value) -> Result<Value, ExecError> {
    if op == BinaryOp::StrictEq {
        return Ok(Value::bool(lhs.strict_equals(rhs)));
    }
    let a = to_number(host, lhs)?;
    let b = to_number(host, rhs)?;
    Ok(numeric(op, a, b))
}

/// Whether an arithmetic op stayed within int32 for the profile
pub fn int_only(op: BinaryOp, lhs: Value, rhs: Value, result: Value) -> bool {
    lhs.is_int() && rhs.is_int() && (op.is_compare() || result.is_int())
}

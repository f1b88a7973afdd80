//! NaN-boxed script values
//!
//! Every value fits in 64 bits. Doubles are stored as-is (NaN canonicalized
//! to the positive quiet NaN); everything else lives in the negative quiet
//! NaN space with a 3-bit tag in bits 48..51 and a 48-bit payload.

use std::fmt;

use crate::bytecode::FuncId;
use crate::interp::heap::ObjId;

/// Base of the boxed value space (sign + exponent + quiet bit)
pub const NAN_BOX_BASE: u64 = 0xFFF8_0000_0000_0000;
/// Bit position of the type tag
pub const TAG_SHIFT: u64 = 48;
/// Mask selecting the tag bits
pub const TAG_MASK: u64 = 0x7 << TAG_SHIFT;
/// Mask selecting the payload bits
pub const PAYLOAD_MASK: u64 = 0x0000_FFFF_FFFF_FFFF;

const TAG_OBJECT: u64 = 0;
const TAG_I32: u64 = 1;
const TAG_BOOL: u64 = 2;
const TAG_UNDEFINED: u64 = 3;
const TAG_FUNCTION: u64 = 4;
const TAG_ERROR: u64 = 5;
const TAG_NULL: u64 = 6;

const CANONICAL_NAN: u64 = 0x7FF8_0000_0000_0000;

/// Runtime errors raised by the engine itself (thrown as values)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ErrorKind {
    NotAFunction = 1,
    NotAnObject = 2,
    StackOverflow = 3,
}

impl ErrorKind {
    fn from_code(code: u64) -> Option<Self> {
        match code {
            1 => Some(ErrorKind::NotAFunction),
            2 => Some(ErrorKind::NotAnObject),
            3 => Some(ErrorKind::StackOverflow),
            _ => None,
        }
    }
}

/// A script value
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Value(u64);

impl Value {
    pub const UNDEFINED: Value = Value::boxed(TAG_UNDEFINED, 0);
    pub const NULL: Value = Value::boxed(TAG_NULL, 0);
    pub const TRUE: Value = Value::boxed(TAG_BOOL, 1);
    pub const FALSE: Value = Value::boxed(TAG_BOOL, 0);

    const fn boxed(tag: u64, payload: u64) -> Value {
        Value(NAN_BOX_BASE | (tag << TAG_SHIFT) | (payload & PAYLOAD_MASK))
    }

    pub fn from_bits(bits: u64) -> Value {
        Value(bits)
    }

    pub fn bits(self) -> u64 {
        self.0
    }

    pub fn int(v: i32) -> Value {
        Value::boxed(TAG_I32, v as u32 as u64)
    }

    /// A raw double (never re-tagged as int)
    pub fn float(v: f64) -> Value {
        if v.is_nan() {
            Value(CANONICAL_NAN)
        } else {
            Value(v.to_bits())
        }
    }

    /// A numeric result: stored as int32 when exact and not negative zero
    pub fn number(v: f64) -> Value {
        if v.fract() == 0.0
            && v >= i32::MIN as f64
            && v <= i32::MAX as f64
            && !(v == 0.0 && v.is_sign_negative())
        {
            Value::int(v as i32)
        } else {
            Value::float(v)
        }
    }

    pub fn bool(v: bool) -> Value {
        if v {
            Value::TRUE
        } else {
            Value::FALSE
        }
    }

    pub fn object(id: ObjId) -> Value {
        Value::boxed(TAG_OBJECT, id.0 as u64)
    }

    pub fn function(id: FuncId) -> Value {
        Value::boxed(TAG_FUNCTION, id.0 as u64)
    }

    pub fn error(kind: ErrorKind) -> Value {
        Value::boxed(TAG_ERROR, kind as u64)
    }

    fn is_boxed(self) -> bool {
        self.0 & NAN_BOX_BASE == NAN_BOX_BASE
    }

    fn tag(self) -> Option<u64> {
        if self.is_boxed() {
            Some((self.0 & TAG_MASK) >> TAG_SHIFT)
        } else {
            None
        }
    }

    fn payload(self) -> u64 {
        self.0 & PAYLOAD_MASK
    }

    pub fn as_int(self) -> Option<i32> {
        (self.tag() == Some(TAG_I32)).then(|| self.payload() as u32 as i32)
    }

    pub fn is_int(self) -> bool {
        self.tag() == Some(TAG_I32)
    }

    pub fn is_number(self) -> bool {
        !self.is_boxed() || self.is_int()
    }

    /// Numeric view of ints and doubles
    pub fn as_f64(self) -> Option<f64> {
        match self.tag() {
            None => Some(f64::from_bits(self.0)),
            Some(TAG_I32) => Some(self.payload() as u32 as i32 as f64),
            _ => None,
        }
    }

    pub fn as_bool(self) -> Option<bool> {
        (self.tag() == Some(TAG_BOOL)).then(|| self.payload() != 0)
    }

    pub fn as_object(self) -> Option<ObjId> {
        (self.tag() == Some(TAG_OBJECT)).then(|| ObjId(self.payload() as u32))
    }

    pub fn as_function(self) -> Option<FuncId> {
        (self.tag() == Some(TAG_FUNCTION)).then(|| FuncId(self.payload() as u32))
    }

    pub fn as_error(self) -> Option<ErrorKind> {
        if self.tag() == Some(TAG_ERROR) {
            ErrorKind::from_code(self.payload())
        } else {
            None
        }
    }

    pub fn is_undefined(self) -> bool {
        self == Value::UNDEFINED
    }

    pub fn is_null(self) -> bool {
        self == Value::NULL
    }

    /// ToBoolean
    pub fn to_boolean(self) -> bool {
        match self.tag() {
            None => {
                let f = f64::from_bits(self.0);
                f != 0.0 && !f.is_nan()
            }
            Some(TAG_I32) => self.payload() as u32 != 0,
            Some(TAG_BOOL) => self.payload() != 0,
            Some(TAG_UNDEFINED) | Some(TAG_NULL) => false,
            Some(_) => true,
        }
    }

    /// `===` semantics: numbers compare numerically, everything else by identity
    pub fn strict_equals(self, other: Value) -> bool {
        match (self.as_f64(), other.as_f64()) {
            (Some(a), Some(b)) => a == b,
            (None, None) => self.0 == other.0,
            _ => false,
        }
    }
}

impl Default for Value {
    fn default() -> Self {
        Value::UNDEFINED
    }
}

impl fmt::Debug for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.tag() {
            None => write!(f, "{:?}", f64::from_bits(self.0)),
            Some(TAG_I32) => write!(f, "{}", self.payload() as u32 as i32),
            Some(TAG_BOOL) => write!(f, "{}", self.payload() != 0),
            Some(TAG_UNDEFINED) => write!(f, "undefined"),
            Some(TAG_NULL) => write!(f, "null"),
            Some(TAG_OBJECT) => write!(f, "obj#{}", self.payload()),
            Some(TAG_FUNCTION) => write!(f, "fn#{}", self.payload()),
            Some(TAG_ERROR) => write!(f, "error({:?})", self.as_error()),
            Some(t) => write!(f, "<tag {}>", t),
        }
    }
}

impl fmt::Display for Value {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

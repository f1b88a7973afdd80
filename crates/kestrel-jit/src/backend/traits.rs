//! Target-agnostic machine instructions and the `Target` capability trait
//!
//! The emitter produces `MInst`s over registers and stack slots. A target
//! legalizes them into forms it can encode, turns them into bytes, and can
//! decode its own bytes back for execution.

use crate::bailout::BailoutError;
use crate::bytecode::BinaryOp;
use crate::interp::value::Value;

/// Storage of one value in an optimized frame
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Loc {
    Reg(u8),
    Stack(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operand {
    Loc(Loc),
    /// Constant embedded in the instruction
    Imm(Value),
}

impl From<Loc> for Operand {
    fn from(loc: Loc) -> Self {
        Operand::Loc(loc)
    }
}

/// What a post-op check watches for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Watch {
    /// Any `valueOf` ran during the op
    ImplicitCalls,
    /// A shape was invalidated during the op
    ShapeEpoch,
}

/// Leave through `exit` after the op if `watch` changed
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PostCheck {
    pub exit: u32,
    pub watch: Watch,
}

/// Machine instruction. Branch and exit targets are labels until layout,
/// then instruction indices.
#[derive(Debug, Clone, PartialEq)]
pub enum MInst {
    Mov { dst: Loc, src: Operand },
    LoadParam { dst: Loc, index: u16 },
    /// Interpreter register handed over at a loop entry
    LoadIncoming { dst: Loc, reg: u16 },
    LoadThis { dst: Loc },
    ArgCount { dst: Loc },
    LoadArg { dst: Loc, index: Operand },
    Binary {
        op: BinaryOp,
        dst: Loc,
        lhs: Operand,
        rhs: Operand,
        on_throw: Option<u32>,
        post: Option<PostCheck>,
    },
    /// Int32 arithmetic; `overflow` and `negzero` are exits taken when the
    /// exact result is not an int32 or is negative zero
    IntBinary {
        op: BinaryOp,
        dst: Loc,
        lhs: Operand,
        rhs: Operand,
        overflow: Option<u32>,
        negzero: Option<u32>,
    },
    Not { dst: Loc, src: Operand },
    CheckInt { value: Operand, exit: u32 },
    CheckShape { obj: Operand, shape: u32, exit: u32 },
    CheckCallTarget { callee: Operand, func: u32, exit: u32 },
    IsFunction { dst: Loc, value: Operand, func: u32 },
    LoadProp { dst: Loc, obj: Operand, name: u32, on_throw: Option<u32> },
    LoadSlot { dst: Loc, obj: Operand, slot: u32 },
    StoreProp { obj: Operand, name: u32, value: Operand, on_throw: Option<u32> },
    StoreSlot { obj: Operand, slot: u32, value: Operand },
    DeleteProp { obj: Operand, name: u32, on_throw: Option<u32> },
    NewObject { dst: Loc },
    Call {
        dst: Loc,
        callee: Operand,
        /// Absent for `new`, which allocates the receiver
        this: Option<Operand>,
        args: Vec<Operand>,
        on_throw: Option<u32>,
        post: Option<PostCheck>,
        /// Byte-code offset whose call-target profile this call feeds
        site: Option<u32>,
    },
    CtorResult { dst: Loc, value: Operand, this: Operand },
    Throw { value: Operand, on_throw: Option<u32> },
    Jump { target: u32 },
    Branch { cond: Operand, then_target: u32, else_target: u32 },
    Return { value: Operand },
    /// Exit stub: save registers and leave through bailout record `record`
    Exit { record: u32 },
    /// Reaching this is a compiler bug
    Trap,
}

impl MInst {
    /// Rewrite every branch and exit target
    pub fn map_targets(&mut self, mut f: impl FnMut(u32) -> u32) {
        let map_opt = |t: &mut Option<u32>, f: &mut dyn FnMut(u32) -> u32| {
            if let Some(t) = t {
                *t = f(*t);
            }
        };
        match self {
            MInst::Binary { on_throw, post, .. } | MInst::Call { on_throw, post, .. } => {
                map_opt(on_throw, &mut f);
                if let Some(p) = post {
                    p.exit = f(p.exit);
                }
            }
            MInst::IntBinary { overflow, negzero, .. } => {
                map_opt(overflow, &mut f);
                map_opt(negzero, &mut f);
            }
            MInst::CheckInt { exit, .. }
            | MInst::CheckShape { exit, .. }
            | MInst::CheckCallTarget { exit, .. } => *exit = f(*exit),
            MInst::LoadProp { on_throw, .. }
            | MInst::StoreProp { on_throw, .. }
            | MInst::DeleteProp { on_throw, .. }
            | MInst::Throw { on_throw, .. } => map_opt(on_throw, &mut f),
            MInst::Jump { target } => *target = f(*target),
            MInst::Branch {
                then_target,
                else_target,
                ..
            } => {
                *then_target = f(*then_target);
                *else_target = f(*else_target);
            }
            _ => {}
        }
    }

    pub fn is_terminator(&self) -> bool {
        matches!(
            self,
            MInst::Jump { .. } | MInst::Branch { .. } | MInst::Return { .. } | MInst::Exit { .. } | MInst::Trap
        )
    }
}

/// Target architecture
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetArch {
    /// Byte-encoded register machine run by `backend::machine`
    Portable,
}

/// Target information
#[derive(Debug, Clone)]
pub struct TargetInfo {
    pub arch: TargetArch,
    pub pointer_size: usize,
}

/// Registers a target offers to the emitter
#[derive(Debug, Clone)]
pub struct CallingConvention {
    /// Registers that may hold symbols, in allocation order
    pub allocatable: Vec<u8>,
    /// Reserved for legalization
    pub scratch: u8,
    /// Size of the register save area filled by exit stubs
    pub save_area: usize,
}

/// Error during code generation
#[derive(Debug, thiserror::Error)]
pub enum CodegenError {
    #[error("Unsupported instruction: {0}")]
    UnsupportedInstruction(String),
    #[error("Bad encoding at byte {0}")]
    Decode(usize),
    #[error("Code truncated at byte {0}")]
    Truncated(usize),
    #[error("No bailout descriptor on {0}")]
    MissingBailout(String),
    #[error("Malformed IR: {0}")]
    Malformed(String),
    #[error("Code memory exhausted: {0} bytes requested")]
    OutOfCodeMemory(usize),
    #[error("Frame needs {0} stack slots")]
    FrameTooLarge(usize),
    #[error(transparent)]
    Bailout(#[from] BailoutError),
}

/// What the emitter needs from a code generation target
pub trait Target: Send + Sync + 'static {
    fn info(&self) -> TargetInfo;

    fn calling_convention(&self) -> CallingConvention;

    /// Rewrite one instruction into forms `encode` accepts
    fn legalize(&self, inst: MInst) -> Vec<MInst>;

    /// Append the encoding of `inst` to `out`
    fn encode(&self, inst: &MInst, out: &mut Vec<u8>) -> Result<(), CodegenError>;

    /// Decode a whole code buffer
    fn decode(&self, code: &[u8]) -> Result<Vec<MInst>, CodegenError>;
}

/// Target compiled for on this build
pub type HostTarget = super::portable::PortableTarget;

//! Optimizer IR: blocks of instructions over symbols
//!
//! Every byte-code register of every logical frame is one symbol; the lifter
//! adds temporaries for outgoing arguments and inlinee results. Instructions
//! remember the byte-code offset and frame they came from so bailouts can
//! rebuild interpreter state.

pub mod builder;
pub mod display;
pub mod instr;

pub use builder::IrBuilder;
pub use instr::{Block, BlockId, EntryKind, FrameIdx, Inst, InstKind, IrFunc, SymId, SymInfo, Terminator};

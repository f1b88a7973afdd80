//! Code generation: target capabilities, emitter and the portable machine

pub mod lowering;
pub mod machine;
pub mod memory;
pub mod portable;
pub mod traits;

pub use lowering::{emit, CompiledBody};
pub use machine::{execute, Activation, BailoutExit, MachineExit, MachineHost};
pub use memory::{CodeAllocator, CodeRegion, HeapCodeAllocator};
pub use portable::PortableTarget;
pub use traits::{
    CallingConvention, CodegenError, HostTarget, Loc, MInst, Operand, PostCheck, Target, TargetArch, TargetInfo,
    Watch,
};

//! Kestrel optimizing JIT tier
//!
//! This crate provides the speculative tier of the Kestrel script engine and
//! the safety net that makes speculation sound:
//! - **Scheduler**: background compile queue with coalescing, cancellation
//!   and a foreground fallback (`scheduler` module)
//! - **Pipeline**: lifting, inlining, optimization and the backward
//!   liveness/bailout pass (`pipeline` and `analysis` modules)
//! - **Bailouts**: descriptors, frozen records, the global bailout table and
//!   inlined frame records (`bailout` module)
//! - **Backend**: the `Target` trait, a portable target and the emitter that
//!   wires guards to exit stubs (`backend` module)
//! - **Runtime**: installed entry points, frame recovery and rejit policy
//!   (`runtime` and `engine` modules)
//!
//! The byte code, object model and interpreter (`bytecode`, `interp`) are the
//! small collaborators the tier needs to run.
//!
//! # Example
//!
//! ```rust,ignore
//! use kestrel_jit::{Engine, JitConfig};
//!
//! let mut engine = Engine::new(program, JitConfig::default())?;
//! let result = engine.run(FuncId(0), &[Value::int(20), Value::int(22)])?;
//! ```

#![warn(rust_2018_idioms)]
#![allow(clippy::new_without_default)]
#![allow(clippy::len_without_is_empty)]

// ============================================================================
// Collaborators
// ============================================================================

/// Register byte code, programs and the builder
pub mod bytecode;

/// Values, heap and the reference interpreter
pub mod interp;

/// Call, loop and value profiles; tier policy
pub mod profiling;

// ============================================================================
// Optimizing tier
// ============================================================================

/// Optimizer IR
pub mod ir;

/// Control flow, resume liveness and the backward pass
pub mod analysis;

/// Bailout descriptors, records, tables and frame records
pub mod bailout;

/// Lifting, inlining, optimization passes and compile jobs
pub mod pipeline;

/// Machine instructions, targets and code emission
pub mod backend;

/// Entry points, recovery, site statistics
pub mod runtime;

/// Background compilation
pub mod scheduler;

// ============================================================================
// Top level
// ============================================================================

pub mod config;
pub mod engine;
pub mod error;

pub use bytecode::{FuncId, FunctionBody, Program};
pub use config::{ConfigError, JitConfig};
pub use engine::Engine;
pub use error::ExecError;
pub use interp::value::Value;
pub use profiling::Tier;

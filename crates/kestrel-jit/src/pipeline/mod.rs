//! Compilation pipeline: byte code → IR → optimized IR → machine code
//!
//! The pipeline chains together all compilation stages:
//! 1. Lift the function (or loop body) to IR, speculating on profiles
//! 2. Inline hot call sites (full tier only)
//! 3. Run forward optimization passes
//! 4. Backward pass: liveness, dead stores, bailout captures
//! 5. Emit code, freezing bailout records
//!
//! Cancellation is polled between stages. Limits are checked before any
//! work is done and again once inlining has grown the IR.

pub mod context;
pub mod inline;
pub mod job;
pub mod lifter;
pub mod optimize;

use crate::analysis::{AnalysisError, BackwardPass};
use crate::backend::{emit, CodegenError, CompiledBody, Target};
use crate::bytecode::Program;
use crate::config::JitConfig;
use crate::profiling::{ProgramProfile, Tier};
use crate::runtime::entry::EntryKey;
use crate::runtime::stats::OverrideSnapshot;
use crate::scheduler::CancellationToken;

use self::context::CompileContext;
use self::inline::Inliner;
use self::lifter::{lift_function, LiftError};
use self::optimize::JitOptimizer;

pub use job::JitJob;

/// Errors from the compilation pipeline
#[derive(Debug, thiserror::Error)]
pub enum JitError {
    #[error("Lift error: {0}")]
    Lift(#[from] LiftError),
    #[error("Analysis error: {0}")]
    Analysis(#[from] AnalysisError),
    #[error("Codegen error: {0}")]
    Codegen(#[from] CodegenError),
}

/// Limit a work item ran into
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Abandon {
    FunctionTooLarge(usize),
    TooManyParameters(u16),
    IrTooLarge(usize),
    FrameTooLarge(usize),
    OutOfCodeMemory(usize),
}

#[derive(Debug)]
pub enum CompileOutcome {
    Compiled(CompiledBody),
    /// Over a configured limit; the function stays on its tier
    Abandoned(Abandon),
    Cancelled,
}

/// Inputs of one compile
pub struct CompileRequest<'a> {
    pub program: &'a Program,
    pub profiles: &'a ProgramProfile,
    pub config: &'a JitConfig,
    pub overrides: &'a OverrideSnapshot,
    pub key: EntryKey,
    pub tier: Tier,
}

/// Complete JIT compilation pipeline
pub struct JitPipeline<T: Target> {
    target: T,
    optimizer: JitOptimizer,
}

impl<T: Target> JitPipeline<T> {
    /// Create a new pipeline with the default optimizer
    pub fn new(target: T) -> Self {
        JitPipeline {
            target,
            optimizer: JitOptimizer::new(),
        }
    }

    /// Create a pipeline with a custom optimizer
    pub fn with_optimizer(target: T, optimizer: JitOptimizer) -> Self {
        JitPipeline { target, optimizer }
    }

    pub fn target(&self) -> &T {
        &self.target
    }

    pub fn optimizer(&self) -> &JitOptimizer {
        &self.optimizer
    }

    /// Compile one entry point
    pub fn compile(&self, req: &CompileRequest<'_>, token: &CancellationToken) -> Result<CompileOutcome, JitError> {
        let key = req.key;
        let limits = &req.config.limits;
        let body = req
            .program
            .function(key.func)
            .ok_or(LiftError::UnknownFunction(key.func))?;
        if body.len() > limits.max_function_size {
            return Ok(self.abandon(key, Abandon::FunctionTooLarge(body.len())));
        }
        if body.param_count > limits.max_args {
            return Ok(self.abandon(key, Abandon::TooManyParameters(body.param_count)));
        }
        if token.is_cancelled() {
            return Ok(CompileOutcome::Cancelled);
        }

        let mut ctx = CompileContext::new(req.program, req.profiles, req.config, req.overrides, req.tier);
        let mut ir = lift_function(&mut ctx, key.func, key.entry)?;
        if token.is_cancelled() {
            return Ok(CompileOutcome::Cancelled);
        }

        if ctx.tier.speculates() && req.config.phases.inlining {
            let stats = Inliner::new(&mut ctx).run(&mut ir);
            tracing::debug!(
                entry = %key,
                inlined = stats.inlined,
                polymorphic = stats.polymorphic,
                rejected = stats.rejected,
                rolled_back = stats.rolled_back,
                "inlining done"
            );
        }
        let size = ir.inst_count();
        if size > limits.max_ir_size {
            return Ok(self.abandon(key, Abandon::IrTooLarge(size)));
        }
        if token.is_cancelled() {
            return Ok(CompileOutcome::Cancelled);
        }

        self.optimizer.optimize(&ctx, &mut ir);
        if token.is_cancelled() {
            return Ok(CompileOutcome::Cancelled);
        }

        let stats = BackwardPass::new(&mut ctx).run(&mut ir)?;
        tracing::debug!(
            entry = %key,
            removed = stats.removed,
            pruned = stats.pruned_blocks,
            escalated = stats.escalated,
            shared = stats.shared,
            "backward pass done"
        );
        tracing::trace!("{}", ir);
        if token.is_cancelled() {
            return Ok(CompileOutcome::Cancelled);
        }

        let compiled = match emit(&self.target, &mut ir) {
            Err(CodegenError::FrameTooLarge(slots)) => return Ok(self.abandon(key, Abandon::FrameTooLarge(slots))),
            other => other?,
        };
        tracing::debug!(
            entry = %key,
            tier = ?req.tier,
            insts = compiled.inst_count,
            bailouts = compiled.records.len(),
            bytes = compiled.code.len(),
            "compiled"
        );
        Ok(CompileOutcome::Compiled(compiled))
    }

    fn abandon(&self, key: EntryKey, why: Abandon) -> CompileOutcome {
        tracing::debug!(entry = %key, reason = ?why, "compile abandoned");
        CompileOutcome::Abandoned(why)
    }
}

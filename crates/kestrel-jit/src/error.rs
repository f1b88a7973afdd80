//! Errors surfaced while running script code

use thiserror::Error;

use crate::backend::CodegenError;
use crate::bytecode::FuncId;
use crate::interp::value::Value;
use crate::runtime::recovery::RecoveryError;

/// Result of executing script code
#[derive(Debug, Error)]
pub enum ExecError {
    /// A script exception that no handler caught
    #[error("uncaught exception: {0}")]
    Thrown(Value),

    #[error("unknown function {0}")]
    UnknownFunction(FuncId),

    /// Bailout state could not be rebuilt; never turned into a script exception
    #[error("bailout recovery failed: {0}")]
    Recovery(#[from] RecoveryError),

    #[error("compiled code is malformed: {0}")]
    Codegen(#[from] CodegenError),
}

impl ExecError {
    /// Whether a script `catch` can observe this error
    pub fn is_catchable(&self) -> bool {
        matches!(self, ExecError::Thrown(_))
    }

    pub fn thrown(&self) -> Option<Value> {
        match self {
            ExecError::Thrown(v) => Some(*v),
            _ => None,
        }
    }
}

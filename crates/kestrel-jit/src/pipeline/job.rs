//! Compile work item for the scheduler

use std::sync::Arc;

use crate::backend::Target;
use crate::bytecode::Program;
use crate::config::JitConfig;
use crate::profiling::{ProgramProfile, Tier};
use crate::runtime::entry::EntryKey;
use crate::runtime::stats::OverrideSnapshot;
use crate::scheduler::{CancellationToken, CompileJob};

use super::{CompileOutcome, CompileRequest, JitError, JitPipeline};

/// Everything a worker needs to compile one entry point. The overrides are
/// copied when the job is created, so a compile never sees a half-applied
/// relaxation.
pub struct JitJob<T: Target> {
    pub key: EntryKey,
    pub tier: Tier,
    pub program: Arc<Program>,
    pub profiles: Arc<ProgramProfile>,
    pub config: Arc<JitConfig>,
    pub overrides: OverrideSnapshot,
    pub pipeline: Arc<JitPipeline<T>>,
}

impl<T: Target> CompileJob for JitJob<T> {
    type Output = Result<CompileOutcome, JitError>;

    fn key(&self) -> EntryKey {
        self.key
    }

    fn tier(&self) -> Tier {
        self.tier
    }

    fn compile(&self, token: &CancellationToken) -> Self::Output {
        let req = CompileRequest {
            program: &self.program,
            profiles: &self.profiles,
            config: &self.config,
            overrides: &self.overrides,
            key: self.key,
            tier: self.tier,
        };
        self.pipeline.compile(&req, token)
    }
}

//! Turning finished compiles into installed entry points

use std::io;
use std::sync::Arc;

use crate::backend::{CodeAllocator, CodegenError, CompiledBody, Target};
use crate::ir::EntryKind;
use crate::pipeline::{CompileOutcome, JitError, JitJob, JitPipeline};
use crate::profiling::{ProgramProfile, Tier};
use crate::scheduler::{Installer, Reclaimer};

use super::entry::{EntryPoint, EntryTable};

/// Places compiled code and swaps it into the entry table. Replaced bodies
/// go to the reclaimer.
pub struct EntryInstaller<T: Target> {
    pipeline: Arc<JitPipeline<T>>,
    entries: Arc<EntryTable>,
    allocator: Arc<dyn CodeAllocator>,
    profiles: Arc<ProgramProfile>,
    reclaimer: Reclaimer,
}

impl<T: Target> EntryInstaller<T> {
    pub fn new(
        pipeline: Arc<JitPipeline<T>>,
        entries: Arc<EntryTable>,
        allocator: Arc<dyn CodeAllocator>,
        profiles: Arc<ProgramProfile>,
    ) -> io::Result<Self> {
        let reclaimer = Reclaimer::start(allocator.clone())?;
        Ok(EntryInstaller {
            pipeline,
            entries,
            allocator,
            profiles,
            reclaimer,
        })
    }

    pub fn reclaimer(&self) -> &Reclaimer {
        &self.reclaimer
    }

    fn place(&self, body: CompiledBody, tier: Tier) -> Result<EntryPoint, CodegenError> {
        let region = self.allocator.allocate(&body.code)?;
        EntryPoint::new(self.pipeline.target(), body, tier, region)
    }

    /// Keep the function where it is; only function entries are marked, a
    /// loop entry is never requested twice anyway
    fn give_up(&self, job: &JitJob<T>) {
        if job.key.entry == EntryKind::Function {
            if let Some(profile) = self.profiles.get(job.key.func) {
                profile.mark_no_jit();
            }
        }
    }
}

impl<T: Target> Installer<JitJob<T>> for EntryInstaller<T> {
    fn install(&self, job: &JitJob<T>, output: Result<CompileOutcome, JitError>) {
        let key = job.key;
        match output {
            Ok(CompileOutcome::Compiled(body)) => {
                if self.entries.tier_of(key).is_some_and(|t| t > job.tier) {
                    tracing::debug!(entry = %key, tier = ?job.tier, "superseded by a higher tier");
                    return;
                }
                match self.place(body, job.tier) {
                    Ok(entry) => {
                        if let Some(old) = self.entries.install(entry) {
                            self.reclaimer.retire(old);
                        }
                    }
                    Err(CodegenError::OutOfCodeMemory(size)) => {
                        tracing::debug!(entry = %key, size, "compile abandoned: code memory exhausted");
                        self.give_up(job);
                    }
                    Err(e) => {
                        tracing::error!(entry = %key, error = %e, "compiled code rejected by target");
                        self.give_up(job);
                    }
                }
            }
            Ok(CompileOutcome::Abandoned(_)) => self.give_up(job),
            Ok(CompileOutcome::Cancelled) => {}
            Err(e) => {
                tracing::error!(entry = %key, error = %e, "compile failed");
                self.give_up(job);
            }
        }
    }
}

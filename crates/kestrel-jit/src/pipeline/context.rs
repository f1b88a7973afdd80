//! Read-only inputs shared by the stages of one compile

use std::sync::Arc;

use rustc_hash::FxHashMap;

use crate::analysis::resume::ResumeLiveness;
use crate::bytecode::{FuncId, FunctionBody, Offset, Program};
use crate::config::JitConfig;
use crate::profiling::{ProfileData, ProgramProfile, Tier};
use crate::runtime::stats::{OverrideSnapshot, Relax};

use super::lifter::LiftError;

pub struct CompileContext<'a> {
    pub program: &'a Program,
    pub profiles: &'a ProgramProfile,
    pub config: &'a JitConfig,
    pub overrides: &'a OverrideSnapshot,
    pub tier: Tier,
    pub liveness: ResumeLiveness<'a>,
    snapshots: FxHashMap<FuncId, Arc<ProfileData>>,
}

impl<'a> CompileContext<'a> {
    pub fn new(
        program: &'a Program,
        profiles: &'a ProgramProfile,
        config: &'a JitConfig,
        overrides: &'a OverrideSnapshot,
        tier: Tier,
    ) -> Self {
        CompileContext {
            program,
            profiles,
            config,
            overrides,
            tier,
            liveness: ResumeLiveness::new(program),
            snapshots: FxHashMap::default(),
        }
    }

    pub fn body(&self, func: FuncId) -> Result<&'a FunctionBody, LiftError> {
        self.program
            .function(func)
            .ok_or(LiftError::UnknownFunction(func))
    }

    /// Profile of `func`, copied once per compile so later stages agree
    pub fn profile(&mut self, func: FuncId) -> Arc<ProfileData> {
        let profiles = self.profiles;
        self.snapshots
            .entry(func)
            .or_insert_with(|| {
                Arc::new(
                    profiles
                        .get(func)
                        .map(|p| p.snapshot())
                        .unwrap_or_default(),
                )
            })
            .clone()
    }

    /// Whether the tier speculates and no override withholds `relax` here
    pub fn allows(&self, func: FuncId, offset: Offset, relax: Relax) -> bool {
        self.tier.speculates() && self.overrides.allows(func, offset, relax)
    }
}

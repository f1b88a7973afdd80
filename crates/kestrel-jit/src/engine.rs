//! Top-level engine: call dispatch, tier-up, loop entries and bailouts
//!
//! Every script call goes through `Engine::invoke`, which counts the call,
//! promotes hot functions, and runs the installed entry point if there is
//! one. Hot loops enter compiled loop bodies from the interpreter's back
//! edge. A bailout rebuilds interpreter frames and finishes the activation
//! in the interpreter; repeated bailouts at one site schedule a rejit with
//! that speculation relaxed.

use std::io;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use rustc_hash::FxHashSet;

use crate::backend::{execute, Activation, BailoutExit, CodeAllocator, HeapCodeAllocator, HostTarget, MachineExit, MachineHost};
use crate::bytecode::{FuncId, Program};
use crate::config::JitConfig;
use crate::error::ExecError;
use crate::interp::heap::Heap;
use crate::interp::value::{ErrorKind, Value};
use crate::interp::{self, Host, InterpreterFrame, LoopTransfer, RestoredState, Resume};
use crate::ir::EntryKind;
use crate::pipeline::{JitJob, JitPipeline};
use crate::profiling::{ProgramProfile, Tier, TierPolicy};
use crate::runtime::entry::{EntryKey, EntryPoint, EntryTable};
use crate::runtime::install::EntryInstaller;
use crate::runtime::recovery;
use crate::runtime::rejit::RejitPolicy;
use crate::runtime::stats::{SiteStats, SpeculationOverrides};
use crate::scheduler::{CompilationScheduler, Installer, SchedulerStats, Submitted, WaitOutcome};

/// Top-level engine running one program
pub struct Engine {
    program: Arc<Program>,
    profiles: Arc<ProgramProfile>,
    config: Arc<JitConfig>,
    heap: Heap,
    entries: Arc<EntryTable>,
    site_stats: SiteStats,
    overrides: SpeculationOverrides,
    tier_policy: TierPolicy,
    rejit: RejitPolicy,
    pipeline: Arc<JitPipeline<HostTarget>>,
    installer: Arc<EntryInstaller<HostTarget>>,
    scheduler: CompilationScheduler<JitJob<HostTarget>>,
    /// Loop entries already requested
    loop_requests: FxHashSet<EntryKey>,
    implicit_calls: u64,
    depth: usize,
}

impl Engine {
    /// Create an engine with the default code allocator
    pub fn new(program: Program, config: JitConfig) -> io::Result<Self> {
        Self::with_allocator(program, config, Arc::new(HeapCodeAllocator::default()))
    }

    pub fn with_allocator(program: Program, config: JitConfig, allocator: Arc<dyn CodeAllocator>) -> io::Result<Self> {
        let program = Arc::new(program);
        let profiles = Arc::new(ProgramProfile::new(program.functions.len()));
        let pipeline = Arc::new(JitPipeline::new(HostTarget::new()));
        let entries = Arc::new(EntryTable::new());
        let installer = Arc::new(EntryInstaller::new(
            pipeline.clone(),
            entries.clone(),
            allocator,
            profiles.clone(),
        )?);
        let sink: Arc<dyn Installer<JitJob<HostTarget>>> = installer.clone();
        let scheduler = CompilationScheduler::new(&config.scheduler, sink)?;
        Ok(Engine {
            tier_policy: TierPolicy::from_config(&config),
            rejit: RejitPolicy::new(config.rejit.bailout_threshold),
            config: Arc::new(config),
            program,
            profiles,
            heap: Heap::new(),
            entries,
            site_stats: SiteStats::new(),
            overrides: SpeculationOverrides::new(),
            pipeline,
            installer,
            scheduler,
            loop_requests: FxHashSet::default(),
            implicit_calls: 0,
            depth: 0,
        })
    }

    /// Call `func` with an undefined receiver
    pub fn run(&mut self, func: FuncId, args: &[Value]) -> Result<Value, ExecError> {
        self.invoke(func, Value::UNDEFINED, args)
    }

    /// Call `func` through the normal dispatch
    pub fn invoke(&mut self, func: FuncId, this: Value, args: &[Value]) -> Result<Value, ExecError> {
        if self.depth >= self.config.limits.max_call_depth {
            return Err(ExecError::Thrown(Value::error(ErrorKind::StackOverflow)));
        }
        self.depth += 1;
        let result = self.dispatch(func, this, args);
        self.depth -= 1;
        result
    }

    fn dispatch(&mut self, func: FuncId, this: Value, args: &[Value]) -> Result<Value, ExecError> {
        if self.config.enabled {
            self.count_call(func)?;
            if let Some(entry) = self.entries.get(EntryKey::function(func)) {
                return self.run_compiled(entry, this, args);
            }
        }
        interp::call_function(self, func, this, args)
    }

    fn count_call(&mut self, func: FuncId) -> Result<(), ExecError> {
        let size = self.program.function(func).ok_or(ExecError::UnknownFunction(func))?.len();
        let Some(profile) = self.profiles.get(func) else {
            return Ok(());
        };
        profile.record_call();
        if let Some(tier) = self.tier_policy.promotion(profile, size) {
            if profile.try_request(tier) {
                tracing::debug!(%func, ?tier, "promoting");
                self.submit(EntryKey::function(func), tier);
            }
        }
        Ok(())
    }

    /// Hand a compile to the scheduler
    pub fn submit(&self, key: EntryKey, tier: Tier) -> Submitted {
        let job = JitJob {
            key,
            tier,
            program: self.program.clone(),
            profiles: self.profiles.clone(),
            config: self.config.clone(),
            overrides: self.overrides.snapshot(),
            pipeline: self.pipeline.clone(),
        };
        let submitted = self.scheduler.add_work_item(job);
        tracing::trace!(entry = %key, ?tier, ?submitted, "compile requested");
        submitted
    }

    fn run_compiled(&mut self, entry: Arc<EntryPoint>, this: Value, args: &[Value]) -> Result<Value, ExecError> {
        let act = Activation {
            this,
            args,
            incoming: &[],
            profile: profiling_func(&entry),
        };
        match execute(self, &entry.code, entry.frame_size, act)? {
            MachineExit::Return(v) => Ok(v),
            MachineExit::Bailout(exit) => {
                let state = self.bail(&entry, exit, this, args)?;
                interp::resume(self, state)
            }
        }
    }

    /// Rebuild interpreter state for `exit` and apply the rejit policy
    fn bail(
        &mut self,
        entry: &EntryPoint,
        exit: BailoutExit,
        this: Value,
        args: &[Value],
    ) -> Result<RestoredState, ExecError> {
        entry.bailouts.fetch_add(1, Ordering::Relaxed);
        let state = recovery::restore(&self.program, entry, &exit, this, args).map_err(|e| {
            tracing::error!(entry = %entry.key, record = exit.record, error = %e, "bailout recovery failed");
            ExecError::Recovery(e)
        })?;

        if let Some(record) = entry.record(exit.record) {
            tracing::trace!(
                entry = %entry.key,
                offset = record.offset,
                kind = ?record.kind,
                reason = ?exit.reason.unwrap_or(record.reason),
                "bailout"
            );
            let relaxed = self.rejit.on_bailout(
                &self.site_stats,
                &self.overrides,
                &entry.frames,
                record,
                exit.reason,
            );
            if let Some(relaxed) = relaxed {
                tracing::info!(
                    entry = %entry.key,
                    func = %relaxed.site.func,
                    offset = relaxed.site.offset,
                    relax = ?relaxed.relax,
                    bailouts = relaxed.count,
                    "speculation relaxed, scheduling rejit"
                );
                self.submit(entry.key, Tier::Full);
            }
        }
        Ok(state)
    }

    /// Offer the loop headed at `frame.pc` to compiled code
    fn enter_loop(&mut self, frame: &mut InterpreterFrame) -> Result<LoopTransfer, ExecError> {
        let key = EntryKey::new(frame.func, EntryKind::Loop(frame.pc));
        let entry = match self.entries.get(key) {
            Some(entry) => entry,
            None => {
                if !self.request_loop(key) {
                    return Ok(LoopTransfer::Stay);
                }
                match self.entries.get(key) {
                    Some(entry) => entry,
                    None => return Ok(LoopTransfer::Stay),
                }
            }
        };

        let incoming = frame.regs.clone();
        let args = frame.args.clone();
        let act = Activation {
            this: frame.this,
            args: &args,
            incoming: &incoming,
            profile: profiling_func(&entry),
        };
        let exit = match execute(self, &entry.code, entry.frame_size, act)? {
            MachineExit::Return(v) => return Ok(LoopTransfer::Returned(v)),
            MachineExit::Bailout(exit) => exit,
        };
        let mut state = self.bail(&entry, exit, frame.this, &args)?;

        // The outermost rebuilt frame is the interpreter frame we came from
        let root = state
            .frames
            .pop()
            .ok_or(ExecError::Recovery(recovery::RecoveryError::NoFrames))?;
        frame.pc = root.pc;
        frame.regs = root.regs;
        if state.frames.is_empty() {
            return match state.action {
                Resume::Throw(e) => Err(ExecError::Thrown(e)),
                _ => Ok(LoopTransfer::Stay),
            };
        }
        // Finish the inlined frames, then deliver into ours
        let v = interp::resume(self, state)?;
        if let Some(slot) = root.awaiting.and_then(|r| frame.regs.get_mut(r as usize)) {
            *slot = v;
        }
        frame.pc += 1;
        Ok(LoopTransfer::Stay)
    }

    /// Request a compile of a hot loop; waits briefly for the result.
    /// Returns whether a compile was requested now.
    fn request_loop(&mut self, key: EntryKey) -> bool {
        let EntryKind::Loop(header) = key.entry else {
            return false;
        };
        let Some(profile) = self.profiles.get(key.func) else {
            return false;
        };
        if profile.is_no_jit() || self.loop_requests.contains(&key) {
            return false;
        }
        let back_edges = profile.with_data(|d| d.loops.get(&header).copied().unwrap_or(0));
        if !self.tier_policy.loop_is_hot(back_edges) {
            return false;
        }
        self.loop_requests.insert(key);
        tracing::debug!(entry = %key, back_edges, "hot loop");
        if self.submit(key, Tier::Full) != Submitted::Queued {
            return true;
        }
        let timeout = Duration::from_millis(self.config.scheduler.foreground_wait_ms);
        let outcome = self.scheduler.wait_for(
            key,
            timeout,
            || tracing::trace!(entry = %key, "waiting for loop compile"),
            || tracing::trace!(entry = %key, "done waiting for loop compile"),
        );
        if outcome == WaitOutcome::TimedOut {
            tracing::trace!(entry = %key, "loop compile still running, continuing in the interpreter");
        }
        true
    }

    /// Close the scheduler and drop all compiled code
    pub fn shutdown(&mut self) {
        self.scheduler.shutdown();
        for old in self.entries.clear() {
            self.installer.reclaimer().retire(old);
        }
    }

    pub fn profiles(&self) -> &Arc<ProgramProfile> {
        &self.profiles
    }

    pub fn config(&self) -> &JitConfig {
        &self.config
    }

    pub fn heap_mut(&mut self) -> &mut Heap {
        &mut self.heap
    }

    pub fn entries(&self) -> &Arc<EntryTable> {
        &self.entries
    }

    pub fn site_stats(&self) -> &SiteStats {
        &self.site_stats
    }

    pub fn overrides(&self) -> &SpeculationOverrides {
        &self.overrides
    }

    pub fn scheduler(&self) -> &CompilationScheduler<JitJob<HostTarget>> {
        &self.scheduler
    }

    pub fn scheduler_stats(&self) -> SchedulerStats {
        self.scheduler.stats()
    }

    pub fn reclaimed(&self) -> usize {
        self.installer.reclaimer().freed()
    }

    /// Tier `func` currently runs at
    pub fn tier_of(&self, func: FuncId) -> Tier {
        self.entries
            .get(EntryKey::function(func))
            .map(|e| e.tier)
            .unwrap_or(Tier::Interpreter)
    }
}

/// Simple-tier code keeps feeding call targets to the Full compile
fn profiling_func(entry: &EntryPoint) -> Option<FuncId> {
    (entry.tier == Tier::Simple).then_some(entry.key.func)
}

impl Host for Engine {
    fn program(&self) -> Arc<Program> {
        self.program.clone()
    }

    fn profile(&self) -> Arc<ProgramProfile> {
        self.profiles.clone()
    }

    fn heap(&mut self) -> &mut Heap {
        &mut self.heap
    }

    fn call(&mut self, callee: Value, this: Value, args: &[Value]) -> Result<Value, ExecError> {
        let func = callee
            .as_function()
            .ok_or(ExecError::Thrown(Value::error(ErrorKind::NotAFunction)))?;
        self.invoke(func, this, args)
    }

    fn implicit_call(&mut self) {
        self.implicit_calls += 1;
    }

    fn loop_back_edge(&mut self, frame: &mut InterpreterFrame) -> Result<LoopTransfer, ExecError> {
        if !self.config.enabled {
            return Ok(LoopTransfer::Stay);
        }
        self.enter_loop(frame)
    }
}

impl MachineHost for Engine {
    fn implicit_calls(&self) -> u64 {
        self.implicit_calls
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

//! Profiling counters and value profiles
//!
//! The interpreter bumps atomic counters at function entry and on backward
//! jumps, and records what it observed at call sites, branches, property
//! accesses and arithmetic. Compile workers only ever see a cloned
//! `ProfileData` snapshot.

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use parking_lot::Mutex;
use rustc_hash::FxHashMap;

use crate::bytecode::{FuncId, Offset};
use crate::interp::heap::ShapeId;
use crate::profiling::policy::Tier;

/// Distinct call targets / shapes remembered before a site goes megamorphic
pub const MAX_POLYMORPHISM: usize = 4;

/// Observed callees at one call site
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CallSiteProfile {
    pub targets: Vec<FuncId>,
    pub megamorphic: bool,
    pub count: u32,
}

/// Observed direction counts of a conditional jump
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BranchProfile {
    pub taken: u32,
    pub not_taken: u32,
}

/// Observed receiver shapes (with resolved slot) at a property access
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PropProfile {
    pub shapes: Vec<(ShapeId, u32)>,
    pub megamorphic: bool,
    /// A store at this site added a property or hit a non-object
    pub unstable: bool,
}

impl PropProfile {
    /// The single observed (shape, slot) pair, if the site is monomorphic
    pub fn monomorphic(&self) -> Option<(ShapeId, u32)> {
        (!self.megamorphic && !self.unstable && self.shapes.len() == 1).then(|| self.shapes[0])
    }
}

/// Whether arithmetic at a site only ever saw int32 operands and results
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ArithProfile {
    pub int_only: bool,
    pub count: u32,
}

/// Value profile of one function, keyed by byte-code offset
#[derive(Debug, Clone, Default)]
pub struct ProfileData {
    pub calls: FxHashMap<Offset, CallSiteProfile>,
    pub branches: FxHashMap<Offset, BranchProfile>,
    pub props: FxHashMap<Offset, PropProfile>,
    pub arith: FxHashMap<Offset, ArithProfile>,
    /// Loop header offset -> back-edge count
    pub loops: FxHashMap<Offset, u32>,
}

impl ProfileData {
    pub fn record_call_target(&mut self, offset: Offset, target: Option<FuncId>) {
        let site = self.calls.entry(offset).or_default();
        site.count = site.count.saturating_add(1);
        match target {
            Some(f) if site.targets.contains(&f) => {}
            Some(f) if site.targets.len() < MAX_POLYMORPHISM => site.targets.push(f),
            _ => site.megamorphic = true,
        }
    }

    pub fn record_branch(&mut self, offset: Offset, taken: bool) {
        let b = self.branches.entry(offset).or_default();
        if taken {
            b.taken = b.taken.saturating_add(1);
        } else {
            b.not_taken = b.not_taken.saturating_add(1);
        }
    }

    pub fn record_prop(&mut self, offset: Offset, shape: Option<(ShapeId, u32)>) {
        let p = self.props.entry(offset).or_default();
        match shape {
            Some(pair) if p.shapes.contains(&pair) => {}
            Some(pair) if p.shapes.len() < MAX_POLYMORPHISM => p.shapes.push(pair),
            Some(_) => p.megamorphic = true,
            None => p.unstable = true,
        }
    }

    pub fn record_arith(&mut self, offset: Offset, int_only: bool) {
        let a = self.arith.entry(offset).or_insert(ArithProfile {
            int_only: true,
            count: 0,
        });
        a.int_only &= int_only;
        a.count = a.count.saturating_add(1);
    }

    pub fn record_loop(&mut self, header: Offset) -> u32 {
        let n = self.loops.entry(header).or_insert(0);
        *n = n.saturating_add(1);
        *n
    }

    pub fn call_site(&self, offset: Offset) -> Option<&CallSiteProfile> {
        self.calls.get(&offset)
    }

    pub fn branch(&self, offset: Offset) -> Option<BranchProfile> {
        self.branches.get(&offset).copied()
    }

    pub fn prop(&self, offset: Offset) -> Option<&PropProfile> {
        self.props.get(&offset)
    }

    pub fn int_only(&self, offset: Offset) -> bool {
        self.arith.get(&offset).map(|a| a.int_only && a.count > 0).unwrap_or(false)
    }
}

/// Profiling counters for a single function
pub struct FunctionProfile {
    /// Number of times this function has been called
    pub call_count: AtomicU32,
    /// Number of backward jumps taken
    pub loop_count: AtomicU32,
    /// Highest tier a compile has been requested for
    requested_tier: AtomicU8,
    /// Set when a compile was abandoned; the function stays where it is
    no_jit: AtomicBool,
    data: Mutex<ProfileData>,
}

impl FunctionProfile {
    /// Create a new profile with zero counters
    pub fn new() -> Self {
        FunctionProfile {
            call_count: AtomicU32::new(0),
            loop_count: AtomicU32::new(0),
            requested_tier: AtomicU8::new(Tier::Interpreter as u8),
            no_jit: AtomicBool::new(false),
            data: Mutex::new(ProfileData::default()),
        }
    }

    /// Record a function call, return new count
    pub fn record_call(&self) -> u32 {
        self.call_count.fetch_add(1, Ordering::Relaxed) + 1
    }

    /// Record a backward jump to `header`, return that loop's count
    pub fn record_loop(&self, header: Offset) -> u32 {
        self.loop_count.fetch_add(1, Ordering::Relaxed);
        self.data.lock().record_loop(header)
    }

    /// Try to claim a compile request at `tier`.
    /// Returns false if an equal or higher tier was already requested.
    pub fn try_request(&self, tier: Tier) -> bool {
        let wanted = tier as u8;
        self.requested_tier
            .fetch_update(Ordering::AcqRel, Ordering::Relaxed, |cur| (cur < wanted).then_some(wanted))
            .is_ok()
    }

    pub fn requested_tier(&self) -> Tier {
        Tier::from_u8(self.requested_tier.load(Ordering::Acquire))
    }

    /// Forget the request so the tier can be requested again (rejit)
    pub fn reset_request(&self, tier: Tier) {
        self.requested_tier.store(tier as u8, Ordering::Release);
    }

    pub fn mark_no_jit(&self) {
        self.no_jit.store(true, Ordering::Release);
    }

    pub fn is_no_jit(&self) -> bool {
        self.no_jit.load(Ordering::Acquire)
    }

    /// Run `f` with the mutable value profile
    pub fn with_data<R>(&self, f: impl FnOnce(&mut ProfileData) -> R) -> R {
        f(&mut self.data.lock())
    }

    pub fn snapshot(&self) -> ProfileData {
        self.data.lock().clone()
    }
}

impl Default for FunctionProfile {
    fn default() -> Self {
        Self::new()
    }
}

/// Profiling data for all functions of a program
pub struct ProgramProfile {
    /// Per-function profiling counters
    pub functions: Vec<FunctionProfile>,
}

impl ProgramProfile {
    /// Create a profile for a program with the given number of functions
    pub fn new(function_count: usize) -> Self {
        ProgramProfile {
            functions: (0..function_count).map(|_| FunctionProfile::new()).collect(),
        }
    }

    /// Get the profile for a specific function
    pub fn get(&self, func: FuncId) -> Option<&FunctionProfile> {
        self.functions.get(func.0 as usize)
    }
}

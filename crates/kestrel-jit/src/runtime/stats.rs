//! Per-site bailout counters and speculation overrides
//!
//! Counters only grow. When a site crosses the rejit threshold the
//! speculation that failed there is switched off for future compiles.

use dashmap::DashMap;
use rustc_hash::FxHashMap;

use crate::bailout::BailoutReason;
use crate::bytecode::{FuncId, Offset};

/// A speculation site: the function and offset whose assumption failed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SiteKey {
    pub func: FuncId,
    pub offset: Offset,
}

impl SiteKey {
    pub fn new(func: FuncId, offset: Offset) -> Self {
        SiteKey { func, offset }
    }
}

/// A speculation that can be withheld at one site
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Relax {
    NoIntSpec = 1,
    NoShapeSpec = 2,
    NoInline = 4,
    NoBranchPrune = 8,
    /// Shape guards may not be merged across the op
    KillCoverage = 16,
}

impl Relax {
    /// The override that stops `reason` from firing again
    pub fn for_reason(reason: BailoutReason) -> Option<Relax> {
        match reason {
            BailoutReason::ShapeMismatch => Some(Relax::NoShapeSpec),
            BailoutReason::NotAnInt | BailoutReason::IntOverflow | BailoutReason::NegativeZero => {
                Some(Relax::NoIntSpec)
            }
            BailoutReason::CallTargetMismatch => Some(Relax::NoInline),
            BailoutReason::NoProfile => Some(Relax::NoBranchPrune),
            BailoutReason::ImplicitCall | BailoutReason::LazyInvalidation => Some(Relax::KillCoverage),
            BailoutReason::LoopExit | BailoutReason::Throw => None,
        }
    }

    fn bit(self) -> u8 {
        self as u8
    }
}

/// Monotonic per-site bailout counts
#[derive(Debug, Default)]
pub struct SiteStats {
    counts: DashMap<SiteKey, u32>,
}

impl SiteStats {
    pub fn new() -> Self {
        Self::default()
    }

    /// Count one bailout at `site`, returning the new total
    pub fn record(&self, site: SiteKey) -> u32 {
        let mut count = self.counts.entry(site).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    pub fn count(&self, site: SiteKey) -> u32 {
        self.counts.get(&site).map(|c| *c).unwrap_or(0)
    }

    pub fn total(&self) -> u64 {
        self.counts.iter().map(|e| *e.value() as u64).sum()
    }
}

/// Speculations withheld at specific sites, shared by all compiles
#[derive(Debug, Default)]
pub struct SpeculationOverrides {
    bits: DashMap<SiteKey, u8>,
}

impl SpeculationOverrides {
    pub fn new() -> Self {
        Self::default()
    }

    /// Withhold `relax` at `site`; returns false if it already was
    pub fn add(&self, site: SiteKey, relax: Relax) -> bool {
        let mut bits = self.bits.entry(site).or_insert(0);
        let fresh = *bits & relax.bit() == 0;
        *bits |= relax.bit();
        fresh
    }

    pub fn allows(&self, site: SiteKey, relax: Relax) -> bool {
        self.bits.get(&site).map(|b| *b & relax.bit() == 0).unwrap_or(true)
    }

    /// Copy taken when a work item is created
    pub fn snapshot(&self) -> OverrideSnapshot {
        OverrideSnapshot {
            bits: self.bits.iter().map(|e| (*e.key(), *e.value())).collect(),
        }
    }
}

/// Immutable view of the overrides used by one compile
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OverrideSnapshot {
    bits: FxHashMap<SiteKey, u8>,
}

impl OverrideSnapshot {
    /// Whether the speculation `relax` names is still allowed at `func`/`offset`
    pub fn allows(&self, func: FuncId, offset: Offset, relax: Relax) -> bool {
        self.bits
            .get(&SiteKey::new(func, offset))
            .map(|b| *b & relax.bit() == 0)
            .unwrap_or(true)
    }

    pub fn len(&self) -> usize {
        self.bits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

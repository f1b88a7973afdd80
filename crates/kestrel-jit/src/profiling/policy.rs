//! Tier policy: decides when to compile a function or loop
//!
//! Uses call counts and loop counts from profiling to determine when a
//! function is hot enough for each tier.

use std::sync::atomic::Ordering;

use super::counters::FunctionProfile;
use crate::config::JitConfig;

/// Execution tier of a function
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum Tier {
    Interpreter = 0,
    /// Compiled without speculation
    Simple = 1,
    /// Speculative, inlining, fully optimized
    Full = 2,
}

impl Tier {
    pub fn from_u8(v: u8) -> Tier {
        match v {
            0 => Tier::Interpreter,
            1 => Tier::Simple,
            _ => Tier::Full,
        }
    }

    pub fn speculates(self) -> bool {
        self == Tier::Full
    }
}

/// When to trigger compilation
#[derive(Debug, Clone)]
pub struct TierPolicy {
    /// Calls before the simple tier (default: 100)
    pub simple_call_threshold: u32,
    /// Calls before the full tier (default: 1000)
    pub full_call_threshold: u32,
    /// Back edges before a loop body is compiled (default: 10_000)
    pub loop_threshold: u32,
    /// Maximum bytecode size to compile (skip very large functions)
    pub max_function_size: usize,
}

impl TierPolicy {
    pub fn from_config(config: &JitConfig) -> Self {
        TierPolicy {
            simple_call_threshold: config.tiering.simple_call_threshold,
            full_call_threshold: config.tiering.full_call_threshold,
            loop_threshold: config.tiering.loop_threshold,
            max_function_size: config.limits.max_function_size,
        }
    }

    /// Tier a function should be promoted to, if any.
    /// Never returns a tier that was already requested.
    pub fn promotion(&self, profile: &FunctionProfile, code_size: usize) -> Option<Tier> {
        if profile.is_no_jit() || code_size > self.max_function_size {
            return None;
        }
        let calls = profile.call_count.load(Ordering::Relaxed);
        let wanted = if calls >= self.full_call_threshold {
            Tier::Full
        } else if calls >= self.simple_call_threshold {
            Tier::Simple
        } else {
            return None;
        };
        (wanted > profile.requested_tier()).then_some(wanted)
    }

    pub fn loop_is_hot(&self, back_edges: u32) -> bool {
        back_edges >= self.loop_threshold
    }
}

impl Default for TierPolicy {
    fn default() -> Self {
        Self::from_config(&JitConfig::default())
    }
}

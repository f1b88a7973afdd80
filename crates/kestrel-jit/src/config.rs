//! JIT configuration (`kestrel-jit.toml`)
//!
//! Every section has defaults, so an empty file is a valid configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors that can occur while loading a configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read the configuration file
    #[error("Failed to read config file: {0}")]
    IoError(#[from] std::io::Error),

    /// Failed to parse TOML
    #[error("Failed to parse config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Validation error
    #[error("Invalid config: {0}")]
    ValidationError(String),
}

/// Top-level JIT configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct JitConfig {
    /// Master switch; when false everything runs in the interpreter
    pub enabled: bool,
    pub phases: PhaseConfig,
    pub inlining: InliningConfig,
    pub limits: LimitsConfig,
    pub rejit: RejitConfig,
    pub scheduler: SchedulerConfig,
    pub tiering: TieringConfig,
}

/// Per-phase enable switches
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PhaseConfig {
    pub inlining: bool,
    /// Drop shape guards covered by an earlier guard on the same object
    pub guard_merging: bool,
    pub dead_store_elimination: bool,
    /// Check call results lazily instead of killing guard coverage at calls
    pub lazy_bailouts: bool,
    /// Bail after ops that ran script code instead of killing guard coverage
    pub implicit_call_bailouts: bool,
    pub int_specialization: bool,
    pub shape_specialization: bool,
    /// Replace never-taken branch sides with an unconditional bailout
    pub bail_on_no_profile: bool,
    /// Share identical bailout descriptors between guards
    pub bailout_sharing: bool,
}

impl Default for PhaseConfig {
    fn default() -> Self {
        PhaseConfig {
            inlining: true,
            guard_merging: true,
            dead_store_elimination: true,
            lazy_bailouts: true,
            implicit_call_bailouts: true,
            int_specialization: true,
            shape_specialization: true,
            bail_on_no_profile: true,
            bailout_sharing: true,
        }
    }
}

/// Inlining heuristics
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct InliningConfig {
    /// Maximum nesting of inlined frames (default: 4)
    pub max_depth: u32,
    /// Largest callee, in ops, inlined at a lukewarm site (default: 40)
    pub max_inlinee_size: usize,
    /// Site call count at which the size budget doubles (default: 100)
    pub hot_site_calls: u32,
    /// Total ops inlined into one function (default: 400)
    pub max_total_size: usize,
    /// Targets inlined at a polymorphic site (default: 3)
    pub max_polymorphic_targets: usize,
    /// Times a function may appear in one inline chain (default: 1)
    pub max_inline_recursion: u32,
}

impl Default for InliningConfig {
    fn default() -> Self {
        InliningConfig {
            max_depth: 4,
            max_inlinee_size: 40,
            hot_site_calls: 100,
            max_total_size: 400,
            max_polymorphic_targets: 3,
            max_inline_recursion: 1,
        }
    }
}

/// Hard limits; a work item exceeding one is abandoned
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LimitsConfig {
    /// Largest function compiled, in ops (default: 4096)
    pub max_function_size: usize,
    /// Most parameters of a compiled function (default: 32)
    pub max_args: u16,
    /// Largest IR after inlining, in instructions (default: 20_000)
    pub max_ir_size: usize,
    /// Script call depth before a stack overflow is thrown (default: 512)
    pub max_call_depth: usize,
}

impl Default for LimitsConfig {
    fn default() -> Self {
        LimitsConfig {
            max_function_size: 4096,
            max_args: 32,
            max_ir_size: 20_000,
            max_call_depth: 512,
        }
    }
}

/// Rejit sensitivity
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct RejitConfig {
    /// Bailouts at one site before its speculation is relaxed (default: 50)
    pub bailout_threshold: u32,
}

impl Default for RejitConfig {
    fn default() -> Self {
        RejitConfig {
            bailout_threshold: 50,
        }
    }
}

/// Background compilation
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Compile on worker threads; false compiles in the foreground
    pub background: bool,
    /// Worker count, 0 means one less than the number of cores
    pub worker_threads: usize,
    /// Queued items before new requests fall back to the foreground
    pub max_queue_len: usize,
    /// Bounded wait for a loop body compile, in ms (default: 10)
    pub foreground_wait_ms: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        SchedulerConfig {
            background: true,
            worker_threads: 0,
            max_queue_len: 64,
            foreground_wait_ms: 10,
        }
    }
}

impl SchedulerConfig {
    pub fn effective_workers(&self) -> usize {
        if self.worker_threads == 0 {
            num_cpus::get().saturating_sub(1).max(1)
        } else {
            self.worker_threads
        }
    }
}

/// Tier-up thresholds
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TieringConfig {
    /// Calls before the non-speculative tier (default: 100)
    pub simple_call_threshold: u32,
    /// Calls before the fully optimizing tier (default: 1000)
    pub full_call_threshold: u32,
    /// Back edges of one loop before it is compiled (default: 10_000)
    pub loop_threshold: u32,
}

impl Default for TieringConfig {
    fn default() -> Self {
        TieringConfig {
            simple_call_threshold: 100,
            full_call_threshold: 1000,
            loop_threshold: 10_000,
        }
    }
}

impl Default for JitConfig {
    fn default() -> Self {
        JitConfig {
            enabled: true,
            phases: PhaseConfig::default(),
            inlining: InliningConfig::default(),
            limits: LimitsConfig::default(),
            rejit: RejitConfig::default(),
            scheduler: SchedulerConfig::default(),
            tiering: TieringConfig::default(),
        }
    }
}

impl JitConfig {
    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: JitConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load and validate a TOML file
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Interpreter only
    pub fn interpreter_only() -> Self {
        JitConfig {
            enabled: false,
            ..Default::default()
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.rejit.bailout_threshold == 0 {
            return Err(ConfigError::ValidationError(
                "rejit.bailout_threshold must be at least 1".to_string(),
            ));
        }
        if self.tiering.simple_call_threshold > self.tiering.full_call_threshold {
            return Err(ConfigError::ValidationError(
                "tiering.simple_call_threshold exceeds full_call_threshold".to_string(),
            ));
        }
        if self.scheduler.background && self.scheduler.max_queue_len == 0 {
            return Err(ConfigError::ValidationError(
                "scheduler.max_queue_len must be positive for background compilation".to_string(),
            ));
        }
        if self.inlining.max_polymorphic_targets == 0 {
            return Err(ConfigError::ValidationError(
                "inlining.max_polymorphic_targets must be at least 1".to_string(),
            ));
        }
        Ok(())
    }
}

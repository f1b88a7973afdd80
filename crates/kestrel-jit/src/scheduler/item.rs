//! Work items and cooperative cancellation

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use super::job::CompileJob;

/// Shared flag checked before an item starts and between compile phases
#[derive(Debug, Clone, Default)]
pub struct CancellationToken(Arc<AtomicBool>);

impl CancellationToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// A queued compile
pub(crate) struct WorkItem<J> {
    pub job: J,
    pub token: CancellationToken,
}

impl<J: CompileJob> WorkItem<J> {
    pub fn new(job: J) -> Self {
        WorkItem {
            job,
            token: CancellationToken::new(),
        }
    }
}

/// What happened to a submitted job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submitted {
    /// Appended to the queue
    Queued,
    /// Merged into the item already queued for the same entry
    Coalesced,
    /// The entry is being compiled; the job runs once that finishes
    Deferred,
    /// Compiled on the calling thread
    Foreground,
    /// The scheduler is closed
    Rejected,
}

/// Result of `prioritize`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Priority {
    /// Moved to the front of the queue
    Promoted,
    /// Taken off the queue and compiled on the calling thread
    Foreground,
    /// Already running on a worker
    Running,
    /// Nothing queued or running for the entry
    Absent,
}

/// Result of `wait_for`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Finished,
    TimedOut,
    Absent,
}

/// Scheduler counters
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchedulerStats {
    /// Jobs accepted by `add_work_item`
    pub submitted: u64,
    pub coalesced: u64,
    pub deferred: u64,
    /// Compiles run on a caller's thread
    pub foreground: u64,
    pub installed: u64,
    /// Compiles whose output was dropped by cancellation
    pub discarded: u64,
    /// Queued items dropped without running
    pub dropped: u64,
}

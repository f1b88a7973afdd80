//! What the scheduler runs and where results go

use crate::profiling::Tier;
use crate::runtime::entry::EntryKey;

use super::item::CancellationToken;

/// One unit of compilation. Identity is the entry key; at most one job per
/// key is ever running.
pub trait CompileJob: Send + 'static {
    type Output: Send + 'static;

    fn key(&self) -> EntryKey;

    fn tier(&self) -> Tier;

    /// Compile, polling `token` between phases
    fn compile(&self, token: &CancellationToken) -> Self::Output;
}

/// Receives the output of every compile that was not cancelled.
///
/// Called with the scheduler lock held so `close` cannot race an install;
/// implementations must not call back into the scheduler.
pub trait Installer<J: CompileJob>: Send + Sync + 'static {
    fn install(&self, job: &J, output: J::Output);
}

//! Background compilation scheduler
//!
//! A queue of work items drained by named worker threads. Requests for an
//! entry that is already queued are merged into the queued item; requests
//! for an entry that is being compiled wait until that compile finishes.
//! When the queue is full, or background compilation is off, the caller
//! compiles on its own thread.
//!
//! Results go to an `Installer` under the scheduler lock. Closing the
//! scheduler drops queued items and cancels running ones, whose output is
//! then discarded instead of installed.

mod item;
mod job;
mod reclaim;

pub use item::{CancellationToken, Priority, SchedulerStats, Submitted, WaitOutcome};
pub use job::{CompileJob, Installer};
pub use reclaim::Reclaimer;

use std::collections::VecDeque;
use std::io;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use rustc_hash::FxHashMap;

use crate::config::SchedulerConfig;
use crate::runtime::entry::EntryKey;

use item::WorkItem;

enum Slot<J> {
    Queued,
    Running {
        token: CancellationToken,
        /// Requested while running; queued when the running compile ends
        deferred: Option<J>,
    },
}

struct State<J> {
    queue: VecDeque<WorkItem<J>>,
    slots: FxHashMap<EntryKey, Slot<J>>,
    closed: bool,
    shutdown: bool,
    stats: SchedulerStats,
}

struct Shared<J: CompileJob> {
    state: Mutex<State<J>>,
    /// Signalled when an item is queued or on shutdown
    work_ready: Condvar,
    /// Signalled whenever a compile ends or items are dropped
    finished: Condvar,
    installer: Arc<dyn Installer<J>>,
    background: bool,
    max_queue_len: usize,
}

impl<J: CompileJob> Shared<J> {
    /// Compile `item` on this thread and hand the result over. Returns a
    /// deferred item this thread must run next when there are no workers.
    fn run(&self, item: WorkItem<J>) -> Option<WorkItem<J>> {
        let WorkItem { job, token } = item;
        let key = job.key();
        tracing::debug!(entry = %key, tier = ?job.tier(), "compile started");
        let output = job.compile(&token);

        let mut state = self.state.lock();
        let deferred = match state.slots.remove(&key) {
            Some(Slot::Running { deferred, .. }) => deferred,
            _ => None,
        };
        if state.closed || token.is_cancelled() {
            state.stats.discarded += 1;
            tracing::debug!(entry = %key, "compile discarded");
        } else {
            self.installer.install(&job, output);
            state.stats.installed += 1;
        }

        let next = match deferred {
            Some(next) if !state.closed => {
                let item = WorkItem::new(next);
                if self.background {
                    state.slots.insert(key, Slot::Queued);
                    state.queue.push_back(item);
                    self.work_ready.notify_one();
                    None
                } else {
                    state.slots.insert(
                        key,
                        Slot::Running {
                            token: item.token.clone(),
                            deferred: None,
                        },
                    );
                    state.stats.foreground += 1;
                    Some(item)
                }
            }
            _ => None,
        };
        self.finished.notify_all();
        next
    }

    fn run_chain(&self, item: WorkItem<J>) {
        let mut next = Some(item);
        while let Some(item) = next {
            next = self.run(item);
        }
    }

    fn worker_loop(&self, id: usize) {
        loop {
            let item = {
                let mut state = self.state.lock();
                let item = loop {
                    if state.shutdown {
                        tracing::trace!(worker = id, "compile worker exiting");
                        return;
                    }
                    if let Some(item) = state.queue.pop_front() {
                        break item;
                    }
                    self.work_ready.wait(&mut state);
                };
                let key = item.job.key();
                if item.token.is_cancelled() {
                    state.slots.remove(&key);
                    state.stats.dropped += 1;
                    self.finished.notify_all();
                    continue;
                }
                state.slots.insert(
                    key,
                    Slot::Running {
                        token: item.token.clone(),
                        deferred: None,
                    },
                );
                item
            };
            self.run_chain(item);
        }
    }
}

/// Compiles jobs of type `J` off the calling thread
pub struct CompilationScheduler<J: CompileJob> {
    shared: Arc<Shared<J>>,
    workers: Vec<thread::JoinHandle<()>>,
}

impl<J: CompileJob> CompilationScheduler<J> {
    /// Start the scheduler and, for background compilation, its workers
    pub fn new(config: &SchedulerConfig, installer: Arc<dyn Installer<J>>) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(State {
                queue: VecDeque::new(),
                slots: FxHashMap::default(),
                closed: false,
                shutdown: false,
                stats: SchedulerStats::default(),
            }),
            work_ready: Condvar::new(),
            finished: Condvar::new(),
            installer,
            background: config.background,
            max_queue_len: config.max_queue_len,
        });

        let mut scheduler = CompilationScheduler {
            shared,
            workers: Vec::new(),
        };
        if config.background {
            for id in 0..config.effective_workers() {
                let shared = scheduler.shared.clone();
                let handle = thread::Builder::new()
                    .name(format!("kestrel-jit-worker-{}", id))
                    .spawn(move || shared.worker_loop(id))?;
                scheduler.workers.push(handle);
            }
        }
        tracing::debug!(workers = scheduler.workers.len(), "compilation scheduler started");
        Ok(scheduler)
    }

    /// Submit a job. At most one job per entry key is ever compiling.
    pub fn add_work_item(&self, job: J) -> Submitted {
        let key = job.key();
        let mut guard = self.shared.state.lock();
        let state = &mut *guard;
        if state.closed {
            return Submitted::Rejected;
        }
        state.stats.submitted += 1;

        match state.slots.get_mut(&key) {
            Some(Slot::Queued) => {
                if let Some(queued) = state.queue.iter_mut().find(|i| i.job.key() == key) {
                    // The newer job carries newer overrides
                    if job.tier() >= queued.job.tier() {
                        queued.job = job;
                    }
                }
                state.stats.coalesced += 1;
                tracing::trace!(entry = %key, "coalesced with queued compile");
                Submitted::Coalesced
            }
            Some(Slot::Running { deferred, .. }) => {
                match deferred {
                    Some(pending) if pending.tier() > job.tier() => {}
                    _ => *deferred = Some(job),
                }
                state.stats.deferred += 1;
                tracing::trace!(entry = %key, "deferred behind running compile");
                Submitted::Deferred
            }
            None if self.shared.background && state.queue.len() < self.shared.max_queue_len => {
                state.slots.insert(key, Slot::Queued);
                state.queue.push_back(WorkItem::new(job));
                self.shared.work_ready.notify_one();
                Submitted::Queued
            }
            None => {
                let item = WorkItem::new(job);
                state.slots.insert(
                    key,
                    Slot::Running {
                        token: item.token.clone(),
                        deferred: None,
                    },
                );
                state.stats.foreground += 1;
                drop(guard);
                self.shared.run_chain(item);
                Submitted::Foreground
            }
        }
    }

    /// Move the queued item for `key` to the front, or with `foreground`
    /// compile it right away on this thread
    pub fn prioritize(&self, key: EntryKey, foreground: bool) -> Priority {
        let mut state = self.shared.state.lock();
        match state.slots.get(&key) {
            None => return Priority::Absent,
            Some(Slot::Running { .. }) => return Priority::Running,
            Some(Slot::Queued) => {}
        }
        let Some(pos) = state.queue.iter().position(|i| i.job.key() == key) else {
            return Priority::Absent;
        };
        let Some(item) = state.queue.remove(pos) else {
            return Priority::Absent;
        };
        if !foreground {
            state.queue.push_front(item);
            return Priority::Promoted;
        }
        state.slots.insert(
            key,
            Slot::Running {
                token: item.token.clone(),
                deferred: None,
            },
        );
        state.stats.foreground += 1;
        drop(state);
        self.shared.run_chain(item);
        Priority::Foreground
    }

    /// Block until the compile for `key` is done, compiling it here if it
    /// has not started yet. `before` and `after` bracket the wait.
    pub fn wait_for(
        &self,
        key: EntryKey,
        timeout: Duration,
        before: impl FnOnce(),
        after: impl FnOnce(),
    ) -> WaitOutcome {
        if !self.contains(key) {
            return WaitOutcome::Absent;
        }
        before();
        let outcome = match self.prioritize(key, true) {
            Priority::Running => {
                let deadline = Instant::now() + timeout;
                let mut state = self.shared.state.lock();
                loop {
                    if !matches!(state.slots.get(&key), Some(Slot::Running { .. })) {
                        break WaitOutcome::Finished;
                    }
                    if self.shared.finished.wait_until(&mut state, deadline).timed_out() {
                        break match state.slots.get(&key) {
                            Some(Slot::Running { .. }) => WaitOutcome::TimedOut,
                            _ => WaitOutcome::Finished,
                        };
                    }
                }
            }
            _ => WaitOutcome::Finished,
        };
        after();
        outcome
    }

    /// Drop every queued item and cancel running ones. Returns the number
    /// of items dropped. Later submissions are rejected.
    pub fn close(&self) -> usize {
        let mut state = self.shared.state.lock();
        state.closed = true;
        let dropped: Vec<WorkItem<J>> = state.queue.drain(..).collect();
        for item in &dropped {
            item.token.cancel();
            state.slots.remove(&item.job.key());
        }
        for slot in state.slots.values_mut() {
            if let Slot::Running { token, deferred } = slot {
                token.cancel();
                *deferred = None;
            }
        }
        state.stats.dropped += dropped.len() as u64;
        self.shared.finished.notify_all();
        tracing::debug!(dropped = dropped.len(), "compilation scheduler closed");
        dropped.len()
    }

    /// Close and join the workers
    pub fn shutdown(&mut self) {
        self.close();
        self.shared.state.lock().shutdown = true;
        self.shared.work_ready.notify_all();
        for handle in self.workers.drain(..) {
            if handle.join().is_err() {
                tracing::warn!("compile worker panicked");
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Whether an item for `key` is queued or compiling
    pub fn contains(&self, key: EntryKey) -> bool {
        self.shared.state.lock().slots.contains_key(&key)
    }

    pub fn is_running(&self, key: EntryKey) -> bool {
        matches!(self.shared.state.lock().slots.get(&key), Some(Slot::Running { .. }))
    }

    pub fn queue_len(&self) -> usize {
        self.shared.state.lock().queue.len()
    }

    pub fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub fn stats(&self) -> SchedulerStats {
        self.shared.state.lock().stats.clone()
    }
}

impl<J: CompileJob> Drop for CompilationScheduler<J> {
    fn drop(&mut self) {
        self.shutdown();
    }
}

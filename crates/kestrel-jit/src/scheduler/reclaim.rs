//! Reclamation of superseded code
//!
//! Replaced entry points arrive over a channel. A body is freed only once
//! the reclaimer holds its last reference, so activations still running
//! the old code keep it alive. The thread polls its pending list, so a
//! slow-to-die body never holds up new installs.

use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam::channel::{unbounded, RecvTimeoutError, Sender};

use crate::backend::CodeAllocator;
use crate::runtime::entry::EntryPoint;

const POLL_INTERVAL: Duration = Duration::from_millis(5);

pub struct Reclaimer {
    sender: Option<Sender<Arc<EntryPoint>>>,
    handle: Option<thread::JoinHandle<()>>,
    freed: Arc<AtomicUsize>,
}

impl Reclaimer {
    pub fn start(allocator: Arc<dyn CodeAllocator>) -> io::Result<Self> {
        let (sender, receiver) = unbounded::<Arc<EntryPoint>>();
        let freed = Arc::new(AtomicUsize::new(0));
        let counter = freed.clone();
        let handle = thread::Builder::new()
            .name("kestrel-jit-reclaim".to_string())
            .spawn(move || {
                let mut pending: Vec<Arc<EntryPoint>> = Vec::new();
                loop {
                    let disconnected = match receiver.recv_timeout(POLL_INTERVAL) {
                        Ok(entry) => {
                            pending.push(entry);
                            false
                        }
                        Err(RecvTimeoutError::Timeout) => false,
                        Err(RecvTimeoutError::Disconnected) => true,
                    };
                    pending = free_unreferenced(pending, allocator.as_ref(), &counter);
                    if disconnected {
                        if !pending.is_empty() {
                            tracing::debug!(leaked = pending.len(), "reclaimer stopping with live bodies");
                        }
                        return;
                    }
                }
            })?;
        Ok(Reclaimer {
            sender: Some(sender),
            handle: Some(handle),
            freed,
        })
    }

    /// Hand over a body that is no longer installed
    pub fn retire(&self, entry: Arc<EntryPoint>) {
        tracing::trace!(entry = %entry.key, "retired");
        if let Some(sender) = &self.sender {
            // A send only fails after shutdown; the body is then dropped here
            let _ = sender.send(entry);
        }
    }

    /// Bodies whose code memory has been released
    pub fn freed(&self) -> usize {
        self.freed.load(Ordering::Acquire)
    }

    pub fn shutdown(&mut self) {
        self.sender.take();
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                tracing::warn!("reclaim thread panicked");
            }
        }
    }
}

impl Drop for Reclaimer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

fn free_unreferenced(
    pending: Vec<Arc<EntryPoint>>,
    allocator: &dyn CodeAllocator,
    freed: &AtomicUsize,
) -> Vec<Arc<EntryPoint>> {
    let mut still_live = Vec::new();
    for entry in pending {
        match Arc::try_unwrap(entry) {
            Ok(entry) => {
                let key = entry.key;
                if let Some(region) = entry.into_region() {
                    allocator.release(region);
                }
                freed.fetch_add(1, Ordering::AcqRel);
                tracing::trace!(entry = %key, "code freed");
            }
            Err(entry) => still_live.push(entry),
        }
    }
    still_live
}

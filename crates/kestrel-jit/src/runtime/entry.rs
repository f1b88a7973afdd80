//! Installed entry points
//!
//! Stores compiled bodies keyed by function and entry kind. Installing a
//! new body is a single swap under the write lock; the replaced body is
//! marked stale and handed back so it can be reclaimed once no activation
//! still runs it.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;
use rustc_hash::FxHashMap;

use crate::backend::{CodeRegion, CodegenError, CompiledBody, MInst, Target};
use crate::bailout::{BailoutRecord, FrameTable, GlobalBailoutTable};
use crate::bytecode::FuncId;
use crate::ir::EntryKind;
use crate::profiling::Tier;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct EntryKey {
    pub func: FuncId,
    pub entry: EntryKind,
}

impl EntryKey {
    pub fn function(func: FuncId) -> Self {
        EntryKey {
            func,
            entry: EntryKind::Function,
        }
    }

    pub fn new(func: FuncId, entry: EntryKind) -> Self {
        EntryKey { func, entry }
    }
}

impl std::fmt::Display for EntryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.entry {
            EntryKind::Function => write!(f, "{}", self.func),
            EntryKind::Loop(header) => write!(f, "{}@loop{}", self.func, header),
        }
    }
}

/// One installed body and everything a bailout from it needs
#[derive(Debug)]
pub struct EntryPoint {
    pub key: EntryKey,
    pub tier: Tier,
    /// Decoded from `region`
    pub code: Vec<MInst>,
    pub frame_size: usize,
    pub records: Vec<Arc<BailoutRecord>>,
    pub table: Arc<GlobalBailoutTable>,
    pub frames: Arc<FrameTable>,
    /// Bailouts taken through this body
    pub bailouts: AtomicU64,
    stale: AtomicBool,
    region: Option<CodeRegion>,
}

impl EntryPoint {
    pub fn new<T: Target + ?Sized>(
        target: &T,
        body: CompiledBody,
        tier: Tier,
        region: CodeRegion,
    ) -> Result<Self, CodegenError> {
        let code = target.decode(region.bytes())?;
        Ok(EntryPoint {
            key: EntryKey::new(body.func, body.entry),
            tier,
            code,
            frame_size: body.frame_size,
            records: body.records,
            table: Arc::new(body.table),
            frames: Arc::new(body.frames),
            bailouts: AtomicU64::new(0),
            stale: AtomicBool::new(false),
            region: Some(region),
        })
    }

    pub fn record(&self, id: u32) -> Option<&Arc<BailoutRecord>> {
        self.records.get(id as usize)
    }

    pub fn is_stale(&self) -> bool {
        self.stale.load(Ordering::Acquire)
    }

    pub fn mark_stale(&self) {
        self.stale.store(true, Ordering::Release);
    }

    /// The code memory, once the last reference is gone
    pub fn into_region(mut self) -> Option<CodeRegion> {
        self.region.take()
    }
}

/// Thread-safe map of installed entry points
#[derive(Debug, Default)]
pub struct EntryTable {
    entries: RwLock<FxHashMap<EntryKey, Arc<EntryPoint>>>,
}

impl EntryTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Install `entry`, returning the body it replaces (already marked stale)
    pub fn install(&self, entry: EntryPoint) -> Option<Arc<EntryPoint>> {
        let key = entry.key;
        let old = self.entries.write().insert(key, Arc::new(entry));
        if let Some(old) = &old {
            old.mark_stale();
        }
        tracing::debug!(entry = %key, replaced = old.is_some(), "installed");
        old
    }

    pub fn get(&self, key: EntryKey) -> Option<Arc<EntryPoint>> {
        self.entries.read().get(&key).filter(|e| !e.is_stale()).cloned()
    }

    /// Remove the body for `key` so calls go back to the interpreter
    pub fn invalidate(&self, key: EntryKey) -> Option<Arc<EntryPoint>> {
        let old = self.entries.write().remove(&key);
        if let Some(old) = &old {
            old.mark_stale();
        }
        old
    }

    /// Drop every installed body
    pub fn clear(&self) -> Vec<Arc<EntryPoint>> {
        let drained: Vec<_> = self.entries.write().drain().map(|(_, e)| e).collect();
        for e in &drained {
            e.mark_stale();
        }
        drained
    }

    pub fn tier_of(&self, key: EntryKey) -> Option<Tier> {
        self.entries.read().get(&key).map(|e| e.tier)
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::{emit, CodeAllocator, HeapCodeAllocator, PortableTarget};
    use crate::interp::value::Value;
    use crate::ir::{FrameIdx, Inst, InstKind, IrFunc, SymId, Terminator};

    fn entry(alloc: &HeapCodeAllocator, tier: Tier) -> EntryPoint {
        let mut f = IrFunc::new(FuncId(2), "k", EntryKind::Function, 1);
        let b = f.add_block();
        f.block_mut(b).insts.push(Inst::new(
            InstKind::Const {
                dst: SymId(0),
                value: Value::int(7),
            },
            0,
            FrameIdx::ROOT,
        ));
        f.block_mut(b).term = Terminator::Return(SymId(0));
        let target = PortableTarget::new();
        let body = emit(&target, &mut f).unwrap();
        let region = alloc.allocate(&body.code).unwrap();
        EntryPoint::new(&target, body, tier, region).unwrap()
    }

    #[test]
    fn test_install_swaps_and_marks_stale() {
        let alloc = HeapCodeAllocator::default();
        let table = EntryTable::new();
        let key = EntryKey::function(FuncId(2));
        assert!(table.install(entry(&alloc, Tier::Simple)).is_none());
        let first = table.get(key).unwrap();
        assert_eq!(first.code.len(), 1);

        let old = table.install(entry(&alloc, Tier::Full)).unwrap();
        assert!(Arc::ptr_eq(&old, &first));
        assert!(first.is_stale());
        assert_eq!(table.tier_of(key), Some(Tier::Full));
        assert!(!table.get(key).unwrap().is_stale());
    }

    #[test]
    fn test_invalidate_falls_back() {
        let alloc = HeapCodeAllocator::default();
        let table = EntryTable::new();
        let key = EntryKey::function(FuncId(2));
        table.install(entry(&alloc, Tier::Full));
        let old = table.invalidate(key).unwrap();
        assert!(old.is_stale());
        assert!(table.get(key).is_none());
        assert!(table.is_empty());
        let region = Arc::try_unwrap(old).unwrap().into_region().unwrap();
        alloc.release(region);
        assert_eq!(alloc.used(), 0);
    }
}

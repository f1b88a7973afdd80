//! Code memory
//!
//! Compiled bodies are placed through a `CodeAllocator`. The embedder owns
//! executable memory; the default allocator keeps code on the heap and only
//! enforces a byte budget.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use super::traits::CodegenError;

/// Placed code owned by an allocator
#[derive(Debug)]
pub struct CodeRegion {
    pub id: u64,
    bytes: Arc<[u8]>,
}

impl CodeRegion {
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

pub trait CodeAllocator: Send + Sync {
    fn allocate(&self, code: &[u8]) -> Result<CodeRegion, CodegenError>;

    /// Give a region back once nothing can run it
    fn release(&self, region: CodeRegion);

    /// Bytes currently placed
    fn used(&self) -> usize;
}

#[derive(Debug)]
pub struct HeapCodeAllocator {
    capacity: usize,
    used: AtomicUsize,
    next_id: AtomicU64,
}

impl HeapCodeAllocator {
    pub fn new(capacity: usize) -> Self {
        HeapCodeAllocator {
            capacity,
            used: AtomicUsize::new(0),
            next_id: AtomicU64::new(0),
        }
    }
}

impl Default for HeapCodeAllocator {
    fn default() -> Self {
        Self::new(64 * 1024 * 1024)
    }
}

impl CodeAllocator for HeapCodeAllocator {
    fn allocate(&self, code: &[u8]) -> Result<CodeRegion, CodegenError> {
        let size = code.len();
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(size).filter(|total| *total <= self.capacity)
            })
            .map_err(|_| CodegenError::OutOfCodeMemory(size))?;
        Ok(CodeRegion {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            bytes: Arc::from(code),
        })
    }

    fn release(&self, region: CodeRegion) {
        self.used.fetch_sub(region.len(), Ordering::AcqRel);
    }

    fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_is_enforced() {
        let alloc = HeapCodeAllocator::new(8);
        let a = alloc.allocate(&[1, 2, 3, 4, 5]).unwrap();
        assert_eq!(a.bytes(), &[1, 2, 3, 4, 5]);
        assert!(matches!(alloc.allocate(&[0; 4]), Err(CodegenError::OutOfCodeMemory(4))));
        alloc.release(a);
        assert_eq!(alloc.used(), 0);
        let b = alloc.allocate(&[0; 8]).unwrap();
        assert_eq!(b.len(), 8);
        assert_ne!(b.id, 0);
    }
}

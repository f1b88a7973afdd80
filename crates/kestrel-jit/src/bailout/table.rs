//! Global bailout table
//!
//! For every captured symbol, a sorted list of non-overlapping bailout-id
//! ranges, each mapped to the native location holding the symbol for the
//! bailouts in that range. Built once by the emitter and immutable after.

use rustc_hash::FxHashMap;

use crate::ir::SymId;

use super::{BailoutError, NativeLocation};

/// Inclusive id range `start..=end` sharing one location
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TableRow {
    pub start: u32,
    pub end: u32,
    pub location: NativeLocation,
}

/// Accumulates rows in increasing bailout id order
#[derive(Debug, Default)]
pub struct TableBuilder {
    rows: FxHashMap<SymId, Vec<TableRow>>,
}

impl TableBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record that `sym` lives at `location` for bailout `id`.
    ///
    /// Ids for one symbol must not decrease. Recording the same pair twice is
    /// a no-op; adjacent ids with one location extend the last row.
    pub fn record(&mut self, sym: SymId, id: u32, location: NativeLocation) -> Result<(), BailoutError> {
        let rows = self.rows.entry(sym).or_default();
        match rows.last_mut() {
            Some(last) if id < last.end => return Err(BailoutError::OutOfOrder { sym, id }),
            Some(last) if id == last.end => {
                if last.location != location {
                    return Err(BailoutError::OutOfOrder { sym, id });
                }
            }
            Some(last) if id == last.end + 1 && last.location == location => last.end = id,
            _ => rows.push(TableRow {
                start: id,
                end: id,
                location,
            }),
        }
        Ok(())
    }

    pub fn build(self) -> GlobalBailoutTable {
        GlobalBailoutTable { rows: self.rows }
    }
}

#[derive(Debug, Default, Clone)]
pub struct GlobalBailoutTable {
    rows: FxHashMap<SymId, Vec<TableRow>>,
}

impl GlobalBailoutTable {
    /// Location of `sym` when bailout `id` fires
    pub fn lookup(&self, sym: SymId, id: u32) -> Option<NativeLocation> {
        let rows = self.rows.get(&sym)?;
        let idx = rows.partition_point(|r| r.end < id);
        rows.get(idx)
            .filter(|r| r.start <= id)
            .map(|r| r.location)
    }

    pub fn rows(&self, sym: SymId) -> &[TableRow] {
        self.rows.get(&sym).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn symbol_count(&self) -> usize {
        self.rows.len()
    }

    pub fn row_count(&self) -> usize {
        self.rows.values().map(Vec::len).sum()
    }

    /// Rows of every symbol are sorted, well-formed and non-overlapping
    pub fn is_well_formed(&self) -> bool {
        self.rows.values().all(|rows| {
            rows.iter().all(|r| r.start <= r.end)
                && rows.windows(2).all(|w| w[0].end < w[1].start)
        })
    }
}

/*!
 * Debug-Record Table
 * Live-allocation tracking for leak and double-free detection
 */

use crate::types::Size;
use ahash::RandomState;
use std::collections::HashMap;
use std::panic::Location;

/// One live allocation, keyed by pointer value in the table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AllocRecord {
    pub size: Size,
    pub location: &'static Location<'static>,
}

/// Why a verify-and-remove failed. Either way the free does not match a
/// live allocation: a double free, a cross-context free, or corruption.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum RecordFault {
    Unknown,
    SizeMismatch { recorded: Size },
}

/// Pointer-keyed table of live allocations.
///
/// Lives in the context state and is allocated by the global allocator,
/// never by the backend it tracks.
#[derive(Debug, Default)]
pub(crate) struct RecordTable {
    live: HashMap<usize, AllocRecord, RandomState>,
}

impl RecordTable {
    pub fn insert(&mut self, ptr: usize, size: Size, location: &'static Location<'static>) {
        let prev = self.live.insert(ptr, AllocRecord { size, location });
        debug_assert!(prev.is_none(), "backend returned a live pointer twice");
    }

    /// Remove the record for `ptr`, checking the caller-supplied size.
    pub fn remove(&mut self, ptr: usize, size: Size) -> Result<AllocRecord, RecordFault> {
        match self.live.remove(&ptr) {
            None => Err(RecordFault::Unknown),
            Some(rec) if rec.size != size => Err(RecordFault::SizeMismatch { recorded: rec.size }),
            Some(rec) => Ok(rec),
        }
    }

    pub fn contains(&self, ptr: usize) -> bool {
        self.live.contains_key(&ptr)
    }

    pub fn len(&self) -> usize {
        self.live.len()
    }

    pub fn is_empty(&self) -> bool {
        self.live.is_empty()
    }

    /// Live entries sorted by pointer value, for stable diagnostic output.
    pub fn entries(&self) -> Vec<(usize, AllocRecord)> {
        let mut entries: Vec<_> = self.live.iter().map(|(p, r)| (*p, *r)).collect();
        entries.sort_unstable_by_key(|(p, _)| *p);
        entries
    }
}

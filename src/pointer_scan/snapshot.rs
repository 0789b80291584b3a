//! Snapshot assembly: raw pointer pairs grouped into buckets by pointed-to value.

use crate::pointer_scan::pointer_index::PointerIndex;
use crate::pointer_scan::types::{ModuleInfo, PointerBucket, PointerData, PointerRecord};
use dashmap::DashMap;
use log::{debug, log_enabled, Level};
use rayon::prelude::*;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Initial record capacity for a bucket keyed by `value`.
///
/// Values on coarser alignment boundaries tend to be referenced more often.
pub fn expected_bucket_size(value: i64) -> usize {
    if value % 0x10 != 0 {
        1
    } else if value % 0x100 != 0 {
        5
    } else if value % 0x1000 != 0 {
        10
    } else if value % 0x10000 != 0 {
        20
    } else {
        50
    }
}

/// Collects pointer pairs from any number of threads and freezes them into a [`PointerIndex`].
pub struct SnapshotBuilder {
    modules: Vec<ModuleInfo>,
    /// Pointed-to values must be a multiple of this (0 or 1 accepts everything)
    align: u32,
    buckets: DashMap<i64, PointerBucket>,
    skipped: AtomicUsize,
}

impl SnapshotBuilder {
    pub fn new(modules: Vec<ModuleInfo>) -> Self {
        Self {
            modules,
            align: 4,
            buckets: DashMap::new(),
            skipped: AtomicUsize::new(0),
        }
    }

    pub fn with_align(mut self, align: u32) -> Self {
        self.align = align;
        self
    }

    pub fn modules(&self) -> &[ModuleInfo] {
        &self.modules
    }

    /// Pairs rejected so far (misaligned value, or located in a system module).
    pub fn skipped(&self) -> usize {
        self.skipped.load(Ordering::Relaxed)
    }

    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn module_of(&self, address: i64) -> Option<&ModuleInfo> {
        self.modules.iter().find(|m| m.contains(address))
    }

    /// Record that `address` holds a pointer to `value`.
    ///
    /// Returns false when the pair was skipped.
    pub fn add_pointer(&self, value: i64, address: i64) -> bool {
        if self.align > 1 && value % self.align as i64 != 0 {
            self.skipped.fetch_add(1, Ordering::Relaxed);
            return false;
        }

        let record = match self.module_of(address) {
            Some(module) if module.is_system_module() => {
                self.skipped.fetch_add(1, Ordering::Relaxed);
                return false;
            },
            Some(module) => PointerRecord::static_root(address, module.module_index, module.offset_from_base(address)),
            None => PointerRecord::dynamic(address),
        };

        self.buckets
            .entry(value)
            .or_insert_with(|| PointerBucket::with_capacity(value, expected_bucket_size(value)))
            .push(record);
        true
    }

    /// Add a batch of pairs in parallel. Returns how many were accepted.
    pub fn add_pointers_par(&self, pointers: &[PointerData]) -> usize {
        pointers
            .par_iter()
            .filter(|p| self.add_pointer(p.value, p.address))
            .count()
    }

    /// Freeze the collected buckets into an index.
    pub fn build(self) -> PointerIndex {
        if log_enabled!(Level::Debug) {
            debug!(
                "SnapshotBuilder: {} buckets, {} pairs skipped",
                self.buckets.len(),
                self.skipped()
            );
        }

        let buckets: Vec<PointerBucket> = self.buckets.into_iter().map(|(_, bucket)| bucket).collect();
        PointerIndex::from_buckets(buckets)
    }
}

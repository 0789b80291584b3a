//! Immutable reverse pointer index.
//!
//! Buckets are kept in one ascending, contiguous sequence. The bucket with the
//! next-lower key is always at `index - 1`, so a window walk is a plain
//! positional descent with no linked list to keep consistent.

use crate::pointer_scan::types::PointerBucket;
use log::{debug, log_enabled, warn, Level};
use rayon::prelude::*;
use std::collections::HashMap;
use std::time::Instant;

/// Reverse index from pointed-to value to the records holding it.
///
/// Read-only after [`PointerIndex::build`]; shared between scan workers without locking.
#[derive(Debug, Default)]
pub struct PointerIndex {
    /// Exact key -> position lookup
    lookup: HashMap<i64, usize>,
    /// Buckets in ascending key order
    buckets: Vec<PointerBucket>,
}

impl PointerIndex {
    /// Build the index from parallel key/bucket sequences.
    ///
    /// Keys are expected to be unique. The key sequence is authoritative: each bucket
    /// is re-keyed with the key supplied at the same position.
    pub fn build(keys: &[i64], buckets: Vec<PointerBucket>) -> Self {
        let timer = Instant::now();

        if keys.len() != buckets.len() {
            warn!(
                "PointerIndex::build: {} keys but {} buckets, extra entries are ignored",
                keys.len(),
                buckets.len()
            );
        }

        let mut entries: Vec<PointerBucket> = keys
            .iter()
            .zip(buckets)
            .map(|(&key, mut bucket)| {
                if bucket.key() != key {
                    bucket.set_key(key);
                }
                bucket
            })
            .collect();

        // 稳定排序：重复 key 保持输入顺序
        entries.par_sort_by_key(|bucket| bucket.key());

        let mut lookup = HashMap::with_capacity(entries.len());
        for (position, bucket) in entries.iter().enumerate() {
            lookup.entry(bucket.key()).or_insert(position);
        }

        if log_enabled!(Level::Debug) {
            debug!(
                "PointerIndex built: {} buckets, {} records, {:.3}ms",
                entries.len(),
                entries.iter().map(PointerBucket::len).sum::<usize>(),
                timer.elapsed().as_secs_f64() * 1000.0
            );
        }

        Self { lookup, buckets: entries }
    }

    /// Build the index keyed by each bucket's own key.
    pub fn from_buckets(buckets: Vec<PointerBucket>) -> Self {
        let keys: Vec<i64> = buckets.iter().map(PointerBucket::key).collect();
        Self::build(&keys, buckets)
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }

    /// Buckets in ascending key order.
    pub fn buckets(&self) -> &[PointerBucket] {
        &self.buckets
    }

    /// Largest position whose key lies in `[min_value, searched_key]`.
    pub fn closest_lower_index(&self, searched_key: i64, min_value: i64) -> Option<usize> {
        let upper = self.buckets.partition_point(|bucket| bucket.key() <= searched_key);
        let candidate = upper.checked_sub(1)?;
        (self.buckets[candidate].key() >= min_value).then_some(candidate)
    }

    /// Bounds-checked positional lookup.
    #[inline]
    pub fn bucket_at(&self, index: usize) -> Option<&PointerBucket> {
        self.buckets.get(index)
    }

    /// The bucket with the next-lower key.
    #[inline]
    pub fn predecessor(&self, index: usize) -> Option<&PointerBucket> {
        index.checked_sub(1).and_then(|i| self.bucket_at(i))
    }

    /// Exact lookup by key.
    pub fn get(&self, key: i64) -> Option<&PointerBucket> {
        self.lookup.get(&key).and_then(|&i| self.bucket_at(i))
    }

    /// Exact hit on `stop_value`, else the closest lower key not below `start_value`.
    ///
    /// Kept for callers that resolve a single bucket; window walks use
    /// [`closest_lower_index`](Self::closest_lower_index) and positional descent instead.
    pub fn exact_or_lower_bucket(&self, start_value: i64, stop_value: i64) -> Option<&PointerBucket> {
        self.get(stop_value).or_else(|| {
            self.closest_lower_index(stop_value, start_value)
                .and_then(|i| self.bucket_at(i))
        })
    }
}

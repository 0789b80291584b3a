//! Reverse Pointer Scan Module
//!
//! Counts every pointer path that leads from a static module location to a
//! target address, walking backwards from the target through a snapshot of
//! the process's pointers.
//!
//! # Architecture
//!
//! - `types`: Core data structures (PointerBucket, ModuleInfo, ResultPointer, config, errors)
//! - `snapshot`: Groups raw pointer pairs into buckets and classifies static records
//! - `pointer_index`: Immutable ascending bucket sequence with closest-lower search
//! - `task_queue`: Fixed-capacity hand-off queue and quiescence barrier
//! - `reverse_scan`: Worker that runs the bounded depth-first descent
//! - `manager`: Spawns workers, waits for quiescence and sums the counters
//!
//! # Usage
//!
//! ```ignore
//! use revscan_core::pointer_scan::{ReverseScanConfig, ReverseScanner, SnapshotBuilder};
//!
//! let builder = SnapshotBuilder::new(modules);
//! builder.add_pointers_par(&pointer_pairs);
//!
//! let scanner = ReverseScanner::new(builder.build(), ReverseScanConfig::new(5, 0x1000))?;
//! let outcome = scanner.start_scan(target_address)?;
//! println!("{} paths", outcome.total_hits);
//! ```

pub mod manager;
pub mod pointer_index;
pub mod reverse_scan;
pub mod snapshot;
pub mod task_queue;
pub mod types;

#[cfg(test)]
pub mod tests;

// Re-export commonly used types
pub use manager::{scan, scan_with_config, ReverseScanner, ScanOutcome};
pub use pointer_index::PointerIndex;
pub use reverse_scan::ScanResult;
pub use snapshot::SnapshotBuilder;
pub use types::*;

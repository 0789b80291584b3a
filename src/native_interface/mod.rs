//! Exported C entry points.

pub mod pointer_scan;

pub use pointer_scan::{BucketDescriptor, ModuleDescriptor, RecordDescriptor, StaticDataDescriptor};

//! C ABI for the reverse pointer scanner.
//!
//! The caller owns every descriptor array for the duration of a call. Counts are
//! returned as non-negative `i32`; failures are the negated [`ScanErrorCode`].

use crate::core::logger::init_logger;
use crate::pointer_scan::manager::ReverseScanner;
use crate::pointer_scan::pointer_index::PointerIndex;
use crate::pointer_scan::types::{
    ModuleInfo, PointerBucket, PointerRecord, ReverseScanConfig, ScanAborted, ScanErrorCode, StaticRef,
};
use anyhow::{anyhow, Result};
use log::{error, info, log_enabled, Level};
use std::ffi::{c_char, CStr, CString};
use std::ptr;
use std::slice;

/// Module-relative location of a static record.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct StaticDataDescriptor {
    pub has_value: bool,
    pub module_index: i32,
    pub offset: i64,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default)]
pub struct RecordDescriptor {
    pub address: i64,
    pub static_data: StaticDataDescriptor,
}

impl RecordDescriptor {
    pub fn to_record(&self) -> PointerRecord {
        let static_ref = self.static_data.has_value.then_some(StaticRef {
            module_index: self.static_data.module_index,
            offset: self.static_data.offset,
        });
        PointerRecord {
            address: self.address,
            static_ref,
        }
    }
}

/// One bucket as laid out by the caller. Only the first `pos` records are used.
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct BucketDescriptor {
    pub max_size: i32,
    pub expected_size: i32,
    pub pos: i32,
    pub records: *const RecordDescriptor,
    pub key: i64,
    /// Ignored: ordering is rebuilt from the key array
    pub previous: *const BucketDescriptor,
}

impl BucketDescriptor {
    /// # Safety
    /// `records` must point to at least `pos` initialized records, or be null.
    pub unsafe fn to_bucket(&self) -> PointerBucket {
        let used = self.pos.max(0) as usize;
        if used == 0 || self.records.is_null() {
            return PointerBucket::new(self.key);
        }
        let records = unsafe { slice::from_raw_parts(self.records, used) };
        PointerBucket::from_records(self.key, records.iter().map(RecordDescriptor::to_record).collect())
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct ModuleDescriptor {
    /// NUL-terminated module path, may be null
    pub name: *const c_char,
    pub base_address: i64,
    pub size: u32,
    pub module_index: i32,
}

impl ModuleDescriptor {
    /// # Safety
    /// `name` must be null or a valid NUL-terminated string.
    pub unsafe fn to_module_info(&self) -> ModuleInfo {
        let name = if self.name.is_null() {
            String::new()
        } else {
            unsafe { CStr::from_ptr(self.name) }.to_string_lossy().into_owned()
        };
        ModuleInfo::new(name, self.base_address, self.size, self.module_index)
    }
}

fn invalid_argument(detail: impl Into<String>) -> anyhow::Error {
    anyhow!(ScanAborted::new(ScanErrorCode::InvalidArgument, detail))
}

/// Copy the caller's parallel key/bucket arrays into an index.
unsafe fn read_index(keys: *const i64, buckets: *const BucketDescriptor, count: i32) -> Result<PointerIndex> {
    if count < 0 {
        return Err(invalid_argument(format!("negative bucket count {}", count)));
    }
    if count == 0 {
        return Ok(PointerIndex::default());
    }
    if keys.is_null() || buckets.is_null() {
        return Err(invalid_argument("null key or bucket array"));
    }

    let keys = unsafe { slice::from_raw_parts(keys, count as usize) };
    let descriptors = unsafe { slice::from_raw_parts(buckets, count as usize) };
    let buckets = descriptors.iter().map(|d| unsafe { d.to_bucket() }).collect();
    Ok(PointerIndex::build(keys, buckets))
}

/// # Safety
/// `modules` must point to `count` descriptors, or be null with `count == 0`.
unsafe fn read_modules(modules: *const ModuleDescriptor, count: i32) -> Result<Vec<ModuleInfo>> {
    if count < 0 {
        return Err(invalid_argument(format!("negative module count {}", count)));
    }
    if count == 0 || modules.is_null() {
        return Ok(Vec::new());
    }
    let descriptors = unsafe { slice::from_raw_parts(modules, count as usize) };
    Ok(descriptors.iter().map(|d| unsafe { d.to_module_info() }).collect())
}

/// Options JSON, or defaults for a null pointer.
unsafe fn read_options(options_json: *const c_char) -> Result<ReverseScanConfig> {
    if options_json.is_null() {
        return Ok(ReverseScanConfig::default());
    }
    let json = unsafe { CStr::from_ptr(options_json) }
        .to_str()
        .map_err(|e| invalid_argument(format!("options are not utf-8: {}", e)))?;
    ReverseScanConfig::from_json(json)
}

fn apply_limits(mut config: ReverseScanConfig, max_level: i32, struct_size: i32) -> Result<ReverseScanConfig> {
    if max_level < 0 || struct_size < 0 {
        return Err(invalid_argument(format!(
            "negative limits: max_level={}, struct_size={}",
            max_level, struct_size
        )));
    }
    config.max_level = max_level as u32;
    config.struct_size = struct_size as u32;
    Ok(config)
}

fn saturate_count(hits: u64) -> i32 {
    hits.min(i32::MAX as u64) as i32
}

fn error_code(err: &anyhow::Error) -> i32 {
    let code = ScanAborted::code_of(err);
    error!("Reverse pointer scan failed: {:#}", err);
    -(code as i32)
}

unsafe fn run_scan(
    keys: *const i64,
    buckets: *const BucketDescriptor,
    count: i32,
    target: i64,
    max_level: i32,
    struct_size: i32,
    options_json: *const c_char,
) -> Result<u64> {
    let config = apply_limits(unsafe { read_options(options_json) }?, max_level, struct_size)?;
    let index = unsafe { read_index(keys, buckets, count) }?;
    let scanner = ReverseScanner::new(index, config)?;
    Ok(scanner.start_scan(target)?.total_hits)
}

/// Count pointer paths from `target` back to static roots with default options.
///
/// Returns the count saturated to `i32::MAX`, or a negated [`ScanErrorCode`].
///
/// # Safety
/// `keys` and `buckets` must each point to `count` elements; every bucket's
/// `records` must point to at least `pos` records.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub unsafe extern "C" fn StartPointerScan(
    keys: *const i64,
    buckets: *const BucketDescriptor,
    count: i32,
    target: i64,
    max_level: i32,
    struct_size: i32,
) -> i32 {
    unsafe { StartPointerScanWithOptions(keys, buckets, count, target, max_level, struct_size, ptr::null()) }
}

/// [`StartPointerScan`] with a JSON-encoded `ReverseScanConfig`. `max_level` and
/// `struct_size` override the corresponding option fields.
///
/// # Safety
/// As for [`StartPointerScan`]; `options_json` must be null or NUL-terminated.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub unsafe extern "C" fn StartPointerScanWithOptions(
    keys: *const i64,
    buckets: *const BucketDescriptor,
    count: i32,
    target: i64,
    max_level: i32,
    struct_size: i32,
    options_json: *const c_char,
) -> i32 {
    init_logger();

    if log_enabled!(Level::Debug) {
        info!(
            "StartPointerScan: buckets={}, target=0x{:X}, max_level={}, struct_size=0x{:X}",
            count, target, max_level, struct_size
        );
    }

    match unsafe { run_scan(keys, buckets, count, target, max_level, struct_size, options_json) } {
        Ok(hits) => saturate_count(hits),
        Err(e) => error_code(&e),
    }
}

/// Scan with path collection and return the chains as a JSON array of strings.
///
/// The hit count (or negated error code) is written to `out_hits` when non-null.
/// Returns null on failure; a non-null result must be released with [`FreeScanString`].
///
/// # Safety
/// As for [`StartPointerScanWithOptions`]; `modules` must point to
/// `module_count` descriptors or be null.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub unsafe extern "C" fn ScanPointerPaths(
    keys: *const i64,
    buckets: *const BucketDescriptor,
    count: i32,
    target: i64,
    options_json: *const c_char,
    modules: *const ModuleDescriptor,
    module_count: i32,
    out_hits: *mut i64,
) -> *mut c_char {
    init_logger();

    let result = (|| -> Result<(u64, String)> {
        let mut config = unsafe { read_options(options_json) }?;
        config.collect_paths = true;
        let modules = unsafe { read_modules(modules, module_count) }?;
        let index = unsafe { read_index(keys, buckets, count) }?;

        let outcome = ReverseScanner::new(index, config)?.start_scan(target)?;
        let chains: Vec<String> = outcome.chains(&modules).iter().map(|c| c.format()).collect();
        Ok((outcome.total_hits, serde_json::to_string(&chains)?))
    })();

    let (hits, json) = match result {
        Ok(ok) => ok,
        Err(e) => {
            let code = error_code(&e);
            if !out_hits.is_null() {
                unsafe { *out_hits = code as i64 };
            }
            return ptr::null_mut();
        },
    };

    if !out_hits.is_null() {
        unsafe { *out_hits = hits.min(i64::MAX as u64) as i64 };
    }
    match CString::new(json) {
        Ok(s) => s.into_raw(),
        Err(e) => {
            error!("Path json contains NUL: {}", e);
            ptr::null_mut()
        },
    }
}

/// Release a string returned by [`ScanPointerPaths`].
///
/// # Safety
/// `s` must be null or a pointer obtained from [`ScanPointerPaths`] and not freed before.
#[unsafe(no_mangle)]
#[allow(non_snake_case)]
pub unsafe extern "C" fn FreeScanString(s: *mut c_char) {
    if !s.is_null() {
        drop(unsafe { CString::from_raw(s) });
    }
}

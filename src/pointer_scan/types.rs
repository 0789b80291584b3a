use anyhow::{anyhow, Result};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Fill pattern for offset trails of a freshly seeded task.
pub const OFFSET_TRAIL_SENTINEL: u32 = 0xcece_cece;

/// Fill pattern for visited trails of a freshly seeded task.
pub const VISITED_TRAIL_SENTINEL: i64 = 0xcece_cece_cece_cece_u64 as i64;

/// Raw pointer pair as produced by a memory capture.
#[repr(C)]
#[derive(Debug, PartialEq, Eq, Clone, Copy)]
pub struct PointerData {
    /// The address where this pointer is located in memory
    pub address: i64,
    /// The value this pointer points to
    pub value: i64,
}

impl PointerData {
    pub fn new(address: i64, value: i64) -> Self {
        Self { address, value }
    }
}

/// Module-relative location of a pointer that lives in static memory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct StaticRef {
    pub module_index: i32,
    pub offset: i64,
}

/// A location holding a pointer. Records with a static reference end a path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PointerRecord {
    pub address: i64,
    pub static_ref: Option<StaticRef>,
}

impl PointerRecord {
    pub fn dynamic(address: i64) -> Self {
        Self { address, static_ref: None }
    }

    pub fn static_root(address: i64, module_index: i32, offset: i64) -> Self {
        Self {
            address,
            static_ref: Some(StaticRef { module_index, offset }),
        }
    }

    #[inline]
    pub fn is_static(&self) -> bool {
        self.static_ref.is_some()
    }
}

/// Every record whose pointed-to value equals `key`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PointerBucket {
    key: i64,
    records: Vec<PointerRecord>,
}

impl PointerBucket {
    pub fn new(key: i64) -> Self {
        Self { key, records: Vec::new() }
    }

    pub fn with_capacity(key: i64, capacity: usize) -> Self {
        Self {
            key,
            records: Vec::with_capacity(capacity),
        }
    }

    pub fn from_records(key: i64, records: Vec<PointerRecord>) -> Self {
        Self { key, records }
    }

    /// The value every record in this bucket points to.
    #[inline]
    pub fn key(&self) -> i64 {
        self.key
    }

    pub(crate) fn set_key(&mut self, key: i64) {
        self.key = key;
    }

    #[inline]
    pub fn records(&self) -> &[PointerRecord] {
        &self.records
    }

    pub fn push(&mut self, record: PointerRecord) {
        self.records.push(record);
    }

    /// Number of used record slots.
    #[inline]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

/// Module metadata used to classify static pointers and to name chain roots.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleInfo {
    /// Full module path (e.g., "C:\\Windows\\System32\\kernel32.dll")
    pub name: String,
    /// Module base address
    pub base_address: i64,
    /// Module image size in bytes
    pub size: u32,
    /// Index referenced by [`StaticRef::module_index`]
    pub module_index: i32,
}

impl ModuleInfo {
    pub fn new(name: impl Into<String>, base_address: i64, size: u32, module_index: i32) -> Self {
        Self {
            name: name.into(),
            base_address,
            size,
            module_index,
        }
    }

    /// File name without its directory.
    pub fn short_name(&self) -> &str {
        self.name.rsplit(['\\', '/']).next().unwrap_or(&self.name)
    }

    /// True for modules that live under the OS directory.
    pub fn is_system_module(&self) -> bool {
        self.name.to_ascii_lowercase().contains("windows\\")
    }

    pub fn end_address(&self) -> i64 {
        self.base_address.saturating_add(self.size as i64)
    }

    pub fn contains(&self, address: i64) -> bool {
        address >= self.base_address && address < self.end_address()
    }

    pub fn offset_from_base(&self, address: i64) -> i64 {
        address - self.base_address
    }
}

/// A terminal match captured during the descent.
///
/// `offsets[0]` is the displacement into the target's struct, `offsets[level]` the
/// displacement applied right after dereferencing the static root.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResultPointer {
    pub module_index: i32,
    pub base_offset: i64,
    pub level: u32,
    pub offsets: Vec<u32>,
}

impl ResultPointer {
    /// Resolve the module name and lay the offsets out from root to target.
    pub fn to_chain(&self, target_address: i64, modules: &[ModuleInfo]) -> PointerChain {
        let module_name = modules
            .iter()
            .find(|m| m.module_index == self.module_index)
            .map(|m| m.short_name().to_string())
            .unwrap_or_else(|| format!("module#{}", self.module_index));

        let mut chain = PointerChain::with_capacity(target_address, self.offsets.len() + 1);
        chain.push(PointerChainStep::static_root(module_name, self.module_index, self.base_offset));
        for &offset in self.offsets.iter().rev() {
            chain.push(PointerChainStep::dynamic_offset(offset as i64));
        }
        chain
    }
}

/// A single step in a pointer chain.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointerChainStep {
    /// Module name if this is a static pointer, None if dynamic
    pub module_name: Option<String>,
    /// Module index (for duplicate module names)
    pub module_index: i32,
    /// Offset from module base (if static) or from previous pointer value
    pub offset: i64,
    /// True if this is the chain root (from static module)
    pub is_static: bool,
}

impl PointerChainStep {
    pub fn static_root(module_name: String, module_index: i32, offset: i64) -> Self {
        Self {
            module_name: Some(module_name),
            module_index,
            offset,
            is_static: true,
        }
    }

    pub fn dynamic_offset(offset: i64) -> Self {
        Self {
            module_name: None,
            module_index: 0,
            offset,
            is_static: false,
        }
    }
}

/// Complete pointer chain from a static module to the target address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PointerChain {
    /// Chain steps from root to target
    pub steps: Vec<PointerChainStep>,
    /// The final target address this chain points to
    pub target_address: i64,
}

impl PointerChain {
    pub fn with_capacity(target_address: i64, capacity: usize) -> Self {
        Self {
            steps: Vec::with_capacity(capacity),
            target_address,
        }
    }

    pub fn push(&mut self, step: PointerChainStep) {
        self.steps.push(step);
    }

    /// Number of dereferences in the chain.
    pub fn depth(&self) -> usize {
        self.steps.len().saturating_sub(1)
    }

    /// Format the chain as a string like "game.exe[0]+0x1A2B3C0->+0x18->+0x20"
    pub fn format(&self) -> String {
        let Some(root) = self.steps.first() else {
            return String::new();
        };

        let mut result = String::with_capacity(128);
        if let Some(ref name) = root.module_name {
            result.push_str(&format!("{}[{}]+0x{:X}", name, root.module_index, root.offset));
        }

        let tail = self.steps[1..]
            .iter()
            .map(|step| {
                if step.offset >= 0 {
                    format!("->+0x{:X}", step.offset)
                } else {
                    format!("->-0x{:X}", step.offset.unsigned_abs())
                }
            })
            .join("");
        result.push_str(&tail);
        result
    }
}

impl fmt::Display for PointerChain {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.format())
    }
}

/// Configuration for a reverse pointer scan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReverseScanConfig {
    /// Maximum hop count of a chain (default: 5)
    pub max_level: u32,
    /// Maximum structural offset per hop in bytes (default: 0x1000)
    pub struct_size: u32,
    /// Worker threads draining the task queue (default: 6)
    pub worker_count: usize,
    /// Task slots in the shared queue (default: 64)
    pub queue_capacity: usize,
    /// Abandon branches revisiting a value already on their path
    pub no_loop: bool,
    /// Buckets visited per call below the root level, None for unlimited (default: 3)
    pub max_offsets_per_node: Option<u32>,
    /// Branches this close to `max_level` never leave their worker (default: 3)
    pub handoff_reserve_levels: u32,
    /// Capture a [`ResultPointer`] for every terminal match
    pub collect_paths: bool,
    /// Upper bound on captured paths (the count is never capped)
    pub max_paths: usize,
    /// Abort the scan when it runs longer than this many milliseconds
    pub watchdog_ms: Option<u64>,
}

impl Default for ReverseScanConfig {
    fn default() -> Self {
        Self {
            max_level: 5,
            struct_size: 0x1000,
            worker_count: 6,
            queue_capacity: 64,
            no_loop: true,
            max_offsets_per_node: Some(3),
            handoff_reserve_levels: 3,
            collect_paths: false,
            max_paths: 100_000,
            watchdog_ms: None,
        }
    }
}

impl ReverseScanConfig {
    pub fn new(max_level: u32, struct_size: u32) -> Self {
        Self {
            max_level,
            struct_size,
            ..Default::default()
        }
    }

    pub fn with_workers(mut self, worker_count: usize) -> Self {
        self.worker_count = worker_count;
        self
    }

    pub fn with_queue_capacity(mut self, queue_capacity: usize) -> Self {
        self.queue_capacity = queue_capacity;
        self
    }

    pub fn with_no_loop(mut self, no_loop: bool) -> Self {
        self.no_loop = no_loop;
        self
    }

    pub fn with_max_offsets_per_node(mut self, limit: Option<u32>) -> Self {
        self.max_offsets_per_node = limit;
        self
    }

    pub fn with_paths(mut self, max_paths: usize) -> Self {
        self.collect_paths = true;
        self.max_paths = max_paths;
        self
    }

    pub fn with_watchdog_ms(mut self, millis: u64) -> Self {
        self.watchdog_ms = Some(millis);
        self
    }

    /// Length of the per-branch trails.
    #[inline]
    pub fn trail_len(&self) -> usize {
        self.max_level as usize + 1
    }

    pub fn validate(&self) -> Result<()> {
        if self.worker_count == 0 {
            return Err(anyhow!(ScanAborted::new(ScanErrorCode::InvalidConfig, "worker_count must be at least 1")));
        }
        if self.queue_capacity == 0 {
            return Err(anyhow!(ScanAborted::new(ScanErrorCode::InvalidConfig, "queue_capacity must be at least 1")));
        }
        Ok(())
    }

    pub fn from_json(json: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(json)
            .map_err(|e| anyhow!(ScanAborted::new(ScanErrorCode::InvalidConfig, format!("bad options json: {}", e))))?;
        config.validate()?;
        Ok(config)
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Lifecycle of a scan worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum WorkerState {
    Idle = 0,
    Scanning = 1,
    Terminated = 2,
}

impl From<u8> for WorkerState {
    fn from(value: u8) -> Self {
        match value {
            1 => WorkerState::Scanning,
            2 => WorkerState::Terminated,
            _ => WorkerState::Idle,
        }
    }
}

/// Error codes for reverse scanning. Negated at the C boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[repr(i32)]
pub enum ScanErrorCode {
    /// No error
    None = 0,
    /// Options rejected by validation
    InvalidConfig = 1,
    /// Null or negative arguments at the call boundary
    InvalidArgument = 2,
    /// A worker thread could not be started
    ThreadSpawnFailed = 3,
    /// The scan outlived its watchdog
    WatchdogExpired = 4,
    /// The caller cancelled the scan
    Cancelled = 5,
    /// A worker thread panicked
    WorkerPanicked = 6,
    /// Internal error
    InternalError = 7,
}

/// Typed cause carried inside `anyhow::Error` for aborted scans.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScanAborted {
    pub code: ScanErrorCode,
    pub detail: String,
}

impl ScanAborted {
    pub fn new(code: ScanErrorCode, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }

    /// Error code behind an `anyhow::Error`, `InternalError` when it is not a scan abort.
    pub fn code_of(err: &anyhow::Error) -> ScanErrorCode {
        err.downcast_ref::<ScanAborted>()
            .map(|aborted| aborted.code)
            .unwrap_or(ScanErrorCode::InternalError)
    }
}

impl fmt::Display for ScanAborted {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "scan aborted ({:?}): {}", self.code, self.detail)
    }
}

impl std::error::Error for ScanAborted {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_module_short_name_and_system_flag() {
        let module = ModuleInfo::new("C:\\Windows\\System32\\KERNEL32.DLL", 0x7FF0_0000, 0x1000, 0);
        assert_eq!(module.short_name(), "KERNEL32.DLL");
        assert!(module.is_system_module());

        let game = ModuleInfo::new("D:\\Games\\game.exe", 0x40_0000, 0x2000, 1);
        assert_eq!(game.short_name(), "game.exe");
        assert!(!game.is_system_module());
        assert!(game.contains(0x40_1FF8));
        assert!(!game.contains(0x40_2000));
        assert_eq!(game.offset_from_base(0x40_0010), 0x10);

        let bare = ModuleInfo::new("libgame.so", 0, 0, 2);
        assert_eq!(bare.short_name(), "libgame.so");
    }

    #[test]
    fn test_chain_format_root_to_target() {
        let modules = vec![ModuleInfo::new("D:\\Games\\game.exe", 0x40_0000, 0x2000, 1)];
        let hit = ResultPointer {
            module_index: 1,
            base_offset: 0x1A0,
            level: 2,
            offsets: vec![0x8, 0x0, 0x18],
        };

        let chain = hit.to_chain(0xDEAD_0000, &modules);
        assert_eq!(chain.depth(), 3);
        assert_eq!(chain.format(), "game.exe[1]+0x1A0->+0x18->+0x0->+0x8");
        assert_eq!(chain.to_string(), chain.format());
    }

    #[test]
    fn test_chain_unknown_module_falls_back_to_index() {
        let hit = ResultPointer {
            module_index: 9,
            base_offset: 0x10,
            level: 0,
            offsets: vec![0x4],
        };
        assert_eq!(hit.to_chain(0, &[]).format(), "module#9[9]+0x10->+0x4");
    }

    #[test]
    fn test_config_json_roundtrip_and_defaults() {
        let config = ReverseScanConfig::from_json(r#"{"max_level": 7, "queue_capacity": 8}"#).unwrap();
        assert_eq!(config.max_level, 7);
        assert_eq!(config.queue_capacity, 8);
        assert_eq!(config.worker_count, 6);
        assert_eq!(config.max_offsets_per_node, Some(3));
        assert_eq!(config.trail_len(), 8);

        let json = config.to_json().unwrap();
        assert_eq!(ReverseScanConfig::from_json(&json).unwrap(), config);
    }

    #[test]
    fn test_config_validation() {
        let err = ReverseScanConfig::default().with_workers(0).validate().unwrap_err();
        assert_eq!(ScanAborted::code_of(&err), ScanErrorCode::InvalidConfig);

        let err = ReverseScanConfig::from_json(r#"{"queue_capacity": 0}"#).unwrap_err();
        assert_eq!(ScanAborted::code_of(&err), ScanErrorCode::InvalidConfig);

        let err = ReverseScanConfig::from_json("not json").unwrap_err();
        assert_eq!(ScanAborted::code_of(&err), ScanErrorCode::InvalidConfig);
    }
}

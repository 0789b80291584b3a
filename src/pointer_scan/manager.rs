//! Reverse Scan Coordinator
//!
//! Seeds the shared queue with the target, runs a fixed pool of worker threads
//! until the queue drains, then joins them and sums their counters.
//! Optional path carriers flow to a collector thread over a crossbeam channel.

use crate::pointer_scan::pointer_index::PointerIndex;
use crate::pointer_scan::reverse_scan::{ReverseScanWorker, ScanResult, WorkerStatus};
use crate::pointer_scan::task_queue::{Quiescence, TaskQueue};
use crate::pointer_scan::types::{
    ModuleInfo, PointerBucket, PointerChain, ResultPointer, ReverseScanConfig, ScanAborted, ScanErrorCode, WorkerState,
};
use anyhow::{anyhow, Result};
use crossbeam_channel::{unbounded, Receiver};
use itertools::Itertools;
use log::{debug, error, info, log_enabled, warn, Level};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// Result of one completed scan.
#[derive(Debug, Clone, Default)]
pub struct ScanOutcome {
    pub target_address: i64,
    /// Sum of every worker's terminal matches
    pub total_hits: u64,
    pub worker_results: Vec<ScanResult>,
    /// Captured path carriers, empty unless `collect_paths` is set
    pub paths: Vec<ResultPointer>,
    pub elapsed: Duration,
}

impl ScanOutcome {
    /// Render the captured paths as root-to-target chains.
    pub fn chains(&self, modules: &[ModuleInfo]) -> Vec<PointerChain> {
        self.paths
            .iter()
            .map(|path| path.to_chain(self.target_address, modules))
            .collect()
    }
}

/// Runs reverse scans over one immutable index.
pub struct ReverseScanner {
    index: Arc<PointerIndex>,
    config: ReverseScanConfig,
}

impl ReverseScanner {
    pub fn new(index: PointerIndex, config: ReverseScanConfig) -> Result<Self> {
        Self::with_shared_index(Arc::new(index), config)
    }

    /// Scanner over an index already shared with other scanners.
    pub fn with_shared_index(index: Arc<PointerIndex>, config: ReverseScanConfig) -> Result<Self> {
        config.validate()?;
        Ok(Self { index, config })
    }

    pub fn config(&self) -> &ReverseScanConfig {
        &self.config
    }

    pub fn index(&self) -> &PointerIndex {
        &self.index
    }

    /// Count every chain from `target` back to a static root.
    pub fn start_scan(&self, target: i64) -> Result<ScanOutcome> {
        self.start_scan_with_cancel(target, &CancellationToken::new())
    }

    /// Like [`start_scan`](Self::start_scan), aborting with an error once `cancel` fires.
    pub fn start_scan_with_cancel(&self, target: i64, cancel: &CancellationToken) -> Result<ScanOutcome> {
        let timer = Instant::now();
        let config = &self.config;

        if log_enabled!(Level::Debug) {
            info!(
                "Starting reverse scan: target=0x{:X}, max_level={}, struct_size=0x{:X}, workers={}, queue={}, buckets={}",
                target,
                config.max_level,
                config.struct_size,
                config.worker_count,
                config.queue_capacity,
                self.index.len()
            );
        }

        let queue = Arc::new(TaskQueue::new(config.queue_capacity, config.trail_len()));
        if config.max_level > 0 {
            queue.seed(target);
        }

        let (path_tx, collector) = if config.collect_paths {
            let (tx, rx) = unbounded::<ResultPointer>();
            match spawn_collector(rx, config.max_paths) {
                Ok(handle) => (Some(tx), Some(handle)),
                Err(e) => {
                    queue.shutdown();
                    return Err(e);
                },
            }
        } else {
            (None, None)
        };

        let mut statuses = Vec::with_capacity(config.worker_count);
        let mut handles: Vec<JoinHandle<ScanResult>> = Vec::with_capacity(config.worker_count);
        for id in 0..config.worker_count {
            let status = Arc::new(WorkerStatus::default());
            let worker = ReverseScanWorker::new(
                id,
                Arc::clone(&self.index),
                Arc::clone(&queue),
                Arc::clone(&status),
                config,
                path_tx.clone(),
            );

            match thread::Builder::new()
                .name(format!("revscan-{}", id))
                .spawn(move || worker.run())
            {
                Ok(handle) => {
                    handles.push(handle);
                    statuses.push(status);
                },
                Err(e) => {
                    error!("Failed to spawn scan worker {}: {}", id, e);
                    queue.shutdown();
                    drop(path_tx);
                    join_workers(handles);
                    join_collector(collector);
                    return Err(anyhow!(ScanAborted::new(
                        ScanErrorCode::ThreadSpawnFailed,
                        format!("worker {}: {}", id, e)
                    )));
                },
            }
        }
        // 只保留 worker 手中的 Sender，collector 在全部 worker 退出后结束
        drop(path_tx);

        let deadline = config.watchdog_ms.map(|ms| timer + Duration::from_millis(ms));
        let quiescence = queue.wait_quiescent(deadline, cancel);

        if log_enabled!(Level::Debug) {
            let idle = statuses.iter().filter(|s| s.get() == WorkerState::Idle).count();
            debug!("Scan wait finished: {:?}, {}/{} workers idle", quiescence, idle, statuses.len());
        }

        queue.shutdown();
        let (worker_results, panicked) = join_workers(handles);
        let paths = join_collector(collector);

        match quiescence {
            Quiescence::Reached if panicked == 0 => {},
            Quiescence::TimedOut => {
                warn!("Reverse scan for 0x{:X} exceeded its {:?}ms watchdog", target, config.watchdog_ms);
                return Err(anyhow!(ScanAborted::new(
                    ScanErrorCode::WatchdogExpired,
                    format!("no quiescence after {:?}", timer.elapsed())
                )));
            },
            Quiescence::Cancelled => {
                info!("Reverse scan for 0x{:X} cancelled", target);
                return Err(anyhow!(ScanAborted::new(ScanErrorCode::Cancelled, "cancelled by caller")));
            },
            Quiescence::Reached | Quiescence::Aborted => {
                error!("Reverse scan for 0x{:X} aborted: {} worker(s) panicked", target, panicked);
                return Err(anyhow!(ScanAborted::new(
                    ScanErrorCode::WorkerPanicked,
                    format!("{} worker(s) panicked", panicked)
                )));
            },
        }

        let total_hits: u64 = worker_results.iter().map(|r| r.hits).sum();
        let elapsed = timer.elapsed();

        if log_enabled!(Level::Debug) {
            info!(
                "Reverse scan complete: {} hits in {:.3}ms, per worker [{}], {} paths",
                total_hits,
                elapsed.as_secs_f64() * 1000.0,
                worker_results.iter().map(|r| format!("{}:{}", r.worker_id, r.hits)).join(", "),
                paths.len()
            );
        }

        Ok(ScanOutcome {
            target_address: target,
            total_hits,
            worker_results,
            paths,
            elapsed,
        })
    }
}

fn spawn_collector(rx: Receiver<ResultPointer>, max_paths: usize) -> Result<JoinHandle<Vec<ResultPointer>>> {
    thread::Builder::new()
        .name("revscan-paths".to_string())
        .spawn(move || {
            let mut results = Vec::new();
            // 不断接收直到所有 Sender 关闭
            while let Ok(path) = rx.recv() {
                if results.len() >= max_paths {
                    // 达到上限后断开通道，worker 只继续计数
                    if log_enabled!(Level::Debug) {
                        debug!("Path cap of {} reached, dropping further paths", max_paths);
                    }
                    break;
                }
                results.push(path);
            }
            results
        })
        .map_err(|e| anyhow!(ScanAborted::new(ScanErrorCode::ThreadSpawnFailed, format!("path collector: {}", e))))
}

/// Join every worker, returning their results and the number that panicked.
fn join_workers(handles: Vec<JoinHandle<ScanResult>>) -> (Vec<ScanResult>, usize) {
    let mut results = Vec::with_capacity(handles.len());
    let mut panicked = 0;
    for handle in handles {
        match handle.join() {
            Ok(result) => results.push(result),
            Err(_) => panicked += 1,
        }
    }
    (results, panicked)
}

fn join_collector(collector: Option<JoinHandle<Vec<ResultPointer>>>) -> Vec<ResultPointer> {
    match collector.map(JoinHandle::join) {
        Some(Ok(paths)) => paths,
        Some(Err(_)) => {
            error!("Path collector thread panicked");
            Vec::new()
        },
        None => Vec::new(),
    }
}

/// One-shot scan with default worker settings.
///
/// `keys[i]` is the pointed-to value of `buckets[i]`.
pub fn scan(keys: &[i64], buckets: Vec<PointerBucket>, target: i64, max_level: u32, struct_size: u32) -> Result<u64> {
    scan_with_config(keys, buckets, target, ReverseScanConfig::new(max_level, struct_size))
}

/// One-shot scan with explicit options.
pub fn scan_with_config(keys: &[i64], buckets: Vec<PointerBucket>, target: i64, config: ReverseScanConfig) -> Result<u64> {
    let index = PointerIndex::build(keys, buckets);
    let scanner = ReverseScanner::new(index, config)?;
    Ok(scanner.start_scan(target)?.total_hits)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer_scan::types::PointerRecord;

    fn single_static_bucket() -> PointerIndex {
        PointerIndex::from_buckets(vec![PointerBucket::from_records(
            0x1000,
            vec![PointerRecord::static_root(0x40_0010, 0, 0x10)],
        )])
    }

    #[test]
    fn test_rejects_invalid_config() {
        let err = ReverseScanner::new(single_static_bucket(), ReverseScanConfig::new(1, 0).with_workers(0))
            .err()
            .unwrap();
        assert_eq!(ScanAborted::code_of(&err), ScanErrorCode::InvalidConfig);
    }

    #[test]
    fn test_outcome_sums_workers() {
        let scanner = ReverseScanner::new(single_static_bucket(), ReverseScanConfig::new(1, 0).with_workers(3)).unwrap();
        let outcome = scanner.start_scan(0x1000).unwrap();
        assert_eq!(outcome.total_hits, 1);
        assert_eq!(outcome.worker_results.len(), 3);
        assert_eq!(outcome.worker_results.iter().map(|r| r.tasks_taken).sum::<u64>(), 1);
        assert!(outcome.paths.is_empty());
    }

    #[test]
    fn test_zero_level_finishes_without_work() {
        let scanner = ReverseScanner::new(single_static_bucket(), ReverseScanConfig::new(0, 0)).unwrap();
        let outcome = scanner.start_scan(0x1000).unwrap();
        assert_eq!(outcome.total_hits, 0);
        assert!(outcome.worker_results.iter().all(|r| r.tasks_taken == 0));
    }

    #[test]
    fn test_scan_helper() {
        let bucket = PointerBucket::from_records(0x2000, vec![PointerRecord::static_root(0x40_0000, 0, 0)]);
        assert_eq!(scan(&[0x2000], vec![bucket], 0x2000, 1, 0).unwrap(), 1);
    }
}

//! 反向扫描 worker
//!
//! 从目标值出发，在指针索引中按窗口 `[value - struct_size, value]` 向下查找 bucket，
//! 逐层回溯到静态模块。深度优先遍历使用显式帧栈而非递归；
//! 浅层分支在条件允许时交给共享队列，由其他 worker 处理。

use crate::pointer_scan::pointer_index::PointerIndex;
use crate::pointer_scan::task_queue::TaskQueue;
use crate::pointer_scan::types::{
    ReverseScanConfig, ResultPointer, StaticRef, WorkerState, OFFSET_TRAIL_SENTINEL, VISITED_TRAIL_SENTINEL,
};
use crossbeam_channel::Sender;
use log::{debug, log_enabled, Level};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

/// Bucket-key range reachable in one hop from `value`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Window {
    pub start: i64,
    pub stop: i64,
}

impl Window {
    /// `[max(0, value - struct_size), value]`
    pub fn around(value: i64, struct_size: u32) -> Self {
        let start = value.saturating_sub(struct_size as i64).max(0);
        Self { start, stop: value }
    }
}

/// One pending expansion on the local frame stack.
#[derive(Debug, Clone, Copy)]
struct Frame {
    value: i64,
    level: u32,
    /// Offset the parent recorded at `level - 1` when this frame was created
    parent_offset: Option<u32>,
}

/// Per-worker result of a scan.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct ScanResult {
    pub worker_id: usize,
    /// Terminal matches found by this worker
    pub hits: u64,
    /// Branches this worker took from the queue
    pub tasks_taken: u64,
    /// Branches this worker handed to the queue
    pub tasks_handed_off: u64,
}

/// Observable state shared between a worker and its coordinator.
#[derive(Debug, Default)]
pub struct WorkerStatus(AtomicU8);

impl WorkerStatus {
    pub fn get(&self) -> WorkerState {
        WorkerState::from(self.0.load(Ordering::Acquire))
    }

    fn set(&self, state: WorkerState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Shuts the queue down if the owning worker unwinds, so the coordinator never waits
/// on a pending count that can no longer drop.
struct AbortOnPanic<'a>(&'a TaskQueue);

impl Drop for AbortOnPanic<'_> {
    fn drop(&mut self) {
        if std::thread::panicking() {
            self.0.shutdown();
        }
    }
}

pub struct ReverseScanWorker {
    id: usize,
    index: Arc<PointerIndex>,
    queue: Arc<TaskQueue>,
    status: Arc<WorkerStatus>,
    paths: Option<Sender<ResultPointer>>,
    max_level: u32,
    struct_size: u32,
    no_loop: bool,
    max_offsets_per_node: Option<u32>,
    reserve_levels: u32,
    offset_trail: Vec<u32>,
    visited_trail: Vec<i64>,
    frames: Vec<Frame>,
    result: ScanResult,
}

impl ReverseScanWorker {
    pub fn new(
        id: usize,
        index: Arc<PointerIndex>,
        queue: Arc<TaskQueue>,
        status: Arc<WorkerStatus>,
        config: &ReverseScanConfig,
        paths: Option<Sender<ResultPointer>>,
    ) -> Self {
        let trail_len = config.trail_len();
        Self {
            id,
            index,
            queue,
            status,
            paths,
            max_level: config.max_level,
            struct_size: config.struct_size,
            no_loop: config.no_loop,
            max_offsets_per_node: config.max_offsets_per_node,
            reserve_levels: config.handoff_reserve_levels,
            offset_trail: vec![OFFSET_TRAIL_SENTINEL; trail_len],
            visited_trail: vec![VISITED_TRAIL_SENTINEL; trail_len],
            frames: Vec::with_capacity(1024),
            result: ScanResult {
                worker_id: id,
                ..Default::default()
            },
        }
    }

    /// Drain the queue until the coordinator terminates the scan.
    pub fn run(mut self) -> ScanResult {
        let queue = Arc::clone(&self.queue);
        let _abort_guard = AbortOnPanic(&queue);

        loop {
            self.status.set(WorkerState::Idle);
            let Some((value, level)) = queue.pop_into(&mut self.offset_trail, &mut self.visited_trail) else {
                break;
            };

            self.status.set(WorkerState::Scanning);
            self.result.tasks_taken += 1;
            self.bounded_descent(value, level);

            // 先置 Idle 再递减 pending：pending 归零时所有 worker 均已空闲
            self.status.set(WorkerState::Idle);
            queue.complete_task();
        }

        self.status.set(WorkerState::Terminated);
        if log_enabled!(Level::Debug) {
            debug!(
                "worker {} terminated: hits={}, taken={}, handed_off={}",
                self.id, self.result.hits, self.result.tasks_taken, self.result.tasks_handed_off
            );
        }
        self.result
    }

    /// Run the branch rooted at `{value, level}` to completion.
    ///
    /// The worker's trails must already hold the branch's history for positions below `level`.
    pub fn bounded_descent(&mut self, value: i64, level: u32) {
        if level >= self.max_level {
            return;
        }

        self.frames.clear();
        self.frames.push(Frame {
            value,
            level,
            parent_offset: None,
        });

        while let Some(frame) = self.frames.pop() {
            if self.queue.is_shut_down() {
                self.frames.clear();
                return;
            }
            self.expand(frame);
        }
    }

    fn expand(&mut self, frame: Frame) {
        let Frame {
            value,
            level,
            parent_offset,
        } = frame;
        if level >= self.max_level {
            return;
        }
        let depth = level as usize;

        // 栈上帧出栈时恢复父层偏移：同层兄弟帧可能已经覆盖了该位置
        if let Some(offset) = parent_offset {
            self.offset_trail[depth - 1] = offset;
        }

        if self.no_loop {
            if self.visited_trail[..depth].contains(&value) {
                return;
            }
            self.visited_trail[depth] = value;
        }

        let window = Window::around(value, self.struct_size);
        let index = Arc::clone(&self.index);
        let mut position = index.closest_lower_index(window.stop, window.start);
        let mut buckets_visited = 0u32;

        while let Some(bucket) = position.and_then(|i| index.bucket_at(i)) {
            if bucket.key() < window.start {
                break;
            }

            let offset = (value - bucket.key()) as u32;
            self.offset_trail[depth] = offset;

            for record in bucket.records() {
                match record.static_ref {
                    Some(static_ref) => self.record_hit(level, static_ref),
                    None if level + 1 < self.max_level => self.dispatch(record.address, level, offset),
                    None => {},
                }
            }

            // 第 0 层不限制分支数
            if let Some(limit) = self.max_offsets_per_node
                && level > 0
            {
                buckets_visited += 1;
                if buckets_visited >= limit {
                    break;
                }
            }

            position = position.and_then(|i| i.checked_sub(1));
        }
    }

    /// Hand the continuation `{address, level + 1}` to the queue, or keep it local.
    fn dispatch(&mut self, address: i64, level: u32, offset: u32) {
        if self.queue.is_handoff_eligible(level, self.max_level, self.reserve_levels)
            && self
                .queue
                .try_hand_off(level, address, &self.offset_trail, &self.visited_trail)
        {
            self.result.tasks_handed_off += 1;
            return;
        }

        self.frames.push(Frame {
            value: address,
            level: level + 1,
            parent_offset: Some(offset),
        });
    }

    fn record_hit(&mut self, level: u32, static_ref: StaticRef) {
        self.result.hits += 1;

        if let Some(ref paths) = self.paths {
            let hit = ResultPointer {
                module_index: static_ref.module_index,
                base_offset: static_ref.offset,
                level,
                offsets: self.offset_trail[..=level as usize].to_vec(),
            };
            // 收集端已关闭时仅保留计数
            if paths.send(hit).is_err() {
                self.paths = None;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pointer_scan::types::{PointerBucket, PointerRecord};

    fn worker_for(index: PointerIndex, config: &ReverseScanConfig) -> ReverseScanWorker {
        let queue = Arc::new(TaskQueue::new(config.queue_capacity, config.trail_len()));
        ReverseScanWorker::new(
            0,
            Arc::new(index),
            queue,
            Arc::new(WorkerStatus::default()),
            config,
            None,
        )
    }

    #[test]
    fn test_window_clamps_at_zero() {
        assert_eq!(Window::around(0x10, 0x100), Window { start: 0, stop: 0x10 });
        assert_eq!(Window::around(0x1000, 0x100), Window { start: 0xF00, stop: 0x1000 });
        assert_eq!(Window::around(i64::MIN + 1, 0x100).start, 0);
    }

    #[test]
    fn test_descent_counts_static_records_in_window() {
        let index = PointerIndex::from_buckets(vec![
            PointerBucket::from_records(0x1000, vec![PointerRecord::static_root(0x40_0010, 0, 0x10)]),
            PointerBucket::from_records(0x0FF0, vec![PointerRecord::static_root(0x40_0020, 0, 0x20)]),
            PointerBucket::from_records(0x0E00, vec![PointerRecord::static_root(0x40_0030, 0, 0x30)]),
        ]);
        let config = ReverseScanConfig::new(1, 0x100).with_workers(1);
        let mut worker = worker_for(index, &config);

        worker.bounded_descent(0x1000, 0);
        assert_eq!(worker.result.hits, 2);
    }

    #[test]
    fn test_descent_never_expands_past_max_level() {
        let index = PointerIndex::from_buckets(vec![PointerBucket::from_records(
            0x1000,
            vec![PointerRecord::static_root(0x40_0010, 0, 0x10)],
        )]);
        let config = ReverseScanConfig::new(2, 0);
        let mut worker = worker_for(index, &config);

        worker.bounded_descent(0x1000, 2);
        assert_eq!(worker.result.hits, 0);
    }

    #[test]
    fn test_descent_keeps_branches_local_without_queue_room() {
        // 0x1000 <- 0x2000 <- 0x3000(static)
        let index = PointerIndex::from_buckets(vec![
            PointerBucket::from_records(0x1000, vec![PointerRecord::dynamic(0x2000)]),
            PointerBucket::from_records(0x2000, vec![PointerRecord::static_root(0x3000, 1, 0x8)]),
        ]);
        let config = ReverseScanConfig::new(8, 0).with_queue_capacity(1);
        let mut worker = worker_for(index, &config);

        // 先占满队列，强制本地展开
        let queue = Arc::clone(&worker.queue);
        queue.seed(0);
        worker.bounded_descent(0x1000, 0);
        assert_eq!(worker.result.hits, 1);
        assert_eq!(worker.result.tasks_handed_off, 0);
    }

    #[test]
    fn test_records_paths_with_trail_offsets() {
        // target 0x1008 lies 8 bytes into the struct at 0x1000
        let index = PointerIndex::from_buckets(vec![
            PointerBucket::from_records(0x1000, vec![PointerRecord::dynamic(0x2010)]),
            PointerBucket::from_records(0x2000, vec![PointerRecord::static_root(0x40_0100, 3, 0x100)]),
        ]);
        let config = ReverseScanConfig::new(3, 0x20).with_queue_capacity(1).with_paths(16);
        let (tx, rx) = crossbeam_channel::unbounded();
        let queue = Arc::new(TaskQueue::new(config.queue_capacity, config.trail_len()));
        queue.seed(0);
        let mut worker = ReverseScanWorker::new(
            0,
            Arc::new(index),
            queue,
            Arc::new(WorkerStatus::default()),
            &config,
            Some(tx),
        );

        worker.bounded_descent(0x1008, 0);
        drop(worker);

        let paths: Vec<ResultPointer> = rx.iter().collect();
        assert_eq!(
            paths,
            vec![ResultPointer {
                module_index: 3,
                base_offset: 0x100,
                level: 1,
                offsets: vec![0x8, 0x10],
            }]
        );
    }
}

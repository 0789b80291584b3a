//! Shared task queue for branch hand-off between scan workers.
//!
//! A fixed number of task slots is allocated once per scan and reused with stack
//! discipline: slot `i` is occupied while `i < len`. One mutex guards the slots.
//! Workers hand a branch off only when [`TaskQueue::is_handoff_eligible`] allows it,
//! then acquire the lock with a depth-dependent [`LockEscalation`] tier.
//!
//! Quiescence is tracked by a pending counter (queued tasks plus tasks being
//! scanned). It can only rise while some task is in flight, so reaching zero
//! means no work is left anywhere.

use crate::pointer_scan::types::{OFFSET_TRAIL_SENTINEL, VISITED_TRAIL_SENTINEL};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError, TryLockError};
use std::thread;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;

/// How often a coordinator blocked on quiescence re-checks the caller's cancel token.
const CANCEL_CHECK_INTERVAL: Duration = Duration::from_millis(50);

/// A suspended depth-first branch.
#[derive(Debug, Clone)]
pub struct ScanTask {
    value_to_find: i64,
    start_level: u32,
    offset_trail: Vec<u32>,
    visited_trail: Vec<i64>,
}

impl ScanTask {
    fn new(trail_len: usize) -> Self {
        Self {
            value_to_find: 0,
            start_level: 0,
            offset_trail: vec![OFFSET_TRAIL_SENTINEL; trail_len],
            visited_trail: vec![VISITED_TRAIL_SENTINEL; trail_len],
        }
    }

    fn store(&mut self, value_to_find: i64, start_level: u32, offset_trail: &[u32], visited_trail: &[i64]) {
        self.value_to_find = value_to_find;
        self.start_level = start_level;
        self.offset_trail.copy_from_slice(offset_trail);
        self.visited_trail.copy_from_slice(visited_trail);
    }

    fn reset_trails(&mut self) {
        self.offset_trail.fill(OFFSET_TRAIL_SENTINEL);
        self.visited_trail.fill(VISITED_TRAIL_SENTINEL);
    }
}

/// Lock acquisition effort for a hand-off, strongest for the shallowest branches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum LockEscalation {
    /// One non-blocking attempt
    Once,
    /// Two back-to-back non-blocking attempts
    Retry,
    /// Two attempts, then two more each preceded by a cooperative yield
    Yielding,
    /// All of the above, then a blocking acquire
    Blocking,
}

impl LockEscalation {
    pub fn for_level(level: u32) -> Self {
        match level {
            0 => LockEscalation::Blocking,
            1 => LockEscalation::Yielding,
            2 => LockEscalation::Retry,
            _ => LockEscalation::Once,
        }
    }
}

/// Free slots a hand-off from `level` must leave in a queue of `capacity` slots.
///
/// | level | headroom          |
/// |-------|-------------------|
/// | 0     | min(1, cap / 16)  |
/// | 1     | cap / 16          |
/// | 2     | cap / 8           |
/// | 3+    | cap / 3           |
pub fn handoff_headroom(capacity: usize, level: u32) -> usize {
    match level {
        0 => (capacity / 16).min(1),
        1 => capacity / 16,
        2 => capacity / 8,
        _ => capacity / 3,
    }
}

/// Outcome of waiting for the scan to drain.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Quiescence {
    /// Queue empty and no task in flight
    Reached,
    /// The deadline passed first
    TimedOut,
    /// The caller's token was cancelled
    Cancelled,
    /// The queue was shut down from elsewhere (worker panic)
    Aborted,
}

struct QueueState {
    slots: Vec<ScanTask>,
    len: usize,
    pending: usize,
    terminated: bool,
}

/// Fixed-capacity LIFO queue of [`ScanTask`]s shared by all workers of one scan.
pub struct TaskQueue {
    state: Mutex<QueueState>,
    task_ready: Condvar,
    quiescent: Condvar,
    /// Mirror of `len` readable without the lock, for eligibility checks
    len_hint: AtomicUsize,
    capacity: usize,
    trail_len: usize,
    shutdown: CancellationToken,
}

impl TaskQueue {
    /// Allocate `capacity` slots with trails of `trail_len` entries.
    pub fn new(capacity: usize, trail_len: usize) -> Self {
        let slots = (0..capacity).map(|_| ScanTask::new(trail_len)).collect();
        Self {
            state: Mutex::new(QueueState {
                slots,
                len: 0,
                pending: 0,
                terminated: false,
            }),
            task_ready: Condvar::new(),
            quiescent: Condvar::new(),
            len_hint: AtomicUsize::new(0),
            capacity,
            trail_len,
            shutdown: CancellationToken::new(),
        }
    }

    #[inline]
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    #[inline]
    pub fn trail_len(&self) -> usize {
        self.trail_len
    }

    /// Queue length without taking the lock. May be stale.
    #[inline]
    pub fn len_hint(&self) -> usize {
        self.len_hint.load(Ordering::Relaxed)
    }

    /// Tasks queued or being scanned.
    pub fn pending(&self) -> usize {
        self.lock().pending
    }

    /// Token cancelled once the queue is shut down.
    pub fn shutdown_token(&self) -> &CancellationToken {
        &self.shutdown
    }

    #[inline]
    pub fn is_shut_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn try_lock(&self) -> Option<MutexGuard<'_, QueueState>> {
        match self.state.try_lock() {
            Ok(guard) => Some(guard),
            Err(TryLockError::Poisoned(poisoned)) => Some(poisoned.into_inner()),
            Err(TryLockError::WouldBlock) => None,
        }
    }

    fn acquire(&self, escalation: LockEscalation) -> Option<MutexGuard<'_, QueueState>> {
        if let Some(guard) = self.try_lock() {
            return Some(guard);
        }
        if escalation >= LockEscalation::Retry {
            if let Some(guard) = self.try_lock() {
                return Some(guard);
            }
        }
        if escalation >= LockEscalation::Yielding {
            for _ in 0..2 {
                thread::yield_now();
                if let Some(guard) = self.try_lock() {
                    return Some(guard);
                }
            }
        }
        if escalation == LockEscalation::Blocking {
            return Some(self.lock());
        }
        None
    }

    /// Reset every slot and push the root task.
    pub fn seed(&self, value_to_find: i64) {
        let mut guard = self.lock();
        let state = &mut *guard;
        for slot in state.slots.iter_mut() {
            slot.reset_trails();
        }
        state.len = 0;
        state.pending = 0;
        state.terminated = false;

        if let Some(root) = state.slots.first_mut() {
            root.value_to_find = value_to_find;
            root.start_level = 0;
            state.len = 1;
            state.pending = 1;
        }
        self.len_hint.store(state.len, Ordering::Relaxed);
        self.task_ready.notify_one();
    }

    /// Whether a branch at `level` may be offered to the queue at all.
    ///
    /// Branches within `reserve_levels` of `max_level` stay local unless the queue
    /// is empty, in which case any branch is welcome.
    pub fn is_handoff_eligible(&self, level: u32, max_level: u32, reserve_levels: u32) -> bool {
        let len = self.len_hint();
        if len == 0 {
            return true;
        }
        level.saturating_add(reserve_levels) < max_level
            && len < self.capacity.saturating_sub(handoff_headroom(self.capacity, level))
    }

    /// Try to queue the continuation `{value_to_find, level + 1}` of a branch at `level`.
    ///
    /// Returns false when the lock could not be taken at this level's escalation tier,
    /// the queue is full, or the scan is shutting down. The caller then continues
    /// the branch itself.
    pub fn try_hand_off(&self, level: u32, value_to_find: i64, offset_trail: &[u32], visited_trail: &[i64]) -> bool {
        let Some(mut state) = self.acquire(LockEscalation::for_level(level)) else {
            return false;
        };
        if state.terminated || state.len >= self.capacity {
            return false;
        }

        let slot = state.len;
        state.slots[slot].store(value_to_find, level + 1, offset_trail, visited_trail);
        state.len += 1;
        state.pending += 1;
        self.len_hint.store(state.len, Ordering::Relaxed);
        drop(state);

        self.task_ready.notify_one();
        true
    }

    /// Take the top task, copying its trails into the worker's buffers.
    ///
    /// Blocks while the queue is empty. Returns None once the queue is shut down.
    pub fn pop_into(&self, offset_trail: &mut [u32], visited_trail: &mut [i64]) -> Option<(i64, u32)> {
        let mut state = self.lock();
        loop {
            if state.terminated {
                return None;
            }
            if state.len > 0 {
                state.len -= 1;
                self.len_hint.store(state.len, Ordering::Relaxed);
                let task = &state.slots[state.len];
                offset_trail.copy_from_slice(&task.offset_trail);
                visited_trail.copy_from_slice(&task.visited_trail);
                return Some((task.value_to_find, task.start_level));
            }
            state = self.task_ready.wait(state).unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Mark a popped task as fully scanned.
    pub fn complete_task(&self) {
        let mut state = self.lock();
        state.pending = state.pending.saturating_sub(1);
        if state.pending == 0 {
            self.quiescent.notify_all();
        }
    }

    /// Block until no work is left, the deadline passes, or `cancel` fires.
    pub fn wait_quiescent(&self, deadline: Option<Instant>, cancel: &CancellationToken) -> Quiescence {
        let mut state = self.lock();
        loop {
            if state.pending == 0 {
                return Quiescence::Reached;
            }
            if state.terminated {
                return Quiescence::Aborted;
            }
            if cancel.is_cancelled() {
                return Quiescence::Cancelled;
            }

            let mut wait = CANCEL_CHECK_INTERVAL;
            if let Some(deadline) = deadline {
                let now = Instant::now();
                if now >= deadline {
                    return Quiescence::TimedOut;
                }
                wait = wait.min(deadline - now);
            }

            state = self
                .quiescent
                .wait_timeout(state, wait)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|poisoned| poisoned.into_inner().0);
        }
    }

    /// Release every blocked worker and refuse further work.
    pub fn shutdown(&self) {
        let mut state = self.lock();
        state.terminated = true;
        drop(state);

        self.shutdown.cancel();
        self.task_ready.notify_all();
        self.quiescent.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    const TRAIL: usize = 4;

    fn trails(marker: u32) -> ([u32; TRAIL], [i64; TRAIL]) {
        ([marker; TRAIL], [marker as i64; TRAIL])
    }

    #[test]
    fn test_headroom_schedule_default_capacity() {
        assert_eq!(handoff_headroom(64, 0), 1);
        assert_eq!(handoff_headroom(64, 1), 4);
        assert_eq!(handoff_headroom(64, 2), 8);
        assert_eq!(handoff_headroom(64, 3), 21);
        assert_eq!(handoff_headroom(64, 9), 21);
        // 小容量时第 0 层与第 1 层一致
        assert_eq!(handoff_headroom(8, 0), 0);
        assert_eq!(handoff_headroom(8, 1), 0);
    }

    #[test]
    fn test_escalation_tiers() {
        assert_eq!(LockEscalation::for_level(0), LockEscalation::Blocking);
        assert_eq!(LockEscalation::for_level(1), LockEscalation::Yielding);
        assert_eq!(LockEscalation::for_level(2), LockEscalation::Retry);
        assert_eq!(LockEscalation::for_level(7), LockEscalation::Once);
        assert!(LockEscalation::Once < LockEscalation::Blocking);
    }

    #[test]
    fn test_seed_then_lifo_pop() {
        let queue = TaskQueue::new(8, TRAIL);
        queue.seed(0x1000);
        assert_eq!(queue.len_hint(), 1);
        assert_eq!(queue.pending(), 1);

        let (mut offsets, mut visited) = trails(0);
        assert_eq!(queue.pop_into(&mut offsets, &mut visited), Some((0x1000, 0)));
        assert_eq!(offsets, [OFFSET_TRAIL_SENTINEL; TRAIL]);
        assert_eq!(visited, [VISITED_TRAIL_SENTINEL; TRAIL]);

        let (o1, v1) = trails(1);
        let (o2, v2) = trails(2);
        assert!(queue.try_hand_off(0, 0x2000, &o1, &v1));
        assert!(queue.try_hand_off(3, 0x3000, &o2, &v2));
        assert_eq!(queue.pending(), 3);

        assert_eq!(queue.pop_into(&mut offsets, &mut visited), Some((0x3000, 4)));
        assert_eq!(offsets, o2);
        assert_eq!(queue.pop_into(&mut offsets, &mut visited), Some((0x2000, 1)));
        assert_eq!(visited, v1);
    }

    #[test]
    fn test_hand_off_rejected_when_full() {
        let queue = TaskQueue::new(2, TRAIL);
        let (o, v) = trails(0);
        assert!(queue.try_hand_off(0, 1, &o, &v));
        assert!(queue.try_hand_off(0, 2, &o, &v));
        assert!(!queue.try_hand_off(0, 3, &o, &v));
        assert_eq!(queue.len_hint(), 2);
    }

    #[test]
    fn test_eligibility() {
        let queue = TaskQueue::new(64, TRAIL);
        // 空队列：无条件接受
        assert!(queue.is_handoff_eligible(9, 10, 3));

        let (o, v) = trails(0);
        for i in 0..43 {
            assert!(queue.try_hand_off(0, i, &o, &v));
        }
        // len = 43 = 64 - 21: deep levels are out of headroom, shallow ones are not
        assert!(!queue.is_handoff_eligible(3, 10, 3));
        assert!(queue.is_handoff_eligible(2, 10, 3));
        // within the reserved last levels
        assert!(!queue.is_handoff_eligible(7, 10, 3));
        assert!(!queue.is_handoff_eligible(6, 10, 3));

        for i in 43..63 {
            assert!(queue.try_hand_off(0, i, &o, &v));
        }
        assert!(!queue.is_handoff_eligible(0, 10, 3));
    }

    #[test]
    fn test_deep_hand_off_gives_up_on_contention() {
        let queue = TaskQueue::new(8, TRAIL);
        let (o, v) = trails(0);
        let guard = queue.lock();
        assert!(!queue.try_hand_off(5, 0x10, &o, &v));
        assert!(!queue.try_hand_off(1, 0x10, &o, &v));
        drop(guard);
        assert!(queue.try_hand_off(5, 0x10, &o, &v));
    }

    #[test]
    fn test_root_hand_off_blocks_until_lock_released() {
        let queue = Arc::new(TaskQueue::new(8, TRAIL));
        let holder = {
            let queue = Arc::clone(&queue);
            let guard_taken = Arc::new(std::sync::Barrier::new(2));
            let signal = Arc::clone(&guard_taken);
            let handle = thread::spawn(move || {
                let _guard = queue.lock();
                signal.wait();
                thread::sleep(Duration::from_millis(30));
            });
            guard_taken.wait();
            handle
        };

        let (o, v) = trails(0);
        assert!(queue.try_hand_off(0, 0x10, &o, &v));
        holder.join().unwrap();
        assert_eq!(queue.len_hint(), 1);
    }

    #[test]
    fn test_quiescence_after_all_tasks_complete() {
        let queue = TaskQueue::new(4, TRAIL);
        let cancel = CancellationToken::new();
        queue.seed(0x10);
        assert_eq!(
            queue.wait_quiescent(Some(Instant::now() + Duration::from_millis(10)), &cancel),
            Quiescence::TimedOut
        );

        let (mut o, mut v) = trails(0);
        queue.pop_into(&mut o, &mut v).unwrap();
        let (co, cv) = trails(1);
        assert!(queue.try_hand_off(0, 0x20, &co, &cv));
        queue.complete_task();
        assert_eq!(queue.pending(), 1);

        queue.pop_into(&mut o, &mut v).unwrap();
        queue.complete_task();
        assert_eq!(queue.wait_quiescent(None, &cancel), Quiescence::Reached);
    }

    #[test]
    fn test_wait_observes_cancel_and_shutdown() {
        let queue = TaskQueue::new(4, TRAIL);
        queue.seed(0x10);

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(queue.wait_quiescent(None, &cancel), Quiescence::Cancelled);

        queue.shutdown();
        assert!(queue.is_shut_down());
        assert_eq!(queue.wait_quiescent(None, &CancellationToken::new()), Quiescence::Aborted);
    }

    #[test]
    fn test_shutdown_releases_idle_worker() {
        let queue = Arc::new(TaskQueue::new(4, TRAIL));
        let worker = {
            let queue = Arc::clone(&queue);
            thread::spawn(move || {
                let (mut o, mut v) = trails(0);
                queue.pop_into(&mut o, &mut v)
            })
        };
        thread::sleep(Duration::from_millis(20));
        queue.shutdown();
        assert_eq!(worker.join().unwrap(), None);

        let (o, v) = trails(0);
        assert!(!queue.try_hand_off(0, 0x10, &o, &v));
    }
}

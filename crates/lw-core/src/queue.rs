//! Work-queue entries, the bounded entry pool, and the two priority lanes
//! drained by the worker pool.
//!
//! The express lane has strict priority over the regular lane; the idle
//! worker list and the event-barrier throttle live beside them under the
//! single work-queue lock. Blocking waits (worker parking, the notification
//! event) use a flag-under-`std::sync::Mutex` plus `Condvar` so racing
//! wakeups are never lost.

use crate::CacheBackend;
use crate::Engine;
use lw_types::{FileId, StreamId};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::trace;

/// One unit of background work.
#[derive(Debug)]
pub(crate) enum WorkItem {
    ReadAhead(FileId),
    WriteBehind { stream: StreamId },
    EventSet(std::sync::Arc<NotifyEvent>),
    LazyWriteScan,
}

/// A pooled job record. Only the pool can mint these.
#[derive(Debug)]
pub(crate) struct WorkEntry {
    pub(crate) item: WorkItem,
}

/// Bounded allocation budget for work entries.
///
/// Exhaustion stands in for allocator failure: every caller has a
/// self-healing path for `None`, and tests drive those paths by shrinking
/// the limit.
#[derive(Debug)]
pub(crate) struct EntryPool {
    outstanding: usize,
    limit: usize,
}

impl EntryPool {
    pub(crate) fn new(limit: usize) -> Self {
        Self {
            outstanding: 0,
            limit,
        }
    }

    pub(crate) fn allocate(&mut self, item: WorkItem) -> Option<WorkEntry> {
        if self.outstanding >= self.limit {
            return None;
        }
        self.outstanding += 1;
        Some(WorkEntry { item })
    }

    pub(crate) fn free(&mut self, entry: WorkEntry) {
        drop(entry);
        debug_assert!(self.outstanding > 0);
        self.outstanding = self.outstanding.saturating_sub(1);
    }

    pub(crate) fn outstanding(&self) -> usize {
        self.outstanding
    }
}

/// Which lane an entry is queued to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum QueueTarget {
    Express,
    Regular,
}

/// Everything guarded by the work-queue lock.
#[derive(Debug)]
pub(crate) struct WorkState {
    pub(crate) express: VecDeque<WorkEntry>,
    pub(crate) regular: VecDeque<WorkEntry>,
    pub(crate) idle_workers: VecDeque<usize>,
    pub(crate) active_workers: usize,
    pub(crate) queue_throttle: bool,
    pub(crate) pool: EntryPool,
}

impl WorkState {
    pub(crate) fn new(entry_limit: usize, worker_count: usize) -> Self {
        Self {
            express: VecDeque::new(),
            regular: VecDeque::new(),
            idle_workers: (0..worker_count).collect(),
            active_workers: 0,
            queue_throttle: false,
            pool: EntryPool::new(entry_limit),
        }
    }

    pub(crate) fn queue_mut(&mut self, target: QueueTarget) -> &mut VecDeque<WorkEntry> {
        match target {
            QueueTarget::Express => &mut self.express,
            QueueTarget::Regular => &mut self.regular,
        }
    }

    /// Express first, then regular; `None` means both lanes are drained.
    pub(crate) fn pick_queue(&self) -> Option<QueueTarget> {
        if !self.express.is_empty() {
            Some(QueueTarget::Express)
        } else if !self.regular.is_empty() {
            Some(QueueTarget::Regular)
        } else {
            None
        }
    }

    pub(crate) fn head_is_event_set(&self, target: QueueTarget) -> bool {
        let queue = match target {
            QueueTarget::Express => &self.express,
            QueueTarget::Regular => &self.regular,
        };
        matches!(
            queue.front().map(|e| &e.item),
            Some(WorkItem::EventSet(_))
        )
    }
}

/// A one-shot notification event: once set it stays set, and every waiter
/// (past or future) observes it.
#[derive(Debug)]
pub(crate) struct NotifyEvent {
    signaled: Mutex<bool>,
    cv: Condvar,
}

impl NotifyEvent {
    pub(crate) fn new() -> Self {
        Self {
            signaled: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn set(&self) {
        let mut signaled = self
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *signaled = true;
        drop(signaled);
        self.cv.notify_all();
    }

    pub(crate) fn wait(&self) {
        let mut signaled = self
            .signaled
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        while !*signaled {
            signaled = self
                .cv
                .wait(signaled)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    #[cfg(test)]
    pub(crate) fn is_set(&self) -> bool {
        *self.signaled.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Per-worker parking spot. `wake` is sticky until the worker consumes it,
/// so a wakeup racing the worker's transition to idle is not lost.
#[derive(Debug)]
pub(crate) struct ParkSlot {
    woken: Mutex<bool>,
    cv: Condvar,
}

impl ParkSlot {
    pub(crate) fn new() -> Self {
        Self {
            woken: Mutex::new(false),
            cv: Condvar::new(),
        }
    }

    pub(crate) fn wake(&self) {
        let mut woken = self.woken.lock().unwrap_or_else(PoisonError::into_inner);
        *woken = true;
        drop(woken);
        self.cv.notify_one();
    }

    /// Block until woken or the timeout elapses. Returns `true` only when a
    /// wakeup was consumed; a timed-out wait leaves the slot untouched so the
    /// caller can re-check its stop condition and park again.
    pub(crate) fn wait(&self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        let mut woken = self.woken.lock().unwrap_or_else(PoisonError::into_inner);
        while !*woken {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            let (guard, _timeout) = self
                .cv
                .wait_timeout(woken, remaining)
                .unwrap_or_else(PoisonError::into_inner);
            woken = guard;
        }
        *woken = false;
        true
    }
}

impl Engine {
    /// Take a work entry from the bounded pool. `None` is the engine's
    /// out-of-memory signal; every caller self-heals.
    pub(crate) fn allocate_entry(&self, item: WorkItem) -> Option<WorkEntry> {
        let mut work = self.work.lock();
        let entry = work.pool.allocate(item);
        if entry.is_none() {
            trace!(
                target: "lw::queue",
                event = "entry_pool_exhausted",
                outstanding = work.pool.outstanding()
            );
        }
        entry
    }

    pub(crate) fn free_entry(&self, entry: WorkEntry) {
        self.work.lock().pool.free(entry);
    }

    /// Tail-insert `entry` and, unless throttled, activate one idle worker.
    ///
    /// The wakeup is issued after the work-queue lock is released.
    pub(crate) fn post_work_queue(&self, entry: WorkEntry, target: QueueTarget) {
        let mut work = self.work.lock();
        work.queue_mut(target).push_back(entry);
        let woken = if !work.queue_throttle {
            work.idle_workers.pop_front().map(|idx| {
                work.active_workers += 1;
                idx
            })
        } else {
            None
        };
        drop(work);
        if let Some(idx) = woken {
            self.park_slots[idx].wake();
        }
    }

    /// Post read-ahead work for a file object.
    pub(crate) fn post_read_ahead_entry(&self, file: FileId) -> lw_error::Result<()> {
        let entry = self
            .allocate_entry(WorkItem::ReadAhead(file))
            .ok_or(lw_error::LwError::InsufficientResources)?;
        self.post_work_queue(entry, QueueTarget::Regular);
        Ok(())
    }

    /// Deferred-write poke: safe to call redundantly, forwarded verbatim.
    pub(crate) fn poke_deferred_writes(&self, backend: &dyn CacheBackend) {
        if backend.deferred_writes_pending() {
            backend.post_deferred_writes();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pool_exhaustion_and_recovery() {
        let mut pool = EntryPool::new(2);
        let a = pool.allocate(WorkItem::LazyWriteScan).unwrap();
        let b = pool.allocate(WorkItem::LazyWriteScan).unwrap();
        assert!(pool.allocate(WorkItem::LazyWriteScan).is_none());
        assert_eq!(pool.outstanding(), 2);
        pool.free(a);
        assert!(pool.allocate(WorkItem::LazyWriteScan).is_some());
        pool.free(b);
    }

    #[test]
    fn express_lane_has_strict_priority() {
        let mut state = WorkState::new(8, 0);
        let mut pool = EntryPool::new(8);
        state
            .queue_mut(QueueTarget::Regular)
            .push_back(pool.allocate(WorkItem::LazyWriteScan).unwrap());
        assert_eq!(state.pick_queue(), Some(QueueTarget::Regular));
        state
            .queue_mut(QueueTarget::Express)
            .push_back(pool.allocate(WorkItem::WriteBehind { stream: StreamId(1) }).unwrap());
        assert_eq!(state.pick_queue(), Some(QueueTarget::Express));
        state.express.clear();
        state.regular.clear();
        assert_eq!(state.pick_queue(), None);
    }

    #[test]
    fn event_set_head_is_detected() {
        let mut state = WorkState::new(8, 0);
        let mut pool = EntryPool::new(8);
        let ev = std::sync::Arc::new(NotifyEvent::new());
        state
            .queue_mut(QueueTarget::Regular)
            .push_back(pool.allocate(WorkItem::EventSet(ev)).unwrap());
        assert!(state.head_is_event_set(QueueTarget::Regular));
        assert!(!state.head_is_event_set(QueueTarget::Express));
    }

    #[test]
    fn notify_event_is_sticky() {
        let ev = NotifyEvent::new();
        assert!(!ev.is_set());
        ev.set();
        assert!(ev.is_set());
        // A waiter arriving after the set returns immediately.
        ev.wait();
    }

    #[test]
    fn park_slot_does_not_lose_early_wakeups() {
        let slot = ParkSlot::new();
        slot.wake();
        // The wake preceded the wait; the flag makes it stick.
        assert!(slot.wait(Duration::from_millis(10)));
        // The flag was consumed, so the next wait times out.
        assert!(!slot.wait(Duration::from_millis(1)));
    }
}

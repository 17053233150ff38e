#![forbid(unsafe_code)]
//! Lazy-writer engine for a file cache manager.
//!
//! The engine periodically scans every cached stream that carries dirty
//! pages, budgets a per-tick page quota that tracks foreground write
//! pressure, and dispatches flush work to a fixed pool of worker threads
//! draining two priority lanes. A post-tick barrier lets callers wait until
//! all work visible at the time of the call has completed.
//!
//! The actual page I/O, read-ahead, and deferred-write bookkeeping belong to
//! the surrounding cache manager and are reached through [`CacheBackend`].
//!
//! Locking: a master lock guards the dirty-stream inventory and the global
//! pacing scalars; a separate work-queue lock guards the lanes and the
//! worker pool. The two are never held at the same time.

mod inventory;
mod queue;
mod scan;
mod worker;

pub use lw_error::{LwError, Result};
pub use lw_types::{
    FileId, LazyWriterConfig, StreamAttrs, StreamFlags, StreamId, WriteDisposition, AGE_TARGET,
    LOCK_COURTESY_VISITS, MAX_RETRY_PRIORITY, METADATA_DIVISOR, OVERSIZE_FACTOR, PASS_COUNT_MASK,
    RESCAN_THRESHOLD_PAGES,
};
pub use scan::compute_scan_budget;
pub use worker::memory_maker_active;

use crate::inventory::DirtyInventory;
use crate::queue::{NotifyEvent, ParkSlot, WorkEntry, WorkItem, WorkState};
use crate::scan::ScanTimer;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use tracing::info;

/// The cache-manager side of the engine: page I/O and deferred-write
/// bookkeeping.
///
/// `can_i_write` and `deferred_writes_pending` may be called with the
/// engine's master lock held; implementations must not block there or call
/// back into the engine.
pub trait CacheBackend: Send + Sync {
    /// Flush up to `pages_to_write` dirty pages of `stream`.
    ///
    /// `Ok(WriteDisposition::Requeue)` means "run me again": the entry is
    /// reinserted at the tail of the lane it came from and the stream stays
    /// queued. `Ok(WriteDisposition::Flushed { pages })` debits the dirty
    /// counts. An `Err` leaves the pages dirty for a later tick.
    fn write_behind(&self, stream: StreamId, pages_to_write: u64) -> Result<WriteDisposition>;

    /// Perform read-ahead for a file object.
    fn perform_read_ahead(&self, file: FileId) -> Result<()>;

    /// Nudge writes deferred on an external condition. Must be safe to call
    /// redundantly.
    fn post_deferred_writes(&self);

    /// Whether any deferred writes are waiting.
    fn deferred_writes_pending(&self) -> bool;

    /// Could a charged write of `threshold_pages` be admitted right now?
    /// `false` signals back-pressure, which makes temporary files flushable.
    fn can_i_write(&self, file: FileId, threshold_pages: u64, wait: bool, retry_priority: u8)
        -> bool;

    /// Classify a dispatch failure. Expected failures are logged and
    /// swallowed; unexpected ones abort the process, because the lazy writer
    /// must not silently drop ticks.
    fn is_expected_failure(&self, err: &LwError) -> bool {
        err.is_expected()
    }
}

/// Backend that flushes everything instantly and defers nothing.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopCacheBackend;

impl CacheBackend for NoopCacheBackend {
    fn write_behind(&self, _stream: StreamId, pages_to_write: u64) -> Result<WriteDisposition> {
        Ok(WriteDisposition::Flushed {
            pages: pages_to_write,
        })
    }

    fn perform_read_ahead(&self, _file: FileId) -> Result<()> {
        Ok(())
    }

    fn post_deferred_writes(&self) {}

    fn deferred_writes_pending(&self) -> bool {
        false
    }

    fn can_i_write(
        &self,
        _file: FileId,
        _threshold_pages: u64,
        _wait: bool,
        _retry_priority: u8,
    ) -> bool {
        true
    }
}

/// Everything guarded by the master lock.
#[derive(Debug)]
pub(crate) struct CacheState {
    pub(crate) inventory: DirtyInventory,
    pub(crate) total_dirty_pages: u64,
    pub(crate) dirty_page_target: u64,
    pub(crate) pages_written_last_time: u64,
    pub(crate) dirty_pages_last_scan: u64,
    pub(crate) pages_yet_to_write: u64,
    pub(crate) scan_active: bool,
    pub(crate) other_work: bool,
    /// Barrier staging area, spliced into the regular lane at end of scan.
    pub(crate) post_tick: VecDeque<WorkEntry>,
}

impl CacheState {
    fn new(config: &LazyWriterConfig) -> Self {
        Self {
            inventory: DirtyInventory::new(),
            total_dirty_pages: 0,
            dirty_page_target: config.dirty_page_target,
            pages_written_last_time: 0,
            dirty_pages_last_scan: 0,
            pages_yet_to_write: 0,
            scan_active: false,
            other_work: false,
            post_tick: VecDeque::new(),
        }
    }
}

/// Shared engine state; one per cache manager.
pub(crate) struct Engine {
    pub(crate) config: LazyWriterConfig,
    pub(crate) backend: Arc<dyn CacheBackend>,
    pub(crate) master: Mutex<CacheState>,
    pub(crate) work: Mutex<WorkState>,
    /// Serializes scan invocations: timer-posted ticks and the synchronous
    /// tail-of-worker rescan may race, and at most one may run.
    pub(crate) scan_latch: Mutex<()>,
    pub(crate) park_slots: Vec<Arc<ParkSlot>>,
    pub(crate) timer: ScanTimer,
    pub(crate) stop: AtomicBool,
}

impl Engine {
    fn new(config: LazyWriterConfig, backend: Arc<dyn CacheBackend>) -> Self {
        let master = Mutex::new(CacheState::new(&config));
        let work = Mutex::new(WorkState::new(config.work_entry_limit, config.worker_count));
        let park_slots = (0..config.worker_count)
            .map(|_| Arc::new(ParkSlot::new()))
            .collect();
        Self {
            config,
            backend,
            master,
            work,
            scan_latch: Mutex::new(()),
            park_slots,
            timer: ScanTimer::new(),
            stop: AtomicBool::new(false),
        }
    }

    fn wait_for_current_activity(&self) -> Result<()> {
        if self.stop.load(Ordering::Acquire) {
            return Err(LwError::ShuttingDown);
        }
        let event = Arc::new(NotifyEvent::new());
        let entry = self
            .allocate_entry(WorkItem::EventSet(Arc::clone(&event)))
            .ok_or(LwError::InsufficientResources)?;

        // The scan drains the staging queue at the top of a tick and splices
        // it behind everything that tick issues, so the event fires strictly
        // after all work visible now.
        let mut master = self.master.lock();
        master.post_tick.push_back(entry);
        master.other_work = true;
        if !master.scan_active {
            self.schedule_scan_locked(&mut master, true);
        }
        drop(master);

        event.wait();
        Ok(())
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LazyWriterMetrics {
    pub total_dirty_pages: u64,
    /// Streams currently in the dirty ring.
    pub dirty_streams: usize,
    pub scan_active: bool,
    pub other_work: bool,
    pub pages_yet_to_write: u64,
    pub pages_written_last_time: u64,
    pub idle_workers: usize,
    pub active_workers: usize,
    pub queue_throttle: bool,
    pub work_entries_outstanding: usize,
}

/// Handle to a running lazy-writer engine.
///
/// Owns the worker pool and the scan timer; dropping the handle stops both.
/// Shutdown does not drain; quiescence is the caller's concern.
pub struct LazyWriter {
    engine: Arc<Engine>,
    workers: Vec<JoinHandle<()>>,
    timer: Option<JoinHandle<()>>,
}

impl LazyWriter {
    /// Validate `config`, spawn the worker pool and the scan timer.
    ///
    /// The engine starts idle; the first dirty page, teardown request, or
    /// barrier wakes it.
    pub fn start(config: LazyWriterConfig, backend: Arc<dyn CacheBackend>) -> Result<Self> {
        let config = config.validate()?;
        let worker_count = config.worker_count;
        let engine = Arc::new(Engine::new(config, backend));

        let timer_engine = Arc::clone(&engine);
        let timer = thread::Builder::new()
            .name("lw-scan-timer".to_owned())
            .spawn(move || ScanTimer::run(&timer_engine))
            .map_err(LwError::from)?;

        let mut workers = Vec::with_capacity(worker_count);
        for idx in 0..worker_count {
            let worker_engine = Arc::clone(&engine);
            workers.push(
                thread::Builder::new()
                    .name(format!("lw-worker-{idx}"))
                    .spawn(move || worker_engine.worker_loop(idx))
                    .map_err(LwError::from)?,
            );
        }

        info!(
            target: "lw::core",
            event = "engine_started",
            workers = worker_count
        );
        Ok(Self {
            engine,
            workers,
            timer: Some(timer),
        })
    }

    /// Register a stream with one open handle and no dirty pages.
    pub fn register_stream(&self, id: StreamId, file: FileId, attrs: StreamAttrs) -> Result<()> {
        self.engine.master.lock().inventory.register(id, file, attrs)
    }

    /// Account `pages` newly dirtied pages to `id`, listing it for the scan
    /// and waking the writer if it was idle.
    pub fn note_dirty(&self, id: StreamId, pages: u64) -> Result<()> {
        if pages == 0 {
            return Ok(());
        }
        let engine = &*self.engine;
        let mut master = engine.master.lock();
        let Some(stream) = master.inventory.stream_mut(id) else {
            return Err(LwError::UnknownStream(id.0));
        };
        stream.dirty_pages = stream.dirty_pages.saturating_add(pages);
        stream.ever_dirty = true;
        master.total_dirty_pages = master.total_dirty_pages.saturating_add(pages);
        master.inventory.list(id);
        if !master.scan_active {
            engine.schedule_scan_locked(&mut master, false);
        }
        Ok(())
    }

    /// Account pages cleaned outside the engine (truncate, purge).
    pub fn note_cleaned(&self, id: StreamId, pages: u64) -> Result<()> {
        let engine = &*self.engine;
        let mut master = engine.master.lock();
        let Some(stream) = master.inventory.stream_mut(id) else {
            return Err(LwError::UnknownStream(id.0));
        };
        // While a write is queued the dirty count carries the queue pin's
        // +1 bias; an overshooting clean must never consume it.
        let available = if stream.flags.contains(StreamFlags::WRITE_QUEUED) {
            stream.dirty_pages.saturating_sub(1)
        } else {
            stream.dirty_pages
        };
        let debit = pages.min(available);
        stream.dirty_pages -= debit;
        let delist = stream.dirty_pages == 0
            && stream.open_count > 0
            && !stream
                .flags
                .intersects(StreamFlags::WRITE_QUEUED | StreamFlags::WAITING_FOR_TEARDOWN);
        master.total_dirty_pages = master.total_dirty_pages.saturating_sub(debit);
        if delist {
            master.inventory.delist(id);
        }
        Ok(())
    }

    /// A new user handle on the stream.
    pub fn open_stream(&self, id: StreamId) -> Result<()> {
        let mut master = self.engine.master.lock();
        let Some(stream) = master.inventory.stream_mut(id) else {
            return Err(LwError::UnknownStream(id.0));
        };
        stream.open_count = stream.open_count.saturating_add(1);
        Ok(())
    }

    /// Drop a user handle. When the last handle of a previously-dirty
    /// stream goes away, the stream becomes a lazy-close candidate and the
    /// writer is woken; a never-dirtied stream is forgotten immediately.
    pub fn close_stream(&self, id: StreamId) -> Result<()> {
        let engine = &*self.engine;
        let mut master = engine.master.lock();
        let Some(stream) = master.inventory.stream_mut(id) else {
            return Err(LwError::UnknownStream(id.0));
        };
        stream.open_count = stream.open_count.saturating_sub(1);
        if stream.open_count > 0 {
            return Ok(());
        }
        if stream.ever_dirty || stream.flags.contains(StreamFlags::WRITE_QUEUED) {
            master.inventory.list(id);
            master.other_work = true;
            if !master.scan_active {
                engine.schedule_scan_locked(&mut master, false);
            }
        } else {
            master.inventory.unregister(id);
        }
        Ok(())
    }

    /// Ask for the stream's cache state to be torn down. Dirty pages are
    /// flushed through the express lane first; returns `true` when the
    /// teardown completed synchronously.
    pub fn request_teardown(&self, id: StreamId) -> Result<bool> {
        let engine = &*self.engine;
        let mut master = engine.master.lock();
        let Some(stream) = master.inventory.stream_mut(id) else {
            return Err(LwError::UnknownStream(id.0));
        };
        if stream.dirty_pages == 0 && !stream.flags.contains(StreamFlags::WRITE_QUEUED) {
            master.inventory.unregister(id);
            return Ok(true);
        }
        stream.flags.insert(StreamFlags::WAITING_FOR_TEARDOWN);
        master.inventory.list(id);
        master.other_work = true;
        engine.schedule_scan_locked(&mut master, true);
        Ok(false)
    }

    /// Update the stream's file size. A zero size makes the stream eligible
    /// for reclaim on its next visit.
    pub fn set_file_size(&self, id: StreamId, file_size: u64) -> Result<()> {
        let mut master = self.engine.master.lock();
        let Some(stream) = master.inventory.stream_mut(id) else {
            return Err(LwError::UnknownStream(id.0));
        };
        stream.file_size = file_size;
        Ok(())
    }

    /// Schedule the next scan; `fast` makes it happen immediately.
    /// Idempotent while the writer is already active.
    pub fn schedule_scan(&self, fast: bool) {
        let engine = &*self.engine;
        let mut master = engine.master.lock();
        engine.schedule_scan_locked(&mut master, fast);
    }

    /// Block until every piece of work visible at the time of the call has
    /// completed. In particular, all lazy closes available now are done.
    ///
    /// Must not be called from a worker thread, and the caller must not hold
    /// anything a flush could block on.
    pub fn wait_for_current_activity(&self) -> Result<()> {
        self.engine.wait_for_current_activity()
    }

    /// Post read-ahead work for `file` to the regular lane.
    pub fn post_read_ahead(&self, file: FileId) -> Result<()> {
        self.engine.post_read_ahead_entry(file)
    }

    /// Snapshot the engine counters. Takes each lock briefly, never both.
    #[must_use]
    pub fn metrics(&self) -> LazyWriterMetrics {
        let (total_dirty_pages, dirty_streams, scan_active, other_work, pages_yet, pages_last) = {
            let master = self.engine.master.lock();
            (
                master.total_dirty_pages,
                master.inventory.listed_len(),
                master.scan_active,
                master.other_work,
                master.pages_yet_to_write,
                master.pages_written_last_time,
            )
        };
        let (idle_workers, active_workers, queue_throttle, work_entries_outstanding) = {
            let work = self.engine.work.lock();
            (
                work.idle_workers.len(),
                work.active_workers,
                work.queue_throttle,
                work.pool.outstanding(),
            )
        };
        LazyWriterMetrics {
            total_dirty_pages,
            dirty_streams,
            scan_active,
            other_work,
            pages_yet_to_write: pages_yet,
            pages_written_last_time: pages_last,
            idle_workers,
            active_workers,
            queue_throttle,
            work_entries_outstanding,
        }
    }

    /// Stop the timer and the worker pool and wait for them to exit.
    pub fn shutdown(mut self) {
        self.stop_and_join();
    }

    fn stop_and_join(&mut self) {
        self.engine.stop.store(true, Ordering::Release);
        // Break the timer wait and every parked worker.
        self.engine.timer.arm(Duration::ZERO);
        for slot in &self.engine.park_slots {
            slot.wake();
        }
        if let Some(timer) = self.timer.take() {
            let _ = timer.join();
        }
        for worker in self.workers.drain(..) {
            let _ = worker.join();
        }
    }
}

impl Drop for LazyWriter {
    fn drop(&mut self) {
        self.stop_and_join();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Instant;

    fn test_config() -> LazyWriterConfig {
        LazyWriterConfig {
            first_delay: Duration::from_millis(20),
            idle_delay: Duration::from_millis(20),
            ..LazyWriterConfig::default()
        }
    }

    fn wait_until(mut cond: impl FnMut() -> bool, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        while Instant::now() < deadline {
            if cond() {
                return true;
            }
            thread::sleep(Duration::from_millis(2));
        }
        cond()
    }

    #[test]
    fn engine_flushes_and_goes_idle() {
        let writer =
            LazyWriter::start(test_config(), Arc::new(NoopCacheBackend)).expect("start engine");
        writer
            .register_stream(StreamId(1), FileId(1), StreamAttrs { file_size: 1 << 20, ..Default::default() })
            .unwrap();
        writer.note_dirty(StreamId(1), 100).unwrap();
        assert!(writer.metrics().scan_active);

        assert!(wait_until(
            || writer.metrics().total_dirty_pages == 0,
            Duration::from_secs(5)
        ));
        assert!(wait_until(
            || !writer.metrics().scan_active,
            Duration::from_secs(5)
        ));
        writer.shutdown();
    }

    #[test]
    fn unknown_stream_is_an_error() {
        let writer =
            LazyWriter::start(test_config(), Arc::new(NoopCacheBackend)).expect("start engine");
        assert!(matches!(
            writer.note_dirty(StreamId(42), 1),
            Err(LwError::UnknownStream(42))
        ));
        writer.shutdown();
    }

    #[test]
    fn invalid_config_is_rejected_before_spawning() {
        let config = LazyWriterConfig {
            worker_count: 0,
            ..test_config()
        };
        assert!(LazyWriter::start(config, Arc::new(NoopCacheBackend)).is_err());
    }
}

//! Worker pool: drains the express and regular lanes, runs flush and
//! read-ahead dispatch, and enforces the event-barrier throttle.

use crate::queue::{QueueTarget, WorkEntry, WorkItem};
use crate::Engine;
use lw_error::LwError;
use lw_types::{StreamFlags, StreamId, WriteDisposition, RESCAN_THRESHOLD_PAGES};
use std::cell::Cell;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{error, trace, warn};

thread_local! {
    static MEMORY_MAKER: Cell<bool> = const { Cell::new(false) };
}

/// True while the current thread is flushing on behalf of the lazy writer.
///
/// Backends may consult this to bias allocation toward success during
/// write-back, so low-resource situations do not turn into lost delayed
/// writes.
#[must_use]
pub fn memory_maker_active() -> bool {
    MEMORY_MAKER.with(Cell::get)
}

/// Raises the memory-maker flag for the current thread and clears it on
/// every exit path, including unwinds out of the backend.
struct MemoryMakerGuard;

impl MemoryMakerGuard {
    fn engage() -> Self {
        MEMORY_MAKER.with(|flag| flag.set(true));
        Self
    }
}

impl Drop for MemoryMakerGuard {
    fn drop(&mut self) {
        MEMORY_MAKER.with(|flag| flag.set(false));
    }
}

/// The lazy writer must not silently lose work: an unexpected failure in a
/// dispatch is fatal rather than dropped.
fn bug_check(context: &str, err: &LwError) -> ! {
    error!(
        target: "lw::worker",
        event = "bugcheck",
        context,
        error = %err,
        "unexpected failure in the lazy writer"
    );
    std::process::abort();
}

enum Dispatch {
    Free,
    Requeue,
}

const PARK_INTERVAL: Duration = Duration::from_millis(250);

impl Engine {
    /// Pool thread entry: park until activated, drain, park again.
    pub(crate) fn worker_loop(&self, idx: usize) {
        loop {
            let woken = self.park_slots[idx].wait(PARK_INTERVAL);
            if self.stop.load(Ordering::Acquire) {
                return;
            }
            if woken {
                self.worker_drain(idx);
            }
        }
    }

    /// Drain both lanes until they are empty or the barrier throttle stops
    /// us, then return this worker to the idle list.
    pub(crate) fn worker_drain(&self, idx: usize) {
        let mut rescan_ok = false;
        let mut drop_throttle = false;
        let mut requeue: Option<(WorkEntry, QueueTarget)> = None;

        let mut work = self.work.lock();
        loop {
            // If we just processed a throttled operation, drop the flag.
            if drop_throttle {
                work.queue_throttle = false;
                drop_throttle = false;
            }
            // On requeue, push at the end of the source queue.
            if let Some((entry, target)) = requeue.take() {
                work.queue_mut(target).push_back(entry);
            }

            let Some(target) = work.pick_queue() else {
                break;
            };
            // A barrier event must observe a single active worker, so it is
            // guaranteed to fire strictly after all earlier jobs.
            if work.head_is_event_set(target) && work.active_workers > 1 {
                work.queue_throttle = true;
                trace!(
                    target: "lw::worker",
                    event = "queue_throttle_engaged",
                    active_workers = work.active_workers
                );
                break;
            }
            let Some(entry) = work.queue_mut(target).pop_front() else {
                break;
            };
            drop(work);

            match self.dispatch_entry(&entry.item, &mut rescan_ok, &mut drop_throttle) {
                Dispatch::Free => self.free_entry(entry),
                Dispatch::Requeue => requeue = Some((entry, target)),
            }

            work = self.work.lock();
        }

        // Break paths keep the lock: the idle hand-back and the active-count
        // decrement must be atomic with the throttle decision, or two
        // workers can both park and strand the barrier entry.
        work.idle_workers.push_back(idx);
        work.active_workers = work.active_workers.saturating_sub(1);
        drop(work);

        // A flush we just completed may have unblocked a deferred writer;
        // kick a fresh scan synchronously before going idle.
        if rescan_ok {
            let total_dirty = self.master.lock().total_dirty_pages;
            if total_dirty >= RESCAN_THRESHOLD_PAGES && self.backend.deferred_writes_pending() {
                trace!(target: "lw::worker", event = "drain_rescan", total_dirty);
                self.lazy_write_scan();
            }
        }
    }

    fn dispatch_entry(
        &self,
        item: &WorkItem,
        rescan_ok: &mut bool,
        drop_throttle: &mut bool,
    ) -> Dispatch {
        match item {
            WorkItem::ReadAhead(file) => {
                if let Err(err) = self.backend.perform_read_ahead(*file) {
                    self.swallow_or_die("read_ahead", err);
                }
                Dispatch::Free
            }
            WorkItem::WriteBehind { stream } => self.dispatch_write_behind(*stream, rescan_ok),
            WorkItem::EventSet(event) => {
                event.set();
                *drop_throttle = true;
                trace!(target: "lw::worker", event = "barrier_signaled");
                Dispatch::Free
            }
            WorkItem::LazyWriteScan => {
                self.lazy_write_scan();
                Dispatch::Free
            }
        }
    }

    fn dispatch_write_behind(&self, stream: StreamId, rescan_ok: &mut bool) -> Dispatch {
        let pages_to_write = {
            let master = self.master.lock();
            master.inventory.stream(stream).map(|s| s.pages_to_write)
        };
        let Some(pages_to_write) = pages_to_write else {
            // The pin should have kept the descriptor alive.
            warn!(
                target: "lw::worker",
                event = "write_behind_stream_gone",
                stream = stream.0
            );
            return Dispatch::Free;
        };

        let guard = MemoryMakerGuard::engage();
        let result = self.backend.write_behind(stream, pages_to_write);
        drop(guard);

        match result {
            Ok(WriteDisposition::Flushed { pages }) => {
                *rescan_ok = true;
                self.complete_write(stream, pages);
                Dispatch::Free
            }
            Ok(WriteDisposition::Requeue) => {
                // The stream stays queued; the entry goes back to the tail
                // of the lane it came from.
                trace!(
                    target: "lw::worker",
                    event = "write_behind_requeued",
                    stream = stream.0
                );
                Dispatch::Requeue
            }
            Err(err) => {
                *rescan_ok = false;
                self.fail_write(stream);
                self.swallow_or_die("write_behind", err);
                Dispatch::Free
            }
        }
    }

    /// Post-flush bookkeeping: release the pin, debit dirty counts, and
    /// complete lazy close or teardown when the stream has drained.
    pub(crate) fn complete_write(&self, id: StreamId, flushed_pages: u64) {
        let mut master = self.master.lock();
        let Some(stream) = master.inventory.stream_mut(id) else {
            return;
        };
        stream.flags.remove(StreamFlags::WRITE_QUEUED);
        let debit = flushed_pages.min(stream.dirty_pages);
        stream.dirty_pages -= debit;

        let drained = stream.dirty_pages == 0;
        let reclaim = drained
            && (stream.open_count == 0
                || stream.flags.contains(StreamFlags::WAITING_FOR_TEARDOWN)
                || stream.file_size == 0);
        let delist = drained && !reclaim;

        master.total_dirty_pages = master.total_dirty_pages.saturating_sub(debit);
        master.pages_yet_to_write = master.pages_yet_to_write.saturating_sub(debit);

        if reclaim {
            master.inventory.unregister(id);
            trace!(target: "lw::worker", event = "stream_reclaimed", stream = id.0);
        } else if delist {
            master.inventory.delist(id);
        }
    }

    /// A failed flush leaves the pages dirty; just release the pin so a
    /// later tick can retry.
    pub(crate) fn fail_write(&self, id: StreamId) {
        let mut master = self.master.lock();
        if let Some(stream) = master.inventory.stream_mut(id) {
            stream.flags.remove(StreamFlags::WRITE_QUEUED);
        }
    }

    fn swallow_or_die(&self, context: &str, err: LwError) {
        if self.backend.is_expected_failure(&err) {
            warn!(
                target: "lw::worker",
                event = "dispatch_failed",
                context,
                error = %err
            );
        } else {
            bug_check(context, &err);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_maker_flag_clears_on_drop() {
        assert!(!memory_maker_active());
        {
            let _guard = MemoryMakerGuard::engage();
            assert!(memory_maker_active());
        }
        assert!(!memory_maker_active());
    }

    #[test]
    fn memory_maker_flag_clears_on_unwind() {
        let result = std::panic::catch_unwind(|| {
            let _guard = MemoryMakerGuard::engage();
            panic!("backend blew up");
        });
        assert!(result.is_err());
        assert!(!memory_maker_active());
    }
}

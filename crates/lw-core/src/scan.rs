//! The lazy-writer scan: pacing, budget computation, and the per-tick
//! iteration over the dirty-stream ring.
//!
//! One tick flushes roughly 1/8 of the dirty pages, bumped upward when the
//! foreground is dirtying faster than the writer retires pages. The scan
//! runs on a worker thread, never re-entered, and resumes where the cursor
//! left off last tick.

use crate::inventory::StreamState;
use crate::queue::{QueueTarget, WorkItem};
use crate::{CacheBackend, Engine};
use lw_types::{
    LazyWriterConfig, StreamFlags, AGE_TARGET, LOCK_COURTESY_VISITS, MAX_RETRY_PRIORITY,
    METADATA_DIVISOR, OVERSIZE_FACTOR, PASS_COUNT_MASK,
};
use std::sync::atomic::Ordering;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};
use tracing::{trace, warn};

/// Compute the page quota for one tick.
///
/// Start from the usual fraction of the dirty total (skipping the divide
/// when there is not enough left, or the last few pages would never be
/// written), estimate the foreground dirtying rate from the previous tick,
/// and if the estimate says the next interval would overshoot the dirty-page
/// target, write enough extra to land on target. All arithmetic saturates:
/// a quota that momentarily exceeds the remaining dirty count must estimate
/// zero carry-over rather than wrap.
#[must_use]
pub fn compute_scan_budget(
    total_dirty: u64,
    pages_written_last_time: u64,
    dirty_pages_last_scan: u64,
    dirty_page_target: u64,
) -> u64 {
    let mut pages_to_write = total_dirty;
    if pages_to_write > AGE_TARGET {
        pages_to_write /= AGE_TARGET;
    }

    let foreground_rate = total_dirty
        .saturating_add(pages_written_last_time)
        .saturating_sub(dirty_pages_last_scan);

    let estimated_next_interval = total_dirty
        .saturating_sub(pages_to_write)
        .saturating_add(foreground_rate);
    if estimated_next_interval > dirty_page_target {
        pages_to_write = pages_to_write.saturating_add(estimated_next_interval - dirty_page_target);
    }
    pages_to_write
}

/// Is `stream` flushable this tick?
///
/// Metadata streams serialize with foreground activity, so they are only
/// serviced once every 16 visits unless the system is small, the backlog is
/// oversized, or teardown is pending. Temporary files are skipped while the
/// write path could still admit a charged write, on the theory that the
/// common open/write/close/delete sequence will truncate them first. Streams
/// whose handles are all gone are picked up for lazy close even with no
/// dirty pages, as are zero-size streams.
fn stream_eligible(
    stream: &mut StreamState,
    pages_to_write: u64,
    config: &LazyWriterConfig,
    backend: &dyn CacheBackend,
) -> bool {
    if stream
        .flags
        .intersects(StreamFlags::WRITE_QUEUED | StreamFlags::IS_CURSOR)
    {
        return false;
    }

    if stream.dirty_pages > 0 {
        if stream.flags.contains(StreamFlags::WAITING_FOR_TEARDOWN) {
            return true;
        }
        if pages_to_write > 0 {
            stream.pass_count = stream.pass_count.wrapping_add(1);
            let pass_open = (stream.pass_count & PASS_COUNT_MASK) == 0
                || !stream.flags.contains(StreamFlags::MODIFIED_WRITE_DISABLED)
                || config.small_system
                || stream.dirty_pages >= OVERSIZE_FACTOR * config.max_write_behind_pages;
            if pass_open
                && (!stream.flags.contains(StreamFlags::TEMPORARY_FILE)
                    || stream.open_count == 0
                    || !backend.can_i_write(
                        stream.file,
                        config.write_charge_threshold_pages,
                        false,
                        MAX_RETRY_PRIORITY,
                    ))
            {
                return true;
            }
        }
    }

    (stream.open_count == 0 && stream.dirty_pages == 0) || stream.file_size == 0
}

#[derive(Debug)]
struct TimerShared {
    deadline: Mutex<Option<Instant>>,
    cv: Condvar,
}

/// One-shot, re-armable scan timer backed by a dedicated thread.
///
/// Re-arming overwrites any pending deadline; the thread fires the scan
/// callback once per expiry.
#[derive(Debug)]
pub(crate) struct ScanTimer {
    shared: Arc<TimerShared>,
}

impl ScanTimer {
    pub(crate) fn new() -> Self {
        Self {
            shared: Arc::new(TimerShared {
                deadline: Mutex::new(None),
                cv: Condvar::new(),
            }),
        }
    }

    pub(crate) fn arm(&self, delay: Duration) {
        let mut deadline = self
            .shared
            .deadline
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *deadline = Some(Instant::now() + delay);
        drop(deadline);
        self.shared.cv.notify_all();
        trace!(
            target: "lw::scan",
            event = "timer_armed",
            delay_ms = delay.as_millis() as u64
        );
    }

    /// Timer thread body. Exits when the engine's stop flag is raised; the
    /// engine raises it and then arms a zero deadline so the wait breaks.
    pub(crate) fn run(engine: &Arc<Engine>) {
        let shared = Arc::clone(&engine.timer.shared);
        loop {
            if engine.stop.load(Ordering::Acquire) {
                return;
            }
            let mut fire = false;
            {
                let mut deadline = shared
                    .deadline
                    .lock()
                    .unwrap_or_else(PoisonError::into_inner);
                match *deadline {
                    None => {
                        deadline = shared
                            .cv
                            .wait(deadline)
                            .unwrap_or_else(PoisonError::into_inner);
                    }
                    Some(at) => {
                        let now = Instant::now();
                        if now >= at {
                            *deadline = None;
                            fire = true;
                        } else {
                            let (guard, _timeout) = shared
                                .cv
                                .wait_timeout(deadline, at - now)
                                .unwrap_or_else(PoisonError::into_inner);
                            deadline = guard;
                        }
                    }
                }
                drop(deadline);
            }
            if fire && !engine.stop.load(Ordering::Acquire) {
                engine.scan_timer_fired();
            }
        }
    }
}

impl Engine {
    /// Arm the next scan. Callers hold the master lock; the scan itself
    /// calls this at the end of a tick through a fresh lock acquisition.
    ///
    /// `scan_active` is raised before the timer so a racing scan thread can
    /// never observe an armed timer with the flag still down. Going from
    /// idle to active uses the longer first delay to let an application
    /// finish saving its file.
    pub(crate) fn schedule_scan_locked(&self, master: &mut crate::CacheState, fast: bool) {
        if fast {
            master.scan_active = true;
            self.timer.arm(self.config.no_delay);
        } else if master.scan_active {
            self.timer.arm(self.config.idle_delay);
        } else {
            master.scan_active = true;
            self.timer.arm(self.config.first_delay);
        }
    }

    /// Timer expiry: post one scan job to the regular lane.
    pub(crate) fn scan_timer_fired(&self) {
        if self.stop.load(Ordering::Acquire) {
            return;
        }
        match self.allocate_entry(WorkItem::LazyWriteScan) {
            Some(entry) => self.post_work_queue(entry, QueueTarget::Regular),
            None => {
                // Things must be in bad shape; go inactive and let the next
                // external wake re-arm.
                let mut master = self.master.lock();
                master.scan_active = false;
                drop(master);
                warn!(
                    target: "lw::scan",
                    event = "scan_post_failed",
                    "no work entry for the scan tick"
                );
            }
        }
    }

    /// One tick of the lazy writer.
    pub(crate) fn lazy_write_scan(&self) {
        // At most one scan runs at a time; a racer's work is subsumed by the
        // running tick's reschedule.
        let Some(_latch) = self.scan_latch.try_lock() else {
            trace!(target: "lw::scan", event = "scan_already_running");
            return;
        };

        let backend = Arc::clone(&self.backend);
        let mut master = self.master.lock();

        // No dirty data and no other work: go inactive, unless deferred
        // writes are blocked on an external condition, in which case keep
        // poking; the writer may have no bytes of its own to push.
        if master.total_dirty_pages == 0 && !master.other_work {
            if !backend.deferred_writes_pending() {
                debug_assert!(
                    !master.inventory.has_unqueued_teardown(),
                    "going idle with teardown-flagged streams still listed"
                );
                master.scan_active = false;
                drop(master);
                trace!(target: "lw::scan", event = "scan_idle");
                return;
            }
            drop(master);
            backend.post_deferred_writes();
            let mut master = self.master.lock();
            self.schedule_scan_locked(&mut master, false);
            return;
        }

        // Freeze the barrier set for this tick. Entries queued from here on
        // belong to the next tick, and everything frozen here is guaranteed
        // to run after all work this tick issues.
        let post_tick: Vec<_> = master.post_tick.drain(..).collect();
        master.other_work = false;

        let mut pages_to_write = compute_scan_budget(
            master.total_dirty_pages,
            master.pages_written_last_time,
            master.dirty_pages_last_scan,
            master.dirty_page_target,
        );
        master.dirty_pages_last_scan = master.total_dirty_pages;
        master.pages_written_last_time = pages_to_write;
        master.pages_yet_to_write = pages_to_write;
        trace!(
            target: "lw::scan",
            event = "scan_tick",
            total_dirty = master.dirty_pages_last_scan,
            budget = pages_to_write,
            barriers = post_tick.len()
        );

        // Visit every stream once, starting after the cursor. The stamp of
        // the first visited node is remembered so the walk also terminates
        // if that node is torn down and its slot recycled mid-tick.
        let mut slot = master.inventory.cursor_successor();
        let mut first_visited: Option<(usize, u64)> = None;
        let mut already_moved = false;
        let mut courtesy: u32 = 0;

        loop {
            if master.inventory.is_cursor(slot) {
                break;
            }
            let stamp = master.inventory.stamp_of(slot);
            if first_visited == Some((slot, stamp)) {
                break;
            }
            if first_visited.is_none() {
                first_visited = Some((slot, stamp));
            }
            let at_first = first_visited == Some((slot, stamp));

            let Some(stream) = master.inventory.stream_at_mut(slot) else {
                break;
            };
            let eligible = stream_eligible(stream, pages_to_write, &self.config, backend.as_ref());

            if eligible {
                // A metadata stream sitting on a large backlog releases it
                // in eighths so it does not monopolize the I/O path.
                stream.pages_to_write = stream.dirty_pages;
                if stream.flags.contains(StreamFlags::MODIFIED_WRITE_DISABLED)
                    && stream.pages_to_write >= OVERSIZE_FACTOR * self.config.max_write_behind_pages
                    && !self.config.small_system
                {
                    stream.pages_to_write /= METADATA_DIVISOR;
                }

                let mut move_behind = false;
                let mut resume_here = false;
                if !already_moved {
                    if stream.pages_to_write >= pages_to_write {
                        // Budget met: decide where the next tick resumes.
                        // Metadata streams, and a first-visited stream that
                        // keeps soaking the whole budget, push the cursor
                        // past themselves; a normal large sequential writer
                        // is resumed on directly to ride its locality.
                        if stream.flags.contains(StreamFlags::MODIFIED_WRITE_DISABLED)
                            || (at_first && (stream.pass_count & PASS_COUNT_MASK) == 0)
                        {
                            move_behind = true;
                        } else {
                            resume_here = true;
                        }
                        pages_to_write = 0;
                        already_moved = true;
                    } else {
                        pages_to_write -= stream.pages_to_write;
                    }
                }

                // Pin before the lock gap: the flag keeps the descriptor
                // from being reclaimed or re-dispatched, and the bias keeps
                // the dirty count from reaching zero under us.
                stream.flags.insert(StreamFlags::WRITE_QUEUED);
                stream.dirty_pages += 1;
                let id = stream.id;
                let dispatched_pages = stream.pages_to_write;

                if resume_here {
                    master.inventory.move_cursor_before(slot);
                }

                drop(master);
                let entry = self.allocate_entry(WorkItem::WriteBehind { stream: id });
                master = self.master.lock();

                let Some(stream) = master.inventory.stream_mut(id) else {
                    break;
                };
                stream.dirty_pages -= 1;
                let Some(entry) = entry else {
                    stream.flags.remove(StreamFlags::WRITE_QUEUED);
                    warn!(
                        target: "lw::scan",
                        event = "dispatch_alloc_failed",
                        stream = id.0,
                        "work entry pool exhausted; retrying on a later tick"
                    );
                    break;
                };
                let target = if stream.flags.contains(StreamFlags::WAITING_FOR_TEARDOWN) {
                    QueueTarget::Express
                } else {
                    QueueTarget::Regular
                };
                trace!(
                    target: "lw::scan",
                    event = "write_dispatched",
                    stream = id.0,
                    pages = dispatched_pages,
                    express = (target == QueueTarget::Express)
                );

                // Pick the resume point before any cursor splice, so moving
                // the cursor behind this stream cannot shorten the walk.
                let next = master.inventory.next_of(slot);
                let next_stamp = master.inventory.stamp_of(next);
                if move_behind {
                    master.inventory.move_cursor_after(slot);
                }

                drop(master);
                self.post_work_queue(entry, target);
                master = self.master.lock();
                courtesy = 0;

                if master.inventory.stamp_of(next) != next_stamp
                    || (!master.inventory.is_cursor(next) && !master.inventory.is_stream_slot(next))
                {
                    // Our successor was torn down while the entry was being
                    // posted; stop here and let the next tick resume.
                    trace!(target: "lw::scan", event = "scan_stopped_on_recycled_successor");
                    break;
                }
                slot = next;
            } else {
                // Make sure the master lock is dropped occasionally even on
                // long skip runs, pinning the current stream across the gap.
                courtesy += 1;
                let mut yielded: Option<lw_types::StreamId> = None;
                if courtesy >= LOCK_COURTESY_VISITS {
                    if let Some(stream) = master.inventory.stream_at_mut(slot) {
                        if !stream
                            .flags
                            .intersects(StreamFlags::WRITE_QUEUED | StreamFlags::IS_CURSOR)
                        {
                            stream.flags.insert(StreamFlags::WRITE_QUEUED);
                            stream.dirty_pages += 1;
                            yielded = Some(stream.id);
                        }
                    }
                }
                if let Some(id) = yielded {
                    drop(master);
                    courtesy = 0;
                    master = self.master.lock();
                    if let Some(stream) = master.inventory.stream_mut(id) {
                        stream.flags.remove(StreamFlags::WRITE_QUEUED);
                        stream.dirty_pages -= 1;
                    }
                }
                slot = master.inventory.next_of(slot);
            }
        }

        // Queue the frozen barrier entries behind everything this tick
        // issued, then let the deferred writes have their poke.
        drop(master);
        for entry in post_tick {
            self.post_work_queue(entry, QueueTarget::Regular);
        }
        self.poke_deferred_writes(backend.as_ref());

        let mut master = self.master.lock();
        self.schedule_scan_locked(&mut master, false);
        drop(master);
        trace!(target: "lw::scan", event = "scan_end");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn small_totals_are_written_whole() {
        // Below the age target the divide is skipped, or the last few pages
        // would never be written.
        assert_eq!(compute_scan_budget(0, 0, 0, 1000), 0);
        assert_eq!(compute_scan_budget(5, 0, 5, 1000), 5);
        assert_eq!(compute_scan_budget(AGE_TARGET, 0, AGE_TARGET, 1000), AGE_TARGET);
    }

    #[test]
    fn steady_state_writes_an_eighth() {
        // 100 dirty pages, no foreground activity since last tick.
        assert_eq!(compute_scan_budget(100, 0, 100, 1000), 12);
    }

    #[test]
    fn overshoot_bumps_toward_target() {
        // 2000 dirty, quiet foreground, target 100: 250 base plus the 1650
        // needed to land on target next interval.
        assert_eq!(compute_scan_budget(2000, 0, 2000, 100), 1900);
    }

    #[test]
    fn foreground_rate_is_clamped_at_zero() {
        // The dirty count dropped faster than we wrote: no negative rate.
        assert_eq!(compute_scan_budget(100, 10, 500, 1000), 12);
    }

    #[test]
    fn budget_quota_exceeding_dirty_does_not_underflow() {
        // total == quota leaves zero carry-over, not a wrapped estimate.
        assert_eq!(compute_scan_budget(4, 0, 4, 0), 4);
        assert_eq!(compute_scan_budget(1, u64::MAX, 0, 0), u64::MAX);
    }

    proptest! {
        #[test]
        fn budget_never_exceeds_dirty_plus_rate(
            total in 0_u64..=u64::MAX / 4,
            written in 0_u64..=u64::MAX / 4,
            last in 0_u64..=u64::MAX / 4,
            target in 0_u64..=u64::MAX / 4,
        ) {
            let budget = compute_scan_budget(total, written, last, target);
            let rate = total.saturating_add(written).saturating_sub(last);
            prop_assert!(budget <= total.saturating_add(rate));
        }
    }
}

//! Dirty-stream inventory.
//!
//! A circular doubly-linked ring of streams that currently have dirty pages
//! or pending teardown work, with one embedded cursor node marking where the
//! next scan resumes. The ring is realized as an arena of index-linked slots
//! so cursor splices never allocate and neighbors of a removed node stay
//! valid. Slots carry a generation stamp; a freed-and-recycled slot is never
//! mistaken for a node remembered across a lock release.
//!
//! All mutation happens under the engine's master lock; this module holds no
//! locks of its own.

use lw_error::{LwError, Result};
use lw_types::{FileId, StreamAttrs, StreamFlags, StreamId};
use std::collections::HashMap;

/// Per-stream descriptor. Every field is guarded by the master lock; the
/// scan's transient `dirty_pages` bias while the lock is released is covered
/// by `WRITE_QUEUED`, which pins the descriptor against reclaim.
#[derive(Debug)]
pub(crate) struct StreamState {
    pub(crate) id: StreamId,
    pub(crate) file: FileId,
    pub(crate) dirty_pages: u64,
    /// Scratch quota written by the scan, read by the flush worker.
    pub(crate) pages_to_write: u64,
    pub(crate) flags: StreamFlags,
    pub(crate) open_count: u32,
    pub(crate) file_size: u64,
    pub(crate) pass_count: u64,
    /// Ring slot while listed.
    pub(crate) slot: Option<usize>,
    /// The stream has carried dirty pages at some point; clean zero-handle
    /// streams with this set are lazy-close candidates.
    pub(crate) ever_dirty: bool,
}

#[derive(Debug)]
enum Occupant {
    Free,
    Cursor,
    Stream(StreamId),
}

#[derive(Debug)]
struct Slot {
    prev: usize,
    next: usize,
    stamp: u64,
    occupant: Occupant,
}

/// The inventory: registered stream descriptors plus the dirty ring.
#[derive(Debug)]
pub(crate) struct DirtyInventory {
    streams: HashMap<StreamId, StreamState>,
    slots: Vec<Slot>,
    free: Vec<usize>,
    cursor: usize,
    listed: usize,
}

impl DirtyInventory {
    pub(crate) fn new() -> Self {
        // Slot 0 is the cursor, linked to itself; it is never freed.
        let cursor = Slot {
            prev: 0,
            next: 0,
            stamp: 0,
            occupant: Occupant::Cursor,
        };
        Self {
            streams: HashMap::new(),
            slots: vec![cursor],
            free: Vec::new(),
            cursor: 0,
            listed: 0,
        }
    }

    pub(crate) fn register(&mut self, id: StreamId, file: FileId, attrs: StreamAttrs) -> Result<()> {
        if self.streams.contains_key(&id) {
            return Err(LwError::AlreadyRegistered(id.0));
        }
        let mut flags = StreamFlags::empty();
        if attrs.modified_write_disabled {
            flags.insert(StreamFlags::MODIFIED_WRITE_DISABLED);
        }
        if attrs.temporary {
            flags.insert(StreamFlags::TEMPORARY_FILE);
        }
        self.streams.insert(
            id,
            StreamState {
                id,
                file,
                dirty_pages: 0,
                pages_to_write: 0,
                flags,
                open_count: 1,
                file_size: attrs.file_size,
                pass_count: 0,
                slot: None,
                ever_dirty: false,
            },
        );
        Ok(())
    }

    pub(crate) fn stream(&self, id: StreamId) -> Option<&StreamState> {
        self.streams.get(&id)
    }

    pub(crate) fn stream_mut(&mut self, id: StreamId) -> Option<&mut StreamState> {
        self.streams.get_mut(&id)
    }

    pub(crate) fn stream_id_at(&self, slot: usize) -> Option<StreamId> {
        match self.slots.get(slot).map(|s| &s.occupant) {
            Some(Occupant::Stream(id)) => Some(*id),
            _ => None,
        }
    }

    pub(crate) fn stream_at_mut(&mut self, slot: usize) -> Option<&mut StreamState> {
        let id = self.stream_id_at(slot)?;
        self.streams.get_mut(&id)
    }

    /// Link a registered stream into the ring, just behind the cursor, so it
    /// is the last node the current visit order reaches.
    pub(crate) fn list(&mut self, id: StreamId) {
        let Some(state) = self.streams.get_mut(&id) else {
            return;
        };
        if state.slot.is_some() {
            return;
        }
        let slot = self.alloc_slot(Occupant::Stream(id));
        self.link_before(slot, self.cursor);
        self.listed += 1;
        if let Some(state) = self.streams.get_mut(&id) {
            state.slot = Some(slot);
        }
    }

    /// Unlink a stream from the ring, keeping its descriptor registered.
    pub(crate) fn delist(&mut self, id: StreamId) {
        let Some(state) = self.streams.get_mut(&id) else {
            return;
        };
        let Some(slot) = state.slot.take() else {
            return;
        };
        debug_assert!(slot != self.cursor);
        self.unlink(slot);
        self.free_slot(slot);
        self.listed -= 1;
    }

    /// Drop a stream entirely: delist it and forget the descriptor.
    pub(crate) fn unregister(&mut self, id: StreamId) {
        self.delist(id);
        self.streams.remove(&id);
    }

    pub(crate) fn is_listed(&self, id: StreamId) -> bool {
        self.streams.get(&id).is_some_and(|s| s.slot.is_some())
    }

    pub(crate) fn listed_len(&self) -> usize {
        self.listed
    }

    pub(crate) fn cursor_successor(&self) -> usize {
        self.slots[self.cursor].next
    }

    pub(crate) fn next_of(&self, slot: usize) -> usize {
        self.slots[slot].next
    }

    pub(crate) fn is_cursor(&self, slot: usize) -> bool {
        slot == self.cursor
    }

    pub(crate) fn stamp_of(&self, slot: usize) -> u64 {
        self.slots[slot].stamp
    }

    pub(crate) fn is_stream_slot(&self, slot: usize) -> bool {
        matches!(
            self.slots.get(slot).map(|s| &s.occupant),
            Some(Occupant::Stream(_))
        )
    }

    /// Splice the cursor to just before `slot`: the next scan resumes on the
    /// stream occupying `slot`.
    pub(crate) fn move_cursor_before(&mut self, slot: usize) {
        debug_assert!(slot != self.cursor);
        self.unlink(self.cursor);
        self.link_before(self.cursor, slot);
    }

    /// Splice the cursor to just after `slot`: the next scan resumes on the
    /// stream that follows `slot`.
    pub(crate) fn move_cursor_after(&mut self, slot: usize) {
        debug_assert!(slot != self.cursor);
        self.unlink(self.cursor);
        let next = self.slots[slot].next;
        self.link_before(self.cursor, next);
    }

    /// A teardown-flagged stream is still listed without a queued write.
    /// Used by the scan's quiescence assertion.
    pub(crate) fn has_unqueued_teardown(&self) -> bool {
        self.streams.values().any(|s| {
            s.slot.is_some()
                && s.flags.contains(StreamFlags::WAITING_FOR_TEARDOWN)
                && !s.flags.contains(StreamFlags::WRITE_QUEUED)
        })
    }

    /// Stream ids in visit order, starting after the cursor. Test probe.
    #[cfg(test)]
    pub(crate) fn visit_order(&self) -> Vec<StreamId> {
        let mut out = Vec::new();
        let mut slot = self.cursor_successor();
        while slot != self.cursor {
            if let Some(id) = self.stream_id_at(slot) {
                out.push(id);
            }
            slot = self.next_of(slot);
        }
        out
    }

    fn alloc_slot(&mut self, occupant: Occupant) -> usize {
        if let Some(slot) = self.free.pop() {
            self.slots[slot].occupant = occupant;
            slot
        } else {
            self.slots.push(Slot {
                prev: 0,
                next: 0,
                stamp: 0,
                occupant,
            });
            self.slots.len() - 1
        }
    }

    fn free_slot(&mut self, slot: usize) {
        self.slots[slot].occupant = Occupant::Free;
        self.slots[slot].stamp = self.slots[slot].stamp.wrapping_add(1);
        self.free.push(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        self.slots[prev].next = next;
        self.slots[next].prev = prev;
    }

    fn link_before(&mut self, slot: usize, target: usize) {
        let prev = self.slots[target].prev;
        self.slots[prev].next = slot;
        self.slots[slot].prev = prev;
        self.slots[slot].next = target;
        self.slots[target].prev = slot;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn attrs() -> StreamAttrs {
        StreamAttrs::default()
    }

    /// Walk the ring both ways and check it against the descriptor map.
    fn check_ring(inv: &DirtyInventory) {
        let mut forward = 0_usize;
        let mut slot = inv.cursor_successor();
        while slot != inv.cursor {
            assert!(inv.is_stream_slot(slot), "ring holds a non-stream slot");
            let id = inv.stream_id_at(slot).unwrap();
            assert_eq!(inv.stream(id).unwrap().slot, Some(slot));
            forward += 1;
            assert!(forward <= inv.slots.len(), "ring does not close");
            slot = inv.next_of(slot);
        }
        assert_eq!(forward, inv.listed_len());

        let mut backward = 0_usize;
        let mut slot = inv.slots[inv.cursor].prev;
        while slot != inv.cursor {
            backward += 1;
            assert!(backward <= inv.slots.len(), "ring does not close backward");
            slot = inv.slots[slot].prev;
        }
        assert_eq!(backward, forward);
    }

    fn listed(inv: &mut DirtyInventory, id: u64) -> StreamId {
        let id = StreamId(id);
        inv.register(id, FileId(id.0), attrs()).unwrap();
        inv.list(id);
        check_ring(inv);
        id
    }

    #[test]
    fn empty_inventory_is_a_cursor_only_ring() {
        let inv = DirtyInventory::new();
        assert_eq!(inv.cursor_successor(), inv.cursor);
        assert_eq!(inv.listed_len(), 0);
        check_ring(&inv);
    }

    #[test]
    fn duplicate_registration_is_rejected() {
        let mut inv = DirtyInventory::new();
        inv.register(StreamId(1), FileId(1), attrs()).unwrap();
        assert!(matches!(
            inv.register(StreamId(1), FileId(1), attrs()),
            Err(LwError::AlreadyRegistered(1))
        ));
    }

    #[test]
    fn new_streams_are_visited_last() {
        let mut inv = DirtyInventory::new();
        let a = listed(&mut inv, 1);
        let b = listed(&mut inv, 2);
        let c = listed(&mut inv, 3);
        assert_eq!(inv.visit_order(), vec![a, b, c]);
    }

    #[test]
    fn delist_keeps_ring_closed() {
        let mut inv = DirtyInventory::new();
        let a = listed(&mut inv, 1);
        let b = listed(&mut inv, 2);
        let c = listed(&mut inv, 3);
        inv.delist(b);
        check_ring(&inv);
        assert_eq!(inv.visit_order(), vec![a, c]);
        assert!(inv.stream(b).is_some(), "delist keeps the descriptor");
        inv.unregister(c);
        check_ring(&inv);
        assert!(inv.stream(c).is_none());
        assert_eq!(inv.visit_order(), vec![a]);
    }

    #[test]
    fn cursor_splices_change_the_resume_point() {
        let mut inv = DirtyInventory::new();
        let a = listed(&mut inv, 1);
        let b = listed(&mut inv, 2);
        let c = listed(&mut inv, 3);

        // Resume on b next time.
        let b_slot = inv.stream(b).unwrap().slot.unwrap();
        inv.move_cursor_before(b_slot);
        check_ring(&inv);
        assert_eq!(inv.visit_order(), vec![b, c, a]);

        // Resume after b next time.
        inv.move_cursor_after(b_slot);
        check_ring(&inv);
        assert_eq!(inv.visit_order(), vec![c, a, b]);
    }

    #[test]
    fn recycled_slots_change_stamp() {
        let mut inv = DirtyInventory::new();
        let a = listed(&mut inv, 1);
        let slot = inv.stream(a).unwrap().slot.unwrap();
        let stamp = inv.stamp_of(slot);
        inv.unregister(a);
        let b = listed(&mut inv, 2);
        let b_slot = inv.stream(b).unwrap().slot.unwrap();
        assert_eq!(b_slot, slot, "slot should be recycled");
        assert_ne!(inv.stamp_of(b_slot), stamp);
    }

    #[test]
    fn unqueued_teardown_detection() {
        let mut inv = DirtyInventory::new();
        let a = listed(&mut inv, 1);
        assert!(!inv.has_unqueued_teardown());
        inv.stream_mut(a).unwrap().flags |= StreamFlags::WAITING_FOR_TEARDOWN;
        assert!(inv.has_unqueued_teardown());
        inv.stream_mut(a).unwrap().flags |= StreamFlags::WRITE_QUEUED;
        assert!(!inv.has_unqueued_teardown());
    }
}

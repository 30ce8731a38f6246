//! Intrusive per-slot expiry list.
//!
//! Entries hashed to the same wheel slot form a doubly linked list threaded
//! through their own worker-state fields, so cancellation unlink is O(1)
//! with no per-entry allocation. The list holds the owning reference of every
//! linked entry: `push` turns an `Arc` into a raw pointer, `unlink` turns it
//! back. Neighbor pointers are non-owning.
//!
//! # Invariants
//! - `head.is_null() == tail.is_null()`; an empty bucket is `head == null`.
//! - A linked entry has `ws.bucket != NO_BUCKET`; an unlinked entry has
//!   `bucket == NO_BUCKET` and null `prev`/`next`.
//! - Every linked entry carries exactly one list-owned refcount.
//!
//! # Single-writer contract
//! All methods take `&mut self` and are called only by the tick worker (or
//! by a test with exclusive ownership of the wheel). That exclusivity is
//! what makes the `worker_state` accesses below sound.

use std::sync::Arc;

use crate::entry::{TimeoutInner, NO_BUCKET};

/// The expiry sweep met `remaining_rounds == 0` with a deadline still in the
/// future: a placement bug. Fatal to the tick loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct MisplacedTimeout {
    pub(crate) deadline_ms: u64,
    pub(crate) tick_deadline_ms: u64,
}

impl std::fmt::Display for MisplacedTimeout {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "timeout with deadline {} ms swept at tick deadline {} ms with zero rounds left",
            self.deadline_ms, self.tick_deadline_ms
        )
    }
}

pub(crate) struct Bucket {
    head: *const TimeoutInner,
    tail: *const TimeoutInner,
}

// SAFETY: a Bucket is owned by the worker thread; the raw pointers inside
// are reachable from no other place once linked (the registrant's handle
// never dereferences link state).
unsafe impl Send for Bucket {}

impl Bucket {
    pub(crate) fn new() -> Self {
        Self {
            head: std::ptr::null(),
            tail: std::ptr::null(),
        }
    }

    #[inline]
    pub(crate) fn is_empty(&self) -> bool {
        let empty = self.head.is_null();
        debug_assert!(empty == self.tail.is_null());
        empty
    }

    /// Append at the tail, transferring ownership of one refcount to the list.
    pub(crate) fn push(&mut self, entry: Arc<TimeoutInner>, slot: u32) {
        debug_assert!(slot != NO_BUCKET);

        // SAFETY: single-writer contract (module docs).
        let ws = unsafe { entry.worker_state() };
        assert!(!ws.is_linked(), "pushing already-linked timeout");

        ws.bucket = slot;
        ws.prev = self.tail;
        ws.next = std::ptr::null();

        let raw = Arc::into_raw(entry);
        if self.tail.is_null() {
            debug_assert!(self.head.is_null());
            self.head = raw;
        } else {
            // SAFETY: tail is a live linked entry owned by this list.
            unsafe { (*self.tail).worker_state().next = raw };
        }
        self.tail = raw;
    }

    /// Unlink `entry`, reclaiming the list-owned refcount.
    ///
    /// O(1): fixes the neighbors, repairs head/tail, clears the entry's link
    /// state so a later visit (cancellation drain, stop drain) sees it as
    /// already gone.
    pub(crate) fn unlink(&mut self, entry: &TimeoutInner) -> Arc<TimeoutInner> {
        // SAFETY: single-writer contract.
        let ws = unsafe { entry.worker_state() };
        assert!(ws.is_linked(), "unlinking timeout that is not in a bucket");

        let prev = ws.prev;
        let next = ws.next;
        let raw = entry as *const TimeoutInner;

        if prev.is_null() {
            debug_assert!(std::ptr::eq(self.head, raw));
            self.head = next;
        } else {
            // SAFETY: neighbors of a linked entry are linked entries.
            unsafe { (*prev).worker_state().next = next };
        }
        if next.is_null() {
            debug_assert!(std::ptr::eq(self.tail, raw));
            self.tail = prev;
        } else {
            unsafe { (*next).worker_state().prev = prev };
        }

        ws.prev = std::ptr::null();
        ws.next = std::ptr::null();
        ws.bucket = NO_BUCKET;

        // SAFETY: `raw` was produced by Arc::into_raw in `push` and has not
        // been reclaimed since (the entry was linked until this call).
        unsafe { Arc::from_raw(raw) }
    }

    /// One expiry sweep.
    ///
    /// Walks the list once. Per entry: a pending entry with rounds left is
    /// decremented in place; a cancelled entry is unlinked and handed to
    /// `on_cancelled`; an entry out of rounds is unlinked and, if its
    /// deadline is due, raced against `cancel`: the winner of the CAS hands
    /// it to `on_fire`, a lost race means the cancellation drain will finish
    /// the accounting. An out-of-rounds entry with a future deadline is a
    /// placement bug and aborts the sweep.
    pub(crate) fn expire(
        &mut self,
        tick_deadline_ms: u64,
        mut on_fire: impl FnMut(Arc<TimeoutInner>),
        mut on_cancelled: impl FnMut(Arc<TimeoutInner>),
    ) -> Result<(), MisplacedTimeout> {
        let mut cur = self.head;
        while !cur.is_null() {
            // SAFETY: `cur` is linked, hence alive and list-owned.
            let entry = unsafe { &*cur };
            let ws = unsafe { entry.worker_state() };
            let next = ws.next;

            if entry.is_cancelled() {
                let arc = self.unlink(entry);
                on_cancelled(arc);
            } else if ws.remaining_rounds > 0 {
                ws.remaining_rounds -= 1;
            } else {
                if entry.deadline_ms > tick_deadline_ms {
                    // Left linked: the stop drain that follows a fatal sweep
                    // still hands this entry back as unprocessed.
                    return Err(MisplacedTimeout {
                        deadline_ms: entry.deadline_ms,
                        tick_deadline_ms,
                    });
                }
                let arc = self.unlink(entry);
                if arc.try_expire() {
                    on_fire(arc);
                }
                // Lost CAS: cancelled in the meantime. The entry is already
                // in the cancellation queue; that drain releases it.
            }

            cur = next;
        }
        Ok(())
    }

    /// Pop every entry, in list order, handing each to `f`.
    pub(crate) fn drain(&mut self, mut f: impl FnMut(Arc<TimeoutInner>)) {
        while !self.head.is_null() {
            // SAFETY: head is linked and alive.
            let arc = self.unlink(unsafe { &*self.head });
            f(arc);
        }
        debug_assert!(self.is_empty());
    }

    /// Debug walker: count entries and check link symmetry.
    #[cfg(test)]
    pub(crate) fn check_invariants(&self) -> usize {
        let mut count = 0;
        let mut prev: *const TimeoutInner = std::ptr::null();
        let mut cur = self.head;
        while !cur.is_null() {
            let ws = unsafe { (*cur).worker_state() };
            assert!(ws.is_linked());
            assert!(std::ptr::eq(ws.prev, prev), "prev link asymmetric");
            prev = cur;
            cur = ws.next;
            count += 1;
        }
        assert!(std::ptr::eq(self.tail, prev), "tail is not last node");
        count
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        // Normally drained before drop; reclaim list-owned refcounts if not.
        self.drain(|_| {});
    }
}

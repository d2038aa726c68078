//! Intrusive doubly-linked buckets backing the wheel's slots.

use std::ptr;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering::AcqRel;
use std::sync::Arc;

use crate::timer::timeout::Timeout;

/// One wheel slot: an intrusive doubly-linked list of the timeouts hashed
/// onto it. Only the worker thread ever touches a bucket, so there is no
/// synchronization in here at all; the pending counter threaded through the
/// removal paths is the single piece of shared state updated from this file.
pub struct Bucket {
    head: *const Timeout,
    tail: *const Timeout,
}

impl Bucket {
    pub fn new() -> Self {
        Self {
            head: ptr::null(),
            tail: ptr::null(),
        }
    }

    /// Appends a timeout, taking over one strong count and stamping its link
    /// block with this slot and its remaining revolutions.
    pub fn push(&mut self, timeout: Arc<Timeout>, slot: usize, rounds: u64) {
        let node = Arc::into_raw(timeout);
        unsafe {
            let link = (*node).link_ptr();
            debug_assert!((*link).bucket.is_none(), "timeout is already in a bucket");
            (*link).bucket = Some(slot);
            (*link).rounds = rounds;
            (*link).prev = self.tail;
            (*link).next = ptr::null();
            if self.tail.is_null() {
                self.head = node;
            } else {
                (*(*self.tail).link_ptr()).next = node;
            }
            self.tail = node;
        }
    }

    /// Unlinks `timeout` in O(1), handing its strong count back to the caller
    /// and settling the pending count exactly once.
    pub fn unlink(&mut self, timeout: &Timeout, pending: &AtomicU64) -> Arc<Timeout> {
        let node = timeout as *const Timeout;
        unsafe {
            let link = timeout.link_ptr();
            debug_assert!((*link).bucket.is_some(), "timeout is not in a bucket");
            let prev = (*link).prev;
            let next = (*link).next;
            if prev.is_null() {
                self.head = next;
            } else {
                (*(*prev).link_ptr()).next = next;
            }
            if next.is_null() {
                self.tail = prev;
            } else {
                (*(*next).link_ptr()).prev = prev;
            }
            (*link).prev = ptr::null();
            (*link).next = ptr::null();
            (*link).bucket = None;
            if !(*link).released {
                (*link).released = true;
                pending.fetch_sub(1, AcqRel);
            }
            Arc::from_raw(node)
        }
    }

    /// One pass over the slot for the current tick: due entries are unlinked
    /// and expired, entries with revolutions left are aged by one, and
    /// cancelled stragglers are unlinked and dropped. `elapsed` is the
    /// worker's actual elapsed nanoseconds for this tick.
    pub fn expire(&mut self, elapsed: u64, pending: &AtomicU64) {
        let mut cursor = self.head;
        while !cursor.is_null() {
            let timeout = unsafe { &*cursor };
            // capture before any unlink clears it
            let next = unsafe { (*timeout.link_ptr()).next };
            let rounds = unsafe { (*timeout.link_ptr()).rounds };
            if rounds == 0 {
                let due = self.unlink(timeout, pending);
                assert!(
                    due.deadline() <= elapsed,
                    "timeout placed in the wrong slot: deadline {}ns, elapsed only {}ns",
                    due.deadline(),
                    elapsed
                );
                due.expire();
            } else if timeout.is_cancelled() {
                // lost the race with the cancellation drain; settle it here
                drop(self.unlink(timeout, pending));
            } else {
                unsafe { (*timeout.link_ptr()).rounds = rounds - 1 };
            }
            cursor = next;
        }
    }

    /// Empties the slot for shutdown, collecting still-pending members.
    /// Cancelled stragglers are dropped on the floor.
    pub fn drain_into(&mut self, unprocessed: &mut Vec<Arc<Timeout>>, pending: &AtomicU64) {
        while !self.head.is_null() {
            let timeout = unsafe { &*self.head };
            let removed = self.unlink(timeout, pending);
            if removed.is_pending() {
                unprocessed.push(removed);
            }
        }
    }

    pub fn is_empty(&self) -> bool {
        self.head.is_null()
    }

    /// Entries currently linked. O(n), for diagnostics and tests.
    pub fn len(&self) -> usize {
        let mut count = 0;
        let mut cursor = self.head;
        while !cursor.is_null() {
            count += 1;
            cursor = unsafe { (*(*cursor).link_ptr()).next };
        }
        count
    }
}

impl Drop for Bucket {
    fn drop(&mut self) {
        // The worker's exit sweep normally leaves buckets empty; if the
        // worker died mid-flight the strong counts still owed are returned
        // here instead.
        let mut cursor = self.head;
        while !cursor.is_null() {
            unsafe {
                let next = (*(*cursor).link_ptr()).next;
                drop(Arc::from_raw(cursor));
                cursor = next;
            }
        }
    }
}

// A bucket's raw pointers are strong counts that have not been turned back
// into `Arc`s yet, and `Timeout` is Send + Sync. Buckets move to the worker
// thread once at spawn and are never shared after that.
unsafe impl Send for Bucket {}

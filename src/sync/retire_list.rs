use super::bucket::Entry;
use crate::common::concurrent::constants::REAP_BATCH_SIZE;

use smallvec::SmallVec;
use std::{marker::PhantomData, ptr::NonNull};

pub(crate) type Detached<K, V> = SmallVec<[NonNull<Entry<K, V>>; REAP_BATCH_SIZE]>;

/// The pending-free list: a FIFO of entries that have been unlinked from their
/// buckets but not freed yet, threaded through each entry's retire link.
///
/// The list owns its entries. Pushing transfers ownership from a bucket to the
/// list; detaching transfers it to the caller.
pub(crate) struct RetireList<K, V> {
    len: usize,
    head: Option<NonNull<Entry<K, V>>>,
    tail: Option<NonNull<Entry<K, V>>>,
    marker: PhantomData<Box<Entry<K, V>>>,
}

// Entries reach the list through raw pointers; the list is always behind the
// table's mutex.
unsafe impl<K: Send, V: Send> Send for RetireList<K, V> {}

impl<K, V> Default for RetireList<K, V> {
    fn default() -> Self {
        Self {
            len: 0,
            head: None,
            tail: None,
            marker: PhantomData,
        }
    }
}

impl<K, V> Drop for RetireList<K, V> {
    fn drop(&mut self) {
        struct DropGuard<'a, K, V>(&'a mut RetireList<K, V>);

        impl<'a, K, V> Drop for DropGuard<'a, K, V> {
            fn drop(&mut self) {
                // Continue the same loop we do below. This only runs when a destructor has
                // panicked. If another one panics this will abort.
                while let Some(entry) = self.0.pop_front() {
                    std::mem::drop(unsafe { Box::from_raw(entry.as_ptr()) });
                }
            }
        }

        while let Some(entry) = self.pop_front() {
            let guard = DropGuard(self);
            std::mem::drop(unsafe { Box::from_raw(entry.as_ptr()) });
            std::mem::forget(guard);
        }
    }
}

impl<K, V> RetireList<K, V> {
    pub(crate) fn len(&self) -> usize {
        self.len
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Appends an entry that has been unlinked from its bucket.
    ///
    /// # Safety
    ///
    /// `entry` must come from `Box::into_raw`, must not be reachable from any
    /// bucket, and must not already be on a retire list.
    pub(crate) unsafe fn push_back(&mut self, entry: NonNull<Entry<K, V>>) {
        entry.as_ref().set_retire_next(None);
        match self.tail {
            None => self.head = Some(entry),
            Some(tail) => tail.as_ref().set_retire_next(Some(entry)),
        }
        self.tail = Some(entry);
        self.len += 1;
    }

    /// Puts an entry back at the front of the list.
    ///
    /// # Safety
    ///
    /// Same as `push_back`.
    pub(crate) unsafe fn push_front(&mut self, entry: NonNull<Entry<K, V>>) {
        entry.as_ref().set_retire_next(self.head);
        if self.tail.is_none() {
            self.tail = Some(entry);
        }
        self.head = Some(entry);
        self.len += 1;
    }

    /// Removes and returns the entry at the front of the list.
    pub(crate) fn pop_front(&mut self) -> Option<NonNull<Entry<K, V>>> {
        self.head.map(|entry| unsafe {
            self.head = entry.as_ref().retire_next();
            if self.head.is_none() {
                self.tail = None;
            }
            entry.as_ref().set_retire_next(None);
            self.len -= 1;
            entry
        })
    }

    /// Detaches, in FIFO order, up to `limit` entries for which `pred` returns
    /// true.
    pub(crate) fn detach_if(
        &mut self,
        limit: usize,
        mut pred: impl FnMut(&Entry<K, V>) -> bool,
    ) -> Detached<K, V> {
        let mut detached = Detached::new();
        let mut prev: Option<NonNull<Entry<K, V>>> = None;
        let mut cursor = self.head;

        while let Some(entry) = cursor {
            if detached.len() >= limit {
                break;
            }
            // Safety: entries on the list are owned by the list.
            let entry_ref = unsafe { entry.as_ref() };
            cursor = entry_ref.retire_next();

            if !pred(entry_ref) {
                prev = Some(entry);
                continue;
            }

            match prev {
                None => self.head = cursor,
                Some(p) => unsafe { p.as_ref() }.set_retire_next(cursor),
            }
            if cursor.is_none() {
                self.tail = prev;
            }
            entry_ref.set_retire_next(None);
            self.len -= 1;
            detached.push(entry);
        }

        detached
    }
}

use crossbeam_utils::CachePadded;
use parking_lot::{Mutex, MutexGuard};
use std::{
    marker::PhantomData,
    ptr::{self, NonNull},
    sync::atomic::{AtomicPtr, AtomicU64, Ordering},
};

/// How the buckets of a table are guarded against concurrent mutation.
///
/// Lookups never take these locks; only inserts and deletes do.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LockingMode {
    /// One mutex guards all buckets. Cheapest to set up, but inserts and
    /// deletes on different buckets contend with each other.
    #[default]
    Single,
    /// Each bucket has its own mutex.
    PerBucket,
}

pub(crate) enum BucketLocks {
    Single(Mutex<()>),
    PerBucket(Box<[CachePadded<Mutex<()>>]>),
}

impl BucketLocks {
    pub(crate) fn mode(&self) -> LockingMode {
        match self {
            Self::Single(_) => LockingMode::Single,
            Self::PerBucket(_) => LockingMode::PerBucket,
        }
    }

    pub(crate) fn lock(&self, index: usize) -> MutexGuard<'_, ()> {
        match self {
            Self::Single(lock) => lock.lock(),
            Self::PerBucket(locks) => locks[index].lock(),
        }
    }
}

/// The epoch a deleted entry was stamped with.
///
/// Allocated either with the entry or when the entry is deleted, depending on
/// the `defer_u64_alloc` flag of the table.
#[derive(Default)]
pub(crate) struct EpochStamp {
    delete_epoch: AtomicU64,
}

impl EpochStamp {
    pub(crate) fn delete_epoch(&self) -> u64 {
        self.delete_epoch.load(Ordering::Acquire)
    }

    pub(crate) fn set_delete_epoch(&self, epoch: u64) {
        self.delete_epoch.store(epoch, Ordering::Release);
    }
}

pub(crate) struct Entry<K, V> {
    pub(crate) key: K,
    pub(crate) value: V,
    /// Next entry in the bucket. Written under the bucket lock, read without it.
    next: AtomicPtr<Entry<K, V>>,
    /// Next entry on the pending-free list. Only touched under the list mutex.
    retire_next: AtomicPtr<Entry<K, V>>,
    stamp: AtomicPtr<EpochStamp>,
}

impl<K, V> Entry<K, V> {
    pub(crate) fn new(key: K, value: V, stamp: Option<Box<EpochStamp>>) -> Self {
        Self {
            key,
            value,
            next: AtomicPtr::new(ptr::null_mut()),
            retire_next: AtomicPtr::new(ptr::null_mut()),
            stamp: AtomicPtr::new(stamp.map_or(ptr::null_mut(), Box::into_raw)),
        }
    }

    pub(crate) fn has_stamp(&self) -> bool {
        !self.stamp.load(Ordering::Acquire).is_null()
    }

    /// Installs a stamp allocated at delete time. Called under the bucket lock
    /// on an entry that has none.
    pub(crate) fn install_stamp(&self, stamp: Box<EpochStamp>) {
        let prev = self.stamp.swap(Box::into_raw(stamp), Ordering::AcqRel);
        debug_assert!(prev.is_null());
    }

    pub(crate) fn stamp(&self) -> Option<&EpochStamp> {
        // Safety: the stamp lives until `take_stamp` is called by the owner of
        // the entry.
        unsafe { self.stamp.load(Ordering::Acquire).as_ref() }
    }

    /// Returns the stamp's epoch, or `None` if the entry has never been stamped.
    pub(crate) fn delete_epoch(&self) -> Option<u64> {
        self.stamp().map(EpochStamp::delete_epoch)
    }

    /// Whether no reader can still be holding this entry. An entry that was
    /// never stamped is never reclaimable.
    pub(crate) fn is_reclaimable(&self, safe_epoch: u64) -> bool {
        self.delete_epoch().map_or(false, |epoch| epoch <= safe_epoch)
    }

    /// Takes the stamp out so it can be freed by the table allocator.
    pub(crate) fn take_stamp(&mut self) -> Option<Box<EpochStamp>> {
        let raw = std::mem::replace(self.stamp.get_mut(), ptr::null_mut());
        // Safety: the pointer came from `Box::into_raw` and is not shared.
        (!raw.is_null()).then(|| unsafe { Box::from_raw(raw) })
    }

    pub(crate) fn retire_next(&self) -> Option<NonNull<Entry<K, V>>> {
        NonNull::new(self.retire_next.load(Ordering::Relaxed))
    }

    pub(crate) fn set_retire_next(&self, next: Option<NonNull<Entry<K, V>>>) {
        self.retire_next.store(
            next.map_or(ptr::null_mut(), NonNull::as_ptr),
            Ordering::Relaxed,
        );
    }
}

impl<K, V> Drop for Entry<K, V> {
    fn drop(&mut self) {
        // Stamps are normally given back through the allocator before the
        // entry is dropped; this only runs on unwinding paths.
        std::mem::drop(self.take_stamp());
    }
}

/// A singly linked list that can be walked while it is being modified.
///
/// Mutations (`push_back`, `unlink`) require the caller to hold the bucket's
/// lock. An unlinked entry keeps its `next` pointer, so a reader standing on it
/// can still move forward.
pub(crate) struct Bucket<K, V> {
    head: AtomicPtr<Entry<K, V>>,
    _marker: PhantomData<Box<Entry<K, V>>>,
}

impl<K, V> Default for Bucket<K, V> {
    fn default() -> Self {
        Self {
            head: AtomicPtr::new(ptr::null_mut()),
            _marker: PhantomData,
        }
    }
}

impl<K, V> Bucket<K, V> {
    pub(crate) fn iter(&self) -> BucketIter<'_, K, V> {
        BucketIter {
            next: self.head.load(Ordering::Acquire),
            _marker: PhantomData,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_empty(&self) -> bool {
        self.head.load(Ordering::Acquire).is_null()
    }

    /// Publishes `entry` at the tail of this bucket.
    ///
    /// # Safety
    ///
    /// The caller must hold this bucket's lock, and `entry` must be a fresh
    /// entry not linked anywhere.
    pub(crate) unsafe fn push_back(&self, entry: NonNull<Entry<K, V>>) {
        let mut link = &self.head;
        loop {
            let next = link.load(Ordering::Acquire);
            if next.is_null() {
                break;
            }
            link = &(*next).next;
        }
        // Release: a reader that loads this pointer sees a fully built entry.
        link.store(entry.as_ptr(), Ordering::Release);
    }

    /// Unlinks the first entry for which `pred` returns true.
    ///
    /// # Safety
    ///
    /// The caller must hold this bucket's lock.
    pub(crate) unsafe fn unlink_first(
        &self,
        mut pred: impl FnMut(&Entry<K, V>) -> bool,
    ) -> Option<NonNull<Entry<K, V>>> {
        let mut link = &self.head;
        loop {
            let current = NonNull::new(link.load(Ordering::Acquire))?;
            let entry = current.as_ref();
            if pred(entry) {
                link.store(entry.next.load(Ordering::Acquire), Ordering::SeqCst);
                return Some(current);
            }
            link = &entry.next;
        }
    }

    /// Unlinks `target` if it is linked in this bucket.
    ///
    /// # Safety
    ///
    /// The caller must hold this bucket's lock.
    pub(crate) unsafe fn unlink(&self, target: NonNull<Entry<K, V>>) -> bool {
        self.unlink_first(|entry| ptr::eq(entry, target.as_ptr()))
            .is_some()
    }

    /// Detaches every entry. Requires exclusive access to the table.
    pub(crate) fn take_all(&mut self) -> Vec<Box<Entry<K, V>>> {
        let mut entries = Vec::new();
        let mut next = std::mem::replace(self.head.get_mut(), ptr::null_mut());
        while !next.is_null() {
            // Safety: linked entries are owned by the bucket and were created
            // by `Box::into_raw`.
            let mut entry = unsafe { Box::from_raw(next) };
            next = std::mem::replace(entry.next.get_mut(), ptr::null_mut());
            entries.push(entry);
        }
        entries
    }
}

pub(crate) struct BucketIter<'a, K, V> {
    next: *const Entry<K, V>,
    _marker: PhantomData<&'a Entry<K, V>>,
}

impl<'a, K, V> Iterator for BucketIter<'a, K, V> {
    type Item = &'a Entry<K, V>;

    fn next(&mut self) -> Option<Self::Item> {
        // Safety: the caller holds a read section, so neither this entry nor
        // any entry reachable from it is freed while the iterator is in use.
        let entry = unsafe { self.next.as_ref() }?;
        self.next = entry.next.load(Ordering::Acquire);
        Some(entry)
    }
}

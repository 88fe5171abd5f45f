use super::{
    bucket::{Bucket, BucketLocks, Entry, EpochStamp, LockingMode},
    reaper::InnerReap,
    retire_list::{Detached, RetireList},
    TableStats,
};
use crate::{
    common::{
        alloc::{AllocPolicy, Allocator, MemoryPool},
        concurrent::constants::{MAX_DRAIN_ATTEMPTS, REAP_BATCH_SIZE},
        epoch::{Epochs, ReadSection},
        error::Error,
    },
    reclaim::{FreeRetry, Reclaim},
};

use crossbeam_utils::CachePadded;
use parking_lot::Mutex;
use std::{
    borrow::Borrow,
    hash::{BuildHasher, Hash, Hasher},
    ptr::NonNull,
    sync::{
        atomic::{AtomicU64, AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

pub(crate) struct TableConfig {
    pub(crate) name: Option<String>,
    pub(crate) bucket_count: usize,
    pub(crate) locking_mode: LockingMode,
    pub(crate) alloc_policy: AllocPolicy,
    pub(crate) defer_stamp_alloc: bool,
    pub(crate) reap_interval: Duration,
    pub(crate) memory_pool: Arc<dyn MemoryPool>,
    pub(crate) key_size_hint: usize,
}

pub(crate) struct Inner<K, V, S, R: Reclaim<K, V>> {
    name: Option<String>,
    buckets: Box<[Bucket<K, V>]>,
    locks: BucketLocks,
    epochs: Epochs,
    pending: Mutex<RetireList<K, V>>,
    entry_count: CachePadded<AtomicUsize>,
    pending_delete_count: AtomicUsize,
    reclaimed_count: AtomicU64,
    reclaim_retry_count: AtomicU64,
    build_hasher: S,
    reclaimer: R,
    allocator: Allocator,
    defer_stamp_alloc: bool,
    key_size_hint: usize,
    reap_interval: Duration,
}

// Readers on any thread get shared references to keys and values, and the
// reaper drops them on its own thread.
unsafe impl<K, V, S, R> Send for Inner<K, V, S, R>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Send,
    R: Reclaim<K, V>,
{
}

unsafe impl<K, V, S, R> Sync for Inner<K, V, S, R>
where
    K: Send + Sync,
    V: Send + Sync,
    S: Sync,
    R: Reclaim<K, V>,
{
}

impl<K, V, S, R: Reclaim<K, V>> Inner<K, V, S, R> {
    pub(crate) fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    pub(crate) fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn locking_mode(&self) -> LockingMode {
        self.locks.mode()
    }

    pub(crate) fn alloc_policy(&self) -> AllocPolicy {
        self.allocator.policy()
    }

    pub(crate) fn defers_stamp_alloc(&self) -> bool {
        self.defer_stamp_alloc
    }

    pub(crate) fn reap_interval(&self) -> Duration {
        self.reap_interval
    }

    pub(crate) fn entry_count(&self) -> usize {
        self.entry_count.load(Ordering::Acquire)
    }

    pub(crate) fn pending_delete_count(&self) -> usize {
        self.pending_delete_count.load(Ordering::Acquire)
    }

    pub(crate) fn stats(&self) -> TableStats {
        TableStats {
            entry_count: self.entry_count(),
            pending_delete_count: self.pending_delete_count(),
            start_epoch: self.epochs.start(),
            end_epoch: self.epochs.end(),
            active_readers: self.epochs.active_readers(),
            reclaimed_count: self.reclaimed_count.load(Ordering::Acquire),
            reclaim_retry_count: self.reclaim_retry_count.load(Ordering::Acquire),
        }
    }

    fn bucket_index(&self, hash: u64) -> usize {
        (hash % self.buckets.len() as u64) as usize
    }

    fn free_entry(&self, mut entry: Box<Entry<K, V>>) {
        if let Some(stamp) = entry.take_stamp() {
            self.allocator.free_box(stamp, 0);
        }
        self.allocator.free_box(entry, self.key_size_hint);
    }

    /// Allocates the stamp a delete will need, before the bucket lock is taken.
    fn stamp_for_delete(&self) -> Result<Option<Box<EpochStamp>>, Error> {
        if self.defer_stamp_alloc {
            self.allocator.alloc_box(EpochStamp::default(), 0).map(Some)
        } else {
            Ok(None)
        }
    }

    /// Moves an entry that was just unlinked onto the pending-free list.
    ///
    /// # Safety
    ///
    /// Must be called with the lock of the bucket `entry` was unlinked from.
    unsafe fn retire(&self, entry: NonNull<Entry<K, V>>, stamp: Option<Box<EpochStamp>>) {
        self.entry_count.fetch_sub(1, Ordering::AcqRel);

        let entry_ref = entry.as_ref();
        if let Some(stamp) = stamp {
            entry_ref.install_stamp(stamp);
        }
        let delete_epoch = self.epochs.stamp();
        debug_assert!(entry_ref.has_stamp());
        if let Some(stamp) = entry_ref.stamp() {
            stamp.set_delete_epoch(delete_epoch);
        }

        self.pending.lock().push_back(entry);
        self.pending_delete_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Hands an entry to the reclaimer. Gives it back if the reclaimer asked for
    /// a retry.
    fn try_reclaim(&self, mut entry: Box<Entry<K, V>>) -> Result<(), Box<Entry<K, V>>> {
        use std::panic::{catch_unwind, AssertUnwindSafe};

        let result = {
            let entry = &mut *entry;
            let (key, value) = (&entry.key, &mut entry.value);
            // Safety: It is safe to assert unwind safety here because a panicked
            // entry is dropped and never handed to the reclaimer again.
            catch_unwind(AssertUnwindSafe(|| self.reclaimer.reclaim(key, value)))
        };

        match result {
            Ok(Ok(())) => {}
            Ok(Err(FreeRetry)) => {
                self.reclaim_retry_count.fetch_add(1, Ordering::AcqRel);
                #[cfg(feature = "logging")]
                log::debug!(
                    "{}The reclaimer asked to retry an entry",
                    log_prefix(self.name())
                );
                return Err(entry);
            }
            Err(_payload) => {
                #[cfg(feature = "logging")]
                log_panic(&*_payload, self.name());
            }
        }

        self.free_entry(entry);
        self.reclaimed_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    /// Frees every entry the table still owns, live or pending, without waiting
    /// for readers. Requires exclusive access.
    ///
    /// Entries whose reclaimer keeps asking for a retry are given up to
    /// `MAX_DRAIN_ATTEMPTS` rounds, then dropped.
    pub(crate) fn drain(&mut self) {
        let mut entries;
        {
            let pending = self.pending.get_mut();
            entries = Vec::with_capacity(pending.len());
            while let Some(entry) = pending.pop_front() {
                // Safety: the list owned the entry.
                entries.push(unsafe { Box::from_raw(entry.as_ptr()) });
            }
            debug_assert!(pending.is_empty());
        }
        *self.pending_delete_count.get_mut() = 0;

        for bucket in self.buckets.iter_mut() {
            entries.extend(bucket.take_all());
        }
        *self.entry_count.get_mut() = 0;

        for _ in 0..MAX_DRAIN_ATTEMPTS {
            if entries.is_empty() {
                return;
            }
            entries = entries
                .into_iter()
                .filter_map(|entry| self.try_reclaim(entry).err())
                .collect();
        }

        #[cfg(feature = "logging")]
        if !entries.is_empty() {
            log::warn!(
                "{}Dropping {} entries the reclaimer failed to free after {} attempts",
                log_prefix(self.name()),
                entries.len(),
                MAX_DRAIN_ATTEMPTS
            );
        }

        for entry in entries {
            self.free_entry(entry);
        }
    }
}

impl<K, V, S, R> Inner<K, V, S, R>
where
    K: Hash + Eq,
    S: BuildHasher,
    R: Reclaim<K, V>,
{
    pub(crate) fn new(config: TableConfig, build_hasher: S, reclaimer: R) -> Result<Self, Error> {
        let TableConfig {
            name,
            bucket_count,
            locking_mode,
            alloc_policy,
            defer_stamp_alloc,
            reap_interval,
            memory_pool,
            key_size_hint,
        } = config;

        let allocator = Allocator::new(memory_pool, alloc_policy);
        let buckets = allocator.alloc_slice_with(bucket_count, |_| Bucket::default())?;

        let locks = match locking_mode {
            LockingMode::Single => allocator
                .charge(std::mem::size_of::<Mutex<()>>())
                .map(|_| BucketLocks::Single(Mutex::new(()))),
            LockingMode::PerBucket => allocator
                .alloc_slice_with(bucket_count, |_| CachePadded::new(Mutex::new(())))
                .map(BucketLocks::PerBucket),
        };
        let locks = match locks {
            Ok(locks) => locks,
            Err(e) => {
                allocator.uncharge(Allocator::slice_charge::<Bucket<K, V>>(bucket_count));
                return Err(e);
            }
        };

        Ok(Self {
            name,
            buckets,
            locks,
            epochs: Epochs::default(),
            pending: Mutex::new(RetireList::default()),
            entry_count: CachePadded::new(AtomicUsize::default()),
            pending_delete_count: AtomicUsize::default(),
            reclaimed_count: AtomicU64::default(),
            reclaim_retry_count: AtomicU64::default(),
            build_hasher,
            reclaimer,
            allocator,
            defer_stamp_alloc,
            key_size_hint,
            reap_interval,
        })
    }

    #[inline]
    pub(crate) fn hash<Q>(&self, key: &Q) -> u64
    where
        Q: Hash + ?Sized,
    {
        let mut hasher = self.build_hasher.build_hasher();
        key.hash(&mut hasher);
        hasher.finish()
    }

    pub(crate) fn insert(&self, key: K, value: V) -> Result<(), Error> {
        let hash = self.hash(&key);
        let entry = self
            .allocator
            .alloc_box(Entry::new(key, value, None), self.key_size_hint)?;

        if !self.defer_stamp_alloc {
            match self.allocator.alloc_box(EpochStamp::default(), 0) {
                Ok(stamp) => entry.install_stamp(stamp),
                Err(e) => {
                    self.free_entry(entry);
                    return Err(e);
                }
            }
        }

        let index = self.bucket_index(hash);
        let entry = NonNull::from(Box::leak(entry));

        let _guard = self.locks.lock(index);
        // Safety: we hold the bucket lock and the entry is fresh.
        unsafe { self.buckets[index].push_back(entry) };
        self.entry_count.fetch_add(1, Ordering::AcqRel);
        Ok(())
    }

    pub(crate) fn lookup<Q>(&self, key: &Q) -> Option<(ReadSection<'_>, &Entry<K, V>)>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = self.bucket_index(self.hash(key));
        let section = self.epochs.pin();
        // If nothing matches, `section` is dropped here, which releases the
        // reader.
        let entry = self.buckets[index]
            .iter()
            .find(|entry| entry.key.borrow() == key)?;
        Some((section, entry))
    }

    /// Deletes the given entry. The caller must be holding a read section that
    /// returned `target`.
    pub(crate) fn delete_entry(&self, target: &Entry<K, V>) -> Result<(), Error> {
        let index = self.bucket_index(self.hash(&target.key));
        let target = NonNull::from(target);
        let stamp = self.stamp_for_delete()?;

        let guard = self.locks.lock(index);
        // Safety: we hold the bucket lock.
        if unsafe { self.buckets[index].unlink(target) } {
            unsafe { self.retire(target, stamp) };
            Ok(())
        } else {
            std::mem::drop(guard);
            if let Some(stamp) = stamp {
                self.allocator.free_box(stamp, 0);
            }
            Err(Error::NotFound)
        }
    }

    pub(crate) fn remove<Q>(&self, key: &Q) -> Result<(), Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        let index = self.bucket_index(self.hash(key));
        let stamp = self.stamp_for_delete()?;

        let guard = self.locks.lock(index);
        // Safety: we hold the bucket lock.
        match unsafe { self.buckets[index].unlink_first(|entry| entry.key.borrow() == key) } {
            Some(entry) => {
                unsafe { self.retire(entry, stamp) };
                Ok(())
            }
            None => {
                std::mem::drop(guard);
                if let Some(stamp) = stamp {
                    self.allocator.free_box(stamp, 0);
                }
                Err(Error::NotFound)
            }
        }
    }
}

impl<K, V, S, R> InnerReap for Inner<K, V, S, R>
where
    R: Reclaim<K, V>,
{
    fn reap(&self) {
        let safe_epoch = self.epochs.safe_epoch();
        let mut retries = Detached::new();
        let mut _reclaimed = 0usize;

        // The list mutex is only held while a batch is detached. Retried
        // entries are kept aside until the end so a sweep visits each entry
        // once.
        loop {
            let detached = self
                .pending
                .lock()
                .detach_if(REAP_BATCH_SIZE, |entry| entry.is_reclaimable(safe_epoch));
            let batch_len = detached.len();

            for entry in detached {
                // Safety: detached entries are owned by us.
                let entry = unsafe { Box::from_raw(entry.as_ptr()) };
                match self.try_reclaim(entry) {
                    Ok(()) => {
                        self.pending_delete_count.fetch_sub(1, Ordering::AcqRel);
                        _reclaimed += 1;
                    }
                    Err(entry) => retries.push(NonNull::from(Box::leak(entry))),
                }
            }

            if batch_len < REAP_BATCH_SIZE {
                break;
            }
        }

        if !retries.is_empty() {
            // Back at the front, ahead of anything deleted during the sweep.
            let mut pending = self.pending.lock();
            for entry in retries.into_iter().rev() {
                // Safety: the entry was detached from this list above.
                unsafe { pending.push_front(entry) };
            }
        }

        #[cfg(feature = "logging")]
        log::trace!(
            "{}Reaper freed {} entries (safe epoch: {})",
            log_prefix(self.name()),
            _reclaimed,
            safe_epoch
        );
    }
}

impl<K, V, S, R: Reclaim<K, V>> Drop for Inner<K, V, S, R> {
    fn drop(&mut self) {
        self.drain();

        let bucket_count = self.buckets.len();
        self.allocator
            .uncharge(Allocator::slice_charge::<Bucket<K, V>>(bucket_count));
        let lock_bytes = match self.locks {
            BucketLocks::Single(_) => std::mem::size_of::<Mutex<()>>(),
            BucketLocks::PerBucket(_) => {
                Allocator::slice_charge::<CachePadded<Mutex<()>>>(bucket_count)
            }
        };
        self.allocator.uncharge(lock_bytes);
    }
}

#[cfg(feature = "logging")]
fn log_prefix(table_name: Option<&str>) -> String {
    table_name
        .map(|name| format!("[{name}] "))
        .unwrap_or_default()
}

#[cfg(feature = "logging")]
fn log_panic(payload: &(dyn std::any::Any + Send + 'static), table_name: Option<&str>) {
    // Try to downcast the payload into &str or String.
    let message: Option<std::borrow::Cow<'_, str>> =
        (payload.downcast_ref::<&str>().map(|s| (*s).into()))
            .or_else(|| payload.downcast_ref::<String>().map(Into::into));

    let prefix = log_prefix(table_name);

    if let Some(m) = message {
        log::error!("{prefix}The reclaimer panicked at '{m}'; the entry was dropped");
    } else {
        log::error!("{prefix}The reclaimer panicked; the entry was dropped");
    }
}

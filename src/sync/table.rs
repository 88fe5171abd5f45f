use super::{
    base_table::{Inner, TableConfig},
    reaper::{InnerReap, Reaper},
    EntryRef, LockingMode, TableBuilder, TableStats,
};
use crate::{
    common::{
        alloc::AllocPolicy,
        error::{DestroyError, Error},
    },
    reclaim::{DropReclaimer, Reclaim},
};

use std::{
    borrow::Borrow,
    collections::hash_map::RandomState,
    fmt,
    hash::{BuildHasher, Hash},
    sync::Arc,
    time::Duration,
};

/// A thread-safe hash table whose lookups never take a lock.
///
/// `LloTable` ("lock-less-often") guards mutations with either one mutex for
/// the whole table or one mutex per bucket, while lookups walk the bucket
/// lists without locking. Deleted entries are not freed right away: they are
/// moved to a pending-free list and handed to the table's
/// [`Reclaim`][reclaim-trait]er by a periodic reaper once no lookup that could
/// have observed them is still in flight.
///
/// The table does not check for duplicate keys. Inserting a key twice stores
/// two entries, and lookups and removals find the one inserted first. Use
/// [`contains_key`](#method.contains_key) first if you need unique keys.
///
/// # Examples
///
/// ```rust
/// use llohash::sync::LloTable;
/// use std::{sync::Arc, thread};
///
/// let table = Arc::new(LloTable::new(64).unwrap());
///
/// let handles = (0..4u32)
///     .map(|i| {
///         let table = Arc::clone(&table);
///         thread::spawn(move || {
///             table.insert(i, format!("value {i}")).unwrap();
///             let entry = table.lookup(&i).unwrap();
///             assert_eq!(entry.value(), &format!("value {i}"));
///         })
///     })
///     .collect::<Vec<_>>();
///
/// handles.into_iter().for_each(|h| h.join().unwrap());
/// assert_eq!(table.entry_count(), 4);
/// ```
///
/// # Reading and deleting entries
///
/// [`lookup`](#method.lookup) returns an [`EntryRef`][entry-ref] borrowing
/// the entry. It stays valid until it is released, even if another thread
/// deletes the entry in the meantime. [`get`](#method.get) clones the value
/// and releases the entry immediately.
///
/// [`delete`](#method.delete) removes the exact entry an `EntryRef` points
/// to, and [`remove`](#method.remove) the first entry with a given key.
///
/// # Destroying a table
///
/// A table can be dropped at any time, which runs every entry it still owns
/// through the reclaimer. [`destroy`](#method.destroy) does the same but
/// refuses to do it while live entries remain, and gives the table back.
///
/// [reclaim-trait]: ../trait.Reclaim.html
/// [entry-ref]: ./struct.EntryRef.html
pub struct LloTable<K, V, S = RandomState, R = DropReclaimer>
where
    R: Reclaim<K, V>,
{
    inner: Arc<Inner<K, V, S, R>>,
    reaper: Option<Reaper>,
}

impl<K, V, S, R> Drop for LloTable<K, V, S, R>
where
    R: Reclaim<K, V>,
{
    fn drop(&mut self) {
        // Stop the reaper before `inner` goes away, so the last reference to
        // it is ours.
        std::mem::drop(self.reaper.take());
    }
}

impl<K, V, S, R> fmt::Debug for LloTable<K, V, S, R>
where
    R: Reclaim<K, V>,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LloTable")
            .field("name", &self.name())
            .field("bucket_count", &self.bucket_count())
            .field("locking_mode", &self.locking_mode())
            .field("stats", &self.stats())
            .finish()
    }
}

impl<K, V> LloTable<K, V, RandomState, DropReclaimer>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Constructs a new `LloTable<K, V>` with `bucket_count` buckets, a
    /// single table-wide mutex and a blocking allocation policy. Deleted
    /// entries are simply dropped once they are safe to free.
    ///
    /// To choose the locking mode, the reclaimer or other knobs, use the
    /// [`TableBuilder`][builder-struct].
    ///
    /// [builder-struct]: ./struct.TableBuilder.html
    ///
    /// # Panics
    ///
    /// Panics if `bucket_count` is zero.
    pub fn new(bucket_count: usize) -> Result<Self, Error> {
        Self::builder(bucket_count).build()
    }

    /// Returns a [`TableBuilder`][builder-struct], which can build a
    /// `LloTable` with various configuration knobs.
    ///
    /// [builder-struct]: ./struct.TableBuilder.html
    pub fn builder(bucket_count: usize) -> TableBuilder<K, V> {
        TableBuilder::new(bucket_count)
    }
}

impl<K, V, S, R> LloTable<K, V, S, R>
where
    R: Reclaim<K, V>,
{
    /// Returns the table's name.
    pub fn name(&self) -> Option<&str> {
        self.inner.name()
    }

    pub fn bucket_count(&self) -> usize {
        self.inner.bucket_count()
    }

    pub fn locking_mode(&self) -> LockingMode {
        self.inner.locking_mode()
    }

    pub fn alloc_policy(&self) -> AllocPolicy {
        self.inner.alloc_policy()
    }

    /// Returns `true` if epoch stamps are allocated on delete rather than on
    /// insert.
    pub fn defers_u64_alloc(&self) -> bool {
        self.inner.defers_stamp_alloc()
    }

    pub fn reap_interval(&self) -> Duration {
        self.inner.reap_interval()
    }

    /// Returns the number of entries currently linked in the table.
    ///
    /// Deleted entries waiting for the reaper are not counted; see
    /// [`pending_delete_count`](#method.pending_delete_count).
    pub fn entry_count(&self) -> usize {
        self.inner.entry_count()
    }

    /// Returns the number of deleted entries that have not been freed yet.
    pub fn pending_delete_count(&self) -> usize {
        self.inner.pending_delete_count()
    }

    /// Returns a snapshot of the table's counters.
    pub fn stats(&self) -> TableStats {
        self.inner.stats()
    }

    /// Runs one reaper sweep on the calling thread: frees every pending entry
    /// that no in-flight lookup can observe anymore.
    ///
    /// The periodic reaper does the same on a background thread, so calling
    /// this is never required.
    pub fn run_pending_tasks(&self) {
        self.inner.reap();
    }

    /// Destroys the table.
    ///
    /// Fails if entries are still linked in the table, giving the table back
    /// untouched in the returned [`DestroyError`][destroy-error]. Otherwise
    /// stops the reaper and hands every pending entry to the reclaimer,
    /// without waiting for the next sweep.
    ///
    /// [destroy-error]: ../struct.DestroyError.html
    ///
    /// # Examples
    ///
    /// ```rust
    /// use llohash::sync::LloTable;
    ///
    /// let table = LloTable::new(8).unwrap();
    /// table.insert("a", 1).unwrap();
    ///
    /// let err = table.destroy().unwrap_err();
    /// assert_eq!(err.live_entries(), 1);
    ///
    /// let table = err.into_inner();
    /// table.remove(&"a").unwrap();
    /// assert!(table.destroy().is_ok());
    /// ```
    pub fn destroy(self) -> Result<(), DestroyError<Self>> {
        let live_entries = self.entry_count();
        if live_entries != 0 {
            return Err(DestroyError::new(self, live_entries));
        }
        std::mem::drop(self);
        Ok(())
    }
}

impl<K, V, S, R> LloTable<K, V, S, R>
where
    K: Hash + Eq + Send + Sync + 'static,
    V: Send + Sync + 'static,
    S: BuildHasher + Send + Sync + 'static,
    R: Reclaim<K, V>,
{
    pub(crate) fn with_everything(
        config: TableConfig,
        build_hasher: S,
        reclaimer: R,
    ) -> Result<Self, Error> {
        let inner = Arc::new(Inner::new(config, build_hasher, reclaimer)?);
        let reaper = Reaper::new(Arc::downgrade(&inner), inner.reap_interval());
        Ok(Self {
            inner,
            reaper: Some(reaper),
        })
    }

    /// Inserts a key-value pair into the table.
    ///
    /// The entry is visible to lookups on all threads as soon as this returns.
    /// An existing entry with the same key is not replaced.
    ///
    /// # Errors
    ///
    /// Returns `Error::OutOfMemory` if the table was built with the `nowait`
    /// flag and its memory pool cannot hold the new entry. Under the blocking
    /// policy, waits for memory instead.
    pub fn insert(&self, key: K, value: V) -> Result<(), Error> {
        self.inner.insert(key, value)
    }

    /// Looks up the first entry inserted with `key`.
    ///
    /// The key may be any borrowed form of the table's key type, but `Hash`
    /// and `Eq` on the borrowed form _must_ match those for the key type.
    ///
    /// Never blocks. The returned [`EntryRef`][entry-ref] keeps the entry
    /// alive until it is released.
    ///
    /// [entry-ref]: ./struct.EntryRef.html
    pub fn lookup<Q>(&self, key: &Q) -> Option<EntryRef<'_, K, V>>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner
            .lookup(key)
            .map(|(section, entry)| EntryRef::new(section, entry))
    }

    /// Releases an entry returned by [`lookup`](#method.lookup). Same as
    /// dropping it.
    pub fn release(&self, entry: EntryRef<'_, K, V>) {
        std::mem::drop(entry);
    }

    /// Deletes the entry `entry` points to.
    ///
    /// The entry stays readable through `entry`, and through any other
    /// `EntryRef` to it, until those are released.
    ///
    /// # Errors
    ///
    /// - `Error::NotFound` if the entry was already deleted, or was looked up
    ///   in another table.
    /// - `Error::OutOfMemory` if the table defers the epoch stamp allocation
    ///   to deletes, was built with `nowait`, and its memory pool is full. The
    ///   entry stays in the table.
    pub fn delete(&self, entry: &EntryRef<'_, K, V>) -> Result<(), Error> {
        self.inner.delete_entry(entry.entry())
    }

    /// Deletes the first entry inserted with `key`.
    ///
    /// # Errors
    ///
    /// Same as [`delete`](#method.delete).
    pub fn remove<Q>(&self, key: &Q) -> Result<(), Error>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.inner.remove(key)
    }

    /// Returns `true` if the table holds an entry for `key`.
    pub fn contains_key<Q>(&self, key: &Q) -> bool
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.lookup(key).is_some()
    }

    /// Returns a clone of the value of the first entry inserted with `key`.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
        V: Clone,
    {
        self.lookup(key).map(|entry| entry.value().clone())
    }
}

#[cfg(test)]
mod tests {
    use super::LloTable;
    use crate::{
        common::{
            alloc::BoundedPool,
            concurrent::constants::REAP_BATCH_SIZE,
            test_utils::{Counters, CountingReclaimer, Value},
        },
        reclaim::FreeRetry,
        sync::{bucket::Entry, LockingMode},
        Error,
    };

    use parking_lot::Mutex;
    use std::{
        sync::{
            atomic::{AtomicBool, Ordering},
            mpsc, Arc,
        },
        thread,
        time::Duration,
    };

    const LOCKING_MODES: [LockingMode; 2] = [LockingMode::Single, LockingMode::PerBucket];

    fn counting_table(
        mode: LockingMode,
        defer: bool,
        counters: &Arc<Counters>,
    ) -> LloTable<u32, Value, std::collections::hash_map::RandomState, CountingReclaimer> {
        LloTable::builder(8)
            .locking_mode(mode)
            .defer_u64_alloc(defer)
            // Keep the background reaper out of the way; tests sweep by hand.
            .reap_interval(Duration::from_secs(3600))
            .reclaimer(CountingReclaimer::new(counters))
            .build()
            .unwrap()
    }

    #[test]
    fn basic_single_thread() {
        for mode in LOCKING_MODES {
            let table = LloTable::builder(4).locking_mode(mode).build().unwrap();

            table.insert("a", "alice").unwrap();
            table.insert("b", "bob").unwrap();
            assert_eq!(table.get(&"a"), Some("alice"));
            assert_eq!(table.get(&"b"), Some("bob"));
            assert_eq!(table.get(&"c"), None);
            assert!(table.contains_key(&"a"));
            assert_eq!(table.entry_count(), 2);

            let entry = table.lookup(&"a").unwrap();
            assert_eq!(entry.key(), &"a");
            assert_eq!(*entry, "alice");
            table.release(entry);

            table.remove(&"a").unwrap();
            assert_eq!(table.get(&"a"), None);
            assert_eq!(table.entry_count(), 1);
            assert_eq!(table.pending_delete_count(), 1);
        }
    }

    #[test]
    fn duplicate_keys_are_kept_in_insertion_order() {
        // One bucket, so every key collides.
        let table = LloTable::new(1).unwrap();
        table.insert(1, "first").unwrap();
        table.insert(2, "other").unwrap();
        table.insert(1, "second").unwrap();
        assert_eq!(table.entry_count(), 3);

        assert_eq!(table.get(&1), Some("first"));
        table.remove(&1).unwrap();
        assert_eq!(table.get(&1), Some("second"));
        table.remove(&1).unwrap();
        assert_eq!(table.get(&1), None);
        assert_eq!(table.get(&2), Some("other"));
    }

    #[test]
    fn borrowed_keys() {
        let table = LloTable::new(16).unwrap();
        table.insert("alice".to_string(), 1).unwrap();
        assert_eq!(table.get("alice"), Some(1));
        assert!(table.lookup("bob").is_none());
        table.remove("alice").unwrap();
        assert!(!table.contains_key("alice"));
    }

    #[test]
    fn absent_keys_have_no_side_effects() {
        for mode in LOCKING_MODES {
            for defer in [false, true] {
                let counters = Arc::new(Counters::default());
                let table = counting_table(mode, defer, &counters);
                table.insert(1, Value::new(1, &counters)).unwrap();

                assert!(table.lookup(&2).is_none());
                assert_eq!(table.remove(&2), Err(Error::NotFound));
                assert_eq!(table.entry_count(), 1);
                assert_eq!(table.pending_delete_count(), 0);

                // A failed lookup releases its reader right away.
                let stats = table.stats();
                assert_eq!(stats.start_epoch, stats.end_epoch);
                assert_eq!(stats.active_readers, 0);
            }
        }
    }

    #[test]
    fn entry_count_follows_inserts_and_deletes() {
        for mode in LOCKING_MODES {
            let table = LloTable::builder(7)
                .locking_mode(mode)
                .reap_interval(Duration::from_secs(3600))
                .build()
                .unwrap();
            for i in 0..100u32 {
                table.insert(i, i * 10).unwrap();
            }
            for i in (0..100u32).step_by(3) {
                table.remove(&i).unwrap();
            }
            assert_eq!(table.entry_count(), 100 - 34);
            assert_eq!(table.pending_delete_count(), 34);

            table.run_pending_tasks();
            assert_eq!(table.pending_delete_count(), 0);
            assert_eq!(table.entry_count(), 100 - 34);
            for i in 0..100u32 {
                let expected = (i % 3 != 0).then_some(i * 10);
                assert_eq!(table.get(&i), expected);
            }
        }
    }

    #[test]
    fn delete_through_entry_ref() {
        for mode in LOCKING_MODES {
            for defer in [false, true] {
                let counters = Arc::new(Counters::default());
                let table = counting_table(mode, defer, &counters);
                table.insert(1, Value::new(10, &counters)).unwrap();

                let entry = table.lookup(&1).unwrap();
                table.delete(&entry).unwrap();
                assert_eq!(table.delete(&entry), Err(Error::NotFound));
                // Still readable after the delete.
                assert_eq!(entry.value().n, 10);
                entry.release();

                table.run_pending_tasks();
                assert_eq!(counters.reclaimed(), 1);
                assert_eq!(counters.value_dropped(), 1);
            }
        }
    }

    #[test]
    fn delete_with_an_entry_from_another_table() {
        for mode in LOCKING_MODES {
            for defer in [false, true] {
                let counters = Arc::new(Counters::default());
                let pool = Arc::new(BoundedPool::new(usize::MAX));
                let table_a = counting_table(mode, defer, &counters);
                let table_b = LloTable::builder(8)
                    .locking_mode(mode)
                    .defer_u64_alloc(defer)
                    .reap_interval(Duration::from_secs(3600))
                    .memory_pool(Arc::clone(&pool))
                    .reclaimer(CountingReclaimer::new(&counters))
                    .build()
                    .unwrap();
                table_a.insert(1, Value::new(10, &counters)).unwrap();
                table_b.insert(1, Value::new(20, &counters)).unwrap();
                let used = pool.used();

                let entry = table_a.lookup(&1).unwrap();
                assert_eq!(table_b.delete(&entry), Err(Error::NotFound));
                assert_eq!(entry.value().n, 10);
                entry.release();

                assert_eq!(table_a.entry_count(), 1);
                assert_eq!(table_b.entry_count(), 1);
                assert_eq!(table_b.pending_delete_count(), 0);
                assert_eq!(table_b.get_n(&1), Some(20));
                // A deferred stamp taken for the failed delete is given back.
                assert_eq!(pool.used(), used);
                assert_eq!(counters.value_dropped(), 0);
            }
        }
    }

    #[test]
    fn held_entry_is_not_freed() {
        for mode in LOCKING_MODES {
            for defer in [false, true] {
                let counters = Arc::new(Counters::default());
                let table = counting_table(mode, defer, &counters);
                table.insert(1, Value::new(1, &counters)).unwrap();
                table.insert(2, Value::new(2, &counters)).unwrap();

                let entry = table.lookup(&1).unwrap();
                table.remove(&1).unwrap();

                for _ in 0..3 {
                    table.run_pending_tasks();
                }
                assert_eq!(counters.reclaimed(), 0);
                assert_eq!(table.pending_delete_count(), 1);
                assert_eq!(entry.value().n, 1);

                table.release(entry);
                table.run_pending_tasks();
                assert_eq!(counters.reclaimed(), 1);
                assert_eq!(counters.value_dropped(), 1);
                assert_eq!(table.pending_delete_count(), 0);
            }
        }
    }

    #[test]
    fn readers_that_start_after_a_delete_do_not_hold_it() {
        let counters = Arc::new(Counters::default());
        let table = counting_table(LockingMode::Single, false, &counters);
        table.insert(1, Value::new(1, &counters)).unwrap();
        table.insert(2, Value::new(2, &counters)).unwrap();

        table.remove(&1).unwrap();
        let later = table.lookup(&2).unwrap();
        table.run_pending_tasks();
        assert_eq!(counters.reclaimed(), 1);
        assert_eq!(later.value().n, 2);
    }

    #[test]
    fn reclaim_is_retried() {
        let counters = Arc::new(Counters::default());
        let table = LloTable::builder(4)
            .reap_interval(Duration::from_secs(3600))
            .reclaimer(CountingReclaimer::failing(&counters, 2))
            .build()
            .unwrap();

        table.insert(1, Value::new(1, &counters)).unwrap();
        table.remove(&1).unwrap();

        table.run_pending_tasks();
        table.run_pending_tasks();
        assert_eq!(counters.retried(), 2);
        assert_eq!(counters.value_dropped(), 0);
        assert_eq!(table.pending_delete_count(), 1);

        table.run_pending_tasks();
        assert_eq!(counters.reclaimed(), 1);
        assert_eq!(counters.value_dropped(), 1);
        assert_eq!(table.pending_delete_count(), 0);

        let stats = table.stats();
        assert_eq!(stats.reclaimed_count, 1);
        assert_eq!(stats.reclaim_retry_count, 2);
    }

    #[test]
    fn one_sweep_frees_more_than_one_batch() {
        let counters = Arc::new(Counters::default());
        let table = counting_table(LockingMode::Single, false, &counters);
        let count = REAP_BATCH_SIZE as u32 * 3 + 1;
        for i in 0..count {
            table.insert(i, Value::new(i, &counters)).unwrap();
        }
        for i in 0..count {
            table.remove(&i).unwrap();
        }

        table.run_pending_tasks();
        assert_eq!(counters.reclaimed(), count);
        assert_eq!(table.pending_delete_count(), 0);
    }

    #[test]
    fn retried_entries_stay_ahead_of_later_deletes() {
        let freed = Arc::new(Mutex::new(Vec::new()));
        let (reached_tx, reached_rx) = mpsc::channel();
        let (resume_tx, resume_rx) = mpsc::channel::<()>();
        let first_call = Mutex::new(Some((reached_tx, resume_rx)));

        let table = Arc::new(
            LloTable::builder(4)
                .reap_interval(Duration::from_secs(3600))
                .reclaimer({
                    let freed = Arc::clone(&freed);
                    move |key: &u32, _value: &mut u32| {
                        // Ask for a retry on the first call, once the test has
                        // deleted another entry mid-sweep.
                        if let Some((reached, resume)) = first_call.lock().take() {
                            let _ = reached.send(());
                            let _ = resume.recv();
                            return Err(FreeRetry);
                        }
                        freed.lock().push(*key);
                        Ok(())
                    }
                })
                .build()
                .unwrap(),
        );
        table.insert(1u32, 10u32).unwrap();
        table.insert(2, 20).unwrap();
        table.remove(&1).unwrap();

        let sweep = {
            let table = Arc::clone(&table);
            thread::spawn(move || table.run_pending_tasks())
        };
        reached_rx.recv().unwrap();
        table.remove(&2).unwrap();
        resume_tx.send(()).unwrap();
        sweep.join().unwrap();

        assert_eq!(table.pending_delete_count(), 2);
        assert!(freed.lock().is_empty());

        table.run_pending_tasks();
        assert_eq!(*freed.lock(), vec![1, 2]);
        assert_eq!(table.pending_delete_count(), 0);
    }

    #[test]
    fn reclaimer_panic_drops_the_entry() {
        let counters = Arc::new(Counters::default());
        let table = LloTable::<u32, Value>::builder(4)
            .reap_interval(Duration::from_secs(3600))
            .reclaimer(|key: &u32, _value: &mut Value| {
                if *key == 1 {
                    panic!("reclaimer panic for key {key}");
                }
                Ok::<_, FreeRetry>(())
            })
            .build()
            .unwrap();

        table.insert(1, Value::new(1, &counters)).unwrap();
        table.insert(2, Value::new(2, &counters)).unwrap();
        table.remove(&1).unwrap();
        table.remove(&2).unwrap();
        table.run_pending_tasks();

        assert_eq!(table.pending_delete_count(), 0);
        assert_eq!(counters.value_dropped(), 2);
        assert_eq!(table.stats().reclaimed_count, 2);
    }

    #[test]
    fn background_reaper_frees_entries() {
        let counters = Arc::new(Counters::default());
        let table = LloTable::builder(4)
            .reap_interval(Duration::from_millis(20))
            .reclaimer(CountingReclaimer::new(&counters))
            .build()
            .unwrap();

        for i in 0..10 {
            table.insert(i, Value::new(i, &counters)).unwrap();
        }
        for i in 0..10 {
            table.remove(&i).unwrap();
        }

        let mut freed = false;
        for _ in 0..100 {
            if table.pending_delete_count() == 0 {
                freed = true;
                break;
            }
            thread::sleep(Duration::from_millis(20));
        }
        assert!(freed, "the reaper did not free the pending entries");
        assert_eq!(counters.reclaimed(), 10);
    }

    #[test]
    fn destroy_refuses_live_entries() {
        for mode in LOCKING_MODES {
            let counters = Arc::new(Counters::default());
            let table = counting_table(mode, false, &counters);
            table.insert(1, Value::new(1, &counters)).unwrap();
            table.insert(2, Value::new(2, &counters)).unwrap();

            let table = table.destroy().unwrap_err().into_inner();

            // Still fully usable.
            assert_eq!(table.get_n(&1), Some(1));
            table.insert(3, Value::new(3, &counters)).unwrap();
            table.remove(&2).unwrap();
            assert_eq!(table.entry_count(), 2);
            assert_eq!(counters.reclaimed(), 0);
            assert_eq!(counters.value_dropped(), 0);

            let err = table.destroy().unwrap_err();
            assert_eq!(err.live_entries(), 2);
            // Dropping the error drops the table along with its entries.
            assert_eq!(err.into_error(), Error::Busy { live_entries: 2 });
            assert_eq!(counters.reclaimed(), 3);
            assert_eq!(counters.value_dropped(), 3);
        }
    }

    #[test]
    fn destroy_drains_pending_entries() {
        for mode in LOCKING_MODES {
            let counters = Arc::new(Counters::default());
            let table = counting_table(mode, false, &counters);
            for i in 0..5 {
                table.insert(i, Value::new(i, &counters)).unwrap();
            }
            for i in 0..5 {
                table.remove(&i).unwrap();
            }
            assert_eq!(table.pending_delete_count(), 5);

            table.destroy().unwrap();
            assert_eq!(counters.reclaimed(), 5);
            assert_eq!(counters.value_dropped(), 5);
        }
    }

    #[test]
    fn drop_reclaims_every_entry() {
        let counters = Arc::new(Counters::default());
        let table = LloTable::builder(4)
            .reclaimer(CountingReclaimer::failing(&counters, 3))
            .build()
            .unwrap();
        for i in 0..6 {
            table.insert(i, Value::new(i, &counters)).unwrap();
        }
        table.remove(&0).unwrap();
        table.remove(&1).unwrap();

        std::mem::drop(table);
        assert_eq!(counters.value_created(), 6);
        assert_eq!(counters.value_dropped(), 6);
        assert_eq!(counters.retried(), 3);
        assert_eq!(counters.reclaimed(), 6);
    }

    #[test]
    fn memory_is_given_back() {
        for mode in LOCKING_MODES {
            for defer in [false, true] {
                let pool = Arc::new(BoundedPool::new(usize::MAX));
                let table = LloTable::builder(16)
                    .locking_mode(mode)
                    .defer_u64_alloc(defer)
                    .reap_interval(Duration::from_secs(3600))
                    .memory_pool(Arc::clone(&pool))
                    .build()
                    .unwrap();
                let empty = pool.used();

                for i in 0..50u64 {
                    table.insert(i, i).unwrap();
                }
                assert!(pool.used() > empty);
                for i in 0..50u64 {
                    table.remove(&i).unwrap();
                }
                table.run_pending_tasks();
                assert_eq!(pool.used(), empty);

                table.insert(1, 1).unwrap();
                table.insert(2, 2).unwrap();
                table.remove(&2).unwrap();
                std::mem::drop(table);
                assert_eq!(pool.used(), 0);
            }
        }
    }

    #[test]
    fn nowait_insert_fails_without_memory() {
        for defer in [false, true] {
            let pool = Arc::new(BoundedPool::new(usize::MAX));
            let table = LloTable::builder(8)
                .nowait(true)
                .defer_u64_alloc(defer)
                .memory_pool(Arc::clone(&pool))
                .build()
                .unwrap();
            pool.set_limit(pool.used());

            assert!(matches!(
                table.insert(1u32, 1u32),
                Err(Error::OutOfMemory { .. })
            ));
            assert_eq!(table.entry_count(), 0);
            assert!(table.lookup(&1).is_none());
            assert_eq!(pool.used(), pool.limit());

            pool.set_limit(usize::MAX);
            table.insert(1, 1).unwrap();
            assert_eq!(table.get(&1), Some(1));
        }
    }

    #[test]
    fn nowait_insert_fails_when_the_stamp_does_not_fit() {
        let pool = Arc::new(BoundedPool::new(usize::MAX));
        let table = LloTable::builder(8)
            .nowait(true)
            .memory_pool(Arc::clone(&pool))
            .build()
            .unwrap();
        // Room for the entry, not for its stamp.
        pool.set_limit(pool.used() + std::mem::size_of::<Entry<u32, u32>>());

        assert!(matches!(
            table.insert(1u32, 1u32),
            Err(Error::OutOfMemory { .. })
        ));
        assert_eq!(table.entry_count(), 0);
        assert_eq!(pool.used(), pool.limit() - std::mem::size_of::<Entry<u32, u32>>());
    }

    #[test]
    fn deferred_stamp_delete_fails_without_memory() {
        let pool = Arc::new(BoundedPool::new(usize::MAX));
        let table = LloTable::builder(8)
            .nowait(true)
            .defer_u64_alloc(true)
            .memory_pool(Arc::clone(&pool))
            .build()
            .unwrap();
        table.insert(1u32, 1u32).unwrap();
        pool.set_limit(pool.used());

        assert!(matches!(table.remove(&1), Err(Error::OutOfMemory { .. })));
        assert_eq!(table.get(&1), Some(1));
        assert_eq!(table.entry_count(), 1);
        assert_eq!(table.pending_delete_count(), 0);

        pool.set_limit(usize::MAX);
        table.remove(&1).unwrap();
        assert_eq!(table.pending_delete_count(), 1);
    }

    #[test]
    fn blocking_insert_waits_for_memory() {
        let pool = Arc::new(BoundedPool::new(usize::MAX));
        let table = Arc::new(
            LloTable::builder(8)
                .memory_pool(Arc::clone(&pool))
                .build()
                .unwrap(),
        );
        pool.set_limit(pool.used());

        let inserted = Arc::new(AtomicBool::new(false));
        let handle = {
            let table = Arc::clone(&table);
            let inserted = Arc::clone(&inserted);
            thread::spawn(move || {
                table.insert(1u32, "one").unwrap();
                inserted.store(true, Ordering::Release);
            })
        };

        thread::sleep(Duration::from_millis(100));
        assert!(!inserted.load(Ordering::Acquire));
        assert_eq!(table.entry_count(), 0);

        pool.set_limit(usize::MAX);
        handle.join().unwrap();
        assert!(inserted.load(Ordering::Acquire));
        assert_eq!(table.get(&1), Some("one"));
    }

    #[test]
    fn lookups_do_not_charge_the_pool_when_reader_slots_run_out() {
        let pool = Arc::new(BoundedPool::new(usize::MAX));
        let table = LloTable::builder(8)
            .nowait(true)
            .memory_pool(Arc::clone(&pool))
            .build()
            .unwrap();
        table.insert(1u32, 1u32).unwrap();
        pool.set_limit(pool.used());

        // More concurrent readers than the initial registry has slots.
        const HELD: usize = 4096;
        let held = (0..HELD)
            .map(|_| table.lookup(&1).expect("lookups never fail"))
            .collect::<Vec<_>>();
        assert!(held.iter().all(|entry| **entry == 1));
        assert_eq!(table.stats().active_readers, HELD);
        assert_eq!(pool.used(), pool.limit());

        drop(held);
        assert_eq!(table.stats().active_readers, 0);
    }

    #[test]
    fn inserts_race_lookups_on_one_bucket() {
        for mode in LOCKING_MODES {
            // One bucket, so every insert appends to the list readers walk.
            let table = Arc::new(
                LloTable::builder(1)
                    .locking_mode(mode)
                    .reap_interval(Duration::from_secs(3600))
                    .build()
                    .unwrap(),
            );
            const KEYS: u32 = 2_000;
            let done = Arc::new(AtomicBool::new(false));

            let readers = (0..4)
                .map(|_| {
                    let table = Arc::clone(&table);
                    let done = Arc::clone(&done);
                    thread::spawn(move || {
                        let mut seen = 0u32;
                        loop {
                            let finished = done.load(Ordering::Acquire);
                            while let Some(entry) = table.lookup(&seen) {
                                assert_eq!(*entry, u64::from(seen) * 3);
                                seen += 1;
                            }
                            // Keys are inserted in order, so every earlier key
                            // is reachable once a later one is.
                            if seen > 0 {
                                assert!(table.contains_key(&(seen / 2)));
                            }
                            if finished {
                                break;
                            }
                        }
                        seen
                    })
                })
                .collect::<Vec<_>>();

            for i in 0..KEYS {
                table.insert(i, u64::from(i) * 3).unwrap();
            }
            done.store(true, Ordering::Release);

            for reader in readers {
                assert_eq!(reader.join().unwrap(), KEYS);
            }
            assert_eq!(table.entry_count(), KEYS as usize);
        }
    }

    #[test]
    fn concurrent_lookups_and_deletes() {
        for mode in LOCKING_MODES {
            let counters = Arc::new(Counters::default());
            let table = Arc::new(
                LloTable::builder(16)
                    .locking_mode(mode)
                    .reap_interval(Duration::from_millis(5))
                    .reclaimer(CountingReclaimer::new(&counters))
                    .build()
                    .unwrap(),
            );
            const KEYS: u32 = 1_000;
            for i in 0..KEYS {
                table.insert(i, Value::new(i, &counters)).unwrap();
            }

            let readers = (0..4)
                .map(|_| {
                    let table = Arc::clone(&table);
                    thread::spawn(move || {
                        for round in 0..3 {
                            for i in 0..KEYS {
                                if let Some(entry) = table.lookup(&i) {
                                    if round == 0 && i % 7 == 0 {
                                        thread::yield_now();
                                    }
                                    assert_eq!(entry.value().n, i);
                                }
                            }
                        }
                    })
                })
                .collect::<Vec<_>>();

            let deleters = (0..2u32)
                .map(|t| {
                    let table = Arc::clone(&table);
                    thread::spawn(move || {
                        for i in (t..KEYS).step_by(2) {
                            table.remove(&i).unwrap();
                        }
                    })
                })
                .collect::<Vec<_>>();

            readers
                .into_iter()
                .chain(deleters)
                .for_each(|h| h.join().unwrap());

            assert_eq!(table.entry_count(), 0);
            // The background reaper may be holding a batch; wait for it.
            for _ in 0..100 {
                table.run_pending_tasks();
                if table.pending_delete_count() == 0 {
                    break;
                }
                thread::sleep(Duration::from_millis(10));
            }
            assert_eq!(table.pending_delete_count(), 0);
            assert_eq!(counters.reclaimed(), KEYS);
            assert_eq!(counters.value_dropped(), KEYS);
        }
    }

    impl<S, R> LloTable<u32, Value, S, R>
    where
        S: std::hash::BuildHasher + Send + Sync + 'static,
        R: crate::Reclaim<u32, Value>,
    {
        fn get_n(&self, key: &u32) -> Option<u32> {
            self.lookup(key).map(|entry| entry.value().n)
        }
    }
}

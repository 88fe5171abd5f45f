use super::{base_table::TableConfig, LloTable, LockingMode};
use crate::{
    common::{
        alloc::{AllocPolicy, MemoryPool, SystemPool},
        concurrent::constants::{DEFAULT_REAP_INTERVAL_MILLIS, MAX_REAP_INTERVAL_SECS},
        error::Error,
    },
    reclaim::{DropReclaimer, Reclaim},
};

use std::{
    collections::hash_map::RandomState,
    hash::{BuildHasher, Hash},
    marker::PhantomData,
    sync::Arc,
    time::Duration,
};

/// The creation flags of a table.
///
/// These can be set together with [`TableBuilder::flags`] or one by one with
/// the builder method of the same name.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableFlags {
    /// Fail allocations immediately with [`Error::OutOfMemory`] instead of
    /// waiting for memory.
    pub nowait: bool,
    /// Guard each bucket with its own mutex instead of one mutex for the whole
    /// table.
    pub multi_mutex: bool,
    /// Allocate the epoch stamp of an entry when it is deleted rather than when
    /// it is inserted. Saves memory for entries that are never deleted, but a
    /// `nowait` delete can then fail with `OutOfMemory`.
    pub defer_u64_alloc: bool,
}

/// Builds a [`LloTable`][table-struct] with various configuration knobs.
///
/// [table-struct]: ./struct.LloTable.html
///
/// # Examples
///
/// ```rust
/// use llohash::sync::{LloTable, LockingMode};
/// use std::time::Duration;
///
/// let table = LloTable::builder(1024)
///     .name("sessions")
///     .locking_mode(LockingMode::PerBucket)
///     // Sweep the pending-free list every 250 milliseconds.
///     .reap_interval(Duration::from_millis(250))
///     .build()
///     .unwrap();
///
/// table.insert(0, "zero").unwrap();
/// assert_eq!(table.get(&0), Some("zero"));
/// ```
///
#[must_use]
pub struct TableBuilder<K, V, R = DropReclaimer> {
    bucket_count: usize,
    name: Option<String>,
    flags: TableFlags,
    reap_interval: Duration,
    memory_pool: Option<Arc<dyn MemoryPool>>,
    key_size_hint: usize,
    reclaimer: R,
    table_type: PhantomData<fn() -> (K, V)>,
}

impl<K, V> TableBuilder<K, V>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
{
    /// Constructs a new `TableBuilder` for a table with `bucket_count` buckets.
    ///
    /// # Panics
    ///
    /// Panics if `bucket_count` is zero.
    pub fn new(bucket_count: usize) -> Self {
        assert!(bucket_count > 0, "bucket_count must be greater than zero");

        Self {
            bucket_count,
            name: None,
            flags: TableFlags::default(),
            reap_interval: Duration::from_millis(DEFAULT_REAP_INTERVAL_MILLIS),
            memory_pool: None,
            key_size_hint: 0,
            reclaimer: DropReclaimer,
            table_type: PhantomData,
        }
    }
}

impl<K, V, R> TableBuilder<K, V, R>
where
    K: Eq + Hash + Send + Sync + 'static,
    V: Send + Sync + 'static,
    R: Reclaim<K, V>,
{
    /// Sets the name of the table. The name is used as a prefix of log
    /// messages when the `logging` feature is enabled.
    pub fn name(self, name: &str) -> Self {
        Self {
            name: Some(name.to_string()),
            ..self
        }
    }

    /// Sets all creation flags at once.
    pub fn flags(self, flags: TableFlags) -> Self {
        Self { flags, ..self }
    }

    /// Makes allocating operations fail with `OutOfMemory` instead of waiting.
    pub fn nowait(mut self, nowait: bool) -> Self {
        self.flags.nowait = nowait;
        self
    }

    /// Gives each bucket its own mutex. Same as
    /// `locking_mode(LockingMode::PerBucket)`.
    pub fn multi_mutex(mut self, multi_mutex: bool) -> Self {
        self.flags.multi_mutex = multi_mutex;
        self
    }

    /// Sets how the buckets are guarded against concurrent mutation.
    pub fn locking_mode(self, mode: LockingMode) -> Self {
        self.multi_mutex(mode == LockingMode::PerBucket)
    }

    /// Delays the allocation of each entry's epoch stamp until the entry is
    /// deleted.
    pub fn defer_u64_alloc(mut self, defer: bool) -> Self {
        self.flags.defer_u64_alloc = defer;
        self
    }

    /// Sets the interval between two reaper sweeps.
    ///
    /// # Panics
    ///
    /// Panics if `interval` is zero or longer than one day.
    pub fn reap_interval(self, interval: Duration) -> Self {
        assert!(!interval.is_zero(), "reap_interval must not be zero");
        assert!(
            interval <= Duration::from_secs(MAX_REAP_INTERVAL_SECS),
            "reap_interval is longer than one day"
        );
        Self {
            reap_interval: interval,
            ..self
        }
    }

    /// Sets the memory pool the table charges its allocations to. Defaults to
    /// [`SystemPool`][system-pool].
    ///
    /// [system-pool]: ../struct.SystemPool.html
    pub fn memory_pool<P: MemoryPool>(self, pool: Arc<P>) -> Self {
        Self {
            memory_pool: Some(pool as Arc<dyn MemoryPool>),
            ..self
        }
    }

    /// Sets the number of bytes each key is expected to own outside of the
    /// entry, e.g. the heap buffer of a `String` key. It is charged to the
    /// memory pool together with each entry.
    pub fn key_size_hint(self, bytes: usize) -> Self {
        Self {
            key_size_hint: bytes,
            ..self
        }
    }

    /// Sets the reclaimer that is called on each deleted entry once no reader
    /// can observe it anymore.
    pub fn reclaimer<R2>(self, reclaimer: R2) -> TableBuilder<K, V, R2>
    where
        R2: Reclaim<K, V>,
    {
        TableBuilder {
            bucket_count: self.bucket_count,
            name: self.name,
            flags: self.flags,
            reap_interval: self.reap_interval,
            memory_pool: self.memory_pool,
            key_size_hint: self.key_size_hint,
            reclaimer,
            table_type: PhantomData,
        }
    }

    /// Builds a `LloTable<K, V, RandomState, R>`.
    ///
    /// # Errors
    ///
    /// Returns `Error::OutOfMemory` if the `nowait` flag is set and the memory
    /// pool cannot hold the bucket array and its locks.
    pub fn build(self) -> Result<LloTable<K, V, RandomState, R>, Error> {
        self.build_with_hasher(RandomState::default())
    }

    /// Builds a `LloTable<K, V, S, R>` with the given `hasher`.
    ///
    /// # Errors
    ///
    /// Same as [`build`](#method.build).
    pub fn build_with_hasher<S>(self, hasher: S) -> Result<LloTable<K, V, S, R>, Error>
    where
        S: BuildHasher + Send + Sync + 'static,
    {
        let config = TableConfig {
            name: self.name,
            bucket_count: self.bucket_count,
            locking_mode: if self.flags.multi_mutex {
                LockingMode::PerBucket
            } else {
                LockingMode::Single
            },
            alloc_policy: if self.flags.nowait {
                AllocPolicy::NoWait
            } else {
                AllocPolicy::Blocking
            },
            defer_stamp_alloc: self.flags.defer_u64_alloc,
            reap_interval: self.reap_interval,
            memory_pool: self.memory_pool.unwrap_or_else(|| Arc::new(SystemPool)),
            key_size_hint: self.key_size_hint,
        };
        LloTable::with_everything(config, hasher, self.reclaimer)
    }
}

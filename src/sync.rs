//! Provides a thread-safe hash table with lock-free lookups and deferred
//! reclamation of deleted entries.

mod base_table;
mod bucket;
mod builder;
mod entry_ref;
mod reaper;
mod retire_list;
mod table;

pub use {
    bucket::LockingMode,
    builder::{TableBuilder, TableFlags},
    entry_ref::EntryRef,
    table::LloTable,
};

/// A snapshot of the counters of a [`LloTable`][table-struct], returned by
/// [`LloTable::stats`][stats-method].
///
/// The fields are read one by one without synchronizing with concurrent
/// operations, so they may not add up exactly while the table is in use.
///
/// [table-struct]: ./struct.LloTable.html
/// [stats-method]: ./struct.LloTable.html#method.stats
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct TableStats {
    /// Entries linked in the buckets.
    pub entry_count: usize,
    /// Deleted entries waiting for the reaper.
    pub pending_delete_count: usize,
    /// Number of lookups started so far.
    pub start_epoch: u64,
    /// Number of lookups released so far.
    pub end_epoch: u64,
    /// Lookups currently holding a reader slot.
    pub active_readers: usize,
    /// Deleted entries freed since the table was built.
    pub reclaimed_count: u64,
    /// Times the reclaimer asked to retry an entry.
    pub reclaim_retry_count: u64,
}

#![warn(clippy::all)]
#![warn(rust_2018_idioms)]

//! llohash is a concurrent hash table for Rust whose lookups never take a
//! lock.
//!
//! Mutations take either one mutex for the whole table or one mutex per
//! bucket, while lookups walk the bucket lists lock-free. A deleted entry is
//! unlinked right away but freed later, by a periodic reaper, once every
//! lookup that could still be reading it has been released. Two epoch
//! counters per table (lookups started and lookups released) together with a
//! registry of in-flight readers tell the reaper when that is.
//!
//! # Example
//!
//! ```rust
//! use llohash::{sync::LloTable, FreeRetry};
//!
//! let table = LloTable::<u32, Vec<u8>>::builder(128)
//!     .multi_mutex(true)
//!     .reclaimer(|_key: &u32, value: &mut Vec<u8>| {
//!         // Release whatever the value owns outside of the table here.
//!         value.clear();
//!         Ok::<_, FreeRetry>(())
//!     })
//!     .build()
//!     .unwrap();
//!
//! table.insert(7, vec![1, 2, 3]).unwrap();
//!
//! let entry = table.lookup(&7).unwrap();
//! // Deleting does not invalidate `entry`.
//! table.delete(&entry).unwrap();
//! assert_eq!(entry.value(), &[1, 2, 3]);
//! table.release(entry);
//!
//! assert_eq!(table.entry_count(), 0);
//! table.run_pending_tasks();
//! assert_eq!(table.pending_delete_count(), 0);
//! ```
//!
//! # Allocation policy
//!
//! Every allocation a table makes is charged to a [`MemoryPool`]. By default
//! a table waits for its pool to have room; built with the `nowait` flag, it
//! fails with [`Error::OutOfMemory`] instead.
//!
//! # Logging
//!
//! With the `logging` feature, reclaimer panics, reclaim retries and entries
//! dropped by `destroy` are reported through the [`log`] crate.
//!
//! [`log`]: https://docs.rs/log

pub(crate) mod common;
pub mod reclaim;
pub mod sync;

pub use common::{
    alloc::{AllocPolicy, BoundedPool, MemoryPool, SystemPool},
    error::{DestroyError, Error},
};
pub use reclaim::{DropReclaimer, FreeRetry, Reclaim};

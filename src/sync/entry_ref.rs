use super::bucket::Entry;
use crate::common::epoch::ReadSection;

use std::{fmt, ops::Deref};

/// A borrowed reference to an entry returned by
/// [`LloTable::lookup`][lookup-method].
///
/// While an `EntryRef` is alive, the entry it points to is not freed, even if
/// another thread deletes it from the table in the meantime: the reaper waits
/// until every lookup that could have observed a deleted entry has been
/// released.
///
/// The reference is released when it is dropped, or explicitly with
/// [`release`](#method.release) or [`LloTable::release`][release-method].
/// Holding it does not block inserts or deletes, but it does hold back the
/// reclamation of entries deleted after the lookup started, so keep it short
/// lived.
///
/// [lookup-method]: ./struct.LloTable.html#method.lookup
/// [release-method]: ./struct.LloTable.html#method.release
pub struct EntryRef<'a, K, V> {
    entry: &'a Entry<K, V>,
    section: ReadSection<'a>,
}

impl<'a, K, V> EntryRef<'a, K, V> {
    pub(crate) fn new(section: ReadSection<'a>, entry: &'a Entry<K, V>) -> Self {
        Self { entry, section }
    }

    pub(crate) fn entry(&self) -> &'a Entry<K, V> {
        self.entry
    }

    /// Returns a reference to the key of this entry.
    pub fn key(&self) -> &K {
        &self.entry.key
    }

    /// Returns a reference to the value of this entry.
    pub fn value(&self) -> &V {
        &self.entry.value
    }

    /// Returns references to the key and the value of this entry.
    pub fn pair(&self) -> (&K, &V) {
        (&self.entry.key, &self.entry.value)
    }

    /// Returns the reader epoch this lookup was assigned when it started.
    pub fn read_epoch(&self) -> u64 {
        self.section.epoch()
    }

    /// Releases this reference. Same as dropping it.
    pub fn release(self) {}
}

impl<K, V> Deref for EntryRef<'_, K, V> {
    type Target = V;

    fn deref(&self) -> &V {
        self.value()
    }
}

impl<K: fmt::Debug, V: fmt::Debug> fmt::Debug for EntryRef<'_, K, V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("EntryRef")
            .field("key", self.key())
            .field("value", self.value())
            .field("read_epoch", &self.read_epoch())
            .finish()
    }
}

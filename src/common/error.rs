use std::fmt;

/// The error type for the operations of [`LloTable`][table-struct].
///
/// [table-struct]: sync/struct.LloTable.html
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum Error {
    /// An allocation for the table, its locks, an entry or an epoch stamp could
    /// not be satisfied.
    ///
    /// Only returned when the table was built with the `nowait` flag. A blocking
    /// table waits until its memory pool has room instead.
    #[error("Out of memory: the memory pool could not satisfy an allocation of {bytes} bytes")]
    OutOfMemory { bytes: usize },

    /// The table still has entries linked into its buckets.
    ///
    /// Returned by `destroy`. Retrying without first removing the entries will
    /// never succeed.
    #[error("The table is busy: {live_entries} entries are still linked")]
    Busy { live_entries: usize },

    /// The key or the entry is not present in the table.
    #[error("The entry is not present in the table")]
    NotFound,
}

/// The error returned by [`LloTable::destroy`][destroy-method] when the table
/// still holds live entries.
///
/// The table has not been touched and can be recovered with
/// [`into_inner`](#method.into_inner).
///
/// [destroy-method]: sync/struct.LloTable.html#method.destroy
pub struct DestroyError<T> {
    table: T,
    live_entries: usize,
}

impl<T> DestroyError<T> {
    pub(crate) fn new(table: T, live_entries: usize) -> Self {
        Self {
            table,
            live_entries,
        }
    }

    /// Returns the number of entries that were still linked.
    pub fn live_entries(&self) -> usize {
        self.live_entries
    }

    /// Gives the table back to the caller.
    pub fn into_inner(self) -> T {
        self.table
    }

    /// Converts this error into the plain [`Error::Busy`], dropping the table.
    pub fn into_error(self) -> Error {
        Error::Busy {
            live_entries: self.live_entries,
        }
    }
}

impl<T> fmt::Debug for DestroyError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DestroyError")
            .field("live_entries", &self.live_entries)
            .finish_non_exhaustive()
    }
}

impl<T> fmt::Display for DestroyError<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(
            &Error::Busy {
                live_entries: self.live_entries,
            },
            f,
        )
    }
}

impl<T> std::error::Error for DestroyError<T> {}

//! The hook a table calls when a deleted entry can finally be freed.

/// Returned by a [`Reclaim`] implementation that could not finish freeing an
/// entry's resources.
///
/// The table keeps the entry on its pending-free list and calls the reclaimer
/// again on the next reaper sweep. The entry is never dropped behind the
/// reclaimer's back while it keeps asking for a retry.
#[derive(thiserror::Error, Debug, Clone, Copy, Default, PartialEq, Eq)]
#[error("The reclaimer could not free the entry; it will be retried")]
pub struct FreeRetry;

/// Finalizes the key and value of a deleted entry once no reader can observe
/// them anymore.
///
/// `reclaim` is called by the reaper thread (or by `run_pending_tasks`,
/// `destroy` and the table's destructor), never while a lookup that could
/// have returned the entry is still holding it. When it returns `Ok(())`, the
/// table drops the key and value and frees the entry. When it returns
/// `Err(FreeRetry)`, the entry stays pending and `reclaim` is called again on a
/// later sweep.
///
/// Closures of type `Fn(&K, &mut V) -> Result<(), FreeRetry>` implement this
/// trait.
///
/// # Panics
///
/// If `reclaim` panics, the panic is caught, the entry is dropped as if the
/// reclaimer had succeeded, and the panic is logged when the `logging`
/// feature is enabled.
///
/// # Examples
///
/// ```rust
/// use llohash::{sync::LloTable, FreeRetry};
/// use std::sync::{
///     atomic::{AtomicUsize, Ordering},
///     Arc,
/// };
///
/// let freed = Arc::new(AtomicUsize::new(0));
/// let counter = Arc::clone(&freed);
///
/// let table = LloTable::<u32, String>::builder(16)
///     .reclaimer(move |_key: &u32, _value: &mut String| {
///         counter.fetch_add(1, Ordering::Relaxed);
///         Ok::<_, FreeRetry>(())
///     })
///     .build()
///     .unwrap();
///
/// table.insert(1, "one".to_string()).unwrap();
/// table.remove(&1).unwrap();
/// table.run_pending_tasks();
///
/// assert_eq!(freed.load(Ordering::Relaxed), 1);
/// ```
pub trait Reclaim<K, V>: Send + Sync + 'static {
    fn reclaim(&self, key: &K, value: &mut V) -> Result<(), FreeRetry>;
}

/// The default reclaimer. It does nothing beyond letting the table drop the
/// key and value.
#[derive(Clone, Copy, Debug, Default)]
pub struct DropReclaimer;

impl<K, V> Reclaim<K, V> for DropReclaimer {
    fn reclaim(&self, _key: &K, _value: &mut V) -> Result<(), FreeRetry> {
        Ok(())
    }
}

impl<K, V, F> Reclaim<K, V> for F
where
    F: Fn(&K, &mut V) -> Result<(), FreeRetry> + Send + Sync + 'static,
{
    fn reclaim(&self, key: &K, value: &mut V) -> Result<(), FreeRetry> {
        self(key, value)
    }
}

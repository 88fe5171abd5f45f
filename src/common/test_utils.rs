use crate::reclaim::{FreeRetry, Reclaim};

use std::sync::{
    atomic::{AtomicU32, Ordering},
    Arc,
};

#[derive(Debug, Default)]
pub(crate) struct Counters {
    value_created: AtomicU32,
    value_dropped: AtomicU32,
    reclaimed: AtomicU32,
    retried: AtomicU32,
}

impl Counters {
    pub(crate) fn value_created(&self) -> u32 {
        self.value_created.load(Ordering::Acquire)
    }

    pub(crate) fn value_dropped(&self) -> u32 {
        self.value_dropped.load(Ordering::Acquire)
    }

    pub(crate) fn reclaimed(&self) -> u32 {
        self.reclaimed.load(Ordering::Acquire)
    }

    pub(crate) fn retried(&self) -> u32 {
        self.retried.load(Ordering::Acquire)
    }

    fn incl_value_created(&self) {
        self.value_created.fetch_add(1, Ordering::AcqRel);
    }

    fn incl_value_dropped(&self) {
        self.value_dropped.fetch_add(1, Ordering::AcqRel);
    }
}

/// A value that counts its creations and drops.
#[derive(Debug)]
pub(crate) struct Value {
    pub(crate) n: u32,
    counters: Arc<Counters>,
}

impl Value {
    pub(crate) fn new(n: u32, counters: &Arc<Counters>) -> Self {
        counters.incl_value_created();
        Self {
            n,
            counters: Arc::clone(counters),
        }
    }
}

impl Drop for Value {
    fn drop(&mut self) {
        self.counters.incl_value_dropped();
    }
}

/// Counts reclaims, and asks for a retry the first `failures` times it is
/// called.
pub(crate) struct CountingReclaimer {
    counters: Arc<Counters>,
    failures: AtomicU32,
}

impl CountingReclaimer {
    pub(crate) fn new(counters: &Arc<Counters>) -> Self {
        Self::failing(counters, 0)
    }

    pub(crate) fn failing(counters: &Arc<Counters>, failures: u32) -> Self {
        Self {
            counters: Arc::clone(counters),
            failures: AtomicU32::new(failures),
        }
    }
}

impl<K> Reclaim<K, Value> for CountingReclaimer {
    fn reclaim(&self, _key: &K, value: &mut Value) -> Result<(), FreeRetry> {
        // Checking the value makes sure it has not been dropped yet.
        assert!(
            Arc::ptr_eq(&self.counters, &value.counters),
            "reclaimed a value from another test"
        );

        let failing = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| n.checked_sub(1))
            .is_ok();
        if failing {
            self.counters.retried.fetch_add(1, Ordering::AcqRel);
            Err(FreeRetry)
        } else {
            self.counters.reclaimed.fetch_add(1, Ordering::AcqRel);
            Ok(())
        }
    }
}

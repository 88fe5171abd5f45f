use once_cell::sync::Lazy;
use parking_lot::RwLock;
use scheduled_thread_pool::ScheduledThreadPool;
use std::{collections::HashMap, sync::Arc};

static REGISTRY: Lazy<ThreadPoolRegistry> = Lazy::new(ThreadPoolRegistry::default);

#[derive(Clone, Copy, Debug, Hash, PartialEq, Eq, PartialOrd, Ord)]
pub(crate) enum PoolName {
    Reaper,
}

impl PoolName {
    fn thread_name_template(&self) -> &'static str {
        match self {
            PoolName::Reaper => "llohash-reaper-{}",
        }
    }

    fn num_threads(&self) -> usize {
        match self {
            // Sweeps are short and never contend on bucket locks; a couple of
            // threads are enough for any number of tables.
            //
            // NOTE: On some platforms, `num_cpus::get` may return 0. In that
            // case, use 1.
            PoolName::Reaper => (num_cpus::get() / 4).clamp(1, 4),
        }
    }
}

pub(crate) struct ThreadPool {
    pub(crate) name: PoolName,
    pub(crate) pool: ScheduledThreadPool,
}

impl ThreadPool {
    fn new(name: PoolName) -> Self {
        let pool = ScheduledThreadPool::with_name(name.thread_name_template(), name.num_threads());
        Self { name, pool }
    }
}

#[derive(Default)]
pub(crate) struct ThreadPoolRegistry {
    pools: RwLock<HashMap<PoolName, Arc<ThreadPool>>>,
}

impl ThreadPoolRegistry {
    pub(crate) fn acquire_pool(name: PoolName) -> Arc<ThreadPool> {
        loop {
            {
                // Fast path: the pool is already running.
                let pools = REGISTRY.pools.read();
                if let Some(pool) = pools.get(&name) {
                    return Arc::clone(pool);
                }
            }
            {
                // Another table may have started it since we dropped the read
                // lock.
                let mut pools = REGISTRY.pools.write();
                pools
                    .entry(name)
                    .or_insert_with(|| Arc::new(ThreadPool::new(name)));
            }
        }
    }

    pub(crate) fn release_pool(pool: &Arc<ThreadPool>) {
        if Arc::strong_count(pool) <= 2 {
            // The caller's handle and the registry's are the last ones. Shut
            // the pool down by removing it.
            let name = pool.name;
            let mut pools = REGISTRY.pools.write();
            if let Some(pool) = pools.get(&name) {
                if Arc::strong_count(pool) <= 2 {
                    pools.remove(&name);
                }
            }
        }
    }
}

use crate::common::concurrent::thread_pool::{PoolName, ThreadPool, ThreadPoolRegistry};

use parking_lot::Mutex;
use scheduled_thread_pool::JobHandle;
use std::{
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

pub(crate) trait InnerReap {
    /// Runs one sweep over the pending-free list.
    fn reap(&self);
}

/// Runs the periodic sweep of a table on the shared reaper thread pool.
///
/// The job is Idle between ticks and Sweeping while `reap` runs; the
/// `periodical_reap_running` mutex is held for the duration of a sweep so
/// `stop` can wait for an in-progress one.
pub(crate) struct Reaper {
    thread_pool: Arc<ThreadPool>,
    is_shutting_down: Arc<AtomicBool>,
    periodical_reap_job: Mutex<Option<JobHandle>>,
    periodical_reap_running: Arc<Mutex<()>>,
}

impl Drop for Reaper {
    fn drop(&mut self) {
        self.stop();
        ThreadPoolRegistry::release_pool(&self.thread_pool);
    }
}

impl Reaper {
    pub(crate) fn new<T>(inner: Weak<T>, interval: Duration) -> Self
    where
        T: InnerReap + Send + Sync + 'static,
    {
        let thread_pool = ThreadPoolRegistry::acquire_pool(PoolName::Reaper);
        let is_shutting_down = Arc::new(AtomicBool::new(false));
        let periodical_reap_running = Arc::new(Mutex::new(()));

        let job = Self::start_periodical_reap_job(
            &thread_pool,
            inner,
            interval,
            Arc::clone(&is_shutting_down),
            Arc::clone(&periodical_reap_running),
        );

        Self {
            thread_pool,
            is_shutting_down,
            periodical_reap_job: Mutex::new(Some(job)),
            periodical_reap_running,
        }
    }

    fn start_periodical_reap_job<T>(
        thread_pool: &Arc<ThreadPool>,
        inner: Weak<T>,
        interval: Duration,
        is_shutting_down: Arc<AtomicBool>,
        periodical_reap_running: Arc<Mutex<()>>,
    ) -> JobHandle
    where
        T: InnerReap + Send + Sync + 'static,
    {
        let reaper_closure = move || {
            if is_shutting_down.load(Ordering::Acquire) {
                return None;
            }
            let _lock = periodical_reap_running.lock();
            // Check again now that no `stop` can be waiting on us.
            if is_shutting_down.load(Ordering::Acquire) {
                return None;
            }
            let inner = inner.upgrade()?;
            inner.reap();
            Some(interval)
        };

        thread_pool
            .pool
            .execute_with_dynamic_delay(interval, reaper_closure)
    }

    /// Cancels the periodical job and waits for a running sweep to finish.
    /// Idempotent.
    pub(crate) fn stop(&self) {
        // Disallow to run sweeps by now.
        self.is_shutting_down.store(true, Ordering::Release);

        // Cancel the periodical job. (This will not abort the job if it is
        // already running)
        if let Some(j) = self.periodical_reap_job.lock().take() {
            j.cancel()
        }

        // Wait for the running sweep to finish.
        std::mem::drop(self.periodical_reap_running.lock());
    }
}

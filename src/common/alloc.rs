//! Memory pools and the policy-aware allocator every table allocation goes
//! through.

use super::{concurrent::constants::ALLOC_RETRY_INTERVAL_MICROS, error::Error};

use std::{
    alloc::{self, Layout},
    fmt,
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
    time::Duration,
};

/// A source of memory that a table charges its allocations to.
///
/// A table asks its pool for room before it allocates its bucket array, its
/// bucket locks, each entry and each epoch stamp, and gives the room back when
/// the memory is freed. A pool that refuses a reservation makes the allocation
/// fail (tables built with the `nowait` flag) or wait until another thread
/// releases memory (blocking tables).
///
/// Implementations must be cheap and must not block.
pub trait MemoryPool: Send + Sync + 'static {
    /// Tries to reserve `bytes` bytes. Returns `false` if the pool cannot
    /// satisfy the request right now.
    fn try_reserve(&self, bytes: usize) -> bool;

    /// Returns `bytes` bytes previously reserved with `try_reserve`.
    fn release(&self, bytes: usize);
}

/// The default memory pool. It never refuses a reservation and leaves
/// out-of-memory handling to the global allocator.
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemPool;

impl MemoryPool for SystemPool {
    fn try_reserve(&self, _bytes: usize) -> bool {
        true
    }

    fn release(&self, _bytes: usize) {}
}

/// A memory pool with a fixed byte budget.
///
/// # Examples
///
/// ```rust
/// use llohash::{sync::LloTable, BoundedPool, Error};
/// use std::sync::Arc;
///
/// // A pool far too small to hold the bucket array.
/// let pool = Arc::new(BoundedPool::new(16));
///
/// let result = LloTable::<u32, u32>::builder(1024)
///     .nowait(true)
///     .memory_pool(Arc::clone(&pool))
///     .build();
///
/// assert!(matches!(result, Err(Error::OutOfMemory { .. })));
/// assert_eq!(pool.used(), 0);
/// ```
pub struct BoundedPool {
    limit: AtomicUsize,
    used: AtomicUsize,
}

impl BoundedPool {
    /// Creates a pool that hands out at most `limit` bytes at a time.
    pub fn new(limit: usize) -> Self {
        Self {
            limit: AtomicUsize::new(limit),
            used: AtomicUsize::default(),
        }
    }

    /// Returns the number of bytes currently reserved.
    pub fn used(&self) -> usize {
        self.used.load(Ordering::Acquire)
    }

    /// Returns the byte budget of this pool.
    pub fn limit(&self) -> usize {
        self.limit.load(Ordering::Acquire)
    }

    /// Changes the byte budget. Lowering it below `used` does not revoke
    /// existing reservations; it only makes new ones fail.
    pub fn set_limit(&self, limit: usize) {
        self.limit.store(limit, Ordering::Release);
    }

    /// Returns the number of bytes that can still be reserved.
    pub fn available(&self) -> usize {
        self.limit().saturating_sub(self.used())
    }
}

impl MemoryPool for BoundedPool {
    fn try_reserve(&self, bytes: usize) -> bool {
        let limit = self.limit();
        self.used
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |used| {
                used.checked_add(bytes).filter(|total| *total <= limit)
            })
            .is_ok()
    }

    fn release(&self, bytes: usize) {
        let prev = self.used.fetch_sub(bytes, Ordering::AcqRel);
        debug_assert!(prev >= bytes, "released more bytes than reserved");
    }
}

impl fmt::Debug for BoundedPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BoundedPool")
            .field("limit", &self.limit())
            .field("used", &self.used())
            .finish()
    }
}

/// What an allocating operation does when memory is not available.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum AllocPolicy {
    /// Sleep and retry until the memory pool (and the global allocator) can
    /// satisfy the request. The operation never fails with `OutOfMemory`, but
    /// it may wait forever if nothing ever gives memory back.
    #[default]
    Blocking,
    /// Fail immediately with [`Error::OutOfMemory`].
    NoWait,
}

pub(crate) struct Allocator {
    pool: Arc<dyn MemoryPool>,
    policy: AllocPolicy,
}

impl Allocator {
    pub(crate) fn new(pool: Arc<dyn MemoryPool>, policy: AllocPolicy) -> Self {
        Self { pool, policy }
    }

    pub(crate) fn policy(&self) -> AllocPolicy {
        self.policy
    }

    /// Reserves `bytes` in the pool, waiting for room under the blocking
    /// policy.
    pub(crate) fn charge(&self, bytes: usize) -> Result<(), Error> {
        loop {
            if self.pool.try_reserve(bytes) {
                return Ok(());
            }
            self.wait_or_fail(bytes)?;
        }
    }

    pub(crate) fn uncharge(&self, bytes: usize) {
        self.pool.release(bytes);
    }

    /// Moves `value` to the heap. `extra` bytes are charged on top of the size
    /// of `T`, for memory owned by the value that the table accounts for (e.g.
    /// key storage).
    pub(crate) fn alloc_box<T>(&self, value: T, extra: usize) -> Result<Box<T>, Error> {
        let layout = Layout::new::<T>();
        let charge = layout.size() + extra;
        self.charge(charge)?;

        if layout.size() == 0 {
            return Ok(Box::new(value));
        }

        loop {
            // Safety: the layout has a non-zero size.
            let ptr = unsafe { alloc::alloc(layout) } as *mut T;
            if !ptr.is_null() {
                // Safety: `ptr` was allocated by the global allocator with the
                // layout of `T`, which is what `Box` expects.
                unsafe {
                    ptr.write(value);
                    return Ok(Box::from_raw(ptr));
                }
            }
            if let Err(e) = self.wait_or_fail(charge) {
                self.uncharge(charge);
                return Err(e);
            }
        }
    }

    /// Drops a box created by `alloc_box` and gives its charge back.
    pub(crate) fn free_box<T>(&self, boxed: Box<T>, extra: usize) {
        std::mem::drop(boxed);
        self.uncharge(std::mem::size_of::<T>() + extra);
    }

    /// Allocates a boxed slice of `len` elements produced by `f`.
    ///
    /// A slice too large to ever be allocated fails with `OutOfMemory` under
    /// either policy.
    pub(crate) fn alloc_slice_with<T>(
        &self,
        len: usize,
        mut f: impl FnMut(usize) -> T,
    ) -> Result<Box<[T]>, Error> {
        let charge = Self::slice_charge::<T>(len);
        if Layout::array::<T>(len).is_err() {
            return Err(Error::OutOfMemory { bytes: charge });
        }
        self.charge(charge)?;

        let mut vec = Vec::new();
        while vec.try_reserve_exact(len).is_err() {
            if let Err(e) = self.wait_or_fail(charge) {
                self.uncharge(charge);
                return Err(e);
            }
        }
        vec.extend((0..len).map(&mut f));
        Ok(vec.into_boxed_slice())
    }

    pub(crate) fn slice_charge<T>(len: usize) -> usize {
        std::mem::size_of::<T>().saturating_mul(len)
    }

    fn wait_or_fail(&self, bytes: usize) -> Result<(), Error> {
        match self.policy {
            AllocPolicy::NoWait => Err(Error::OutOfMemory { bytes }),
            AllocPolicy::Blocking => {
                std::thread::sleep(Duration::from_micros(ALLOC_RETRY_INTERVAL_MICROS));
                Ok(())
            }
        }
    }
}

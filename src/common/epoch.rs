//! The start/end epoch counters and the registry of in-flight readers.
//!
//! Every lookup takes a reader epoch by bumping `start`, and bumps `end` when
//! its caller releases the entry it got. A deleted entry is stamped with the
//! value of `start` right after it was unlinked, and may be freed once every
//! in-flight reader holds an epoch at or past that stamp: such a reader began
//! its walk after the unlink and cannot have reached the entry.
//!
//! # Memory ordering
//!
//! All epoch and reader-slot operations are `SeqCst`, and three `SeqCst`
//! fences pair them up:
//!
//! - a reader fences after publishing its slot and again after taking its
//!   epoch, before it loads any bucket link;
//! - a deleter fences between unlinking an entry and reading the stamp;
//! - the reaper fences between reading `start` and scanning the slots.
//!
//! If a reader's epoch is at or past a stamp, the deleter's fence precedes the
//! reader's second fence, so the reader's link loads observe the unlink. If the
//! reaper's scan misses a reader's slot, the reaper's fence precedes the
//! reader's first fence, so the reader's epoch is at least the `start` value
//! the reaper bounded the safe epoch with.
//!
//! # Memory
//!
//! Reader slots are allocated from the global allocator and are not charged to
//! the table's memory pool, so a lookup never fails or waits. The registry
//! only grows when more lookups are in flight at once than it has slots.

use super::concurrent::constants::{MIN_READER_SLOTS, READER_SLOTS_PER_CPU};

use crossbeam_utils::CachePadded;
use std::{
    cell::Cell,
    ptr,
    sync::atomic::{self, AtomicPtr, AtomicU64, AtomicUsize, Ordering},
};

const VACANT: u64 = u64::MAX;

pub(crate) struct Epochs {
    start: CachePadded<AtomicU64>,
    end: CachePadded<AtomicU64>,
    readers: ReaderRegistry,
}

impl Default for Epochs {
    fn default() -> Self {
        let slots = (num_cpus::get().max(1) * READER_SLOTS_PER_CPU).max(MIN_READER_SLOTS);
        Self::with_reader_slots(slots)
    }
}

impl Epochs {
    pub(crate) fn with_reader_slots(slots: usize) -> Self {
        Self {
            start: CachePadded::new(AtomicU64::new(0)),
            end: CachePadded::new(AtomicU64::new(0)),
            readers: ReaderRegistry::new(slots),
        }
    }

    pub(crate) fn start(&self) -> u64 {
        self.start.load(Ordering::SeqCst)
    }

    pub(crate) fn end(&self) -> u64 {
        self.end.load(Ordering::SeqCst)
    }

    /// Registers a reader and returns its read section. Lock-free; it only
    /// allocates when every reader slot is taken.
    pub(crate) fn pin(&self) -> ReadSection<'_> {
        // Publish a lower bound of the epoch we are about to take, so the
        // reaper never sees this reader as absent once we hold an epoch.
        let lower_bound = self.start.load(Ordering::SeqCst);
        let slot = self.readers.claim(lower_bound);
        atomic::fence(Ordering::SeqCst);

        let epoch = self.start.fetch_add(1, Ordering::SeqCst);
        slot.store(epoch, Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);

        ReadSection {
            epochs: self,
            slot,
            epoch,
        }
    }

    /// Returns the stamp for an entry that has just been unlinked.
    pub(crate) fn stamp(&self) -> u64 {
        atomic::fence(Ordering::SeqCst);
        self.start.load(Ordering::SeqCst)
    }

    /// Returns the epoch up to which stamped entries can be freed: no
    /// in-flight reader holds an epoch smaller than it.
    pub(crate) fn safe_epoch(&self) -> u64 {
        let now = self.start.load(Ordering::SeqCst);
        atomic::fence(Ordering::SeqCst);
        match self.readers.min_active() {
            Some(oldest) => oldest.min(now),
            None => now,
        }
    }

    pub(crate) fn active_readers(&self) -> usize {
        self.readers.active()
    }
}

/// An in-flight lookup. Dropping it releases the reader.
pub(crate) struct ReadSection<'a> {
    epochs: &'a Epochs,
    slot: &'a AtomicU64,
    epoch: u64,
}

impl ReadSection<'_> {
    pub(crate) fn epoch(&self) -> u64 {
        self.epoch
    }
}

impl Drop for ReadSection<'_> {
    fn drop(&mut self) {
        self.slot.store(VACANT, Ordering::SeqCst);
        self.epochs.end.fetch_add(1, Ordering::SeqCst);
    }
}

struct Segment {
    slots: Box<[CachePadded<AtomicU64>]>,
    next: AtomicPtr<Segment>,
}

impl Segment {
    fn new(len: usize) -> Self {
        Self {
            slots: (0..len)
                .map(|_| CachePadded::new(AtomicU64::new(VACANT)))
                .collect(),
            next: AtomicPtr::new(ptr::null_mut()),
        }
    }

    fn next(&self) -> Option<&Segment> {
        // Safety: segments are only freed when the registry is dropped.
        unsafe { self.next.load(Ordering::Acquire).as_ref() }
    }
}

/// A grow-only list of segments of reader slots.
struct ReaderRegistry {
    head: Segment,
}

impl ReaderRegistry {
    fn new(slots: usize) -> Self {
        Self {
            head: Segment::new(slots.max(1)),
        }
    }

    fn claim(&self, epoch: u64) -> &AtomicU64 {
        let hint = thread_hint();
        let mut segment = &self.head;
        loop {
            let len = segment.slots.len();
            for i in 0..len {
                let slot = &*segment.slots[(hint + i) % len];
                if slot.load(Ordering::Relaxed) == VACANT
                    && slot
                        .compare_exchange(VACANT, epoch, Ordering::SeqCst, Ordering::Relaxed)
                        .is_ok()
                {
                    return slot;
                }
            }
            segment = self.next_or_grow(segment);
        }
    }

    /// Returns the segment after `segment`, appending one twice its size if
    /// there is none. The new segment bypasses the memory pool.
    fn next_or_grow<'a>(&'a self, segment: &'a Segment) -> &'a Segment {
        if let Some(next) = segment.next() {
            return next;
        }

        let new = Box::into_raw(Box::new(Segment::new(segment.slots.len() * 2)));
        match segment.next.compare_exchange(
            ptr::null_mut(),
            new,
            Ordering::AcqRel,
            Ordering::Acquire,
        ) {
            // Safety: `new` is now owned by the registry.
            Ok(_) => unsafe { &*new },
            Err(winner) => {
                // Another reader grew the registry first.
                // Safety: `new` was never shared.
                std::mem::drop(unsafe { Box::from_raw(new) });
                unsafe { &*winner }
            }
        }
    }

    fn segments(&self) -> impl Iterator<Item = &Segment> {
        std::iter::successors(Some(&self.head), |s| s.next())
    }

    fn min_active(&self) -> Option<u64> {
        self.segments()
            .flat_map(|s| s.slots.iter())
            .map(|slot| slot.load(Ordering::SeqCst))
            .filter(|epoch| *epoch != VACANT)
            .min()
    }

    fn active(&self) -> usize {
        self.segments()
            .flat_map(|s| s.slots.iter())
            .filter(|slot| slot.load(Ordering::Relaxed) != VACANT)
            .count()
    }
}

impl Drop for ReaderRegistry {
    fn drop(&mut self) {
        let mut next = *self.head.next.get_mut();
        while !next.is_null() {
            // Safety: we have exclusive access and each segment was created by
            // `Box::into_raw` in `next_or_grow`.
            let mut segment = unsafe { Box::from_raw(next) };
            next = *segment.next.get_mut();
        }
    }
}

// Spreads threads over the first segment so concurrent readers rarely contend
// for the same slots.
fn thread_hint() -> usize {
    static NEXT_HINT: AtomicUsize = AtomicUsize::new(0);

    thread_local! {
        static HINT: Cell<Option<usize>> = Cell::new(None);
    }

    HINT.with(|hint| match hint.get() {
        Some(h) => h,
        None => {
            let h = NEXT_HINT.fetch_add(1, Ordering::Relaxed);
            hint.set(Some(h));
            h
        }
    })
}

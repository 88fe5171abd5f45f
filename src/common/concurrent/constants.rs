/// The default interval between two reaper sweeps.
pub(crate) const DEFAULT_REAP_INTERVAL_MILLIS: u64 = 1_000;

/// Upper bound accepted by `TableBuilder::reap_interval`.
pub(crate) const MAX_REAP_INTERVAL_SECS: u64 = 24 * 3600;

/// How long a blocking allocation sleeps before asking its memory pool again.
pub(crate) const ALLOC_RETRY_INTERVAL_MICROS: u64 = 200;

/// Reader slots per CPU in the first segment of a reader registry.
pub(crate) const READER_SLOTS_PER_CPU: usize = 4;

// Lower bound for the first segment, so small machines still have room for
// a handful of concurrent lookups before the registry has to grow.
pub(crate) const MIN_READER_SLOTS: usize = 16;

/// Number of sweeps `destroy` runs over entries whose reclaimer keeps asking
/// for a retry before giving up on them.
pub(crate) const MAX_DRAIN_ATTEMPTS: usize = 8;

/// The reaper detaches at most this many entries from the pending-free list per
/// lock hold, then hands them to the reclaimer with the list unlocked.
pub(crate) const REAP_BATCH_SIZE: usize = 32;

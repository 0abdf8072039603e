//! Process-wide gauges of the memory the harness currently owns.
//!
//! All counters use `Relaxed` ordering. They exist so tests (and debug logs)
//! can prove that every scenario gave back what its setup took. Do NOT use
//! them to decide what to unmap; the ledger is the source of truth.

use std::sync::atomic::{AtomicIsize, Ordering};

/// Diagnostic-only gauge counter.
///
/// The raw value may transiently dip below zero if a subtraction races an
/// addition. `get()` clamps to zero.
pub(crate) struct Counter(AtomicIsize);

impl Counter {
    pub const fn new() -> Self {
        Self(AtomicIsize::new(0))
    }

    #[inline]
    fn delta(val: usize) -> isize {
        std::cmp::min(val, isize::MAX as usize).cast_signed()
    }

    #[inline]
    pub fn add(&self, val: usize) {
        self.0.fetch_add(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn sub(&self, val: usize) {
        self.0.fetch_sub(Self::delta(val), Ordering::Relaxed);
    }

    #[inline]
    pub fn get(&self) -> usize {
        self.0.load(Ordering::Relaxed).max(0).cast_unsigned()
    }
}

/// Anonymous mappings held by live ledgers.
pub(crate) static LIVE_MAPPINGS: Counter = Counter::new();
/// Bytes covered by those mappings.
pub(crate) static MAPPED_BYTES: Counter = Counter::new();

/// Heap blocks held by live ledgers.
pub(crate) static LIVE_HEAP_BLOCKS: Counter = Counter::new();
/// Bytes covered by those blocks.
pub(crate) static HEAP_BYTES: Counter = Counter::new();

/// Point-in-time copy of the gauges.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Snapshot {
    pub live_mappings: usize,
    pub mapped_bytes: usize,
    pub live_heap_blocks: usize,
    pub heap_bytes: usize,
}

impl Snapshot {
    pub fn current() -> Self {
        Self {
            live_mappings: LIVE_MAPPINGS.get(),
            mapped_bytes: MAPPED_BYTES.get(),
            live_heap_blocks: LIVE_HEAP_BLOCKS.get(),
            heap_bytes: HEAP_BYTES.get(),
        }
    }
}

/// Move the global gauges from `before` to `after`.
pub(crate) fn apply_delta(before: Snapshot, after: Snapshot) {
    shift(&LIVE_MAPPINGS, before.live_mappings, after.live_mappings);
    shift(&MAPPED_BYTES, before.mapped_bytes, after.mapped_bytes);
    shift(&LIVE_HEAP_BLOCKS, before.live_heap_blocks, after.live_heap_blocks);
    shift(&HEAP_BYTES, before.heap_bytes, after.heap_bytes);
}

fn shift(counter: &Counter, before: usize, after: usize) {
    if after >= before {
        counter.add(after - before);
    } else {
        counter.sub(before - after);
    }
}

use std::sync::atomic::{AtomicU64, Ordering};

use crate::entry::RawLogEntry;

/// Number of `u64` slots in a coverage area, including the counter.
pub const COVER_SIZE: usize = 64 << 10;

/// View over a kcov coverage area.
///
/// Slot 0 holds the number of recorded program counters and the following
/// slots hold the program counters themselves. The kernel keeps writing into
/// the area while coverage is enabled, hence every slot is accessed
/// atomically. Once the area is full the kernel stops recording, so the count
/// never exceeds `capacity - 1`; we clamp it anyway to never read past the
/// end of the area.
pub struct CoverageBuffer<'a> {
    slots: &'a [AtomicU64],
}

impl<'a> CoverageBuffer<'a> {
    pub fn new(slots: &'a [AtomicU64]) -> Self {
        debug_assert!(!slots.is_empty(), "coverage area has no counter slot");
        Self { slots }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    /// Number of program counters that can be read.
    pub fn count(&self) -> usize {
        let raw = self.slots[0].load(Ordering::Acquire);
        usize::try_from(raw)
            .unwrap_or(usize::MAX)
            .min(self.capacity() - 1)
    }

    pub fn reset(&self) {
        self.slots[0].store(0, Ordering::Release);
    }

    /// Copies out the recorded program counters in recording order. The area
    /// is left untouched.
    pub fn entries(&self) -> Vec<RawLogEntry> {
        let count = self.count();
        self.slots[1..=count]
            .iter()
            .map(|slot| RawLogEntry(slot.load(Ordering::Relaxed)))
            .collect()
    }
}

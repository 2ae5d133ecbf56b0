// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Dirty-page tracking for live-migration pre-copy.
//!
//! This is a secondary log, independent of any primary dirty bitmap the
//! embedder keeps: when migration mode starts, every registered page is
//! marked dirty in a per-slot bitmap and a VM-wide counter tracks how many
//! remain. Each consume pass clears bits and returns one usage-class byte
//! per page; the classes let the migration loop skip pages the guest has
//! declared expendable. Guest classification changes re-mark the affected
//! page so it is collected again.

use crate::SiePartition;
use crate::memory::MemoryState;
use crate::requests::WakeReason;
use std::sync::atomic::AtomicU64;
use std::sync::atomic::Ordering;
use thiserror::Error;

/// Bits of a classification byte that are meaningful to migration: the
/// 2-bit usage class and the no-translate hint.
pub const USAGE_CLASS_MASK: u8 = 0x43;

/// Largest run of clean pages the consume walk scans across before
/// stopping early and letting the caller re-anchor.
const MAX_CLEAN_GAP: u64 = 2 * size_of::<usize>() as u64 * 8;

/// The page-usage classification collaborator.
///
/// The classes themselves are guest-maintained hints stored outside this
/// crate; the engine only reads them during migration and rewrites them on
/// the guest's behalf when an intercepted classification instruction is
/// emulated.
pub trait PageClassifier: Send + Sync {
    /// Returns the classification byte of the page at frame `gfn`.
    fn classify(&self, gfn: u64) -> u8;

    /// Rewrites the classification bits selected by `mask` for the page
    /// at frame `gfn`.
    fn set_class_bits(&self, gfn: u64, mask: u8, value: u8);
}

/// An error starting migration mode.
#[derive(Debug, Error)]
pub enum MigrationError {
    /// Migration mode is already collecting.
    #[error("migration mode is already active")]
    AlreadyActive,
    /// There is no registered memory to track.
    #[error("no memory slots are registered")]
    NoSlots,
}

/// An error reading the dirty log.
#[derive(Debug, Error)]
pub enum DirtyLogError {
    /// Consuming dirty state requires migration mode.
    #[error("migration mode is not active")]
    NotStarted,
}

/// Migration-mode state reported to the caller.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct MigrationStatus {
    /// Whether migration mode is collecting dirty state.
    pub active: bool,
    /// Dirty pages not yet consumed.
    pub dirty_pages: u64,
}

/// One batch of page classifications returned from the dirty log.
#[derive(Debug, PartialEq, Eq)]
pub struct DirtyBatch {
    /// Frame of the first entry in `values`. For a consuming read this is
    /// the first dirty page at or after the requested start.
    pub start_gfn: u64,
    /// One classification byte per page, starting at `start_gfn`.
    pub values: Vec<u8>,
    /// Dirty pages still uncollected after this batch.
    pub remaining: u64,
}

/// A per-slot dirty bitmap, one bit per page.
///
/// Bits are flipped through shared references so collection can run
/// concurrently with guest execution.
#[derive(Debug)]
pub(crate) struct SlotBitmap {
    words: Box<[AtomicU64]>,
    pages: u64,
}

impl SlotBitmap {
    /// Returns a bitmap with every page bit set.
    pub fn new_all_dirty(pages: u64) -> Self {
        let full_words = (pages / 64) as usize;
        let tail_bits = pages % 64;
        let mut words = Vec::with_capacity(full_words + (tail_bits != 0) as usize);
        words.resize_with(full_words, || AtomicU64::new(!0));
        if tail_bits != 0 {
            words.push(AtomicU64::new((1 << tail_bits) - 1));
        }
        Self {
            words: words.into_boxed_slice(),
            pages,
        }
    }

    #[cfg(test)]
    pub fn test(&self, page: u64) -> bool {
        assert!(page < self.pages);
        self.words[(page / 64) as usize].load(Ordering::Relaxed) & (1 << (page % 64)) != 0
    }

    /// Sets the bit for `page`, returning whether it was newly set.
    pub fn set(&self, page: u64) -> bool {
        assert!(page < self.pages);
        let bit = 1 << (page % 64);
        self.words[(page / 64) as usize].fetch_or(bit, Ordering::Relaxed) & bit == 0
    }

    /// Clears the bit for `page`, returning whether it was set.
    pub fn clear(&self, page: u64) -> bool {
        assert!(page < self.pages);
        let bit = 1 << (page % 64);
        self.words[(page / 64) as usize].fetch_and(!bit, Ordering::Relaxed) & bit != 0
    }

    /// Returns the first set bit at or after `page`.
    pub fn next_set_from(&self, page: u64) -> Option<u64> {
        if page >= self.pages {
            return None;
        }
        let mut word = (page / 64) as usize;
        let mut bits = self.words[word].load(Ordering::Relaxed) & (!0u64 << (page % 64));
        loop {
            if bits != 0 {
                return Some(word as u64 * 64 + bits.trailing_zeros() as u64);
            }
            word += 1;
            if word >= self.words.len() {
                return None;
            }
            bits = self.words[word].load(Ordering::Relaxed);
        }
    }

    #[cfg(test)]
    pub fn count_ones(&self) -> u64 {
        self.words
            .iter()
            .map(|w| w.load(Ordering::Relaxed).count_ones() as u64)
            .sum()
    }
}

/// Returns the first dirty frame at or after `gfn`, across all slots.
pub(crate) fn next_dirty_gfn(memory: &MemoryState, gfn: u64) -> Option<u64> {
    let mut at = memory.slot_at_or_after(gfn)?;
    while at < memory.slots.len() {
        let slot = &memory.slots[at];
        if let Some(bitmap) = &slot.dirty {
            let from = gfn.saturating_sub(slot.base_gfn).min(slot.pages);
            if let Some(page) = bitmap.next_set_from(from) {
                return Some(slot.base_gfn + page);
            }
        }
        at += 1;
    }
    None
}

/// The extent of one consuming walk: `len` consecutive frames starting at
/// `start_gfn`, with `remaining` dirty pages left after it.
#[derive(Debug, PartialEq, Eq)]
pub(crate) struct DirtySpan {
    pub(crate) start_gfn: u64,
    pub(crate) len: usize,
    pub(crate) remaining: u64,
}

/// One consuming walk of the dirty log, taken with the slot lock held.
///
/// Anchors at the first dirty frame at or after `start_gfn`, then covers
/// consecutive frames (clearing their dirty bits, clean frames included)
/// until `max_entries` is reached, registered memory ends, or the next
/// dirty frame is further ahead than [`MAX_CLEAN_GAP`]. The caller
/// classifies the covered frames after dropping the lock.
pub(crate) fn consume(
    memory: &MemoryState,
    counter: &AtomicU64,
    start_gfn: u64,
    max_entries: usize,
) -> DirtySpan {
    let Some(anchor) = next_dirty_gfn(memory, start_gfn) else {
        return DirtySpan {
            start_gfn,
            len: 0,
            remaining: counter.load(Ordering::Relaxed),
        };
    };
    let mut len = 0;
    let mut cur = anchor;
    while len < max_entries {
        let Some(at) = memory.slot_for(cur) else {
            // A hole between slots ends the walk even inside the gap.
            break;
        };
        let slot = &memory.slots[at];
        if let Some(bitmap) = &slot.dirty {
            if bitmap.clear(cur - slot.base_gfn) {
                counter.fetch_sub(1, Ordering::Relaxed);
            }
        }
        len += 1;
        match next_dirty_gfn(memory, cur + 1) {
            None => break,
            Some(next) if next > cur + MAX_CLEAN_GAP => break,
            Some(_) => {}
        }
        cur += 1;
    }
    DirtySpan {
        start_gfn: anchor,
        len,
        remaining: counter.load(Ordering::Relaxed),
    }
}

/// Counts the consecutive registered frames starting at `start_gfn`,
/// stopping at the first hole. The non-destructive peek classifies this
/// many.
pub(crate) fn registered_span(memory: &MemoryState, start_gfn: u64, max_entries: usize) -> usize {
    let mut len = 0;
    while len < max_entries && memory.slot_for(start_gfn + len as u64).is_some() {
        len += 1;
    }
    len
}

impl SiePartition {
    /// Starts migration mode.
    ///
    /// Every registered page is marked dirty, the remaining counter is
    /// set to the total page count, and every vCPU switches classification
    /// updates to intercepted tracking.
    pub fn start_migration(&self) -> Result<(), MigrationError> {
        let inner = &self.inner;
        let mut memory = inner.memory.lock();
        if memory.migration {
            return Err(MigrationError::AlreadyActive);
        }
        if memory.slots.is_empty() {
            return Err(MigrationError::NoSlots);
        }
        for slot in &mut memory.slots {
            slot.dirty = Some(SlotBitmap::new_all_dirty(slot.pages));
        }
        let total = memory.total_pages();
        inner.dirty_pages.store(total, Ordering::Relaxed);
        memory.migration = true;
        drop(memory);
        inner.broadcast(WakeReason::MIGRATION_ON);
        tracing::info!(pages = total, "migration mode started");
        Ok(())
    }

    /// Stops migration mode.
    ///
    /// Idempotent. Bitmaps and the counter are left frozen so a later
    /// peek still sees the last collected state.
    pub fn stop_migration(&self) {
        let inner = &self.inner;
        let mut memory = inner.memory.lock();
        if !memory.migration {
            return;
        }
        memory.migration = false;
        drop(memory);
        inner.broadcast(WakeReason::MIGRATION_OFF);
        tracing::info!("migration mode stopped");
    }

    /// Returns whether migration mode is active and how many dirty pages
    /// remain.
    pub fn migration_status(&self) -> MigrationStatus {
        let inner = &self.inner;
        let memory = inner.memory.lock();
        MigrationStatus {
            active: memory.migration,
            dirty_pages: inner.dirty_pages.load(Ordering::Relaxed),
        }
    }

    /// Consumes up to `max_entries` pages of dirty state starting at
    /// `start_gfn`, clearing their dirty bits.
    pub fn consume_dirty(
        &self,
        start_gfn: u64,
        max_entries: usize,
    ) -> Result<DirtyBatch, DirtyLogError> {
        let inner = &self.inner;
        let span = {
            let memory = inner.memory.lock();
            if !memory.migration {
                return Err(DirtyLogError::NotStarted);
            }
            consume(&memory, &inner.dirty_pages, start_gfn, max_entries)
        };
        // Classify outside the slot lock; the classifier may block or call
        // back into the partition.
        let values = (0..span.len as u64)
            .map(|i| inner.classifier.classify(span.start_gfn + i) & USAGE_CLASS_MASK)
            .collect();
        Ok(DirtyBatch {
            start_gfn: span.start_gfn,
            values,
            remaining: span.remaining,
        })
    }

    /// Reads up to `max_entries` page classifications starting at
    /// `start_gfn` without clearing any dirty state.
    pub fn peek_dirty(&self, start_gfn: u64, max_entries: usize) -> DirtyBatch {
        let inner = &self.inner;
        let (len, remaining) = {
            let memory = inner.memory.lock();
            let len = registered_span(&memory, start_gfn, max_entries);
            let remaining = if memory.migration {
                inner.dirty_pages.load(Ordering::Relaxed)
            } else {
                0
            };
            (len, remaining)
        };
        let values = (0..len as u64)
            .map(|i| inner.classifier.classify(start_gfn + i) & USAGE_CLASS_MASK)
            .collect();
        DirtyBatch {
            start_gfn,
            values,
            remaining,
        }
    }

    /// Records that the guest changed the usage class of the page at
    /// frame `gfn`, marking it dirty again for migration.
    ///
    /// Called by intercepted-classification emulation. No-op when
    /// migration mode is off or the frame is outside registered memory.
    pub fn mark_dirty(&self, gfn: u64) {
        let inner = &self.inner;
        let memory = inner.memory.lock();
        if !memory.migration {
            return;
        }
        let Some(at) = memory.slot_for(gfn) else {
            return;
        };
        let slot = &memory.slots[at];
        if let Some(bitmap) = &slot.dirty {
            if bitmap.set(gfn - slot.base_gfn) {
                inner.dirty_pages.fetch_add(1, Ordering::Relaxed);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemorySlot;

    fn state(slots: &[(u64, u64)]) -> (MemoryState, AtomicU64) {
        let mut total = 0;
        let slots = slots
            .iter()
            .map(|&(base_gfn, pages)| {
                total += pages;
                MemorySlot {
                    base_gfn,
                    pages,
                    dirty: Some(SlotBitmap::new_all_dirty(pages)),
                }
            })
            .collect();
        (
            MemoryState {
                slots,
                migration: true,
            },
            AtomicU64::new(total),
        )
    }

    fn population(memory: &MemoryState) -> u64 {
        memory
            .slots
            .iter()
            .filter_map(|s| s.dirty.as_ref())
            .map(|b| b.count_ones())
            .sum()
    }

    #[test]
    fn bitmap_tail_is_masked() {
        let bitmap = SlotBitmap::new_all_dirty(70);
        assert_eq!(bitmap.count_ones(), 70);
        assert!(bitmap.test(69));
        assert_eq!(bitmap.next_set_from(64), Some(64));
        assert_eq!(bitmap.next_set_from(70), None);
        assert!(bitmap.clear(69));
        assert!(!bitmap.clear(69));
        assert_eq!(bitmap.next_set_from(69), None);
        assert!(bitmap.set(69));
        assert!(!bitmap.set(69));
    }

    #[test]
    fn next_set_scans_across_words() {
        let bitmap = SlotBitmap::new_all_dirty(256);
        for page in 0..200 {
            bitmap.clear(page);
        }
        assert_eq!(bitmap.next_set_from(0), Some(200));
        assert_eq!(bitmap.next_set_from(201), Some(201));
        bitmap.clear(255);
        assert_eq!(bitmap.next_set_from(255), None);
    }

    #[test]
    fn consume_anchors_at_first_dirty() {
        let (memory, counter) = state(&[(10, 100)]);
        let span = consume(&memory, &counter, 0, 10);
        assert_eq!(span.start_gfn, 10);
        assert_eq!(span.len, 10);
        assert_eq!(span.remaining, 90);
        assert_eq!(population(&memory), 90);
    }

    #[test]
    fn consume_collects_clean_pages_inside_a_short_gap() {
        let (memory, counter) = state(&[(0, 300)]);
        let bitmap = memory.slots[0].dirty.as_ref().unwrap();
        for page in 1..=50 {
            bitmap.clear(page);
            counter.fetch_sub(1, Ordering::Relaxed);
        }
        for page in 52..300 {
            bitmap.clear(page);
            counter.fetch_sub(1, Ordering::Relaxed);
        }
        // Dirty pages at 0 and 51; the gap is within scanning distance, so
        // one walk covers both and the clean pages between.
        let span = consume(&memory, &counter, 0, 100);
        assert_eq!(span.start_gfn, 0);
        assert_eq!(span.len, 52);
        assert_eq!(span.remaining, 0);
    }

    #[test]
    fn consume_stops_early_at_a_large_gap() {
        let (memory, counter) = state(&[(0, 400)]);
        let bitmap = memory.slots[0].dirty.as_ref().unwrap();
        for page in 1..300 {
            bitmap.clear(page);
            counter.fetch_sub(1, Ordering::Relaxed);
        }
        for page in 301..400 {
            bitmap.clear(page);
            counter.fetch_sub(1, Ordering::Relaxed);
        }
        // Dirty pages at 0 and 300: too far apart for one walk.
        let span = consume(&memory, &counter, 0, 100);
        assert_eq!(span.len, 1);
        assert_eq!(span.remaining, 1);
        let span = consume(&memory, &counter, 1, 100);
        assert_eq!(span.start_gfn, 300);
        assert_eq!(span.len, 1);
        assert_eq!(span.remaining, 0);
    }

    #[test]
    fn consume_does_not_cross_holes() {
        let (memory, counter) = state(&[(0, 10), (20, 10)]);
        let span = consume(&memory, &counter, 0, 100);
        assert_eq!(span.start_gfn, 0);
        assert_eq!(span.len, 10);
        assert_eq!(span.remaining, 10);
        let span = consume(&memory, &counter, 10, 100);
        assert_eq!(span.start_gfn, 20);
        assert_eq!(span.len, 10);
        assert_eq!(span.remaining, 0);
    }

    #[test]
    fn consume_walks_across_adjacent_slots() {
        let (memory, counter) = state(&[(0, 10), (10, 10)]);
        let span = consume(&memory, &counter, 0, 100);
        assert_eq!(span.len, 20);
        assert_eq!(span.remaining, 0);
        assert_eq!(population(&memory), 0);
    }

    #[test]
    fn counter_matches_population_throughout() {
        let (memory, counter) = state(&[(0, 64), (64, 70)]);
        let mut start = 0;
        loop {
            let span = consume(&memory, &counter, start, 7);
            assert_eq!(span.remaining, population(&memory));
            if span.remaining == 0 {
                break;
            }
            start = span.start_gfn + span.len as u64;
        }
        assert_eq!(counter.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn registered_spans_stop_at_holes() {
        let (memory, counter) = state(&[(0, 10), (20, 10)]);
        assert_eq!(registered_span(&memory, 0, 100), 10);
        assert_eq!(registered_span(&memory, 4, 3), 3);
        assert_eq!(registered_span(&memory, 25, 100), 5);
        // Outside registered memory nothing is covered, and the walk
        // disturbs no dirty state.
        assert_eq!(registered_span(&memory, 15, 5), 0);
        assert_eq!(population(&memory), 20);
        assert_eq!(counter.load(Ordering::Relaxed), 20);
    }

    #[test]
    fn consume_never_returns_a_page_dirty_twice_without_a_change() {
        let (memory, counter) = state(&[(0, 10)]);
        let span = consume(&memory, &counter, 0, 100);
        assert_eq!(span.len, 10);
        let span = consume(&memory, &counter, 0, 100);
        assert_eq!(span.len, 0);
        // A classification change re-dirties the page.
        let bitmap = memory.slots[0].dirty.as_ref().unwrap();
        assert!(bitmap.set(4));
        counter.fetch_add(1, Ordering::Relaxed);
        let span = consume(&memory, &counter, 0, 100);
        assert_eq!(span.start_gfn, 4);
        assert_eq!(span.len, 1);
        assert_eq!(span.remaining, 0);
    }
}

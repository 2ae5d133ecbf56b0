// Copyright (c) Microsoft Corporation.
// Licensed under the MIT License.

//! Guest memory slots, the pager seam, and prefix invalidation.
//!
//! The mapping layer outside this crate owns page contents and
//! translations. This module tracks only the slot geometry (needed to size
//! the migration bitmaps) and filters mapping-invalidation callbacks down
//! to the vCPUs whose prefix region is affected.

use crate::SiePartition;
use crate::SiePartitionInner;
use crate::VpIndex;
use crate::dirty::SlotBitmap;
use crate::requests::WakeReason;
use siedef::PAGE_SIZE;
use siedef::PREFIX_SIZE;
use std::sync::Arc;
use std::sync::Weak;
use thiserror::Error;

/// An error from the mapping layer.
#[derive(Debug, Error, Copy, Clone, PartialEq, Eq)]
pub enum PagerError {
    /// Resolution requires blocking and the caller asked for a
    /// non-blocking attempt.
    #[error("resolution would block")]
    WouldBlock,
    /// The operation lost a race with a concurrent invalidation and can
    /// be retried.
    #[error("lost a race with a concurrent invalidation")]
    Transient,
    /// The address cannot be mapped for the guest.
    #[error("unresolvable guest mapping")]
    Fatal,
}

/// The host-side shadow-mapping collaborator.
pub trait GuestPager: Send + Sync {
    /// Makes the page at `gpa` resident and mapped for the guest.
    ///
    /// With `can_block` false the implementation must not sleep; it fails
    /// with [`PagerError::WouldBlock`] when resolution would require I/O.
    fn resolve_fault(
        &self,
        vp: VpIndex,
        gpa: u64,
        write: bool,
        can_block: bool,
    ) -> Result<(), PagerError>;

    /// Maps `len` bytes of backing at guest address `gpa`.
    fn map_segment(&self, gpa: u64, len: u64) -> Result<(), PagerError>;

    /// Tears down the mapping of `len` bytes at guest address `gpa`.
    fn unmap_segment(&self, gpa: u64, len: u64);

    /// Breaks copy-on-write sharing of every guest page. Required before
    /// protected execution can be enabled.
    fn unshare_all(&self) -> Result<(), PagerError>;

    /// Invalidates the host mapping of a page that has moved into
    /// protected storage.
    fn invalidate_secure(&self, gpa: u64) -> Result<(), PagerError>;
}

/// A half-open range of guest absolute addresses.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct AddressRange {
    /// First byte of the range.
    pub start: u64,
    /// One past the last byte.
    pub end: u64,
}

impl AddressRange {
    /// Returns whether the two ranges share any byte.
    pub fn overlaps(&self, other: &Self) -> bool {
        self.start < other.end && other.start < self.end
    }
}

/// An error registering or removing a memory slot.
#[derive(Debug, Error)]
pub enum MemorySlotError {
    /// The slot has no pages.
    #[error("slot has no pages")]
    Empty,
    /// The slot extends beyond the guest address space.
    #[error("slot exceeds the guest address space")]
    OutOfRange,
    /// The slot overlaps an already-registered slot.
    #[error("slot overlaps an existing slot")]
    Overlap,
    /// No slot is registered at the given base.
    #[error("no slot registered at this base")]
    NotFound,
    /// The slot table is frozen while migration is collecting dirty
    /// state.
    #[error("slot table is frozen during migration")]
    MigrationActive,
    /// The mapping layer rejected the slot.
    #[error("mapping the slot failed")]
    Map(#[source] PagerError),
}

/// One registered guest memory slot.
#[derive(Debug)]
pub(crate) struct MemorySlot {
    /// First guest page frame of the slot.
    pub base_gfn: u64,
    /// Number of pages in the slot.
    pub pages: u64,
    /// Migration bitmap, present once migration has been started.
    pub dirty: Option<SlotBitmap>,
}

impl MemorySlot {
    pub fn end_gfn(&self) -> u64 {
        self.base_gfn + self.pages
    }
}

/// The slot table. Slots are kept sorted by base frame and never overlap.
#[derive(Debug)]
pub(crate) struct MemoryState {
    pub slots: Vec<MemorySlot>,
    /// Whether migration mode is collecting dirty state.
    pub migration: bool,
}

impl MemoryState {
    pub fn new() -> Self {
        Self {
            slots: Vec::new(),
            migration: false,
        }
    }

    pub fn insert(&mut self, base_gfn: u64, pages: u64) -> Result<(), MemorySlotError> {
        if pages == 0 {
            return Err(MemorySlotError::Empty);
        }
        let end_gfn = base_gfn.checked_add(pages).ok_or(MemorySlotError::OutOfRange)?;
        let at = self.slots.partition_point(|s| s.base_gfn < base_gfn);
        if at > 0 && self.slots[at - 1].end_gfn() > base_gfn {
            return Err(MemorySlotError::Overlap);
        }
        if let Some(next) = self.slots.get(at) {
            if next.base_gfn < end_gfn {
                return Err(MemorySlotError::Overlap);
            }
        }
        self.slots.insert(
            at,
            MemorySlot {
                base_gfn,
                pages,
                dirty: None,
            },
        );
        Ok(())
    }

    pub fn remove(&mut self, base_gfn: u64) -> Result<MemorySlot, MemorySlotError> {
        let at = self
            .slots
            .iter()
            .position(|s| s.base_gfn == base_gfn)
            .ok_or(MemorySlotError::NotFound)?;
        Ok(self.slots.remove(at))
    }

    /// Returns the index of the slot containing `gfn`, if any.
    pub fn slot_for(&self, gfn: u64) -> Option<usize> {
        let at = self.slots.partition_point(|s| s.base_gfn <= gfn);
        at.checked_sub(1)
            .filter(|&i| gfn < self.slots[i].end_gfn())
    }

    /// Returns the index of the first slot containing or starting after
    /// `gfn`.
    pub fn slot_at_or_after(&self, gfn: u64) -> Option<usize> {
        match self.slot_for(gfn) {
            Some(i) => Some(i),
            None => {
                let at = self.slots.partition_point(|s| s.base_gfn <= gfn);
                (at < self.slots.len()).then_some(at)
            }
        }
    }

    pub fn total_pages(&self) -> u64 {
        self.slots.iter().map(|s| s.pages).sum()
    }
}

/// Callback handle the embedder's mapping layer invokes when guest
/// translations are torn down.
pub struct MemoryInvalidateClient {
    inner: Weak<SiePartitionInner>,
}

impl MemoryInvalidateClient {
    /// Notifies the engine that guest mappings in `range` were
    /// invalidated.
    ///
    /// Any vCPU whose two-page prefix region intersects the range must
    /// re-validate the prefix mapping before its next hardware entry; a
    /// refresh request is posted to exactly those vCPUs.
    pub fn on_invalidate(&self, range: AddressRange) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        for vp in inner.vps.read().iter() {
            let prefix = *vp.prefix.read();
            // The aligned prefix may sit flush against the top of the
            // address space.
            let prefix_range = AddressRange {
                start: prefix,
                end: prefix.saturating_add(PREFIX_SIZE),
            };
            if range.overlaps(&prefix_range) {
                tracing::debug!(
                    vp = vp.index.index(),
                    prefix,
                    "prefix mapping invalidated"
                );
                inner.post(vp, WakeReason::REFRESH_PREFIX);
            }
        }
    }
}

impl SiePartition {
    /// Returns the callback handle for mapping-invalidation
    /// notifications.
    pub fn invalidate_client(&self) -> MemoryInvalidateClient {
        MemoryInvalidateClient {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Registers `pages` pages of guest memory starting at frame
    /// `base_gfn` and maps the backing segment.
    pub fn add_memory_slot(&self, base_gfn: u64, pages: u64) -> Result<(), MemorySlotError> {
        let inner = &self.inner;
        let gpa = base_gfn
            .checked_mul(PAGE_SIZE)
            .ok_or(MemorySlotError::OutOfRange)?;
        let len = pages
            .checked_mul(PAGE_SIZE)
            .ok_or(MemorySlotError::OutOfRange)?;
        gpa.checked_add(len).ok_or(MemorySlotError::OutOfRange)?;
        let mut memory = inner.memory.lock();
        if memory.migration {
            return Err(MemorySlotError::MigrationActive);
        }
        memory.insert(base_gfn, pages)?;
        if let Err(err) = inner.pager.map_segment(gpa, len) {
            memory.remove(base_gfn).ok();
            return Err(MemorySlotError::Map(err));
        }
        tracing::debug!(base_gfn, pages, "memory slot added");
        Ok(())
    }

    /// Removes the slot registered at `base_gfn` and unmaps its backing.
    pub fn remove_memory_slot(&self, base_gfn: u64) -> Result<(), MemorySlotError> {
        let inner = &self.inner;
        let mut memory = inner.memory.lock();
        if memory.migration {
            return Err(MemorySlotError::MigrationActive);
        }
        let slot = memory.remove(base_gfn)?;
        inner
            .pager
            .unmap_segment(slot.base_gfn * PAGE_SIZE, slot.pages * PAGE_SIZE);
        tracing::debug!(base_gfn, pages = slot.pages, "memory slot removed");
        Ok(())
    }
}

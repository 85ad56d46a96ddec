// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Backing-store seam for evicted user pages
//! OWNERS: @kernel-mm-team
//! PUBLIC API: SwapSlot, BackingStore, MemoryBackingStore
//! DEPENDS_ON: parking_lot (host store)
//! INVARIANTS: A reserved slot belongs to exactly one page table entry until released

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

use parking_lot::Mutex;

use crate::error::{Result, VmError};
use crate::types::PAGE_SIZE;

/// Page-sized slot in the backing store.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SwapSlot(pub u32);

/// Page-granular storage for evicted frames.
///
/// Calls may block; the VM never invokes them while holding an address-space
/// or frame-table lock.
pub trait BackingStore: Send + Sync {
    /// Claims a free slot. Fails with [`VmError::OutOfMemory`] when full.
    fn reserve_slot(&self) -> Result<SwapSlot>;
    fn release_slot(&self, slot: SwapSlot);
    /// Fills `buf` (one page) from `slot`.
    fn read_page(&self, slot: SwapSlot, buf: &mut [u8]) -> Result<()>;
    /// Stores one page into `slot`.
    fn write_page(&self, slot: SwapSlot, data: &[u8]) -> Result<()>;
}

impl<T: BackingStore + ?Sized> BackingStore for Arc<T> {
    fn reserve_slot(&self) -> Result<SwapSlot> {
        (**self).reserve_slot()
    }

    fn release_slot(&self, slot: SwapSlot) {
        (**self).release_slot(slot)
    }

    fn read_page(&self, slot: SwapSlot, buf: &mut [u8]) -> Result<()> {
        (**self).read_page(slot, buf)
    }

    fn write_page(&self, slot: SwapSlot, data: &[u8]) -> Result<()> {
        (**self).write_page(slot, data)
    }
}

struct SlotMap {
    free: BTreeSet<u32>,
    pages: HashMap<u32, Box<[u8]>>,
}

/// Bounded in-memory backing store.
pub struct MemoryBackingStore {
    capacity: usize,
    slots: Mutex<SlotMap>,
}

impl MemoryBackingStore {
    pub fn new(capacity: usize) -> Self {
        let free = (0..capacity as u32).collect();
        Self { capacity, slots: Mutex::new(SlotMap { free, pages: HashMap::new() }) }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Slots currently reserved.
    pub fn in_use(&self) -> usize {
        self.capacity - self.slots.lock().free.len()
    }
}

impl BackingStore for MemoryBackingStore {
    fn reserve_slot(&self) -> Result<SwapSlot> {
        let mut slots = self.slots.lock();
        let slot = slots.free.pop_first().ok_or(VmError::OutOfMemory)?;
        Ok(SwapSlot(slot))
    }

    fn release_slot(&self, slot: SwapSlot) {
        let mut slots = self.slots.lock();
        slots.pages.remove(&slot.0);
        let fresh = slots.free.insert(slot.0);
        debug_assert!(fresh, "swap slot {} released twice", slot.0);
    }

    fn read_page(&self, slot: SwapSlot, buf: &mut [u8]) -> Result<()> {
        if buf.len() != PAGE_SIZE {
            return Err(VmError::InvalidArgument);
        }
        let slots = self.slots.lock();
        if slots.free.contains(&slot.0) || slot.0 as usize >= self.capacity {
            return Err(VmError::Io);
        }
        match slots.pages.get(&slot.0) {
            Some(page) => buf.copy_from_slice(page),
            None => buf.fill(0),
        }
        Ok(())
    }

    fn write_page(&self, slot: SwapSlot, data: &[u8]) -> Result<()> {
        if data.len() != PAGE_SIZE {
            return Err(VmError::InvalidArgument);
        }
        let mut slots = self.slots.lock();
        if slots.free.contains(&slot.0) || slot.0 as usize >= self.capacity {
            return Err(VmError::Io);
        }
        slots.pages.insert(slot.0, data.into());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reserve_until_full() {
        let store = MemoryBackingStore::new(2);
        let a = store.reserve_slot().unwrap();
        let b = store.reserve_slot().unwrap();
        assert_ne!(a, b);
        assert_eq!(store.reserve_slot(), Err(VmError::OutOfMemory));
        store.release_slot(a);
        assert_eq!(store.reserve_slot(), Ok(a));
        assert_eq!(store.in_use(), 2);
    }

    #[test]
    fn pages_round_trip() {
        let store = MemoryBackingStore::new(1);
        let slot = store.reserve_slot().unwrap();
        let mut page = vec![0u8; PAGE_SIZE];
        page[17] = 0x5a;
        store.write_page(slot, &page).unwrap();
        let mut back = vec![0u8; PAGE_SIZE];
        store.read_page(slot, &mut back).unwrap();
        assert_eq!(back, page);
    }

    #[test]
    fn unreserved_slots_are_io_errors() {
        let store = MemoryBackingStore::new(1);
        let mut buf = vec![0u8; PAGE_SIZE];
        assert_eq!(store.read_page(SwapSlot(0), &mut buf), Err(VmError::Io));
        assert_eq!(store.write_page(SwapSlot(5), &buf), Err(VmError::Io));
    }
}

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Per-address-space list of virtual-to-physical page mappings.

extern crate alloc;

use alloc::vec::Vec;

use bitflags::bitflags;

use crate::swap::SwapSlot;
use crate::types::{FrameIndex, VirtAddr};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// Paging state of a page table entry.
    pub struct PteFlags: u8 {
        /// A page-in or eviction is in flight; other threads must wait.
        const LOCKED = 1 << 0;
        /// The backing store holds a copy of this page.
        const ONDISK = 1 << 1;
    }
}

/// Mapping for one virtual page.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PageTableEntry {
    pub vaddr: VirtAddr,
    /// Backing frame; `None` while the page is not resident.
    pub frame: Option<FrameIndex>,
    pub flags: PteFlags,
    pub swap_slot: Option<SwapSlot>,
}

impl PageTableEntry {
    pub fn new(vaddr: VirtAddr, frame: Option<FrameIndex>) -> Self {
        Self { vaddr: vaddr.page(), frame, flags: PteFlags::empty(), swap_slot: None }
    }

    pub fn is_locked(&self) -> bool {
        self.flags.contains(PteFlags::LOCKED)
    }

    pub fn is_resident(&self) -> bool {
        self.frame.is_some()
    }

    pub fn is_on_disk(&self) -> bool {
        self.flags.contains(PteFlags::ONDISK)
    }
}

/// Unordered collection of page mappings; entry order carries no meaning.
#[derive(Clone, Debug, Default)]
pub struct PageTable {
    entries: Vec<PageTableEntry>,
}

impl PageTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Looks up the entry for the page containing `vaddr`.
    pub fn get(&self, vaddr: VirtAddr) -> Option<&PageTableEntry> {
        let page = vaddr.page();
        self.entries.iter().find(|entry| entry.vaddr == page)
    }

    pub fn get_mut(&mut self, vaddr: VirtAddr) -> Option<&mut PageTableEntry> {
        let page = vaddr.page();
        self.entries.iter_mut().find(|entry| entry.vaddr == page)
    }

    /// Appends a mapping for the page containing `vaddr`.
    pub fn insert(&mut self, vaddr: VirtAddr, frame: Option<FrameIndex>) -> &mut PageTableEntry {
        debug_assert!(self.get(vaddr).is_none(), "duplicate page table entry");
        self.entries.push(PageTableEntry::new(vaddr, frame));
        let last = self.entries.len() - 1;
        &mut self.entries[last]
    }

    /// Drops the entry for `vaddr`, returning it.
    pub fn remove(&mut self, vaddr: VirtAddr) -> Option<PageTableEntry> {
        let page = vaddr.page();
        let index = self.entries.iter().position(|entry| entry.vaddr == page)?;
        Some(self.entries.swap_remove(index))
    }

    pub fn iter(&self) -> impl Iterator<Item = &PageTableEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn resident_count(&self) -> usize {
        self.entries.iter().filter(|entry| entry.is_resident()).count()
    }

    pub(crate) fn any_locked(&self) -> bool {
        self.entries.iter().any(PageTableEntry::is_locked)
    }

    pub(crate) fn drain(&mut self) -> impl Iterator<Item = PageTableEntry> + '_ {
        self.entries.drain(..)
    }
}

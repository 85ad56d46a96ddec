// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-process address space: regions, page table, heap/stack bounds, wait channel
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: AddressSpace, AddressSpaceState, Region, RegionPerm
//! DEPENDS_ON: mm::page_table, parking_lot (state lock + paging wait channel)
//! INVARIANTS: Regions are page aligned and never overlap; a live space has at least one
//!             region with non-zero base and length once the loader has run

extern crate alloc;

use alloc::vec::Vec;

use bitflags::bitflags;
use parking_lot::{Condvar, Mutex, MutexGuard};

use super::page_table::PageTable;
use crate::error::{Result, VmError};
use crate::types::{page_align_down, AsId, VirtAddr, PAGE_FRAME, PAGE_SIZE};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
    /// Access permissions of a region (ELF `p_flags` numbering).
    pub struct RegionPerm: u8 {
        const EXECUTE = 1 << 0;
        const WRITE = 1 << 1;
        const READ = 1 << 2;
    }
}

impl RegionPerm {
    pub fn from_bools(readable: bool, writable: bool, executable: bool) -> Self {
        let mut perm = RegionPerm::empty();
        perm.set(RegionPerm::READ, readable);
        perm.set(RegionPerm::WRITE, writable);
        perm.set(RegionPerm::EXECUTE, executable);
        perm
    }
}

/// A page-aligned virtual range with one permission set.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Region {
    pub base: VirtAddr,
    pub len: usize,
    /// Permission enforced right now.
    pub active: RegionPerm,
    /// Permission the loader asked for; restored by `complete_load`.
    pub backup: RegionPerm,
}

impl Region {
    pub fn end(&self) -> usize {
        self.base.raw().saturating_add(self.len)
    }

    pub fn contains(&self, vaddr: VirtAddr) -> bool {
        vaddr.raw() >= self.base.raw() && vaddr.raw() < self.end()
    }
}

/// Mutable layout of an address space, guarded by [`AddressSpace::lock`].
#[derive(Clone, Debug)]
pub struct AddressSpaceState {
    pub regions: Vec<Region>,
    pub page_table: PageTable,
    pub heap_start: usize,
    pub heap_end: usize,
    pub stack_end: usize,
    stack_pages: usize,
}

impl AddressSpaceState {
    fn new(stack_top: usize, stack_pages: usize) -> Self {
        Self {
            regions: Vec::new(),
            page_table: PageTable::new(),
            heap_start: 0,
            heap_end: 0,
            stack_end: stack_top,
            stack_pages,
        }
    }

    /// Adds a region covering `[vaddr, vaddr + size)` and moves the heap after it.
    ///
    /// A range that wraps the address space or overlaps an existing region is
    /// `InvalidArgument`.
    pub fn define_region(&mut self, vaddr: usize, size: usize, perm: RegionPerm) -> Result<Region> {
        let base = page_align_down(vaddr);
        let end = vaddr
            .checked_add(size)
            .and_then(|end| end.checked_add(PAGE_SIZE - 1))
            .map(|end| end & PAGE_FRAME)
            .ok_or(VmError::InvalidArgument)?;
        if let Some(other) = self.regions.iter().find(|region| base < region.end() && region.base.raw() < end) {
            log::warn!(target: "mm", "region {:#x}..{:#x} overlaps {:#x}..{:#x}", base, end, other.base, other.end());
            return Err(VmError::InvalidArgument);
        }
        let region = Region { base: VirtAddr::new(base), len: end - base, active: perm, backup: perm };
        self.regions.push(region);
        self.heap_start = end;
        self.heap_end = end;
        log::debug!(target: "mm", "region {:#x}..{:#x} perm={:?}", base, end, perm);
        Ok(region)
    }

    /// Opens every region for writing while the loader fills it.
    pub fn prepare_load(&mut self) {
        assert!(!self.regions.is_empty(), "prepare_load: address space has no regions");
        for region in &mut self.regions {
            region.active = RegionPerm::READ | RegionPerm::WRITE;
        }
    }

    /// Restores the permissions the loader defined.
    pub fn complete_load(&mut self) {
        assert!(!self.regions.is_empty(), "complete_load: address space has no regions");
        for region in &mut self.regions {
            region.active = region.backup;
        }
    }

    /// Fixes the initial user stack pointer.
    pub fn define_stack(&mut self) -> VirtAddr {
        VirtAddr::new(self.stack_end)
    }

    /// Lowest address of the implicit stack window.
    pub fn stack_base(&self) -> usize {
        self.stack_end - self.stack_pages * PAGE_SIZE
    }

    /// Asserts the layout a running process must have.
    pub fn check_invariants(&self) {
        assert!(!self.regions.is_empty(), "address space has no regions");
        for region in &self.regions {
            assert!(region.base.raw() != 0, "region at address zero");
            assert!(region.len != 0, "zero-length region at {:#x}", region.base);
        }
        assert!(self.heap_start != 0, "heap start unset");
        assert!(self.heap_end != 0, "heap end unset");
        assert!(self.stack_end != 0, "stack bound unset");
    }

    /// Permission governing `vaddr`: its region, or read/write inside the stack window.
    pub fn classify(&self, vaddr: VirtAddr) -> Option<RegionPerm> {
        if let Some(region) = self.regions.iter().find(|region| region.contains(vaddr)) {
            return Some(region.active);
        }
        if vaddr.raw() >= self.stack_base() && vaddr.raw() < self.stack_end {
            return Some(RegionPerm::READ | RegionPerm::WRITE);
        }
        None
    }
}

/// One process's virtual memory.
pub struct AddressSpace {
    id: AsId,
    state: Mutex<AddressSpaceState>,
    paging: Condvar,
}

impl AddressSpace {
    pub(crate) fn new(id: AsId, stack_top: usize, stack_pages: usize) -> Self {
        Self { id, state: Mutex::new(AddressSpaceState::new(stack_top, stack_pages)), paging: Condvar::new() }
    }

    pub fn id(&self) -> AsId {
        self.id
    }

    pub fn lock(&self) -> MutexGuard<'_, AddressSpaceState> {
        self.state.lock()
    }

    /// Sleeps on the paging wait channel, releasing `guard` meanwhile.
    pub(crate) fn wait(&self, guard: &mut MutexGuard<'_, AddressSpaceState>) {
        self.paging.wait(guard);
    }

    /// Wakes every thread waiting for a page of this space.
    pub(crate) fn wake_all(&self) {
        self.paging.notify_all();
    }

    pub fn define_region(
        &self,
        vaddr: usize,
        size: usize,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Result<Region> {
        self.lock().define_region(vaddr, size, RegionPerm::from_bools(readable, writable, executable))
    }

    pub fn prepare_load(&self) {
        self.lock().prepare_load();
    }

    pub fn complete_load(&self) {
        self.lock().complete_load();
    }

    pub fn define_stack(&self) -> VirtAddr {
        self.lock().define_stack()
    }

    pub fn check_invariants(&self) {
        self.lock().check_invariants();
    }
}

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: VM context: frame table, address-space registry, CPUs and backing store
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: Vm (create, copy, destroy, activate, fault, copy_in/copy_out)
//! DEPENDS_ON: mm::*, tlb, swap, parking_lot::RwLock (registry)
//! INVARIANTS: Lock order is address space -> frame table / TLB / swap;
//!             at most one address-space lock is held at a time;
//!             no address-space lock is held across frame allocation or swap I/O
//!
//! Address spaces are owned by the registry and referred to by [`AsId`]. A
//! frame's back-reference is that id, so an evictor that races with
//! `destroy` simply fails the lookup and discards the frame.

mod fault;
mod pager;
mod user;

pub use fault::FaultKind;

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::RwLock;

use crate::config::{ConfigError, VmConfig};
use crate::error::{Result, VmError};
use crate::mm::{AddressSpace, FrameState, FrameTable, Region};
use crate::swap::BackingStore;
use crate::tlb::{self, Cpu};
use crate::types::{AsId, CpuId, VirtAddr};

/// Shared state of the virtual memory subsystem.
pub struct Vm {
    config: VmConfig,
    frames: FrameTable,
    spaces: RwLock<BTreeMap<AsId, Arc<AddressSpace>>>,
    cpus: Vec<Cpu>,
    swap: Box<dyn BackingStore>,
    next_id: AtomicU64,
}

static_assertions::assert_impl_all!(Vm: Send, Sync);

impl Vm {
    /// Boots the frame table over `config.ram_bytes` and brings up every CPU.
    pub fn new(config: VmConfig, swap: Box<dyn BackingStore>) -> core::result::Result<Self, ConfigError> {
        config.validate()?;
        let frames = FrameTable::bootstrap(config.ram_range(), config.victim_seed);
        let cpus = (0..config.cpus).map(|id| Cpu::new(CpuId(id), config.tlb_slots)).collect();
        Ok(Self {
            config,
            frames,
            spaces: RwLock::new(BTreeMap::new()),
            cpus,
            swap,
            next_id: AtomicU64::new(1),
        })
    }

    pub fn config(&self) -> &VmConfig {
        &self.config
    }

    pub fn frames(&self) -> &FrameTable {
        &self.frames
    }

    pub fn cpus(&self) -> &[Cpu] {
        &self.cpus
    }

    pub fn cpu(&self, id: CpuId) -> &Cpu {
        match self.cpus.get(id.0) {
            Some(cpu) => cpu,
            None => panic!("no cpu {}", id.0),
        }
    }

    pub fn swap(&self) -> &dyn BackingStore {
        self.swap.as_ref()
    }

    /// Makes an empty address space.
    pub fn create(&self) -> AsId {
        let id = AsId::from_raw(self.next_id.fetch_add(1, Ordering::Relaxed));
        let space = Arc::new(AddressSpace::new(id, self.config.user_stack_top, self.config.stack_pages));
        self.spaces.write().insert(id, space);
        log::trace!(target: "vm", "created {}", id);
        id
    }

    pub fn space(&self, id: AsId) -> Option<Arc<AddressSpace>> {
        self.spaces.read().get(&id).cloned()
    }

    /// Ids of every live address space.
    pub fn space_ids(&self) -> Vec<AsId> {
        self.spaces.read().keys().copied().collect()
    }

    fn live(&self, id: AsId) -> Result<Arc<AddressSpace>> {
        self.space(id).ok_or(VmError::BadAddress)
    }

    pub fn define_region(
        &self,
        id: AsId,
        vaddr: usize,
        size: usize,
        readable: bool,
        writable: bool,
        executable: bool,
    ) -> Result<Region> {
        self.live(id)?.define_region(vaddr, size, readable, writable, executable)
    }

    pub fn prepare_load(&self, id: AsId) -> Result<()> {
        self.live(id)?.prepare_load();
        Ok(())
    }

    pub fn complete_load(&self, id: AsId) -> Result<()> {
        self.live(id)?.complete_load();
        Ok(())
    }

    pub fn define_stack(&self, id: AsId) -> Result<VirtAddr> {
        Ok(self.live(id)?.define_stack())
    }

    /// Flushes `cpu`'s translation cache for a newly current address space.
    pub fn activate(&self, cpu: CpuId) {
        self.cpu(cpu).activate();
    }

    /// Duplicates `old` into a new address space with private copies of every page.
    ///
    /// On any failure the partial copy is torn down and `OutOfMemory` returned;
    /// `old` is left as it was.
    pub fn copy(&self, old: AsId) -> Result<AsId> {
        let source = self.live(old)?;
        let id = self.create();
        match self.copy_into(&source, id) {
            Ok(pages) => {
                log::debug!(target: "vm", "copied {} into {} ({} pages)", old, id, pages);
                Ok(id)
            }
            Err(err) => {
                log::warn!(target: "vm", "copy of {} failed: {}", old, err);
                self.destroy(id);
                Err(VmError::OutOfMemory)
            }
        }
    }

    fn copy_into(&self, source: &AddressSpace, id: AsId) -> Result<usize> {
        let target = self.live(id)?;
        let pages: Vec<VirtAddr> = {
            let from = source.lock();
            let regions = from.regions.clone();
            let (heap_start, heap_end, stack_end) = (from.heap_start, from.heap_end, from.stack_end);
            let pages = from.page_table.iter().map(|pte| pte.vaddr).collect();
            drop(from);
            let mut to = target.lock();
            to.regions = regions;
            to.heap_start = heap_start;
            to.heap_end = heap_end;
            to.stack_end = stack_end;
            pages
        };

        let mut copied = 0;
        for page in pages {
            let Some(bytes) = self.snapshot_page(source, page)? else {
                continue;
            };
            let frame = self.allocate_one_for_user(id, page)?;
            self.frames.write_page(frame, &bytes);
            let mut to = target.lock();
            to.page_table.insert(page, Some(frame));
            self.frames.unpin(frame, FrameState::Dirty);
            copied += 1;
        }
        Ok(copied)
    }

    /// Tears down `id`: frames, swap slots, regions, registry entry.
    ///
    /// Waits for in-flight page-ins and evictions of the space to finish first.
    pub fn destroy(&self, id: AsId) {
        let Some(space) = self.space(id) else {
            log::warn!(target: "vm", "destroy of unknown {}", id);
            return;
        };
        let mut slots = Vec::new();
        let mut freed = 0;
        {
            let mut state = space.lock();
            while state.page_table.any_locked() {
                space.wait(&mut state);
            }
            for mut pte in state.page_table.drain() {
                if self.release_one(id, &mut pte) {
                    freed += 1;
                }
                slots.extend(pte.swap_slot);
            }
            state.regions.clear();
        }
        for slot in slots {
            self.swap.release_slot(slot);
        }
        self.spaces.write().remove(&id);
        space.wake_all();
        log::debug!(target: "vm", "destroyed {} ({} frames freed)", id, freed);
    }

    /// Removes `vaddr` from every CPU's translation cache.
    ///
    /// A CPU that cannot acknowledge leaves a stale mapping behind, which is
    /// unrecoverable.
    pub fn shootdown(&self, vaddr: VirtAddr) {
        if let Err(err) = tlb::shootdown(&self.cpus, vaddr) {
            panic!("tlb shootdown of {:#x} failed: {}", vaddr, err);
        }
    }

    /// Frames above the reserved boundary that are not free.
    pub fn frames_in_use(&self) -> usize {
        let boundary = self.frames.first_dynamic().0;
        self.frames.states()[boundary..]
            .iter()
            .filter(|state| **state != FrameState::Free)
            .count()
    }

    /// Resident pages summed over every live address space.
    pub fn resident_pages(&self) -> usize {
        let spaces: Vec<_> = self.spaces.read().values().cloned().collect();
        spaces.iter().map(|space| space.lock().page_table.resident_count()).sum()
    }
}

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Software-managed translation caches, one per simulated CPU
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: Cpu, Tlb, TlbEntry, TlbLo, SplGuard, shootdown, ShootdownError
//! DEPENDS_ON: spin::Mutex (per-CPU cache lock), bitflags
//! INVARIANTS: Slots are only written with interrupts raised to splhigh;
//!             a shoot-down returns only after every CPU dropped the mapping
//!
//! Entry layout follows the MIPS r3000: `hi` holds the virtual page number,
//! `lo` the physical frame number plus VALID and DIRTY (write-enable) bits.
//! Invalid slots hold distinct kseg1 page numbers so no two slots ever match.

use core::sync::atomic::{AtomicBool, AtomicU8, Ordering};

use bitflags::bitflags;
use spin::{Mutex, MutexGuard};
use thiserror::Error;

use crate::types::{CpuId, PhysAddr, VirtAddr, PAGE_FRAME, PAGE_SIZE};

bitflags! {
    #[derive(Clone, Copy, Debug, PartialEq, Eq)]
    pub struct TlbLo: u32 {
        /// Writes allowed (MIPS calls the write-enable bit "dirty").
        const DIRTY = 0x0000_0400;
        const VALID = 0x0000_0200;
    }
}

/// Value of `hi` for invalid slot `slot`.
#[inline]
pub const fn tlbhi_invalid(slot: usize) -> u32 {
    ((0x80000 + slot) << 12) as u32
}

/// One translation-cache slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TlbEntry {
    pub hi: u32,
    pub lo: u32,
}

impl TlbEntry {
    pub const fn invalid(slot: usize) -> Self {
        Self { hi: tlbhi_invalid(slot), lo: 0 }
    }

    pub fn mapping(vaddr: VirtAddr, paddr: PhysAddr, writable: bool) -> Self {
        let mut flags = TlbLo::VALID;
        flags.set(TlbLo::DIRTY, writable);
        Self { hi: (vaddr.raw() & PAGE_FRAME) as u32, lo: (paddr.raw() & PAGE_FRAME) as u32 | flags.bits() }
    }

    pub fn flags(&self) -> TlbLo {
        TlbLo::from_bits_truncate(self.lo)
    }

    pub fn is_valid(&self) -> bool {
        self.flags().contains(TlbLo::VALID)
    }

    pub fn is_writable(&self) -> bool {
        self.flags().contains(TlbLo::DIRTY)
    }

    pub fn paddr(&self) -> PhysAddr {
        PhysAddr::new(self.lo as usize & PAGE_FRAME)
    }
}

/// A fully associative translation cache.
pub struct Tlb {
    slots: Vec<TlbEntry>,
}

impl Tlb {
    pub fn new(slots: usize) -> Self {
        Self { slots: (0..slots).map(TlbEntry::invalid).collect() }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    pub fn read(&self, slot: usize) -> TlbEntry {
        self.slots[slot]
    }

    pub fn write(&mut self, entry: TlbEntry, slot: usize) {
        self.slots[slot] = entry;
    }

    /// Slot whose `hi` matches the page of `vaddr`.
    pub fn probe(&self, vaddr: VirtAddr) -> Option<usize> {
        let hi = (vaddr.raw() & PAGE_FRAME) as u32;
        self.slots.iter().position(|entry| entry.hi == hi)
    }

    pub fn invalidate(&mut self, slot: usize) {
        self.slots[slot] = TlbEntry::invalid(slot);
    }

    pub fn invalidate_all(&mut self) {
        for slot in 0..self.slots.len() {
            self.invalidate(slot);
        }
    }

    pub fn first_invalid(&self) -> Option<usize> {
        self.slots.iter().position(|entry| !entry.is_valid())
    }

    pub fn valid_count(&self) -> usize {
        self.slots.iter().filter(|entry| entry.is_valid()).count()
    }
}

const IPL_NONE: u8 = 0;
const IPL_HIGH: u8 = 1;

/// A simulated processor: its translation cache and interrupt priority level.
pub struct Cpu {
    id: CpuId,
    tlb: Mutex<Tlb>,
    ipl: AtomicU8,
    online: AtomicBool,
}

/// Restores the previous interrupt level on drop.
pub struct SplGuard<'a> {
    cpu: &'a Cpu,
    previous: u8,
}

impl Drop for SplGuard<'_> {
    fn drop(&mut self) {
        self.cpu.ipl.store(self.previous, Ordering::Release);
    }
}

impl Cpu {
    pub fn new(id: CpuId, tlb_slots: usize) -> Self {
        Self { id, tlb: Mutex::new(Tlb::new(tlb_slots)), ipl: AtomicU8::new(IPL_NONE), online: AtomicBool::new(true) }
    }

    pub fn id(&self) -> CpuId {
        self.id
    }

    /// Raises the interrupt level so nothing preempts a slot update.
    pub fn splhigh(&self) -> SplGuard<'_> {
        let previous = self.ipl.swap(IPL_HIGH, Ordering::AcqRel);
        SplGuard { cpu: self, previous }
    }

    pub fn interrupts_enabled(&self) -> bool {
        self.ipl.load(Ordering::Acquire) == IPL_NONE
    }

    pub fn tlb(&self) -> MutexGuard<'_, Tlb> {
        self.tlb.lock()
    }

    pub fn is_online(&self) -> bool {
        self.online.load(Ordering::Acquire)
    }

    /// Stops the CPU from answering shoot-down requests.
    pub fn set_online(&self, online: bool) {
        self.online.store(online, Ordering::Release);
    }

    /// Drops every mapping; done when a new address space becomes current.
    pub fn activate(&self) {
        let _spl = self.splhigh();
        self.tlb().invalidate_all();
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum ShootdownError {
    #[error("cpu {0:?} did not acknowledge the shoot-down")]
    Unacknowledged(CpuId),
}

/// Removes the mapping for `vaddr` from every CPU and waits for each to confirm.
pub fn shootdown(cpus: &[Cpu], vaddr: VirtAddr) -> Result<(), ShootdownError> {
    for cpu in cpus {
        if !cpu.is_online() {
            return Err(ShootdownError::Unacknowledged(cpu.id()));
        }
        let _spl = cpu.splhigh();
        let mut tlb = cpu.tlb();
        if let Some(slot) = tlb.probe(vaddr) {
            tlb.invalidate(slot);
        }
    }
    log::trace!(target: "vm", "shootdown {:#x} on {} cpus", vaddr.page(), cpus.len());
    Ok(())
}

static_assertions::const_assert!(tlbhi_invalid(63) as usize % PAGE_SIZE == 0);

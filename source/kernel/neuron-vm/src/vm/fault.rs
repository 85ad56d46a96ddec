// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: TLB-miss and write-protection fault handling
//! OWNERS: @kernel-mm-team
//! PUBLIC API: Vm::fault, FaultKind
//! INVARIANTS: A slot is only written at splhigh; clean pages are installed read-only
//!             so the first store is seen as a READONLY fault and marks them dirty

use crate::error::{Result, VmError};
use crate::mm::{FrameState, RegionPerm};
use crate::thread::ThreadCtx;
use crate::tlb::TlbEntry;
use crate::types::VirtAddr;

use super::Vm;

/// Kind of access that missed in the TLB.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultKind {
    Read,
    Write,
    /// Store to a page installed without write permission.
    ReadOnly,
}

impl TryFrom<u32> for FaultKind {
    type Error = VmError;

    fn try_from(raw: u32) -> Result<Self> {
        match raw {
            0 => Ok(FaultKind::Read),
            1 => Ok(FaultKind::Write),
            2 => Ok(FaultKind::ReadOnly),
            _ => Err(VmError::InvalidArgument),
        }
    }
}

impl Vm {
    /// Resolves a fault at `addr` raised by `thread` and installs the mapping
    /// into the TLB of the thread's CPU.
    pub fn fault(&self, thread: &ThreadCtx, fault_type: u32, addr: VirtAddr) -> Result<()> {
        let kind = FaultKind::try_from(fault_type)?;
        let space = thread.addrspace.and_then(|id| self.space(id)).ok_or(VmError::BadAddress)?;
        space.check_invariants();
        log::trace!(target: "vm", "fault {:?} at {:#x} in {}", kind, addr, space.id());

        let cpu = self.cpu(thread.cpu);
        if kind == FaultKind::ReadOnly {
            let writable = space.lock().classify(addr).is_some_and(|perm| perm.contains(RegionPerm::WRITE));
            if !writable {
                return Err(VmError::BadAddress);
            }
            let tlb = cpu.tlb();
            if let Some(slot) = tlb.probe(addr) {
                if tlb.read(slot).is_writable() {
                    panic!("readonly fault at {:#x} on a writable mapping", addr);
                }
            }
        }

        let write = kind != FaultKind::Read;
        self.with_resident_page(&space, addr, write, |state, frame, frame_state| {
            let writable = frame_state == FrameState::Dirty
                && state.classify(addr).is_some_and(|perm| perm.contains(RegionPerm::WRITE));
            let entry = TlbEntry::mapping(addr, frame.paddr(), writable);

            let _spl = cpu.splhigh();
            let mut tlb = cpu.tlb();
            match tlb.probe(addr).or_else(|| tlb.first_invalid()) {
                Some(slot) => {
                    tlb.write(entry, slot);
                    Ok(())
                }
                None => {
                    log::warn!(target: "vm", "tlb full on {:?} installing {:#x}", thread.cpu, addr);
                    Err(VmError::TlbFull)
                }
            }
        })?
    }
}

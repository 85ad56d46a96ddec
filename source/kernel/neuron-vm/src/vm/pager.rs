// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Page replacement: user frame allocation, eviction and page-in
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! DEPENDS_ON: mm::frame, mm::page_table, swap, tlb shoot-down
//! INVARIANTS: A page table entry is LOCKED for the whole of a page-in or eviction;
//!             a frame stays Victim or Fixed until its entry is consistent again
//!
//! Eviction order: claim the owner's entry, shoot the mapping out of every
//! TLB, write back, then publish `ONDISK` and wake waiters. Page-in pins the
//! new frame (`Fixed`) until the entry points at it.

use parking_lot::MutexGuard;

use crate::error::{Result, VmError};
use crate::mm::{AddressSpace, AddressSpaceState, FrameState, PageTableEntry, PteFlags, RegionPerm};
use crate::swap::SwapSlot;
use crate::types::{AsId, FrameIndex, VirtAddr, PAGE_SIZE};

use super::Vm;

impl Vm {
    /// Obtains a zeroed frame for page `vaddr` of `owner`, evicting if needed.
    ///
    /// The frame comes back pinned; the caller links it into a page table
    /// entry and then calls `FrameTable::unpin`.
    pub(crate) fn allocate_one_for_user(&self, owner: AsId, vaddr: VirtAddr) -> Result<FrameIndex> {
        let (frame, prior) = self.frames.select_victim();
        self.evict(frame, prior)?;
        self.frames.stamp(frame, owner, vaddr);
        Ok(frame)
    }

    /// Frees the frame behind `pte` and marks the entry non-resident.
    ///
    /// Returns `false` when the frame was left to a concurrent evictor.
    pub fn release_one(&self, owner: AsId, pte: &mut PageTableEntry) -> bool {
        match pte.frame.take() {
            Some(frame) => self.frames.release_user(frame, owner),
            None => false,
        }
    }

    /// Empties a frame already marked Victim so it can be reused.
    fn evict(&self, frame: FrameIndex, prior: FrameState) -> Result<()> {
        match prior {
            FrameState::Free => return Ok(()),
            FrameState::Clean | FrameState::Dirty => {}
            other => panic!("evict: frame {} was {:?}", frame.0, other),
        }
        let Some((owner, vaddr)) = self.frames.owner(frame) else {
            panic!("evict: user frame {} has no owner", frame.0);
        };

        let space = self.space(owner);
        let claimed = space.as_deref().and_then(|space| claim_entry(space, vaddr, frame));
        self.shootdown(vaddr);

        let (Some(space), Some(slot)) = (space, claimed) else {
            log::debug!(target: "vm", "evict: frame {} orphaned from {}", frame.0, owner);
            return Ok(());
        };

        let written = match prior {
            FrameState::Dirty => self.write_back(frame, slot),
            _ => match slot {
                Some(slot) => Ok(slot),
                None => panic!("evict: clean page {:#x} of {} has no backing copy", vaddr, owner),
            },
        };

        let mut state = space.lock();
        let Some(pte) = state.page_table.get_mut(vaddr) else {
            panic!("evict: locked entry {:#x} of {} vanished", vaddr, owner);
        };
        pte.flags.remove(PteFlags::LOCKED);
        let outcome = match written {
            Ok(slot) => {
                pte.swap_slot = Some(slot);
                pte.flags.insert(PteFlags::ONDISK);
                pte.frame = None;
                log::debug!(target: "vm", "evicted {:#x} of {} from frame {}", vaddr, owner, frame.0);
                Ok(())
            }
            Err(err) => {
                self.frames.restore(frame, prior);
                log::warn!(target: "vm", "evict: write-back of {:#x} failed: {}", vaddr, err);
                Err(err)
            }
        };
        drop(state);
        space.wake_all();
        outcome
    }

    /// Copies a dirty frame out to its slot, reserving one on first eviction.
    fn write_back(&self, frame: FrameIndex, slot: Option<SwapSlot>) -> Result<SwapSlot> {
        let (slot, fresh) = match slot {
            Some(slot) => (slot, false),
            None => (self.swap.reserve_slot()?, true),
        };
        let mut page = vec![0u8; PAGE_SIZE];
        self.frames.read_page(frame, &mut page);
        if let Err(err) = self.swap.write_page(slot, &page) {
            if fresh {
                self.swap.release_slot(slot);
            }
            return Err(err);
        }
        Ok(slot)
    }

    /// Brings a page in for `owner`, from its slot if it has one.
    ///
    /// Returns the pinned frame and the state it should take once linked.
    fn page_in(&self, owner: AsId, page: VirtAddr, slot: Option<SwapSlot>) -> Result<(FrameIndex, FrameState)> {
        let frame = self.allocate_one_for_user(owner, page)?;
        let Some(slot) = slot else {
            return Ok((frame, FrameState::Dirty));
        };
        let mut buf = vec![0u8; PAGE_SIZE];
        if let Err(err) = self.swap.read_page(slot, &mut buf) {
            self.frames.release_user(frame, owner);
            return Err(err);
        }
        self.frames.write_page(frame, &buf);
        Ok((frame, FrameState::Clean))
    }

    /// Reads the current contents of `page` without changing where it lives.
    ///
    /// `None` when the space no longer has an entry for the page.
    pub(crate) fn snapshot_page(&self, space: &AddressSpace, page: VirtAddr) -> Result<Option<Vec<u8>>> {
        let mut buf = vec![0u8; PAGE_SIZE];
        let mut state = space.lock();
        loop {
            let entry = state.page_table.get(page).map(|pte| {
                let slot = if pte.is_on_disk() { pte.swap_slot } else { None };
                (pte.is_locked(), pte.frame, slot)
            });
            let (frame, slot) = match entry {
                None => return Ok(None),
                Some((true, _, _)) => {
                    space.wait(&mut state);
                    continue;
                }
                Some((false, frame, slot)) => (frame, slot),
            };
            if let Some(frame) = frame {
                if self.frames.touch(frame, false).is_none() {
                    space.wait(&mut state);
                    continue;
                }
                self.frames.read_page(frame, &mut buf);
                return Ok(Some(buf));
            }
            let Some(slot) = slot else {
                return Ok(Some(buf));
            };

            set_locked(&mut state, page, true);
            let read = MutexGuard::unlocked(&mut state, || self.swap.read_page(slot, &mut buf));
            set_locked(&mut state, page, false);
            drop(state);
            space.wake_all();
            read?;
            return Ok(Some(buf));
        }
    }

    /// Runs `f` with the page containing `vaddr` resident and safe from eviction.
    ///
    /// Checks that the access is allowed by the region or stack window, waits
    /// out page-ins and evictions in flight, and pages in on a miss. `f` runs
    /// with the address-space lock held and receives the frame state after a
    /// write has been accounted for.
    pub(crate) fn with_resident_page<R>(
        &self,
        space: &AddressSpace,
        vaddr: VirtAddr,
        write: bool,
        f: impl FnOnce(&mut AddressSpaceState, FrameIndex, FrameState) -> R,
    ) -> Result<R> {
        let page = vaddr.page();
        let mut state = space.lock();
        match state.classify(page) {
            None => return Err(VmError::BadAddress),
            Some(perm) if write && !perm.contains(RegionPerm::WRITE) => return Err(VmError::BadAddress),
            Some(_) => {}
        }

        loop {
            let entry = state.page_table.get(page).map(|pte| (pte.is_locked(), pte.frame));
            let resident = match entry {
                Some((true, _)) => {
                    space.wait(&mut state);
                    continue;
                }
                Some((false, frame)) => frame,
                None => None,
            };
            if let Some(frame) = resident {
                match self.frames.touch(frame, write) {
                    Some(frame_state) => return Ok(f(&mut *state, frame, frame_state)),
                    None => {
                        space.wait(&mut state);
                        continue;
                    }
                }
            }

            let slot = match state.page_table.get_mut(page) {
                Some(pte) => {
                    pte.flags.insert(PteFlags::LOCKED);
                    if pte.is_on_disk() {
                        pte.swap_slot
                    } else {
                        None
                    }
                }
                None => {
                    state.page_table.insert(page, None).flags.insert(PteFlags::LOCKED);
                    None
                }
            };
            let loaded = MutexGuard::unlocked(&mut state, || self.page_in(space.id(), page, slot));
            return self.finish_page_in(space, &mut state, page, write, loaded, f);
        }
    }

    fn finish_page_in<R>(
        &self,
        space: &AddressSpace,
        state: &mut MutexGuard<'_, AddressSpaceState>,
        page: VirtAddr,
        write: bool,
        loaded: Result<(FrameIndex, FrameState)>,
        f: impl FnOnce(&mut AddressSpaceState, FrameIndex, FrameState) -> R,
    ) -> Result<R> {
        let Some(pte) = state.page_table.get_mut(page) else {
            panic!("page-in: locked entry {:#x} of {} vanished", page, space.id());
        };
        pte.flags.remove(PteFlags::LOCKED);
        let (frame, frame_state) = match loaded {
            Ok(loaded) => loaded,
            Err(err) => {
                if !pte.is_on_disk() {
                    state.page_table.remove(page);
                }
                space.wake_all();
                log::warn!(target: "vm", "page-in of {:#x} for {} failed: {}", page, space.id(), err);
                return Err(err);
            }
        };
        pte.frame = Some(frame);
        let frame_state = if write { FrameState::Dirty } else { frame_state };
        let result = f(&mut **state, frame, frame_state);
        self.frames.unpin(frame, frame_state);
        space.wake_all();
        log::trace!(target: "vm", "paged in {:#x} for {} at frame {}", page, space.id(), frame.0);
        Ok(result)
    }
}

fn set_locked(state: &mut AddressSpaceState, page: VirtAddr, locked: bool) {
    if let Some(pte) = state.page_table.get_mut(page) {
        pte.flags.set(PteFlags::LOCKED, locked);
    }
}

/// Marks the entry still mapping `frame` as LOCKED and returns its slot.
///
/// `None` when the entry is gone or already points elsewhere.
fn claim_entry(space: &AddressSpace, vaddr: VirtAddr, frame: FrameIndex) -> Option<Option<SwapSlot>> {
    let mut state = space.lock();
    let pte = state.page_table.get_mut(vaddr)?;
    if pte.frame != Some(frame) {
        return None;
    }
    debug_assert!(!pte.is_locked(), "resident entry {:#x} already locked", vaddr);
    pte.flags.insert(PteFlags::LOCKED);
    Some(pte.swap_slot)
}

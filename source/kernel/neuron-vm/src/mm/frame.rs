// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Physical frame table (coremap) and simulated RAM
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//! PUBLIC API: FrameTable (bootstrap, allocate_contiguous, release_contiguous, select_victim), FrameState
//! DEPENDS_ON: spin::Mutex (table lock), parking_lot::RwLock (frame contents), rand::SmallRng
//! INVARIANTS: State transitions only under the table lock; Fixed frames are never victims;
//!             a Victim frame is invisible to every other scan until its evictor lets go

use alloc::{boxed::Box, vec, vec::Vec};

use parking_lot::RwLock;
use rand::{rngs::SmallRng, Rng, SeedableRng};
use spin::Mutex;

use crate::error::{Result, VmError};
use crate::types::{page_align_down, page_align_up, AsId, FrameIndex, PhysAddr, VirtAddr, KSEG0, PAGE_SIZE};

/// Bytes one descriptor occupies in the boot-time table layout.
pub const DESCRIPTOR_BYTES: usize = 16;

/// Lifecycle state of a physical frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameState {
    /// Available for allocation.
    Free,
    /// Kernel-owned or pinned; never evicted.
    Fixed,
    /// User page whose contents match its backing-store copy.
    Clean,
    /// User page that must be written back before reuse.
    Dirty,
    /// Selected for eviction; excluded from all scans until eviction completes.
    Victim,
}

/// Bookkeeping for one physical frame.
#[derive(Debug, Clone, Copy)]
pub struct FrameDescriptor {
    pub state: FrameState,
    /// Frames in the allocation this frame starts; 0 when not the head of one.
    pub run: usize,
    /// Owning address space and the user page mapped onto this frame.
    pub owner: Option<(AsId, VirtAddr)>,
}

impl FrameDescriptor {
    const fn new(state: FrameState) -> Self {
        Self { state, run: 0, owner: None }
    }
}

/// Usable physical memory handed over by early boot.
#[derive(Debug, Clone, Copy)]
pub struct RamRange {
    /// First byte not claimed by the kernel image or boot allocations.
    pub first_free: PhysAddr,
    /// One past the last byte of RAM.
    pub last: PhysAddr,
}

impl RamRange {
    /// Whole frames of RAM; a trailing partial frame is ignored.
    pub fn total_frames(&self) -> usize {
        page_align_down(self.last.raw()) / PAGE_SIZE
    }

    /// Index of the first frame after the kernel image and the descriptor table.
    pub fn first_dynamic(&self) -> usize {
        let table_end = self.first_free.raw().saturating_add(self.total_frames().saturating_mul(DESCRIPTOR_BYTES));
        page_align_up(table_end) / PAGE_SIZE
    }
}

struct Coremap {
    frames: Vec<FrameDescriptor>,
    rng: SmallRng,
}

/// The system-wide table of physical frames.
pub struct FrameTable {
    map: Mutex<Coremap>,
    ram: Vec<RwLock<Box<[u8]>>>,
    first_dynamic: usize,
}

impl FrameTable {
    /// Builds the table for `range`, reserving the frames the kernel image and
    /// the table itself occupy.
    pub fn bootstrap(range: RamRange, seed: u64) -> Self {
        let total = range.total_frames();
        let first_dynamic = range.first_dynamic();
        if first_dynamic >= total {
            panic!("frame table: no memory left after reserving {} frames", first_dynamic);
        }

        let frames = (0..total)
            .map(|index| {
                if index < first_dynamic {
                    FrameDescriptor::new(FrameState::Fixed)
                } else {
                    FrameDescriptor::new(FrameState::Free)
                }
            })
            .collect();
        let ram = (0..total).map(|_| RwLock::new(vec![0u8; PAGE_SIZE].into_boxed_slice())).collect();

        log::info!(
            target: "mm",
            "coremap: {} frames, {} reserved, table at {:#x}",
            total,
            first_dynamic,
            range.first_free
        );
        Self { map: Mutex::new(Coremap { frames, rng: SmallRng::seed_from_u64(seed) }), ram, first_dynamic }
    }

    pub fn total_frames(&self) -> usize {
        self.ram.len()
    }

    /// First frame available for dynamic allocation.
    pub fn first_dynamic(&self) -> FrameIndex {
        FrameIndex(self.first_dynamic)
    }

    /// Claims `npages` physically contiguous frames for the kernel.
    ///
    /// Never evicts: callers are expected to ask for small, rare allocations.
    pub fn allocate_contiguous(&self, npages: usize) -> Result<VirtAddr> {
        if npages == 0 {
            return Err(VmError::InvalidArgument);
        }
        let mut map = self.map.lock();
        let total = map.frames.len();
        let mut start = self.first_dynamic;
        while start + npages <= total {
            match map.frames[start..start + npages].iter().position(|f| f.state != FrameState::Free) {
                Some(busy) => start += busy + 1,
                None => {
                    for frame in &mut map.frames[start..start + npages] {
                        *frame = FrameDescriptor::new(FrameState::Fixed);
                    }
                    map.frames[start].run = npages;
                    drop(map);
                    return Ok(FrameIndex(start).paddr().to_kvaddr());
                }
            }
        }
        Err(VmError::OutOfMemory)
    }

    /// Returns a run obtained from [`FrameTable::allocate_contiguous`].
    pub fn release_contiguous(&self, addr: VirtAddr) {
        let index = addr
            .raw()
            .checked_sub(KSEG0)
            .map(|pa| pa / PAGE_SIZE)
            .filter(|index| *index >= self.first_dynamic && *index < self.total_frames())
            .unwrap_or_else(|| panic!("release_contiguous: {:#x} is not a dynamic kernel frame", addr));
        let mut map = self.map.lock();
        let run = map.frames[index].run;
        for frame in &mut map.frames[index..index + run] {
            *frame = FrameDescriptor::new(FrameState::Free);
        }
    }

    /// Picks a frame for a user page and marks it [`FrameState::Victim`].
    ///
    /// Returns the frame together with the state it had before selection so
    /// the caller knows how much eviction work is owed.
    pub fn select_victim(&self) -> (FrameIndex, FrameState) {
        let mut map = self.map.lock();
        let mut clean = Vec::new();
        let mut dirty = Vec::new();
        let mut chosen = None;
        for (index, frame) in map.frames.iter().enumerate() {
            match frame.state {
                FrameState::Free => {
                    chosen = Some((index, FrameState::Free));
                    break;
                }
                FrameState::Clean => clean.push(index),
                FrameState::Dirty => dirty.push(index),
                FrameState::Fixed | FrameState::Victim => {}
            }
        }
        let (index, prior) = match chosen {
            Some(found) => found,
            None if !clean.is_empty() => {
                let pick = map.rng.gen_range(0..clean.len());
                (clean[pick], FrameState::Clean)
            }
            None => {
                if dirty.is_empty() {
                    panic!("frame table: no evictable frames left");
                }
                let pick = map.rng.gen_range(0..dirty.len());
                (dirty[pick], FrameState::Dirty)
            }
        };
        map.frames[index].state = FrameState::Victim;
        (FrameIndex(index), prior)
    }

    /// Hands an evicted frame to `owner`, pinned as `Fixed` and zero-filled.
    pub(crate) fn stamp(&self, frame: FrameIndex, owner: AsId, vaddr: VirtAddr) {
        {
            let mut map = self.map.lock();
            let desc = &mut map.frames[frame.0];
            assert_eq!(desc.state, FrameState::Victim, "stamp: frame {} was not claimed", frame.0);
            desc.state = FrameState::Fixed;
            desc.run = 1;
            desc.owner = Some((owner, vaddr.page()));
        }
        self.ram[frame.0].write().fill(0);
    }

    /// Makes a pinned user frame evictable again.
    pub(crate) fn unpin(&self, frame: FrameIndex, state: FrameState) {
        debug_assert!(matches!(state, FrameState::Clean | FrameState::Dirty));
        let mut map = self.map.lock();
        let desc = &mut map.frames[frame.0];
        assert_eq!(desc.state, FrameState::Fixed, "unpin: frame {} not pinned", frame.0);
        desc.state = state;
    }

    /// Puts back the state a victim had before an eviction that could not finish.
    pub(crate) fn restore(&self, frame: FrameIndex, prior: FrameState) {
        let mut map = self.map.lock();
        let desc = &mut map.frames[frame.0];
        debug_assert_eq!(desc.state, FrameState::Victim);
        desc.state = prior;
    }

    /// Frees a user frame owned by `owner`.
    ///
    /// A frame already claimed as a victim belongs to its evictor, and one
    /// restamped for another space is no longer ours; both are left alone.
    /// Returns whether the frame was actually freed.
    pub fn release_user(&self, frame: FrameIndex, owner: AsId) -> bool {
        let mut map = self.map.lock();
        let desc = &mut map.frames[frame.0];
        if desc.state == FrameState::Victim || desc.owner.map(|(id, _)| id) != Some(owner) {
            return false;
        }
        *desc = FrameDescriptor::new(FrameState::Free);
        true
    }

    /// Checks that a resident frame is usable and records a pending write.
    ///
    /// Returns `None` while the frame is a victim; otherwise the state after a
    /// `Clean` frame has been promoted to `Dirty` for a write.
    pub fn touch(&self, frame: FrameIndex, write: bool) -> Option<FrameState> {
        let mut map = self.map.lock();
        let desc = &mut map.frames[frame.0];
        match desc.state {
            FrameState::Victim => None,
            FrameState::Clean if write => {
                desc.state = FrameState::Dirty;
                Some(FrameState::Dirty)
            }
            state => Some(state),
        }
    }

    pub fn state(&self, frame: FrameIndex) -> FrameState {
        self.map.lock().frames[frame.0].state
    }

    pub fn owner(&self, frame: FrameIndex) -> Option<(AsId, VirtAddr)> {
        self.map.lock().frames[frame.0].owner
    }

    /// Number of frames currently in `state`.
    pub fn count(&self, state: FrameState) -> usize {
        self.map.lock().frames.iter().filter(|f| f.state == state).count()
    }

    /// Snapshot of every frame's state, indexed by frame number.
    pub fn states(&self) -> Vec<FrameState> {
        self.map.lock().frames.iter().map(|f| f.state).collect()
    }

    pub fn read_page(&self, frame: FrameIndex, buf: &mut [u8]) {
        buf.copy_from_slice(&self.ram[frame.0].read());
    }

    pub fn write_page(&self, frame: FrameIndex, data: &[u8]) {
        self.ram[frame.0].write().copy_from_slice(data);
    }

    pub(crate) fn read_bytes(&self, frame: FrameIndex, offset: usize, buf: &mut [u8]) {
        let page = self.ram[frame.0].read();
        buf.copy_from_slice(&page[offset..offset + buf.len()]);
    }

    pub(crate) fn write_bytes(&self, frame: FrameIndex, offset: usize, data: &[u8]) {
        let mut page = self.ram[frame.0].write();
        page[offset..offset + data.len()].copy_from_slice(data);
    }

    #[cfg(test)]
    pub(crate) fn force_state(&self, frame: FrameIndex, state: FrameState) {
        self.map.lock().frames[frame.0].state = state;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn table(frames: usize) -> FrameTable {
        FrameTable::bootstrap(
            RamRange { first_free: PhysAddr::new(PAGE_SIZE), last: PhysAddr::new(frames * PAGE_SIZE) },
            7,
        )
    }

    #[test]
    fn bootstrap_reserves_kernel_and_table() {
        let table = table(64);
        // 64 descriptors fit in the page after the kernel image.
        assert_eq!(table.first_dynamic(), FrameIndex(2));
        assert_eq!(table.count(FrameState::Fixed), 2);
        assert_eq!(table.count(FrameState::Free), 62);
    }

    #[test]
    fn bootstrap_ignores_partial_last_frame() {
        let table = FrameTable::bootstrap(
            RamRange { first_free: PhysAddr::new(PAGE_SIZE), last: PhysAddr::new(16 * PAGE_SIZE + 100) },
            0,
        );
        assert_eq!(table.total_frames(), 16);
    }

    #[test]
    #[should_panic(expected = "no memory left")]
    fn bootstrap_without_dynamic_frames_is_fatal() {
        let _ = FrameTable::bootstrap(
            RamRange { first_free: PhysAddr::new(3 * PAGE_SIZE), last: PhysAddr::new(4 * PAGE_SIZE) },
            0,
        );
    }

    #[test]
    fn contiguous_allocation_claims_a_run() {
        let table = table(16);
        let addr = table.allocate_contiguous(3).expect("run of three");
        assert_eq!(addr, FrameIndex(2).paddr().to_kvaddr());
        assert_eq!(table.count(FrameState::Fixed), 5);

        let next = table.allocate_contiguous(1).expect("single frame");
        assert_eq!(next, FrameIndex(5).paddr().to_kvaddr());

        table.release_contiguous(addr);
        assert_eq!(table.count(FrameState::Fixed), 3);
        // The hole left behind is reused first.
        assert_eq!(table.allocate_contiguous(2).expect("refill"), addr);
    }

    #[test]
    fn contiguous_allocation_skips_fragmented_holes() {
        let table = table(8);
        table.force_state(FrameIndex(3), FrameState::Dirty);
        table.force_state(FrameIndex(6), FrameState::Clean);
        // Free runs are [2], [4, 5], [7]; none fits three frames.
        assert_eq!(table.allocate_contiguous(3), Err(VmError::OutOfMemory));
        assert_eq!(table.allocate_contiguous(2), Ok(FrameIndex(4).paddr().to_kvaddr()));
    }

    #[test]
    fn contiguous_allocation_rejects_zero() {
        assert_eq!(table(8).allocate_contiguous(0), Err(VmError::InvalidArgument));
    }

    #[test]
    fn free_frame_preferred_over_eviction() {
        let table = table(8);
        for index in 2..7 {
            table.force_state(FrameIndex(index), FrameState::Clean);
        }
        assert_eq!(table.select_victim(), (FrameIndex(7), FrameState::Free));
        assert_eq!(table.state(FrameIndex(7)), FrameState::Victim);
    }

    #[test]
    fn clean_frames_chosen_before_dirty() {
        let table = table(8);
        let clean = [FrameIndex(3), FrameIndex(5), FrameIndex(6)];
        for index in 2..8 {
            table.force_state(FrameIndex(index), FrameState::Fixed);
        }
        for frame in clean {
            table.force_state(frame, FrameState::Clean);
        }
        for _ in 0..32 {
            let (victim, prior) = table.select_victim();
            assert_eq!(prior, FrameState::Clean);
            assert!(clean.contains(&victim));
            table.restore(victim, prior);
        }
    }

    #[test]
    fn dirty_frame_chosen_when_nothing_else_left() {
        let table = table(4);
        table.force_state(FrameIndex(2), FrameState::Fixed);
        table.force_state(FrameIndex(3), FrameState::Dirty);
        assert_eq!(table.select_victim(), (FrameIndex(3), FrameState::Dirty));
    }

    #[test]
    fn victims_are_never_selected_twice() {
        let table = table(4);
        table.force_state(FrameIndex(2), FrameState::Dirty);
        table.force_state(FrameIndex(3), FrameState::Dirty);
        let (first, _) = table.select_victim();
        let (second, _) = table.select_victim();
        assert_ne!(first, second);
    }

    #[test]
    #[should_panic(expected = "no evictable frames")]
    fn exhausted_table_is_fatal() {
        let table = table(4);
        table.force_state(FrameIndex(2), FrameState::Fixed);
        table.force_state(FrameIndex(3), FrameState::Victim);
        let _ = table.select_victim();
    }

    #[test]
    fn stamp_pins_and_zeroes() {
        let table = table(4);
        let (frame, _) = table.select_victim();
        table.write_page(frame, &[0xAA; PAGE_SIZE]);
        table.restore(frame, FrameState::Free);
        let (frame, _) = table.select_victim();
        table.stamp(frame, AsId::from_raw(9), VirtAddr::new(0x40_0123));
        assert_eq!(table.state(frame), FrameState::Fixed);
        assert_eq!(table.owner(frame), Some((AsId::from_raw(9), VirtAddr::new(0x40_0000))));
        let mut buf = [1u8; PAGE_SIZE];
        table.read_page(frame, &mut buf);
        assert!(buf.iter().all(|b| *b == 0));
    }

    #[test]
    fn release_leaves_victims_to_their_evictor() {
        let table = table(4);
        let owner = AsId::from_raw(1);
        let (frame, _) = table.select_victim();
        table.stamp(frame, owner, VirtAddr::new(0x1000));
        table.unpin(frame, FrameState::Dirty);
        table.force_state(frame, FrameState::Victim);
        assert!(!table.release_user(frame, owner));
        table.force_state(frame, FrameState::Dirty);
        assert!(!table.release_user(frame, AsId::from_raw(2)));
        assert!(table.release_user(frame, owner));
        assert_eq!(table.state(frame), FrameState::Free);
        assert_eq!(table.owner(frame), None);
    }

    #[test]
    fn touch_promotes_clean_on_write() {
        let table = table(4);
        let frame = FrameIndex(2);
        table.force_state(frame, FrameState::Clean);
        assert_eq!(table.touch(frame, false), Some(FrameState::Clean));
        assert_eq!(table.touch(frame, true), Some(FrameState::Dirty));
        table.force_state(frame, FrameState::Victim);
        assert_eq!(table.touch(frame, true), None);
    }
}

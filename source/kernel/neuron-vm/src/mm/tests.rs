// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Unit tests for region layout and page table bookkeeping
//! OWNERS: @kernel-mm-team
//! NOTE: Tests only; verify rounding, load permissions, classification, invariants

use proptest::prelude::*;

use super::{AddressSpace, PageTable, PteFlags, RegionPerm};
use crate::error::VmError;
use crate::types::{AsId, FrameIndex, VirtAddr, KSEG0, PAGE_SIZE};

fn space() -> AddressSpace {
    AddressSpace::new(AsId::from_raw(1), KSEG0, 12)
}

#[test]
fn region_rounds_to_cover_range() {
    let space = space();
    let region = space.define_region(0x1003, 10, true, false, false).expect("region");
    assert_eq!(region.base, VirtAddr::new(0x1000));
    assert_eq!(region.len, PAGE_SIZE);

    let state = space.lock();
    assert_eq!(state.heap_start, 0x2000);
    assert_eq!(state.heap_end, 0x2000);
}

#[test]
fn region_straddling_a_boundary_gets_two_pages() {
    let space = space();
    let region = space.define_region(0x1ffe, 4, true, true, false).expect("region");
    assert_eq!(region.base, VirtAddr::new(0x1000));
    assert_eq!(region.len, 2 * PAGE_SIZE);
}

#[test]
fn heap_follows_the_latest_region() {
    let space = space();
    space.define_region(0x40_0000, 0x1800, true, false, true).expect("region");
    space.define_region(0x10_0000, 0x100, true, true, false).expect("region");
    assert_eq!(space.lock().heap_start, 0x10_1000);
}

#[test]
fn overlapping_region_is_rejected() {
    let space = space();
    space.define_region(0x40_0000, 2 * PAGE_SIZE, true, false, true).expect("text");
    assert_eq!(space.define_region(0x40_1000, PAGE_SIZE, true, true, false), Err(VmError::InvalidArgument));
    assert_eq!(space.define_region(0x3f_f800, 0x1000, true, true, false), Err(VmError::InvalidArgument));

    let state = space.lock();
    assert_eq!(state.regions.len(), 1);
    assert_eq!(state.heap_start, 0x40_2000);
    assert_eq!(state.classify(VirtAddr::new(0x40_1000)), Some(RegionPerm::READ | RegionPerm::EXECUTE));
}

#[test]
fn adjacent_regions_are_accepted() {
    let space = space();
    space.define_region(0x40_0000, PAGE_SIZE, true, false, true).expect("text");
    space.define_region(0x40_1000, PAGE_SIZE, true, true, false).expect("data");
    space.define_region(0x3f_f000, PAGE_SIZE, true, false, false).expect("rodata");
    assert_eq!(space.lock().regions.len(), 3);
}

#[test]
fn wrapping_region_is_rejected() {
    let space = space();
    assert_eq!(space.define_region(0x1000, usize::MAX, true, true, false), Err(VmError::InvalidArgument));
    assert_eq!(space.define_region(usize::MAX - 10, 4, true, true, false), Err(VmError::InvalidArgument));
    let state = space.lock();
    assert!(state.regions.is_empty());
    assert_eq!(state.heap_start, 0);
}

#[test]
fn load_opens_then_restores_permissions() {
    let space = space();
    space.define_region(0x40_0000, PAGE_SIZE, true, false, true).expect("region");
    space.prepare_load();
    {
        let state = space.lock();
        assert_eq!(state.regions[0].active, RegionPerm::READ | RegionPerm::WRITE);
        assert_eq!(state.regions[0].backup, RegionPerm::READ | RegionPerm::EXECUTE);
    }
    space.complete_load();
    assert_eq!(space.lock().regions[0].active, RegionPerm::READ | RegionPerm::EXECUTE);
}

#[test]
#[should_panic(expected = "no regions")]
fn prepare_load_without_regions_is_fatal() {
    space().prepare_load();
}

#[test]
fn stack_window_is_readable_and_writable() {
    let space = space();
    space.define_region(0x40_0000, PAGE_SIZE, true, false, true).expect("region");
    assert_eq!(space.define_stack(), VirtAddr::new(KSEG0));

    let state = space.lock();
    let rw = RegionPerm::READ | RegionPerm::WRITE;
    assert_eq!(state.classify(VirtAddr::new(KSEG0 - 4)), Some(rw));
    assert_eq!(state.classify(VirtAddr::new(KSEG0 - 12 * PAGE_SIZE)), Some(rw));
    assert_eq!(state.classify(VirtAddr::new(KSEG0 - 12 * PAGE_SIZE - 1)), None);
    assert_eq!(state.classify(VirtAddr::new(KSEG0)), None);
    assert_eq!(
        state.classify(VirtAddr::new(0x40_0ffc)),
        Some(RegionPerm::READ | RegionPerm::EXECUTE)
    );
    assert_eq!(state.classify(VirtAddr::new(0x40_1000)), None);
}

#[test]
fn invariants_hold_after_loading() {
    let space = space();
    space.define_region(0x40_0000, 0x2345, true, true, false).expect("region");
    space.check_invariants();
}

#[test]
#[should_panic(expected = "zero-length region")]
fn zero_length_region_violates_invariants() {
    let space = space();
    space.define_region(0x40_0000, 0, true, false, false).expect("region");
    space.check_invariants();
}

#[test]
#[should_panic(expected = "no regions")]
fn empty_space_violates_invariants() {
    space().check_invariants();
}

#[test]
fn page_table_lookup_is_by_page() {
    let mut table = PageTable::new();
    table.insert(VirtAddr::new(0x40_0010), Some(FrameIndex(7)));
    table.insert(VirtAddr::new(0x41_0000), None).flags.insert(PteFlags::ONDISK);

    let entry = table.get(VirtAddr::new(0x40_0ffc)).expect("same page");
    assert_eq!(entry.vaddr, VirtAddr::new(0x40_0000));
    assert_eq!(entry.frame, Some(FrameIndex(7)));
    assert!(table.get(VirtAddr::new(0x40_1000)).is_none());
    assert_eq!(table.resident_count(), 1);
    assert!(table.get(VirtAddr::new(0x41_0000)).is_some_and(|e| e.is_on_disk()));

    assert!(table.remove(VirtAddr::new(0x40_0000)).is_some());
    assert_eq!(table.len(), 1);
}

#[test]
fn locked_entries_are_reported() {
    let mut table = PageTable::new();
    table.insert(VirtAddr::new(0x1000), None);
    assert!(!table.any_locked());
    table.get_mut(VirtAddr::new(0x1000)).expect("entry").flags.insert(PteFlags::LOCKED);
    assert!(table.any_locked());
    assert_eq!(table.drain().count(), 1);
    assert!(table.is_empty());
}

proptest! {
    #[test]
    fn region_covers_requested_range(vaddr in 1usize..0x7000_0000, size in 1usize..0x10_0000) {
        let space = space();
        let region = space.define_region(vaddr, size, true, true, false).expect("region");
        prop_assert_eq!(region.base.raw() % PAGE_SIZE, 0);
        prop_assert_eq!(region.len % PAGE_SIZE, 0);
        prop_assert!(region.base.raw() <= vaddr);
        prop_assert!(region.end() >= vaddr + size);
        // Never more than one page of slack on either side.
        prop_assert!(vaddr - region.base.raw() < PAGE_SIZE);
        prop_assert!(region.end() - (vaddr + size) < PAGE_SIZE);
    }
}

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Shared fixtures for the host integration tests.

#![allow(dead_code)]

use std::sync::Arc;

use neuron_vm::{
    AsId, CpuId, MemoryBackingStore, Pid, ThreadCtx, UserPtr, Vm, VmConfig, PAGE_SIZE,
};

/// Base of the data region every fixture space gets.
pub const DATA: usize = 0x40_0000;

/// Config with `frames` frames of RAM; the first two are always reserved.
pub fn config(frames: usize) -> VmConfig {
    VmConfig { ram_bytes: frames * PAGE_SIZE, kernel_image_bytes: PAGE_SIZE, ..VmConfig::default() }
}

pub fn vm_with(config: VmConfig, swap_slots: usize) -> (Vm, Arc<MemoryBackingStore>) {
    let store = Arc::new(MemoryBackingStore::new(swap_slots));
    let vm = Vm::new(config, Box::new(Arc::clone(&store))).expect("valid config");
    (vm, store)
}

pub fn vm(frames: usize, swap_slots: usize) -> (Vm, Arc<MemoryBackingStore>) {
    vm_with(config(frames), swap_slots)
}

/// A space with one read/write data region of `pages` pages at [`DATA`].
pub fn data_space(vm: &Vm, pages: usize) -> AsId {
    let id = vm.create();
    vm.define_region(id, DATA, pages * PAGE_SIZE, true, true, false).expect("region");
    id
}

pub fn thread(space: AsId) -> ThreadCtx {
    ThreadCtx::new(Pid::from_raw(1), CpuId(0), Some(space))
}

pub fn page_ptr(page: usize) -> UserPtr {
    UserPtr::new(DATA + page * PAGE_SIZE)
}

/// Byte pattern unique to (`tag`, `page`).
pub fn pattern(tag: u8, page: usize) -> Vec<u8> {
    (0..PAGE_SIZE).map(|i| tag ^ (page as u8).wrapping_mul(31) ^ (i % 251) as u8).collect()
}

pub fn fill(vm: &Vm, space: AsId, tag: u8, pages: usize) {
    for page in 0..pages {
        vm.copy_out(space, page_ptr(page), &pattern(tag, page)).expect("copy_out");
    }
}

pub fn verify(vm: &Vm, space: AsId, tag: u8, pages: usize) {
    let mut buf = vec![0u8; PAGE_SIZE];
    for page in 0..pages {
        vm.copy_in(space, page_ptr(page), &mut buf).expect("copy_in");
        assert!(buf == pattern(tag, page), "page {} of {} corrupted", page, space);
    }
}

/// Every frame above the reserved boundary backs exactly one resident page.
pub fn assert_accounting(vm: &Vm) {
    assert_eq!(vm.frames_in_use(), vm.resident_pages());
}

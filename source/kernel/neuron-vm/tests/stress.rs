// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Concurrent eviction stress on the host
//! OWNERS: @kernel-mm-team
//! STATUS: Functional
//!
//! TEST_SCOPE:
//!   - Several threads paging their own spaces through a shared, undersized frame pool
//!   - Cross-space eviction while the owner is reading or writing the page
//!   - Teardown racing with evictors of other spaces

mod common;

use std::thread;

use common::*;

const THREADS: usize = 4;
const PAGES: usize = 10;
const ROUNDS: usize = 6;

#[test]
fn concurrent_owners_never_see_foreign_or_stale_data() {
    // 16 dynamic frames shared by 40 pages.
    let (vm, store) = vm(18, THREADS * PAGES + 8);
    let spaces: Vec<_> = (0..THREADS).map(|_| data_space(&vm, PAGES)).collect();

    thread::scope(|scope| {
        for (index, space) in spaces.iter().enumerate() {
            let vm = &vm;
            let space = *space;
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    let tag = (index * 16 + round) as u8;
                    fill(vm, space, tag, PAGES);
                    verify(vm, space, tag, PAGES);
                }
            });
        }
    });

    assert_accounting(&vm);
    for (index, space) in spaces.iter().enumerate() {
        verify(&vm, *space, (index * 16 + ROUNDS - 1) as u8, PAGES);
    }
    for space in spaces {
        vm.destroy(space);
    }
    assert_eq!(vm.frames_in_use(), 0);
    assert_eq!(store.in_use(), 0);
}

#[test]
fn teardown_races_with_eviction() {
    let (vm, store) = vm(14, 128);

    thread::scope(|scope| {
        for index in 0..THREADS {
            let vm = &vm;
            scope.spawn(move || {
                for round in 0..ROUNDS {
                    let space = data_space(vm, PAGES);
                    let tag = (index * 16 + round) as u8;
                    fill(vm, space, tag, PAGES);
                    let copy = vm.copy(space).expect("swap has room");
                    vm.destroy(space);
                    verify(vm, copy, tag, PAGES);
                    vm.destroy(copy);
                }
            });
        }
    });

    assert!(vm.space_ids().is_empty());
    assert_eq!(vm.frames_in_use(), 0);
    assert_eq!(store.in_use(), 0);
}

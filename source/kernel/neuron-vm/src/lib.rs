// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Demand-paged virtual memory and process lifecycle for the NEURON teaching kernel
//! OWNERS: @kernel-mm-team @runtime
//! STATUS: Functional
//! API_STABILITY: Unstable
//! TEST_COVERAGE: Unit tests per module, host integration tests (fork/exec/wait, eviction stress, proptest)
//! PUBLIC API: Vm, Kernel, VmConfig, VmError, FrameTable, AddressSpace, BackingStore, ProgramSource
//! DEPENDS_ON: spin, parking_lot, bitflags, thiserror, log, rand, serde/toml
//! INVARIANTS: Lock order address space -> frame table / TLB / swap; Victim frames are owned
//!             by their evictor; pid 0 is never assigned
//!
//! The crate is host-first: physical RAM, per-CPU software TLBs and the
//! shoot-down IPI are modelled in process so the paging protocol can be
//! exercised by ordinary tests. Machine-specific glue (trap entry, the real
//! TLB instructions, swap disk driver) plugs in behind the [`BackingStore`],
//! [`ProgramSource`] and [`ThreadSpawner`] seams.

#![forbid(unsafe_code)]
#![deny(clippy::all)]

extern crate alloc;

pub mod config;
pub mod error;
pub mod kernel;
pub mod loader;
pub mod mm;
pub mod swap;
pub mod task;
pub mod thread;
pub mod tlb;
pub mod trap;
pub mod types;
pub mod vm;

pub use config::{ConfigError, VmConfig};
pub use error::{errno, Result, VmError};
pub use kernel::Kernel;
pub use loader::{Executable, LoadTarget, ProgramRegistry, ProgramSource, Segment, SegmentImage};
pub use mm::{AddressSpace, FrameState, FrameTable, PteFlags, Region, RegionPerm};
pub use swap::{BackingStore, MemoryBackingStore, SwapSlot};
pub use task::{mkwait_exit, ProcessTable, UserEntry, WNOHANG, WUNTRACED};
pub use thread::{ForkedChild, RunQueue, ThreadCtx, ThreadSpawner};
pub use trap::TrapFrame;
pub use types::{AsId, CpuId, Pid, UserPtr, VirtAddr, PAGE_SIZE};
pub use vm::{FaultKind, Vm};

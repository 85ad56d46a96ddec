// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Physical frames, page tables and address-space layout.

pub mod address_space;
pub mod frame;
pub mod page_table;

pub use address_space::{AddressSpace, AddressSpaceState, Region, RegionPerm};
pub use frame::{FrameDescriptor, FrameState, FrameTable, RamRange};
pub use page_table::{PageTable, PageTableEntry, PteFlags};

#[cfg(test)]
mod tests;

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Address, frame, and process newtypes shared by the VM core
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VirtAddr, PhysAddr, FrameIndex, AsId, Pid, CpuId, UserPtr, PAGE_SIZE
//! DEPENDS_ON: core only
//! INVARIANTS: PAGE_SIZE is a power of two; pid 0 is the kernel and never handed out
//!
//! Frames, address spaces and processes all end up as small integers. Keeping
//! them apart at the type level stops a frame index from being used as a pid
//! or a kernel address from being handed to user copy routines.

use core::fmt;

use static_assertions::const_assert;

/// Size of a page (and a physical frame) in bytes.
pub const PAGE_SIZE: usize = 4096;
/// Mask selecting the page-number bits of an address.
pub const PAGE_FRAME: usize = !(PAGE_SIZE - 1);
/// Base of the direct-mapped kernel segment (MIPS KSEG0).
pub const KSEG0: usize = 0x8000_0000;

const_assert!(PAGE_SIZE.is_power_of_two());

/// Rounds `addr` down to its page boundary.
#[inline]
pub const fn page_align_down(addr: usize) -> usize {
    addr & PAGE_FRAME
}

/// Rounds `addr` up to the next page boundary, saturating at the last page.
#[inline]
pub fn page_align_up(addr: usize) -> usize {
    addr.checked_add(PAGE_SIZE - 1).map(page_align_down).unwrap_or(PAGE_FRAME)
}

/// A virtual address, user or kernel.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(transparent)]
pub struct VirtAddr(usize);

impl VirtAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Address of the page containing `self`.
    #[inline]
    pub const fn page(self) -> Self {
        Self(page_align_down(self.0))
    }

    #[inline]
    pub const fn page_offset(self) -> usize {
        self.0 & !PAGE_FRAME
    }

    #[inline]
    pub const fn is_page_aligned(self) -> bool {
        self.page_offset() == 0
    }

    #[inline]
    pub fn checked_add(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

impl fmt::LowerHex for VirtAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// A physical address.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct PhysAddr(usize);

impl PhysAddr {
    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    /// Frame containing this address.
    #[inline]
    pub const fn frame(self) -> FrameIndex {
        FrameIndex(self.0 / PAGE_SIZE)
    }

    /// Kernel virtual address of this physical address in the direct map.
    #[inline]
    pub const fn to_kvaddr(self) -> VirtAddr {
        VirtAddr(self.0 + KSEG0)
    }
}

impl fmt::LowerHex for PhysAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::LowerHex::fmt(&self.0, f)
    }
}

/// Index of a physical frame in the frame table.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct FrameIndex(pub usize);

impl FrameIndex {
    #[inline]
    pub const fn paddr(self) -> PhysAddr {
        PhysAddr(self.0 * PAGE_SIZE)
    }
}

/// Stable identifier of an address space.
///
/// **Ownership**: only `Vm` mints these; identifiers are never reused, so a
/// frame's back-reference to a destroyed space simply fails to resolve.
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[repr(transparent)]
pub struct AsId(u64);

impl AsId {
    #[inline]
    pub(crate) const fn from_raw(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u64 {
        self.0
    }
}

impl fmt::Display for AsId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "as{}", self.0)
    }
}

/// Process identifier (PID).
///
/// **Ownership**: only `ProcessTable` can create/destroy PIDs.
/// **Invariant**: PID 0 is reserved for the kernel and never assigned.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct Pid(u32);

impl Pid {
    /// Kernel PID (reserved, never assigned to a process).
    pub const KERNEL: Self = Self(0);

    #[inline]
    pub const fn from_raw(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn as_raw(self) -> u32 {
        self.0
    }

    /// Returns the PID as an index into the process table.
    #[inline]
    pub const fn as_index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for Pid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Index of a processor.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(transparent)]
pub struct CpuId(pub usize);

/// An untrusted address supplied by user space.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct UserPtr(usize);

impl UserPtr {
    pub const NULL: Self = Self(0);

    #[inline]
    pub const fn new(addr: usize) -> Self {
        Self(addr)
    }

    #[inline]
    pub const fn raw(self) -> usize {
        self.0
    }

    #[inline]
    pub const fn is_null(self) -> bool {
        self.0 == 0
    }

    #[inline]
    pub const fn is_aligned(self, align: usize) -> bool {
        self.0 % align == 0
    }

    #[inline]
    pub const fn addr(self) -> VirtAddr {
        VirtAddr(self.0)
    }

    #[inline]
    pub fn offset(self, bytes: usize) -> Option<Self> {
        self.0.checked_add(bytes).map(Self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn alignment_helpers() {
        assert_eq!(page_align_down(0x1003), 0x1000);
        assert_eq!(page_align_up(0x1003), 0x2000);
        assert_eq!(page_align_up(0x2000), 0x2000);
        assert_eq!(page_align_up(usize::MAX), PAGE_FRAME);
    }

    #[test]
    fn frame_and_kseg0_mapping() {
        let pa = FrameIndex(3).paddr();
        assert_eq!(pa.raw(), 3 * PAGE_SIZE);
        assert_eq!(pa.to_kvaddr().raw(), KSEG0 + 3 * PAGE_SIZE);
        assert_eq!(PhysAddr::new(3 * PAGE_SIZE + 12).frame(), FrameIndex(3));
    }

    #[test]
    fn user_ptr_alignment() {
        assert!(UserPtr::new(0x1000).is_aligned(4));
        assert!(!UserPtr::new(0x1002).is_aligned(4));
        assert!(UserPtr::NULL.is_null());
    }
}

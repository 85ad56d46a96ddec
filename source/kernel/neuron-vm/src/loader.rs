// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Executable loading seam used by exec
//! OWNERS: @runtime
//! PUBLIC API: ProgramSource, Executable, LoadTarget, ProgramRegistry, SegmentImage, Segment
//! DEPENDS_ON: vm (regions, user copies), parking_lot::RwLock (registry)
//! INVARIANTS: Segments are written between prepare_load and complete_load, so
//!             read-only text is still writable while it is being filled

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::RwLock;

use crate::error::{Result, VmError};
use crate::mm::RegionPerm;
use crate::types::{AsId, UserPtr, VirtAddr};
use crate::vm::Vm;

/// Address space an executable is being loaded into.
pub struct LoadTarget<'a> {
    vm: &'a Vm,
    space: AsId,
}

impl<'a> LoadTarget<'a> {
    pub fn new(vm: &'a Vm, space: AsId) -> Self {
        Self { vm, space }
    }

    pub fn space(&self) -> AsId {
        self.space
    }

    pub fn define_region(&mut self, vaddr: usize, size: usize, perm: RegionPerm) -> Result<()> {
        self.vm
            .define_region(
                self.space,
                vaddr,
                size,
                perm.contains(RegionPerm::READ),
                perm.contains(RegionPerm::WRITE),
                perm.contains(RegionPerm::EXECUTE),
            )
            .map(|_| ())
    }

    pub fn prepare_load(&mut self) -> Result<()> {
        self.vm.prepare_load(self.space)
    }

    pub fn complete_load(&mut self) -> Result<()> {
        self.vm.complete_load(self.space)
    }

    /// Copies file contents into the space at `vaddr`.
    pub fn write(&mut self, vaddr: VirtAddr, data: &[u8]) -> Result<()> {
        self.vm.copy_out(self.space, UserPtr::new(vaddr.raw()), data)
    }
}

/// A program image that can populate an address space.
pub trait Executable: Send + Sync {
    /// Defines regions, fills them and returns the entry point.
    fn load(&self, target: &mut LoadTarget<'_>) -> Result<VirtAddr>;
}

/// Resolves program paths.
pub trait ProgramSource: Send + Sync {
    fn open(&self, path: &str) -> Result<Arc<dyn Executable>>;
}

/// One loadable segment.
#[derive(Debug, Clone)]
pub struct Segment {
    pub vaddr: VirtAddr,
    /// Size in memory; bytes past `data` are zero.
    pub mem_size: usize,
    pub data: Vec<u8>,
    pub perm: RegionPerm,
}

/// An in-memory executable made of segments.
#[derive(Debug, Clone)]
pub struct SegmentImage {
    pub entry: VirtAddr,
    pub segments: Vec<Segment>,
}

impl SegmentImage {
    fn validate(&self) -> Result<()> {
        if self.segments.is_empty() {
            return Err(VmError::NotExecutable);
        }
        for segment in &self.segments {
            if segment.mem_size == 0 || segment.data.len() > segment.mem_size || segment.vaddr.raw() == 0 {
                return Err(VmError::NotExecutable);
            }
            segment.vaddr.checked_add(segment.mem_size).ok_or(VmError::NotExecutable)?;
        }
        let entry_ok = self.segments.iter().any(|segment| {
            segment.perm.contains(RegionPerm::EXECUTE)
                && self.entry >= segment.vaddr
                && self.entry.raw() < segment.vaddr.raw() + segment.mem_size
        });
        if !entry_ok {
            return Err(VmError::NotExecutable);
        }
        Ok(())
    }
}

impl Executable for SegmentImage {
    fn load(&self, target: &mut LoadTarget<'_>) -> Result<VirtAddr> {
        self.validate()?;
        for segment in &self.segments {
            target.define_region(segment.vaddr.raw(), segment.mem_size, segment.perm)?;
        }
        target.prepare_load()?;
        for segment in self.segments.iter().filter(|segment| !segment.data.is_empty()) {
            target.write(segment.vaddr, &segment.data)?;
        }
        target.complete_load()?;
        Ok(self.entry)
    }
}

/// Path-to-image table.
#[derive(Default)]
pub struct ProgramRegistry {
    programs: RwLock<HashMap<String, Arc<dyn Executable>>>,
}

impl ProgramRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, path: impl Into<String>, program: Arc<dyn Executable>) {
        self.programs.write().insert(path.into(), program);
    }
}

impl ProgramSource for ProgramRegistry {
    fn open(&self, path: &str) -> Result<Arc<dyn Executable>> {
        self.programs.read().get(path).cloned().ok_or(VmError::NotFound)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn image(entry: usize) -> SegmentImage {
        SegmentImage {
            entry: VirtAddr::new(entry),
            segments: vec![Segment {
                vaddr: VirtAddr::new(0x40_0000),
                mem_size: 0x100,
                data: vec![1, 2, 3],
                perm: RegionPerm::READ | RegionPerm::EXECUTE,
            }],
        }
    }

    #[test]
    fn entry_must_be_in_text() {
        assert!(image(0x40_0010).validate().is_ok());
        assert_eq!(image(0x50_0000).validate(), Err(VmError::NotExecutable));
    }

    #[test]
    fn oversized_file_data_rejected() {
        let mut bad = image(0x40_0000);
        bad.segments[0].data = vec![0; 0x101];
        assert_eq!(bad.validate(), Err(VmError::NotExecutable));
    }

    #[test]
    fn registry_lookup() {
        let registry = ProgramRegistry::new();
        registry.register("/bin/true", Arc::new(image(0x40_0000)));
        assert!(registry.open("/bin/true").is_ok());
        assert_eq!(registry.open("/bin/false").err(), Some(VmError::NotFound));
    }
}

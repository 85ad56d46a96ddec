// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Checked copies between kernel buffers and user address spaces.
//!
//! Every page touched is made resident through the pager, so a copy can
//! fault pages in from the backing store and marks written pages dirty.

use crate::error::{Result, VmError};
use crate::mm::AddressSpace;
use crate::types::{AsId, FrameIndex, UserPtr, VirtAddr, PAGE_SIZE};

use super::Vm;

impl Vm {
    /// Walks `[start, start + len)` one page at a time.
    fn for_each_page(
        &self,
        space: &AddressSpace,
        start: UserPtr,
        len: usize,
        write: bool,
        mut f: impl FnMut(FrameIndex, usize, core::ops::Range<usize>),
    ) -> Result<()> {
        if start.is_null() {
            return Err(VmError::BadAddress);
        }
        start.offset(len).ok_or(VmError::BadAddress)?;
        let mut done = 0;
        while done < len {
            let vaddr = VirtAddr::new(start.raw() + done);
            let chunk = (PAGE_SIZE - vaddr.page_offset()).min(len - done);
            let range = done..done + chunk;
            self.with_resident_page(space, vaddr, write, |_, frame, _| f(frame, vaddr.page_offset(), range))?;
            done += chunk;
        }
        Ok(())
    }

    /// Copies `buf.len()` bytes from user address `src` of `id`.
    pub fn copy_in(&self, id: AsId, src: UserPtr, buf: &mut [u8]) -> Result<()> {
        let space = self.space(id).ok_or(VmError::BadAddress)?;
        self.for_each_page(&space, src, buf.len(), false, |frame, offset, range| {
            self.frames.read_bytes(frame, offset, &mut buf[range]);
        })
    }

    /// Copies `data` to user address `dst` of `id`; the target must be writable.
    pub fn copy_out(&self, id: AsId, dst: UserPtr, data: &[u8]) -> Result<()> {
        let space = self.space(id).ok_or(VmError::BadAddress)?;
        self.for_each_page(&space, dst, data.len(), true, |frame, offset, range| {
            self.frames.write_bytes(frame, offset, &data[range]);
        })
    }

    /// Copies a NUL-terminated string of at most `max` bytes (terminator included).
    ///
    /// Non-UTF-8 contents are `InvalidArgument`; use [`Vm::copy_in_cstr`] for raw bytes.
    pub fn copy_in_str(&self, id: AsId, src: UserPtr, max: usize) -> Result<String> {
        let bytes = self.copy_in_cstr(id, src, max)?;
        String::from_utf8(bytes).map_err(|_| VmError::InvalidArgument)
    }

    /// Copies the bytes of a NUL-terminated string, terminator excluded.
    pub fn copy_in_cstr(&self, id: AsId, src: UserPtr, max: usize) -> Result<Vec<u8>> {
        let space = self.space(id).ok_or(VmError::BadAddress)?;
        if src.is_null() {
            return Err(VmError::BadAddress);
        }
        let mut bytes = Vec::new();
        let mut page = [0u8; PAGE_SIZE];
        while bytes.len() < max {
            let at = src.offset(bytes.len()).ok_or(VmError::BadAddress)?;
            let offset = at.addr().page_offset();
            let chunk = (PAGE_SIZE - offset).min(max - bytes.len());
            self.with_resident_page(&space, at.addr(), false, |_, frame, _| {
                self.frames.read_bytes(frame, offset, &mut page[..chunk]);
            })?;
            if let Some(nul) = page[..chunk].iter().position(|b| *b == 0) {
                bytes.extend_from_slice(&page[..nul]);
                return Ok(bytes);
            }
            bytes.extend_from_slice(&page[..chunk]);
        }
        Err(VmError::NameTooLong)
    }

    /// Reads one big-endian 32-bit user word.
    pub fn copy_in_word(&self, id: AsId, src: UserPtr) -> Result<u32> {
        let mut word = [0u8; 4];
        self.copy_in(id, src, &mut word)?;
        Ok(u32::from_be_bytes(word))
    }

    /// Writes one big-endian 32-bit user word.
    pub fn copy_out_word(&self, id: AsId, dst: UserPtr, value: u32) -> Result<()> {
        self.copy_out(id, dst, &value.to_be_bytes())
    }
}

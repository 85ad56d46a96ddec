// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Program replacement (`execv`).
//!
//! Arguments are marshalled into kernel memory before the old image is
//! detached, so a failed exec can always hand the caller its old space back.
//! User stack layout at entry, growing down from the stack top:
//!
//! ```text
//! sp ->  argv[0] .. argv[argc-1], NULL      (32-bit big-endian pointers)
//!        "arg0\0" padded to 4, "arg1\0" ...
//! top
//! ```

use crate::error::{Result, VmError};
use crate::kernel::Kernel;
use crate::loader::{Executable, LoadTarget};
use crate::thread::ThreadCtx;
use crate::types::{AsId, UserPtr, VirtAddr};

/// Longest program path accepted, terminator included.
pub const PATH_MAX: usize = 1024;

const WORD: usize = 4;

/// Where a freshly exec'd program starts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserEntry {
    pub entry: VirtAddr,
    pub argc: usize,
    pub argv: UserPtr,
    pub sp: UserPtr,
}

/// Argument strings copied into the kernel, NUL-padded to word size.
#[derive(Debug, Default)]
struct ArgBuffer {
    args: Vec<Vec<u8>>,
    string_bytes: usize,
}

impl ArgBuffer {
    fn padded_len(len: usize) -> usize {
        (len + 1 + WORD - 1) & !(WORD - 1)
    }

    /// Bytes the strings plus the NULL-terminated pointer vector need.
    fn footprint(&self) -> usize {
        self.string_bytes + WORD * (self.args.len() + 1)
    }

    fn push(&mut self, arg: &[u8], max_args: usize, arg_max: usize) -> Result<()> {
        if self.args.len() >= max_args {
            return Err(VmError::ArgListTooLong);
        }
        let padded = Self::padded_len(arg.len());
        if self.footprint() + padded + WORD > arg_max {
            return Err(VmError::ArgListTooLong);
        }
        let mut bytes = Vec::with_capacity(padded);
        bytes.extend_from_slice(arg);
        bytes.resize(padded, 0);
        self.string_bytes += padded;
        self.args.push(bytes);
        Ok(())
    }

    /// Room left for the next string, terminator included.
    fn remaining(&self, arg_max: usize) -> usize {
        arg_max.saturating_sub(self.footprint() + WORD)
    }
}

impl Kernel {
    /// Replaces the calling process's image with the program at user `path`,
    /// passing the NULL-terminated user vector `argv`.
    ///
    /// The path must be UTF-8; argument strings are passed through as bytes.
    pub fn sys_execv(&self, thread: &mut ThreadCtx, path: UserPtr, argv: UserPtr) -> Result<UserEntry> {
        let space = thread.addrspace.ok_or(VmError::BadAddress)?;
        let vm = self.vm();
        let path = vm.copy_in_str(space, path, PATH_MAX)?;
        if argv.is_null() || !argv.is_aligned(WORD) {
            return Err(VmError::BadAddress);
        }

        let (max_args, arg_max) = (vm.config().max_args, vm.config().arg_max);
        let mut args = ArgBuffer::default();
        for index in 0.. {
            let slot = argv.offset(index * WORD).ok_or(VmError::BadAddress)?;
            let ptr = vm.copy_in_word(space, slot)?;
            if ptr == 0 {
                break;
            }
            if index >= max_args {
                return Err(VmError::ArgListTooLong);
            }
            let arg = vm
                .copy_in_cstr(space, UserPtr::new(ptr as usize), args.remaining(arg_max))
                .map_err(|err| if err == VmError::NameTooLong { VmError::ArgListTooLong } else { err })?;
            args.push(&arg, max_args, arg_max)?;
        }
        self.replace_image(thread, &path, args)
    }

    /// Exec with kernel-supplied path and arguments (used to start init).
    ///
    /// The thread may have no address space yet; on failure it is left without one.
    pub fn exec_kernel(&self, thread: &mut ThreadCtx, path: &str, argv: &[&str]) -> Result<UserEntry> {
        let config = self.vm().config();
        let mut args = ArgBuffer::default();
        for arg in argv {
            args.push(arg.as_bytes(), config.max_args, config.arg_max)?;
        }
        self.replace_image(thread, path, args)
    }

    fn replace_image(&self, thread: &mut ThreadCtx, path: &str, args: ArgBuffer) -> Result<UserEntry> {
        let program = self.programs().open(path)?;
        let vm = self.vm();
        let old = thread.addrspace.take();
        let new = vm.create();
        thread.addrspace = Some(new);
        vm.activate(thread.cpu);

        match self.load_image(new, program.as_ref(), &args) {
            Ok(entry) => {
                if let Some(old) = old {
                    vm.destroy(old);
                }
                log::debug!(target: "task", "pid {} exec {} argc={}", thread.pid, path, entry.argc);
                Ok(entry)
            }
            Err(err) => {
                vm.destroy(new);
                thread.addrspace = old;
                vm.activate(thread.cpu);
                log::warn!(target: "task", "pid {} exec {} failed: {}", thread.pid, path, err);
                Err(err)
            }
        }
    }

    fn load_image(&self, space: AsId, program: &dyn Executable, args: &ArgBuffer) -> Result<UserEntry> {
        let vm = self.vm();
        let entry = program.load(&mut LoadTarget::new(vm, space))?;
        let top = vm.define_stack(space)?;

        let sp = top.raw().checked_sub(args.footprint()).ok_or(VmError::ArgListTooLong)? & !7;
        let mut string_at = sp + WORD * (args.args.len() + 1);
        for (index, arg) in args.args.iter().enumerate() {
            vm.copy_out(space, UserPtr::new(string_at), arg)?;
            vm.copy_out_word(space, UserPtr::new(sp + index * WORD), string_at as u32)?;
            string_at += arg.len();
        }
        vm.copy_out_word(space, UserPtr::new(sp + args.args.len() * WORD), 0)?;

        let sp = UserPtr::new(sp);
        Ok(UserEntry { entry, argc: args.args.len(), argv: sp, sp })
    }
}

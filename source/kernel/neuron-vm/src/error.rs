// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Recoverable error taxonomy of the VM core and process calls
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmError, errno constants, Result
//! INVARIANTS: Internal invariant violations never surface here; they panic

/// Error numbers reported to user space by the syscall glue.
pub mod errno {
    pub const ENOMEM: i32 = 3;
    pub const EFAULT: i32 = 6;
    pub const ENAMETOOLONG: i32 = 7;
    pub const EINVAL: i32 = 8;
    pub const ENPROC: i32 = 12;
    pub const ENOEXEC: i32 = 13;
    pub const E2BIG: i32 = 14;
    pub const ESRCH: i32 = 15;
    pub const ECHILD: i32 = 16;
    pub const ENOENT: i32 = 19;
    pub const EIO: i32 = 32;
}

/// Result alias for VM and process operations.
pub type Result<T> = core::result::Result<T, VmError>;

/// Errors surfaced to callers of the VM core.
#[must_use = "vm errors must be handled explicitly"]
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum VmError {
    /// No frame, swap slot, or kernel memory could be obtained.
    #[error("out of memory")]
    OutOfMemory,
    /// Address is outside every mapping or failed a user-copy check.
    #[error("bad address")]
    BadAddress,
    /// Caller supplied an unsupported value (fault type, wait option, ...).
    #[error("invalid argument")]
    InvalidArgument,
    /// Every translation-cache slot already holds a valid mapping.
    #[error("translation cache exhausted")]
    TlbFull,
    /// Pid is out of range or has no live descriptor.
    #[error("no such process")]
    NoSuchProcess,
    /// Caller is not the recorded parent of the target.
    #[error("not a child of the caller")]
    NotChild,
    /// Process table has no free slot.
    #[error("too many processes")]
    ProcessLimit,
    /// Argument vector exceeds the configured limits.
    #[error("argument list too long")]
    ArgListTooLong,
    /// A user string did not terminate within its bound.
    #[error("name too long")]
    NameTooLong,
    /// Program path does not name a known executable.
    #[error("no such file")]
    NotFound,
    /// Executable image is malformed.
    #[error("exec format error")]
    NotExecutable,
    /// Backing-store transfer failed.
    #[error("backing store i/o error")]
    Io,
}

impl VmError {
    /// Error number reported to user space.
    pub const fn errno(self) -> i32 {
        match self {
            VmError::OutOfMemory => errno::ENOMEM,
            VmError::BadAddress | VmError::TlbFull => errno::EFAULT,
            VmError::InvalidArgument => errno::EINVAL,
            VmError::NoSuchProcess => errno::ESRCH,
            VmError::NotChild => errno::ECHILD,
            VmError::ProcessLimit => errno::ENPROC,
            VmError::ArgListTooLong => errno::E2BIG,
            VmError::NameTooLong => errno::ENAMETOOLONG,
            VmError::NotFound => errno::ENOENT,
            VmError::NotExecutable => errno::ENOEXEC,
            VmError::Io => errno::EIO,
        }
    }
}

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! Saved user register state (MIPS o32 numbering).

/// Syscall return value.
pub const REG_V0: usize = 2;
/// Syscall error flag.
pub const REG_A3: usize = 7;
pub const REG_SP: usize = 29;

/// User registers captured on kernel entry.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub struct TrapFrame {
    pub gpr: [u32; 32],
    /// Address of the trapping instruction.
    pub epc: u32,
}

impl TrapFrame {
    /// Frame a forked child resumes with: fork returns 0 without error,
    /// past the syscall instruction.
    pub fn child_return(&self) -> Self {
        let mut frame = *self;
        frame.gpr[REG_V0] = 0;
        frame.gpr[REG_A3] = 0;
        frame.epc = frame.epc.wrapping_add(4);
        frame
    }
}

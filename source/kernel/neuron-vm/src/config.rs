// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Boot-time tunables for the VM core and process table
//! OWNERS: @kernel-mm-team
//! PUBLIC API: VmConfig, ConfigError
//! DEPENDS_ON: serde, toml
//! INVARIANTS: A validated config always leaves at least one dynamic frame and one CPU
//!
//! Host builds read these from a TOML document; every key is optional and
//! defaults to the values the kernel boots with.

use serde::Deserialize;
use thiserror::Error;

use crate::mm::RamRange;
use crate::types::{PhysAddr, KSEG0, PAGE_SIZE};

/// Errors produced while loading a [`VmConfig`].
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to parse vm config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("invalid vm config: {0}")]
    Invalid(&'static str),
}

/// Machine and policy parameters consumed by [`crate::Vm`] and [`crate::Kernel`].
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VmConfig {
    /// Bytes of physical RAM, including the kernel image.
    pub ram_bytes: usize,
    /// First free physical address after the kernel image.
    pub kernel_image_bytes: usize,
    /// Number of processors, each with its own translation cache.
    pub cpus: usize,
    /// Slots per translation cache.
    pub tlb_slots: usize,
    /// Pages in the implicit user stack window.
    pub stack_pages: usize,
    /// Top of user space; the initial user stack pointer.
    pub user_stack_top: usize,
    /// Capacity of the process table (pid 0 is never assigned).
    pub pid_limit: usize,
    /// Byte budget for exec argument strings and their pointer vector.
    pub arg_max: usize,
    /// Maximum number of exec arguments.
    pub max_args: usize,
    /// Seed for random victim selection.
    pub victim_seed: u64,
}

impl Default for VmConfig {
    fn default() -> Self {
        Self {
            ram_bytes: 1024 * 1024,
            kernel_image_bytes: 64 * 1024,
            cpus: 1,
            tlb_slots: 64,
            stack_pages: 12,
            user_stack_top: KSEG0,
            pid_limit: 128,
            arg_max: 64 * 1024,
            max_args: 1024,
            victim_seed: 0x6e6575726f6e,
        }
    }
}

impl VmConfig {
    /// Parses and validates a TOML document.
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        let config: VmConfig = toml::from_str(input)?;
        config.validate()?;
        Ok(config)
    }

    /// Physical memory left to the frame table once the kernel image is loaded.
    pub fn ram_range(&self) -> RamRange {
        RamRange { first_free: PhysAddr::new(self.kernel_image_bytes), last: PhysAddr::new(self.ram_bytes) }
    }

    /// Checks cross-field constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.cpus == 0 {
            return Err(ConfigError::Invalid("cpus must be non-zero"));
        }
        if self.tlb_slots == 0 {
            return Err(ConfigError::Invalid("tlb_slots must be non-zero"));
        }
        if self.kernel_image_bytes == 0 || self.kernel_image_bytes >= self.ram_bytes {
            return Err(ConfigError::Invalid("kernel image must lie inside ram"));
        }
        if self.ram_bytes / PAGE_SIZE < 4 {
            return Err(ConfigError::Invalid("ram must hold at least four frames"));
        }
        let range = self.ram_range();
        if range.first_dynamic() >= range.total_frames() {
            return Err(ConfigError::Invalid("kernel image and frame table leave no dynamic frames"));
        }
        if self.user_stack_top % PAGE_SIZE != 0 || self.user_stack_top > KSEG0 {
            return Err(ConfigError::Invalid("user_stack_top must be page aligned and below kseg0"));
        }
        if self.stack_pages == 0 || self.stack_pages * PAGE_SIZE >= self.user_stack_top {
            return Err(ConfigError::Invalid("stack window does not fit below user_stack_top"));
        }
        if self.pid_limit < 2 {
            return Err(ConfigError::Invalid("pid_limit must leave room for one process"));
        }
        if self.max_args == 0 || self.arg_max < 8 {
            return Err(ConfigError::Invalid("argument limits too small"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mm::frame::DESCRIPTOR_BYTES;

    #[test]
    fn defaults_validate() {
        VmConfig::default().validate().expect("defaults are valid");
    }

    #[test]
    fn partial_document_keeps_defaults() {
        let config = VmConfig::from_toml_str("cpus = 4\ntlb_slots = 8\n").expect("parse");
        assert_eq!(config.cpus, 4);
        assert_eq!(config.tlb_slots, 8);
        assert_eq!(config.stack_pages, VmConfig::default().stack_pages);
    }

    #[test]
    fn unknown_keys_rejected() {
        let err = VmConfig::from_toml_str("swap_file = \"/dev/lhd0\"\n").unwrap_err();
        assert!(matches!(err, ConfigError::Parse(_)));
    }

    #[test]
    fn image_and_table_must_leave_a_dynamic_frame() {
        let config = VmConfig { ram_bytes: 16 * PAGE_SIZE, kernel_image_bytes: 16 * PAGE_SIZE - 1, ..VmConfig::default() };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        // The 16-descriptor table spills one byte into the last frame.
        let config = VmConfig {
            ram_bytes: 16 * PAGE_SIZE,
            kernel_image_bytes: 15 * PAGE_SIZE - 16 * DESCRIPTOR_BYTES + 1,
            ..VmConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));

        let config = VmConfig { ram_bytes: 16 * PAGE_SIZE, kernel_image_bytes: 14 * PAGE_SIZE, ..VmConfig::default() };
        config.validate().expect("one dynamic frame left");
        assert_eq!(config.ram_range().first_dynamic(), 15);
    }

    #[test]
    fn kernel_image_must_fit() {
        let err = VmConfig::from_toml_str("ram_bytes = 65536\nkernel_image_bytes = 65536\n")
            .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }
}

// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process-level kernel context: VM plus process table and collaborators
//! OWNERS: @runtime
//! PUBLIC API: Kernel
//! DEPENDS_ON: vm::Vm, task::ProcessTable, loader::ProgramSource, thread::ThreadSpawner

use std::sync::Arc;

use crate::config::{ConfigError, VmConfig};
use crate::loader::ProgramSource;
use crate::swap::BackingStore;
use crate::task::ProcessTable;
use crate::thread::ThreadSpawner;
use crate::vm::Vm;

/// Everything the process system calls operate on.
pub struct Kernel {
    vm: Vm,
    processes: ProcessTable,
    programs: Arc<dyn ProgramSource>,
    spawner: Arc<dyn ThreadSpawner>,
}

static_assertions::assert_impl_all!(Kernel: Send, Sync);

impl Kernel {
    pub fn new(
        config: VmConfig,
        swap: Box<dyn BackingStore>,
        programs: Arc<dyn ProgramSource>,
        spawner: Arc<dyn ThreadSpawner>,
    ) -> Result<Self, ConfigError> {
        let processes = ProcessTable::new(config.pid_limit);
        let vm = Vm::new(config, swap)?;
        log::info!(target: "task", "kernel up: {} pids, {} cpus", processes.capacity(), vm.cpus().len());
        Ok(Self { vm, processes, programs, spawner })
    }

    pub fn vm(&self) -> &Vm {
        &self.vm
    }

    pub fn processes(&self) -> &ProcessTable {
        &self.processes
    }

    pub(crate) fn programs(&self) -> &dyn ProgramSource {
        self.programs.as_ref()
    }

    pub(crate) fn spawner(&self) -> &dyn ThreadSpawner {
        self.spawner.as_ref()
    }
}

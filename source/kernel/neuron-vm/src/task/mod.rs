// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Process table and the fork/exit/waitpid system calls
//! OWNERS: @kernel-sched-team
//! STATUS: Functional
//! PUBLIC API: ProcessTable, ProcessDescriptor, Kernel::{spawn_init, sys_fork, sys_exit, sys_waitpid, enter_forked}
//! DEPENDS_ON: vm::Vm (address-space copy/destroy), thread::ThreadSpawner, parking_lot
//! INVARIANTS: Pid 0 is never assigned; a descriptor is collected by its parent at most once;
//!             exit status is published under the descriptor lock before waiters are woken

mod exec;

pub use exec::UserEntry;

use std::sync::Arc;

use parking_lot::{Condvar, Mutex};

use crate::error::{Result, VmError};
use crate::kernel::Kernel;
use crate::thread::{ForkedChild, ThreadCtx};
use crate::trap::TrapFrame;
use crate::types::{CpuId, Pid, UserPtr};

/// Return immediately if the child has not exited.
pub const WNOHANG: i32 = 1;
/// Accepted for compatibility; stopped children are never reported.
pub const WUNTRACED: i32 = 2;

/// Wait status of a process that exited with `code`.
pub const fn mkwait_exit(code: i32) -> i32 {
    code << 2
}

#[derive(Debug, Default)]
struct ExitState {
    exited: bool,
    status: i32,
}

/// Parent link and exit status of one process.
#[derive(Debug)]
pub struct ProcessDescriptor {
    pid: Pid,
    ppid: Pid,
    exit: Mutex<ExitState>,
    exited: Condvar,
}

impl ProcessDescriptor {
    fn new(pid: Pid, ppid: Pid) -> Self {
        Self { pid, ppid, exit: Mutex::new(ExitState::default()), exited: Condvar::new() }
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn ppid(&self) -> Pid {
        self.ppid
    }

    pub fn has_exited(&self) -> bool {
        self.exit.lock().exited
    }

    /// Encoded wait status once the process has exited.
    pub fn status(&self) -> Option<i32> {
        let exit = self.exit.lock();
        exit.exited.then_some(exit.status)
    }

    fn publish_exit(&self, code: i32) {
        let mut exit = self.exit.lock();
        exit.status = mkwait_exit(code);
        exit.exited = true;
        self.exited.notify_all();
    }

    fn wait_exit(&self) -> i32 {
        let mut exit = self.exit.lock();
        while !exit.exited {
            self.exited.wait(&mut exit);
        }
        exit.status
    }
}

/// Fixed-capacity table indexed by pid.
pub struct ProcessTable {
    slots: Mutex<Vec<Option<Arc<ProcessDescriptor>>>>,
}

impl ProcessTable {
    pub fn new(capacity: usize) -> Self {
        Self { slots: Mutex::new(vec![None; capacity]) }
    }

    pub fn capacity(&self) -> usize {
        self.slots.lock().len()
    }

    /// Assigns the lowest free pid, never 0.
    pub fn allocate(&self, ppid: Pid) -> Result<Arc<ProcessDescriptor>> {
        let mut slots = self.slots.lock();
        let index = slots.iter().skip(1).position(Option::is_none).map(|i| i + 1).ok_or(VmError::ProcessLimit)?;
        let desc = Arc::new(ProcessDescriptor::new(Pid::from_raw(index as u32), ppid));
        slots[index] = Some(Arc::clone(&desc));
        Ok(desc)
    }

    pub fn get(&self, pid: Pid) -> Option<Arc<ProcessDescriptor>> {
        self.slots.lock().get(pid.as_index()).cloned().flatten()
    }

    pub fn remove(&self, pid: Pid) -> Option<Arc<ProcessDescriptor>> {
        self.slots.lock().get_mut(pid.as_index()).and_then(Option::take)
    }

    /// Descriptors not yet collected.
    pub fn len(&self) -> usize {
        self.slots.lock().iter().filter(|slot| slot.is_some()).count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Kernel {
    /// Creates the first user process on `cpu`, parented by the kernel.
    pub fn spawn_init(&self, cpu: CpuId) -> Result<ThreadCtx> {
        let desc = self.processes().allocate(Pid::KERNEL)?;
        let space = self.vm().create();
        self.vm().activate(cpu);
        log::info!(target: "task", "init is pid {} in {}", desc.pid(), space);
        Ok(ThreadCtx::new(desc.pid(), cpu, Some(space)))
    }

    /// Terminates the calling process with `code`.
    ///
    /// The address space is torn down before the status becomes visible, so a
    /// parent that collects the status can rely on the memory being back.
    pub fn sys_exit(&self, mut thread: ThreadCtx, code: i32) {
        if let Some(space) = thread.addrspace.take() {
            self.vm().destroy(space);
        }
        match self.processes().get(thread.pid) {
            Some(desc) => desc.publish_exit(code),
            None => log::warn!(target: "task", "exit from pid {} without a descriptor", thread.pid),
        }
        log::debug!(target: "task", "pid {} exited with {}", thread.pid, code);
    }

    /// Waits for child `pid` and stores its status at `status`.
    ///
    /// Returns `Ok(None)` when `WNOHANG` is set and the child is still running.
    pub fn sys_waitpid(&self, thread: &ThreadCtx, pid: i32, status: UserPtr, options: i32) -> Result<Option<Pid>> {
        if !status.is_aligned(4) || status.is_null() {
            return Err(VmError::BadAddress);
        }
        if pid < 0 || pid as usize >= self.processes().capacity() {
            return Err(VmError::NoSuchProcess);
        }
        if !matches!(options, 0 | WNOHANG | WUNTRACED) {
            return Err(VmError::InvalidArgument);
        }
        let pid = Pid::from_raw(pid as u32);
        let desc = self.processes().get(pid).ok_or(VmError::NoSuchProcess)?;
        if desc.ppid() != thread.pid {
            return Err(VmError::NotChild);
        }
        if options == WNOHANG && !desc.has_exited() {
            return Ok(None);
        }

        let code = desc.wait_exit();
        let space = thread.addrspace.ok_or(VmError::BadAddress)?;
        self.vm().copy_out_word(space, status, code as u32)?;
        self.processes().remove(pid);
        log::debug!(target: "task", "pid {} collected {}", thread.pid, pid);
        Ok(Some(pid))
    }

    /// Duplicates the calling process; returns the child's pid to the parent.
    pub fn sys_fork(&self, thread: &ThreadCtx, frame: &TrapFrame) -> Result<Pid> {
        let parent_space = thread.addrspace.ok_or(VmError::BadAddress)?;
        let child_space = self.vm().copy(parent_space)?;
        let desc = match self.processes().allocate(thread.pid) {
            Ok(desc) => desc,
            Err(err) => {
                self.vm().destroy(child_space);
                return Err(err);
            }
        };
        let child = ForkedChild { thread: ThreadCtx::new(desc.pid(), thread.cpu, Some(child_space)), frame: *frame };
        if let Err(err) = self.spawner().spawn(child) {
            self.processes().remove(desc.pid());
            self.vm().destroy(child_space);
            return Err(err);
        }
        log::debug!(target: "task", "pid {} forked {}", thread.pid, desc.pid());
        Ok(desc.pid())
    }

    /// First run of a forked child: switch to its space and build the frame
    /// it returns to user mode with.
    pub fn enter_forked(&self, child: &ForkedChild) -> TrapFrame {
        self.vm().activate(child.thread.cpu);
        child.frame.child_return()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pids_start_at_one_and_are_reused() {
        let table = ProcessTable::new(4);
        let a = table.allocate(Pid::KERNEL).unwrap();
        let b = table.allocate(a.pid()).unwrap();
        assert_eq!(a.pid(), Pid::from_raw(1));
        assert_eq!(b.pid(), Pid::from_raw(2));
        assert_eq!(b.ppid(), a.pid());
        table.remove(a.pid());
        assert_eq!(table.allocate(Pid::KERNEL).unwrap().pid(), Pid::from_raw(1));
    }

    #[test]
    fn table_full_reports_process_limit() {
        let table = ProcessTable::new(3);
        table.allocate(Pid::KERNEL).unwrap();
        table.allocate(Pid::KERNEL).unwrap();
        assert_eq!(table.allocate(Pid::KERNEL).err(), Some(VmError::ProcessLimit));
        assert_eq!(table.len(), 2);
    }

    #[test]
    fn exit_status_encoding() {
        let desc = ProcessDescriptor::new(Pid::from_raw(3), Pid::from_raw(1));
        assert_eq!(desc.status(), None);
        desc.publish_exit(5);
        assert_eq!(desc.status(), Some(20));
        assert_eq!(desc.wait_exit(), mkwait_exit(5));
    }
}

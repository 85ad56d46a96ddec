// Copyright 2025 Open Nexus OS Contributors
// SPDX-License-Identifier: Apache-2.0

//! CONTEXT: Per-thread VM context and the thread-creation seam used by fork
//! OWNERS: @runtime
//! PUBLIC API: ThreadCtx, ForkedChild, ThreadSpawner, RunQueue

use std::collections::VecDeque;

use parking_lot::Mutex;

use crate::error::Result;
use crate::trap::TrapFrame;
use crate::types::{AsId, CpuId, Pid};

/// What the VM needs to know about the running thread.
#[derive(Debug, PartialEq, Eq)]
pub struct ThreadCtx {
    pub pid: Pid,
    /// Processor the thread runs on; faults install into its TLB.
    pub cpu: CpuId,
    pub addrspace: Option<AsId>,
}

impl ThreadCtx {
    pub fn new(pid: Pid, cpu: CpuId, addrspace: Option<AsId>) -> Self {
        Self { pid, cpu, addrspace }
    }
}

/// A child produced by fork, waiting for its first run.
#[derive(Debug)]
pub struct ForkedChild {
    pub thread: ThreadCtx,
    /// Parent's frame at the fork call, unadjusted.
    pub frame: TrapFrame,
}

/// Creates a kernel thread for a forked child.
pub trait ThreadSpawner: Send + Sync {
    fn spawn(&self, child: ForkedChild) -> Result<()>;
}

/// FIFO of children that have not run yet.
#[derive(Default)]
pub struct RunQueue {
    queue: Mutex<VecDeque<ForkedChild>>,
}

impl RunQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn pop(&self) -> Option<ForkedChild> {
        self.queue.lock().pop_front()
    }

    pub fn len(&self) -> usize {
        self.queue.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.queue.lock().is_empty()
    }
}

impl ThreadSpawner for RunQueue {
    fn spawn(&self, child: ForkedChild) -> Result<()> {
        log::trace!(target: "task", "queued child pid {}", child.thread.pid);
        self.queue.lock().push_back(child);
        Ok(())
    }
}

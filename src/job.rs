//! Inference jobs.
//!
//! A job is an ordered chain of tasks that runs on a single core, one task
//! per completion interrupt, so that on-chip SRAM contents survive from one
//! task to the next.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;
use core::fmt;
use core::sync::atomic::{AtomicU32, Ordering};

use crate::device::RocketDevice;
use crate::err::RocketError;
use crate::fence::{Fence, FenceResult};
use crate::gem::GemObject;
use crate::npu_core::Core;
use crate::osal::DmaAddr;
use crate::resv::ResvUsage;

/// One register-command buffer for the PC block to fetch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Task {
    pub regcmd: DmaAddr,
    pub regcmd_count: u32,
}

fn dedup_bos(bos: Vec<Arc<GemObject>>) -> Vec<Arc<GemObject>> {
    let mut unique: Vec<Arc<GemObject>> = Vec::with_capacity(bos.len());
    for bo in bos {
        if !unique.iter().any(|b| Arc::ptr_eq(b, &bo)) {
            unique.push(bo);
        }
    }
    unique
}

fn push_dependency(deps: &mut Vec<Fence>, fence: Fence) {
    if !deps.iter().any(|f| f.ptr_eq(&fence)) {
        deps.push(fence);
    }
}

/// A job that has been validated but not yet handed to the scheduler.
pub struct PendingJob {
    tasks: Vec<Task>,
    in_bos: Vec<Arc<GemObject>>,
    out_bos: Vec<Arc<GemObject>>,
    dependencies: Vec<Fence>,
}

impl PendingJob {
    pub fn new(
        tasks: Vec<Task>,
        in_bos: Vec<Arc<GemObject>>,
        out_bos: Vec<Arc<GemObject>>,
    ) -> Result<Self, RocketError> {
        if tasks.is_empty() || tasks.iter().any(|t| t.regcmd_count == 0) {
            return Err(RocketError::InvalidArgument);
        }

        Ok(Self {
            tasks,
            in_bos: dedup_bos(in_bos),
            out_bos: dedup_bos(out_bos),
            dependencies: Vec::new(),
        })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    /// Adds an explicit fence the job must wait for, on top of the implicit
    /// ones taken from its BOs.
    pub fn add_dependency(&mut self, fence: Fence) {
        push_dependency(&mut self.dependencies, fence);
    }
}

pub struct Job {
    dev: Weak<RocketDevice>,
    core: usize,
    in_bos: Vec<Arc<GemObject>>,
    out_bos: Vec<Arc<GemObject>>,
    tasks: Vec<Task>,
    /// Number of tasks already issued to the core. Only moves under the
    /// core's `job_lock`.
    next_task_idx: AtomicU32,
    dependencies: Vec<Fence>,
    done_fence: Fence,
    inference_done_fence: Fence,
}

impl Job {
    /// Binds a pending job to `core`, collecting its implicit dependencies
    /// and stamping both fences from the core's timeline.
    ///
    /// Must run under the device's `sched_lock` so that fence order matches
    /// push order.
    pub(crate) fn arm(pending: PendingJob, dev: Weak<RocketDevice>, core: &Core) -> Arc<Job> {
        let PendingJob {
            tasks,
            in_bos,
            out_bos,
            mut dependencies,
        } = pending;

        for bo in &in_bos {
            for fence in bo.resv().fences(ResvUsage::rw(false)) {
                push_dependency(&mut dependencies, fence);
            }
        }
        for bo in &out_bos {
            for fence in bo.resv().fences(ResvUsage::rw(true)) {
                push_dependency(&mut dependencies, fence);
            }
        }

        let done_fence = core.fence_context().create();
        let inference_done_fence = core.fence_context().create();

        Arc::new(Job {
            dev,
            core: core.index(),
            in_bos,
            out_bos,
            tasks,
            next_task_idx: AtomicU32::new(0),
            dependencies,
            done_fence,
            inference_done_fence,
        })
    }

    pub fn device(&self) -> Option<Arc<RocketDevice>> {
        self.dev.upgrade()
    }

    /// Index of the core the job was bound to.
    pub fn core(&self) -> usize {
        self.core
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn task_count(&self) -> u32 {
        self.tasks.len() as u32
    }

    pub fn next_task_idx(&self) -> u32 {
        self.next_task_idx.load(Ordering::Acquire)
    }

    pub fn in_bos(&self) -> &[Arc<GemObject>] {
        &self.in_bos
    }

    pub fn out_bos(&self) -> &[Arc<GemObject>] {
        &self.out_bos
    }

    pub fn dependencies(&self) -> &[Fence] {
        &self.dependencies
    }

    /// Signalled by the IRQ path once the last task completes, or with an
    /// error when the job is terminated.
    pub fn done_fence(&self) -> &Fence {
        &self.done_fence
    }

    /// Follows `done_fence`; this is the fence published on output BOs.
    pub fn inference_done_fence(&self) -> &Fence {
        &self.inference_done_fence
    }

    /// `None` while a dependency is pending, otherwise the first error seen.
    pub(crate) fn dependency_status(&self) -> Option<FenceResult> {
        let mut result = Ok(());
        for fence in &self.dependencies {
            match fence.status() {
                None => return None,
                Some(Err(e)) if result.is_ok() => result = Err(e),
                Some(_) => {}
            }
        }
        Some(result)
    }

    /// Claims the next task for issuing. Caller holds the core's `job_lock`.
    pub(crate) fn advance(&self) -> Option<Task> {
        let idx = self.next_task_idx.load(Ordering::Acquire);
        let task = *self.tasks.get(idx as usize)?;
        self.next_task_idx.store(idx + 1, Ordering::Release);
        Some(task)
    }

    /// The task issued last, which is the one the core is working on.
    pub(crate) fn current_task(&self) -> Option<Task> {
        let idx = self.next_task_idx.load(Ordering::Acquire);
        idx.checked_sub(1).and_then(|i| self.tasks.get(i as usize)).copied()
    }
}

impl fmt::Debug for Job {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Job")
            .field("core", &self.core)
            .field("task_count", &self.tasks.len())
            .field("next_task_idx", &self.next_task_idx())
            .field("in_bos", &self.in_bos.len())
            .field("out_bos", &self.out_bos.len())
            .field("done_fence", &self.done_fence)
            .finish()
    }
}

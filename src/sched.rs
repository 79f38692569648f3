//! Job scheduling across cores.
//!
//! Every open file owns an [`Entity`], a FIFO of its jobs. Each job is bound
//! to a core when it is pushed and waits in that core's [`RunQueue`] until its
//! dependencies signal and every earlier job of its entity has started. When
//! a core goes idle, entities with a runnable head job take turns.

use alloc::collections::VecDeque;
use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::Ordering;

use spin::Mutex;

use crate::device::RocketDevice;
use crate::err::RocketError;
use crate::job::{Job, PendingJob};
use crate::npu_core::Core;
use crate::registers::pc::regcmd_count_fits;
use crate::resv::ResvUsage;

struct EntityState {
    next_submit_seq: u64,
    next_run_seq: u64,
    stopped: bool,
}

/// A client's submission queue.
pub struct Entity {
    id: u64,
    state: Mutex<EntityState>,
}

impl Entity {
    pub(crate) fn new(id: u64) -> Arc<Self> {
        Arc::new(Self {
            id,
            state: Mutex::new(EntityState {
                next_submit_seq: 0,
                next_run_seq: 0,
                stopped: false,
            }),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    /// Jobs pushed to the entity that have not been handed to a core yet.
    pub fn pending_jobs(&self) -> u64 {
        let state = self.state.lock();
        state.next_submit_seq - state.next_run_seq
    }

    pub fn is_stopped(&self) -> bool {
        self.state.lock().stopped
    }

    fn reserve_seq(&self) -> Result<u64, RocketError> {
        let mut state = self.state.lock();
        if state.stopped {
            return Err(RocketError::Cancelled);
        }
        let seq = state.next_submit_seq;
        state.next_submit_seq += 1;
        Ok(seq)
    }

    fn is_next(&self, seq: u64) -> bool {
        self.state.lock().next_run_seq == seq
    }

    fn retire(&self) {
        self.state.lock().next_run_seq += 1;
    }

    fn stop(&self) {
        self.state.lock().stopped = true;
    }
}

pub(crate) struct QueuedJob {
    job: Arc<Job>,
    entity: Arc<Entity>,
    seq: u64,
}

/// Jobs bound to one core and not started yet.
pub(crate) struct RunQueue {
    jobs: VecDeque<QueuedJob>,
    last_entity: Option<u64>,
}

impl RunQueue {
    pub(crate) const fn new() -> Self {
        Self {
            jobs: VecDeque::new(),
            last_entity: None,
        }
    }

    pub(crate) fn len(&self) -> usize {
        self.jobs.len()
    }

    fn push_back(&mut self, queued: QueuedJob) {
        self.jobs.push_back(queued);
    }

    fn push_front(&mut self, queued: QueuedJob) {
        self.jobs.push_front(queued);
    }

    /// Pops the runnable job of the entity that follows the last one served.
    ///
    /// A job whose dependencies failed counts as runnable, so that it can be
    /// failed in order.
    fn pop_ready(&mut self) -> Option<QueuedJob> {
        let mut first: Option<(u64, usize)> = None;
        let mut after_last: Option<(u64, usize)> = None;

        for (pos, queued) in self.jobs.iter().enumerate() {
            if !queued.entity.is_next(queued.seq) || queued.job.dependency_status().is_none() {
                continue;
            }
            let id = queued.entity.id();
            if first.is_none_or(|(best, _)| id < best) {
                first = Some((id, pos));
            }
            if self.last_entity.is_some_and(|last| id > last)
                && after_last.is_none_or(|(best, _)| id < best)
            {
                after_last = Some((id, pos));
            }
        }

        let (id, pos) = after_last.or(first)?;
        self.last_entity = Some(id);
        self.jobs.remove(pos)
    }

    fn take_entity(&mut self, id: u64) -> Vec<QueuedJob> {
        let mut taken = Vec::new();
        let mut kept = VecDeque::with_capacity(self.jobs.len());
        for queued in self.jobs.drain(..) {
            if queued.entity.id() == id {
                taken.push(queued);
            } else {
                kept.push_back(queued);
            }
        }
        self.jobs = kept;
        taken
    }
}

impl RocketDevice {
    /// Core with the lowest pending depth, ties going to the lowest index.
    pub(crate) fn pick_core(&self) -> &Core {
        let mut best = &self.cores()[0];
        for core in self.cores().iter().skip(1) {
            if core.load() < best.load() {
                best = core;
            }
        }
        best
    }

    /// Binds `pending` to a core, publishes its fence on the output BOs and
    /// queues it behind the entity's earlier jobs.
    pub fn push_job(
        self: &Arc<Self>,
        entity: &Arc<Entity>,
        pending: PendingJob,
    ) -> Result<Arc<Job>, RocketError> {
        let scale = self.config().pc_data_amount_scale;
        if !pending
            .tasks()
            .iter()
            .all(|task| regcmd_count_fits(task.regcmd_count, scale))
        {
            return Err(RocketError::InvalidArgument);
        }

        let job = {
            let _guard = self.sched_lock().lock();
            let seq = entity.reserve_seq()?;
            let core = self.pick_core();
            let job = Job::arm(pending, Arc::downgrade(self), core);

            let load = core.load_counter().clone();
            load.fetch_add(1, Ordering::AcqRel);
            let inference_done = job.inference_done_fence().clone();
            job.done_fence().on_signaled(move |res| {
                load.fetch_sub(1, Ordering::AcqRel);
                if let Err(e) = inference_done.signal_result(res) {
                    warn!("inference-done fence signalled twice: {}", e);
                }
            });

            for bo in job.out_bos() {
                bo.resv()
                    .add_fence(job.inference_done_fence().clone(), ResvUsage::Write);
            }

            debug!(
                "entity {}: job {} bound to core {} with {} tasks, {} dependencies",
                entity.id(),
                seq,
                core.index(),
                job.task_count(),
                job.dependencies().len()
            );

            core.runqueue.lock().push_back(QueuedJob {
                job: job.clone(),
                entity: entity.clone(),
                seq,
            });
            job
        };

        self.schedule();
        Ok(job)
    }

    /// Hands runnable jobs to idle cores until no more progress is possible.
    pub fn schedule(&self) {
        loop {
            let mut progressed = false;

            for core in self.cores() {
                if !core.is_idle() {
                    continue;
                }
                let Some(queued) = core.runqueue.lock().pop_ready() else {
                    continue;
                };

                let result = match queued.job.dependency_status() {
                    Some(Err(e)) => Err(e),
                    _ => self.run_job(core, &queued.job),
                };

                match result {
                    Ok(()) => {
                        queued.entity.retire();
                        progressed = true;
                    }
                    Err(RocketError::Again) => {
                        core.runqueue.lock().push_front(queued);
                    }
                    Err(e) => {
                        warn!(
                            "core {}: job of entity {} failed before running: {}",
                            core.index(),
                            queued.entity.id(),
                            e
                        );
                        queued.entity.retire();
                        if let Err(e) = queued.job.done_fence().signal_error(e) {
                            warn!("core {}: done fence of unrun job: {}", core.index(), e);
                        }
                        self.retire_job(queued.job);
                        progressed = true;
                    }
                }
            }

            if !progressed {
                break;
            }
        }
    }

    /// Powers the core up and issues the first task of `job`.
    fn run_job(&self, core: &Core, job: &Arc<Job>) -> Result<(), RocketError> {
        let _guard = self.sched_lock().lock();
        if !core.is_idle() {
            return Err(RocketError::Again);
        }

        self.pm_runtime_get_sync(core.index())?;

        let deadline = self.job_deadline();
        if let Err(e) = core.start_job(job.clone(), deadline) {
            self.pm_runtime_put_autosuspend(core.index());
            return Err(e);
        }
        Ok(())
    }

    /// Stops `entity` and cancels every job it still has queued.
    ///
    /// Jobs already on a core are left to finish.
    pub fn entity_fini(&self, entity: &Entity) {
        let cancelled: Vec<QueuedJob> = {
            let _guard = self.sched_lock().lock();
            entity.stop();
            self.cores()
                .iter()
                .flat_map(|core| core.runqueue.lock().take_entity(entity.id()))
                .collect()
        };

        if !cancelled.is_empty() {
            debug!("entity {}: cancelling {} queued jobs", entity.id(), cancelled.len());
        }
        for queued in cancelled {
            if let Err(e) = queued.job.done_fence().signal_error(RocketError::Cancelled) {
                warn!("entity {}: done fence of cancelled job: {}", entity.id(), e);
            }
        }

        self.schedule();
    }
}

//! Per-core state: hardware handles, the in-flight slot and its watchdog.

use alloc::sync::Arc;
use core::mem;
use core::sync::atomic::{AtomicU32, AtomicUsize, Ordering};

use spin::Mutex;
use tock_registers::interfaces::{Readable, Writeable};

use crate::config::RocketConfig;
use crate::err::RocketError;
use crate::fence::FenceContext;
use crate::job::{Job, Task};
use crate::osal::{Clock, DmaDevice, IommuDomain, Osal, PowerDomain, ResetControl, ResourceProvider, TimeStamp};
use crate::pm::RuntimePm;
use crate::registers::RocketRegisters;
use crate::registers::consts::{INT_CLEAR_ALL, INT_DMA_READ_ERROR, INT_DMA_WRITE_ERROR, INT_DPU_DONE};
use crate::registers::pc::{build_pc_task_control, multicore_command_value, pc_data_amount};
use crate::sched::RunQueue;

/// Contents of a core's in-flight slot.
pub(crate) enum Slot {
    Idle,
    Running {
        job: Arc<Job>,
        deadline_us: TimeStamp,
        resets: u32,
    },
    Resetting {
        job: Arc<Job>,
        resets: u32,
    },
}

/// Observable state of a core's in-flight slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoreState {
    Idle,
    Running,
    Resetting,
}

/// What the interrupt handler found.
pub(crate) enum IrqOutcome {
    /// Not raised by this core.
    None,
    Handled,
    /// The last task of a job finished; the slot is already empty.
    Completed(Arc<Job>),
}

pub(crate) enum ResetOutcome {
    Nothing,
    Recovered,
    /// Retry budget used up; the slot is already empty.
    Failed(Arc<Job>),
}

pub struct Core {
    index: usize,
    regs: RocketRegisters,
    irq: u32,
    version: u32,
    a_clk: Arc<dyn Clock>,
    h_clk: Arc<dyn Clock>,
    a_reset: Arc<dyn ResetControl>,
    h_reset: Arc<dyn ResetControl>,
    pm_domain: Arc<dyn PowerDomain>,
    dma: Arc<dyn DmaDevice>,
    iommu: Option<Arc<dyn IommuDomain>>,
    pc_task_number_bits: u32,
    pc_data_amount_scale: u32,
    job_lock: Mutex<Slot>,
    reset_pending: AtomicU32,
    pub(crate) runqueue: Mutex<RunQueue>,
    /// Jobs bound to this core and not yet done, queued or in flight.
    load: Arc<AtomicUsize>,
    fence_ctx: FenceContext,
    pub(crate) pm: RuntimePm,
}

impl Core {
    /// Looks up the resources of core `index` in `node` and powers it up.
    pub(crate) fn init(
        index: usize,
        node: &dyn ResourceProvider,
        config: &RocketConfig,
        osal: &dyn Osal,
    ) -> Result<Self, RocketError> {
        let names = config
            .core_names(index)
            .ok_or(RocketError::InvalidArgument)?;

        let Some(base) = node.mmio(0) else {
            error!("core {}: no register window", index);
            return Err(RocketError::Fatal);
        };
        let irq = node
            .irq_byname(names.irq_name)
            .ok_or(RocketError::NotFound)?;
        let a_clk = node.clock(names.a_clk_name).ok_or(RocketError::Deferred)?;
        let h_clk = node.clock(names.h_clk_name).ok_or(RocketError::Deferred)?;
        let a_reset = node
            .reset(names.a_reset_name)
            .ok_or(RocketError::Deferred)?;
        let h_reset = node
            .reset(names.h_reset_name)
            .ok_or(RocketError::Deferred)?;
        let pm_domain = node
            .power_domain(names.pm_domain_name)
            .ok_or(RocketError::Deferred)?;

        let dma = node.dma_device();
        dma.set_dma_mask(config.dma_mask).inspect_err(|e| {
            error!("core {}: DMA mask {:#x} refused: {}", index, config.dma_mask, e);
        })?;

        a_clk.prepare_enable()?;
        if let Err(e) = h_clk.prepare_enable() {
            a_clk.disable_unprepare();
            return Err(e);
        }
        if let Err(e) = pm_domain.attach() {
            h_clk.disable_unprepare();
            a_clk.disable_unprepare();
            return Err(e);
        }

        // SAFETY: `ResourceProvider` guarantees the window stays mapped for
        // the lifetime of the device.
        let regs = unsafe { RocketRegisters::new(base) };
        let version = regs.version();
        info!("core {}: hardware version {:#x}, irq {}", index, version, irq);

        Ok(Self {
            index,
            regs,
            irq,
            version,
            a_clk,
            h_clk,
            a_reset,
            h_reset,
            pm_domain,
            dma,
            iommu: node.iommu_domain(),
            pc_task_number_bits: config.pc_task_number_bits,
            pc_data_amount_scale: config.pc_data_amount_scale,
            job_lock: Mutex::new(Slot::Idle),
            reset_pending: AtomicU32::new(0),
            runqueue: Mutex::new(RunQueue::new()),
            load: Arc::new(AtomicUsize::new(0)),
            fence_ctx: FenceContext::new(),
            pm: RuntimePm::new(osal.get_time_us()),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn dma(&self) -> &Arc<dyn DmaDevice> {
        &self.dma
    }

    pub fn iommu(&self) -> Option<&Arc<dyn IommuDomain>> {
        self.iommu.as_ref()
    }

    pub fn fence_context(&self) -> &FenceContext {
        &self.fence_ctx
    }

    /// Pending depth: jobs bound to the core whose done fence has not
    /// signalled yet.
    pub fn load(&self) -> usize {
        self.load.load(Ordering::Acquire)
    }

    pub(crate) fn load_counter(&self) -> &Arc<AtomicUsize> {
        &self.load
    }

    pub fn state(&self) -> CoreState {
        match &*self.job_lock.lock() {
            Slot::Idle => CoreState::Idle,
            Slot::Running { .. } => CoreState::Running,
            Slot::Resetting { .. } => CoreState::Resetting,
        }
    }

    /// True when nothing is in flight and no reset is pending.
    pub fn is_idle(&self) -> bool {
        self.reset_pending.load(Ordering::Acquire) == 0 && matches!(*self.job_lock.lock(), Slot::Idle)
    }

    pub fn in_flight_job(&self) -> Option<Arc<Job>> {
        match &*self.job_lock.lock() {
            Slot::Idle => None,
            Slot::Running { job, .. } | Slot::Resetting { job, .. } => Some(job.clone()),
        }
    }

    pub fn queued_jobs(&self) -> usize {
        self.runqueue.lock().len()
    }

    pub(crate) fn enable_clocks(&self) -> Result<(), RocketError> {
        self.a_clk.prepare_enable()?;
        if let Err(e) = self.h_clk.prepare_enable() {
            self.a_clk.disable_unprepare();
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn disable_clocks(&self) {
        self.h_clk.disable_unprepare();
        self.a_clk.disable_unprepare();
    }

    pub(crate) fn detach_power_domain(&self) {
        self.pm_domain.detach();
    }

    /// Pulses both bus resets, holding them for `hold_us`.
    pub fn reset(&self, osal: &dyn Osal, hold_us: u32) {
        self.a_reset.assert();
        self.h_reset.assert();
        osal.udelay(hold_us);
        self.a_reset.deassert();
        self.h_reset.deassert();
    }

    /// Programs the PC block to fetch and run `task`.
    fn hw_submit(&self, task: &Task) {
        let pc = self.regs.pc();

        pc.base_address.set(0x1);
        self.regs
            .cna()
            .s_pointer
            .set(multicore_command_value(self.index as u32));
        self.regs
            .core()
            .s_pointer
            .set(multicore_command_value(self.index as u32));

        pc.base_address.set(task.regcmd as u32);
        pc.register_amounts
            .set(pc_data_amount(task.regcmd_count, self.pc_data_amount_scale));

        pc.interrupt_mask.set(INT_DPU_DONE);
        pc.interrupt_clear.set(INT_DPU_DONE);

        pc.task_control
            .set(build_pc_task_control(self.pc_task_number_bits, true, 1));
        pc.task_dma_base_addr.set(0);

        pc.operation_enable.set(0x1);

        debug!(
            "core {}: submitted task regcmd={:#x} count={}",
            self.index, task.regcmd, task.regcmd_count
        );
    }

    /// Issues the first task of `job` and parks it in the in-flight slot.
    ///
    /// Refuses with `Again` when the slot is taken.
    pub(crate) fn start_job(&self, job: Arc<Job>, deadline_us: TimeStamp) -> Result<(), RocketError> {
        let mut slot = self.job_lock.lock();
        if !matches!(*slot, Slot::Idle) {
            return Err(RocketError::Again);
        }
        let task = job.advance().ok_or(RocketError::InvalidArgument)?;
        self.hw_submit(&task);
        *slot = Slot::Running {
            job,
            deadline_us,
            resets: 0,
        };
        Ok(())
    }

    /// Top half: acks the interrupt, then issues the next task or retires the
    /// job. `deadline_us` re-arms the watchdog when another task is issued.
    pub(crate) fn handle_irq(&self, deadline_us: TimeStamp) -> IrqOutcome {
        let pc = self.regs.pc();
        let raw = pc.interrupt_raw_status.get();

        if raw & (INT_DMA_READ_ERROR | INT_DMA_WRITE_ERROR) != 0 {
            warn!("core {}: DMA error, raw status {:#x}", self.index, raw);
        }
        if raw & INT_DPU_DONE == 0 {
            return IrqOutcome::None;
        }

        pc.interrupt_mask.set(0);
        pc.operation_enable.set(0);
        pc.interrupt_clear.set(INT_CLEAR_ALL);

        let mut slot = self.job_lock.lock();
        let next = match &mut *slot {
            Slot::Running {
                job,
                deadline_us: deadline,
                ..
            } => {
                let next = job.advance();
                if next.is_some() {
                    *deadline = deadline_us;
                }
                next
            }
            Slot::Resetting { .. } => {
                debug!("core {}: interrupt during reset ignored", self.index);
                return IrqOutcome::Handled;
            }
            Slot::Idle => {
                warn!("core {}: spurious interrupt, raw status {:#x}", self.index, raw);
                return IrqOutcome::Handled;
            }
        };

        if let Some(task) = next {
            self.hw_submit(&task);
            return IrqOutcome::Handled;
        }

        match mem::replace(&mut *slot, Slot::Idle) {
            Slot::Running { job, .. } => IrqOutcome::Completed(job),
            other => {
                *slot = other;
                IrqOutcome::Handled
            }
        }
    }

    /// Moves a job past its deadline to `Resetting` and queues reset work.
    ///
    /// Returns whether reset work was queued.
    pub(crate) fn check_timeout(&self, now_us: TimeStamp) -> bool {
        let mut slot = self.job_lock.lock();
        let expired = matches!(&*slot, Slot::Running { deadline_us, .. } if now_us >= *deadline_us);
        if !expired {
            return false;
        }

        if let Slot::Running { job, resets, .. } = mem::replace(&mut *slot, Slot::Idle) {
            warn!(
                "core {}: job timed out at task {}/{}",
                self.index,
                job.next_task_idx(),
                job.task_count()
            );
            *slot = Slot::Resetting { job, resets };
        }

        self.reset_pending
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    pub fn reset_pending(&self) -> bool {
        self.reset_pending.load(Ordering::Acquire) != 0
    }

    /// Reset work item: resets the core, then re-issues the interrupted task
    /// or gives up on the job once `retries` resets were spent on it.
    pub(crate) fn reset_work(
        &self,
        osal: &dyn Osal,
        config: &RocketConfig,
        deadline_us: TimeStamp,
    ) -> ResetOutcome {
        if self.reset_pending.load(Ordering::Acquire) == 0 {
            return ResetOutcome::Nothing;
        }

        let mut slot = self.job_lock.lock();
        self.reset(osal, config.reset_hold_us);

        let outcome = match mem::replace(&mut *slot, Slot::Idle) {
            Slot::Resetting { job, resets } if resets < config.reset_retries => {
                match job.current_task() {
                    Some(task) => {
                        info!(
                            "core {}: reset {} of {}, re-issuing task {}",
                            self.index,
                            resets + 1,
                            config.reset_retries,
                            job.next_task_idx() - 1
                        );
                        self.hw_submit(&task);
                        *slot = Slot::Running {
                            job,
                            deadline_us,
                            resets: resets + 1,
                        };
                        ResetOutcome::Recovered
                    }
                    None => ResetOutcome::Failed(job),
                }
            }
            Slot::Resetting { job, .. } => ResetOutcome::Failed(job),
            other => {
                *slot = other;
                ResetOutcome::Nothing
            }
        };

        self.reset_pending.store(0, Ordering::Release);
        outcome
    }
}

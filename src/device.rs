//! Device layer: the multi-core container and its probe sequence.
//!
//! The top node brings up core 0 and the shared clocks; every other core is
//! bound as a component from its own node. The device only exists once all
//! declared cores have bound.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::config::RocketConfig;
use crate::err::RocketError;
use crate::gem::PAGE_SIZE;
use crate::job::Job;
use crate::npu_core::{Core, IrqOutcome, ResetOutcome};
use crate::osal::{Clock, Osal, ResourceProvider, Shmem, TimeStamp};
use crate::sched::Entity;

/// First page of the fake mmap offset space handed out for BOs.
const MMAP_OFFSET_START_PAGE: u64 = (0xFFFF_FFFF >> 12) + 1;

/// Return value of the interrupt entry point.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IrqReturn {
    None,
    Handled,
}

/// Device information structure
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceInfo {
    pub hw_version: u32,
    pub core_count: usize,
    pub iommu_enabled: bool,
}

/// Collects the cores of a device until all of them are bound.
pub struct RocketDeviceBuilder {
    config: RocketConfig,
    osal: Arc<dyn Osal>,
    shmem: Arc<dyn Shmem>,
    clk_npu: Arc<dyn Clock>,
    pclk: Arc<dyn Clock>,
    cores: Vec<Option<Core>>,
}

impl RocketDeviceBuilder {
    /// Probes the top node: enables the shared clocks and core 0.
    pub fn new(
        compatible: &str,
        top: &dyn ResourceProvider,
        osal: Arc<dyn Osal>,
        shmem: Arc<dyn Shmem>,
    ) -> Result<Self, RocketError> {
        let config = RocketConfig::from_compatible(compatible).ok_or(RocketError::NoDevice)?;

        let clk_npu = top
            .clock(config.npu_clk_name)
            .ok_or(RocketError::Deferred)?;
        let pclk = top.clock(config.pclk_name).ok_or(RocketError::Deferred)?;

        clk_npu.prepare_enable()?;
        if let Err(e) = pclk.prepare_enable() {
            clk_npu.disable_unprepare();
            return Err(e);
        }

        let core0 = match Core::init(0, top, &config, &*osal) {
            Ok(core) => core,
            Err(e) => {
                error!("failed to bring up core 0: {}", e);
                pclk.disable_unprepare();
                clk_npu.disable_unprepare();
                return Err(e);
            }
        };

        let mut cores: Vec<Option<Core>> = (0..config.num_cores).map(|_| None).collect();
        cores[0] = Some(core0);

        Ok(Self {
            config,
            osal,
            shmem,
            clk_npu,
            pclk,
            cores,
        })
    }

    /// Binds core `index` from its own device-tree node.
    pub fn bind_component(
        &mut self,
        compatible: &str,
        index: usize,
        node: &dyn ResourceProvider,
    ) -> Result<(), RocketError> {
        if compatible != self.config.core_compatible {
            return Err(RocketError::NoDevice);
        }
        if index == 0 || index >= self.cores.len() {
            return Err(RocketError::InvalidArgument);
        }
        if self.cores[index].is_some() {
            return Err(RocketError::Busy);
        }

        let core = Core::init(index, node, &self.config, &*self.osal).inspect_err(|e| {
            error!("failed to bind core {}: {}", index, e);
        })?;
        self.cores[index] = Some(core);
        Ok(())
    }

    pub fn is_complete(&self) -> bool {
        self.cores.iter().all(Option::is_some)
    }

    /// Creates the device once every declared core is bound; `Deferred`
    /// before that.
    pub fn register(&mut self) -> Result<Arc<RocketDevice>, RocketError> {
        if !self.is_complete() {
            return Err(RocketError::Deferred);
        }

        let cores: Vec<Core> = self.cores.iter_mut().filter_map(Option::take).collect();
        // Consumers hold a reference on core 0 while they are active.
        cores[0].pm.get_noresume(cores.len() as u32 - 1);

        let dev = Arc::new(RocketDevice {
            config: self.config.clone(),
            osal: self.osal.clone(),
            shmem: self.shmem.clone(),
            clk_npu: self.clk_npu.clone(),
            pclk: self.pclk.clone(),
            cores,
            sched_lock: Mutex::new(()),
            iommu_lock: Mutex::new(()),
            retired: Mutex::new(Vec::new()),
            next_entity_id: AtomicU64::new(1),
            next_mmap_page: AtomicU64::new(MMAP_OFFSET_START_PAGE),
        });

        info!(
            "{} {}.{} ({}): {} cores, hardware version {:#x}",
            crate::DRIVER_DESC,
            crate::DRIVER_MAJOR,
            crate::DRIVER_MINOR,
            crate::DRIVER_DATE,
            dev.cores.len(),
            dev.cores[0].version()
        );
        Ok(dev)
    }
}

/// Rocket NPU device
pub struct RocketDevice {
    config: RocketConfig,
    osal: Arc<dyn Osal>,
    shmem: Arc<dyn Shmem>,
    clk_npu: Arc<dyn Clock>,
    pclk: Arc<dyn Clock>,
    cores: Vec<Core>,
    sched_lock: Mutex<()>,
    iommu_lock: Mutex<()>,
    /// Finished jobs waiting for `service()` to drop them.
    retired: Mutex<Vec<Arc<Job>>>,
    next_entity_id: AtomicU64,
    next_mmap_page: AtomicU64,
}

impl RocketDevice {
    pub fn config(&self) -> &RocketConfig {
        &self.config
    }

    pub fn osal(&self) -> &dyn Osal {
        &*self.osal
    }

    pub fn shmem(&self) -> &dyn Shmem {
        &*self.shmem
    }

    pub fn cores(&self) -> &[Core] {
        &self.cores
    }

    pub fn core(&self, index: usize) -> Result<&Core, RocketError> {
        self.cores.get(index).ok_or(RocketError::InvalidArgument)
    }

    pub fn num_cores(&self) -> usize {
        self.cores.len()
    }

    pub fn device_info(&self) -> DeviceInfo {
        DeviceInfo {
            hw_version: self.cores[0].version(),
            core_count: self.cores.len(),
            iommu_enabled: self.cores[0].iommu().is_some(),
        }
    }

    /// Serializes multi-IOMMU BO (un)mapping.
    pub(crate) fn iommu_lock(&self) -> &Mutex<()> {
        &self.iommu_lock
    }

    /// Serializes core selection and first-task programming.
    pub(crate) fn sched_lock(&self) -> &Mutex<()> {
        &self.sched_lock
    }

    pub(crate) fn new_entity(&self) -> Arc<Entity> {
        Entity::new(self.next_entity_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Reserves fake mmap offset space for a BO of `size` bytes.
    pub(crate) fn alloc_mmap_offset(&self, size: usize) -> u64 {
        let pages = size.div_ceil(PAGE_SIZE) as u64;
        self.next_mmap_page.fetch_add(pages, Ordering::Relaxed) * PAGE_SIZE as u64
    }

    pub(crate) fn job_deadline(&self) -> TimeStamp {
        self.osal.get_time_us() + self.config.job_timeout_ms as u64 * 1000
    }

    pub(crate) fn top_clocks_enable(&self) -> Result<(), RocketError> {
        self.clk_npu.prepare_enable()?;
        if let Err(e) = self.pclk.prepare_enable() {
            self.clk_npu.disable_unprepare();
            return Err(e);
        }
        Ok(())
    }

    pub(crate) fn top_clocks_disable(&self) {
        self.pclk.disable_unprepare();
        self.clk_npu.disable_unprepare();
    }

    /// True when no core has a job in flight or queued.
    pub fn is_idle(&self) -> bool {
        self.cores
            .iter()
            .all(|core| core.is_idle() && core.queued_jobs() == 0)
    }

    /// Interrupt entry point of core `index`.
    pub fn handle_irq(&self, index: usize) -> IrqReturn {
        let Ok(core) = self.core(index) else {
            return IrqReturn::None;
        };

        match core.handle_irq(self.job_deadline()) {
            IrqOutcome::None => IrqReturn::None,
            IrqOutcome::Handled => {
                self.pm_runtime_mark_last_busy(index);
                IrqReturn::Handled
            }
            IrqOutcome::Completed(job) => {
                debug!("core {}: job done after {} tasks", index, job.task_count());
                if let Err(e) = job.done_fence().signal() {
                    warn!("core {}: done fence of finished job: {}", index, e);
                }
                self.pm_runtime_put_autosuspend(index);
                self.retire_job(job);
                self.schedule();
                IrqReturn::Handled
            }
        }
    }

    /// Checks every core's watchdog; returns how many resets were queued.
    pub fn watchdog_tick(&self) -> usize {
        let now = self.osal.get_time_us();
        self.cores
            .iter()
            .filter(|core| core.check_timeout(now))
            .count()
    }

    /// Runs queued reset work on every core.
    pub fn process_reset_work(&self) {
        for core in &self.cores {
            match core.reset_work(&*self.osal, &self.config, self.job_deadline()) {
                ResetOutcome::Nothing | ResetOutcome::Recovered => {}
                ResetOutcome::Failed(job) => {
                    error!(
                        "core {}: giving up on job after {} resets",
                        core.index(),
                        self.config.reset_retries
                    );
                    if let Err(e) = job.done_fence().signal_error(RocketError::ResetExhausted) {
                        warn!("core {}: done fence of failed job: {}", core.index(), e);
                    }
                    self.pm_runtime_put_autosuspend(core.index());
                    self.retire_job(job);
                }
            }
        }
        self.schedule();
    }

    /// Parks a finished job until [`RocketDevice::free_retired_jobs`]. The
    /// last reference may own BOs, whose release unmaps IOMMUs and frees
    /// pages, so it is never dropped on the interrupt path.
    pub(crate) fn retire_job(&self, job: Arc<Job>) {
        self.retired.lock().push(job);
    }

    /// Drops the references of retired jobs. Must run in a context that may
    /// block.
    pub fn free_retired_jobs(&self) {
        let retired = core::mem::take(&mut *self.retired.lock());
        if !retired.is_empty() {
            debug!("freeing {} retired jobs", retired.len());
        }
        drop(retired);
    }

    /// One pass of the deferred work a host runs periodically: watchdog,
    /// reset work, scheduling, freeing retired jobs, then autosuspend.
    pub fn service(&self) {
        if self.watchdog_tick() > 0 {
            self.process_reset_work();
        }
        self.schedule();
        self.free_retired_jobs();
        self.pm_autosuspend_tick();
    }

    /// Unbinds the device. Queued jobs should have been drained by closing
    /// every file first.
    pub fn remove(&self) {
        self.free_retired_jobs();
        if !self.is_idle() {
            warn!("removing device with work outstanding");
        }
        for core in self.cores.iter().rev() {
            core.detach_power_domain();
        }
        info!("{} removed", crate::DRIVER_NAME);
    }
}

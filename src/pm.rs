//! Runtime power management of the NPU cores.
//!
//! Each core is a PM device with a usage count and an autosuspend timer.
//! Cores other than core 0 are consumers of core 0: while active they hold a
//! usage reference on it, so the top-level clocks gated with core 0 stay on
//! as long as any core runs.

use spin::Mutex;

use crate::device::RocketDevice;
use crate::err::RocketError;
use crate::npu_core::Core;
use crate::osal::TimeStamp;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PmStatus {
    Active,
    Suspended,
}

struct PmState {
    status: PmStatus,
    usage: u32,
    last_busy_us: TimeStamp,
    /// Suspended by system sleep while active, to be resumed on wake-up.
    forced: bool,
}

pub(crate) struct RuntimePm {
    state: Mutex<PmState>,
}

impl RuntimePm {
    /// Cores come up active with clocks on.
    pub(crate) fn new(now_us: TimeStamp) -> Self {
        Self {
            state: Mutex::new(PmState {
                status: PmStatus::Active,
                usage: 0,
                last_busy_us: now_us,
                forced: false,
            }),
        }
    }

    /// Takes `count` references without resuming.
    pub(crate) fn get_noresume(&self, count: u32) {
        self.state.lock().usage += count;
    }
}

impl RocketDevice {
    pub fn pm_status(&self, index: usize) -> Result<PmStatus, RocketError> {
        Ok(self.core(index)?.pm.state.lock().status)
    }

    pub fn pm_usage(&self, index: usize) -> Result<u32, RocketError> {
        Ok(self.core(index)?.pm.state.lock().usage)
    }

    /// Takes a usage reference on core `index`, resuming it if needed.
    pub fn pm_runtime_get_sync(&self, index: usize) -> Result<(), RocketError> {
        let core = self.core(index)?;
        let mut pm = core.pm.state.lock();
        if pm.status == PmStatus::Suspended {
            self.resume_core(index)?;
            pm.status = PmStatus::Active;
            debug!("core {}: runtime resumed", index);
        }
        pm.usage += 1;
        Ok(())
    }

    /// Drops a usage reference and restarts the autosuspend timer.
    pub fn pm_runtime_put_autosuspend(&self, index: usize) {
        let now = self.osal().get_time_us();
        if let Ok(core) = self.core(index) {
            let mut pm = core.pm.state.lock();
            if pm.usage == 0 {
                warn!("core {}: runtime PM usage count underflow", index);
            }
            pm.usage = pm.usage.saturating_sub(1);
            pm.last_busy_us = now;
        }
    }

    pub fn pm_runtime_mark_last_busy(&self, index: usize) {
        let now = self.osal().get_time_us();
        if let Ok(core) = self.core(index) {
            core.pm.state.lock().last_busy_us = now;
        }
    }

    fn pm_runtime_put_noidle(&self, index: usize) {
        if let Ok(core) = self.core(index) {
            let mut pm = core.pm.state.lock();
            pm.usage = pm.usage.saturating_sub(1);
        }
    }

    /// Suspends core `index` now, refusing with `Busy` while it is in use.
    pub fn pm_runtime_suspend(&self, index: usize) -> Result<(), RocketError> {
        let core = self.core(index)?;
        let mut pm = core.pm.state.lock();
        if pm.status == PmStatus::Suspended {
            return Ok(());
        }
        if pm.usage > 0 {
            return Err(RocketError::Busy);
        }
        self.suspend_core(index)?;
        pm.status = PmStatus::Suspended;
        debug!("core {}: runtime suspended", index);
        Ok(())
    }

    /// Suspends every core whose usage dropped to zero at least the
    /// autosuspend delay ago. Consumers go first so core 0 can follow in the
    /// same pass.
    pub fn pm_autosuspend_tick(&self) {
        let delay_us = self.config().autosuspend_delay_ms as u64 * 1000;

        for core in self.cores().iter().rev() {
            let now = self.osal().get_time_us();
            let mut pm = core.pm.state.lock();
            if pm.status != PmStatus::Active
                || pm.usage > 0
                || now.saturating_sub(pm.last_busy_us) < delay_us
            {
                continue;
            }
            match self.suspend_core(core.index()) {
                Ok(()) => {
                    pm.status = PmStatus::Suspended;
                    debug!("core {}: autosuspended", core.index());
                }
                Err(e) => debug!("core {}: autosuspend refused: {}", core.index(), e),
            }
        }
    }

    fn resume_core(&self, index: usize) -> Result<(), RocketError> {
        if index != 0 {
            self.pm_runtime_get_sync(0)?;
        }
        if let Err(e) = self.runtime_resume(index) {
            if index != 0 {
                self.pm_runtime_put_autosuspend(0);
            }
            return Err(e);
        }
        Ok(())
    }

    fn suspend_core(&self, index: usize) -> Result<(), RocketError> {
        self.runtime_suspend(index)?;
        if index != 0 {
            // Supplier reference; core 0 idles on its own timer.
            self.pm_runtime_put_noidle(0);
        }
        Ok(())
    }

    /// Runtime-suspend callback: gates the clocks of core `index`.
    ///
    /// Refused with `Busy` while the core has a job in flight or a reset
    /// pending. Core 0 gates the top clocks every core runs on, so it is
    /// refused while any core is busy.
    pub fn runtime_suspend(&self, index: usize) -> Result<(), RocketError> {
        let core = self.core(index)?;
        let busy = if index == 0 {
            !self.cores().iter().all(Core::is_idle)
        } else {
            !core.is_idle()
        };
        if busy {
            return Err(RocketError::Busy);
        }

        core.disable_clocks();
        if index == 0 {
            self.top_clocks_disable();
        }
        Ok(())
    }

    /// Runtime-resume callback: ungates the top clocks for core 0, then the
    /// core's own clocks.
    pub fn runtime_resume(&self, index: usize) -> Result<(), RocketError> {
        let core = self.core(index)?;
        if index == 0 {
            self.top_clocks_enable()?;
        }
        if let Err(e) = core.enable_clocks() {
            if index == 0 {
                self.top_clocks_disable();
            }
            return Err(e);
        }
        Ok(())
    }

    /// System sleep: forces every active core down, consumers first.
    ///
    /// Fails with `Busy` if a core still has work; cores suspended before the
    /// failure stay down until [`RocketDevice::system_resume`].
    pub fn system_suspend(&self) -> Result<(), RocketError> {
        for core in self.cores().iter().rev() {
            let mut pm = core.pm.state.lock();
            if pm.status != PmStatus::Active {
                continue;
            }
            self.suspend_core(core.index())?;
            pm.status = PmStatus::Suspended;
            pm.forced = true;
        }
        info!("suspended for system sleep");
        Ok(())
    }

    /// Brings back the cores [`RocketDevice::system_suspend`] took down.
    pub fn system_resume(&self) -> Result<(), RocketError> {
        for core in self.cores() {
            let mut pm = core.pm.state.lock();
            if !pm.forced {
                continue;
            }
            self.resume_core(core.index())?;
            pm.status = PmStatus::Active;
            pm.forced = false;
            pm.last_busy_us = self.osal().get_time_us();
        }
        info!("resumed from system sleep");
        Ok(())
    }
}

//! Driver core for the Rockchip RK3588 NPU, exposed as a compute accelerator.
//!
//! The crate schedules inference jobs from many clients across the NPU
//! cores, keeps buffer objects mapped at one device address behind every
//! core's IOMMU, and gates core clocks with runtime power management.
//!
//! Everything the host provides (clocks, resets, power domains, the DMA API,
//! IOMMU domains, shmem pages, userspace copies and time) is reached through
//! the traits in [`osal`], so the core carries no platform code.

#![cfg_attr(not(test), no_std)]

extern crate alloc;
#[macro_use]
extern crate log;

mod config;
mod device;
mod err;
mod fence;
mod file;
mod gem;
mod ioctrl;
mod job;
mod npu_core;
mod pm;
mod registers;
mod resv;
mod sched;

pub mod osal;

pub use config::*;
pub use device::{DeviceInfo, IrqReturn, RocketDevice, RocketDeviceBuilder};
pub use err::*;
pub use fence::{Fence, FenceContext, FenceResult};
pub use file::RocketFile;
pub use gem::{GemObject, GemPool, PAGE_SIZE, PrepOp};
pub use ioctrl::*;
pub use job::{Job, PendingJob, Task};
pub use npu_core::{Core, CoreState};
pub use osal::*;
pub use pm::PmStatus;
pub use registers::consts::REGISTER_WINDOW_SIZE;
pub use resv::{Reservation, ResvUsage};
pub use sched::Entity;

pub const DRIVER_NAME: &str = "rocket";
pub const DRIVER_DESC: &str = "rocket DRM";
pub const DRIVER_DATE: &str = "20240521";
pub const DRIVER_MAJOR: u32 = 1;
pub const DRIVER_MINOR: u32 = 0;

/// Capabilities advertised to the DRM core.
pub mod driver_features {
    pub const GEM: u32 = 1 << 0;
    pub const COMPUTE_ACCEL: u32 = 1 << 7;
}

pub const DRIVER_FEATURES: u32 = driver_features::COMPUTE_ACCEL | driver_features::GEM;

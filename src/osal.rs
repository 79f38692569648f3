//! Operating System Abstraction Layer (OSAL) for the Rocket driver core
//!
//! The driver core never calls into a host kernel directly. Clocks, resets,
//! power domains, the DMA API, IOMMU domains, shmem pages and userspace copies
//! are all reached through the traits below so that the same scheduling and
//! memory policy runs on any host that can provide them.

use alloc::sync::Arc;
use alloc::vec::Vec;
use core::ptr::NonNull;

use crate::err::RocketError;

/// Physical address type
pub type PhysAddr = u64;

/// DMA (device virtual) address type
pub type DmaAddr = u64;

/// Time type for timestamps, in microseconds
pub type TimeStamp = u64;

/// OSAL trait for platform-specific time services
pub trait Osal: Send + Sync {
    /// Get current monotonic timestamp in microseconds
    fn get_time_us(&self) -> TimeStamp;

    /// Busy-wait for specified microseconds
    fn udelay(&self, us: u32);
}

/// DMA synchronization direction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaSyncDirection {
    ToDevice,
    FromDevice,
    Bidirectional,
}

/// Scatter-gather list entry
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScatterGatherEntry {
    pub addr: PhysAddr,
    pub length: u32,
}

/// Scatter-gather table
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ScatterGatherTable {
    pub entries: Vec<ScatterGatherEntry>,
}

impl ScatterGatherTable {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    pub fn add_entry(&mut self, addr: PhysAddr, length: u32) {
        self.entries.push(ScatterGatherEntry { addr, length });
    }

    pub fn total_size(&self) -> u64 {
        self.entries.iter().map(|e| e.length as u64).sum()
    }
}

/// A gateable clock line.
pub trait Clock: Send + Sync {
    fn prepare_enable(&self) -> Result<(), RocketError>;
    fn disable_unprepare(&self);
}

/// A reset line of one bus interface.
pub trait ResetControl: Send + Sync {
    fn assert(&self);
    fn deassert(&self);
}

/// Power domain a core sits in.
pub trait PowerDomain: Send + Sync {
    fn attach(&self) -> Result<(), RocketError>;
    fn detach(&self);
}

/// Backing store for buffer objects.
pub trait Shmem: Send + Sync {
    /// Allocates host pages covering at least `size` bytes.
    fn alloc(&self, size: usize) -> Result<ScatterGatherTable, RocketError>;
    fn free(&self, sgt: ScatterGatherTable);
}

/// DMA API of one core's device.
///
/// For core 0 this is the path that assigns the canonical device virtual
/// address of every buffer object.
pub trait DmaDevice: Send + Sync {
    /// Restricts the addresses the device can reach to `mask`.
    fn set_dma_mask(&self, mask: u64) -> Result<(), RocketError>;
    fn map_sgtable(&self, sgt: &ScatterGatherTable) -> Result<DmaAddr, RocketError>;
    fn unmap_sgtable(&self, sgt: &ScatterGatherTable, dma_addr: DmaAddr);
    fn sync_for_cpu(&self, sgt: &ScatterGatherTable, dir: DmaSyncDirection);
    fn sync_for_device(&self, sgt: &ScatterGatherTable, dir: DmaSyncDirection);
}

/// IOMMU domain in front of one core.
pub trait IommuDomain: Send + Sync {
    /// Smallest mapping unit of the domain, in bytes.
    fn granule(&self) -> usize;

    /// Maps `sgt` at `iova`, returning the number of bytes mapped.
    fn map_sgtable(&self, iova: DmaAddr, sgt: &ScatterGatherTable) -> Result<usize, RocketError>;

    /// Unmaps `size` bytes at `iova`, returning the number of bytes unmapped.
    fn unmap(&self, iova: DmaAddr, size: usize) -> usize;

    fn iova_to_phys(&self, iova: DmaAddr) -> Option<PhysAddr>;
}

/// Access to the submitting process' memory.
pub trait UserMemory {
    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), RocketError>;
}

/// Named resources of one device-tree node.
///
/// # Safety
///
/// `mmio` must return a mapping of the node's register window that stays
/// valid, and is not aliased by other drivers, for as long as the device built
/// from it is alive.
pub unsafe trait ResourceProvider {
    fn mmio(&self, index: usize) -> Option<NonNull<u8>>;
    fn irq_byname(&self, name: &str) -> Option<u32>;
    fn clock(&self, name: &str) -> Option<Arc<dyn Clock>>;
    fn reset(&self, name: &str) -> Option<Arc<dyn ResetControl>>;
    fn power_domain(&self, name: &str) -> Option<Arc<dyn PowerDomain>>;
    fn dma_device(&self) -> Arc<dyn DmaDevice>;
    fn iommu_domain(&self) -> Option<Arc<dyn IommuDomain>>;
}

/// Rounds `value` up to a multiple of `align`, which must be a power of two.
pub const fn align_up(value: usize, align: usize) -> usize {
    (value + align - 1) & !(align - 1)
}

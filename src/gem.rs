//! Buffer objects shared by every NPU core.
//!
//! A BO is backed by shmem pages, mapped through core 0's DMA API to obtain
//! its canonical device virtual address, and mapped at that same address into
//! the IOMMU domain of every other core. Both directions run under the
//! device's `iommu_lock`.

use alloc::collections::btree_map::BTreeMap;
use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use crate::device::RocketDevice;
use crate::err::RocketError;
use crate::osal::{DmaAddr, DmaSyncDirection, ScatterGatherTable, align_up};
use crate::resv::{Reservation, ResvUsage};

/// Mapping granule assumed when core 0 exposes no IOMMU domain.
pub const PAGE_SIZE: usize = 0x1000;

/// Direction of a CPU access bracketed by `prep_bo`/`fini_bo`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PrepOp(u32);

impl PrepOp {
    pub const NONE: PrepOp = PrepOp(0);
    pub const READ: PrepOp = PrepOp(1);
    pub const WRITE: PrepOp = PrepOp(2);
    pub const READ_WRITE: PrepOp = PrepOp(3);

    /// Accepts READ, WRITE or both; anything else is `None`.
    pub const fn from_bits(bits: u32) -> Option<Self> {
        if bits == 0 || bits & !Self::READ_WRITE.0 != 0 {
            None
        } else {
            Some(PrepOp(bits))
        }
    }

    pub const fn bits(self) -> u32 {
        self.0
    }

    pub const fn is_empty(self) -> bool {
        self.0 == 0
    }

    pub const fn contains(self, other: PrepOp) -> bool {
        self.0 & other.0 == other.0
    }

    pub const fn dma_direction(self) -> DmaSyncDirection {
        match self.0 {
            1 => DmaSyncDirection::FromDevice,
            2 => DmaSyncDirection::ToDevice,
            _ => DmaSyncDirection::Bidirectional,
        }
    }
}

pub struct GemObject {
    dev: Weak<RocketDevice>,
    size: usize,
    dma_address: DmaAddr,
    mmap_offset: u64,
    sgt: ScatterGatherTable,
    resv: Reservation,
    last_cpu_prep_op: Mutex<PrepOp>,
}

impl GemObject {
    /// Allocates a BO of at least `size` bytes and maps it on every core.
    pub fn create(dev: &Arc<RocketDevice>, size: usize) -> Result<Arc<Self>, RocketError> {
        if size == 0 {
            return Err(RocketError::InvalidArgument);
        }

        let core0 = dev.core(0)?;
        let sgt = dev.shmem().alloc(size)?;
        let dma_address = match core0.dma().map_sgtable(&sgt) {
            Ok(addr) => addr,
            Err(e) => {
                dev.shmem().free(sgt);
                return Err(e);
            }
        };

        let granule = core0.iommu().map_or(PAGE_SIZE, |iommu| iommu.granule());
        let mut bo_size = align_up(size, granule);

        let dma_mask = dev.config().dma_mask;
        if dma_address
            .checked_add(bo_size as u64 - 1)
            .is_none_or(|last| last > dma_mask)
        {
            error!(
                "BO at {:#x} size {:#x} exceeds DMA mask {:#x}",
                dma_address, bo_size, dma_mask
            );
            core0.dma().unmap_sgtable(&sgt, dma_address);
            dev.shmem().free(sgt);
            return Err(RocketError::OutOfMemory);
        }

        {
            let guard = dev.iommu_lock().lock();
            let mut mapped: Vec<(usize, usize)> = Vec::new();
            let mut size_fixed = false;

            for core in dev.cores().iter().skip(1) {
                let Some(iommu) = core.iommu() else {
                    continue;
                };
                match iommu.map_sgtable(dma_address, &sgt) {
                    Ok(len) => {
                        if len != 0 && !size_fixed {
                            bo_size = len;
                            size_fixed = true;
                        }
                        mapped.push((core.index(), len));
                    }
                    Err(e) => {
                        error!(
                            "failed to map BO at {:#x} into core {}: {}",
                            dma_address,
                            core.index(),
                            e
                        );
                        for (index, len) in mapped {
                            if let Some(iommu) = dev.cores()[index].iommu() {
                                iommu.unmap(dma_address, len);
                            }
                        }
                        drop(guard);
                        core0.dma().unmap_sgtable(&sgt, dma_address);
                        dev.shmem().free(sgt);
                        return Err(e);
                    }
                }
            }
        }

        let mmap_offset = dev.alloc_mmap_offset(bo_size);
        debug!(
            "created BO: dma_address={:#x} size={:#x} (requested {:#x})",
            dma_address, bo_size, size
        );

        Ok(Arc::new(Self {
            dev: Arc::downgrade(dev),
            size: bo_size,
            dma_address,
            mmap_offset,
            sgt,
            resv: Reservation::new(),
            last_cpu_prep_op: Mutex::new(PrepOp::NONE),
        }))
    }

    /// Size after alignment to the IOMMU granule.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Device virtual address, identical on every core.
    pub fn dma_address(&self) -> DmaAddr {
        self.dma_address
    }

    pub fn mmap_offset(&self) -> u64 {
        self.mmap_offset
    }

    pub fn sgt(&self) -> &ScatterGatherTable {
        &self.sgt
    }

    pub fn resv(&self) -> &Reservation {
        &self.resv
    }

    pub fn last_cpu_prep_op(&self) -> PrepOp {
        *self.last_cpu_prep_op.lock()
    }

    /// Waits for device access to finish, then hands the pages to the CPU.
    ///
    /// `timeout_ns` is an absolute monotonic deadline; zero or a deadline in
    /// the past only tests the fences and yields `Busy` if any is pending.
    pub fn prep(&self, op: PrepOp, timeout_ns: i64) -> Result<(), RocketError> {
        let dev = self.dev.upgrade().ok_or(RocketError::NoDevice)?;
        let deadline_us = if timeout_ns <= 0 {
            0
        } else {
            timeout_ns as u64 / 1000
        };

        let usage = ResvUsage::rw(op.contains(PrepOp::WRITE));
        self.resv.wait_until(usage, dev.osal(), deadline_us)?;

        let dir = op.dma_direction();
        for core in dev.cores() {
            core.dma().sync_for_cpu(&self.sgt, dir);
        }
        *self.last_cpu_prep_op.lock() = op;

        Ok(())
    }

    /// Hands the pages back to the devices after a [`GemObject::prep`].
    pub fn fini(&self) -> Result<(), RocketError> {
        let dev = self.dev.upgrade().ok_or(RocketError::NoDevice)?;
        let op = core::mem::take(&mut *self.last_cpu_prep_op.lock());
        if op.is_empty() {
            warn!("fini_bo on BO {:#x} without a prior prep_bo", self.dma_address);
            return Ok(());
        }

        let dir = op.dma_direction();
        for core in dev.cores() {
            core.dma().sync_for_device(&self.sgt, dir);
        }

        Ok(())
    }
}

impl Drop for GemObject {
    fn drop(&mut self) {
        let Some(dev) = self.dev.upgrade() else {
            warn!("BO {:#x} outlived its device", self.dma_address);
            return;
        };

        {
            let _guard = dev.iommu_lock().lock();
            for core in dev.cores().iter().skip(1) {
                let Some(iommu) = core.iommu() else {
                    continue;
                };
                let unmapped = iommu.unmap(self.dma_address, self.size);
                if unmapped != self.size {
                    error!(
                        "core {}: unmapped {:#x} bytes of BO {:#x}, expected {:#x}",
                        core.index(),
                        unmapped,
                        self.dma_address,
                        self.size
                    );
                }
            }
        }

        if let Ok(core0) = dev.core(0) {
            core0.dma().unmap_sgtable(&self.sgt, self.dma_address);
        }
        dev.shmem().free(core::mem::take(&mut self.sgt));
    }
}

/// Per-file GEM handle table.
pub struct GemPool {
    pool: BTreeMap<u32, Arc<GemObject>>,
    next_handle: u32,
}

impl GemPool {
    pub const fn new() -> Self {
        GemPool {
            pool: BTreeMap::new(),
            next_handle: 1,
        }
    }

    pub fn insert(&mut self, bo: Arc<GemObject>) -> u32 {
        let handle = self.next_handle;
        self.next_handle += 1;
        self.pool.insert(handle, bo);
        handle
    }

    pub fn lookup(&self, handle: u32) -> Option<Arc<GemObject>> {
        self.pool.get(&handle).cloned()
    }

    pub fn remove(&mut self, handle: u32) -> Option<Arc<GemObject>> {
        self.pool.remove(&handle)
    }

    pub fn len(&self) -> usize {
        self.pool.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pool.is_empty()
    }
}

impl Default for GemPool {
    fn default() -> Self {
        Self::new()
    }
}

//! Per-open-file state and the ioctl entry points.

use alloc::sync::{Arc, Weak};
use alloc::vec::Vec;

use spin::Mutex;

use crate::device::RocketDevice;
use crate::err::RocketError;
use crate::gem::{GemObject, GemPool, PrepOp};
use crate::ioctrl::{
    DRM_IOCTL_ROCKET_CREATE_BO, DRM_IOCTL_ROCKET_FINI_BO, DRM_IOCTL_ROCKET_PREP_BO,
    DRM_IOCTL_ROCKET_SUBMIT, DrmRocketCreateBo, DrmRocketFiniBo, DrmRocketJob, DrmRocketPrepBo,
    DrmRocketSubmit, DrmRocketTask, UapiStruct,
};
use crate::job::{Job, PendingJob, Task};
use crate::osal::UserMemory;
use crate::sched::Entity;

/// Copies `count` elements of `elem_size` bytes starting at user address
/// `addr`.
fn copy_array(
    user: &dyn UserMemory,
    addr: u64,
    count: u32,
    elem_size: usize,
) -> Result<Vec<u8>, RocketError> {
    let len = (count as usize)
        .checked_mul(elem_size)
        .ok_or(RocketError::InvalidArgument)?;
    let mut buf = Vec::new();
    buf.try_reserve_exact(len)
        .map_err(|_| RocketError::OutOfMemory)?;
    buf.resize(len, 0);
    user.copy_from_user(addr, &mut buf)?;
    Ok(buf)
}

fn read_structs<T: UapiStruct>(
    user: &dyn UserMemory,
    addr: u64,
    count: u32,
) -> Result<Vec<T>, RocketError> {
    copy_array(user, addr, count, T::SIZE)?
        .chunks_exact(T::SIZE)
        .map(T::read_from)
        .collect()
}

fn read_handles(user: &dyn UserMemory, addr: u64, count: u32) -> Result<Vec<u32>, RocketError> {
    Ok(copy_array(user, addr, count, 4)?
        .chunks_exact(4)
        .map(|c| u32::from_le_bytes([c[0], c[1], c[2], c[3]]))
        .collect())
}

/// State of one open file: its BO handles and scheduling entity.
pub struct RocketFile {
    dev: Weak<RocketDevice>,
    entity: Arc<Entity>,
    bos: Mutex<GemPool>,
}

impl RocketFile {
    pub fn open(dev: &Arc<RocketDevice>) -> Result<Self, RocketError> {
        let entity = dev.new_entity();
        debug!("file opened, entity {}", entity.id());
        Ok(Self {
            dev: Arc::downgrade(dev),
            entity,
            bos: Mutex::new(GemPool::new()),
        })
    }

    fn device(&self) -> Result<Arc<RocketDevice>, RocketError> {
        self.dev.upgrade().ok_or(RocketError::NoDevice)
    }

    pub fn entity(&self) -> &Arc<Entity> {
        &self.entity
    }

    pub fn lookup_bo(&self, handle: u32) -> Result<Arc<GemObject>, RocketError> {
        self.bos.lock().lookup(handle).ok_or(RocketError::NotFound)
    }

    pub fn bo_count(&self) -> usize {
        self.bos.lock().len()
    }

    pub fn create_bo(&self, args: &mut DrmRocketCreateBo) -> Result<(), RocketError> {
        let dev = self.device()?;
        let bo = GemObject::create(&dev, args.size as usize)?;

        args.dma_address = bo.dma_address();
        args.offset = bo.mmap_offset();
        args.handle = self.bos.lock().insert(bo);
        Ok(())
    }

    /// Drops the file's reference behind `handle`.
    pub fn gem_close(&self, handle: u32) -> Result<(), RocketError> {
        let bo = self.bos.lock().remove(handle).ok_or(RocketError::NotFound)?;
        drop(bo);
        Ok(())
    }

    pub fn prep_bo(&self, args: &DrmRocketPrepBo) -> Result<(), RocketError> {
        let op = PrepOp::from_bits(args.op).ok_or(RocketError::InvalidArgument)?;
        let bo = self.lookup_bo(args.handle)?;
        bo.prep(op, args.timeout_ns)
    }

    pub fn fini_bo(&self, args: &DrmRocketFiniBo) -> Result<(), RocketError> {
        if args.flags != 0 {
            return Err(RocketError::InvalidArgument);
        }
        let bo = self.lookup_bo(args.handle)?;
        bo.fini()
    }

    /// Queues every job of the request in order.
    ///
    /// Jobs queued before a failing one stay queued: their fences are
    /// already published.
    pub fn submit(&self, args: &DrmRocketSubmit, user: &dyn UserMemory) -> Result<(), RocketError> {
        if args.reserved != 0 {
            return Err(RocketError::InvalidArgument);
        }

        let jobs: Vec<DrmRocketJob> = read_structs(user, args.jobs, args.job_count)?;
        for (i, job) in jobs.iter().enumerate() {
            if let Err(e) = self.submit_job(job, user) {
                debug!("entity {}: job {} of submit rejected: {}", self.entity.id(), i, e);
                return Err(e);
            }
        }
        Ok(())
    }

    fn submit_job(&self, args: &DrmRocketJob, user: &dyn UserMemory) -> Result<Arc<Job>, RocketError> {
        if args.task_count == 0 || args.reserved0 != 0 || args.reserved1 != 0 || args.reserved2 != 0 {
            return Err(RocketError::InvalidArgument);
        }

        let tasks: Vec<Task> = read_structs::<DrmRocketTask>(user, args.tasks, args.task_count)?
            .into_iter()
            .map(|t| match t.reserved {
                0 => Ok(Task {
                    regcmd: t.regcmd,
                    regcmd_count: t.regcmd_count,
                }),
                _ => Err(RocketError::InvalidArgument),
            })
            .collect::<Result<_, _>>()?;

        let in_bos = self.lookup_handles(user, args.in_bo_handles, args.in_bo_handle_count)?;
        let out_bos = self.lookup_handles(user, args.out_bo_handles, args.out_bo_handle_count)?;

        self.push_job(PendingJob::new(tasks, in_bos, out_bos)?)
    }

    fn lookup_handles(
        &self,
        user: &dyn UserMemory,
        addr: u64,
        count: u32,
    ) -> Result<Vec<Arc<GemObject>>, RocketError> {
        if count == 0 {
            return Ok(Vec::new());
        }
        read_handles(user, addr, count)?
            .into_iter()
            .map(|handle| self.lookup_bo(handle))
            .collect()
    }

    /// Queues an already-built job on this file's entity.
    pub fn push_job(&self, pending: PendingJob) -> Result<Arc<Job>, RocketError> {
        self.device()?.push_job(&self.entity, pending)
    }

    /// Dispatches `cmd`, decoding its payload from `data` and writing back
    /// the results of read/write commands.
    pub fn ioctl(&self, cmd: u32, data: &mut [u8], user: &dyn UserMemory) -> Result<(), RocketError> {
        match cmd {
            DRM_IOCTL_ROCKET_CREATE_BO => {
                let mut args = DrmRocketCreateBo::read_from(data)?;
                self.create_bo(&mut args)?;
                args.write_to(data)
            }
            DRM_IOCTL_ROCKET_PREP_BO => self.prep_bo(&DrmRocketPrepBo::read_from(data)?),
            DRM_IOCTL_ROCKET_FINI_BO => self.fini_bo(&DrmRocketFiniBo::read_from(data)?),
            DRM_IOCTL_ROCKET_SUBMIT => self.submit(&DrmRocketSubmit::read_from(data)?, user),
            _ => {
                debug!("unknown ioctl {:#x}", cmd);
                Err(RocketError::InvalidArgument)
            }
        }
    }
}

impl Drop for RocketFile {
    fn drop(&mut self) {
        if let Some(dev) = self.dev.upgrade() {
            dev.entity_fini(&self.entity);
        }
        debug!("file closed, entity {}", self.entity.id());
    }
}

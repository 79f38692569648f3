//! Userspace ABI: ioctl payloads and command numbers.
//!
//! The structs mirror the C layout byte for byte. Payloads travel as raw
//! little-endian byte buffers and are converted with [`UapiStruct`].

use crate::err::RocketError;

pub const DRM_IOCTL_BASE: u32 = b'd' as u32;
pub const DRM_COMMAND_BASE: u32 = 0x40;

pub const DRM_ROCKET_CREATE_BO: u32 = 0x00;
pub const DRM_ROCKET_PREP_BO: u32 = 0x01;
pub const DRM_ROCKET_FINI_BO: u32 = 0x02;
pub const DRM_ROCKET_SUBMIT: u32 = 0x03;

const IOC_WRITE: u32 = 1;
const IOC_READ: u32 = 2;

const fn ioc(dir: u32, nr: u32, size: usize) -> u32 {
    (dir << 30) | ((size as u32) << 16) | (DRM_IOCTL_BASE << 8) | (DRM_COMMAND_BASE + nr)
}

pub const DRM_IOCTL_ROCKET_CREATE_BO: u32 = ioc(
    IOC_READ | IOC_WRITE,
    DRM_ROCKET_CREATE_BO,
    DrmRocketCreateBo::SIZE,
);
pub const DRM_IOCTL_ROCKET_SUBMIT: u32 = ioc(IOC_WRITE, DRM_ROCKET_SUBMIT, DrmRocketSubmit::SIZE);
pub const DRM_IOCTL_ROCKET_PREP_BO: u32 = ioc(IOC_WRITE, DRM_ROCKET_PREP_BO, DrmRocketPrepBo::SIZE);
pub const DRM_IOCTL_ROCKET_FINI_BO: u32 = ioc(IOC_WRITE, DRM_ROCKET_FINI_BO, DrmRocketFiniBo::SIZE);

/// Fixed-size payload with a little-endian wire form.
pub trait UapiStruct: Sized {
    const SIZE: usize;

    /// Decodes from the first `SIZE` bytes of `buf`.
    fn read_from(buf: &[u8]) -> Result<Self, RocketError>;

    /// Encodes into the first `SIZE` bytes of `buf`.
    fn write_to(&self, buf: &mut [u8]) -> Result<(), RocketError>;
}

fn get_u32(buf: &[u8], off: usize) -> u32 {
    let mut b = [0u8; 4];
    b.copy_from_slice(&buf[off..off + 4]);
    u32::from_le_bytes(b)
}

fn get_u64(buf: &[u8], off: usize) -> u64 {
    let mut b = [0u8; 8];
    b.copy_from_slice(&buf[off..off + 8]);
    u64::from_le_bytes(b)
}

fn put_u32(buf: &mut [u8], off: usize, v: u32) {
    buf[off..off + 4].copy_from_slice(&v.to_le_bytes());
}

fn put_u64(buf: &mut [u8], off: usize, v: u64) {
    buf[off..off + 8].copy_from_slice(&v.to_le_bytes());
}

fn check_len(buf: &[u8], size: usize) -> Result<(), RocketError> {
    if buf.len() < size {
        return Err(RocketError::InvalidArgument);
    }
    Ok(())
}

/// Buffer object creation.
///
/// Corresponds to C struct `drm_rocket_create_bo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrmRocketCreateBo {
    /// Requested size in bytes.
    pub size: u32,
    /// Returned GEM handle.
    pub handle: u32,
    /// Returned device virtual address, valid on every core.
    pub dma_address: u64,
    /// Returned fake offset for mmap.
    pub offset: u64,
}

impl UapiStruct for DrmRocketCreateBo {
    const SIZE: usize = 24;

    fn read_from(buf: &[u8]) -> Result<Self, RocketError> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            size: get_u32(buf, 0),
            handle: get_u32(buf, 4),
            dma_address: get_u64(buf, 8),
            offset: get_u64(buf, 16),
        })
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<(), RocketError> {
        check_len(buf, Self::SIZE)?;
        put_u32(buf, 0, self.size);
        put_u32(buf, 4, self.handle);
        put_u64(buf, 8, self.dma_address);
        put_u64(buf, 16, self.offset);
        Ok(())
    }
}

/// CPU access preparation.
///
/// Corresponds to C struct `drm_rocket_prep_bo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrmRocketPrepBo {
    pub handle: u32,
    /// READ = 1, WRITE = 2.
    pub op: u32,
    /// Absolute monotonic deadline.
    pub timeout_ns: i64,
}

impl UapiStruct for DrmRocketPrepBo {
    const SIZE: usize = 16;

    fn read_from(buf: &[u8]) -> Result<Self, RocketError> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            handle: get_u32(buf, 0),
            op: get_u32(buf, 4),
            timeout_ns: get_u64(buf, 8) as i64,
        })
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<(), RocketError> {
        check_len(buf, Self::SIZE)?;
        put_u32(buf, 0, self.handle);
        put_u32(buf, 4, self.op);
        put_u64(buf, 8, self.timeout_ns as u64);
        Ok(())
    }
}

/// Corresponds to C struct `drm_rocket_fini_bo`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrmRocketFiniBo {
    pub handle: u32,
    /// Reserved, must be zero.
    pub flags: u32,
}

impl UapiStruct for DrmRocketFiniBo {
    const SIZE: usize = 8;

    fn read_from(buf: &[u8]) -> Result<Self, RocketError> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            handle: get_u32(buf, 0),
            flags: get_u32(buf, 4),
        })
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<(), RocketError> {
        check_len(buf, Self::SIZE)?;
        put_u32(buf, 0, self.handle);
        put_u32(buf, 4, self.flags);
        Ok(())
    }
}

/// One register-command buffer of a job.
///
/// Corresponds to C struct `drm_rocket_task`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrmRocketTask {
    pub regcmd: u64,
    pub regcmd_count: u32,
    pub reserved: u32,
}

impl UapiStruct for DrmRocketTask {
    const SIZE: usize = 16;

    fn read_from(buf: &[u8]) -> Result<Self, RocketError> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            regcmd: get_u64(buf, 0),
            regcmd_count: get_u32(buf, 8),
            reserved: get_u32(buf, 12),
        })
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<(), RocketError> {
        check_len(buf, Self::SIZE)?;
        put_u64(buf, 0, self.regcmd);
        put_u32(buf, 8, self.regcmd_count);
        put_u32(buf, 12, self.reserved);
        Ok(())
    }
}

/// Corresponds to C struct `drm_rocket_job`. Pointers are userspace
/// addresses of arrays of [`DrmRocketTask`] and `u32` handles.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrmRocketJob {
    pub tasks: u64,
    pub task_count: u32,
    pub reserved0: u32,
    pub in_bo_handles: u64,
    pub in_bo_handle_count: u32,
    pub reserved1: u32,
    pub out_bo_handles: u64,
    pub out_bo_handle_count: u32,
    pub reserved2: u32,
}

impl UapiStruct for DrmRocketJob {
    const SIZE: usize = 48;

    fn read_from(buf: &[u8]) -> Result<Self, RocketError> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            tasks: get_u64(buf, 0),
            task_count: get_u32(buf, 8),
            reserved0: get_u32(buf, 12),
            in_bo_handles: get_u64(buf, 16),
            in_bo_handle_count: get_u32(buf, 24),
            reserved1: get_u32(buf, 28),
            out_bo_handles: get_u64(buf, 32),
            out_bo_handle_count: get_u32(buf, 40),
            reserved2: get_u32(buf, 44),
        })
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<(), RocketError> {
        check_len(buf, Self::SIZE)?;
        put_u64(buf, 0, self.tasks);
        put_u32(buf, 8, self.task_count);
        put_u32(buf, 12, self.reserved0);
        put_u64(buf, 16, self.in_bo_handles);
        put_u32(buf, 24, self.in_bo_handle_count);
        put_u32(buf, 28, self.reserved1);
        put_u64(buf, 32, self.out_bo_handles);
        put_u32(buf, 40, self.out_bo_handle_count);
        put_u32(buf, 44, self.reserved2);
        Ok(())
    }
}

/// Corresponds to C struct `drm_rocket_submit`.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DrmRocketSubmit {
    /// Userspace address of an array of [`DrmRocketJob`].
    pub jobs: u64,
    pub job_count: u32,
    pub reserved: u32,
}

impl UapiStruct for DrmRocketSubmit {
    const SIZE: usize = 16;

    fn read_from(buf: &[u8]) -> Result<Self, RocketError> {
        check_len(buf, Self::SIZE)?;
        Ok(Self {
            jobs: get_u64(buf, 0),
            job_count: get_u32(buf, 8),
            reserved: get_u32(buf, 12),
        })
    }

    fn write_to(&self, buf: &mut [u8]) -> Result<(), RocketError> {
        check_len(buf, Self::SIZE)?;
        put_u64(buf, 0, self.jobs);
        put_u32(buf, 8, self.job_count);
        put_u32(buf, 12, self.reserved);
        Ok(())
    }
}

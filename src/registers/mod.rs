//! Memory-mapped register definitions for the Rockchip NPU.
//!
//! The register layout is described using [`tock_registers`], which provides a
//! safe and zero-cost abstraction over volatile MMIO access. This is the only
//! module of the crate that dereferences a register window.

use core::ptr::NonNull;

use tock_registers::interfaces::Readable;

pub mod consts;
pub mod pc;

use consts::{OFFSET_CNA, OFFSET_CORE};
use pc::{PcRegs, SPointerRegs};

/// Typed view of one core's register window.
pub struct RocketRegisters {
    base: NonNull<u8>,
}

unsafe impl Send for RocketRegisters {}
unsafe impl Sync for RocketRegisters {}

impl RocketRegisters {
    /// Create a new facade over a core's MMIO region.
    ///
    /// # Safety
    ///
    /// The caller must ensure the provided pointer is a valid mapping of at
    /// least [`consts::REGISTER_WINDOW_SIZE`] bytes for the lifetime of the
    /// returned object.
    pub const unsafe fn new(base_addr: NonNull<u8>) -> Self {
        Self { base: base_addr }
    }

    #[inline]
    pub fn pc(&self) -> &PcRegs {
        // SAFETY: `new` guarantees the window covers the PC block at offset 0.
        unsafe { self.base.cast::<PcRegs>().as_ref() }
    }

    #[inline]
    pub fn cna(&self) -> &SPointerRegs {
        // SAFETY: the window covers the CNA block, see `new`.
        unsafe { self.base.add(OFFSET_CNA).cast::<SPointerRegs>().as_ref() }
    }

    #[inline]
    pub fn core(&self) -> &SPointerRegs {
        // SAFETY: the window covers the CORE block, see `new`.
        unsafe { self.base.add(OFFSET_CORE).cast::<SPointerRegs>().as_ref() }
    }

    pub fn version(&self) -> u32 {
        self.pc().version.get() + (self.pc().version_num.get() & 0xffff)
    }
}

//! Raw offsets and constants of the NPU register file.

/// Offset of the CNA block inside a core's register window.
pub const OFFSET_CNA: usize = 0x1000;
/// Offset of the CORE block inside a core's register window.
pub const OFFSET_CORE: usize = 0x3000;
/// Bytes a register window must span to cover every block the driver touches.
pub const REGISTER_WINDOW_SIZE: usize = 0x4000;

/// Value written to acknowledge all interrupt sources, DMA error bits included.
pub const INT_CLEAR_ALL: u32 = 0x3_FFFF;

/// Completion interrupts of the two DPU ping-pong halves.
pub const INT_DPU_0: u32 = 1 << 8;
pub const INT_DPU_1: u32 = 1 << 9;
pub const INT_DPU_DONE: u32 = INT_DPU_0 | INT_DPU_1;

/// Bus error bits reported in the raw interrupt status.
pub const INT_DMA_READ_ERROR: u32 = 1 << 16;
pub const INT_DMA_WRITE_ERROR: u32 = 1 << 17;

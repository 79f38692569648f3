use tock_registers::register_structs;
use tock_registers::registers::{ReadOnly, ReadWrite, WriteOnly};

register_structs! {
    /// Program-control block, at offset 0 of every core's register window.
    pub PcRegs {
        (0x0000 => pub version: ReadOnly<u32>),
        (0x0004 => pub version_num: ReadOnly<u32>),
        (0x0008 => pub operation_enable: ReadWrite<u32>),
        (0x000C => _reserved0),
        (0x0010 => pub base_address: ReadWrite<u32>),
        (0x0014 => pub register_amounts: ReadWrite<u32>),
        (0x0018 => _reserved1),
        (0x0020 => pub interrupt_mask: ReadWrite<u32>),
        (0x0024 => pub interrupt_clear: WriteOnly<u32>),
        (0x0028 => pub interrupt_status: ReadOnly<u32>),
        (0x002C => pub interrupt_raw_status: ReadOnly<u32>),
        (0x0030 => pub task_control: ReadWrite<u32>),
        (0x0034 => pub task_dma_base_addr: ReadWrite<u32>),
        (0x0038 => _reserved2),
        (0x003C => pub task_status: ReadOnly<u32>),
        (0x0040 => @END),
    }
}

register_structs! {
    /// The slice of the CNA and CORE blocks the job path programs.
    pub SPointerRegs {
        (0x0000 => _reserved0),
        (0x0004 => pub s_pointer: ReadWrite<u32>),
        (0x0008 => @END),
    }
}

/// Build a value suitable for writing into TASK_CONTROL.
///
/// The value is composed as `((0x6 | task_pp_en) << pc_task_number_bits) | task_number`,
/// i.e. TASK_COUNT_CLEAR and the reserved bit above the ping-pong enable.
pub fn build_pc_task_control(pc_task_number_bits: u32, task_pp_en: bool, task_number: u32) -> u32 {
    let ctrl = (0x6u32 | (task_pp_en as u32)) << pc_task_number_bits;
    let mask = if pc_task_number_bits >= 32 {
        u32::MAX
    } else {
        (1u32 << pc_task_number_bits) - 1
    };
    ctrl | (task_number & mask)
}

/// Build the S_POINTER value enabling pointer and executer ping-pong for a core.
pub fn multicore_command_value(core_index: u32) -> u32 {
    0xeu32.wrapping_add(0x10000000u32.wrapping_mul(core_index))
}

/// Widest value the PC_DATA_AMOUNT field of REGISTER_AMOUNTS holds.
pub const PC_DATA_AMOUNT_MAX: u32 = 0xffff;

/// Number of 64-bit register command pairs, minus one, as REGISTER_AMOUNTS wants it.
pub fn pc_data_amount(regcmd_count: u32, scale: u32) -> u32 {
    regcmd_count.div_ceil(scale).saturating_sub(1)
}

/// Whether a task of `regcmd_count` commands can be programmed at all.
pub fn regcmd_count_fits(regcmd_count: u32, scale: u32) -> bool {
    regcmd_count != 0 && pc_data_amount(regcmd_count, scale) <= PC_DATA_AMOUNT_MAX
}

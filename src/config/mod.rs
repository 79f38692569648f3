//! Per-SoC configuration records, selected by device-tree compatible string.

/// Returns a mask with the lowest `n` bits set.
pub const fn dma_bit_mask(n: u32) -> u64 {
    if n >= 64 {
        u64::MAX
    } else {
        (1u64 << n) - 1u64
    }
}

/// Upper bound on cores any supported SoC declares.
pub const MAX_NUM_CORES: usize = 3;

/// Resource names of one core, as they appear in its device-tree node.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct CoreNames {
    pub a_clk_name: &'static str,
    pub h_clk_name: &'static str,
    pub a_reset_name: &'static str,
    pub h_reset_name: &'static str,
    pub pm_domain_name: &'static str,
    pub irq_name: &'static str,
}

#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub enum RocketType {
    Rk3588,
}

#[derive(Debug, Clone)]
pub struct RocketConfig {
    pub ty: RocketType,
    /// Compatible of the node owning core 0 and the top clocks.
    pub top_compatible: &'static str,
    /// Compatible of the nodes of cores `1..num_cores`.
    pub core_compatible: &'static str,
    pub num_cores: usize,
    pub per_core: &'static [CoreNames],
    pub npu_clk_name: &'static str,
    pub pclk_name: &'static str,
    pub dma_mask: u64,
    pub pc_data_amount_scale: u32,
    pub pc_task_number_bits: u32,
    pub job_timeout_ms: u32,
    pub reset_retries: u32,
    pub reset_hold_us: u32,
    pub autosuspend_delay_ms: u32,
}

const RK3588_CORES: [CoreNames; 3] = [
    CoreNames {
        a_clk_name: "aclk0",
        h_clk_name: "hclk0",
        a_reset_name: "srst_a0",
        h_reset_name: "srst_h0",
        pm_domain_name: "npu0",
        irq_name: "npu0_irq",
    },
    CoreNames {
        a_clk_name: "aclk1",
        h_clk_name: "hclk1",
        a_reset_name: "srst_a1",
        h_reset_name: "srst_h1",
        pm_domain_name: "npu1",
        irq_name: "npu1_irq",
    },
    CoreNames {
        a_clk_name: "aclk2",
        h_clk_name: "hclk2",
        a_reset_name: "srst_a2",
        h_reset_name: "srst_h2",
        pm_domain_name: "npu2",
        irq_name: "npu2_irq",
    },
];

impl RocketConfig {
    pub fn new(ty: RocketType) -> Self {
        match ty {
            RocketType::Rk3588 => Self::new_3588(),
        }
    }

    /// Looks up the configuration matching a top-node compatible string.
    pub fn from_compatible(compatible: &str) -> Option<Self> {
        match compatible {
            "rockchip,rk3588-rknn-core-top" => Some(Self::new(RocketType::Rk3588)),
            _ => None,
        }
    }

    fn new_3588() -> Self {
        Self {
            ty: RocketType::Rk3588,
            top_compatible: "rockchip,rk3588-rknn-core-top",
            core_compatible: "rockchip,rk3588-rknn-core",
            num_cores: RK3588_CORES.len(),
            per_core: &RK3588_CORES,
            npu_clk_name: "npu",
            pclk_name: "pclk",
            dma_mask: dma_bit_mask(40),
            pc_data_amount_scale: 2,
            pc_task_number_bits: 12,
            job_timeout_ms: 2000,
            reset_retries: 3,
            reset_hold_us: 10,
            autosuspend_delay_ms: 50,
        }
    }

    pub fn core_names(&self, index: usize) -> Option<&CoreNames> {
        self.per_core.get(index)
    }
}

//! Mock host collaborators for driving a device without hardware.

#![allow(dead_code)]

use std::collections::BTreeMap;
use std::ptr::NonNull;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use rocket::{
    Clock, DmaAddr, DmaDevice, DmaSyncDirection, IommuDomain, Osal, PAGE_SIZE, PendingJob,
    PhysAddr, PowerDomain, REGISTER_WINDOW_SIZE, ResetControl, ResourceProvider, RocketDevice,
    RocketDeviceBuilder, RocketError, RocketFile, ScatterGatherTable, Shmem, Task, TimeStamp,
    UserMemory, align_up,
};

pub const TOP_COMPATIBLE: &str = "rockchip,rk3588-rknn-core-top";
pub const CORE_COMPATIBLE: &str = "rockchip,rk3588-rknn-core";

/// Time source that only moves when told to, or when the driver delays.
pub struct MockOsal {
    now: AtomicU64,
}

impl MockOsal {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            now: AtomicU64::new(1_000_000),
        })
    }

    pub fn advance_ms(&self, ms: u64) {
        self.now.fetch_add(ms * 1000, Ordering::SeqCst);
    }
}

impl Osal for MockOsal {
    fn get_time_us(&self) -> TimeStamp {
        self.now.load(Ordering::SeqCst)
    }

    fn udelay(&self, us: u32) {
        self.now.fetch_add(us as u64, Ordering::SeqCst);
    }
}

#[derive(Default)]
pub struct MockClock {
    enabled: AtomicI32,
    enables: AtomicUsize,
    fail: AtomicBool,
}

impl MockClock {
    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::SeqCst) > 0
    }

    pub fn enable_count(&self) -> i32 {
        self.enabled.load(Ordering::SeqCst)
    }

    pub fn total_enables(&self) -> usize {
        self.enables.load(Ordering::SeqCst)
    }

    pub fn fail_next_enable(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }
}

impl Clock for MockClock {
    fn prepare_enable(&self) -> Result<(), RocketError> {
        if self.fail.swap(false, Ordering::SeqCst) {
            return Err(RocketError::Busy);
        }
        self.enabled.fetch_add(1, Ordering::SeqCst);
        self.enables.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn disable_unprepare(&self) {
        self.enabled.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Records when the line was asserted and deasserted.
pub struct MockReset {
    osal: Arc<MockOsal>,
    asserted_at: Mutex<Vec<TimeStamp>>,
    deasserted_at: Mutex<Vec<TimeStamp>>,
}

impl MockReset {
    pub fn new(osal: Arc<MockOsal>) -> Self {
        Self {
            osal,
            asserted_at: Mutex::new(Vec::new()),
            deasserted_at: Mutex::new(Vec::new()),
        }
    }

    pub fn pulses(&self) -> usize {
        self.deasserted_at.lock().unwrap().len()
    }

    /// Hold time of every completed pulse, in microseconds.
    pub fn hold_times(&self) -> Vec<u64> {
        let asserted = self.asserted_at.lock().unwrap();
        let deasserted = self.deasserted_at.lock().unwrap();
        asserted
            .iter()
            .zip(deasserted.iter())
            .map(|(a, d)| d - a)
            .collect()
    }
}

impl ResetControl for MockReset {
    fn assert(&self) {
        self.asserted_at
            .lock()
            .unwrap()
            .push(self.osal.get_time_us());
    }

    fn deassert(&self) {
        self.deasserted_at
            .lock()
            .unwrap()
            .push(self.osal.get_time_us());
    }
}

#[derive(Default)]
pub struct MockPowerDomain {
    attached: AtomicBool,
}

impl MockPowerDomain {
    pub fn is_attached(&self) -> bool {
        self.attached.load(Ordering::SeqCst)
    }
}

impl PowerDomain for MockPowerDomain {
    fn attach(&self) -> Result<(), RocketError> {
        self.attached.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn detach(&self) {
        self.attached.store(false, Ordering::SeqCst);
    }
}

/// Single-level page table keyed by IOVA page.
pub struct MockIommu {
    pages: Mutex<BTreeMap<u64, PhysAddr>>,
    fail_next_map: AtomicBool,
}

impl MockIommu {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            pages: Mutex::new(BTreeMap::new()),
            fail_next_map: AtomicBool::new(false),
        })
    }

    pub fn mapped_pages(&self) -> usize {
        self.pages.lock().unwrap().len()
    }

    pub fn fail_next_map(&self) {
        self.fail_next_map.store(true, Ordering::SeqCst);
    }

    /// Physical frames behind `size` bytes at `iova`, page by page.
    pub fn walk(&self, iova: DmaAddr, size: usize) -> Vec<Option<PhysAddr>> {
        (0..size / PAGE_SIZE)
            .map(|i| self.iova_to_phys(iova + (i * PAGE_SIZE) as u64))
            .collect()
    }
}

impl IommuDomain for MockIommu {
    fn granule(&self) -> usize {
        PAGE_SIZE
    }

    fn map_sgtable(&self, iova: DmaAddr, sgt: &ScatterGatherTable) -> Result<usize, RocketError> {
        if self.fail_next_map.swap(false, Ordering::SeqCst) {
            return Err(RocketError::OutOfMemory);
        }

        let mut pages = self.pages.lock().unwrap();
        let mut cursor = iova;
        for entry in &sgt.entries {
            let len = align_up(entry.length as usize, PAGE_SIZE) as u64;
            let mut off = 0;
            while off < len {
                if pages.insert(cursor + off, entry.addr + off).is_some() {
                    return Err(RocketError::InvalidArgument);
                }
                off += PAGE_SIZE as u64;
            }
            cursor += len;
        }
        Ok((cursor - iova) as usize)
    }

    fn unmap(&self, iova: DmaAddr, size: usize) -> usize {
        let mut pages = self.pages.lock().unwrap();
        (0..size / PAGE_SIZE)
            .filter(|i| pages.remove(&(iova + (i * PAGE_SIZE) as u64)).is_some())
            .count()
            * PAGE_SIZE
    }

    fn iova_to_phys(&self, iova: DmaAddr) -> Option<PhysAddr> {
        let page = iova & !(PAGE_SIZE as u64 - 1);
        self.pages
            .lock()
            .unwrap()
            .get(&page)
            .map(|phys| phys + (iova - page))
    }
}

/// DMA API of one core. With an IOMMU attached it hands out IOVAs from a
/// bump allocator and maps them, the way core 0's DMA path does.
pub struct MockDma {
    iommu: Option<Arc<MockIommu>>,
    next_iova: AtomicU64,
    pub mask: AtomicU64,
    pub syncs_for_cpu: AtomicUsize,
    pub syncs_for_device: AtomicUsize,
    pub last_dir: Mutex<Option<DmaSyncDirection>>,
}

impl MockDma {
    pub fn new(iommu: Option<Arc<MockIommu>>) -> Arc<Self> {
        Arc::new(Self {
            iommu,
            next_iova: AtomicU64::new(0x1000_0000),
            mask: AtomicU64::new(u64::MAX),
            syncs_for_cpu: AtomicUsize::new(0),
            syncs_for_device: AtomicUsize::new(0),
            last_dir: Mutex::new(None),
        })
    }

    /// Makes the next mapping start at `iova`.
    pub fn set_next_iova(&self, iova: u64) {
        self.next_iova.store(iova, Ordering::SeqCst);
    }
}

impl DmaDevice for MockDma {
    fn set_dma_mask(&self, mask: u64) -> Result<(), RocketError> {
        self.mask.store(mask, Ordering::SeqCst);
        Ok(())
    }

    fn map_sgtable(&self, sgt: &ScatterGatherTable) -> Result<DmaAddr, RocketError> {
        let size = align_up(sgt.total_size() as usize, PAGE_SIZE) as u64;
        let iova = self.next_iova.fetch_add(size, Ordering::SeqCst);
        if let Some(iommu) = &self.iommu {
            iommu.map_sgtable(iova, sgt)?;
        }
        Ok(iova)
    }

    fn unmap_sgtable(&self, sgt: &ScatterGatherTable, dma_addr: DmaAddr) {
        if let Some(iommu) = &self.iommu {
            iommu.unmap(dma_addr, align_up(sgt.total_size() as usize, PAGE_SIZE));
        }
    }

    fn sync_for_cpu(&self, _sgt: &ScatterGatherTable, dir: DmaSyncDirection) {
        self.syncs_for_cpu.fetch_add(1, Ordering::SeqCst);
        *self.last_dir.lock().unwrap() = Some(dir);
    }

    fn sync_for_device(&self, _sgt: &ScatterGatherTable, dir: DmaSyncDirection) {
        self.syncs_for_device.fetch_add(1, Ordering::SeqCst);
        *self.last_dir.lock().unwrap() = Some(dir);
    }
}

/// Hands out scattered page frames, one entry per page.
pub struct MockShmem {
    next_frame: AtomicU64,
    live: AtomicUsize,
}

impl MockShmem {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            next_frame: AtomicU64::new(0x8000_0000),
            live: AtomicUsize::new(0),
        })
    }

    pub fn live(&self) -> usize {
        self.live.load(Ordering::SeqCst)
    }
}

impl Shmem for MockShmem {
    fn alloc(&self, size: usize) -> Result<ScatterGatherTable, RocketError> {
        let mut sgt = ScatterGatherTable::new();
        for _ in 0..size.div_ceil(PAGE_SIZE) {
            // Leave a hole after every frame so the pages are not contiguous.
            let frame = self
                .next_frame
                .fetch_add(2 * PAGE_SIZE as u64, Ordering::SeqCst);
            sgt.add_entry(frame, PAGE_SIZE as u32);
        }
        self.live.fetch_add(1, Ordering::SeqCst);
        Ok(sgt)
    }

    fn free(&self, _sgt: ScatterGatherTable) {
        self.live.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A fake process address space.
pub struct MockUser {
    regions: Mutex<BTreeMap<u64, Vec<u8>>>,
    next: AtomicU64,
}

impl MockUser {
    pub fn new() -> Self {
        Self {
            regions: Mutex::new(BTreeMap::new()),
            next: AtomicU64::new(0x7f00_0000_0000),
        }
    }

    pub fn put(&self, bytes: Vec<u8>) -> u64 {
        let addr = self
            .next
            .fetch_add(align_up(bytes.len().max(1), 0x1000) as u64, Ordering::SeqCst);
        self.regions.lock().unwrap().insert(addr, bytes);
        addr
    }
}

impl UserMemory for MockUser {
    fn copy_from_user(&self, addr: u64, buf: &mut [u8]) -> Result<(), RocketError> {
        if buf.is_empty() {
            return Ok(());
        }
        let regions = self.regions.lock().unwrap();
        let (start, bytes) = regions
            .range(..=addr)
            .next_back()
            .ok_or(RocketError::Fault)?;
        let off = (addr - start) as usize;
        let src = bytes
            .get(off..off + buf.len())
            .ok_or(RocketError::Fault)?;
        buf.copy_from_slice(src);
        Ok(())
    }
}

/// Heap-backed register window of one core.
pub struct MmioWindow {
    words: Box<[u32]>,
    base: NonNull<u32>,
}

unsafe impl Send for MmioWindow {}
unsafe impl Sync for MmioWindow {}

impl MmioWindow {
    pub const RAW_STATUS: usize = 0x2C;

    pub fn new() -> Self {
        let mut words = vec![0u32; REGISTER_WINDOW_SIZE / 4].into_boxed_slice();
        words[0] = 0x0001_0000;
        words[1] = 0x0000_0301;
        let base = NonNull::new(words.as_mut_ptr()).unwrap();
        Self { words, base }
    }

    pub fn base(&self) -> NonNull<u8> {
        self.base.cast()
    }

    pub fn read(&self, offset: usize) -> u32 {
        unsafe { self.base.add(offset / 4).read_volatile() }
    }

    pub fn write(&self, offset: usize, value: u32) {
        unsafe { self.base.add(offset / 4).write_volatile(value) }
    }
}

/// Every resource of one core node.
pub struct MockCore {
    pub window: MmioWindow,
    pub a_clk: Arc<MockClock>,
    pub h_clk: Arc<MockClock>,
    pub a_reset: Arc<MockReset>,
    pub h_reset: Arc<MockReset>,
    pub pd: Arc<MockPowerDomain>,
    pub iommu: Arc<MockIommu>,
    pub dma: Arc<MockDma>,
    pub irq: u32,
}

impl MockCore {
    pub fn new(index: usize, osal: &Arc<MockOsal>) -> Self {
        let iommu = MockIommu::new();
        // Core 0's DMA API maps through its IOMMU; other cores only sync.
        let dma = MockDma::new((index == 0).then(|| iommu.clone()));
        Self {
            window: MmioWindow::new(),
            a_clk: Arc::new(MockClock::default()),
            h_clk: Arc::new(MockClock::default()),
            a_reset: Arc::new(MockReset::new(osal.clone())),
            h_reset: Arc::new(MockReset::new(osal.clone())),
            pd: Arc::new(MockPowerDomain::default()),
            iommu,
            dma,
            irq: 110 + index as u32,
        }
    }

    pub fn clocks_enabled(&self) -> bool {
        self.a_clk.is_enabled() && self.h_clk.is_enabled()
    }

    pub fn clocks_disabled(&self) -> bool {
        !self.a_clk.is_enabled() && !self.h_clk.is_enabled()
    }

    pub fn base_address(&self) -> u32 {
        self.window.read(0x10)
    }
}

/// Resource lookup over one core node, optionally carrying the top clocks.
pub struct MockNode<'a> {
    pub index: usize,
    pub core: &'a MockCore,
    pub top_clocks: Option<(Arc<MockClock>, Arc<MockClock>)>,
    pub missing: &'a [&'a str],
    pub no_mmio: bool,
}

impl MockNode<'_> {
    fn has(&self, name: &str) -> bool {
        !self.missing.contains(&name)
    }
}

unsafe impl ResourceProvider for MockNode<'_> {
    fn mmio(&self, index: usize) -> Option<NonNull<u8>> {
        (index == 0 && !self.no_mmio).then(|| self.core.window.base())
    }

    fn irq_byname(&self, name: &str) -> Option<u32> {
        (name == format!("npu{}_irq", self.index) && self.has(name)).then_some(self.core.irq)
    }

    fn clock(&self, name: &str) -> Option<Arc<dyn Clock>> {
        if !self.has(name) {
            return None;
        }
        if let Some((npu, pclk)) = &self.top_clocks {
            match name {
                "npu" => return Some(npu.clone()),
                "pclk" => return Some(pclk.clone()),
                _ => {}
            }
        }
        if name == format!("aclk{}", self.index) {
            Some(self.core.a_clk.clone())
        } else if name == format!("hclk{}", self.index) {
            Some(self.core.h_clk.clone())
        } else {
            None
        }
    }

    fn reset(&self, name: &str) -> Option<Arc<dyn ResetControl>> {
        if !self.has(name) {
            return None;
        }
        if name == format!("srst_a{}", self.index) {
            Some(self.core.a_reset.clone())
        } else if name == format!("srst_h{}", self.index) {
            Some(self.core.h_reset.clone())
        } else {
            None
        }
    }

    fn power_domain(&self, name: &str) -> Option<Arc<dyn PowerDomain>> {
        (name == format!("npu{}", self.index) && self.has(name))
            .then(|| self.core.pd.clone() as Arc<dyn PowerDomain>)
    }

    fn dma_device(&self) -> Arc<dyn DmaDevice> {
        self.core.dma.clone()
    }

    fn iommu_domain(&self) -> Option<Arc<dyn IommuDomain>> {
        Some(self.core.iommu.clone())
    }
}

/// A fully probed three-core device and the mocks behind it.
pub struct TestDevice {
    pub dev: Arc<RocketDevice>,
    pub osal: Arc<MockOsal>,
    pub shmem: Arc<MockShmem>,
    pub clk_npu: Arc<MockClock>,
    pub pclk: Arc<MockClock>,
    pub cores: Vec<MockCore>,
}

impl TestDevice {
    pub fn new() -> Self {
        let osal = MockOsal::new();
        let shmem = MockShmem::new();
        let clk_npu = Arc::new(MockClock::default());
        let pclk = Arc::new(MockClock::default());
        let cores: Vec<MockCore> = (0..3).map(|i| MockCore::new(i, &osal)).collect();

        let top = MockNode {
            index: 0,
            core: &cores[0],
            top_clocks: Some((clk_npu.clone(), pclk.clone())),
            missing: &[],
            no_mmio: false,
        };
        let mut builder =
            RocketDeviceBuilder::new(TOP_COMPATIBLE, &top, osal.clone(), shmem.clone()).unwrap();
        for (i, core) in cores.iter().enumerate().skip(1) {
            let node = MockNode {
                index: i,
                core,
                top_clocks: None,
                missing: &[],
                no_mmio: false,
            };
            builder.bind_component(CORE_COMPATIBLE, i, &node).unwrap();
        }
        let dev = builder.register().unwrap();

        Self {
            dev,
            osal,
            shmem,
            clk_npu,
            pclk,
            cores,
        }
    }

    /// Raises the DPU completion interrupt on core `index` and runs the
    /// handler.
    pub fn raise_irq(&self, index: usize) {
        let window = &self.cores[index].window;
        window.write(MmioWindow::RAW_STATUS, 1 << 8);
        self.dev.handle_irq(index);
        window.write(MmioWindow::RAW_STATUS, 0);
    }

    pub fn open(&self) -> RocketFile {
        RocketFile::open(&self.dev).unwrap()
    }
}

/// A BO created through `file`, returning its handle.
pub fn create_bo(file: &RocketFile, size: u32) -> u32 {
    let mut args = rocket::DrmRocketCreateBo {
        size,
        ..Default::default()
    };
    file.create_bo(&mut args).unwrap();
    args.handle
}

pub fn tasks(regcmds: &[u64]) -> Vec<Task> {
    regcmds
        .iter()
        .map(|&regcmd| Task {
            regcmd,
            regcmd_count: 16,
        })
        .collect()
}

/// Pushes a job on `file` built from handles.
pub fn push(
    file: &RocketFile,
    regcmds: &[u64],
    in_handles: &[u32],
    out_handles: &[u32],
) -> Arc<rocket::Job> {
    let lookup = |handles: &[u32]| -> Vec<_> {
        handles
            .iter()
            .map(|&h| file.lookup_bo(h).unwrap())
            .collect()
    };
    let pending = PendingJob::new(tasks(regcmds), lookup(in_handles), lookup(out_handles)).unwrap();
    file.push_job(pending).unwrap()
}

//! In-memory model of an LX2160A-class DPAA2 block used by the unit tests and, through the `sim`
//! feature, by the tests of dependent crates.
//!
//! [`SimHal`] implements [`Hal`] over sparse memory and intercepts accesses to the MC CCSR block,
//! the MC command portals and the QBMan software portals:
//!
//! - MC commands complete as soon as their header is written, once the firmware is running.
//! - Releasing the MC cores schedules boot completion; clearing GSR afterwards schedules DPL
//!   completion. Both complete during a later [`Hal::stall`].
//! - Buffer releases and enqueues take effect immediately. Management commands and volatile
//!   dequeues are answered during the next [`Hal::stall`], the way hardware answers
//!   asynchronously.
//! - Frames enqueued to a DPNI queuing destination are confirmed on its Tx confirmation queue and,
//!   when the DPNI is enabled, connected to an up DPMAC and the destination passes its filter,
//!   looped back onto its Rx queue.
//!
//! CPU writes through [`Hal::write_bytes`] leave data cache lines dirty until cleaned; hardware
//! reads of dirty lines are counted as DMA violations.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use std::{
    cell::RefCell,
    collections::{BTreeMap, HashMap, HashSet, VecDeque},
    sync::Once,
};

use crate::{
    config::PlatformConfig,
    fdt::{Fdt, FdtHeader, FDT_HEADER_SIZE},
    fit,
    hal::{Hal, CACHE_LINE_SIZE},
    mc::{
        boot::{GCR1_RELEASE, MC_GCR1, MC_GSR, MC_MCFBAHR, MC_MCFBALR},
        command::{unpack_mac, unpack_name, McCommand, McStatus, MC_CMD_NUM_OF_PARAMS},
        dpbp, dpio, dpmac, dpni, dprc,
        dpni::ExtendedConfig,
        log::{McLog, MC_LOG_MAGIC},
        object,
        version::{McVersion, MC_CMDID_GET_VERSION},
    },
    qbman::{
        codec::{acquire, decode_u64, dqrr, encode_u64, enqueue, generic, pull, release, CacheLine, CACHELINE_WORDS},
        descriptor::{FrameDescriptor, RESULT_DQ, STAT_EXPIRED, STAT_FQEMPTY, STAT_VALIDFRAME, STAT_VOLATILE},
        portal::{
            cena_rr, ALLOC_SUCCESS, CENA_CR, CENA_VDQCR, CINH_CFG, CINH_EQAR, CINH_RAR, MAX_BUFFERS_PER_COMMAND,
            QBMAN_DQRR_SIZE, QBMAN_MC_ACQUIRE, QBMAN_MC_RSLT_OK, VALID_BIT,
        },
    },
};

pub const FIRMWARE_VERSION: McVersion = McVersion { major: 10, minor: 28, revision: 1 };
pub const FIRMWARE_PAYLOAD: &[u8] = b"\x7fMCFW simulated management complex firmware, build 10.28.1\0";

/// Base the page allocator hands out first; also the DRAM used by `start_firmware_for_test`.
pub const SIM_DRAM_BASE: u64 = 0x80_0000_0000;

const PAGE_SIZE: u64 = 0x1000;
const BOOT_DELAY_US: u64 = 2500;
const DPL_DELAY_US: u64 = 1000;

const QBMAN_WINDOW: u64 = 0x800_0000;
const QBMAN_CINH_OFFSET: u64 = 0x400_0000;
const QBMAN_PORTAL_STRIDE: u64 = 0x1_0000;
const QBMAN_CENA_SIZE: u64 = 0x800;
const QBMAN_VERSION: u32 = 0x0502_0000;
const MC_PORTAL_SIZE: u64 = 8 * (MC_CMD_NUM_OF_PARAMS as u64 + 1);
const CCSR_SIZE: u64 = 0x1000;

const LOG_BUFFER_GAP: u32 = 0x1000;
const LOG_BUFFER_LENGTH: u32 = 0x4000;

const ROOT_CONTAINER_ID: u32 = 1;
const DPNI_TX_DATA_OFFSET: u64 = 128;
const DPNI_RX_DATA_OFFSET: u16 = 128;
const DPNI_RX_ANNOTATION: u64 = 64;
const DPNI_MTU: u64 = 1500;
const MCFBALR_BASE_MASK: u32 = 0xE000_0000;

thread_local! {
    static CAPTURED: RefCell<Option<Vec<String>>> = const { RefCell::new(None) };
}

struct CaptureLogger;

impl log::Log for CaptureLogger {
    fn enabled(&self, _metadata: &log::Metadata) -> bool {
        true
    }

    fn log(&self, record: &log::Record) {
        CAPTURED.with(|captured| {
            if let Some(lines) = captured.borrow_mut().as_mut() {
                lines.push(record.args().to_string());
            }
        });
    }

    fn flush(&self) {}
}

static LOGGER: CaptureLogger = CaptureLogger;
static INSTALL_LOGGER: Once = Once::new();

/// Starts recording log messages emitted by the calling thread, dropping earlier ones.
pub fn capture_logs() {
    INSTALL_LOGGER.call_once(|| {
        let _ = log::set_logger(&LOGGER);
        log::set_max_level(log::LevelFilter::Trace);
    });
    CAPTURED.with(|captured| *captured.borrow_mut() = Some(Vec::new()));
}

/// Number of recorded messages containing `needle`.
pub fn captured_log_count(needle: &str) -> usize {
    CAPTURED.with(|captured| {
        captured.borrow().as_ref().map_or(0, |lines| lines.iter().filter(|line| line.contains(needle)).count())
    })
}

/// A DPC with the nodes the fixups touch and none of the properties they add.
pub fn dpc_blob() -> Vec<u8> {
    let mut dpc = Fdt::default();
    let resources = dpc.root.subnode_or_insert("resources");
    let pool = resources.subnode_or_insert("icid_pools").subnode_or_insert("icid_pool@0");
    pool.set_property_u32("base_icid", 0);
    pool.set_property_u32("num", 100);
    let ports = dpc.root.subnode_or_insert("board_info").subnode_or_insert("ports");
    for id in 1..=4 {
        ports.subnode_or_insert(&format!("mac@{}", id)).set_property_str("link_type", "MAC_LINK_TYPE_FIXED");
    }
    dpc.root.subnode_or_insert("mc_general").subnode_or_insert("log");
    dpc.to_bytes()
}

/// A DPL declaring four DPMACs and one DPNI.
pub fn dpl_blob() -> Vec<u8> {
    let mut dpl = Fdt::default();
    let objects = dpl.root.subnode_or_insert("objects");
    for id in 1..=4 {
        objects.subnode_or_insert(&format!("dpmac@{}", id)).set_property_str("compatible", "fsl,dpmac");
    }
    objects.subnode_or_insert("dpni@0").set_property_u32("num_queues", 1);
    dpl.root.subnode_or_insert("containers").subnode_or_insert("dprc@1").set_property_str("compatible", "fsl,dprc");
    dpl.to_bytes()
}

struct Memory {
    pages: HashMap<u64, Box<[u8; PAGE_SIZE as usize]>>,
}

impl Memory {
    fn read(&self, address: u64, buffer: &mut [u8]) {
        for (index, byte) in buffer.iter_mut().enumerate() {
            let at = address + index as u64;
            *byte = self.pages.get(&(at / PAGE_SIZE)).map_or(0, |page| page[(at % PAGE_SIZE) as usize]);
        }
    }

    fn write(&mut self, address: u64, data: &[u8]) {
        for (index, byte) in data.iter().enumerate() {
            let at = address + index as u64;
            let page = self.pages.entry(at / PAGE_SIZE).or_insert_with(|| Box::new([0; PAGE_SIZE as usize]));
            page[(at % PAGE_SIZE) as usize] = *byte;
        }
    }

    fn read_u32(&self, address: u64) -> u32 {
        let mut bytes = [0u8; 4];
        self.read(address, &mut bytes);
        u32::from_le_bytes(bytes)
    }

    fn read_u64(&self, address: u64) -> u64 {
        let mut bytes = [0u8; 8];
        self.read(address, &mut bytes);
        u64::from_le_bytes(bytes)
    }

    fn read_vec(&self, address: u64, length: usize) -> Vec<u8> {
        let mut bytes = vec![0u8; length];
        self.read(address, &mut bytes);
        bytes
    }
}

#[derive(Default)]
struct Allocator {
    next: u64,
    live: BTreeMap<u64, u64>,
    freed: usize,
    limit: Option<usize>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ObjectKind {
    Dprc,
    Dpbp,
    Dpio,
    Dpni,
    Dpmac,
}

struct SimContainer {
    parent: Option<u32>,
    portal_id: u32,
}

struct SimDpbp {
    container: u32,
    bpid: u16,
    enabled: bool,
}

struct SimDpio {
    container: u32,
    portal: u32,
    num_priorities: u8,
    channel_mode: u64,
    enabled: bool,
}

struct SimDpni {
    container: u32,
    enabled: bool,
    bpid: Option<u16>,
    filters: Vec<[u8; 6]>,
    layouts: usize,
    rx_fqid: u32,
    tx_conf_fqid: u32,
    qdid: u32,
}

struct SimDpmac {
    container: u32,
    link_up: bool,
}

/// Objects, tokens and connections held by the MC firmware.
#[derive(Default)]
struct McModel {
    running: bool,
    commands_hang: bool,
    version: Option<McVersion>,
    failures: Vec<(u16, McStatus)>,
    containers: BTreeMap<u32, SimContainer>,
    dpbps: BTreeMap<u32, SimDpbp>,
    dpios: BTreeMap<u32, SimDpio>,
    dpnis: BTreeMap<u32, SimDpni>,
    dpmacs: BTreeMap<u32, SimDpmac>,
    connections: Vec<(u32, u32)>,
    tokens: BTreeMap<u16, (ObjectKind, u32)>,
    next_token: u16,
    next_id: u32,
    next_bpid: u16,
    next_fqid: u32,
    next_mc_portal: u32,
    params_since_header: usize,
    header_written_last: bool,
}

#[derive(Default)]
struct BootModel {
    hang: bool,
    status: Option<u32>,
    boot_at: Option<u64>,
    dpl_at: Option<u64>,
    dram_base: u64,
    log_header: Option<u64>,
    booted_dpc: Option<Vec<u8>>,
    deployed_dpl: Option<Vec<u8>>,
    ccsr_writes: usize,
}

struct SimPortal {
    cena: Vec<u32>,
    cfg: u32,
    eq_index: u8,
    eq_valid_bit: u8,
    rcr_index: u8,
    rcr_valid_bit: u8,
    dqrr_index: u8,
    dqrr_valid_bit: u8,
}

impl SimPortal {
    fn new() -> Self {
        Self {
            cena: vec![0; (QBMAN_CENA_SIZE / 4) as usize],
            cfg: 0,
            eq_index: 0,
            eq_valid_bit: VALID_BIT,
            rcr_index: 0,
            rcr_valid_bit: VALID_BIT,
            dqrr_index: 0,
            dqrr_valid_bit: VALID_BIT,
        }
    }

    fn line(&self, offset: u64) -> CacheLine {
        let start = (offset / 4) as usize;
        let mut line = [0u32; CACHELINE_WORDS];
        line.copy_from_slice(&self.cena[start..start + CACHELINE_WORDS]);
        line
    }

    fn store_line(&mut self, offset: u64, line: &CacheLine) {
        let start = (offset / 4) as usize;
        self.cena[start..start + CACHELINE_WORDS].copy_from_slice(line);
    }

    /// Reserves the next slot of an 8-entry producer ring the way EQAR and RAR report it.
    fn reserve(index: &mut u8, valid_bit: &mut u8) -> u32 {
        let value = ALLOC_SUCCESS | u32::from(*valid_bit) | u32::from(*index);
        *index = (*index + 1) & 7;
        if *index == 0 {
            *valid_bit ^= VALID_BIT;
        }
        value
    }

    fn push_dqrr(&mut self, mut line: CacheLine) {
        line[0] |= u32::from(self.dqrr_valid_bit);
        let offset = 0x200 + (u64::from(self.dqrr_index) << 6);
        self.store_line(offset, &line);
        self.dqrr_index = (self.dqrr_index + 1) & (QBMAN_DQRR_SIZE - 1);
        if self.dqrr_index == 0 {
            self.dqrr_valid_bit ^= VALID_BIT;
        }
    }
}

#[derive(Debug, Clone, Copy)]
enum Route {
    FrameQueue(u32),
    Dpni(u32),
}

#[derive(Debug, Clone, Copy)]
enum PendingWork {
    Command { portal: u32, line: CacheLine },
    Pull { portal: u32, line: CacheLine },
}

/// Buffer pools, frame queues and software portals.
#[derive(Default)]
struct QbmanModel {
    portals: BTreeMap<u32, SimPortal>,
    pools: BTreeMap<u16, VecDeque<u64>>,
    frame_queues: BTreeMap<u32, VecDeque<FrameDescriptor>>,
    routes: BTreeMap<u32, Route>,
    pending: VecDeque<PendingWork>,
    commands_hang: bool,
    enqueue_full: bool,
    release_full: bool,
    corrupt_next_dequeue: bool,
    rx_annotation_status: u32,
}

impl QbmanModel {
    fn free_portal_index(&self) -> u32 {
        (0..).find(|index| !self.portals.contains_key(index)).unwrap_or(0)
    }
}

struct SimState {
    config: PlatformConfig,
    elapsed_us: u64,
    memory: Memory,
    dirty: HashSet<u64>,
    ignore_cache_maintenance: bool,
    dma_violations: usize,
    allocator: Allocator,
    boot: BootModel,
    mc: McModel,
    qbman: QbmanModel,
}

/// Simulated platform. Not thread safe; each test owns one.
pub struct SimHal {
    state: RefCell<SimState>,
}

impl Default for SimHal {
    fn default() -> Self {
        Self::new()
    }
}

enum Region {
    Ccsr(u64),
    McPortal(u32, u64),
    QbmanCena(u32, u64),
    QbmanCinh(u32, u64),
    Memory,
}

impl SimHal {
    pub fn new() -> Self {
        let config = PlatformConfig::default();
        let mut mc = McModel { next_token: 1, next_id: 1, next_bpid: 1, next_fqid: 0x100, next_mc_portal: 1, ..Default::default() };
        mc.containers.insert(ROOT_CONTAINER_ID, SimContainer { parent: None, portal_id: 0 });
        Self {
            state: RefCell::new(SimState {
                config,
                elapsed_us: 0,
                memory: Memory { pages: HashMap::new() },
                dirty: HashSet::new(),
                ignore_cache_maintenance: false,
                dma_violations: 0,
                allocator: Allocator { next: SIM_DRAM_BASE, ..Default::default() },
                boot: BootModel::default(),
                mc,
                qbman: QbmanModel::default(),
            }),
        }
    }

    /// A platform whose flash holds a valid firmware FIT, DPC and DPL.
    pub fn with_images() -> Self {
        let hal = Self::new();
        let config = hal.config();
        hal.write_flash(config.firmware_image.address, &fit::build_fit(&[("firmware", FIRMWARE_PAYLOAD)]));
        hal.write_flash(config.dpc_image.address, &dpc_blob());
        hal.write_flash(config.dpl_image.address, &dpl_blob());
        hal
    }

    pub fn config(&self) -> PlatformConfig {
        self.state.borrow().config.clone()
    }

    pub fn elapsed_us(&self) -> u64 {
        self.state.borrow().elapsed_us
    }

    pub fn write_flash(&self, address: u64, data: &[u8]) {
        self.state.borrow_mut().memory.write(address, data);
    }

    pub fn live_allocations(&self) -> usize {
        self.state.borrow().allocator.live.len()
    }

    pub fn freed_allocations(&self) -> usize {
        self.state.borrow().allocator.freed
    }

    /// Lets `count` more allocations succeed; later ones fail.
    pub fn set_allocation_limit(&self, count: usize) {
        self.state.borrow_mut().allocator.limit = Some(count);
    }

    pub fn is_dirty(&self, address: u64, length: usize) -> bool {
        let state = self.state.borrow();
        lines(address, length).any(|line| state.dirty.contains(&line))
    }

    /// Makes cache cleaning a no-op, as if the driver forgot it.
    pub fn set_cache_maintenance_ignored(&self, ignored: bool) {
        self.state.borrow_mut().ignore_cache_maintenance = ignored;
    }

    pub fn dma_violations(&self) -> usize {
        self.state.borrow().dma_violations
    }

    pub fn ccsr_writes(&self) -> usize {
        self.state.borrow().boot.ccsr_writes
    }

    pub fn booted_dpc(&self) -> Option<Fdt> {
        self.state.borrow().boot.booted_dpc.as_ref().and_then(|blob| Fdt::from_bytes(blob).ok())
    }

    pub fn deployed_dpl(&self) -> Option<Fdt> {
        self.state.borrow().boot.deployed_dpl.as_ref().and_then(|blob| Fdt::from_bytes(blob).ok())
    }

    /// Stops the firmware from ever completing boot or DPL deployment.
    pub fn set_boot_hang(&self, hang: bool) {
        self.state.borrow_mut().boot.hang = hang;
    }

    /// GSR status the firmware reports when boot completes.
    pub fn set_boot_status(&self, status: u32) {
        self.state.borrow_mut().boot.status = Some(status);
    }

    pub fn set_firmware_version(&self, version: McVersion) {
        self.state.borrow_mut().mc.version = Some(version);
    }

    /// Firmware is up and its cores are out of reset.
    pub fn mc_running(&self) -> bool {
        let state = self.state.borrow();
        state.mc.running && state.memory.read_u32(state.config.mc_ccsr_base + MC_GCR1) == GCR1_RELEASE
    }

    /// Marks the firmware as running with a log at [`SIM_DRAM_BASE`], skipping the boot flow.
    pub fn start_firmware_for_test(&self) -> McLog {
        let (dram_size, header_offset) = {
            let mut state = self.state.borrow_mut();
            state.mc.running = true;
            state.boot.dram_base = SIM_DRAM_BASE;
            state.init_log();
            state.append_log("I: firmware started\n");
            (state.config.private_memory.size(), state.config.log_header_offset)
        };
        McLog::locate(self, SIM_DRAM_BASE, dram_size, header_offset).expect("simulated log header")
    }

    /// Makes the next command `cmd_id` complete with `status`.
    pub fn fail_next_command(&self, cmd_id: u16, status: McStatus) {
        self.state.borrow_mut().mc.failures.push((cmd_id, status));
    }

    pub fn set_mc_commands_hang(&self, hang: bool) {
        self.state.borrow_mut().mc.commands_hang = hang;
    }

    /// The last command header was written after all parameter words.
    pub fn mc_header_written_last(&self) -> bool {
        self.state.borrow().mc.header_written_last
    }

    /// MC objects excluding the root container.
    pub fn mc_object_count(&self) -> usize {
        let mc = &self.state.borrow().mc;
        mc.containers.len() - 1 + mc.dpbps.len() + mc.dpios.len() + mc.dpnis.len() + mc.dpmacs.len()
    }

    pub fn open_token_count(&self) -> usize {
        self.state.borrow().mc.tokens.len()
    }

    pub fn dpni_enabled(&self, dpni_id: u32) -> bool {
        self.state.borrow().mc.dpnis.get(&dpni_id).is_some_and(|dpni| dpni.enabled)
    }

    pub fn dpni_mac_filters(&self, dpni_id: u32) -> Vec<[u8; 6]> {
        self.state.borrow().mc.dpnis.get(&dpni_id).map(|dpni| dpni.filters.clone()).unwrap_or_default()
    }

    pub fn dpbp_enabled(&self, bpid: u16) -> bool {
        self.state.borrow().mc.dpbps.values().any(|dpbp| dpbp.bpid == bpid && dpbp.enabled)
    }

    pub fn dpmac_link_up(&self, dpmac_id: u32) -> bool {
        self.state.borrow().mc.dpmacs.get(&dpmac_id).is_some_and(|dpmac| dpmac.link_up)
    }

    /// CENA and CINH addresses of software portal `index`.
    pub fn qbman_portal_addresses(&self, index: u32) -> (u64, u64) {
        let base = self.state.borrow().config.qbman_portals_base;
        let offset = u64::from(index) * QBMAN_PORTAL_STRIDE;
        (base + offset, base + QBMAN_CINH_OFFSET + offset)
    }

    /// Powers up the lowest free software portal.
    pub fn add_qbman_portal(&self) -> (u64, u64) {
        let index = {
            let mut state = self.state.borrow_mut();
            let index = state.qbman.free_portal_index();
            state.qbman.portals.insert(index, SimPortal::new());
            index
        };
        self.qbman_portal_addresses(index)
    }

    pub fn add_pool(&self, bpid: u16) {
        self.state.borrow_mut().qbman.pools.entry(bpid).or_default();
    }

    pub fn add_frame_queue(&self, fqid: u32) {
        self.state.borrow_mut().qbman.frame_queues.entry(fqid).or_default();
    }

    pub fn route_qdid(&self, qdid: u32, fqid: u32) {
        self.state.borrow_mut().qbman.routes.insert(qdid, Route::FrameQueue(fqid));
    }

    pub fn pool_len(&self, bpid: u16) -> usize {
        self.state.borrow().qbman.pools.get(&bpid).map_or(0, VecDeque::len)
    }

    pub fn frame_queue_len(&self, fqid: u32) -> usize {
        self.state.borrow().qbman.frame_queues.get(&fqid).map_or(0, VecDeque::len)
    }

    /// Empties pool `bpid` and returns its buffers.
    pub fn take_pool(&self, bpid: u16) -> Vec<u64> {
        self.state.borrow_mut().qbman.pools.get_mut(&bpid).map(|pool| pool.drain(..).collect()).unwrap_or_default()
    }

    pub fn restore_pool(&self, bpid: u16, buffers: &[u64]) {
        self.state.borrow_mut().qbman.pools.entry(bpid).or_default().extend(buffers.iter().copied());
    }

    pub fn set_qbman_commands_hang(&self, hang: bool) {
        self.state.borrow_mut().qbman.commands_hang = hang;
    }

    /// Reports both the enqueue and the release ring as full.
    pub fn set_rings_full(&self, full: bool) {
        let mut state = self.state.borrow_mut();
        state.qbman.enqueue_full = full;
        state.qbman.release_full = full;
    }

    pub fn set_enqueue_ring_full(&self, full: bool) {
        self.state.borrow_mut().qbman.enqueue_full = full;
    }

    /// Frame annotation status written into every looped back frame.
    pub fn set_rx_annotation_status(&self, status: u32) {
        self.state.borrow_mut().qbman.rx_annotation_status = status;
    }

    /// Makes the next volatile dequeue answer with neither a frame nor an empty queue.
    pub fn corrupt_next_dequeue(&self) {
        self.state.borrow_mut().qbman.corrupt_next_dequeue = true;
    }
}

fn lines(address: u64, length: usize) -> impl Iterator<Item = u64> {
    let first = address / CACHE_LINE_SIZE;
    let last = if length == 0 { first } else { (address + length as u64 - 1) / CACHE_LINE_SIZE + 1 };
    first..last
}

impl SimState {
    fn region(&self, address: u64) -> Region {
        let config = &self.config;
        if (config.mc_ccsr_base..config.mc_ccsr_base + CCSR_SIZE).contains(&address) {
            return Region::Ccsr(address - config.mc_ccsr_base);
        }
        let portals = config.mc_portals_base;
        if address >= portals && address < portals + config.mc_portal_stride * 1024 {
            let offset = (address - portals) % config.mc_portal_stride;
            if offset < MC_PORTAL_SIZE {
                return Region::McPortal(((address - portals) / config.mc_portal_stride) as u32, offset);
            }
        }
        let qbman = config.qbman_portals_base;
        if address >= qbman && address < qbman + QBMAN_WINDOW {
            let offset = address - qbman;
            return if offset < QBMAN_CINH_OFFSET {
                Region::QbmanCena((offset / QBMAN_PORTAL_STRIDE) as u32, offset % QBMAN_PORTAL_STRIDE)
            } else {
                let offset = offset - QBMAN_CINH_OFFSET;
                Region::QbmanCinh((offset / QBMAN_PORTAL_STRIDE) as u32, offset % QBMAN_PORTAL_STRIDE)
            };
        }
        Region::Memory
    }

    fn dma_read(&mut self, address: u64, length: usize) -> Vec<u8> {
        if lines(address, length).any(|line| self.dirty.contains(&line)) {
            self.dma_violations += 1;
        }
        self.memory.read_vec(address, length)
    }

    fn read32(&mut self, address: u64) -> u32 {
        match self.region(address) {
            Region::QbmanCena(index, offset) => match self.qbman.portals.get(&index) {
                Some(portal) if offset < QBMAN_CENA_SIZE => portal.cena[(offset / 4) as usize],
                _ => 0,
            },
            Region::QbmanCinh(index, offset) => {
                let QbmanModel { portals, enqueue_full, release_full, .. } = &mut self.qbman;
                let Some(portal) = portals.get_mut(&index) else {
                    return 0;
                };
                match offset {
                    CINH_CFG => portal.cfg,
                    CINH_EQAR if !*enqueue_full => SimPortal::reserve(&mut portal.eq_index, &mut portal.eq_valid_bit),
                    CINH_RAR if !*release_full => SimPortal::reserve(&mut portal.rcr_index, &mut portal.rcr_valid_bit),
                    _ => 0,
                }
            }
            _ => self.memory.read_u32(address),
        }
    }

    fn write32(&mut self, address: u64, value: u32) {
        match self.region(address) {
            Region::Ccsr(offset) => {
                self.boot.ccsr_writes += 1;
                self.memory.write(address, &value.to_le_bytes());
                self.ccsr_written(offset, value);
            }
            Region::QbmanCena(index, offset) => {
                let Some(portal) = self.qbman.portals.get_mut(&index) else {
                    return;
                };
                if offset >= QBMAN_CENA_SIZE {
                    return;
                }
                portal.cena[(offset / 4) as usize] = value;
                if offset % CACHE_LINE_SIZE == 0 {
                    self.portal_verb_written(index, offset);
                }
            }
            Region::QbmanCinh(index, offset) => {
                if let Some(portal) = self.qbman.portals.get_mut(&index) {
                    if offset == CINH_CFG {
                        portal.cfg = value;
                    }
                }
            }
            _ => self.memory.write(address, &value.to_le_bytes()),
        }
    }

    fn write64(&mut self, address: u64, value: u64) {
        self.memory.write(address, &value.to_le_bytes());
        if let Region::McPortal(portal_id, offset) = self.region(address) {
            if offset == 0 {
                self.mc.header_written_last = self.mc.params_since_header >= MC_CMD_NUM_OF_PARAMS;
                self.mc.params_since_header = 0;
                self.mc_command_written(portal_id, address);
            } else {
                self.mc.params_since_header += 1;
            }
        }
    }

    fn stall(&mut self, micros: u64) {
        self.elapsed_us += micros;

        let mut deferred = VecDeque::new();
        while let Some(work) = self.qbman.pending.pop_front() {
            match work {
                PendingWork::Command { .. } if self.qbman.commands_hang => deferred.push_back(work),
                PendingWork::Command { portal, line } => self.management_command(portal, &line),
                PendingWork::Pull { portal, line } => self.volatile_dequeue(portal, &line),
            }
        }
        self.qbman.pending = deferred;

        if self.boot.hang {
            return;
        }
        if self.boot.boot_at.is_some_and(|at| self.elapsed_us >= at) {
            self.boot.boot_at = None;
            self.complete_boot();
        }
        if self.boot.dpl_at.is_some_and(|at| self.elapsed_us >= at) {
            self.boot.dpl_at = None;
            self.complete_dpl();
        }
    }

    fn allocate(&mut self, size: u64, alignment: u64) -> Option<u64> {
        let allocator = &mut self.allocator;
        if let Some(limit) = allocator.limit.as_mut() {
            if *limit == 0 {
                return None;
            }
            *limit -= 1;
        }
        let alignment = alignment.max(PAGE_SIZE);
        let base = allocator.next.div_ceil(alignment) * alignment;
        let size = size.div_ceil(PAGE_SIZE) * PAGE_SIZE;
        allocator.next = base + size;
        allocator.live.insert(base, size);
        Some(base)
    }

    fn free(&mut self, address: u64, size: u64) {
        match self.allocator.live.remove(&address) {
            Some(allocated) if allocated == size.div_ceil(PAGE_SIZE) * PAGE_SIZE => self.allocator.freed += 1,
            Some(allocated) => panic!("free of {:#x} with size {:#x}, allocated {:#x}", address, size, allocated),
            None => panic!("free of unallocated {:#x}", address),
        }
    }

    // Boot flow.

    fn ccsr_written(&mut self, offset: u64, value: u32) {
        match offset {
            MC_GCR1 if value == GCR1_RELEASE => {
                if !self.mc.running && self.boot.boot_at.is_none() {
                    self.boot.boot_at = Some(self.elapsed_us + BOOT_DELAY_US);
                }
            }
            MC_GCR1 => {
                self.mc.running = false;
                self.boot.boot_at = None;
                self.boot.dpl_at = None;
            }
            MC_GSR if value == 0 && self.mc.running => {
                self.boot.dpl_at = Some(self.elapsed_us + DPL_DELAY_US);
            }
            _ => {}
        }
    }

    fn ccsr_read(&self, offset: u64) -> u32 {
        self.memory.read_u32(self.config.mc_ccsr_base + offset)
    }

    fn read_placed_fdt(&mut self, address: u64) -> Option<Vec<u8>> {
        let header = self.memory.read_vec(address, FDT_HEADER_SIZE);
        let header = FdtHeader::parse(&header).ok()?;
        Some(self.dma_read(address, header.total_size as usize))
    }

    fn complete_boot(&mut self) {
        let base = (u64::from(self.ccsr_read(MC_MCFBAHR)) << 32) | u64::from(self.ccsr_read(MC_MCFBALR) & MCFBALR_BASE_MASK);
        if self.dma_read(base, FIRMWARE_PAYLOAD.len()) != FIRMWARE_PAYLOAD {
            return;
        }
        let Some(dpc) = self.read_placed_fdt(base + self.config.dpc_dram_offset) else {
            return;
        };

        self.boot.dram_base = base;
        self.boot.booted_dpc = Some(dpc);
        self.mc.running = true;
        self.init_log();
        let version = self.mc.version.unwrap_or(FIRMWARE_VERSION);
        self.append_log(&format!("I: MC firmware version {} booted\nI: DPC applied\n", version));
        let status = self.boot.status.unwrap_or(1);
        self.memory.write(self.config.mc_ccsr_base + MC_GSR, &status.to_le_bytes());
    }

    fn complete_dpl(&mut self) {
        let Some(dpl) = self.read_placed_fdt(self.boot.dram_base + self.config.dpl_dram_offset) else {
            return;
        };
        self.boot.deployed_dpl = Some(dpl);
        self.append_log("I: DPL processed\n");
        self.memory.write(self.config.mc_ccsr_base + MC_GSR, &1u32.to_le_bytes());
    }

    fn init_log(&mut self) {
        let offset = self.config.log_header_offset;
        let header = self.boot.dram_base + offset;
        self.memory.write(header, &MC_LOG_MAGIC.to_le_bytes());
        self.memory.write(header + 0x08, &(offset as u32 + LOG_BUFFER_GAP).to_le_bytes());
        self.memory.write(header + 0x0C, &LOG_BUFFER_LENGTH.to_le_bytes());
        self.memory.write(header + 0x10, &0u32.to_le_bytes());
        self.boot.log_header = Some(header);
    }

    fn append_log(&mut self, text: &str) {
        let Some(header) = self.boot.log_header else {
            return;
        };
        let start = self.boot.dram_base + u64::from(self.memory.read_u32(header + 0x08));
        let mut position = self.memory.read_u32(header + 0x10);
        for byte in text.bytes() {
            let at = position & !crate::mc::log::LOG_WRAPPED;
            self.memory.write(start + u64::from(at), &[byte]);
            position = if at + 1 >= LOG_BUFFER_LENGTH { crate::mc::log::LOG_WRAPPED } else { (position & crate::mc::log::LOG_WRAPPED) | (at + 1) };
        }
        self.memory.write(header + 0x10, &position.to_le_bytes());
    }

    // MC command portals.

    fn mc_command_written(&mut self, portal_id: u32, address: u64) {
        if !self.mc.running || self.mc.commands_hang {
            return;
        }
        let mut command = McCommand { header: self.memory.read_u64(address), params: [0; MC_CMD_NUM_OF_PARAMS] };
        for (index, param) in command.params.iter_mut().enumerate() {
            *param = self.memory.read_u64(address + 8 * (index as u64 + 1));
        }

        let cmd_id = command.cmd_id();
        let failure = self.mc.failures.iter().position(|(id, _)| *id == cmd_id);
        let (header, params) = match failure.map(|index| self.mc.failures.remove(index).1) {
            Some(status) => (McCommand::header_with_status(command.header, status as u8), command.params),
            None => match self.execute(portal_id, &command) {
                Ok(response) => (response.header, response.params),
                Err(status) => (McCommand::header_with_status(command.header, status as u8), command.params),
            },
        };

        for (index, param) in params.iter().enumerate() {
            self.memory.write(address + 8 * (index as u64 + 1), &param.to_le_bytes());
        }
        self.memory.write(address, &header.to_le_bytes());
    }

    fn token_target(&self, token: u16) -> Result<(ObjectKind, u32), McStatus> {
        self.mc.tokens.get(&token).copied().ok_or(McStatus::AuthError)
    }

    fn container_of_token(&self, token: u16) -> Result<u32, McStatus> {
        match self.token_target(token)? {
            (ObjectKind::Dprc, id) => Ok(id),
            _ => Err(McStatus::InvalidState),
        }
    }

    fn new_token(&mut self, kind: ObjectKind, id: u32) -> u16 {
        let token = self.mc.next_token;
        self.mc.next_token = self.mc.next_token.wrapping_add(1).max(1);
        self.mc.tokens.insert(token, (kind, id));
        token
    }

    fn new_id(&mut self) -> u32 {
        let id = self.mc.next_id;
        self.mc.next_id += 1;
        id
    }

    fn new_fqid(&mut self) -> u32 {
        let fqid = self.mc.next_fqid;
        self.mc.next_fqid += 1;
        self.qbman.frame_queues.insert(fqid, VecDeque::new());
        fqid
    }

    fn object_exists(&self, kind: ObjectKind, id: u32) -> bool {
        match kind {
            ObjectKind::Dprc => self.mc.containers.contains_key(&id),
            ObjectKind::Dpbp => self.mc.dpbps.contains_key(&id),
            ObjectKind::Dpio => self.mc.dpios.contains_key(&id),
            ObjectKind::Dpni => self.mc.dpnis.contains_key(&id),
            ObjectKind::Dpmac => self.mc.dpmacs.contains_key(&id),
        }
    }

    fn object_container(&self, kind: ObjectKind, id: u32) -> Option<u32> {
        match kind {
            ObjectKind::Dprc => self.mc.containers.get(&id).and_then(|container| container.parent),
            ObjectKind::Dpbp => self.mc.dpbps.get(&id).map(|object| object.container),
            ObjectKind::Dpio => self.mc.dpios.get(&id).map(|object| object.container),
            ObjectKind::Dpni => self.mc.dpnis.get(&id).map(|object| object.container),
            ObjectKind::Dpmac => self.mc.dpmacs.get(&id).map(|object| object.container),
        }
    }

    fn open(&mut self, kind: ObjectKind, command: &McCommand) -> Result<McCommand, McStatus> {
        let id = object::OBJECT_ID.get(command) as u32;
        if !self.object_exists(kind, id) {
            return Err(McStatus::NoResource);
        }
        let token = self.new_token(kind, id);
        Ok(respond(command.cmd_id(), token))
    }

    fn destroy(&mut self, kind: ObjectKind, command: &McCommand) -> Result<u32, McStatus> {
        let container = self.container_of_token(command.token())?;
        let id = object::OBJECT_ID.get(command) as u32;
        if self.object_container(kind, id) != Some(container) {
            return Err(McStatus::NoResource);
        }
        if self.mc.tokens.values().any(|target| *target == (kind, id)) {
            return Err(McStatus::Busy);
        }
        Ok(id)
    }

    fn execute(&mut self, portal_id: u32, command: &McCommand) -> Result<McCommand, McStatus> {
        let cmd_id = command.cmd_id();
        let token = command.token();
        let mut response = respond(cmd_id, token);

        match cmd_id {
            MC_CMDID_GET_VERSION => self.mc.version.unwrap_or(FIRMWARE_VERSION).to_response(&mut response),
            dprc::CMDID_GET_CONT_ID => {
                let id = self
                    .mc
                    .containers
                    .iter()
                    .find(|(_, container)| container.portal_id == portal_id)
                    .map(|(id, _)| *id)
                    .ok_or(McStatus::NoPrivilege)?;
                dprc::fields::CONT_ID.set(&mut response, u64::from(id));
            }
            dprc::CMDID_OPEN => return self.open(ObjectKind::Dprc, command),
            dpbp::CMDID_OPEN => return self.open(ObjectKind::Dpbp, command),
            dpio::CMDID_OPEN => return self.open(ObjectKind::Dpio, command),
            dpni::CMDID_OPEN => return self.open(ObjectKind::Dpni, command),
            dpmac::CMDID_OPEN => return self.open(ObjectKind::Dpmac, command),
            object::CMDID_CLOSE => {
                self.mc.tokens.remove(&token).ok_or(McStatus::AuthError)?;
            }
            dprc::CMDID_CREATE_CONT => {
                let parent = self.container_of_token(token)?;
                let id = self.new_id();
                let portal = self.mc.next_mc_portal;
                self.mc.next_mc_portal += 1;
                self.mc.containers.insert(id, SimContainer { parent: Some(parent), portal_id: portal });
                dprc::fields::CHILD_CONT_ID.set(&mut response, u64::from(id));
                dprc::fields::CHILD_PORTAL_ID.set(&mut response, u64::from(portal));
            }
            dprc::CMDID_DESTROY_CONT => {
                let parent = self.container_of_token(token)?;
                let id = dprc::fields::DESTROY_CHILD_ID.get(command) as u32;
                if self.mc.containers.get(&id).and_then(|container| container.parent) != Some(parent) {
                    return Err(McStatus::NoResource);
                }
                let mc = &self.mc;
                let occupied = mc.containers.values().any(|container| container.parent == Some(id))
                    || mc.dpbps.values().any(|object| object.container == id)
                    || mc.dpios.values().any(|object| object.container == id)
                    || mc.dpnis.values().any(|object| object.container == id)
                    || mc.dpmacs.values().any(|object| object.container == id)
                    || mc.tokens.values().any(|target| *target == (ObjectKind::Dprc, id));
                if occupied {
                    return Err(McStatus::InvalidState);
                }
                self.mc.containers.remove(&id);
            }
            dprc::CMDID_CONNECT => {
                self.container_of_token(token)?;
                let first = endpoint(command, dprc::fields::EP1_ID, dprc::fields::EP1_TYPE_WORD);
                let second = endpoint(command, dprc::fields::EP2_ID, dprc::fields::EP2_TYPE_WORD);
                let (dpmac_id, dpni_id) = match (first, second) {
                    ((ObjectKind::Dpmac, mac), (ObjectKind::Dpni, ni)) | ((ObjectKind::Dpni, ni), (ObjectKind::Dpmac, mac)) => {
                        (mac, ni)
                    }
                    _ => return Err(McStatus::UnsupportedOp),
                };
                if !self.mc.dpmacs.contains_key(&dpmac_id) || !self.mc.dpnis.contains_key(&dpni_id) {
                    return Err(McStatus::NoResource);
                }
                if self.mc.connections.iter().any(|(mac, ni)| *mac == dpmac_id || *ni == dpni_id) {
                    return Err(McStatus::Busy);
                }
                self.mc.connections.push((dpmac_id, dpni_id));
            }
            dprc::CMDID_DISCONNECT => {
                self.container_of_token(token)?;
                let (kind, id) = endpoint(command, dprc::fields::EP1_ID, dprc::fields::EP1_TYPE_WORD);
                let before = self.mc.connections.len();
                self.mc.connections.retain(|(mac, ni)| match kind {
                    ObjectKind::Dpmac => *mac != id,
                    ObjectKind::Dpni => *ni != id,
                    _ => true,
                });
                if self.mc.connections.len() == before {
                    return Err(McStatus::NoResource);
                }
            }
            dpbp::CMDID_CREATE => {
                let container = self.container_of_token(token)?;
                let id = self.new_id();
                let bpid = self.mc.next_bpid;
                self.mc.next_bpid += 1;
                self.mc.dpbps.insert(id, SimDpbp { container, bpid, enabled: false });
                self.qbman.pools.insert(bpid, VecDeque::new());
                object::OBJECT_ID.set(&mut response, u64::from(id));
            }
            dpbp::CMDID_DESTROY => {
                let id = self.destroy(ObjectKind::Dpbp, command)?;
                if let Some(dpbp) = self.mc.dpbps.remove(&id) {
                    self.qbman.pools.remove(&dpbp.bpid);
                }
            }
            dpio::CMDID_CREATE => {
                let container = self.container_of_token(token)?;
                let id = self.new_id();
                let portal = self.qbman.free_portal_index();
                self.qbman.portals.insert(portal, SimPortal::new());
                self.mc.dpios.insert(
                    id,
                    SimDpio {
                        container,
                        portal,
                        num_priorities: dpio::fields::CREATE_NUM_PRIORITIES.get(command) as u8,
                        channel_mode: dpio::fields::CREATE_CHANNEL_MODE.get(command),
                        enabled: false,
                    },
                );
                object::OBJECT_ID.set(&mut response, u64::from(id));
            }
            dpio::CMDID_DESTROY => {
                let id = self.destroy(ObjectKind::Dpio, command)?;
                if let Some(dpio) = self.mc.dpios.remove(&id) {
                    self.qbman.portals.remove(&dpio.portal);
                }
            }
            dpni::CMDID_CREATE => {
                let container = self.container_of_token(token)?;
                let iova = dpni::fields::CREATE_EXT_CFG_IOVA.get(command);
                if iova == 0 {
                    return Err(McStatus::ConfigError);
                }
                let clean = !lines(iova, dpni::EXT_CFG_SIZE).any(|line| self.dirty.contains(&line));
                let block = self.dma_read(iova, dpni::EXT_CFG_SIZE);
                if !clean {
                    return Err(McStatus::DmaError);
                }
                let mut raw = [0u8; dpni::EXT_CFG_SIZE];
                raw.copy_from_slice(&block);
                if ExtendedConfig::parse(&raw).max_dist[0] == 0 {
                    return Err(McStatus::ConfigError);
                }

                let id = self.new_id();
                let rx_fqid = self.new_fqid();
                let tx_conf_fqid = self.new_fqid();
                let qdid = self.new_fqid();
                self.qbman.frame_queues.remove(&qdid);
                self.qbman.routes.insert(qdid, Route::Dpni(id));
                self.mc.dpnis.insert(
                    id,
                    SimDpni {
                        container,
                        enabled: false,
                        bpid: None,
                        filters: Vec::new(),
                        layouts: 0,
                        rx_fqid,
                        tx_conf_fqid,
                        qdid,
                    },
                );
                object::OBJECT_ID.set(&mut response, u64::from(id));
            }
            dpni::CMDID_DESTROY => {
                let id = self.destroy(ObjectKind::Dpni, command)?;
                if self.mc.connections.iter().any(|(_, ni)| *ni == id) {
                    return Err(McStatus::Busy);
                }
                if let Some(dpni) = self.mc.dpnis.remove(&id) {
                    self.qbman.frame_queues.remove(&dpni.rx_fqid);
                    self.qbman.frame_queues.remove(&dpni.tx_conf_fqid);
                    self.qbman.routes.remove(&dpni.qdid);
                }
            }
            dpmac::CMDID_CREATE => {
                let container = self.container_of_token(token)?;
                let id = dpmac::fields::CREATE_MAC_ID.get(command) as u32;
                if id == 0 || self.mc.dpmacs.contains_key(&id) {
                    return Err(McStatus::NoResource);
                }
                self.mc.dpmacs.insert(id, SimDpmac { container, link_up: false });
                object::OBJECT_ID.set(&mut response, u64::from(id));
            }
            dpmac::CMDID_DESTROY => {
                let id = self.destroy(ObjectKind::Dpmac, command)?;
                if self.mc.connections.iter().any(|(mac, _)| *mac == id) {
                    return Err(McStatus::Busy);
                }
                self.mc.dpmacs.remove(&id);
            }
            dpmac::CMDID_SET_LINK_STATE => {
                let id = self.target(token, ObjectKind::Dpmac)?;
                let up = dpmac::fields::LINK_UP.get(command) != 0;
                if let Some(dpmac) = self.mc.dpmacs.get_mut(&id) {
                    dpmac.link_up = up;
                }
            }
            object::CMDID_ENABLE | object::CMDID_DISABLE | object::CMDID_RESET => {
                let enabled = cmd_id == object::CMDID_ENABLE;
                match self.token_target(token)? {
                    (ObjectKind::Dpbp, id) => self.mc.dpbps.get_mut(&id).ok_or(McStatus::NoResource)?.enabled = enabled,
                    (ObjectKind::Dpio, id) => self.mc.dpios.get_mut(&id).ok_or(McStatus::NoResource)?.enabled = enabled,
                    (ObjectKind::Dpni, id) => self.mc.dpnis.get_mut(&id).ok_or(McStatus::NoResource)?.enabled = enabled,
                    _ => return Err(McStatus::UnsupportedOp),
                }
            }
            object::CMDID_GET_ATTR => match self.token_target(token)? {
                (ObjectKind::Dpbp, id) => {
                    let dpbp = self.mc.dpbps.get(&id).ok_or(McStatus::NoResource)?;
                    dpbp::fields::ATTR_ID.set(&mut response, u64::from(id));
                    dpbp::fields::ATTR_BPID.set(&mut response, u64::from(dpbp.bpid));
                }
                (ObjectKind::Dpio, id) => {
                    let dpio_object = self.mc.dpios.get(&id).ok_or(McStatus::NoResource)?;
                    let offset = u64::from(dpio_object.portal) * QBMAN_PORTAL_STRIDE;
                    dpio::fields::ATTR_ID.set(&mut response, u64::from(id));
                    dpio::fields::ATTR_PORTAL_ID.set(&mut response, u64::from(dpio_object.portal));
                    dpio::fields::ATTR_NUM_PRIORITIES.set(&mut response, u64::from(dpio_object.num_priorities));
                    dpio::fields::ATTR_CHANNEL_MODE.set(&mut response, dpio_object.channel_mode);
                    dpio::fields::ATTR_CE_OFFSET.set(&mut response, offset);
                    dpio::fields::ATTR_CI_OFFSET.set(&mut response, QBMAN_CINH_OFFSET + offset);
                    dpio::fields::ATTR_QBMAN_VERSION.set(&mut response, u64::from(QBMAN_VERSION));
                }
                (ObjectKind::Dpni, id) => {
                    dpni::fields::ATTR_ID.set(&mut response, u64::from(id));
                    dpni::fields::ATTR_MAX_TCS.set(&mut response, 1);
                }
                _ => return Err(McStatus::UnsupportedOp),
            },
            dpni::CMDID_SET_POOLS => {
                let id = self.target(token, ObjectKind::Dpni)?;
                let dpbp_id = command.get(1, dpni::fields::POOL_DPBP_ID_OFFSET, 32) as u32;
                let bpid = self.mc.dpbps.get(&dpbp_id).map(|dpbp| dpbp.bpid).ok_or(McStatus::ConfigError)?;
                self.dpni_mut(id)?.bpid = Some(bpid);
            }
            dpni::CMDID_SET_RX_BUFFER_LAYOUT | dpni::CMDID_SET_TX_BUFFER_LAYOUT | dpni::CMDID_SET_TX_CONF_BUFFER_LAYOUT => {
                let id = self.target(token, ObjectKind::Dpni)?;
                self.dpni_mut(id)?.layouts += 1;
            }
            dpni::CMDID_GET_QDID => {
                let id = self.target(token, ObjectKind::Dpni)?;
                let qdid = self.dpni_mut(id)?.qdid;
                dpni::fields::RSP_U16.set(&mut response, u64::from(qdid));
            }
            dpni::CMDID_GET_TX_DATA_OFFSET => {
                self.target(token, ObjectKind::Dpni)?;
                dpni::fields::RSP_U16.set(&mut response, DPNI_TX_DATA_OFFSET);
            }
            dpni::CMDID_GET_MTU => {
                self.target(token, ObjectKind::Dpni)?;
                dpni::fields::RSP_U16.set(&mut response, DPNI_MTU);
            }
            dpni::CMDID_ADD_MAC_ADDR => {
                let id = self.target(token, ObjectKind::Dpni)?;
                let mac = unpack_mac(command.params[0], dpni::fields::MAC_ADDR_OFFSET);
                let dpni_object = self.dpni_mut(id)?;
                if !dpni_object.filters.contains(&mac) {
                    dpni_object.filters.push(mac);
                }
            }
            dpni::CMDID_GET_RX_FLOW => {
                let id = self.target(token, ObjectKind::Dpni)?;
                let rx_fqid = self.dpni_mut(id)?.rx_fqid;
                dpni::fields::RX_FLOW_FQID.set(&mut response, u64::from(rx_fqid));
            }
            dpni::CMDID_SET_TX_FLOW => {
                self.target(token, ObjectKind::Dpni)?;
                dpni::fields::FLOW_ID.set(&mut response, 0);
            }
            dpni::CMDID_GET_TX_FLOW => {
                let id = self.target(token, ObjectKind::Dpni)?;
                if dpni::fields::FLOW_ID.get(command) != 0 {
                    return Err(McStatus::NoResource);
                }
                let tx_conf_fqid = self.dpni_mut(id)?.tx_conf_fqid;
                dpni::fields::TX_FLOW_CONF_FQID.set(&mut response, u64::from(tx_conf_fqid));
            }
            _ => return Err(McStatus::UnsupportedOp),
        }
        Ok(response)
    }

    fn target(&self, token: u16, kind: ObjectKind) -> Result<u32, McStatus> {
        match self.token_target(token)? {
            (found, id) if found == kind => Ok(id),
            _ => Err(McStatus::InvalidState),
        }
    }

    fn dpni_mut(&mut self, id: u32) -> Result<&mut SimDpni, McStatus> {
        self.mc.dpnis.get_mut(&id).ok_or(McStatus::NoResource)
    }

    // QBMan portals.

    fn portal_verb_written(&mut self, index: u32, offset: u64) {
        let Some(portal) = self.qbman.portals.get_mut(&index) else {
            return;
        };
        let line = portal.line(offset);
        match offset {
            0x000..=0x1FF => self.enqueue(&line),
            0x400..=0x5FF => self.release(&line),
            CENA_CR => {
                // Stale results must not be mistaken for the answer to this command.
                let valid_bit = (line[0] as u8) & VALID_BIT;
                portal.store_line(cena_rr(valid_bit), &[0; CACHELINE_WORDS]);
                self.qbman.pending.push_back(PendingWork::Command { portal: index, line });
            }
            CENA_VDQCR => self.qbman.pending.push_back(PendingWork::Pull { portal: index, line }),
            _ => {}
        }
    }

    fn management_command(&mut self, index: u32, command: &CacheLine) {
        let verb = (command[0] as u8) & !VALID_BIT;
        let valid_bit = (command[0] as u8) & VALID_BIT;
        let mut result = [0u32; CACHELINE_WORDS];
        generic::VERB.encode(&mut result, u32::from(verb));
        result[0] |= u32::from(valid_bit);

        if verb == QBMAN_MC_ACQUIRE {
            let bpid = acquire::BPID.decode(command) as u16;
            let requested = (acquire::NUM.decode(command) as usize).min(MAX_BUFFERS_PER_COMMAND);
            match self.qbman.pools.get_mut(&bpid) {
                Some(pool) => {
                    let count = requested.min(pool.len());
                    for (slot, buffer) in pool.drain(..count).enumerate() {
                        encode_u64(&mut result, acquire::BUFFERS_WORD + 2 * slot, buffer);
                    }
                    generic::RSLT.encode(&mut result, u32::from(QBMAN_MC_RSLT_OK));
                    acquire::NUM.encode(&mut result, count as u32);
                }
                None => generic::RSLT.encode(&mut result, 0xF2),
            }
        } else {
            generic::RSLT.encode(&mut result, u32::from(QBMAN_MC_RSLT_OK));
        }

        if let Some(portal) = self.qbman.portals.get_mut(&index) {
            portal.store_line(cena_rr(valid_bit), &result);
        }
    }

    fn release(&mut self, line: &CacheLine) {
        let bpid = release::BPID.decode(line) as u16;
        let count = (release::NUM.decode(line) as usize).min(MAX_BUFFERS_PER_COMMAND);
        let pool = self.qbman.pools.entry(bpid).or_default();
        for slot in 0..count {
            pool.push_back(decode_u64(line, release::BUFFERS_WORD + 2 * slot));
        }
    }

    fn enqueue(&mut self, line: &CacheLine) {
        let qdid = enqueue::TGT_ID.decode(line);
        let fd = FrameDescriptor::load(line, enqueue::FD_WORD);
        match self.qbman.routes.get(&qdid).copied() {
            Some(Route::FrameQueue(fqid)) => self.qbman.frame_queues.entry(fqid).or_default().push_back(fd),
            Some(Route::Dpni(dpni_id)) => self.dpni_transmit(dpni_id, &fd),
            None => {}
        }
    }

    fn dpni_transmit(&mut self, dpni_id: u32, fd: &FrameDescriptor) {
        let frame = self.dma_read(fd.addr + u64::from(fd.offset()), fd.len as usize);
        let Some(dpni_object) = self.mc.dpnis.get(&dpni_id) else {
            return;
        };
        let (enabled, bpid, rx_fqid, tx_conf_fqid) =
            (dpni_object.enabled, dpni_object.bpid, dpni_object.rx_fqid, dpni_object.tx_conf_fqid);
        let accepted = frame.len() >= 6 && dpni_object.filters.iter().any(|mac| frame[..6] == mac[..]);
        self.qbman.frame_queues.entry(tx_conf_fqid).or_default().push_back(*fd);

        let link_up = self
            .mc
            .connections
            .iter()
            .filter(|(_, ni)| *ni == dpni_id)
            .any(|(mac, _)| self.mc.dpmacs.get(mac).is_some_and(|dpmac| dpmac.link_up));
        if !enabled || !link_up || !accepted {
            return;
        }
        let Some(bpid) = bpid else {
            return;
        };
        let Some(buffer) = self.qbman.pools.get_mut(&bpid).and_then(VecDeque::pop_front) else {
            return;
        };

        self.memory.write(buffer + u64::from(DPNI_RX_DATA_OFFSET), &frame);
        let status = self.qbman.rx_annotation_status;
        self.memory.write(buffer + DPNI_RX_ANNOTATION + 4, &status.to_le_bytes());
        let rx = FrameDescriptor::single(buffer, frame.len() as u32, bpid, DPNI_RX_DATA_OFFSET);
        self.qbman.frame_queues.entry(rx_fqid).or_default().push_back(rx);
    }

    fn volatile_dequeue(&mut self, index: u32, command: &CacheLine) {
        let fqid = pull::DQSOURCE.decode(command);
        let requested = pull::NUMFRAMES.decode(command) + 1;
        let token = pull::TOKEN.decode(command);

        let mut entries = Vec::new();
        if std::mem::take(&mut self.qbman.corrupt_next_dequeue) {
            entries.push((STAT_VOLATILE | STAT_EXPIRED, None));
        } else {
            let queue = self.qbman.frame_queues.entry(fqid).or_default();
            for _ in 0..requested {
                let Some(fd) = queue.pop_front() else {
                    break;
                };
                entries.push((STAT_VALIDFRAME | STAT_VOLATILE, Some(fd)));
            }
            let empty = queue.is_empty();
            match entries.last_mut() {
                Some((stat, _)) => {
                    *stat |= STAT_EXPIRED;
                    if empty {
                        *stat |= STAT_FQEMPTY;
                    }
                }
                None => entries.push((STAT_FQEMPTY | STAT_VOLATILE | STAT_EXPIRED, None)),
            }
        }

        let Some(portal) = self.qbman.portals.get_mut(&index) else {
            return;
        };
        let remaining = self.qbman.frame_queues.get(&fqid).map_or(0, VecDeque::len);
        for (stat, fd) in entries {
            let mut line = [0u32; CACHELINE_WORDS];
            dqrr::VERB.encode(&mut line, u32::from(RESULT_DQ));
            dqrr::STAT.encode(&mut line, u32::from(stat));
            dqrr::FQID.encode(&mut line, fqid);
            dqrr::FRAME_COUNT.encode(&mut line, remaining as u32);
            dqrr::TOKEN.encode(&mut line, token);
            if let Some(fd) = fd {
                fd.store(&mut line, dqrr::FD_WORD);
            }
            portal.push_dqrr(line);
        }
    }
}

fn respond(cmd_id: u16, token: u16) -> McCommand {
    let mut response = McCommand::new(cmd_id, 0, token);
    response.set_status(McStatus::Ok as u8);
    response
}

fn endpoint(command: &McCommand, id: crate::mc::command::McField, type_word: usize) -> (ObjectKind, u32) {
    let (name, length) = unpack_name([command.params[type_word], command.params[type_word + 1]]);
    let kind = match &name[..length] {
        b"dpni" => ObjectKind::Dpni,
        b"dpmac" => ObjectKind::Dpmac,
        b"dpbp" => ObjectKind::Dpbp,
        b"dpio" => ObjectKind::Dpio,
        _ => ObjectKind::Dprc,
    };
    (kind, id.get(command) as u32)
}

impl Hal for SimHal {
    fn read32(&self, address: u64) -> u32 {
        self.state.borrow_mut().read32(address)
    }

    fn write32(&self, address: u64, value: u32) {
        self.state.borrow_mut().write32(address, value);
    }

    fn read64(&self, address: u64) -> u64 {
        self.state.borrow().memory.read_u64(address)
    }

    fn write64(&self, address: u64, value: u64) {
        self.state.borrow_mut().write64(address, value);
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) {
        self.state.borrow().memory.read(address, buffer);
    }

    fn write_bytes(&self, address: u64, data: &[u8]) {
        let mut state = self.state.borrow_mut();
        state.memory.write(address, data);
        state.dirty.extend(lines(address, data.len()));
    }

    fn data_memory_barrier(&self) {}

    fn clean_dcache_range(&self, address: u64, length: usize) {
        let mut state = self.state.borrow_mut();
        if !state.ignore_cache_maintenance {
            for line in lines(address, length) {
                state.dirty.remove(&line);
            }
        }
    }

    fn stall(&self, micros: u64) {
        self.state.borrow_mut().stall(micros);
    }

    fn allocate_pages(&self, size: u64, alignment: u64) -> Option<u64> {
        self.state.borrow_mut().allocate(size, alignment)
    }

    fn free_pages(&self, address: u64, size: u64) {
        self.state.borrow_mut().free(address, size);
    }
}

//! MC boot sequencer and the booted Management Complex handle.
//!
//! [`McBootSequencer::boot`] reserves the MC private DRAM block, loads the firmware and the fixed-up
//! DPC into it, programs the MC CCSR block, releases the MC cores and waits for the firmware to
//! report completion. It then checks the firmware version and opens the root container. The result
//! is a [`ManagementComplex`]: holding one proves the MC booted, and every object factory call
//! borrows it.
//!
//! Boot either completes or leaves the cores in reset with the private DRAM released. The DPL is
//! deployed separately with [`ManagementComplex::deploy_dpl`].
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{string::String, vec, vec::Vec};

use r_efi::efi;
use spin::Mutex;

use super::{
    dprc,
    fixup::{fixup_dpc, fixup_dpl, fixup_iommu_map, resolve_mac, GeneratedMacAddress, MacAddressSource},
    io::McIo,
    log::{McLog, MC_LOG_TAIL_LINES},
    version::{get_version, McVersion},
};
use crate::{
    config::{FlashImage, PlatformConfig, PrivateMemoryConfig},
    error::{status_name, Result},
    fdt::{Fdt, FdtHeader, FDT_HEADER_SIZE},
    fit,
    hal::{poll_with_timeout, Hal},
};

/// CCSR register offsets.
pub const MC_GCR1: u64 = 0x00;
pub const MC_GSR: u64 = 0x08;
pub const MC_MCFBALR: u64 = 0x20;
pub const MC_MCFBAHR: u64 = 0x24;
pub const MC_MCFAPR: u64 = 0x28;

/// GCR1 reset release bits for core 0 and the two command portal managers.
pub const GCR1_P1_DE_RST: u32 = 1 << 30;
pub const GCR1_M1_DE_RST: u32 = 1 << 15;
pub const GCR1_M2_DE_RST: u32 = 1 << 14;
pub const GCR1_RELEASE: u32 = GCR1_P1_DE_RST | GCR1_M1_DE_RST | GCR1_M2_DE_RST;

/// Firmware status field of GSR; bit 0 set means the firmware finished its current phase.
pub const GSR_FS_MASK: u32 = 0x3FFF_FFFF;
/// Written to GSR before core release to hold DPL processing until [`ManagementComplex::deploy_dpl`].
pub const GSR_DELAYED_DPL: u32 = 0xDD00;

/// The private DRAM block is described to the MC in 256 MiB units.
pub const MC_DRAM_BLOCK_GRANULE: u64 = 0x1000_0000;
const MCFBALR_BASE_MASK: u32 = 0xE000_0000;
const MCFBALR_SIZE_MASK: u32 = 0x0000_000F;
/// Bypass ICID checks for MC-initiated DMA into its own block.
pub const MCFAPR_BYPASS_ICID: u32 = 0x0000_8000;

/// GSR poll interval.
pub const MC_BOOT_POLL_INTERVAL_US: u64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PrivateDram {
    base: u64,
    size: u64,
    /// Allocated at boot, so released on failure.
    owned: bool,
}

impl PrivateDram {
    fn validate(config: &PrivateMemoryConfig) -> Result<()> {
        let size = config.size();
        if size == 0 || size % MC_DRAM_BLOCK_GRANULE != 0 || size / MC_DRAM_BLOCK_GRANULE > 16 {
            log::error!(target: "mc", "MC private DRAM size {:#x} is not 1 to 16 blocks of 256 MiB", size);
            return Err(efi::Status::INVALID_PARAMETER);
        }
        let alignment = match *config {
            PrivateMemoryConfig::Allocate { alignment, .. } => alignment,
            PrivateMemoryConfig::Static { base, .. } => base,
        };
        if alignment % MC_DRAM_BLOCK_GRANULE != 0 {
            log::error!(target: "mc", "MC private DRAM must be 256 MiB aligned ({:#x})", alignment);
            return Err(efi::Status::INVALID_PARAMETER);
        }
        Ok(())
    }

    fn reserve<H: Hal>(hal: &H, config: &PrivateMemoryConfig) -> Result<Self> {
        match *config {
            PrivateMemoryConfig::Allocate { size, alignment } => match hal.allocate_pages(size, alignment) {
                Some(base) => Ok(Self { base, size, owned: true }),
                None => {
                    log::error!(target: "mc", "cannot allocate {:#x} bytes of MC private DRAM", size);
                    Err(efi::Status::OUT_OF_RESOURCES)
                }
            },
            PrivateMemoryConfig::Static { base, size } => Ok(Self { base, size, owned: false }),
        }
    }

    fn release<H: Hal>(&self, hal: &H) {
        if self.owned {
            hal.free_pages(self.base, self.size);
        }
    }
}

/// Checks a private DRAM policy against the MC's block size and alignment rules without touching
/// any memory.
pub fn check_private_memory(config: &PrivateMemoryConfig) -> Result<()> {
    PrivateDram::validate(config)
}

/// Configures and runs one MC boot.
pub struct McBootSequencer<'a, H: Hal> {
    hal: &'a H,
    config: PlatformConfig,
    mac_source: Option<&'a dyn MacAddressSource>,
    system_fdt: Option<&'a mut Fdt>,
}

impl<'a, H: Hal> McBootSequencer<'a, H> {
    pub fn new(hal: &'a H, config: PlatformConfig) -> Self {
        Self { hal, config, mac_source: None, system_fdt: None }
    }

    /// Source of per-port MAC addresses; ports it has no address for get a generated one.
    pub fn with_mac_source(mut self, source: &'a dyn MacAddressSource) -> Self {
        self.mac_source = Some(source);
        self
    }

    /// OS device tree to receive the `iommu-map` fixup once the MC is up.
    pub fn with_system_fdt(mut self, fdt: &'a mut Fdt) -> Self {
        self.system_fdt = Some(fdt);
        self
    }

    /// Boots the MC.
    ///
    /// On failure the MC cores are held in reset and private DRAM allocated here is freed before
    /// the error is returned.
    pub fn boot(self) -> Result<ManagementComplex<'a, H>> {
        PrivateDram::validate(&self.config.private_memory)?;
        let dram = PrivateDram::reserve(self.hal, &self.config.private_memory)?;
        log::info!(target: "mc", "MC private DRAM at {:#x}, {} MiB", dram.base, dram.size >> 20);

        let hal = self.hal;
        let ccsr = self.config.mc_ccsr_base;
        match self.boot_in(dram) {
            Ok(mc) => Ok(mc),
            Err(status) => {
                hal.write32(ccsr + MC_GCR1, 0);
                hal.data_memory_barrier();
                dram.release(hal);
                log::error!(target: "mc", "MC boot failed: {}, cores held in reset", status_name(status));
                Err(status)
            }
        }
    }

    fn boot_in(self, dram: PrivateDram) -> Result<ManagementComplex<'a, H>> {
        let McBootSequencer { hal, config, mac_source, system_fdt } = self;
        let ccsr = config.mc_ccsr_base;

        hal.write32(ccsr + MC_GCR1, 0);
        hal.data_memory_barrier();

        let firmware_length = load_firmware(hal, &config, dram)?;
        log::debug!(target: "mc", "MC firmware loaded, {} bytes", firmware_length);

        let generator = GeneratedMacAddress::new(config.mac_seed);
        let mac_for = |dpmac_id: u32| resolve_mac(mac_source, &generator, dpmac_id);
        let mut dpc = Fdt::from_bytes(&load_blob(hal, &config.dpc_image, "dpc")?)?;
        fixup_dpc(&mut dpc, &config, &mac_for)?;
        place_blob(hal, &dpc, dram, config.dpc_dram_offset, config.dpc_image.max_length, "DPC")?;

        let low = dram.base as u32;
        let blocks = (dram.size / MC_DRAM_BLOCK_GRANULE) as u32;
        hal.write32(ccsr + MC_MCFBALR, (low & MCFBALR_BASE_MASK) | ((blocks - 1) & MCFBALR_SIZE_MASK));
        hal.write32(ccsr + MC_MCFBAHR, (dram.base >> 32) as u32);
        hal.write32(ccsr + MC_MCFAPR, MCFAPR_BYPASS_ICID);
        hal.write32(ccsr + MC_GSR, GSR_DELAYED_DPL);
        hal.data_memory_barrier();

        hal.write32(ccsr + MC_GCR1, GCR1_RELEASE);
        hal.data_memory_barrier();
        log::debug!(target: "mc", "MC cores released");

        wait_for_firmware(hal, ccsr, config.boot_timeout_ms, "boot")?;
        let log = McLog::locate(hal, dram.base, dram.size, config.log_header_offset);

        let root_io = McIo::new(hal, config.mc_portal_address(0), log);
        let version = get_version(&root_io)?;
        if version < config.min_firmware_version {
            log::error!(
                target: "mc",
                "MC firmware {} is older than the minimum supported {}",
                version,
                config.min_firmware_version
            );
            return Err(efi::Status::DEVICE_ERROR);
        }
        log::info!(target: "mc", "MC firmware {} running", version);

        let root_container_id = dprc::get_container_id(&root_io).map_err(|_| efi::Status::DEVICE_ERROR)?;
        let root_token = dprc::open(&root_io, root_container_id).map_err(|_| efi::Status::DEVICE_ERROR)?;
        log::debug!(target: "mc", "root container {} opened, token {:#x}", root_container_id, root_token);

        if let Some(system) = system_fdt {
            fixup_iommu_map(system, config.stream_id_start, config.stream_id_count);
        }

        Ok(ManagementComplex {
            hal,
            config,
            dram,
            log,
            log_cursor: Mutex::new(0),
            root_io,
            root_container_id,
            root_token,
            version,
            dpl_deployed: false,
            mac_source,
        })
    }
}

/// A booted Management Complex.
pub struct ManagementComplex<'a, H: Hal> {
    hal: &'a H,
    config: PlatformConfig,
    dram: PrivateDram,
    log: Option<McLog>,
    log_cursor: Mutex<u32>,
    root_io: McIo<'a, H>,
    root_container_id: u32,
    root_token: u16,
    version: McVersion,
    dpl_deployed: bool,
    mac_source: Option<&'a dyn MacAddressSource>,
}

impl<'a, H: Hal> ManagementComplex<'a, H> {
    pub fn hal(&self) -> &'a H {
        self.hal
    }

    pub fn config(&self) -> &PlatformConfig {
        &self.config
    }

    /// Always true: a handle only exists once boot completed.
    pub fn is_booted(&self) -> bool {
        true
    }

    pub fn is_dpl_deployed(&self) -> bool {
        self.dpl_deployed
    }

    pub fn version(&self) -> McVersion {
        self.version
    }

    pub fn dram_base(&self) -> u64 {
        self.dram.base
    }

    pub fn dram_size(&self) -> u64 {
        self.dram.size
    }

    /// Command channel of the root container.
    pub fn root_io(&self) -> &McIo<'a, H> {
        &self.root_io
    }

    pub fn root_container_id(&self) -> u32 {
        self.root_container_id
    }

    pub fn root_token(&self) -> u16 {
        self.root_token
    }

    pub fn log(&self) -> Option<McLog> {
        self.log
    }

    /// Station address of DPMAC `dpmac_id`, resolved the same way as the DPC/DPL fixups.
    pub fn mac_address(&self, dpmac_id: u32) -> [u8; 6] {
        resolve_mac(self.mac_source, &GeneratedMacAddress::new(self.config.mac_seed), dpmac_id)
    }

    /// Lines the firmware logged since the previous call.
    pub fn new_log_lines(&self) -> Vec<String> {
        match &self.log {
            Some(log) => log.read_new(self.hal, &mut self.log_cursor.lock()),
            None => vec![],
        }
    }

    /// Emits the firmware's new log lines at info level.
    pub fn dump_log(&self) {
        for line in self.new_log_lines() {
            log::info!(target: "mc_fw", "{}", line);
        }
    }

    /// Loads, fixes up and deploys the DPL, then waits for the firmware to apply it.
    ///
    /// Returns `ALREADY_STARTED` if the DPL was deployed before.
    pub fn deploy_dpl(&mut self) -> Result<()> {
        if self.dpl_deployed {
            log::error!(target: "mc", "DPL already deployed");
            return Err(efi::Status::ALREADY_STARTED);
        }

        let generator = GeneratedMacAddress::new(self.config.mac_seed);
        let mac_source = self.mac_source;
        let mac_for = |dpmac_id: u32| resolve_mac(mac_source, &generator, dpmac_id);
        let mut dpl = Fdt::from_bytes(&load_blob(self.hal, &self.config.dpl_image, "dpl")?)?;
        fixup_dpl(&mut dpl, &self.config, &mac_for)?;
        place_blob(self.hal, &dpl, self.dram, self.config.dpl_dram_offset, self.config.dpl_image.max_length, "DPL")?;

        let ccsr = self.config.mc_ccsr_base;
        self.hal.write32(ccsr + MC_GSR, 0);
        self.hal.data_memory_barrier();
        if let Err(status) = wait_for_firmware(self.hal, ccsr, self.config.dpl_timeout_ms, "DPL deployment") {
            if let Some(log) = &self.log {
                log.dump_tail(self.hal, MC_LOG_TAIL_LINES);
            }
            return Err(status);
        }

        self.dpl_deployed = true;
        log::info!(target: "mc", "DPL deployed");
        Ok(())
    }
}

/// Polls GSR until the firmware sets status bit 0. A status other than exactly 1 is reported but
/// accepted.
fn wait_for_firmware<H: Hal>(hal: &H, ccsr: u64, timeout_ms: u32, phase: &str) -> Result<u32> {
    let status = poll_with_timeout(hal, MC_BOOT_POLL_INTERVAL_US, u64::from(timeout_ms) * 1000, || {
        let status = hal.read32(ccsr + MC_GSR) & GSR_FS_MASK;
        (status & 0x1 != 0).then_some(status)
    });

    match status {
        None => {
            log::error!(target: "mc", "MC firmware {} did not complete within {} ms", phase, timeout_ms);
            Err(efi::Status::TIMEOUT)
        }
        Some(status) => {
            if status != 0x1 {
                log::warn!(target: "mc", "MC firmware {} completed with status {:#x}", phase, status);
            }
            Ok(status)
        }
    }
}

/// Reads a whole FDT-formatted image out of flash after checking its header against the image
/// limit.
fn read_flash_fdt<H: Hal>(hal: &H, image: &FlashImage) -> Result<Vec<u8>> {
    let mut header = [0u8; FDT_HEADER_SIZE];
    hal.read_bytes(image.address, &mut header);
    let header = FdtHeader::parse(&header).map_err(|err| {
        log::error!(target: "mc", "image at {:#x}: {}", image.address, err);
        efi::Status::from(err)
    })?;
    if u64::from(header.total_size) > image.max_length {
        log::error!(
            target: "mc",
            "image at {:#x} is {} bytes, limit {}",
            image.address,
            header.total_size,
            image.max_length
        );
        return Err(efi::Status::INVALID_PARAMETER);
    }

    let mut blob = vec![0u8; header.total_size as usize];
    hal.read_bytes(image.address, &mut blob);
    Ok(blob)
}

/// Copies the `firmware` sub-image of the flash FIT to the start of the private DRAM.
///
/// The payload must end before the DPC, DPL and log header slots placed behind it.
fn load_firmware<H: Hal>(hal: &H, config: &PlatformConfig, dram: PrivateDram) -> Result<usize> {
    let blob = read_flash_fdt(hal, &config.firmware_image)?;
    let firmware = fit::extract_image(&blob, "firmware").map_err(|err| {
        log::error!(target: "mc", "MC firmware image: {}", err);
        efi::Status::from(err)
    })?;
    if firmware.len() as u64 > dram.size {
        return Err(efi::Status::OUT_OF_RESOURCES);
    }
    let limit = config.dpc_dram_offset.min(config.dpl_dram_offset).min(config.log_header_offset);
    if firmware.len() as u64 > limit {
        log::error!(
            target: "mc",
            "MC firmware is {} bytes and overlaps the blobs placed at offset {:#x}",
            firmware.len(),
            limit
        );
        return Err(efi::Status::INVALID_PARAMETER);
    }
    hal.write_bytes(dram.base, &firmware);
    hal.clean_dcache_range(dram.base, firmware.len());
    Ok(firmware.len())
}

/// Reads a DPC or DPL from flash. The blob is either a raw FDT or a FIT with a `sub_image` entry.
fn load_blob<H: Hal>(hal: &H, image: &FlashImage, sub_image: &str) -> Result<Vec<u8>> {
    let blob = read_flash_fdt(hal, image)?;
    let tree = Fdt::from_bytes(&blob)?;
    if !fit::is_fit(&tree) {
        return Ok(blob);
    }
    fit::image_data(&tree, sub_image).map_err(|err| {
        log::error!(target: "mc", "{} image: {}", sub_image, err);
        efi::Status::from(err)
    })
}

/// Serializes `tree` into the private DRAM at `offset`.
fn place_blob<H: Hal>(hal: &H, tree: &Fdt, dram: PrivateDram, offset: u64, limit: u64, what: &str) -> Result<()> {
    let bytes = tree.to_bytes();
    if bytes.len() as u64 > limit || offset + bytes.len() as u64 > dram.size {
        log::error!(target: "mc", "fixed-up {} is {} bytes, limit {}", what, bytes.len(), limit);
        return Err(efi::Status::OUT_OF_RESOURCES);
    }
    let address = dram.base + offset;
    hal.write_bytes(address, &bytes);
    hal.clean_dcache_range(address, bytes.len());
    log::debug!(target: "mc", "{} placed at {:#x}, {} bytes", what, address, bytes.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mc::{command::McStatus, dprc, version::MC_CMDID_GET_VERSION},
        sim::{self, SimHal},
    };

    fn booted(hal: &SimHal) -> ManagementComplex<'_, SimHal> {
        McBootSequencer::new(hal, hal.config()).boot().unwrap()
    }

    fn assert_rolled_back(hal: &SimHal) {
        assert_eq!(hal.read32(hal.config().mc_ccsr_base + MC_GCR1), 0);
        assert_eq!(hal.live_allocations(), 0);
    }

    #[test]
    fn test_boot_and_deploy_dpl() {
        let hal = SimHal::with_images();
        let mut mc = booted(&hal);
        assert!(mc.is_booted());
        assert!(!mc.is_dpl_deployed());
        assert_eq!(mc.version(), sim::FIRMWARE_VERSION);
        assert!(mc.log().is_some());
        assert!(!hal.is_dirty(mc.dram_base(), sim::FIRMWARE_PAYLOAD.len()));

        let ccsr = hal.config().mc_ccsr_base;
        assert_eq!(hal.read32(ccsr + MC_GCR1), GCR1_RELEASE);
        assert_eq!(hal.read32(ccsr + MC_MCFBALR), 0x1);
        assert_eq!(hal.read32(ccsr + MC_MCFAPR), MCFAPR_BYPASS_ICID);

        let dpc = hal.booted_dpc().unwrap();
        let pool = dpc.node("/resources/icid_pools/icid_pool@0").unwrap();
        assert_eq!(pool.property_u32("base_icid"), Some(hal.config().icid_base));

        mc.deploy_dpl().unwrap();
        assert!(mc.is_dpl_deployed());
        let dpl = hal.deployed_dpl().unwrap();
        let mac = dpl.node("/objects/dpmac@1").unwrap().property_u32_cells("mac_addr").unwrap();
        assert_eq!(mac, mc.mac_address(1).map(u32::from).to_vec());

        assert_eq!(mc.deploy_dpl(), Err(efi::Status::ALREADY_STARTED));
        assert!(!mc.new_log_lines().is_empty());
        assert!(mc.new_log_lines().is_empty());
    }

    #[test]
    fn test_fit_wrapped_dpc_and_dpl() {
        let hal = SimHal::with_images();
        let config = hal.config();
        hal.write_flash(config.dpc_image.address, &fit::build_fit(&[("dpc", &sim::dpc_blob())]));
        hal.write_flash(config.dpl_image.address, &fit::build_fit(&[("dpl", &sim::dpl_blob())]));

        let mut mc = booted(&hal);
        mc.deploy_dpl().unwrap();
        assert!(hal.deployed_dpl().is_some());
    }

    #[test]
    fn test_firmware_timeout_rolls_back() {
        let hal = SimHal::with_images();
        hal.set_boot_hang(true);
        let start = hal.elapsed_us();
        let result = McBootSequencer::new(&hal, hal.config()).boot();
        assert_eq!(result.err(), Some(efi::Status::TIMEOUT));
        assert_eq!(hal.elapsed_us() - start, u64::from(hal.config().boot_timeout_ms) * 1000);
        assert_rolled_back(&hal);
    }

    #[test]
    fn test_failures_after_core_release_roll_back() {
        for cmd_id in [MC_CMDID_GET_VERSION, dprc::CMDID_GET_CONT_ID, dprc::CMDID_OPEN] {
            let hal = SimHal::with_images();
            hal.fail_next_command(cmd_id, McStatus::ConfigError);
            let result = McBootSequencer::new(&hal, hal.config()).boot();
            assert_eq!(result.err(), Some(efi::Status::DEVICE_ERROR), "command {:#x}", cmd_id);
            assert_rolled_back(&hal);
        }
    }

    #[test]
    fn test_old_firmware_is_rejected() {
        let hal = SimHal::with_images();
        hal.set_firmware_version(McVersion { major: 9, minor: 9, revision: 9 });
        let result = McBootSequencer::new(&hal, hal.config()).boot();
        assert_eq!(result.err(), Some(efi::Status::DEVICE_ERROR));
        assert_rolled_back(&hal);
    }

    #[test]
    fn test_unusual_boot_status_is_accepted() {
        let hal = SimHal::with_images();
        hal.set_boot_status(0x3);
        sim::capture_logs();
        assert!(McBootSequencer::new(&hal, hal.config()).boot().is_ok());
        assert_eq!(sim::captured_log_count("completed with status 0x3"), 1);
    }

    #[test]
    fn test_bad_firmware_fit_fails_before_release() {
        let hal = SimHal::with_images();
        let config = hal.config();
        hal.write_flash(config.firmware_image.address, &fit::build_fit(&[("kernel", b"not firmware")]));
        let result = McBootSequencer::new(&hal, config).boot();
        assert_eq!(result.err(), Some(efi::Status::NOT_FOUND));
        assert_rolled_back(&hal);
        assert!(!hal.mc_running());

        let hal = SimHal::with_images();
        hal.write_flash(hal.config().firmware_image.address, &[0u8; 64]);
        assert_eq!(McBootSequencer::new(&hal, hal.config()).boot().err(), Some(efi::Status::INVALID_PARAMETER));
        assert_rolled_back(&hal);
    }

    #[test]
    fn test_oversized_images() {
        let hal = SimHal::with_images();
        let mut config = hal.config();
        config.dpc_image.max_length = 64;
        assert_eq!(McBootSequencer::new(&hal, config).boot().err(), Some(efi::Status::INVALID_PARAMETER));
        assert_rolled_back(&hal);

        // A DPC that fits in flash but grows past the limit once fixed up.
        let hal = SimHal::with_images();
        let mut config = hal.config();
        config.dpc_image.max_length = sim::dpc_blob().len() as u64;
        assert_eq!(McBootSequencer::new(&hal, config).boot().err(), Some(efi::Status::OUT_OF_RESOURCES));
        assert_rolled_back(&hal);
    }

    #[test]
    fn test_firmware_overlapping_blobs_is_not_loaded() {
        let hal = SimHal::with_images();
        let mut config = hal.config();
        config.private_memory = PrivateMemoryConfig::Static { base: 0x90_0000_0000, size: 0x2000_0000 };
        config.dpc_dram_offset = 0x10;
        assert_eq!(McBootSequencer::new(&hal, config).boot().err(), Some(efi::Status::INVALID_PARAMETER));
        assert_rolled_back(&hal);
        assert!(!hal.mc_running());

        let mut head = [0u8; 16];
        hal.read_bytes(0x90_0000_0000, &mut head);
        assert_eq!(head, [0u8; 16]);
    }

    #[test]
    fn test_bad_private_memory_size_touches_nothing() {
        let hal = SimHal::with_images();
        let mut config = hal.config();
        config.private_memory = PrivateMemoryConfig::Allocate { size: 0x1800_0000, alignment: 0x2000_0000 };
        assert_eq!(McBootSequencer::new(&hal, config).boot().err(), Some(efi::Status::INVALID_PARAMETER));
        assert_eq!(hal.ccsr_writes(), 0);
    }

    #[test]
    fn test_allocation_failure() {
        let hal = SimHal::with_images();
        hal.set_allocation_limit(0);
        assert_eq!(McBootSequencer::new(&hal, hal.config()).boot().err(), Some(efi::Status::OUT_OF_RESOURCES));
        assert_eq!(hal.ccsr_writes(), 0);
    }

    #[test]
    fn test_static_memory_is_not_freed() {
        let hal = SimHal::with_images();
        let mut config = hal.config();
        config.private_memory = PrivateMemoryConfig::Static { base: 0x90_0000_0000, size: 0x2000_0000 };
        hal.set_boot_hang(true);
        assert_eq!(McBootSequencer::new(&hal, config.clone()).boot().err(), Some(efi::Status::TIMEOUT));
        assert_eq!(hal.freed_allocations(), 0);

        let hal = SimHal::with_images();
        let mc = McBootSequencer::new(&hal, config).boot().unwrap();
        assert_eq!(mc.dram_base(), 0x90_0000_0000);
        assert_eq!(hal.read32(hal.config().mc_ccsr_base + MC_MCFBAHR), 0x90);
    }

    #[test]
    fn test_iommu_map_fixup_and_mac_source() {
        struct Eeprom;
        impl MacAddressSource for Eeprom {
            fn mac_address(&self, dpmac_id: u32) -> Option<[u8; 6]> {
                (dpmac_id == 1).then_some([0x00, 0x04, 0x9F, 0x01, 0x02, 0x03])
            }
        }

        let hal = SimHal::with_images();
        let mut system = Fdt::default();
        system.root.add_subnode("fsl-mc").unwrap().set_property_u32_cells("iommu-map", &[0, 0x7, 0, 0]);

        let eeprom = Eeprom;
        let mc = McBootSequencer::new(&hal, hal.config()).with_mac_source(&eeprom).with_system_fdt(&mut system).boot().unwrap();
        assert_eq!(mc.mac_address(1), [0x00, 0x04, 0x9F, 0x01, 0x02, 0x03]);
        assert_eq!(mc.mac_address(2)[0], 0x02);
        let dpc = hal.booted_dpc().unwrap();
        assert_eq!(
            dpc.node("/board_info/ports/mac@1").unwrap().property("port_mac_address"),
            Some(&[0x00, 0x04, 0x9F, 0x01, 0x02, 0x03][..])
        );
        drop(mc);

        let config = hal.config();
        let cells = system.node("/fsl-mc").unwrap().property_u32_cells("iommu-map").unwrap();
        assert_eq!(cells, vec![config.stream_id_start, 0x7, config.stream_id_start, config.stream_id_count]);
    }

    #[test]
    fn test_dpl_timeout_keeps_mc_running() {
        let hal = SimHal::with_images();
        let mut mc = booted(&hal);
        hal.set_boot_hang(true);
        assert_eq!(mc.deploy_dpl(), Err(efi::Status::TIMEOUT));
        assert!(!mc.is_dpl_deployed());
        assert!(hal.mc_running());
    }
}

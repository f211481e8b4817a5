//! Platform configuration for the Management Complex and its datapath.
//!
//! These values are fixed per board. The defaults describe an LS2088A-class SoC booting the MC
//! from NOR flash.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use crate::mc::McVersion;

const SIZE_1MB: u64 = 0x10_0000;
const SIZE_512MB: u64 = 0x2000_0000;

/// Where the MC private DRAM block comes from.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum PrivateMemoryConfig {
    /// Allocate the block at boot; it is released again if boot fails.
    Allocate { size: u64, alignment: u64 },
    /// Use a region carved out of the memory map at build time; never released.
    Static { base: u64, size: u64 },
}

impl PrivateMemoryConfig {
    pub fn size(&self) -> u64 {
        match *self {
            PrivateMemoryConfig::Allocate { size, .. } => size,
            PrivateMemoryConfig::Static { size, .. } => size,
        }
    }
}

/// Verbosity the MC firmware logs into its DRAM buffer.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum McLogLevel {
    Debug,
    Info,
    Warning,
    Error,
    Critical,
}

impl McLogLevel {
    /// Value of the DPC `/mc_general/log` `level` property.
    pub fn dpc_name(&self) -> &'static str {
        match self {
            McLogLevel::Debug => "LOG_LEVEL_DEBUG",
            McLogLevel::Info => "LOG_LEVEL_INFO",
            McLogLevel::Warning => "LOG_LEVEL_WARNING",
            McLogLevel::Error => "LOG_LEVEL_ERROR",
            McLogLevel::Critical => "LOG_LEVEL_CRITICAL",
        }
    }
}

/// Location and size limit of one MC image in flash.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlashImage {
    pub address: u64,
    pub max_length: u64,
}

/// Board-level settings consumed by the boot sequencer and the network-interface factory.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(default)]
pub struct PlatformConfig {
    /// Base of the MC CCSR register block.
    pub mc_ccsr_base: u64,
    /// Base of the MC command portals.
    pub mc_portals_base: u64,
    /// Distance between two MC command portals.
    pub mc_portal_stride: u64,
    /// Base of the QBMan software portal window; DPIO attributes are offsets into it.
    pub qbman_portals_base: u64,
    pub private_memory: PrivateMemoryConfig,
    pub firmware_image: FlashImage,
    pub dpc_image: FlashImage,
    pub dpl_image: FlashImage,
    /// Offset of the DPC blob inside the private DRAM block.
    pub dpc_dram_offset: u64,
    /// Offset of the DPL blob inside the private DRAM block.
    pub dpl_dram_offset: u64,
    /// Offset of the MC log header inside the private DRAM block.
    pub log_header_offset: u64,
    pub boot_timeout_ms: u32,
    pub dpl_timeout_ms: u32,
    pub icid_base: u32,
    pub icid_count: u32,
    pub stream_id_start: u32,
    pub stream_id_count: u32,
    /// `None` disables MC logging entirely.
    pub mc_log_level: Option<McLogLevel>,
    pub min_firmware_version: McVersion,
    /// Number of DPMAC ports whose MAC address is fixed up in the DPC and DPL.
    pub dpmac_count: u32,
    /// Seed for locally administered MAC addresses when the EEPROM has none.
    pub mac_seed: u64,
    /// DPMAC ports brought up by the driver entry point.
    pub active_dpmacs: Vec<u32>,
    /// Maximum level of the driver's own log output.
    pub log_level: log::LevelFilter,
}

impl Default for PlatformConfig {
    fn default() -> Self {
        Self {
            mc_ccsr_base: 0x0834_0000,
            mc_portals_base: 0x08_0C00_0000,
            mc_portal_stride: 0x1_0000,
            qbman_portals_base: 0x08_1800_0000,
            private_memory: PrivateMemoryConfig::Allocate { size: SIZE_512MB, alignment: SIZE_512MB },
            firmware_image: FlashImage { address: 0x05_80A0_0000, max_length: 4 * SIZE_1MB },
            dpc_image: FlashImage { address: 0x05_80E0_0000, max_length: 0x2_0000 },
            dpl_image: FlashImage { address: 0x05_80D0_0000, max_length: 0x2_0000 },
            dpc_dram_offset: 0x00F0_0000,
            dpl_dram_offset: 0x00F2_0000,
            log_header_offset: 16 * SIZE_1MB,
            boot_timeout_ms: 5000,
            dpl_timeout_ms: 5000,
            icid_base: 23,
            icid_count: 41,
            stream_id_start: 23,
            stream_id_count: 41,
            mc_log_level: Some(McLogLevel::Warning),
            min_firmware_version: McVersion { major: 10, minor: 0, revision: 0 },
            dpmac_count: 16,
            mac_seed: 0,
            active_dpmacs: Vec::new(),
            log_level: log::LevelFilter::Info,
        }
    }
}

impl PlatformConfig {
    /// Physical address of MC command portal `portal_id`.
    pub fn mc_portal_address(&self, portal_id: u32) -> u64 {
        self.mc_portals_base + u64::from(portal_id) * self.mc_portal_stride
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::{from_str, to_string_pretty};

    #[test]
    fn test_default_portal_addresses() {
        let config = PlatformConfig::default();
        assert_eq!(config.mc_portal_address(0), 0x08_0C00_0000);
        assert_eq!(config.mc_portal_address(3), 0x08_0C03_0000);
        assert_eq!(config.private_memory.size(), SIZE_512MB);
    }

    #[test]
    fn test_partial_json_keeps_defaults() {
        let json_data = r#"
        {
            "icid_base": 100,
            "icid_count": 8,
            "mc_log_level": null,
            "private_memory": { "type": "static", "base": 2147483648, "size": 536870912 },
            "active_dpmacs": [1, 2]
        }"#;

        let config: PlatformConfig = from_str(json_data).unwrap();
        assert_eq!(config.icid_base, 100);
        assert_eq!(config.icid_count, 8);
        assert_eq!(config.mc_log_level, None);
        assert_eq!(config.private_memory, PrivateMemoryConfig::Static { base: 0x8000_0000, size: SIZE_512MB });
        assert_eq!(config.active_dpmacs, vec![1, 2]);
        assert_eq!(config.mc_ccsr_base, PlatformConfig::default().mc_ccsr_base);
    }

    #[test]
    fn test_config_round_trip() {
        let mut config = PlatformConfig::default();
        config.mc_log_level = Some(McLogLevel::Debug);
        config.log_level = log::LevelFilter::Trace;
        let text = to_string_pretty(&config).unwrap();
        let parsed: PlatformConfig = from_str(&text).unwrap();
        assert_eq!(parsed, config);
    }

    #[test]
    fn test_log_level_names() {
        assert_eq!(McLogLevel::Warning.dpc_name(), "LOG_LEVEL_WARNING");
        assert_eq!(McLogLevel::Critical.dpc_name(), "LOG_LEVEL_CRITICAL");
    }
}

//! Device tree fixups applied to the DPC, the DPL and the OS device tree.
//!
//! Some missing nodes are fatal and others are skipped. `/resources` and `/mc_general/log` in the
//! DPC are required; per-port MAC nodes, DPL `dpmac@N` nodes and the OS `fsl-mc` node are optional.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::format;

use r_efi::efi;

use crate::{config::PlatformConfig, error::Result, fdt::Fdt};

/// External source of per-port MAC addresses, typically a board EEPROM.
pub trait MacAddressSource {
    /// Address of DPMAC `dpmac_id`, or `None` if the source has none.
    fn mac_address(&self, dpmac_id: u32) -> Option<[u8; 6]>;
}

/// Deterministic, locally administered addresses derived from a per-SoC seed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GeneratedMacAddress {
    seed: u64,
}

impl GeneratedMacAddress {
    pub fn new(seed: u64) -> Self {
        Self { seed }
    }

    pub fn generate(&self, dpmac_id: u32) -> [u8; 6] {
        // splitmix64 finalizer
        let mut z = self.seed ^ (u64::from(dpmac_id)).wrapping_mul(0x9E37_79B9_7F4A_7C15);
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
        z ^= z >> 31;
        let bytes = z.to_le_bytes();
        [0x02, bytes[0], bytes[1], bytes[2], bytes[3], dpmac_id as u8]
    }
}

impl MacAddressSource for GeneratedMacAddress {
    fn mac_address(&self, dpmac_id: u32) -> Option<[u8; 6]> {
        Some(self.generate(dpmac_id))
    }
}

/// Address for `dpmac_id`: from `source` when it has one, otherwise generated.
pub fn resolve_mac(source: Option<&dyn MacAddressSource>, generator: &GeneratedMacAddress, dpmac_id: u32) -> [u8; 6] {
    match source.and_then(|s| s.mac_address(dpmac_id)) {
        Some(mac) => mac,
        None => {
            let mac = generator.generate(dpmac_id);
            log::info!(target: "mc", "dpmac@{}: no stored MAC address, using generated {}", dpmac_id, MacDisplay(&mac));
            mac
        }
    }
}

/// `Display` adapter printing `aa:bb:cc:dd:ee:ff`.
pub struct MacDisplay<'a>(pub &'a [u8; 6]);

impl core::fmt::Display for MacDisplay<'_> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let m = self.0;
        write!(f, "{:02x}:{:02x}:{:02x}:{:02x}:{:02x}:{:02x}", m[0], m[1], m[2], m[3], m[4], m[5])
    }
}

fn mac_cells(mac: &[u8; 6]) -> [u32; 6] {
    mac.map(u32::from)
}

/// Rewrites the ICID pool, per-port MAC addresses and the MC log settings of a DPC.
pub fn fixup_dpc(dpc: &mut Fdt, config: &PlatformConfig, mac_for: &dyn Fn(u32) -> [u8; 6]) -> Result<()> {
    let Some(resources) = dpc.node_mut("/resources") else {
        log::error!(target: "mc", "DPC has no /resources node");
        return Err(efi::Status::INVALID_PARAMETER);
    };
    resources.children.retain(|n| n.name != "icid_pools");
    let pool = resources.add_subnode("icid_pools")?.add_subnode("icid_pool@0")?;
    pool.set_property_u32("base_icid", config.icid_base);
    pool.set_property_u32("num", config.icid_count);
    log::debug!(target: "mc", "DPC ICID pool {}+{}", config.icid_base, config.icid_count);

    match dpc.node_mut("/board_info/ports") {
        Some(ports) => {
            for dpmac_id in 1..=config.dpmac_count {
                match ports.subnode_mut(&format!("mac@{}", dpmac_id)) {
                    Some(port) => port.set_property("port_mac_address", mac_for(dpmac_id).to_vec()),
                    None => log::debug!(target: "mc", "DPC has no mac@{} port, skipping", dpmac_id),
                }
            }
        }
        None => log::warn!(target: "mc", "DPC has no /board_info/ports node, MAC addresses not fixed up"),
    }

    let Some(log_node) = dpc.node_mut("/mc_general/log") else {
        log::error!(target: "mc", "DPC has no /mc_general/log node");
        return Err(efi::Status::INVALID_PARAMETER);
    };
    match config.mc_log_level {
        Some(level) => {
            log_node.set_property_str("mode", "LOG_MODE_ON");
            log_node.set_property_str("level", level.dpc_name());
        }
        None => log_node.set_property_str("mode", "LOG_MODE_OFF"),
    }

    Ok(())
}

/// Writes MAC addresses into the DPL `dpmac@N` objects that exist.
pub fn fixup_dpl(dpl: &mut Fdt, config: &PlatformConfig, mac_for: &dyn Fn(u32) -> [u8; 6]) -> Result<()> {
    let Some(objects) = dpl.node_mut("/objects") else {
        log::warn!(target: "mc", "DPL has no /objects node, MAC addresses not fixed up");
        return Ok(());
    };
    for dpmac_id in 1..=config.dpmac_count {
        match objects.subnode_mut(&format!("dpmac@{}", dpmac_id)) {
            Some(dpmac) => dpmac.set_property_u32_cells("mac_addr", &mac_cells(&mac_for(dpmac_id))),
            None => log::debug!(target: "mc", "DPL has no dpmac@{}, skipping", dpmac_id),
        }
    }
    Ok(())
}

/// Points the OS `fsl-mc` node's `iommu-map` at the MC stream-id range.
///
/// Returns whether a fixup was applied; a missing node or property is not an error.
pub fn fixup_iommu_map(system: &mut Fdt, stream_id_start: u32, stream_id_count: u32) -> bool {
    let path = ["/soc/fsl-mc", "/fsl-mc"].into_iter().find(|p| system.node(p).is_some());
    let Some(node) = path.and_then(|p| system.node_mut(p)) else {
        log::warn!(target: "mc", "no fsl-mc node in the system device tree, iommu-map not updated");
        return false;
    };
    let Some(mut cells) = node.property_u32_cells("iommu-map").filter(|c| c.len() >= 4) else {
        log::warn!(target: "mc", "fsl-mc node has no usable iommu-map, not updated");
        return false;
    };

    cells[0] = stream_id_start;
    cells[2] = stream_id_start;
    cells[3] = stream_id_count;
    node.set_property_u32_cells("iommu-map", &cells);
    log::info!(target: "mc", "iommu-map set to stream ids {}+{}", stream_id_start, stream_id_count);
    true
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::config::McLogLevel;

    /// A DPC with the nodes the fixups expect and two ports.
    pub(crate) fn sample_dpc() -> Fdt {
        let mut dpc = Fdt::default();
        let pools = dpc.root.add_subnode("resources").unwrap().add_subnode("icid_pools").unwrap();
        pools.add_subnode("icid_pool@0").unwrap().set_property_u32("base_icid", 1);
        pools.add_subnode("icid_pool@1").unwrap().set_property_u32("base_icid", 2);
        let ports = dpc.root.add_subnode("board_info").unwrap().add_subnode("ports").unwrap();
        ports.add_subnode("mac@1").unwrap();
        ports.add_subnode("mac@3").unwrap();
        dpc.root.add_subnode("mc_general").unwrap().add_subnode("log").unwrap();
        dpc
    }

    pub(crate) fn sample_dpl() -> Fdt {
        let mut dpl = Fdt::default();
        let objects = dpl.root.add_subnode("objects").unwrap();
        objects.add_subnode("dpmac@2").unwrap();
        objects.add_subnode("dpni@0").unwrap();
        dpl
    }

    fn mac_for(id: u32) -> [u8; 6] {
        [0x00, 0x04, 0x9F, 0x00, 0x00, id as u8]
    }

    #[test]
    fn test_dpc_fixup() {
        let mut dpc = sample_dpc();
        let config = PlatformConfig { icid_base: 23, icid_count: 41, dpmac_count: 4, ..Default::default() };
        fixup_dpc(&mut dpc, &config, &mac_for).unwrap();

        let pools = dpc.node("/resources/icid_pools").unwrap();
        assert_eq!(pools.children.len(), 1);
        let pool = pools.subnode("icid_pool@0").unwrap();
        assert_eq!(pool.property_u32("base_icid"), Some(23));
        assert_eq!(pool.property_u32("num"), Some(41));

        assert_eq!(dpc.node("/board_info/ports/mac@1").unwrap().property("port_mac_address"), Some(&mac_for(1)[..]));
        assert_eq!(dpc.node("/board_info/ports/mac@3").unwrap().property("port_mac_address"), Some(&mac_for(3)[..]));
        assert!(dpc.node("/board_info/ports/mac@2").is_none());

        let log = dpc.node("/mc_general/log").unwrap();
        assert_eq!(log.property_str("mode"), Some("LOG_MODE_ON"));
        assert_eq!(log.property_str("level"), Some(McLogLevel::Warning.dpc_name()));
    }

    #[test]
    fn test_dpc_log_disabled() {
        let mut dpc = sample_dpc();
        let config = PlatformConfig { mc_log_level: None, ..Default::default() };
        fixup_dpc(&mut dpc, &config, &mac_for).unwrap();
        assert_eq!(dpc.node("/mc_general/log").unwrap().property_str("mode"), Some("LOG_MODE_OFF"));
    }

    #[test]
    fn test_dpc_missing_required_nodes() {
        let config = PlatformConfig::default();

        let mut dpc = sample_dpc();
        dpc.delete_node("/resources").unwrap();
        assert_eq!(fixup_dpc(&mut dpc, &config, &mac_for), Err(efi::Status::INVALID_PARAMETER));

        let mut dpc = sample_dpc();
        dpc.delete_node("/mc_general/log").unwrap();
        assert_eq!(fixup_dpc(&mut dpc, &config, &mac_for), Err(efi::Status::INVALID_PARAMETER));
    }

    #[test]
    fn test_dpc_without_ports_is_fixed_up() {
        let mut dpc = sample_dpc();
        dpc.delete_node("/board_info").unwrap();
        fixup_dpc(&mut dpc, &PlatformConfig::default(), &mac_for).unwrap();
        assert!(dpc.node("/resources/icid_pools/icid_pool@0").is_some());
    }

    #[test]
    fn test_dpl_fixup() {
        let mut dpl = sample_dpl();
        let config = PlatformConfig { dpmac_count: 4, ..Default::default() };
        fixup_dpl(&mut dpl, &config, &mac_for).unwrap();
        let cells = dpl.node("/objects/dpmac@2").unwrap().property_u32_cells("mac_addr").unwrap();
        assert_eq!(cells, vec![0x00, 0x04, 0x9F, 0x00, 0x00, 0x02]);
        assert!(dpl.node("/objects/dpni@0").unwrap().property("mac_addr").is_none());

        let mut empty = Fdt::default();
        assert_eq!(fixup_dpl(&mut empty, &config, &mac_for), Ok(()));
    }

    #[test]
    fn test_iommu_map_fixup() {
        let mut system = Fdt::default();
        let node = system.root.add_subnode("soc").unwrap().add_subnode("fsl-mc@80c000000").unwrap();
        node.set_property_u32_cells("iommu-map", &[0, 0x55, 0, 0]);

        assert!(fixup_iommu_map(&mut system, 23, 41));
        let cells = system.node("/soc/fsl-mc").unwrap().property_u32_cells("iommu-map").unwrap();
        assert_eq!(cells, vec![23, 0x55, 23, 41]);
    }

    #[test]
    fn test_iommu_map_missing_is_tolerated() {
        let mut system = Fdt::default();
        assert!(!fixup_iommu_map(&mut system, 23, 41));
        system.root.add_subnode("fsl-mc").unwrap();
        assert!(!fixup_iommu_map(&mut system, 23, 41));
    }

    struct Eeprom;

    impl MacAddressSource for Eeprom {
        fn mac_address(&self, dpmac_id: u32) -> Option<[u8; 6]> {
            (dpmac_id == 1).then_some([0x00, 0x11, 0x22, 0x33, 0x44, 0x55])
        }
    }

    #[test]
    fn test_mac_resolution() {
        let generator = GeneratedMacAddress::new(0x1234);
        assert_eq!(resolve_mac(Some(&Eeprom), &generator, 1), [0x00, 0x11, 0x22, 0x33, 0x44, 0x55]);

        let generated = resolve_mac(Some(&Eeprom), &generator, 2);
        assert_eq!(generated, generator.generate(2));
        assert_eq!(generated[0], 0x02);
        assert_eq!(generated, resolve_mac(None, &generator, 2));
        assert_ne!(generator.generate(3), generator.generate(2));
        assert_ne!(GeneratedMacAddress::new(1).generate(2), generated);
        assert_eq!(MacDisplay(&[0, 1, 2, 0xA, 0xB, 0xFF]).to_string(), "00:01:02:0a:0b:ff");
    }
}

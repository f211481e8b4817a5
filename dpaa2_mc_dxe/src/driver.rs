//! MC bring-up flow run by the DXE entry point.
//!
//! Boots the Management Complex, deploys the DPL, then builds a network interface for every
//! configured DPMAC port and checks that one frame makes it through the Tx path. Interfaces are
//! torn down again before returning; the MC and the deployed DPL stay up for the OS.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{
    format,
    string::{String, ToString},
    vec::Vec,
};

use dpaa2_mc::{
    error::status_name,
    hal::poll_with_timeout,
    mc::{dpmac::LinkState, fixup::MacDisplay, MacAddressSource, McVersion},
    net::{EthernetHeader, BROADCAST_MAC},
    qbman::{QBMAN_POLL_BUDGET_US, QBMAN_POLL_INTERVAL_US},
    Hal, ManagementComplex, McBootSequencer, NetworkInterface, PlatformConfig, Result,
};
use r_efi::efi;
use serde::Serialize;

/// IEEE 802 local experimental ethertype, carried by the smoke test frame.
pub const SMOKE_TEST_ETHERTYPE: u16 = 0x88B5;
/// Minimum Ethernet payload.
const SMOKE_TEST_PAYLOAD: [u8; 46] = [0; 46];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PortReport {
    pub dpmac_id: u32,
    pub mac_address: String,
    pub mtu: Option<u16>,
    /// `"Success"` or the name of the status the port failed with.
    pub status: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct BringUpReport {
    pub firmware_version: McVersion,
    pub dpl_deployed: bool,
    pub ports: Vec<PortReport>,
    /// MC log lines produced during bring-up.
    pub mc_log: Vec<String>,
}

impl BringUpReport {
    pub fn failed_ports(&self) -> usize {
        self.ports.iter().filter(|port| port.status != status_name(efi::Status::SUCCESS)).count()
    }
}

pub struct Dpaa2Driver<'a, H: Hal> {
    hal: &'a H,
    config: PlatformConfig,
    mac_source: Option<&'a dyn MacAddressSource>,
}

impl<'a, H: Hal> Dpaa2Driver<'a, H> {
    pub fn new(hal: &'a H, config: PlatformConfig) -> Self {
        Self { hal, config, mac_source: None }
    }

    pub fn with_mac_source(mut self, source: &'a dyn MacAddressSource) -> Self {
        self.mac_source = Some(source);
        self
    }

    /// Runs the whole flow. Fails only when the MC cannot be booted or its DPL cannot be
    /// deployed; per-port failures are recorded in the report.
    pub fn run(&self) -> Result<BringUpReport> {
        let mut sequencer = McBootSequencer::new(self.hal, self.config.clone());
        if let Some(source) = self.mac_source {
            sequencer = sequencer.with_mac_source(source);
        }
        let mut mc = sequencer.boot()?;

        if let Err(status) = mc.deploy_dpl() {
            log::error!(target: "dxe", "DPL deployment failed: {}", status_name(status));
            return Err(status);
        }

        let ports = self.config.active_dpmacs.iter().map(|&dpmac_id| bring_up_port(&mc, dpmac_id)).collect();
        Ok(BringUpReport {
            firmware_version: mc.version(),
            dpl_deployed: mc.is_dpl_deployed(),
            ports,
            mc_log: mc.new_log_lines(),
        })
    }
}

fn bring_up_port<H: Hal>(mc: &ManagementComplex<'_, H>, dpmac_id: u32) -> PortReport {
    let mac = mc.mac_address(dpmac_id);
    let mut report =
        PortReport { dpmac_id, mac_address: format!("{}", MacDisplay(&mac)), mtu: None, status: String::new() };

    let mut interface = match NetworkInterface::create(mc) {
        Ok(interface) => interface,
        Err(status) => {
            log::error!(target: "dxe", "dpmac@{}: interface creation failed: {}", dpmac_id, status_name(status));
            report.status = status_name(status).to_string();
            return report;
        }
    };

    let result = interface.initialize(dpmac_id, &LinkState::default()).and_then(|()| {
        report.mtu = interface.datapath().map(|datapath| datapath.mtu);
        smoke_test(mc.hal(), &interface, &mac)
    });
    match result {
        Ok(()) => log::info!(target: "dxe", "dpmac@{} ({}) passed the Tx smoke test", dpmac_id, report.mac_address),
        Err(status) => log::error!(target: "dxe", "dpmac@{}: bring-up failed: {}", dpmac_id, status_name(status)),
    }

    // Port status reflects bring-up; a teardown failure only leaks objects in the child container.
    if let Err(status) = interface.destroy() {
        log::warn!(target: "dxe", "dpmac@{}: teardown failed: {}", dpmac_id, status_name(status));
    }
    report.status = status_name(result.err().unwrap_or(efi::Status::SUCCESS)).to_string();
    report
}

/// Sends one broadcast frame and waits for its Tx confirmation.
fn smoke_test<H: Hal>(hal: &H, interface: &NetworkInterface<'_, H>, source: &[u8; 6]) -> Result<()> {
    let header = EthernetHeader { destination: BROADCAST_MAC, source: *source, ethertype: SMOKE_TEST_ETHERTYPE };
    let sent = interface.transmit(Some(&header), &SMOKE_TEST_PAYLOAD)?;

    let completed = poll_with_timeout(hal, QBMAN_POLL_INTERVAL_US, QBMAN_POLL_BUDGET_US, || {
        match interface.check_tx_completion() {
            Err(efi::Status::NOT_READY) => None,
            other => Some(other),
        }
    });
    match completed {
        Some(Ok(buffer)) if buffer == sent => Ok(()),
        Some(Ok(buffer)) => {
            log::error!(target: "dxe", "Tx confirmation for buffer {:#x}, sent {:#x}", buffer, sent);
            Err(efi::Status::DEVICE_ERROR)
        }
        Some(Err(status)) => Err(status),
        None => Err(efi::Status::TIMEOUT),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use dpaa2_mc::{
        mc::{dpmac, McStatus},
        sim::{self, SimHal},
    };

    fn config(hal: &SimHal, ports: &[u32]) -> PlatformConfig {
        PlatformConfig { active_dpmacs: ports.to_vec(), ..hal.config() }
    }

    #[test]
    fn test_brings_up_configured_ports() {
        let hal = SimHal::with_images();
        let report = Dpaa2Driver::new(&hal, config(&hal, &[1, 2])).run().unwrap();

        assert_eq!(report.firmware_version, sim::FIRMWARE_VERSION);
        assert!(report.dpl_deployed);
        assert_eq!(report.ports.len(), 2);
        assert_eq!(report.failed_ports(), 0);
        assert_eq!(report.ports[1].dpmac_id, 2);
        assert_eq!(report.ports[0].mtu, Some(1500));
        assert!(!report.mc_log.is_empty());

        assert!(hal.mc_running());
        assert_eq!(hal.mc_object_count(), 0);
        assert_eq!(hal.dma_violations(), 0);
    }

    #[test]
    fn test_port_failure_does_not_stop_other_ports() {
        let hal = SimHal::with_images();
        hal.fail_next_command(dpmac::CMDID_CREATE, McStatus::NoResource);
        let report = Dpaa2Driver::new(&hal, config(&hal, &[3, 4])).run().unwrap();

        assert_eq!(report.failed_ports(), 1);
        assert_eq!(report.ports[0].status, "Device Error");
        assert_eq!(report.ports[0].mtu, None);
        assert_eq!(report.ports[1].status, "Success");
        assert_eq!(hal.mc_object_count(), 0);
    }

    #[test]
    fn test_boot_failure_leaves_mc_in_reset() {
        let hal = SimHal::with_images();
        hal.set_boot_hang(true);
        let result = Dpaa2Driver::new(&hal, config(&hal, &[1])).run();
        assert_eq!(result.err(), Some(efi::Status::TIMEOUT));
        assert!(!hal.mc_running());
        assert_eq!(hal.live_allocations(), 0);
    }

    #[test]
    fn test_mac_source_and_report_json() {
        struct Eeprom;
        impl MacAddressSource for Eeprom {
            fn mac_address(&self, _dpmac_id: u32) -> Option<[u8; 6]> {
                Some([0x00, 0x04, 0x9F, 0x00, 0x00, 0x01])
            }
        }

        let hal = SimHal::with_images();
        let eeprom = Eeprom;
        let report = Dpaa2Driver::new(&hal, config(&hal, &[1])).with_mac_source(&eeprom).run().unwrap();
        assert_eq!(report.ports[0].mac_address, "00:04:9f:00:00:01");

        let json = serde_json::to_string(&report).unwrap();
        assert!(json.contains("\"dpmac_id\":1"));
        assert!(json.contains("\"dpl_deployed\":true"));
    }
}

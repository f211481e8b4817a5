//! Synchronous command/response channel to the MC over one command portal.
//!
//! A command holds the portal's `spin::Mutex` from the write until the response is read, without
//! raising the task priority. Commands must not be issued from an event callback that can
//! interrupt a command in flight on the same portal.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use r_efi::efi;
use spin::Mutex;

use super::{
    command::{McCommand, McStatus, MC_CMD_NUM_OF_PARAMS},
    log::{McLog, MC_LOG_TAIL_LINES},
};
use crate::{
    error::Result,
    hal::{poll_with_timeout, Hal},
};

/// Interval between status reads of an outstanding command.
pub const MC_CMD_POLL_INTERVAL_US: u64 = 500;
/// Number of status reads before a command is declared timed out.
pub const MC_CMD_POLL_ITERATIONS: u64 = 12_000;

/// One MC command portal. At most one command is in flight per portal.
pub struct McIo<'a, H: Hal> {
    hal: &'a H,
    portal: u64,
    log: Option<McLog>,
    lock: Mutex<()>,
}

impl<'a, H: Hal> McIo<'a, H> {
    /// `log`, when present, is dumped after every failed command.
    pub fn new(hal: &'a H, portal: u64, log: Option<McLog>) -> Self {
        Self { hal, portal, log, lock: Mutex::new(()) }
    }

    pub fn portal_address(&self) -> u64 {
        self.portal
    }

    pub fn hal(&self) -> &'a H {
        self.hal
    }

    fn dump_log(&self) {
        if let Some(log) = &self.log {
            log.dump_tail(self.hal, MC_LOG_TAIL_LINES);
        }
    }

    /// Sends `command` and waits for the firmware to complete it.
    ///
    /// The parameter words are written first and the header last; the header write commits the
    /// command. On success the response parameters are copied back into `command`.
    pub fn send_command(&self, command: &mut McCommand) -> Result<()> {
        let _guard = self.lock.lock();
        let cmd_id = command.cmd_id();

        for (index, param) in command.params.iter().enumerate() {
            self.hal.write64(self.portal + 8 * (index as u64 + 1), *param);
        }
        self.hal.data_memory_barrier();
        self.hal.write64(self.portal, command.header);
        self.hal.data_memory_barrier();

        let header = poll_with_timeout(
            self.hal,
            MC_CMD_POLL_INTERVAL_US,
            MC_CMD_POLL_INTERVAL_US * MC_CMD_POLL_ITERATIONS,
            || {
                let header = self.hal.read64(self.portal);
                (McCommand::status_of(header) != McStatus::Ready as u8).then_some(header)
            },
        );

        let Some(header) = header else {
            log::error!(target: "mc", "MC command {:#05x} timed out on portal {:#x}", cmd_id, self.portal);
            self.dump_log();
            return Err(efi::Status::TIMEOUT);
        };

        command.header = header;
        let status = command.status();
        if status != McStatus::Ok {
            log::error!(
                target: "mc",
                "MC command {:#05x} failed: {} ({:#x})",
                cmd_id,
                status,
                command.raw_status()
            );
            self.dump_log();
            return Err(efi::Status::DEVICE_ERROR);
        }

        self.hal.data_memory_barrier();
        for index in 0..MC_CMD_NUM_OF_PARAMS {
            command.params[index] = self.hal.read64(self.portal + 8 * (index as u64 + 1));
        }
        log::trace!(target: "mc", "MC command {:#05x} completed", cmd_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mc::version::{McVersion, MC_CMDID_GET_VERSION},
        sim::{self, SimHal},
    };

    fn booted() -> (SimHal, McLog) {
        let hal = SimHal::new();
        let log = hal.start_firmware_for_test();
        (hal, log)
    }

    #[test]
    fn test_command_round_trip() {
        let (hal, log) = booted();
        let io = McIo::new(&hal, hal.config().mc_portal_address(0), Some(log));
        let mut command = McCommand::new(MC_CMDID_GET_VERSION, 0, 0);
        io.send_command(&mut command).unwrap();
        assert_eq!(command.status(), McStatus::Ok);
        assert_eq!(McVersion::from_response(&command), sim::FIRMWARE_VERSION);
    }

    #[test]
    fn test_firmware_error_is_device_error() {
        let (hal, log) = booted();
        let io = McIo::new(&hal, hal.config().mc_portal_address(0), Some(log));
        hal.fail_next_command(MC_CMDID_GET_VERSION, McStatus::NoPrivilege);

        sim::capture_logs();
        let mut command = McCommand::new(MC_CMDID_GET_VERSION, 0, 0);
        assert_eq!(io.send_command(&mut command), Err(efi::Status::DEVICE_ERROR));
        assert_eq!(sim::captured_log_count("MC log tail"), 1);
    }

    #[test]
    fn test_silent_portal_times_out_after_six_seconds() {
        let (hal, log) = booted();
        let io = McIo::new(&hal, hal.config().mc_portal_address(0), Some(log));
        hal.set_mc_commands_hang(true);

        sim::capture_logs();
        let start = hal.elapsed_us();
        let mut command = McCommand::new(MC_CMDID_GET_VERSION, 0, 0);
        assert_eq!(io.send_command(&mut command), Err(efi::Status::TIMEOUT));
        assert_eq!(hal.elapsed_us() - start, MC_CMD_POLL_INTERVAL_US * MC_CMD_POLL_ITERATIONS);
        assert_eq!(sim::captured_log_count("MC log tail"), 1);
    }

    #[test]
    fn test_header_is_written_after_params() {
        let (hal, log) = booted();
        let io = McIo::new(&hal, hal.config().mc_portal_address(0), Some(log));
        let mut command = McCommand::new(MC_CMDID_GET_VERSION, 0, 0);
        io.send_command(&mut command).unwrap();
        assert!(hal.mc_header_written_last());
    }
}

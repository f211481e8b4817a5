//! DPAA2 MC DXE driver - AArch64
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

// no_std and no_main are applicable only when building as an EFI application.
// Tests/other std targets are built as normal Rust binaries, which require main
// and link to std.
#![cfg_attr(target_os = "uefi", no_std)]
#![cfg_attr(target_os = "uefi", no_main)]

cfg_if::cfg_if! {
    if #[cfg(target_os = "uefi")] {
        extern crate alloc;

        use core::panic::PanicInfo;
        use dpaa2_mc::{error::status_name, PlatformConfig};
        use dpaa2_mc_dxe::{Dpaa2Driver, UefiHal};
        use uefi::prelude::*;

        /// DPMAC ports brought up by this build.
        const ACTIVE_DPMACS: [u32; 2] = [3, 4];

        #[panic_handler]
        fn panic(info: &PanicInfo) -> ! {
            log::error!("{}", info);
            loop {}
        }

        fn platform_config() -> PlatformConfig {
            PlatformConfig { active_dpmacs: ACTIVE_DPMACS.to_vec(), ..PlatformConfig::default() }
        }

        #[entry]
        fn main() -> Status {
            if uefi::helpers::init().is_err() {
                return Status::DEVICE_ERROR;
            }
            let config = platform_config();
            log::set_max_level(config.log_level);
            log::info!("DPAA2 MC DXE driver");

            let hal = UefiHal;
            match Dpaa2Driver::new(&hal, config).run() {
                Ok(report) => {
                    match serde_json::to_string(&report) {
                        Ok(json) => log::info!("{}", json),
                        Err(err) => log::warn!("Failed to serialize the bring-up report: {}", err),
                    }
                    if report.failed_ports() > 0 {
                        log::warn!("{} of {} ports failed bring-up", report.failed_ports(), report.ports.len());
                    }
                    Status::SUCCESS
                }
                Err(status) => {
                    log::error!("MC bring-up failed: {}", status_name(status));
                    Status(status.as_usize())
                }
            }
        }
    } else {
        fn main() {}
    }
}

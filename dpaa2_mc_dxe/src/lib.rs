//! DPAA2 MC DXE driver library - AArch64
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

// no_std is applicable only when building for UEFI. Tests and other std targets link to std.
#![cfg_attr(target_os = "uefi", no_std)]

extern crate alloc;

pub mod driver;

cfg_if::cfg_if! {
    // The UEFI HAL calls boot services and is meaningless on the host.
    if #[cfg(target_os = "uefi")] {
        pub mod uefi_hal;
        pub use uefi_hal::UefiHal;
    }
}

pub use driver::{BringUpReport, Dpaa2Driver, PortReport};

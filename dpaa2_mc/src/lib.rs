//! DPAA2 Management Complex bring-up and QBMan software portal drivers.
//!
//! The crate is organised leaf-first:
//!
//! - [`qbman`]: the bit-field codec and the per-core QBMan software portal (management commands,
//!   buffer acquire/release, frame enqueue, volatile dequeue and DQRR consumption).
//! - [`mc`]: the MC command/response channel, the MC object commands, the boot sequencer
//!   ([`mc::ManagementComplex`]) and the DPC/DPL/IOMMU device-tree fixups.
//! - [`net`]: the network-interface factory building DPRC/DPBP/DPIO/DPNI/DPMAC graphs and the
//!   transmit/receive datapath on top of a QBMan portal.
//! - [`fdt`] and [`fit`]: flattened device tree editing and FIT firmware image parsing.
//! - [`hal`]: the platform seam every register access, cache operation, delay and page allocation
//!   goes through.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
#![cfg_attr(not(any(test, feature = "sim")), no_std)]

extern crate alloc;

pub mod config;
pub mod crc32;
pub mod error;
pub mod fdt;
pub mod fit;
pub mod hal;
pub mod mc;
pub mod net;
pub mod qbman;

#[cfg(any(test, feature = "sim"))]
pub mod sim;

pub use config::PlatformConfig;
pub use error::Result;
pub use hal::Hal;
pub use mc::{ManagementComplex, McBootSequencer};
pub use net::NetworkInterface;

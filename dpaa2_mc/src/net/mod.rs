//! Network-interface factory and the polled Ethernet datapath built on it.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
pub mod ethernet;
pub mod interface;

pub use ethernet::{EthernetHeader, ReceivedFrame, BROADCAST_MAC, ETH_HEADER_SIZE};
pub use interface::{Datapath, NetworkInterface};

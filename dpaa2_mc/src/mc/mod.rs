//! Management Complex: command channel, object commands, boot sequencer and device tree fixups.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
pub mod boot;
pub mod command;
pub mod dpbp;
pub mod dpio;
pub mod dpmac;
pub mod dpni;
pub mod dprc;
pub mod fixup;
pub mod io;
pub mod log;
pub mod object;
pub mod version;

pub use boot::{ManagementComplex, McBootSequencer};
pub use command::{McCommand, McStatus};
pub use fixup::{GeneratedMacAddress, MacAddressSource};
pub use io::McIo;
pub use log::McLog;
pub use version::McVersion;

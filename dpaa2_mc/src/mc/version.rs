//! MC firmware version query.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

use serde::{Deserialize, Serialize};

use super::{command::McCommand, io::McIo};
use crate::{error::Result, hal::Hal};

pub const MC_CMDID_GET_VERSION: u16 = 0x831;

/// Firmware version reported by the MC. Ordering is major, then minor, then revision.
#[derive(Serialize, Deserialize, Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct McVersion {
    pub major: u32,
    pub minor: u32,
    pub revision: u32,
}

impl McVersion {
    pub fn from_response(command: &McCommand) -> Self {
        Self {
            major: command.get(0, 32, 32) as u32,
            minor: command.get(1, 0, 32) as u32,
            revision: command.get(0, 0, 32) as u32,
        }
    }

    /// Encodes the version the way the firmware answers the query.
    pub fn to_response(&self, command: &mut McCommand) {
        command.set(0, 0, 32, u64::from(self.revision));
        command.set(0, 32, 32, u64::from(self.major));
        command.set(1, 0, 32, u64::from(self.minor));
    }
}

impl fmt::Display for McVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}.{}", self.major, self.minor, self.revision)
    }
}

/// Queries the running firmware version.
pub fn get_version<H: Hal>(io: &McIo<'_, H>) -> Result<McVersion> {
    let mut command = McCommand::new(MC_CMDID_GET_VERSION, 0, 0);
    io.send_command(&mut command)?;
    Ok(McVersion::from_response(&command))
}

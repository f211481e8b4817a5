//! DPMAC (physical MAC) commands.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use super::{
    command::{McCommand, McField},
    io::McIo,
    object,
};
use crate::{error::Result, hal::Hal};

pub const CMDID_OPEN: u16 = 0x80C;
pub const CMDID_CREATE: u16 = 0x90C;
pub const CMDID_DESTROY: u16 = 0x98C;
pub const CMDID_SET_LINK_STATE: u16 = 0x0C3;

/// Link options.
pub const LINK_OPT_AUTONEG: u64 = 0x1;
pub const LINK_OPT_HALF_DUPLEX: u64 = 0x2;

pub mod fields {
    use super::McField;

    pub const CREATE_MAC_ID: McField = McField::new(0, 0, 32);
    pub const LINK_OPTIONS: McField = McField::new(0, 0, 64);
    pub const LINK_RATE: McField = McField::new(1, 0, 32);
    pub const LINK_UP: McField = McField::new(1, 32, 1);
}

/// PHY state pushed to the MAC.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinkState {
    /// Speed in Mbps.
    pub rate: u32,
    pub autoneg: bool,
    pub half_duplex: bool,
    pub up: bool,
}

impl Default for LinkState {
    fn default() -> Self {
        Self { rate: 1000, autoneg: true, half_duplex: false, up: true }
    }
}

impl LinkState {
    pub fn options(&self) -> u64 {
        let mut options = 0;
        if self.autoneg {
            options |= LINK_OPT_AUTONEG;
        }
        if self.half_duplex {
            options |= LINK_OPT_HALF_DUPLEX;
        }
        options
    }
}

/// Creates the DPMAC bound to physical MAC `mac_id`.
pub fn create<H: Hal>(io: &McIo<'_, H>, parent_token: u16, mac_id: u32) -> Result<u32> {
    let command = McCommand::new(CMDID_CREATE, 0, parent_token).with_field(fields::CREATE_MAC_ID, u64::from(mac_id));
    object::create(io, command)
}

pub fn destroy<H: Hal>(io: &McIo<'_, H>, parent_token: u16, id: u32) -> Result<()> {
    object::destroy(io, CMDID_DESTROY, parent_token, id)
}

pub fn open<H: Hal>(io: &McIo<'_, H>, id: u32) -> Result<u16> {
    object::open(io, CMDID_OPEN, id)
}

pub fn close<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<()> {
    object::close(io, token)
}

pub fn set_link_state<H: Hal>(io: &McIo<'_, H>, token: u16, state: &LinkState) -> Result<()> {
    let mut command = McCommand::new(CMDID_SET_LINK_STATE, 0, token)
        .with_field(fields::LINK_OPTIONS, state.options())
        .with_field(fields::LINK_RATE, u64::from(state.rate))
        .with_field(fields::LINK_UP, u64::from(state.up));
    io.send_command(&mut command)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_options() {
        assert_eq!(LinkState::default().options(), LINK_OPT_AUTONEG);
        let state = LinkState { rate: 100, autoneg: false, half_duplex: true, up: false };
        assert_eq!(state.options(), LINK_OPT_HALF_DUPLEX);
    }
}

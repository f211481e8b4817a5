//! DPIO (QBMan software portal object) commands.
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

pub const CMDID_OPEN: u16 = 0x803;
pub const CMDID_CREATE: u16 = 0x903;
pub const CMDID_DESTROY: u16 = 0x983;

pub mod fields {
    use super::McField;

    pub const CREATE_CHANNEL_MODE: McField = McField::new(0, 16, 2);
    pub const CREATE_NUM_PRIORITIES: McField = McField::new(0, 32, 8);

    pub const ATTR_ID: McField = McField::new(0, 0, 32);
    pub const ATTR_PORTAL_ID: McField = McField::new(0, 32, 16);
    pub const ATTR_NUM_PRIORITIES: McField = McField::new(0, 48, 8);
    pub const ATTR_CHANNEL_MODE: McField = McField::new(0, 56, 4);
    pub const ATTR_CE_OFFSET: McField = McField::new(1, 0, 64);
    pub const ATTR_CI_OFFSET: McField = McField::new(2, 0, 64);
    pub const ATTR_QBMAN_VERSION: McField = McField::new(3, 0, 32);
}

/// How the portal's notification channel is used.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelMode {
    NoChannel = 0,
    LocalChannel = 1,
}

impl From<u64> for ChannelMode {
    fn from(value: u64) -> Self {
        match value {
            1 => ChannelMode::LocalChannel,
            _ => ChannelMode::NoChannel,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpioConfig {
    pub channel_mode: ChannelMode,
    pub num_priorities: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpioAttributes {
    pub id: u32,
    pub qbman_portal_id: u16,
    pub num_priorities: u8,
    pub channel_mode: ChannelMode,
    /// Offset of the cache-enabled window from the QBMan portal base.
    pub qbman_portal_ce_offset: u64,
    /// Offset of the cache-inhibited window from the QBMan portal base.
    pub qbman_portal_ci_offset: u64,
    pub qbman_version: u32,
}

pub fn create<H: Hal>(io: &McIo<'_, H>, parent_token: u16, config: &DpioConfig) -> Result<u32> {
    let command = McCommand::new(CMDID_CREATE, 0, parent_token)
        .with_field(fields::CREATE_CHANNEL_MODE, config.channel_mode as u64)
        .with_field(fields::CREATE_NUM_PRIORITIES, u64::from(config.num_priorities));
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

pub fn enable<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<()> {
    object::token_only(io, object::CMDID_ENABLE, token)
}

pub fn disable<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<()> {
    object::token_only(io, object::CMDID_DISABLE, token)
}

pub fn get_attributes<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<DpioAttributes> {
    let mut command = McCommand::new(object::CMDID_GET_ATTR, 0, token);
    io.send_command(&mut command)?;
    Ok(DpioAttributes {
        id: fields::ATTR_ID.get(&command) as u32,
        qbman_portal_id: fields::ATTR_PORTAL_ID.get(&command) as u16,
        num_priorities: fields::ATTR_NUM_PRIORITIES.get(&command) as u8,
        channel_mode: ChannelMode::from(fields::ATTR_CHANNEL_MODE.get(&command)),
        qbman_portal_ce_offset: fields::ATTR_CE_OFFSET.get(&command),
        qbman_portal_ci_offset: fields::ATTR_CI_OFFSET.get(&command),
        qbman_version: fields::ATTR_QBMAN_VERSION.get(&command) as u32,
    })
}

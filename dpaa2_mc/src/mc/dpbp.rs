//! DPBP (buffer pool) commands.
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

pub const CMDID_OPEN: u16 = 0x804;
pub const CMDID_CREATE: u16 = 0x904;
pub const CMDID_DESTROY: u16 = 0x984;

pub mod fields {
    use super::McField;

    pub const ATTR_BPID: McField = McField::new(0, 16, 16);
    pub const ATTR_ID: McField = McField::new(0, 32, 32);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpbpAttributes {
    pub id: u32,
    /// Hardware buffer pool id used in QBMan commands and frame descriptors.
    pub bpid: u16,
}

pub fn create<H: Hal>(io: &McIo<'_, H>, parent_token: u16) -> Result<u32> {
    object::create(io, McCommand::new(CMDID_CREATE, 0, parent_token))
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

pub fn reset<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<()> {
    object::token_only(io, object::CMDID_RESET, token)
}

pub fn get_attributes<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<DpbpAttributes> {
    let mut command = McCommand::new(object::CMDID_GET_ATTR, 0, token);
    io.send_command(&mut command)?;
    Ok(DpbpAttributes { id: fields::ATTR_ID.get(&command) as u32, bpid: fields::ATTR_BPID.get(&command) as u16 })
}

//! Command shapes shared by every MC object type.
//!
//! Objects are created inside a container through the container's token and return an object id.
//! Opening an id yields a token that scopes every further command to that object instance.
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
};
use crate::{error::Result, hal::Hal};

pub const CMDID_CLOSE: u16 = 0x800;
pub const CMDID_ENABLE: u16 = 0x002;
pub const CMDID_DISABLE: u16 = 0x003;
pub const CMDID_GET_ATTR: u16 = 0x004;
pub const CMDID_RESET: u16 = 0x005;

/// Object id in open, create responses and destroy requests.
pub const OBJECT_ID: McField = McField::new(0, 0, 32);

/// Sends a command that carries nothing but the token.
pub fn token_only<H: Hal>(io: &McIo<'_, H>, cmd_id: u16, token: u16) -> Result<()> {
    let mut command = McCommand::new(cmd_id, 0, token);
    io.send_command(&mut command)
}

/// Opens object `id` and returns its token.
pub fn open<H: Hal>(io: &McIo<'_, H>, cmd_id: u16, id: u32) -> Result<u16> {
    let mut command = McCommand::new(cmd_id, 0, 0).with_field(OBJECT_ID, u64::from(id));
    io.send_command(&mut command)?;
    Ok(command.token())
}

pub fn close<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<()> {
    token_only(io, CMDID_CLOSE, token)
}

/// Sends a prepared create command, addressed to the parent container token, and returns the new
/// object id.
pub fn create<H: Hal>(io: &McIo<'_, H>, mut command: McCommand) -> Result<u32> {
    io.send_command(&mut command)?;
    Ok(OBJECT_ID.get(&command) as u32)
}

/// Destroys object `id` in the container `parent_token`.
pub fn destroy<H: Hal>(io: &McIo<'_, H>, cmd_id: u16, parent_token: u16, id: u32) -> Result<()> {
    let mut command = McCommand::new(cmd_id, 0, parent_token).with_field(OBJECT_ID, u64::from(id));
    io.send_command(&mut command)
}

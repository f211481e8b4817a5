//! DPRC (resource container) commands.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use super::{
    command::{pack_name, McCommand, McField},
    io::McIo,
    object,
};
use crate::{error::Result, hal::Hal};

pub const CMDID_OPEN: u16 = 0x805;
pub const CMDID_CREATE_CONT: u16 = 0x151;
pub const CMDID_DESTROY_CONT: u16 = 0x152;
pub const CMDID_CONNECT: u16 = 0x167;
pub const CMDID_DISCONNECT: u16 = 0x168;
pub const CMDID_GET_CONT_ID: u16 = 0x830;

/// Container may create child containers.
pub const CFG_OPT_SPAWN_ALLOWED: u32 = 0x0000_0001;
/// Container may allocate objects from its parent.
pub const CFG_OPT_ALLOC_ALLOWED: u32 = 0x0000_0002;
/// Container may create objects.
pub const CFG_OPT_OBJ_CREATE_ALLOWED: u32 = 0x0000_0004;
/// Container may change its connection topology.
pub const CFG_OPT_TOPOLOGY_CHANGES_ALLOWED: u32 = 0x0000_0008;

/// Let the MC pick the ICID or portal from its pools.
pub const GET_ICID_FROM_POOL: u16 = 0xFFFF;
pub const GET_PORTAL_ID_FROM_POOL: u32 = 0xFFFF_FFFF;

pub mod fields {
    use super::McField;

    pub const CONT_ID: McField = McField::new(0, 0, 32);
    pub const CREATE_ICID: McField = McField::new(0, 0, 16);
    pub const CREATE_OPTIONS: McField = McField::new(0, 32, 32);
    pub const CREATE_PORTAL_ID: McField = McField::new(1, 0, 32);
    pub const CREATE_LABEL_WORD: usize = 2;
    pub const CHILD_CONT_ID: McField = McField::new(1, 0, 32);
    pub const CHILD_PORTAL_ID: McField = McField::new(1, 32, 32);
    pub const DESTROY_CHILD_ID: McField = McField::new(0, 0, 32);

    pub const EP1_ID: McField = McField::new(0, 0, 32);
    pub const EP1_IF_ID: McField = McField::new(0, 32, 16);
    pub const EP1_TYPE_WORD: usize = 1;
    pub const MAX_RATE: McField = McField::new(3, 0, 32);
    pub const COMMITTED_RATE: McField = McField::new(3, 32, 32);
    pub const EP2_ID: McField = McField::new(4, 0, 32);
    pub const EP2_IF_ID: McField = McField::new(4, 32, 16);
    pub const EP2_TYPE_WORD: usize = 5;
}

/// Child container settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ContainerConfig<'n> {
    pub icid: u16,
    pub portal_id: u32,
    pub options: u32,
    pub label: &'n str,
}

impl Default for ContainerConfig<'_> {
    fn default() -> Self {
        Self {
            icid: GET_ICID_FROM_POOL,
            portal_id: GET_PORTAL_ID_FROM_POOL,
            options: CFG_OPT_SPAWN_ALLOWED | CFG_OPT_ALLOC_ALLOWED | CFG_OPT_OBJ_CREATE_ALLOWED,
            label: "",
        }
    }
}

/// A freshly created child container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChildContainer {
    pub id: u32,
    pub portal_id: u32,
}

/// One side of a connection: an object and one of its interfaces.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Endpoint<'t> {
    pub object_type: &'t str,
    pub id: u32,
    pub interface_id: u16,
}

/// Bandwidth of a connection in Mbps; zero means unlimited.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ConnectionConfig {
    pub committed_rate: u32,
    pub max_rate: u32,
}

/// Id of the container this portal belongs to.
pub fn get_container_id<H: Hal>(io: &McIo<'_, H>) -> Result<u32> {
    let mut command = McCommand::new(CMDID_GET_CONT_ID, 0, 0);
    io.send_command(&mut command)?;
    Ok(fields::CONT_ID.get(&command) as u32)
}

pub fn open<H: Hal>(io: &McIo<'_, H>, container_id: u32) -> Result<u16> {
    object::open(io, CMDID_OPEN, container_id)
}

pub fn close<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<()> {
    object::close(io, token)
}

/// Creates a child of the container `token`.
pub fn create_container<H: Hal>(io: &McIo<'_, H>, token: u16, config: &ContainerConfig<'_>) -> Result<ChildContainer> {
    let mut command = McCommand::new(CMDID_CREATE_CONT, 0, token)
        .with_field(fields::CREATE_ICID, u64::from(config.icid))
        .with_field(fields::CREATE_OPTIONS, u64::from(config.options))
        .with_field(fields::CREATE_PORTAL_ID, u64::from(config.portal_id));
    let label = pack_name(config.label);
    command.params[fields::CREATE_LABEL_WORD] = label[0];
    command.params[fields::CREATE_LABEL_WORD + 1] = label[1];

    io.send_command(&mut command)?;
    Ok(ChildContainer {
        id: fields::CHILD_CONT_ID.get(&command) as u32,
        portal_id: fields::CHILD_PORTAL_ID.get(&command) as u32,
    })
}

pub fn destroy_container<H: Hal>(io: &McIo<'_, H>, token: u16, child_id: u32) -> Result<()> {
    let mut command =
        McCommand::new(CMDID_DESTROY_CONT, 0, token).with_field(fields::DESTROY_CHILD_ID, u64::from(child_id));
    io.send_command(&mut command)
}

pub fn connect<H: Hal>(
    io: &McIo<'_, H>,
    token: u16,
    endpoint1: &Endpoint<'_>,
    endpoint2: &Endpoint<'_>,
    config: &ConnectionConfig,
) -> Result<()> {
    let mut command = McCommand::new(CMDID_CONNECT, 0, token)
        .with_field(fields::EP1_ID, u64::from(endpoint1.id))
        .with_field(fields::EP1_IF_ID, u64::from(endpoint1.interface_id))
        .with_field(fields::MAX_RATE, u64::from(config.max_rate))
        .with_field(fields::COMMITTED_RATE, u64::from(config.committed_rate))
        .with_field(fields::EP2_ID, u64::from(endpoint2.id))
        .with_field(fields::EP2_IF_ID, u64::from(endpoint2.interface_id));
    let [low, high] = pack_name(endpoint1.object_type);
    command.params[fields::EP1_TYPE_WORD] = low;
    command.params[fields::EP1_TYPE_WORD + 1] = high;
    let [low, high] = pack_name(endpoint2.object_type);
    command.params[fields::EP2_TYPE_WORD] = low;
    command.params[fields::EP2_TYPE_WORD + 1] = high;
    io.send_command(&mut command)
}

pub fn disconnect<H: Hal>(io: &McIo<'_, H>, token: u16, endpoint: &Endpoint<'_>) -> Result<()> {
    let mut command = McCommand::new(CMDID_DISCONNECT, 0, token)
        .with_field(fields::EP1_ID, u64::from(endpoint.id))
        .with_field(fields::EP1_IF_ID, u64::from(endpoint.interface_id));
    let [low, high] = pack_name(endpoint.object_type);
    command.params[fields::EP1_TYPE_WORD] = low;
    command.params[fields::EP1_TYPE_WORD + 1] = high;
    io.send_command(&mut command)
}

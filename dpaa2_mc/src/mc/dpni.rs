//! DPNI (network interface) commands.
//!
//! A DPNI owns the Rx frame queues, the Tx queuing destination and the buffer pools frames are
//! received into. Creation takes an extended configuration block the MC reads by DMA.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use r_efi::efi;

use super::{
    command::{pack_mac, McCommand, McField},
    io::McIo,
    object,
};
use crate::{error::Result, hal::Hal};

pub const CMDID_OPEN: u16 = 0x801;
pub const CMDID_CREATE: u16 = 0x901;
pub const CMDID_DESTROY: u16 = 0x981;
pub const CMDID_SET_POOLS: u16 = 0x200;
pub const CMDID_SET_RX_BUFFER_LAYOUT: u16 = 0x202;
pub const CMDID_SET_TX_BUFFER_LAYOUT: u16 = 0x204;
pub const CMDID_SET_TX_CONF_BUFFER_LAYOUT: u16 = 0x206;
pub const CMDID_GET_QDID: u16 = 0x210;
pub const CMDID_GET_TX_DATA_OFFSET: u16 = 0x212;
pub const CMDID_GET_MTU: u16 = 0x219;
pub const CMDID_ADD_MAC_ADDR: u16 = 0x226;
pub const CMDID_SET_TX_FLOW: u16 = 0x236;
pub const CMDID_GET_TX_FLOW: u16 = 0x237;
pub const CMDID_GET_RX_FLOW: u16 = 0x239;

/// Create options.
pub const OPT_ALLOW_DIST_KEY_PER_TC: u32 = 0x0000_0001;
pub const OPT_TX_CONF_DISABLED: u32 = 0x0000_0002;
pub const OPT_UNICAST_FILTER: u32 = 0x0000_0080;
pub const OPT_MULTICAST_FILTER: u32 = 0x0000_0100;

/// Buffer layout options; each enables the matching field of [`BufferLayout`].
pub const BUF_LAYOUT_OPT_TIMESTAMP: u32 = 0x0000_0001;
pub const BUF_LAYOUT_OPT_PARSER_RESULT: u32 = 0x0000_0002;
pub const BUF_LAYOUT_OPT_FRAME_STATUS: u32 = 0x0000_0004;
pub const BUF_LAYOUT_OPT_PRIVATE_DATA_SIZE: u32 = 0x0000_0008;
pub const BUF_LAYOUT_OPT_DATA_ALIGN: u32 = 0x0000_0010;
pub const BUF_LAYOUT_OPT_DATA_HEAD_ROOM: u32 = 0x0000_0020;
pub const BUF_LAYOUT_OPT_DATA_TAIL_ROOM: u32 = 0x0000_0040;

/// Requests a new Tx flow from `set_tx_flow`.
pub const NEW_FLOW_ID: u16 = 0xFFFF;

/// Size of the extended configuration block.
pub const EXT_CFG_SIZE: usize = 256;
/// Number of traffic classes described in the extended configuration.
pub const MAX_TCS: usize = 8;
/// Pools one `set_pools` command can carry.
pub const MAX_POOLS: usize = 6;

pub mod fields {
    use super::McField;

    pub const CREATE_MAC_OFFSET: u32 = 0;
    pub const CREATE_MAX_TCS: McField = McField::new(0, 48, 8);
    pub const CREATE_MAX_SENDERS: McField = McField::new(0, 56, 8);
    pub const CREATE_OPTIONS: McField = McField::new(1, 0, 32);
    pub const CREATE_MAX_UNICAST_FILTERS: McField = McField::new(1, 32, 8);
    pub const CREATE_MAX_MULTICAST_FILTERS: McField = McField::new(1, 40, 8);
    pub const CREATE_EXT_CFG_IOVA: McField = McField::new(6, 0, 64);

    pub const ATTR_ID: McField = McField::new(0, 0, 32);
    pub const ATTR_MAX_TCS: McField = McField::new(0, 32, 8);
    pub const ATTR_MAX_SENDERS: McField = McField::new(0, 40, 8);
    pub const ATTR_OPTIONS: McField = McField::new(1, 0, 32);

    pub const POOLS_NUM: McField = McField::new(0, 0, 8);
    pub const POOL_DPBP_ID_OFFSET: u32 = 0;
    pub const POOL_BUFFER_SIZE_OFFSET: u32 = 32;

    pub const LAYOUT_PRIVATE_DATA_SIZE: McField = McField::new(0, 0, 16);
    pub const LAYOUT_DATA_ALIGN: McField = McField::new(0, 16, 16);
    pub const LAYOUT_OPTIONS: McField = McField::new(0, 32, 32);
    pub const LAYOUT_PASS_TIMESTAMP: McField = McField::new(1, 0, 1);
    pub const LAYOUT_PASS_PARSER_RESULT: McField = McField::new(1, 1, 1);
    pub const LAYOUT_PASS_FRAME_STATUS: McField = McField::new(1, 2, 1);
    pub const LAYOUT_DATA_HEAD_ROOM: McField = McField::new(1, 16, 16);
    pub const LAYOUT_DATA_TAIL_ROOM: McField = McField::new(1, 32, 16);

    pub const RSP_U16: McField = McField::new(0, 0, 16);
    pub const MAC_ADDR_OFFSET: u32 = 16;

    pub const FLOW_ID: McField = McField::new(0, 0, 16);
    pub const RX_FLOW_TC: McField = McField::new(0, 16, 8);
    pub const TX_FLOW_USE_COMMON_CONF: McField = McField::new(1, 0, 1);
    pub const RX_FLOW_FQID: McField = McField::new(1, 32, 32);
    pub const TX_FLOW_CONF_FQID: McField = McField::new(1, 0, 32);
}

/// Extended configuration, serialized into the DMA block passed at creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExtendedConfig {
    /// Maximum distribution size per traffic class.
    pub max_dist: [u16; MAX_TCS],
    /// Maximum flow steering entries per traffic class.
    pub max_fs_entries: [u16; MAX_TCS],
}

impl Default for ExtendedConfig {
    fn default() -> Self {
        let mut max_dist = [0; MAX_TCS];
        max_dist[0] = 1;
        Self { max_dist, max_fs_entries: [0; MAX_TCS] }
    }
}

impl ExtendedConfig {
    /// Serializes the configuration in the layout the MC expects.
    pub fn prepare(&self) -> [u8; EXT_CFG_SIZE] {
        let mut block = [0u8; EXT_CFG_SIZE];
        for tc in 0..MAX_TCS {
            block[2 * tc..2 * tc + 2].copy_from_slice(&self.max_dist[tc].to_le_bytes());
            let fs = 2 * MAX_TCS + 2 * tc;
            block[fs..fs + 2].copy_from_slice(&self.max_fs_entries[tc].to_le_bytes());
        }
        block
    }

    pub fn parse(block: &[u8; EXT_CFG_SIZE]) -> Self {
        let mut config = Self { max_dist: [0; MAX_TCS], max_fs_entries: [0; MAX_TCS] };
        for tc in 0..MAX_TCS {
            config.max_dist[tc] = u16::from_le_bytes([block[2 * tc], block[2 * tc + 1]]);
            let fs = 2 * MAX_TCS + 2 * tc;
            config.max_fs_entries[tc] = u16::from_le_bytes([block[fs], block[fs + 1]]);
        }
        config
    }
}

/// Create parameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpniConfig {
    pub mac_addr: [u8; 6],
    pub max_tcs: u8,
    pub max_senders: u8,
    pub options: u32,
    pub max_unicast_filters: u8,
    pub max_multicast_filters: u8,
    /// Physical address of the serialized [`ExtendedConfig`]; must be cache clean.
    pub ext_cfg_iova: u64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DpniAttributes {
    pub id: u32,
    pub max_tcs: u8,
    pub max_senders: u8,
    pub options: u32,
}

/// One buffer pool feeding the interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolConfig {
    pub dpbp_id: u32,
    pub buffer_size: u16,
}

/// Where the hardware places annotations and frame data inside a buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct BufferLayout {
    pub options: u32,
    pub pass_timestamp: bool,
    pub pass_parser_result: bool,
    pub pass_frame_status: bool,
    pub private_data_size: u16,
    pub data_align: u16,
    pub data_head_room: u16,
    pub data_tail_room: u16,
}

/// Which buffer layout a command configures.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LayoutKind {
    Rx,
    Tx,
    TxConfirmation,
}

impl LayoutKind {
    fn cmd_id(self) -> u16 {
        match self {
            LayoutKind::Rx => CMDID_SET_RX_BUFFER_LAYOUT,
            LayoutKind::Tx => CMDID_SET_TX_BUFFER_LAYOUT,
            LayoutKind::TxConfirmation => CMDID_SET_TX_CONF_BUFFER_LAYOUT,
        }
    }
}

pub fn create<H: Hal>(io: &McIo<'_, H>, parent_token: u16, config: &DpniConfig) -> Result<u32> {
    let mut command = McCommand::new(CMDID_CREATE, 0, parent_token)
        .with_field(fields::CREATE_MAX_TCS, u64::from(config.max_tcs))
        .with_field(fields::CREATE_MAX_SENDERS, u64::from(config.max_senders))
        .with_field(fields::CREATE_OPTIONS, u64::from(config.options))
        .with_field(fields::CREATE_MAX_UNICAST_FILTERS, u64::from(config.max_unicast_filters))
        .with_field(fields::CREATE_MAX_MULTICAST_FILTERS, u64::from(config.max_multicast_filters))
        .with_field(fields::CREATE_EXT_CFG_IOVA, config.ext_cfg_iova);
    command.params[0] |= pack_mac(&config.mac_addr, fields::CREATE_MAC_OFFSET);
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

pub fn reset<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<()> {
    object::token_only(io, object::CMDID_RESET, token)
}

pub fn get_attributes<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<DpniAttributes> {
    let mut command = McCommand::new(object::CMDID_GET_ATTR, 0, token);
    io.send_command(&mut command)?;
    Ok(DpniAttributes {
        id: fields::ATTR_ID.get(&command) as u32,
        max_tcs: fields::ATTR_MAX_TCS.get(&command) as u8,
        max_senders: fields::ATTR_MAX_SENDERS.get(&command) as u8,
        options: fields::ATTR_OPTIONS.get(&command) as u32,
    })
}

/// Attaches up to [`MAX_POOLS`] buffer pools.
pub fn set_pools<H: Hal>(io: &McIo<'_, H>, token: u16, pools: &[PoolConfig]) -> Result<()> {
    if pools.is_empty() || pools.len() > MAX_POOLS {
        log::error!(target: "mc", "DPNI supports 1 to {} pools, got {}", MAX_POOLS, pools.len());
        return Err(efi::Status::INVALID_PARAMETER);
    }
    let mut command = McCommand::new(CMDID_SET_POOLS, 0, token).with_field(fields::POOLS_NUM, pools.len() as u64);
    for (index, pool) in pools.iter().enumerate() {
        command.set(index + 1, fields::POOL_DPBP_ID_OFFSET, 32, u64::from(pool.dpbp_id));
        command.set(index + 1, fields::POOL_BUFFER_SIZE_OFFSET, 16, u64::from(pool.buffer_size));
    }
    io.send_command(&mut command)
}

pub fn set_buffer_layout<H: Hal>(io: &McIo<'_, H>, token: u16, kind: LayoutKind, layout: &BufferLayout) -> Result<()> {
    let mut command = McCommand::new(kind.cmd_id(), 0, token)
        .with_field(fields::LAYOUT_PRIVATE_DATA_SIZE, u64::from(layout.private_data_size))
        .with_field(fields::LAYOUT_DATA_ALIGN, u64::from(layout.data_align))
        .with_field(fields::LAYOUT_OPTIONS, u64::from(layout.options))
        .with_field(fields::LAYOUT_PASS_TIMESTAMP, u64::from(layout.pass_timestamp))
        .with_field(fields::LAYOUT_PASS_PARSER_RESULT, u64::from(layout.pass_parser_result))
        .with_field(fields::LAYOUT_PASS_FRAME_STATUS, u64::from(layout.pass_frame_status))
        .with_field(fields::LAYOUT_DATA_HEAD_ROOM, u64::from(layout.data_head_room))
        .with_field(fields::LAYOUT_DATA_TAIL_ROOM, u64::from(layout.data_tail_room));
    io.send_command(&mut command)
}

fn get_u16<H: Hal>(io: &McIo<'_, H>, cmd_id: u16, token: u16) -> Result<u16> {
    let mut command = McCommand::new(cmd_id, 0, token);
    io.send_command(&mut command)?;
    Ok(fields::RSP_U16.get(&command) as u16)
}

/// Queuing destination id Tx frames are enqueued to.
pub fn get_qdid<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<u16> {
    get_u16(io, CMDID_GET_QDID, token)
}

/// Offset of frame data inside a Tx buffer, after the annotations.
pub fn get_tx_data_offset<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<u16> {
    get_u16(io, CMDID_GET_TX_DATA_OFFSET, token)
}

pub fn get_mtu<H: Hal>(io: &McIo<'_, H>, token: u16) -> Result<u16> {
    get_u16(io, CMDID_GET_MTU, token)
}

/// Adds an address to the unicast/multicast filter table.
pub fn add_mac_addr<H: Hal>(io: &McIo<'_, H>, token: u16, mac: &[u8; 6]) -> Result<()> {
    let mut command = McCommand::new(CMDID_ADD_MAC_ADDR, 0, token);
    command.params[0] = pack_mac(mac, fields::MAC_ADDR_OFFSET);
    io.send_command(&mut command)
}

/// Frame queue id of Rx flow `flow_id` in traffic class `tc`.
pub fn get_rx_flow_fqid<H: Hal>(io: &McIo<'_, H>, token: u16, tc: u8, flow_id: u16) -> Result<u32> {
    let mut command = McCommand::new(CMDID_GET_RX_FLOW, 0, token)
        .with_field(fields::RX_FLOW_TC, u64::from(tc))
        .with_field(fields::FLOW_ID, u64::from(flow_id));
    io.send_command(&mut command)?;
    Ok(fields::RX_FLOW_FQID.get(&command) as u32)
}

/// Creates (with [`NEW_FLOW_ID`]) or updates a Tx flow and returns its id.
pub fn set_tx_flow<H: Hal>(io: &McIo<'_, H>, token: u16, flow_id: u16, use_common_tx_conf: bool) -> Result<u16> {
    let mut command = McCommand::new(CMDID_SET_TX_FLOW, 0, token)
        .with_field(fields::FLOW_ID, u64::from(flow_id))
        .with_field(fields::TX_FLOW_USE_COMMON_CONF, u64::from(use_common_tx_conf));
    io.send_command(&mut command)?;
    Ok(fields::FLOW_ID.get(&command) as u16)
}

/// Frame queue id receiving Tx confirmations of flow `flow_id`.
pub fn get_tx_conf_fqid<H: Hal>(io: &McIo<'_, H>, token: u16, flow_id: u16) -> Result<u32> {
    let mut command = McCommand::new(CMDID_GET_TX_FLOW, 0, token).with_field(fields::FLOW_ID, u64::from(flow_id));
    io.send_command(&mut command)?;
    Ok(fields::TX_FLOW_CONF_FQID.get(&command) as u32)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extended_config_layout() {
        let mut config = ExtendedConfig::default();
        config.max_fs_entries[1] = 0x0102;
        let block = config.prepare();
        assert_eq!(&block[..2], &[1, 0]);
        assert_eq!(&block[18..20], &[0x02, 0x01]);
        assert!(block[32..].iter().all(|b| *b == 0));
        assert_eq!(ExtendedConfig::parse(&block), config);
    }
}

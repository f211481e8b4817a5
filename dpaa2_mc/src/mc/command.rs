//! MC command wire format.
//!
//! A command is one 64-bit header followed by [`MC_CMD_NUM_OF_PARAMS`] 64-bit parameter words. The
//! firmware overwrites the same memory with its response: the status lands in the header and the
//! output values in the parameter words.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::fmt;

pub const MC_CMD_NUM_OF_PARAMS: usize = 7;

const HDR_CMDID_SHIFT: u32 = 52;
const HDR_CMDID_WIDTH: u32 = 12;
const HDR_TOKEN_SHIFT: u32 = 38;
const HDR_TOKEN_WIDTH: u32 = 10;
const HDR_STATUS_SHIFT: u32 = 16;
const HDR_STATUS_WIDTH: u32 = 8;
const HDR_PRI_SHIFT: u32 = 15;

/// Priority flag; high priority commands bypass the firmware's normal queue.
pub const MC_CMD_FLAG_PRI: u32 = 1 << HDR_PRI_SHIFT;

/// Status codes reported in the command header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum McStatus {
    Ok = 0x0,
    Ready = 0x1,
    AuthError = 0x3,
    NoPrivilege = 0x4,
    DmaError = 0x5,
    ConfigError = 0x6,
    Timeout = 0x7,
    NoResource = 0x8,
    NoMemory = 0x9,
    Busy = 0xA,
    UnsupportedOp = 0xB,
    InvalidState = 0xC,
    Unknown = 0xFF,
}

impl From<u8> for McStatus {
    fn from(value: u8) -> Self {
        match value {
            0x0 => McStatus::Ok,
            0x1 => McStatus::Ready,
            0x3 => McStatus::AuthError,
            0x4 => McStatus::NoPrivilege,
            0x5 => McStatus::DmaError,
            0x6 => McStatus::ConfigError,
            0x7 => McStatus::Timeout,
            0x8 => McStatus::NoResource,
            0x9 => McStatus::NoMemory,
            0xA => McStatus::Busy,
            0xB => McStatus::UnsupportedOp,
            0xC => McStatus::InvalidState,
            _ => McStatus::Unknown,
        }
    }
}

impl fmt::Display for McStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            McStatus::Ok => "command completed successfully",
            McStatus::Ready => "command ready to be processed",
            McStatus::AuthError => "authentication error",
            McStatus::NoPrivilege => "no privilege",
            McStatus::DmaError => "DMA or I/O error",
            McStatus::ConfigError => "configuration error",
            McStatus::Timeout => "operation timed out",
            McStatus::NoResource => "no resources",
            McStatus::NoMemory => "no memory available",
            McStatus::Busy => "device is busy",
            McStatus::UnsupportedOp => "unsupported operation",
            McStatus::InvalidState => "invalid state",
            McStatus::Unknown => "unknown status",
        };
        write!(f, "{}", text)
    }
}

const fn field_mask(width: u32) -> u64 {
    if width >= 64 { u64::MAX } else { (1u64 << width) - 1 }
}

/// Packs `value` into `width` bits at `offset` of a parameter word.
#[inline]
pub const fn enc(offset: u32, width: u32, value: u64) -> u64 {
    (value & field_mask(width)) << offset
}

/// Extracts `width` bits at `offset` of a parameter word.
#[inline]
pub const fn dec(param: u64, offset: u32, width: u32) -> u64 {
    (param >> offset) & field_mask(width)
}

/// A named field of one parameter word.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McField {
    pub param: usize,
    pub offset: u32,
    pub width: u32,
}

impl McField {
    pub const fn new(param: usize, offset: u32, width: u32) -> Self {
        Self { param, offset, width }
    }

    pub fn get(&self, command: &McCommand) -> u64 {
        command.get(self.param, self.offset, self.width)
    }

    pub fn set(&self, command: &mut McCommand, value: u64) {
        command.set(self.param, self.offset, self.width, value);
    }
}

/// One MC command or response.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McCommand {
    pub header: u64,
    pub params: [u64; MC_CMD_NUM_OF_PARAMS],
}

impl McCommand {
    /// A command with status `READY`, ready to be written to a portal.
    pub fn new(cmd_id: u16, flags: u32, token: u16) -> Self {
        let header = enc(HDR_CMDID_SHIFT, HDR_CMDID_WIDTH, u64::from(cmd_id))
            | enc(HDR_TOKEN_SHIFT, HDR_TOKEN_WIDTH, u64::from(token))
            | enc(HDR_STATUS_SHIFT, HDR_STATUS_WIDTH, McStatus::Ready as u64)
            | u64::from(flags & MC_CMD_FLAG_PRI);
        Self { header, params: [0; MC_CMD_NUM_OF_PARAMS] }
    }

    /// Sets `width` bits at `offset` of parameter `index`.
    pub fn with(mut self, index: usize, offset: u32, width: u32, value: u64) -> Self {
        self.set(index, offset, width, value);
        self
    }

    /// Sets a named field.
    pub fn with_field(mut self, field: McField, value: u64) -> Self {
        field.set(&mut self, value);
        self
    }

    pub fn set(&mut self, index: usize, offset: u32, width: u32, value: u64) {
        let mask = field_mask(width) << offset;
        self.params[index] = (self.params[index] & !mask) | enc(offset, width, value);
    }

    pub fn get(&self, index: usize, offset: u32, width: u32) -> u64 {
        dec(self.params[index], offset, width)
    }

    pub fn cmd_id(&self) -> u16 {
        dec(self.header, HDR_CMDID_SHIFT, HDR_CMDID_WIDTH) as u16
    }

    pub fn token(&self) -> u16 {
        dec(self.header, HDR_TOKEN_SHIFT, HDR_TOKEN_WIDTH) as u16
    }

    pub fn raw_status(&self) -> u8 {
        dec(self.header, HDR_STATUS_SHIFT, HDR_STATUS_WIDTH) as u8
    }

    pub fn status(&self) -> McStatus {
        McStatus::from(self.raw_status())
    }

    /// Replaces the status field, keeping the rest of the header.
    pub fn set_status(&mut self, status: u8) {
        let mask = field_mask(HDR_STATUS_WIDTH) << HDR_STATUS_SHIFT;
        self.header = (self.header & !mask) | enc(HDR_STATUS_SHIFT, HDR_STATUS_WIDTH, u64::from(status));
    }

    /// Header value with the given status, as the firmware writes it back.
    pub fn header_with_status(header: u64, status: u8) -> u64 {
        let mask = field_mask(HDR_STATUS_WIDTH) << HDR_STATUS_SHIFT;
        (header & !mask) | enc(HDR_STATUS_SHIFT, HDR_STATUS_WIDTH, u64::from(status))
    }

    pub fn status_of(header: u64) -> u8 {
        dec(header, HDR_STATUS_SHIFT, HDR_STATUS_WIDTH) as u8
    }
}

/// Packs up to 16 bytes of an object type name (`"dpni"`, `"dpmac"`) into two parameter words,
/// little-endian byte order, NUL padded.
pub fn pack_name(name: &str) -> [u64; 2] {
    let mut bytes = [0u8; 16];
    for (slot, byte) in bytes.iter_mut().zip(name.bytes()) {
        *slot = byte;
    }
    let mut low = [0u8; 8];
    let mut high = [0u8; 8];
    low.copy_from_slice(&bytes[..8]);
    high.copy_from_slice(&bytes[8..]);
    [u64::from_le_bytes(low), u64::from_le_bytes(high)]
}

/// Reverses [`pack_name`], returning the name bytes up to the first NUL.
pub fn unpack_name(words: [u64; 2]) -> ([u8; 16], usize) {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&words[0].to_le_bytes());
    bytes[8..].copy_from_slice(&words[1].to_le_bytes());
    let length = bytes.iter().position(|&b| b == 0).unwrap_or(16);
    (bytes, length)
}

/// Packs a MAC address into six bytes of a parameter word starting at `first_offset`, last address
/// byte in the lowest bits.
pub fn pack_mac(mac: &[u8; 6], first_offset: u32) -> u64 {
    mac.iter().rev().enumerate().fold(0, |acc, (i, byte)| acc | enc(first_offset + 8 * i as u32, 8, u64::from(*byte)))
}

pub fn unpack_mac(param: u64, first_offset: u32) -> [u8; 6] {
    let mut mac = [0u8; 6];
    for (i, byte) in mac.iter_mut().rev().enumerate() {
        *byte = dec(param, first_offset + 8 * i as u32, 8) as u8;
    }
    mac
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_layout() {
        let command = McCommand::new(0x805, MC_CMD_FLAG_PRI, 0x3FF);
        assert_eq!(command.header >> 52, 0x805);
        assert_eq!((command.header >> 38) & 0x3FF, 0x3FF);
        assert_eq!((command.header >> 16) & 0xFF, 1);
        assert_ne!(command.header & (1 << 15), 0);
        assert_eq!(command.cmd_id(), 0x805);
        assert_eq!(command.token(), 0x3FF);
        assert_eq!(command.status(), McStatus::Ready);
    }

    #[test]
    fn test_status_update_keeps_header() {
        let mut command = McCommand::new(0x123, 0, 7);
        command.set_status(McStatus::ConfigError as u8);
        assert_eq!(command.cmd_id(), 0x123);
        assert_eq!(command.token(), 7);
        assert_eq!(command.status(), McStatus::ConfigError);
        assert_eq!(McStatus::from(0x42), McStatus::Unknown);
    }

    #[test]
    fn test_param_fields() {
        let command = McCommand::new(1, 0, 0).with(0, 0, 32, 0xDEAD_BEEF).with(0, 32, 16, 0xFFFF_1234).with(6, 63, 1, 1);
        assert_eq!(command.params[0], 0x0000_1234_DEAD_BEEF);
        assert_eq!(command.get(0, 32, 16), 0x1234);
        assert_eq!(command.params[6], 1 << 63);
    }

    #[test]
    fn test_name_and_mac_packing() {
        let words = pack_name("dpmac");
        let (bytes, length) = unpack_name(words);
        assert_eq!(&bytes[..length], b"dpmac");

        let mac = [0x02, 0x11, 0x22, 0x33, 0x44, 0x55];
        let packed = pack_mac(&mac, 16);
        assert_eq!(dec(packed, 16, 8), 0x55);
        assert_eq!(dec(packed, 56, 8), 0x02);
        assert_eq!(unpack_mac(packed, 16), mac);
    }
}

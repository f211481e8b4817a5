//! Reader for the log the MC firmware keeps in its private DRAM.
//!
//! The firmware writes a header at a fixed offset of its DRAM block and appends text to a circular
//! buffer described by that header. The reader never writes to the buffer.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::{
    string::{String, ToString},
    vec,
    vec::Vec,
};

use crate::hal::Hal;

pub const MC_LOG_MAGIC: u32 = 0x4D43_0100;

const HEADER_MAGIC: u64 = 0x00;
const HEADER_BUF_START: u64 = 0x08;
const HEADER_BUF_LENGTH: u64 = 0x0C;
const HEADER_LAST_BYTE: u64 = 0x10;
/// Bytes of the log header, starting at the configured log offset.
pub const MC_LOG_HEADER_SIZE: u64 = HEADER_LAST_BYTE + 4;

pub const LOG_WRAPPED: u32 = 0x8000_0000;
const LOG_POSITION_MASK: u32 = !LOG_WRAPPED;

/// Number of lines dumped after a failed MC command.
pub const MC_LOG_TAIL_LINES: usize = 10;

/// Most bytes taken from the buffer by one read; older text is skipped.
pub const MC_LOG_READ_LIMIT: u32 = 0x1_0000;

/// Location of a validated MC log.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct McLog {
    dram_base: u64,
    dram_size: u64,
    header: u64,
}

impl McLog {
    /// Checks the header magic and that the header and its buffer lie inside the `dram_size` bytes
    /// of private DRAM. A bad header is logged and yields `None`; the MC stays usable but its log
    /// cannot be read.
    pub fn locate<H: Hal + ?Sized>(hal: &H, dram_base: u64, dram_size: u64, header_offset: u64) -> Option<Self> {
        if header_offset.saturating_add(MC_LOG_HEADER_SIZE) > dram_size {
            log::warn!(target: "mc", "MC log header offset {:#x} is outside private DRAM", header_offset);
            return None;
        }
        let header = dram_base + header_offset;
        let magic = hal.read32(header + HEADER_MAGIC);
        if magic != MC_LOG_MAGIC {
            log::warn!(target: "mc", "MC log header at {:#x} has magic {:#010x}, log unavailable", header, magic);
            return None;
        }

        let start = u64::from(hal.read32(header + HEADER_BUF_START));
        let length = u64::from(hal.read32(header + HEADER_BUF_LENGTH));
        if start + length > dram_size {
            log::warn!(
                target: "mc",
                "MC log buffer {:#x}+{:#x} is outside private DRAM, log unavailable",
                start,
                length
            );
            return None;
        }
        Some(Self { dram_base, dram_size, header })
    }

    /// Current write position inside the buffer and whether it has wrapped.
    pub fn position<H: Hal + ?Sized>(&self, hal: &H) -> (u32, bool) {
        let last = hal.read32(self.header + HEADER_LAST_BYTE);
        (last & LOG_POSITION_MASK, last & LOG_WRAPPED != 0)
    }

    /// Buffer address and length, clamped to private DRAM since the firmware may rewrite the header.
    fn buffer<H: Hal + ?Sized>(&self, hal: &H) -> (u64, u32) {
        let offset = u64::from(hal.read32(self.header + HEADER_BUF_START)).min(self.dram_size);
        let length = u64::from(hal.read32(self.header + HEADER_BUF_LENGTH)).min(self.dram_size - offset);
        (self.dram_base + offset, length as u32)
    }

    fn read_range<H: Hal + ?Sized>(&self, hal: &H, from: u32, to: u32) -> Vec<u8> {
        let (start, _) = self.buffer(hal);
        let mut bytes = vec![0u8; to.saturating_sub(from) as usize];
        hal.read_bytes(start + u64::from(from), &mut bytes);
        bytes
    }

    /// Reads `[from, length)` followed by `[0, position)`, keeping at most [`MC_LOG_READ_LIMIT`]
    /// of the newest bytes.
    fn read_wrapped<H: Hal + ?Sized>(&self, hal: &H, from: Option<u32>, length: u32, position: u32) -> Vec<u8> {
        let recent = position.saturating_sub(MC_LOG_READ_LIMIT);
        let mut bytes = Vec::new();
        if let Some(from) = from {
            let budget = MC_LOG_READ_LIMIT - (position - recent);
            bytes.extend(self.read_range(hal, from.max(length.saturating_sub(budget)), length));
        }
        bytes.extend(self.read_range(hal, recent, position));
        bytes
    }

    /// Everything currently held in the buffer, oldest byte first, up to [`MC_LOG_READ_LIMIT`]
    /// bytes.
    pub fn contents<H: Hal + ?Sized>(&self, hal: &H) -> Vec<u8> {
        let (_, length) = self.buffer(hal);
        let (position, wrapped) = self.position(hal);
        let position = position.min(length);
        self.read_wrapped(hal, wrapped.then_some(position), length, position)
    }

    /// The last `count` complete lines of the log.
    pub fn tail<H: Hal + ?Sized>(&self, hal: &H, count: usize) -> Vec<String> {
        let contents = self.contents(hal);
        let lines = split_lines(&contents);
        let skip = lines.len().saturating_sub(count);
        lines.into_iter().skip(skip).collect()
    }

    /// Emits the last `count` lines at error level.
    pub fn dump_tail<H: Hal + ?Sized>(&self, hal: &H, count: usize) {
        log::error!(target: "mc", "MC log tail:");
        for line in self.tail(hal, count) {
            log::error!(target: "mc", "  {}", line);
        }
    }

    /// Lines written since `cursor`, advancing `cursor` to the current position.
    ///
    /// If the firmware wrapped more than once since the last call the oldest lines are lost.
    pub fn read_new<H: Hal + ?Sized>(&self, hal: &H, cursor: &mut u32) -> Vec<String> {
        let (_, length) = self.buffer(hal);
        let (position, _) = self.position(hal);
        let position = position.min(length);
        let bytes = if position >= *cursor {
            self.read_range(hal, (*cursor).max(position.saturating_sub(MC_LOG_READ_LIMIT)), position)
        } else {
            self.read_wrapped(hal, Some(*cursor), length, position)
        };
        *cursor = position;
        split_lines(&bytes)
    }
}

fn split_lines(bytes: &[u8]) -> Vec<String> {
    bytes
        .split(|&b| b == b'\n')
        .map(|line| String::from_utf8_lossy(line).trim_end_matches(['\r', '\0']).to_string())
        .filter(|line| !line.is_empty())
        .collect()
}

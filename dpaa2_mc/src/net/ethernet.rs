//! Ethernet II framing used by the polled datapath.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Destination, source and ethertype.
pub const ETH_HEADER_SIZE: usize = 14;
pub const ETH_ALEN: usize = 6;
pub const BROADCAST_MAC: [u8; ETH_ALEN] = [0xFF; ETH_ALEN];

pub const ETHERTYPE_IPV4: u16 = 0x0800;
pub const ETHERTYPE_ARP: u16 = 0x0806;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct EthernetHeader {
    pub destination: [u8; ETH_ALEN],
    pub source: [u8; ETH_ALEN],
    pub ethertype: u16,
}

impl EthernetHeader {
    pub fn to_bytes(&self) -> [u8; ETH_HEADER_SIZE] {
        let mut bytes = [0u8; ETH_HEADER_SIZE];
        bytes[..6].copy_from_slice(&self.destination);
        bytes[6..12].copy_from_slice(&self.source);
        bytes[12..].copy_from_slice(&self.ethertype.to_be_bytes());
        bytes
    }

    /// Decodes the header at the start of `frame`; `None` for runt frames.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < ETH_HEADER_SIZE {
            return None;
        }
        let mut header = Self::default();
        header.destination.copy_from_slice(&frame[..6]);
        header.source.copy_from_slice(&frame[6..12]);
        header.ethertype = u16::from_be_bytes([frame[12], frame[13]]);
        Some(header)
    }

    pub fn is_broadcast(&self) -> bool {
        self.destination == BROADCAST_MAC
    }
}

/// Result of a successful receive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReceivedFrame {
    /// Bytes copied into the caller's buffer.
    pub length: usize,
    /// Length of the frame on the wire; larger than `length` when the buffer was too small.
    pub frame_length: usize,
    /// Size of the link-layer header at the start of the frame.
    pub header_size: usize,
    pub header: EthernetHeader,
}

impl ReceivedFrame {
    pub fn truncated(&self) -> bool {
        self.length < self.frame_length
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_bytes() {
        let header = EthernetHeader {
            destination: BROADCAST_MAC,
            source: [0x02, 0, 0, 0, 0, 1],
            ethertype: ETHERTYPE_ARP,
        };
        let bytes = header.to_bytes();
        assert_eq!(&bytes[12..], &[0x08, 0x06]);
        assert_eq!(EthernetHeader::parse(&bytes), Some(header));
        assert!(header.is_broadcast());
        assert_eq!(EthernetHeader::parse(&bytes[..13]), None);
    }
}

//! Frame, enqueue and pull descriptors and decoded dequeue responses.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use super::codec::{decode_u64, dqrr, encode_u64, enqueue, pull, CacheLine};

/// Size of a frame descriptor in bytes.
pub const FD_SIZE: usize = 32;

const FD_BPID_MASK: u32 = 0x3FFF;
const FD_OFFSET_SHIFT: u32 = 16;
const FD_OFFSET_MASK: u32 = 0x0FFF;
const FD_FORMAT_SHIFT: u32 = 28;
const FD_FORMAT_MASK: u32 = 0x3;

/// CTRL bits requested on transmit: software annotation present, pass annotation, pass frame
/// annotation value.
pub const FD_CTRL_ASAL: u32 = 0x0002_0000;
pub const FD_CTRL_PTA: u32 = 0x0080_0000;
pub const FD_CTRL_PTV1: u32 = 0x0040_0000;

/// Frame format stored in the FD.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Single = 0,
    ScatterGather = 2,
}

/// Hardware frame descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FrameDescriptor {
    pub addr: u64,
    pub len: u32,
    /// Buffer pool id, data offset and format.
    pub bpid_offset: u32,
    pub frc: u32,
    pub ctrl: u32,
    pub flc: u64,
}

impl FrameDescriptor {
    /// A single-buffer frame of `len` bytes starting `offset` bytes into the buffer at `addr`.
    pub fn single(addr: u64, len: u32, bpid: u16, offset: u16) -> Self {
        let mut fd = Self { addr, len, ..Default::default() };
        fd.set_bpid(bpid);
        fd.set_offset(offset);
        fd
    }

    pub fn bpid(&self) -> u16 {
        (self.bpid_offset & FD_BPID_MASK) as u16
    }

    pub fn set_bpid(&mut self, bpid: u16) {
        self.bpid_offset = (self.bpid_offset & !FD_BPID_MASK) | (u32::from(bpid) & FD_BPID_MASK);
    }

    pub fn offset(&self) -> u16 {
        ((self.bpid_offset >> FD_OFFSET_SHIFT) & FD_OFFSET_MASK) as u16
    }

    pub fn set_offset(&mut self, offset: u16) {
        let mask = FD_OFFSET_MASK << FD_OFFSET_SHIFT;
        self.bpid_offset = (self.bpid_offset & !mask) | ((u32::from(offset) & FD_OFFSET_MASK) << FD_OFFSET_SHIFT);
    }

    pub fn format(&self) -> FrameFormat {
        match (self.bpid_offset >> FD_FORMAT_SHIFT) & FD_FORMAT_MASK {
            2 => FrameFormat::ScatterGather,
            _ => FrameFormat::Single,
        }
    }

    /// Writes the descriptor into eight consecutive words starting at `word`.
    pub fn store(&self, line: &mut CacheLine, word: usize) {
        encode_u64(line, word, self.addr);
        line[word + 2] = self.len;
        line[word + 3] = self.bpid_offset;
        line[word + 4] = self.frc;
        line[word + 5] = self.ctrl;
        encode_u64(line, word + 6, self.flc);
    }

    pub fn load(line: &CacheLine, word: usize) -> Self {
        Self {
            addr: decode_u64(line, word),
            len: line[word + 2],
            bpid_offset: line[word + 3],
            frc: line[word + 4],
            ctrl: line[word + 5],
            flc: decode_u64(line, word + 6),
        }
    }
}

/// What the hardware reports back for an enqueue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueResponse {
    Always = 1,
    RejectsToFq = 2,
}

/// Enqueue command options.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EnqueueDescriptor {
    response: EnqueueResponse,
    qdid: u32,
    qd_bin: u16,
    qd_pri: u8,
}

impl EnqueueDescriptor {
    /// Enqueue without order restoration to queuing destination `qdid`, bin `qd_bin`, priority
    /// `qd_pri`. Successful enqueues are only reported when `respond_success` is set.
    pub fn no_orp(respond_success: bool, qdid: u32, qd_bin: u16, qd_pri: u8) -> Self {
        let response = if respond_success { EnqueueResponse::Always } else { EnqueueResponse::RejectsToFq };
        Self { response, qdid, qd_bin, qd_pri }
    }

    pub fn qdid(&self) -> u32 {
        self.qdid
    }

    /// Encodes everything but the valid bit into `line`.
    pub fn store(&self, line: &mut CacheLine) {
        enqueue::CMD.encode(line, self.response as u32);
        enqueue::ORP_EN.encode(line, 0);
        enqueue::QD_EN.encode(line, 1);
        enqueue::TGT_ID.encode(line, self.qdid);
        enqueue::QD_BIN.encode(line, u32::from(self.qd_bin));
        enqueue::QD_PRI.encode(line, u32::from(self.qd_pri));
    }
}

/// Maximum frames one volatile dequeue may request.
pub const PULL_MAX_FRAMES: u8 = 16;

const PULL_DT_FRAMEQUEUE: u32 = 2;

/// Volatile dequeue command from a frame queue into the DQRR.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PullDescriptor {
    fqid: u32,
    num_frames: u8,
    token: u8,
}

impl PullDescriptor {
    /// Pulls `num_frames` (1 to 16, clamped) from frame queue `fqid`. Responses echo `token`.
    pub fn frame_queue(fqid: u32, num_frames: u8, token: u8) -> Self {
        Self { fqid, num_frames: num_frames.clamp(1, PULL_MAX_FRAMES), token }
    }

    pub fn token(&self) -> u8 {
        self.token
    }

    pub fn num_frames(&self) -> u8 {
        self.num_frames
    }

    pub fn store(&self, line: &mut CacheLine) {
        pull::DCT.encode(line, 0);
        pull::DT.encode(line, PULL_DT_FRAMEQUEUE);
        pull::RLS.encode(line, 0);
        pull::STASH.encode(line, 0);
        pull::NUMFRAMES.encode(line, u32::from(self.num_frames - 1));
        pull::TOKEN.encode(line, u32::from(self.token));
        pull::DQSOURCE.encode(line, self.fqid);
    }
}

/// Response verb of a dequeue result, valid bit masked.
pub const RESULT_DQ: u8 = 0x60;
pub const RESPONSE_VERB_MASK: u8 = 0x7F;

/// Dequeue response status flags.
pub const STAT_FQEMPTY: u8 = 0x80;
pub const STAT_HELDACTIVE: u8 = 0x40;
pub const STAT_FORCEELIGIBLE: u8 = 0x20;
pub const STAT_VALIDFRAME: u8 = 0x10;
pub const STAT_ODPVALID: u8 = 0x04;
pub const STAT_VOLATILE: u8 = 0x02;
pub const STAT_EXPIRED: u8 = 0x01;

/// A decoded DQRR entry. `index` is the ring slot it was read from and is what consumption
/// hands back to the hardware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DqrrEntry {
    pub index: u8,
    pub verb: u8,
    pub stat: u8,
    pub seqnum: u16,
    pub fqid: u32,
    pub frame_count: u32,
    pub token: u8,
    pub fd: FrameDescriptor,
}

impl DqrrEntry {
    pub fn decode(index: u8, line: &CacheLine) -> Self {
        Self {
            index,
            verb: dqrr::VERB.decode(line) as u8,
            stat: dqrr::STAT.decode(line) as u8,
            seqnum: dqrr::SEQNUM.decode(line) as u16,
            fqid: dqrr::FQID.decode(line),
            frame_count: dqrr::FRAME_COUNT.decode(line),
            token: dqrr::TOKEN.decode(line) as u8,
            fd: FrameDescriptor::load(line, dqrr::FD_WORD),
        }
    }

    pub fn is_dequeue_result(&self) -> bool {
        self.verb & RESPONSE_VERB_MASK == RESULT_DQ
    }

    pub fn has_valid_frame(&self) -> bool {
        self.stat & STAT_VALIDFRAME != 0
    }

    pub fn is_fq_empty(&self) -> bool {
        self.stat & STAT_FQEMPTY != 0
    }

    /// The last response of a volatile dequeue; after it a new pull may be issued.
    pub fn is_volatile_final(&self) -> bool {
        self.stat & (STAT_VOLATILE | STAT_EXPIRED) == (STAT_VOLATILE | STAT_EXPIRED)
    }
}

/// Frame annotation status written by the hardware after the software annotation area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameAnnotationStatus(pub u32);

impl FrameAnnotationStatus {
    /// Byte offset of the status word inside the hardware annotation.
    pub const STATUS_OFFSET: u64 = 4;

    pub const DISC: u32 = 0x8000_0000;
    pub const MS: u32 = 0x4000_0000;
    pub const KSE: u32 = 0x0004_0000;
    pub const EOFHE: u32 = 0x0002_0000;
    pub const MNLE: u32 = 0x0001_0000;
    pub const TIDE: u32 = 0x0000_8000;
    pub const PIEE: u32 = 0x0000_4000;
    pub const FLE: u32 = 0x0000_2000;
    pub const FPE: u32 = 0x0000_1000;
    pub const PTE: u32 = 0x0000_0080;
    pub const ISP: u32 = 0x0000_0040;
    pub const PHE: u32 = 0x0000_0020;
    pub const BLE: u32 = 0x0000_0010;
    pub const L3CE: u32 = 0x0000_0004;
    pub const L4CE: u32 = 0x0000_0001;

    pub const RX_ERR_MASK: u32 = Self::DISC
        | Self::KSE
        | Self::EOFHE
        | Self::MNLE
        | Self::TIDE
        | Self::PIEE
        | Self::FLE
        | Self::FPE
        | Self::PTE
        | Self::ISP
        | Self::PHE
        | Self::BLE
        | Self::L3CE
        | Self::L4CE;
    pub const RX_UNSUPP_MASK: u32 = Self::MS;

    pub fn errors(&self) -> u32 {
        self.0 & Self::RX_ERR_MASK
    }

    pub fn unsupported(&self) -> u32 {
        self.0 & Self::RX_UNSUPP_MASK
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::qbman::codec::CACHELINE_WORDS;

    #[test]
    fn test_frame_descriptor_fields() {
        let mut fd = FrameDescriptor::single(0x8_0000_1000, 64, 0x1ABC, 0x120);
        assert_eq!(fd.bpid(), 0x1ABC);
        assert_eq!(fd.offset(), 0x120);
        assert_eq!(fd.format(), FrameFormat::Single);

        fd.set_bpid(7);
        assert_eq!(fd.offset(), 0x120);
        fd.bpid_offset |= 2 << FD_FORMAT_SHIFT;
        assert_eq!(fd.format(), FrameFormat::ScatterGather);
        assert_eq!(fd.bpid(), 7);
    }

    #[test]
    fn test_frame_descriptor_placement() {
        let fd = FrameDescriptor {
            addr: 0x1122_3344_5566_7788,
            len: 9,
            bpid_offset: 3,
            frc: 4,
            ctrl: FD_CTRL_ASAL | FD_CTRL_PTA,
            flc: 0xAB,
        };
        let mut line = [0u32; CACHELINE_WORDS];
        fd.store(&mut line, 8);
        assert_eq!(line[8], 0x5566_7788);
        assert_eq!(line[9], 0x1122_3344);
        assert_eq!(line[10], 9);
        assert_eq!(line[13], FD_CTRL_ASAL | FD_CTRL_PTA);
        assert!(line[..8].iter().all(|w| *w == 0));
        assert_eq!(FrameDescriptor::load(&line, 8), fd);
    }

    #[test]
    fn test_enqueue_descriptor_layout() {
        let mut line = [0u32; CACHELINE_WORDS];
        EnqueueDescriptor::no_orp(false, 0x12_3456, 3, 0).store(&mut line);
        assert_eq!(line[0] & 0xFF, 0x2 | 0x10);
        assert_eq!(line[2], 0x12_3456);
        assert_eq!(line[4], 3);
    }

    #[test]
    fn test_pull_descriptor_layout_and_clamp() {
        let mut line = [0u32; CACHELINE_WORDS];
        let desc = PullDescriptor::frame_queue(0x44, 1, 0xAB);
        desc.store(&mut line);
        assert_eq!(pull::DT.decode(&line), 2);
        assert_eq!(pull::NUMFRAMES.decode(&line), 0);
        assert_eq!(pull::TOKEN.decode(&line), 0xAB);
        assert_eq!(pull::DQSOURCE.decode(&line), 0x44);

        assert_eq!(PullDescriptor::frame_queue(1, 40, 0).num_frames(), 16);
        assert_eq!(PullDescriptor::frame_queue(1, 0, 0).num_frames(), 1);
    }

    #[test]
    fn test_dqrr_entry_flags() {
        let mut line = [0u32; CACHELINE_WORDS];
        dqrr::VERB.encode(&mut line, u32::from(RESULT_DQ | 0x80));
        dqrr::STAT.encode(&mut line, u32::from(STAT_FQEMPTY | STAT_VOLATILE | STAT_EXPIRED));
        dqrr::FQID.encode(&mut line, 77);
        let entry = DqrrEntry::decode(5, &line);
        assert!(entry.is_dequeue_result());
        assert!(entry.is_fq_empty());
        assert!(entry.is_volatile_final());
        assert!(!entry.has_valid_frame());
        assert_eq!(entry.fqid, 77);
        assert_eq!(entry.index, 5);
    }

    #[test]
    fn test_annotation_masks() {
        let status = FrameAnnotationStatus(FrameAnnotationStatus::L4CE | FrameAnnotationStatus::MS | 0x0100_0000);
        assert_eq!(status.errors(), FrameAnnotationStatus::L4CE);
        assert_eq!(status.unsupported(), FrameAnnotationStatus::MS);
        assert_eq!(FrameAnnotationStatus(0).errors(), 0);
    }
}

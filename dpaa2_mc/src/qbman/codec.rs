//! Bit-field views over QBMan command and result cache lines.
//!
//! Every QBMan command, result and ring entry is one 64-byte cache line handled as sixteen 32-bit
//! words. A [`QbField`] names `width` bits at `shift` inside word `word`. The named fields of each
//! command live in the submodules below so call sites never spell raw triples.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Number of 32-bit words in one portal cache line.
pub const CACHELINE_WORDS: usize = 16;

/// One 64-byte command, result or ring entry.
pub type CacheLine = [u32; CACHELINE_WORDS];

/// Location of a bit field inside a [`CacheLine`].
///
/// `shift + width` must not exceed 32 and encoded values must fit in `width` bits. Neither is
/// checked at run time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QbField {
    word: usize,
    shift: u32,
    width: u32,
}

impl QbField {
    pub const fn new(word: usize, shift: u32, width: u32) -> Self {
        Self { word, shift, width }
    }

    pub const fn word(&self) -> usize {
        self.word
    }

    const fn mask(&self) -> u32 {
        if self.width >= 32 { u32::MAX } else { (1u32 << self.width) - 1 }
    }

    /// Extracts the field from `line`.
    #[inline]
    pub fn decode(&self, line: &CacheLine) -> u32 {
        (line[self.word] >> self.shift) & self.mask()
    }

    /// Writes `value` into the field, leaving every other bit of the word untouched.
    #[inline]
    pub fn encode(&self, line: &mut CacheLine, value: u32) {
        let mask = self.mask() << self.shift;
        line[self.word] = (line[self.word] & !mask) | ((value << self.shift) & mask);
    }
}

/// Stores a 64-bit value across words `word` (low half) and `word + 1` (high half).
#[inline]
pub fn encode_u64(line: &mut CacheLine, word: usize, value: u64) {
    line[word] = value as u32;
    line[word + 1] = (value >> 32) as u32;
}

/// Reads a 64-bit value stored by [`encode_u64`].
#[inline]
pub fn decode_u64(line: &CacheLine, word: usize) -> u64 {
    u64::from(line[word]) | (u64::from(line[word + 1]) << 32)
}

/// Fields shared by every command and result.
pub mod generic {
    use super::QbField;

    pub const VERB: QbField = QbField::new(0, 0, 7);
    pub const RSLT: QbField = QbField::new(0, 8, 8);
}

/// Buffer acquire management command and its result.
pub mod acquire {
    use super::QbField;

    pub const BPID: QbField = QbField::new(0, 16, 16);
    pub const NUM: QbField = QbField::new(1, 0, 3);
    /// First word of the returned buffer addresses.
    pub const BUFFERS_WORD: usize = 2;
}

/// Buffer release command written to the RCR.
pub mod release {
    use super::QbField;

    pub const NUM: QbField = QbField::new(0, 0, 3);
    pub const SET_ME: QbField = QbField::new(0, 5, 1);
    pub const BPID: QbField = QbField::new(0, 16, 16);
    pub const BUFFERS_WORD: usize = 2;
}

/// Enqueue descriptor written to the EQCR.
pub mod enqueue {
    use super::QbField;

    pub const CMD: QbField = QbField::new(0, 0, 2);
    pub const ORP_EN: QbField = QbField::new(0, 2, 1);
    pub const QD_EN: QbField = QbField::new(0, 4, 1);
    pub const TGT_ID: QbField = QbField::new(2, 0, 24);
    pub const QD_BIN: QbField = QbField::new(4, 0, 16);
    pub const QD_PRI: QbField = QbField::new(4, 16, 4);
    /// Word where the frame descriptor starts.
    pub const FD_WORD: usize = 8;
}

/// Volatile dequeue command written to the VDQCR.
pub mod pull {
    use super::QbField;

    pub const DCT: QbField = QbField::new(0, 0, 2);
    pub const DT: QbField = QbField::new(0, 2, 2);
    pub const RLS: QbField = QbField::new(0, 4, 1);
    pub const STASH: QbField = QbField::new(0, 5, 1);
    pub const NUMFRAMES: QbField = QbField::new(0, 8, 4);
    pub const TOKEN: QbField = QbField::new(0, 16, 8);
    pub const DQSOURCE: QbField = QbField::new(1, 0, 24);
}

/// Dequeue response ring entry.
pub mod dqrr {
    use super::QbField;

    pub const VERB: QbField = QbField::new(0, 0, 8);
    pub const STAT: QbField = QbField::new(0, 8, 8);
    pub const SEQNUM: QbField = QbField::new(0, 16, 16);
    pub const FQID: QbField = QbField::new(2, 0, 24);
    pub const FRAME_COUNT: QbField = QbField::new(4, 0, 24);
    pub const TOKEN: QbField = QbField::new(4, 24, 8);
    pub const FD_WORD: usize = 8;
}

#[cfg(test)]
mod tests {
    use super::*;

    const ALL_FIELDS: &[QbField] = &[
        generic::VERB,
        generic::RSLT,
        acquire::BPID,
        acquire::NUM,
        release::NUM,
        release::SET_ME,
        release::BPID,
        enqueue::CMD,
        enqueue::ORP_EN,
        enqueue::QD_EN,
        enqueue::TGT_ID,
        enqueue::QD_BIN,
        enqueue::QD_PRI,
        pull::DCT,
        pull::DT,
        pull::RLS,
        pull::STASH,
        pull::NUMFRAMES,
        pull::TOKEN,
        pull::DQSOURCE,
        dqrr::VERB,
        dqrr::STAT,
        dqrr::SEQNUM,
        dqrr::FQID,
        dqrr::FRAME_COUNT,
        dqrr::TOKEN,
        QbField::new(5, 0, 32),
    ];

    #[test]
    fn test_encode_is_read_back_and_leaves_other_bits() {
        for field in ALL_FIELDS {
            let max = field.mask();
            for value in [0, 1, max / 2, max] {
                for background in [0u32, u32::MAX, 0xA5A5_5A5A] {
                    let mut line = [background; CACHELINE_WORDS];
                    field.encode(&mut line, value);
                    assert_eq!(field.decode(&line), value, "{:?} value {:#x}", field, value);

                    let outside = !(max << field.shift);
                    assert_eq!(line[field.word()] & outside, background & outside, "{:?} bled", field);
                    for (index, word) in line.iter().enumerate() {
                        if index != field.word() {
                            assert_eq!(*word, background);
                        }
                    }
                }
            }
        }
    }

    #[test]
    fn test_oversized_value_is_clipped_to_field() {
        let mut line = [0u32; CACHELINE_WORDS];
        release::NUM.encode(&mut line, 0xF);
        assert_eq!(line[0], 0x7);
    }

    #[test]
    fn test_u64_helpers() {
        let mut line = [0u32; CACHELINE_WORDS];
        encode_u64(&mut line, 2, 0x1234_5678_9ABC_DEF0);
        assert_eq!(line[2], 0x9ABC_DEF0);
        assert_eq!(line[3], 0x1234_5678);
        assert_eq!(decode_u64(&line, 2), 0x1234_5678_9ABC_DEF0);
    }
}

//! QBMan software portal.
//!
//! A software portal is a pair of MMIO windows: a cache-enabled (CENA) window holding the 64-byte
//! command and response ring slots, and a cache-inhibited (CINH) window holding the control
//! registers. Producer/consumer ownership of each ring slot is carried by a valid bit in the verb
//! byte that flips every time the ring wraps.
//!
//! The CENA window is accessed through [`Hal`] one word at a time. Commands are staged in a shadow
//! cache line and replayed with word 0 (the verb) written last, so the hardware never observes a
//! half-written command.
//!
//! Portal state sits behind a `spin::Mutex` and no task priority is raised while it is held. A
//! portal must not be used from an event callback that can interrupt another user of the same
//! portal, or the callback spins on the lock forever.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::sync::atomic::{AtomicI32, Ordering};

use r_efi::efi;
use spin::Mutex;

use super::{
    codec::{acquire, decode_u64, encode_u64, enqueue, generic, release, CacheLine, CACHELINE_WORDS},
    descriptor::{DqrrEntry, EnqueueDescriptor, FrameDescriptor, PullDescriptor},
};
use crate::{
    error::Result,
    hal::{poll_with_timeout, Hal, CACHE_LINE_SIZE},
};

/// CINH register offsets.
pub const CINH_EQAR: u64 = 0x8C0;
pub const CINH_DCAP: u64 = 0xAC0;
pub const CINH_SDQCR: u64 = 0xB00;
pub const CINH_RAR: u64 = 0xCC0;
pub const CINH_CFG: u64 = 0xD00;

/// CENA slot offsets.
pub const fn cena_eqcr(index: u8) -> u64 {
    (index as u64) << 6
}
pub const fn cena_dqrr(index: u8) -> u64 {
    0x200 + ((index as u64) << 6)
}
pub const fn cena_rcr(index: u8) -> u64 {
    0x400 + ((index as u64) << 6)
}
pub const CENA_CR: u64 = 0x600;
pub const fn cena_rr(valid_bit: u8) -> u64 {
    0x700 + ((valid_bit as u64) >> 1)
}
pub const CENA_VDQCR: u64 = 0x780;

/// Valid bit carried in the verb byte of every ring slot and in EQAR/RAR.
pub const VALID_BIT: u8 = 0x80;
/// EQAR/RAR bit set when a ring slot was reserved.
pub const ALLOC_SUCCESS: u32 = 0x100;
const ALLOC_INDEX_MASK: u32 = 0x7;

/// Depth of the dequeue response ring.
pub const QBMAN_DQRR_SIZE: u8 = 8;
/// Hardware limit of buffers per acquire or release.
pub const MAX_BUFFERS_PER_COMMAND: usize = 7;

/// Management command verbs and result codes.
pub const QBMAN_MC_ACQUIRE: u8 = 0x30;
pub const QBMAN_MC_RSLT_OK: u8 = 0xF0;

/// Polling interval and budget of every blocking portal operation.
pub const QBMAN_POLL_INTERVAL_US: u64 = 100;
pub const QBMAN_POLL_BUDGET_US: u64 = 2000;

const RELEASE_VERB: u32 = 1;

// SWP_CFG fields: DQRR max fill, ring modes, stashing and priority.
const fn swp_cfg(max_fill: u32, rpm: u32, dcm: u32, epm: u32, sp: u32, se: u32, dp: u32) -> u32 {
    (max_fill << 20) | (rpm << 12) | (dcm << 10) | (epm << 8) | (sp << 4) | (se << 3) | (dp << 2)
}

/// Management command state machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CommandState {
    CanStart,
    CanSubmit,
    CanPollResult,
}

#[derive(Debug)]
struct PortalState {
    shadow: CacheLine,
    mc_state: CommandState,
    mc_valid_bit: u8,
    dqrr_next_index: u8,
    dqrr_valid_bit: u8,
    vdq_valid_bit: u8,
    vdq_token: u8,
}

/// Software state of one QBMan portal owned by a DPIO object.
pub struct QbmanPortal<'a, H: Hal> {
    hal: &'a H,
    cena: u64,
    cinh: u64,
    state: Mutex<PortalState>,
    vdq_busy: AtomicI32,
}

impl<'a, H: Hal> QbmanPortal<'a, H> {
    /// Programs the portal configuration and disables static dequeues.
    ///
    /// Fails with `DEVICE_ERROR` when the configuration register reads back as zero, which is what
    /// an unpowered or unmapped portal returns.
    pub fn new(hal: &'a H, cena: u64, cinh: u64) -> Result<Self> {
        let portal = Self {
            hal,
            cena,
            cinh,
            state: Mutex::new(PortalState {
                shadow: [0; CACHELINE_WORDS],
                mc_state: CommandState::CanStart,
                mc_valid_bit: VALID_BIT,
                dqrr_next_index: 0,
                dqrr_valid_bit: VALID_BIT,
                vdq_valid_bit: VALID_BIT,
                vdq_token: 0,
            }),
            vdq_busy: AtomicI32::new(1),
        };

        let cfg = swp_cfg(u32::from(QBMAN_DQRR_SIZE), 3, 2, 3, 0, 0, 0);
        hal.write32(cinh + CINH_CFG, cfg);
        if hal.read32(cinh + CINH_CFG) == 0 {
            log::error!(target: "qbman", "portal at {:#x} did not accept its configuration", cinh);
            return Err(efi::Status::DEVICE_ERROR);
        }
        hal.write32(cinh + CINH_SDQCR, 0);

        log::debug!(target: "qbman", "portal ready: cena {:#x} cinh {:#x}", cena, cinh);
        Ok(portal)
    }

    pub fn command_state(&self) -> CommandState {
        self.state.lock().mc_state
    }

    /// Ring slot the next dequeue response is expected in, and the valid bit it must carry.
    pub fn dqrr_cursor(&self) -> (u8, u8) {
        let state = self.state.lock();
        (state.dqrr_next_index, state.dqrr_valid_bit)
    }

    fn read_cena(&self, offset: u64) -> CacheLine {
        let address = self.cena + offset;
        self.hal.clean_dcache_range(address, CACHE_LINE_SIZE as usize);
        let mut line = [0u32; CACHELINE_WORDS];
        for (index, word) in line.iter_mut().enumerate() {
            *word = self.hal.read32(address + 4 * index as u64);
        }
        line
    }

    fn write_cena(&self, offset: u64, line: &CacheLine) {
        let address = self.cena + offset;
        self.hal.data_memory_barrier();
        for (index, word) in line.iter().enumerate().skip(1) {
            self.hal.write32(address + 4 * index as u64, *word);
        }
        self.hal.data_memory_barrier();
        self.hal.write32(address, line[0]);
        self.hal.data_memory_barrier();
        self.hal.clean_dcache_range(address, CACHE_LINE_SIZE as usize);
    }

    /// Claims the management command slot and returns a zeroed command to fill in.
    ///
    /// Returns `None` if a command is already in flight.
    pub fn cmd_start(&self) -> Option<CacheLine> {
        let mut state = self.state.lock();
        if state.mc_state != CommandState::CanStart {
            log::error!(target: "qbman", "management command started in state {:?}", state.mc_state);
            return None;
        }
        state.shadow = [0; CACHELINE_WORDS];
        state.mc_state = CommandState::CanSubmit;
        Some(state.shadow)
    }

    /// Hands a filled command to the hardware, stamping `verb` and the current valid bit.
    pub fn cmd_submit(&self, command: &CacheLine, verb: u8) -> bool {
        let mut state = self.state.lock();
        if state.mc_state != CommandState::CanSubmit {
            log::error!(target: "qbman", "management command submitted in state {:?}", state.mc_state);
            return false;
        }
        state.shadow = *command;
        generic::VERB.encode(&mut state.shadow, u32::from(verb));
        state.shadow[0] |= u32::from(state.mc_valid_bit);
        self.write_cena(CENA_CR, &state.shadow);
        state.mc_state = CommandState::CanPollResult;
        true
    }

    /// Checks for the response to the submitted command.
    pub fn cmd_result(&self) -> Option<CacheLine> {
        let mut state = self.state.lock();
        if state.mc_state != CommandState::CanPollResult {
            return None;
        }
        let line = self.read_cena(cena_rr(state.mc_valid_bit));
        if (line[0] & 0xFF) & !u32::from(VALID_BIT) == 0 {
            return None;
        }
        state.mc_valid_bit ^= VALID_BIT;
        state.mc_state = CommandState::CanStart;
        Some(line)
    }

    /// Submits a command and busy-waits for its response.
    ///
    /// On timeout the state machine is forced back to `CanStart` and `None` is returned.
    pub fn cmd_submit_and_wait(&self, command: &CacheLine, verb: u8) -> Option<CacheLine> {
        if !self.cmd_submit(command, verb) {
            return None;
        }
        let result = poll_with_timeout(self.hal, QBMAN_POLL_INTERVAL_US, QBMAN_POLL_BUDGET_US, || self.cmd_result());
        if result.is_none() {
            log::error!(target: "qbman", "management command {:#x} timed out", verb);
            self.state.lock().mc_state = CommandState::CanStart;
        }
        result
    }

    /// Acquires up to `buffers.len()` (at most 7) buffers from pool `bpid`.
    ///
    /// Returns how many addresses were written to the front of `buffers`; zero on failure.
    pub fn acquire_buffers(&self, bpid: u16, buffers: &mut [u64]) -> usize {
        let requested = buffers.len().min(MAX_BUFFERS_PER_COMMAND);
        if requested == 0 {
            return 0;
        }
        let Some(mut command) = self.cmd_start() else {
            return 0;
        };
        acquire::BPID.encode(&mut command, u32::from(bpid));
        acquire::NUM.encode(&mut command, requested as u32);

        let Some(result) = self.cmd_submit_and_wait(&command, QBMAN_MC_ACQUIRE) else {
            log::error!(target: "qbman", "acquire from pool {} got no response", bpid);
            return 0;
        };

        let verb = generic::VERB.decode(&result) as u8;
        let rslt = generic::RSLT.decode(&result) as u8;
        if verb != QBMAN_MC_ACQUIRE || rslt != QBMAN_MC_RSLT_OK {
            log::error!(target: "qbman", "acquire from pool {} failed: verb {:#x} result {:#x}", bpid, verb, rslt);
            return 0;
        }

        let acquired = (acquire::NUM.decode(&result) as usize).min(requested);
        for (index, slot) in buffers.iter_mut().take(acquired).enumerate() {
            *slot = decode_u64(&result, acquire::BUFFERS_WORD + 2 * index);
        }
        acquired
    }

    /// Releases 1 to 7 buffers to pool `bpid`.
    ///
    /// Returns `false` without side effects when the count is out of range or the release ring is
    /// full; the caller retries.
    pub fn release_buffers(&self, bpid: u16, buffers: &[u64]) -> bool {
        if buffers.is_empty() || buffers.len() > MAX_BUFFERS_PER_COMMAND {
            log::error!(target: "qbman", "cannot release {} buffers in one command", buffers.len());
            return false;
        }
        let rar = self.hal.read32(self.cinh + CINH_RAR);
        if rar & ALLOC_SUCCESS == 0 {
            return false;
        }

        let mut state = self.state.lock();
        let mut line = [0u32; CACHELINE_WORDS];
        release::BPID.encode(&mut line, u32::from(bpid));
        release::SET_ME.encode(&mut line, RELEASE_VERB);
        release::NUM.encode(&mut line, buffers.len() as u32);
        for (index, buffer) in buffers.iter().enumerate() {
            encode_u64(&mut line, release::BUFFERS_WORD + 2 * index, *buffer);
        }
        line[0] |= rar & u32::from(VALID_BIT);
        state.shadow = line;
        self.write_cena(cena_rcr((rar & ALLOC_INDEX_MASK) as u8), &state.shadow);
        true
    }

    /// Places one frame on the enqueue ring. Returns `false` when the ring is full.
    pub fn enqueue(&self, descriptor: &EnqueueDescriptor, fd: &FrameDescriptor) -> bool {
        let eqar = self.hal.read32(self.cinh + CINH_EQAR);
        if eqar & ALLOC_SUCCESS == 0 {
            return false;
        }

        let mut state = self.state.lock();
        let mut line = [0u32; CACHELINE_WORDS];
        descriptor.store(&mut line);
        fd.store(&mut line, enqueue::FD_WORD);
        line[0] |= eqar & u32::from(VALID_BIT);
        state.shadow = line;
        self.write_cena(cena_eqcr((eqar & ALLOC_INDEX_MASK) as u8), &state.shadow);
        true
    }

    /// Issues a volatile dequeue. Returns `false` while a previous pull is still outstanding.
    pub fn pull(&self, descriptor: &PullDescriptor) -> bool {
        if self.vdq_busy.fetch_sub(1, Ordering::SeqCst) != 1 {
            self.vdq_busy.fetch_add(1, Ordering::SeqCst);
            return false;
        }

        let mut state = self.state.lock();
        state.vdq_token = descriptor.token();
        let mut line = [0u32; CACHELINE_WORDS];
        descriptor.store(&mut line);
        line[0] |= u32::from(state.vdq_valid_bit);
        state.vdq_valid_bit ^= VALID_BIT;
        state.shadow = line;
        self.write_cena(CENA_VDQCR, &state.shadow);
        true
    }

    /// Returns the next unseen DQRR entry, if the hardware has produced one.
    ///
    /// Every entry returned must be handed to [`QbmanPortal::consume_dqrr_entry`] exactly once.
    pub fn next_dqrr_entry(&self) -> Option<DqrrEntry> {
        let mut state = self.state.lock();
        let index = state.dqrr_next_index;
        let line = self.read_cena(cena_dqrr(index));
        if (line[0] as u8) & VALID_BIT != state.dqrr_valid_bit {
            return None;
        }

        state.dqrr_next_index = (index + 1) & (QBMAN_DQRR_SIZE - 1);
        if state.dqrr_next_index == 0 {
            state.dqrr_valid_bit ^= VALID_BIT;
        }

        let entry = DqrrEntry::decode(index, &line);
        if entry.is_dequeue_result() && entry.is_volatile_final() {
            if entry.token != state.vdq_token {
                log::warn!(target: "qbman", "volatile dequeue token {:#x}, expected {:#x}", entry.token, state.vdq_token);
            }
            self.vdq_busy.fetch_add(1, Ordering::SeqCst);
        }
        Some(entry)
    }

    /// Returns a DQRR slot to the hardware.
    pub fn consume_dqrr_entry(&self, entry: &DqrrEntry) {
        self.hal.write32(self.cinh + CINH_DCAP, u32::from(entry.index));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        qbman::descriptor::{STAT_FQEMPTY, STAT_VALIDFRAME},
        sim::SimHal,
    };

    const BPID: u16 = 9;
    const FQID: u32 = 0x40;
    const QDID: u32 = 0x41;

    fn setup() -> (SimHal, u64, u64) {
        let hal = SimHal::new();
        let (cena, cinh) = hal.add_qbman_portal();
        hal.add_pool(BPID);
        hal.add_frame_queue(FQID);
        hal.route_qdid(QDID, FQID);
        (hal, cena, cinh)
    }

    #[test]
    fn test_init_fails_on_dead_portal() {
        let hal = SimHal::new();
        let (cena, cinh) = hal.qbman_portal_addresses(5);
        assert_eq!(QbmanPortal::new(&hal, cena, cinh).err(), Some(efi::Status::DEVICE_ERROR));
    }

    #[test]
    fn test_command_state_machine_rejects_second_start() {
        let (hal, cena, cinh) = setup();
        let portal = QbmanPortal::new(&hal, cena, cinh).unwrap();

        let command = portal.cmd_start().unwrap();
        assert_eq!(portal.command_state(), CommandState::CanSubmit);
        assert!(portal.cmd_start().is_none());
        assert!(portal.cmd_result().is_none());

        assert!(portal.cmd_submit(&command, QBMAN_MC_ACQUIRE));
        assert_eq!(portal.command_state(), CommandState::CanPollResult);
        assert!(portal.cmd_start().is_none());
        assert!(!portal.cmd_submit(&command, QBMAN_MC_ACQUIRE));

        hal.stall(QBMAN_POLL_INTERVAL_US);
        assert!(portal.cmd_result().is_some());
        assert_eq!(portal.command_state(), CommandState::CanStart);
        assert!(portal.cmd_start().is_some());
    }

    #[test]
    fn test_submit_and_wait_timeout_resets_state() {
        let (hal, cena, cinh) = setup();
        let portal = QbmanPortal::new(&hal, cena, cinh).unwrap();
        hal.set_qbman_commands_hang(true);

        let command = portal.cmd_start().unwrap();
        let start = hal.elapsed_us();
        assert!(portal.cmd_submit_and_wait(&command, QBMAN_MC_ACQUIRE).is_none());
        assert_eq!(hal.elapsed_us() - start, QBMAN_POLL_BUDGET_US);
        assert_eq!(portal.command_state(), CommandState::CanStart);
    }

    #[test]
    fn test_release_then_acquire() {
        let (hal, cena, cinh) = setup();
        let portal = QbmanPortal::new(&hal, cena, cinh).unwrap();

        let buffers: Vec<u64> = (0..7).map(|i| 0x10_0000 + i * 0x800).collect();
        assert!(portal.release_buffers(BPID, &buffers));
        hal.stall(1);
        assert_eq!(hal.pool_len(BPID), 7);

        let mut out = [0u64; 3];
        assert_eq!(portal.acquire_buffers(BPID, &mut out), 3);
        assert_eq!(out.to_vec(), buffers[..3].to_vec());
        assert_eq!(hal.pool_len(BPID), 4);

        let mut many = [0u64; 12];
        assert_eq!(portal.acquire_buffers(BPID, &mut many), 4);
        assert_eq!(portal.acquire_buffers(BPID, &mut many), 0);
    }

    #[test]
    fn test_acquire_never_exceeds_request_or_limit() {
        let (hal, cena, cinh) = setup();
        let portal = QbmanPortal::new(&hal, cena, cinh).unwrap();
        for batch in 0..4u64 {
            let buffers: Vec<u64> = (0..7).map(|i| 0x20_0000 + (batch * 7 + i) * 0x800).collect();
            assert!(portal.release_buffers(BPID, &buffers));
            hal.stall(1);
        }

        for requested in 0..=10usize {
            let mut out = vec![0u64; requested];
            let got = portal.acquire_buffers(BPID, &mut out);
            assert!(got <= requested && got <= MAX_BUFFERS_PER_COMMAND, "requested {} got {}", requested, got);
            if got > 0 {
                assert!(portal.release_buffers(BPID, &out[..got]));
                hal.stall(1);
            }
        }
        assert_eq!(hal.pool_len(BPID), 28);
    }

    #[test]
    fn test_release_rejects_bad_counts() {
        let (hal, cena, cinh) = setup();
        let portal = QbmanPortal::new(&hal, cena, cinh).unwrap();
        assert!(!portal.release_buffers(BPID, &[]));
        assert!(!portal.release_buffers(BPID, &[0x1000; 8]));
        hal.stall(1);
        assert_eq!(hal.pool_len(BPID), 0);
    }

    #[test]
    fn test_release_reports_full_ring() {
        let (hal, cena, cinh) = setup();
        let portal = QbmanPortal::new(&hal, cena, cinh).unwrap();
        hal.set_rings_full(true);
        assert!(!portal.release_buffers(BPID, &[0x1000]));
        assert!(!portal.enqueue(&EnqueueDescriptor::no_orp(false, QDID, 0, 0), &FrameDescriptor::default()));
        hal.set_rings_full(false);
        assert!(portal.release_buffers(BPID, &[0x1000]));
    }

    #[test]
    fn test_pull_is_exclusive_until_final_response() {
        let (hal, cena, cinh) = setup();
        let portal = QbmanPortal::new(&hal, cena, cinh).unwrap();

        assert!(portal.pull(&PullDescriptor::frame_queue(FQID, 1, 1)));
        assert!(!portal.pull(&PullDescriptor::frame_queue(FQID, 1, 2)));
        hal.stall(1);

        let entry = portal.next_dqrr_entry().unwrap();
        assert!(entry.is_fq_empty());
        assert!(!entry.has_valid_frame());
        assert_eq!(entry.token, 1);
        portal.consume_dqrr_entry(&entry);

        assert!(portal.pull(&PullDescriptor::frame_queue(FQID, 1, 3)));
    }

    #[test]
    fn test_enqueue_and_dequeue_frame() {
        let (hal, cena, cinh) = setup();
        let portal = QbmanPortal::new(&hal, cena, cinh).unwrap();
        let fd = FrameDescriptor::single(0x30_0000, 60, BPID, 128);

        assert!(portal.enqueue(&EnqueueDescriptor::no_orp(false, QDID, 0, 0), &fd));
        hal.stall(1);
        assert!(portal.pull(&PullDescriptor::frame_queue(FQID, 1, 5)));
        hal.stall(1);

        let entry = portal.next_dqrr_entry().unwrap();
        assert!(entry.has_valid_frame());
        assert!(entry.stat & STAT_FQEMPTY != 0);
        assert_eq!(entry.fqid, FQID);
        assert_eq!(entry.fd, fd);
        portal.consume_dqrr_entry(&entry);
        assert_eq!(entry.stat & STAT_VALIDFRAME, STAT_VALIDFRAME);
    }

    #[test]
    fn test_dqrr_entries_are_returned_once_and_valid_bit_flips_per_wrap() {
        let (hal, cena, cinh) = setup();
        let portal = QbmanPortal::new(&hal, cena, cinh).unwrap();

        let mut seen_slots = Vec::new();
        let mut toggles = 0;
        let (_, mut last_vb) = portal.dqrr_cursor();

        for round in 0..u32::from(QBMAN_DQRR_SIZE) * 2 {
            assert!(portal.pull(&PullDescriptor::frame_queue(FQID, 1, round as u8)));
            assert!(portal.next_dqrr_entry().is_none());
            hal.stall(1);

            let entry = portal.next_dqrr_entry().unwrap();
            assert!(portal.next_dqrr_entry().is_none(), "slot {} returned twice", entry.index);
            portal.consume_dqrr_entry(&entry);
            seen_slots.push(entry.index);

            let (_, vb) = portal.dqrr_cursor();
            if vb != last_vb {
                toggles += 1;
                last_vb = vb;
            }
            if round == u32::from(QBMAN_DQRR_SIZE) - 1 {
                assert_eq!(toggles, 1);
            }
        }

        assert_eq!(toggles, 2);
        let expected: Vec<u8> = (0..QBMAN_DQRR_SIZE).chain(0..QBMAN_DQRR_SIZE).collect();
        assert_eq!(seen_slots, expected);
    }
}

//! Network interfaces built from MC objects.
//!
//! [`NetworkInterface::create`] builds a child container holding a buffer pool (DPBP), a QBMan
//! portal (DPIO) and a network interface object (DPNI). [`NetworkInterface::initialize`] binds a
//! physical MAC (DPMAC), configures queues and buffer layouts, seeds the pool and brings the link
//! up. [`NetworkInterface::shutdown`] and [`NetworkInterface::destroy`] undo the two phases.
//!
//! Every phase records a teardown step for each resource it acquires. On failure the recorded
//! steps run in reverse, so a failed phase leaves nothing behind.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use alloc::vec::Vec;

use r_efi::efi;

use super::ethernet::{EthernetHeader, ReceivedFrame, BROADCAST_MAC, ETH_HEADER_SIZE};
use crate::{
    error::{status_name, Result},
    hal::{poll_with_timeout, Hal},
    mc::{
        dpbp::{self, DpbpAttributes},
        dpio::{self, ChannelMode, DpioAttributes, DpioConfig},
        dpmac::{self, LinkState},
        dpni::{self, BufferLayout, DpniConfig, ExtendedConfig, LayoutKind, PoolConfig},
        dprc::{self, ChildContainer, ConnectionConfig, ContainerConfig, Endpoint},
        fixup::MacDisplay,
        io::McIo,
        object, ManagementComplex,
    },
    qbman::{
        descriptor::{FD_CTRL_ASAL, FD_CTRL_PTA, FD_CTRL_PTV1},
        DqrrEntry, EnqueueDescriptor, FrameAnnotationStatus, FrameDescriptor, PullDescriptor, QbmanPortal,
        MAX_BUFFERS_PER_COMMAND, QBMAN_POLL_BUDGET_US, QBMAN_POLL_INTERVAL_US,
    },
};

/// Buffers seeded into the pool by `initialize`.
pub const DPAA2_ETH_NUM_FRAME_BUFFERS: usize = 49;
pub const DPAA2_ETH_FRAME_BUFFER_SIZE: u64 = 2048;
pub const DPAA2_ETH_BUFFER_ALIGN: u64 = 64;
/// Software annotation reserved at the start of every buffer.
pub const DPAA2_ETH_PRIVATE_DATA_SIZE: u16 = 64;
pub const DPAA2_ETH_DATA_ALIGN: u16 = 64;

const DPIO_NUM_PRIORITIES: u8 = 8;
const DPNI_MAX_MAC_FILTERS: u8 = 16;
const PAGE_SIZE: u64 = 0x1000;

const RX_PULL_TOKEN: u8 = 0x1;
const TX_CONF_PULL_TOKEN: u8 = 0x2;

const fn page_align(size: u64) -> u64 {
    (size + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

/// One undo action, recorded as the matching resource is acquired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Teardown {
    CloseObject(u16),
    DestroyDpbp { parent: u16, id: u32 },
    DestroyDpio { parent: u16, id: u32 },
    DestroyDpni { parent: u16, id: u32 },
    DestroyDpmac { parent: u16, id: u32 },
    DisableDpbp(u16),
    DisableDpio(u16),
    DisableDpni(u16),
    Disconnect { parent: u16, dpni_id: u32 },
    DrainPool { bpid: u16 },
    FreePages { address: u64, size: u64 },
}

impl Teardown {
    fn run<H: Hal>(self, io: &McIo<'_, H>, portal: Option<&QbmanPortal<'_, H>>) -> Result<()> {
        match self {
            Teardown::CloseObject(token) => object::close(io, token),
            Teardown::DestroyDpbp { parent, id } => dpbp::destroy(io, parent, id),
            Teardown::DestroyDpio { parent, id } => dpio::destroy(io, parent, id),
            Teardown::DestroyDpni { parent, id } => dpni::destroy(io, parent, id),
            Teardown::DestroyDpmac { parent, id } => dpmac::destroy(io, parent, id),
            Teardown::DisableDpbp(token) => dpbp::disable(io, token),
            Teardown::DisableDpio(token) => dpio::disable(io, token),
            Teardown::DisableDpni(token) => dpni::disable(io, token),
            Teardown::Disconnect { parent, dpni_id } => {
                dprc::disconnect(io, parent, &Endpoint { object_type: "dpni", id: dpni_id, interface_id: 0 })
            }
            Teardown::DrainPool { bpid } => {
                if let Some(portal) = portal {
                    drain_pool(portal, bpid);
                }
                Ok(())
            }
            Teardown::FreePages { address, size } => {
                io.hal().free_pages(address, size);
                Ok(())
            }
        }
    }
}

/// Runs `steps` newest first. Returns false if any step failed; the rest still run.
fn unwind<H: Hal>(io: &McIo<'_, H>, portal: Option<&QbmanPortal<'_, H>>, steps: &mut Vec<Teardown>) -> bool {
    let mut clean = true;
    while let Some(step) = steps.pop() {
        if let Err(status) = step.run(io, portal) {
            log::warn!(target: "net", "teardown step {:?} failed: {}", step, status_name(status));
            clean = false;
        }
    }
    clean
}

/// Acquires from `bpid` until the pool reports empty and returns how many buffers came out.
fn drain_pool<H: Hal>(portal: &QbmanPortal<'_, H>, bpid: u16) -> usize {
    let mut drained = 0;
    let mut batch = [0u64; MAX_BUFFERS_PER_COMMAND];
    loop {
        let count = portal.acquire_buffers(bpid, &mut batch);
        if count == 0 {
            break;
        }
        drained += count;
    }
    log::debug!(target: "net", "drained {} buffers from pool {}", drained, bpid);
    drained
}

/// Queue and buffer parameters of a started interface.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Datapath {
    /// Physical MAC the interface is bound to.
    pub mac_id: u32,
    pub dpmac_id: u32,
    pub mac_address: [u8; 6],
    pub rx_fqid: u32,
    pub tx_flow_id: u16,
    pub tx_conf_fqid: u32,
    pub qdid: u16,
    /// Offset of frame data inside a Tx buffer.
    pub tx_data_offset: u16,
    pub mtu: u16,
    /// Base of the contiguous region the pool buffers were carved from.
    pub buffer_region: u64,
}

/// A DPNI-backed network interface in a child container of the root container.
///
/// There is no `Drop`: an interface dropped without [`NetworkInterface::destroy`] leaves its MC
/// objects and buffer region allocated.
pub struct NetworkInterface<'a, H: Hal> {
    mc: &'a ManagementComplex<'a, H>,
    io: McIo<'a, H>,
    portal: QbmanPortal<'a, H>,
    container: ChildContainer,
    container_token: u16,
    dpbp: DpbpAttributes,
    dpbp_token: u16,
    dpio: DpioAttributes,
    dpni_id: u32,
    dpni_token: u16,
    teardown: Vec<Teardown>,
    started: Option<(Datapath, Vec<Teardown>)>,
}

struct Created<'a, H: Hal> {
    portal: QbmanPortal<'a, H>,
    container_token: u16,
    dpbp: DpbpAttributes,
    dpbp_token: u16,
    dpio: DpioAttributes,
    dpni_id: u32,
    dpni_token: u16,
}

impl<'a, H: Hal> NetworkInterface<'a, H> {
    /// Creates the child container and its DPBP, DPIO and DPNI.
    ///
    /// Any failure destroys everything created so far and returns `DEVICE_ERROR`.
    pub fn create(mc: &'a ManagementComplex<'a, H>) -> Result<Self> {
        let hal = mc.hal();
        let container =
            dprc::create_container(mc.root_io(), mc.root_token(), &ContainerConfig::default()).map_err(|status| {
                log::error!(target: "net", "cannot create child container: {}", status_name(status));
                efi::Status::DEVICE_ERROR
            })?;
        let io = McIo::new(hal, mc.config().mc_portal_address(container.portal_id), mc.log());

        let mut teardown = Vec::new();
        match Self::create_objects(mc, &io, container, &mut teardown) {
            Ok(created) => {
                log::info!(
                    target: "net",
                    "interface created: container {} dpbp {} (bpid {}) dpio {} dpni {}",
                    container.id,
                    created.dpbp.id,
                    created.dpbp.bpid,
                    created.dpio.id,
                    created.dpni_id
                );
                Ok(Self {
                    mc,
                    io,
                    portal: created.portal,
                    container,
                    container_token: created.container_token,
                    dpbp: created.dpbp,
                    dpbp_token: created.dpbp_token,
                    dpio: created.dpio,
                    dpni_id: created.dpni_id,
                    dpni_token: created.dpni_token,
                    teardown,
                    started: None,
                })
            }
            Err(status) => {
                log::error!(target: "net", "interface creation failed: {}, rolling back", status_name(status));
                unwind(&io, None, &mut teardown);
                if let Err(status) = dprc::destroy_container(mc.root_io(), mc.root_token(), container.id) {
                    log::warn!(target: "net", "cannot destroy container {}: {}", container.id, status_name(status));
                }
                Err(efi::Status::DEVICE_ERROR)
            }
        }
    }

    fn create_objects(
        mc: &'a ManagementComplex<'a, H>,
        io: &McIo<'a, H>,
        container: ChildContainer,
        teardown: &mut Vec<Teardown>,
    ) -> Result<Created<'a, H>> {
        let hal = mc.hal();

        let container_token = dprc::open(io, container.id)?;
        teardown.push(Teardown::CloseObject(container_token));

        let dpbp_id = dpbp::create(io, container_token)?;
        teardown.push(Teardown::DestroyDpbp { parent: container_token, id: dpbp_id });
        let dpbp_token = dpbp::open(io, dpbp_id)?;
        teardown.push(Teardown::CloseObject(dpbp_token));
        let dpbp = dpbp::get_attributes(io, dpbp_token)?;

        let dpio_config = DpioConfig { channel_mode: ChannelMode::LocalChannel, num_priorities: DPIO_NUM_PRIORITIES };
        let dpio_id = dpio::create(io, container_token, &dpio_config)?;
        teardown.push(Teardown::DestroyDpio { parent: container_token, id: dpio_id });
        let dpio_token = dpio::open(io, dpio_id)?;
        teardown.push(Teardown::CloseObject(dpio_token));
        dpio::enable(io, dpio_token)?;
        teardown.push(Teardown::DisableDpio(dpio_token));
        let dpio = dpio::get_attributes(io, dpio_token)?;

        let base = mc.config().qbman_portals_base;
        let portal =
            QbmanPortal::new(hal, base + dpio.qbman_portal_ce_offset, base + dpio.qbman_portal_ci_offset)?;

        let ext_cfg_size = page_align(dpni::EXT_CFG_SIZE as u64);
        let Some(ext_cfg) = hal.allocate_pages(ext_cfg_size, DPAA2_ETH_BUFFER_ALIGN) else {
            return Err(efi::Status::OUT_OF_RESOURCES);
        };
        hal.write_bytes(ext_cfg, &ExtendedConfig::default().prepare());
        hal.clean_dcache_range(ext_cfg, dpni::EXT_CFG_SIZE);
        let dpni_config = DpniConfig {
            mac_addr: [0; 6],
            max_tcs: 1,
            max_senders: 1,
            options: dpni::OPT_UNICAST_FILTER | dpni::OPT_MULTICAST_FILTER,
            max_unicast_filters: DPNI_MAX_MAC_FILTERS,
            max_multicast_filters: DPNI_MAX_MAC_FILTERS,
            ext_cfg_iova: ext_cfg,
        };
        let dpni_id = dpni::create(io, container_token, &dpni_config);
        hal.free_pages(ext_cfg, ext_cfg_size);
        let dpni_id = dpni_id?;
        teardown.push(Teardown::DestroyDpni { parent: container_token, id: dpni_id });
        let dpni_token = dpni::open(io, dpni_id)?;
        teardown.push(Teardown::CloseObject(dpni_token));

        Ok(Created { portal, container_token, dpbp, dpbp_token, dpio, dpni_id, dpni_token })
    }

    /// Always true: an interface value exists only while its objects exist in the MC.
    pub fn is_created(&self) -> bool {
        true
    }

    pub fn is_started(&self) -> bool {
        self.started.is_some()
    }

    pub fn container_id(&self) -> u32 {
        self.container.id
    }

    pub fn dpni_id(&self) -> u32 {
        self.dpni_id
    }

    /// Hardware buffer pool id feeding Rx and Tx.
    pub fn bpid(&self) -> u16 {
        self.dpbp.bpid
    }

    pub fn datapath(&self) -> Option<&Datapath> {
        self.started.as_ref().map(|(datapath, _)| datapath)
    }

    /// Binds physical MAC `mac_id`, configures the datapath and brings the link up.
    ///
    /// On failure everything this call set up is undone and the interface stays created but not
    /// started.
    pub fn initialize(&mut self, mac_id: u32, link: &LinkState) -> Result<()> {
        if self.started.is_some() {
            log::error!(target: "net", "interface on dpni {} already started", self.dpni_id);
            return Err(efi::Status::ALREADY_STARTED);
        }

        let mut teardown = Vec::new();
        match self.start(mac_id, link, &mut teardown) {
            Ok(datapath) => {
                log::info!(
                    target: "net",
                    "dpmac@{} up: {} mtu {} rx fq {:#x} qdid {}",
                    mac_id,
                    MacDisplay(&datapath.mac_address),
                    datapath.mtu,
                    datapath.rx_fqid,
                    datapath.qdid
                );
                self.started = Some((datapath, teardown));
                Ok(())
            }
            Err(status) => {
                log::error!(target: "net", "dpmac@{} bring-up failed: {}, rolling back", mac_id, status_name(status));
                unwind(&self.io, Some(&self.portal), &mut teardown);
                Err(status)
            }
        }
    }

    fn start(&self, mac_id: u32, link: &LinkState, teardown: &mut Vec<Teardown>) -> Result<Datapath> {
        let io = &self.io;
        let hal = self.mc.hal();
        let parent = self.container_token;
        let mac_address = self.mc.mac_address(mac_id);

        let dpmac_id = dpmac::create(io, parent, mac_id)?;
        teardown.push(Teardown::DestroyDpmac { parent, id: dpmac_id });
        let dpmac_token = dpmac::open(io, dpmac_id)?;
        teardown.push(Teardown::CloseObject(dpmac_token));

        dprc::connect(
            io,
            parent,
            &Endpoint { object_type: "dpmac", id: dpmac_id, interface_id: 0 },
            &Endpoint { object_type: "dpni", id: self.dpni_id, interface_id: 0 },
            &ConnectionConfig::default(),
        )?;
        teardown.push(Teardown::Disconnect { parent, dpni_id: self.dpni_id });

        let rx_layout = BufferLayout {
            options: dpni::BUF_LAYOUT_OPT_PARSER_RESULT
                | dpni::BUF_LAYOUT_OPT_FRAME_STATUS
                | dpni::BUF_LAYOUT_OPT_PRIVATE_DATA_SIZE
                | dpni::BUF_LAYOUT_OPT_DATA_ALIGN,
            pass_parser_result: true,
            pass_frame_status: true,
            private_data_size: DPAA2_ETH_PRIVATE_DATA_SIZE,
            data_align: DPAA2_ETH_DATA_ALIGN,
            ..Default::default()
        };
        dpni::set_buffer_layout(io, self.dpni_token, LayoutKind::Rx, &rx_layout)?;
        let tx_layout = BufferLayout {
            options: dpni::BUF_LAYOUT_OPT_FRAME_STATUS | dpni::BUF_LAYOUT_OPT_PRIVATE_DATA_SIZE,
            pass_frame_status: true,
            private_data_size: DPAA2_ETH_PRIVATE_DATA_SIZE,
            ..Default::default()
        };
        dpni::set_buffer_layout(io, self.dpni_token, LayoutKind::Tx, &tx_layout)?;
        let tx_conf_layout =
            BufferLayout { options: dpni::BUF_LAYOUT_OPT_FRAME_STATUS, pass_frame_status: true, ..Default::default() };
        dpni::set_buffer_layout(io, self.dpni_token, LayoutKind::TxConfirmation, &tx_conf_layout)?;

        let tx_data_offset = dpni::get_tx_data_offset(io, self.dpni_token)?;
        if u64::from(tx_data_offset) >= DPAA2_ETH_FRAME_BUFFER_SIZE {
            log::error!(target: "net", "Tx data offset {} leaves no room in a buffer", tx_data_offset);
            return Err(efi::Status::DEVICE_ERROR);
        }
        let pool = PoolConfig { dpbp_id: self.dpbp.id, buffer_size: DPAA2_ETH_FRAME_BUFFER_SIZE as u16 };
        dpni::set_pools(io, self.dpni_token, &[pool])?;

        let region_size = page_align(DPAA2_ETH_NUM_FRAME_BUFFERS as u64 * DPAA2_ETH_FRAME_BUFFER_SIZE);
        let Some(buffer_region) = hal.allocate_pages(region_size, DPAA2_ETH_BUFFER_ALIGN) else {
            log::error!(target: "net", "cannot allocate {} frame buffers", DPAA2_ETH_NUM_FRAME_BUFFERS);
            return Err(efi::Status::OUT_OF_RESOURCES);
        };
        teardown.push(Teardown::FreePages { address: buffer_region, size: region_size });

        dpbp::enable(io, self.dpbp_token)?;
        teardown.push(Teardown::DisableDpbp(self.dpbp_token));
        teardown.push(Teardown::DrainPool { bpid: self.dpbp.bpid });
        let buffers: Vec<u64> = (0..DPAA2_ETH_NUM_FRAME_BUFFERS as u64)
            .map(|index| buffer_region + index * DPAA2_ETH_FRAME_BUFFER_SIZE)
            .collect();
        for batch in buffers.chunks(MAX_BUFFERS_PER_COMMAND) {
            if !self.release_with_retry(batch) {
                log::error!(target: "net", "cannot seed pool {}", self.dpbp.bpid);
                return Err(efi::Status::DEVICE_ERROR);
            }
        }

        dpni::add_mac_addr(io, self.dpni_token, &mac_address)?;
        dpni::add_mac_addr(io, self.dpni_token, &BROADCAST_MAC)?;

        let rx_fqid = dpni::get_rx_flow_fqid(io, self.dpni_token, 0, 0)?;
        let tx_flow_id = dpni::set_tx_flow(io, self.dpni_token, dpni::NEW_FLOW_ID, false)?;
        let tx_conf_fqid = dpni::get_tx_conf_fqid(io, self.dpni_token, tx_flow_id)?;
        let qdid = dpni::get_qdid(io, self.dpni_token)?;

        dpni::enable(io, self.dpni_token)?;
        teardown.push(Teardown::DisableDpni(self.dpni_token));
        dpmac::set_link_state(io, dpmac_token, link)?;
        let mtu = dpni::get_mtu(io, self.dpni_token)?;

        Ok(Datapath {
            mac_id,
            dpmac_id,
            mac_address,
            rx_fqid,
            tx_flow_id,
            tx_conf_fqid,
            qdid,
            tx_data_offset,
            mtu,
            buffer_region,
        })
    }

    /// Stops the datapath: disables the DPNI, drops frames still queued for it, unbinds and
    /// destroys the DPMAC, drains and disables the pool and frees the buffers.
    pub fn shutdown(&mut self) -> Result<()> {
        let Some((datapath, mut teardown)) = self.started.take() else {
            log::error!(target: "net", "interface on dpni {} not started", self.dpni_id);
            return Err(efi::Status::NOT_STARTED);
        };
        // Queues are drained once the DPNI is disabled and before the buffer region is freed.
        let stop_at = match teardown.last() {
            Some(Teardown::DisableDpni(_)) => teardown.len() - 1,
            _ => teardown.len(),
        };
        let mut stop = teardown.split_off(stop_at);
        let mut clean = unwind(&self.io, Some(&self.portal), &mut stop);
        self.drain_queues(&datapath);
        clean &= unwind(&self.io, Some(&self.portal), &mut teardown);
        if clean {
            log::info!(target: "net", "dpmac@{} down", datapath.mac_id);
            Ok(())
        } else {
            Err(efi::Status::DEVICE_ERROR)
        }
    }

    /// Destroys the DPNI, DPIO, DPBP and the child container, shutting the datapath down first if
    /// it is still running.
    pub fn destroy(mut self) -> Result<()> {
        let mut clean = true;
        if self.started.is_some() {
            log::warn!(target: "net", "destroying a started interface, shutting it down first");
            clean &= self.shutdown().is_ok();
        }
        clean &= unwind(&self.io, Some(&self.portal), &mut self.teardown);
        if let Err(status) = dprc::destroy_container(self.mc.root_io(), self.mc.root_token(), self.container.id) {
            log::warn!(target: "net", "cannot destroy container {}: {}", self.container.id, status_name(status));
            clean = false;
        }
        if clean {
            log::info!(target: "net", "interface on container {} destroyed", self.container.id);
            Ok(())
        } else {
            Err(efi::Status::DEVICE_ERROR)
        }
    }

    fn running(&self) -> Result<&Datapath> {
        self.datapath().ok_or_else(|| {
            log::error!(target: "net", "interface on dpni {} not started", self.dpni_id);
            efi::Status::NOT_STARTED
        })
    }

    fn release_with_retry(&self, buffers: &[u64]) -> bool {
        let hal = self.mc.hal();
        poll_with_timeout(hal, QBMAN_POLL_INTERVAL_US, QBMAN_POLL_BUDGET_US, || {
            self.portal.release_buffers(self.dpbp.bpid, buffers).then_some(())
        })
        .is_some()
    }

    /// Sends one frame. With `header` the frame is the header followed by `payload`; without it
    /// `payload` is the whole frame.
    ///
    /// Returns the buffer address, which [`NetworkInterface::check_tx_completion`] reports once
    /// the hardware is done with it. `NOT_READY` means no buffer or no ring slot was available.
    pub fn transmit(&self, header: Option<&EthernetHeader>, payload: &[u8]) -> Result<u64> {
        let datapath = self.running()?;
        let hal = self.mc.hal();
        let header_size = header.map_or(0, |_| ETH_HEADER_SIZE);
        let frame_length = header_size + payload.len();
        let capacity = (DPAA2_ETH_FRAME_BUFFER_SIZE - u64::from(datapath.tx_data_offset)) as usize;
        if frame_length == 0 {
            return Err(efi::Status::INVALID_PARAMETER);
        }
        if frame_length > capacity || frame_length > usize::from(datapath.mtu) + ETH_HEADER_SIZE {
            log::error!(target: "net", "frame of {} bytes exceeds buffer or MTU", frame_length);
            return Err(efi::Status::BUFFER_TOO_SMALL);
        }

        let mut buffer = [0u64; 1];
        if self.portal.acquire_buffers(self.dpbp.bpid, &mut buffer) == 0 {
            log::debug!(target: "net", "no Tx buffer available");
            return Err(efi::Status::NOT_READY);
        }
        let address = buffer[0];

        let data = address + u64::from(datapath.tx_data_offset);
        if let Some(header) = header {
            hal.write_bytes(data, &header.to_bytes());
        }
        hal.write_bytes(data + header_size as u64, payload);
        hal.clean_dcache_range(address, datapath.tx_data_offset as usize + frame_length);

        let mut fd = FrameDescriptor::single(address, frame_length as u32, self.dpbp.bpid, datapath.tx_data_offset);
        fd.ctrl = FD_CTRL_ASAL | FD_CTRL_PTA | FD_CTRL_PTV1;
        let descriptor = EnqueueDescriptor::no_orp(false, u32::from(datapath.qdid), datapath.tx_flow_id, 0);
        let enqueued = poll_with_timeout(hal, QBMAN_POLL_INTERVAL_US, QBMAN_POLL_BUDGET_US, || {
            self.portal.enqueue(&descriptor, &fd).then_some(())
        });
        if enqueued.is_none() {
            log::warn!(target: "net", "Tx ring full, frame dropped");
            if !self.release_with_retry(&[address]) {
                log::error!(target: "net", "Tx buffer {:#x} lost", address);
            }
            return Err(efi::Status::NOT_READY);
        }

        log::trace!(target: "net", "sent {} bytes from {:#x}", frame_length, address);
        Ok(address)
    }

    /// Pulls one entry from `fqid`. `Ok(None)` means the queue was empty.
    fn dequeue(&self, fqid: u32, token: u8) -> Result<Option<FrameDescriptor>> {
        let hal = self.mc.hal();
        if !self.portal.pull(&PullDescriptor::frame_queue(fqid, 1, token)) {
            // The previous pull timed out; collect its response so the portal frees up.
            if let Some(stale) = self.portal.next_dqrr_entry() {
                self.portal.consume_dqrr_entry(&stale);
                self.recycle_stale(&stale);
            }
            return Err(efi::Status::NOT_READY);
        }

        let Some(entry) = poll_with_timeout(hal, QBMAN_POLL_INTERVAL_US, QBMAN_POLL_BUDGET_US, || {
            self.portal.next_dqrr_entry()
        }) else {
            return Err(efi::Status::NOT_READY);
        };
        self.portal.consume_dqrr_entry(&entry);

        if entry.has_valid_frame() {
            return Ok(Some(entry.fd));
        }
        if entry.is_fq_empty() {
            return Ok(None);
        }
        log::warn!(target: "net", "dequeue from fq {:#x} returned no frame, stat {:#x}", fqid, entry.stat);
        Err(efi::Status::DEVICE_ERROR)
    }

    /// Pulls every frame left on the Rx and Tx confirmation queues and returns how many were
    /// dropped.
    fn drain_queues(&self, datapath: &Datapath) -> usize {
        let mut dropped = 0;
        for (fqid, token) in [(datapath.rx_fqid, RX_PULL_TOKEN), (datapath.tx_conf_fqid, TX_CONF_PULL_TOKEN)] {
            for _ in 0..DPAA2_ETH_NUM_FRAME_BUFFERS {
                match self.dequeue(fqid, token) {
                    Ok(Some(_)) => dropped += 1,
                    _ => break,
                }
            }
        }
        if dropped > 0 {
            log::debug!(target: "net", "dropped {} queued frames on dpni {}", dropped, self.dpni_id);
        }
        dropped
    }

    fn recycle_stale(&self, entry: &DqrrEntry) {
        if entry.has_valid_frame() {
            log::warn!(target: "net", "late frame on fq {:#x} dropped", entry.fqid);
            if !self.release_with_retry(&[entry.fd.addr]) {
                log::error!(target: "net", "buffer {:#x} lost", entry.fd.addr);
            }
        }
    }

    /// Receives one frame into `buffer`, truncating if it does not fit.
    ///
    /// `NOT_READY` means no frame was waiting.
    pub fn receive(&self, buffer: &mut [u8]) -> Result<ReceivedFrame> {
        let datapath = self.running()?;
        let hal = self.mc.hal();
        let Some(fd) = self.dequeue(datapath.rx_fqid, RX_PULL_TOKEN)? else {
            return Err(efi::Status::NOT_READY);
        };

        let frame_length = fd.len as usize;
        let data = fd.addr + u64::from(fd.offset());
        hal.clean_dcache_range(fd.addr, usize::from(fd.offset()) + frame_length);

        let annotation = u64::from(DPAA2_ETH_PRIVATE_DATA_SIZE) + FrameAnnotationStatus::STATUS_OFFSET;
        let status = FrameAnnotationStatus(hal.read32(fd.addr + annotation));
        if status.errors() != 0 {
            log::warn!(target: "net", "Rx frame annotation reports errors {:#010x}", status.errors());
        }
        if status.unsupported() != 0 {
            log::warn!(target: "net", "Rx frame annotation reports unsupported features {:#010x}", status.unsupported());
        }

        let mut header_bytes = [0u8; ETH_HEADER_SIZE];
        let header_length = frame_length.min(ETH_HEADER_SIZE);
        hal.read_bytes(data, &mut header_bytes[..header_length]);
        let header = EthernetHeader::parse(&header_bytes[..header_length]).unwrap_or_default();

        let length = frame_length.min(buffer.len());
        if length < frame_length {
            log::warn!(target: "net", "Rx frame of {} bytes truncated to {}", frame_length, length);
        }
        hal.read_bytes(data, &mut buffer[..length]);

        if !self.release_with_retry(&[fd.addr]) {
            log::error!(target: "net", "Rx buffer {:#x} lost", fd.addr);
        }

        Ok(ReceivedFrame { length, frame_length, header_size: ETH_HEADER_SIZE, header })
    }

    /// Collects one Tx confirmation, returns its buffer to the pool and reports the address
    /// [`NetworkInterface::transmit`] returned for it.
    pub fn check_tx_completion(&self) -> Result<u64> {
        let datapath = self.running()?;
        let Some(fd) = self.dequeue(datapath.tx_conf_fqid, TX_CONF_PULL_TOKEN)? else {
            return Err(efi::Status::NOT_READY);
        };
        if !self.release_with_retry(&[fd.addr]) {
            log::error!(target: "net", "Tx buffer {:#x} lost", fd.addr);
        }
        Ok(fd.addr)
    }

    /// The DPIO backing this interface's portal.
    pub fn dpio(&self) -> &DpioAttributes {
        &self.dpio
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        mc::{command::McStatus, McBootSequencer},
        net::ethernet::ETHERTYPE_IPV4,
        sim::{self, SimHal},
    };

    fn boot(hal: &SimHal) -> ManagementComplex<'_, SimHal> {
        McBootSequencer::new(hal, hal.config()).boot().unwrap()
    }

    fn test_header(mc: &ManagementComplex<'_, SimHal>) -> EthernetHeader {
        EthernetHeader { destination: mc.mac_address(1), source: [0x02, 0xAA, 0xBB, 0xCC, 0xDD, 0xEE], ethertype: ETHERTYPE_IPV4 }
    }

    #[derive(Debug, PartialEq, Eq)]
    struct Footprint {
        objects: usize,
        tokens: usize,
        allocations: usize,
    }

    fn footprint(hal: &SimHal) -> Footprint {
        Footprint { objects: hal.mc_object_count(), tokens: hal.open_token_count(), allocations: hal.live_allocations() }
    }

    #[test]
    fn test_create_and_destroy_leave_nothing() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let before = footprint(&hal);

        let interface = NetworkInterface::create(&mc).unwrap();
        assert!(interface.is_created());
        assert!(!interface.is_started());
        assert_eq!(hal.mc_object_count(), before.objects + 4);
        assert_eq!(hal.dma_violations(), 0);

        interface.destroy().unwrap();
        assert_eq!(footprint(&hal), before);
    }

    #[test]
    fn test_create_rolls_back_on_every_failure() {
        let failing = [
            dprc::CMDID_CREATE_CONT,
            dprc::CMDID_OPEN,
            dpbp::CMDID_CREATE,
            dpbp::CMDID_OPEN,
            object::CMDID_GET_ATTR,
            dpio::CMDID_CREATE,
            dpio::CMDID_OPEN,
            object::CMDID_ENABLE,
            dpni::CMDID_CREATE,
            dpni::CMDID_OPEN,
        ];
        for cmd_id in failing {
            let hal = SimHal::with_images();
            let mc = boot(&hal);
            let before = footprint(&hal);

            hal.fail_next_command(cmd_id, McStatus::NoResource);
            let result = NetworkInterface::create(&mc);
            assert_eq!(result.err(), Some(efi::Status::DEVICE_ERROR), "command {:#x}", cmd_id);
            assert_eq!(footprint(&hal), before, "command {:#x}", cmd_id);
        }
    }

    #[test]
    fn test_create_fails_when_ext_cfg_not_flushed() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let before = footprint(&hal);
        hal.set_cache_maintenance_ignored(true);
        assert_eq!(NetworkInterface::create(&mc).err(), Some(efi::Status::DEVICE_ERROR));
        assert_eq!(footprint(&hal), before);
    }

    #[test]
    fn test_initialize_rolls_back_on_every_failure() {
        let failing = [
            dpmac::CMDID_CREATE,
            dpmac::CMDID_OPEN,
            dprc::CMDID_CONNECT,
            dpni::CMDID_SET_RX_BUFFER_LAYOUT,
            dpni::CMDID_SET_TX_BUFFER_LAYOUT,
            dpni::CMDID_SET_TX_CONF_BUFFER_LAYOUT,
            dpni::CMDID_GET_TX_DATA_OFFSET,
            dpni::CMDID_SET_POOLS,
            object::CMDID_ENABLE,
            dpni::CMDID_ADD_MAC_ADDR,
            dpni::CMDID_GET_RX_FLOW,
            dpni::CMDID_SET_TX_FLOW,
            dpni::CMDID_GET_TX_FLOW,
            dpni::CMDID_GET_QDID,
            dpmac::CMDID_SET_LINK_STATE,
            dpni::CMDID_GET_MTU,
        ];
        for cmd_id in failing {
            let hal = SimHal::with_images();
            let mc = boot(&hal);
            let mut interface = NetworkInterface::create(&mc).unwrap();
            let before = footprint(&hal);

            hal.fail_next_command(cmd_id, McStatus::ConfigError);
            assert_eq!(
                interface.initialize(1, &LinkState::default()),
                Err(efi::Status::DEVICE_ERROR),
                "command {:#x}",
                cmd_id
            );
            assert!(!interface.is_started());
            assert_eq!(footprint(&hal), before, "command {:#x}", cmd_id);
            assert_eq!(hal.pool_len(interface.bpid()), 0, "command {:#x}", cmd_id);
            assert!(!hal.dpni_enabled(interface.dpni_id()), "command {:#x}", cmd_id);

            interface.initialize(1, &LinkState::default()).unwrap();
            interface.destroy().unwrap();
        }
    }

    #[test]
    fn test_initialize_allocation_failure() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        let before = footprint(&hal);
        hal.set_allocation_limit(0);
        assert_eq!(interface.initialize(1, &LinkState::default()), Err(efi::Status::OUT_OF_RESOURCES));
        assert_eq!(footprint(&hal), before);
    }

    #[test]
    fn test_loopback_round_trip() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        interface.initialize(1, &LinkState::default()).unwrap();

        let datapath = *interface.datapath().unwrap();
        assert_eq!(datapath.mac_address, mc.mac_address(1));
        assert_eq!(hal.pool_len(interface.bpid()), DPAA2_ETH_NUM_FRAME_BUFFERS);
        assert!(hal.dpmac_link_up(datapath.dpmac_id));
        assert_eq!(hal.dpni_mac_filters(interface.dpni_id()), vec![mc.mac_address(1), BROADCAST_MAC]);

        let header = test_header(&mc);
        let payload: Vec<u8> = (0..50u8).collect();
        let sent_from = interface.transmit(Some(&header), &payload).unwrap();

        let mut buffer = [0u8; 2048];
        let frame = interface.receive(&mut buffer).unwrap();
        assert_eq!(frame.length, 64);
        assert_eq!(frame.frame_length, 64);
        assert!(!frame.truncated());
        assert_eq!(frame.header, header);
        assert_eq!(&buffer[..ETH_HEADER_SIZE], &header.to_bytes());
        assert_eq!(&buffer[ETH_HEADER_SIZE..64], &payload[..]);

        assert_eq!(interface.check_tx_completion(), Ok(sent_from));
        assert_eq!(interface.check_tx_completion(), Err(efi::Status::NOT_READY));
        assert_eq!(interface.receive(&mut buffer).err(), Some(efi::Status::NOT_READY));
        assert_eq!(hal.pool_len(interface.bpid()), DPAA2_ETH_NUM_FRAME_BUFFERS);
        assert_eq!(hal.dma_violations(), 0);
    }

    #[test]
    fn test_raw_frame_without_header() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        interface.initialize(2, &LinkState::default()).unwrap();

        let frame = EthernetHeader { destination: BROADCAST_MAC, ..test_header(&mc) }.to_bytes();
        interface.transmit(None, &frame).unwrap();
        let mut buffer = [0u8; 64];
        let received = interface.receive(&mut buffer).unwrap();
        assert_eq!(received.length, ETH_HEADER_SIZE);
        assert_eq!(&buffer[..ETH_HEADER_SIZE], &frame);
    }

    #[test]
    fn test_transmit_with_empty_pool() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        interface.initialize(1, &LinkState::default()).unwrap();

        let taken = hal.take_pool(interface.bpid());
        assert_eq!(taken.len(), DPAA2_ETH_NUM_FRAME_BUFFERS);
        let start = hal.elapsed_us();
        assert_eq!(interface.transmit(Some(&test_header(&mc)), &[0u8; 50]), Err(efi::Status::NOT_READY));
        assert!(hal.elapsed_us() - start <= QBMAN_POLL_BUDGET_US);
        assert_eq!(hal.pool_len(interface.bpid()), 0);

        hal.restore_pool(interface.bpid(), &taken);
        interface.transmit(Some(&test_header(&mc)), &[0u8; 50]).unwrap();
        interface.check_tx_completion().unwrap();
        let mut buffer = [0u8; 128];
        interface.receive(&mut buffer).unwrap();
        assert_eq!(hal.pool_len(interface.bpid()), DPAA2_ETH_NUM_FRAME_BUFFERS);
    }

    #[test]
    fn test_transmit_ring_full_returns_buffer() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        interface.initialize(1, &LinkState::default()).unwrap();

        hal.set_enqueue_ring_full(true);
        assert_eq!(interface.transmit(Some(&test_header(&mc)), &[0u8; 50]), Err(efi::Status::NOT_READY));
        hal.stall(1);
        assert_eq!(hal.pool_len(interface.bpid()), DPAA2_ETH_NUM_FRAME_BUFFERS);
    }

    #[test]
    fn test_oversized_frame() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        interface.initialize(1, &LinkState::default()).unwrap();
        let payload = vec![0u8; 1600];
        assert_eq!(interface.transmit(Some(&test_header(&mc)), &payload), Err(efi::Status::BUFFER_TOO_SMALL));
        assert_eq!(interface.transmit(None, &[]), Err(efi::Status::INVALID_PARAMETER));
        assert_eq!(hal.pool_len(interface.bpid()), DPAA2_ETH_NUM_FRAME_BUFFERS);
    }

    #[test]
    fn test_truncated_receive_and_annotation_errors() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        interface.initialize(1, &LinkState::default()).unwrap();

        sim::capture_logs();
        hal.set_rx_annotation_status(FrameAnnotationStatus::FLE);
        interface.transmit(Some(&test_header(&mc)), &[0x5A; 50]).unwrap();
        let mut small = [0u8; 20];
        let frame = interface.receive(&mut small).unwrap();
        assert_eq!(frame.length, 20);
        assert_eq!(frame.frame_length, 64);
        assert!(frame.truncated());
        assert_eq!(frame.header, test_header(&mc));
        assert_eq!(sim::captured_log_count("truncated"), 1);
        assert_eq!(sim::captured_log_count("reports errors"), 1);

        interface.check_tx_completion().unwrap();
        assert_eq!(hal.pool_len(interface.bpid()), DPAA2_ETH_NUM_FRAME_BUFFERS);
    }

    #[test]
    fn test_dequeue_without_frame_is_device_error() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        interface.initialize(1, &LinkState::default()).unwrap();

        hal.corrupt_next_dequeue();
        let mut buffer = [0u8; 64];
        assert_eq!(interface.receive(&mut buffer).err(), Some(efi::Status::DEVICE_ERROR));
        assert_eq!(interface.receive(&mut buffer).err(), Some(efi::Status::NOT_READY));
    }

    #[test]
    fn test_state_guards() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        let mut buffer = [0u8; 64];

        assert_eq!(interface.transmit(None, &[0u8; 60]), Err(efi::Status::NOT_STARTED));
        assert_eq!(interface.receive(&mut buffer).err(), Some(efi::Status::NOT_STARTED));
        assert_eq!(interface.check_tx_completion(), Err(efi::Status::NOT_STARTED));
        assert_eq!(interface.shutdown(), Err(efi::Status::NOT_STARTED));

        interface.initialize(1, &LinkState::default()).unwrap();
        assert_eq!(interface.initialize(1, &LinkState::default()), Err(efi::Status::ALREADY_STARTED));
    }

    #[test]
    fn test_shutdown_drains_pool_and_destroy_cleans_up() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let before = footprint(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        let created = footprint(&hal);

        interface.initialize(3, &LinkState::default()).unwrap();
        assert!(hal.dpbp_enabled(interface.bpid()));
        interface.shutdown().unwrap();
        assert!(!interface.is_started());
        assert_eq!(hal.pool_len(interface.bpid()), 0);
        assert!(!hal.dpbp_enabled(interface.bpid()));
        assert_eq!(footprint(&hal), created);

        interface.initialize(3, &LinkState::default()).unwrap();
        interface.destroy().unwrap();
        assert_eq!(footprint(&hal), before);
    }

    #[test]
    fn test_shutdown_drops_queued_frames() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut interface = NetworkInterface::create(&mc).unwrap();
        interface.initialize(1, &LinkState::default()).unwrap();
        let datapath = *interface.datapath().unwrap();

        interface.transmit(Some(&test_header(&mc)), &[0u8; 50]).unwrap();
        interface.transmit(Some(&test_header(&mc)), &[1u8; 50]).unwrap();
        assert_eq!(hal.frame_queue_len(datapath.rx_fqid), 2);
        assert_eq!(hal.frame_queue_len(datapath.tx_conf_fqid), 2);

        interface.shutdown().unwrap();
        assert_eq!(hal.frame_queue_len(datapath.rx_fqid), 0);
        assert_eq!(hal.frame_queue_len(datapath.tx_conf_fqid), 0);
        assert!(!hal.dpni_enabled(interface.dpni_id()));
        assert_eq!(hal.pool_len(interface.bpid()), 0);
        interface.destroy().unwrap();
    }

    #[test]
    fn test_two_interfaces_are_independent() {
        let hal = SimHal::with_images();
        let mc = boot(&hal);
        let mut first = NetworkInterface::create(&mc).unwrap();
        let mut second = NetworkInterface::create(&mc).unwrap();
        assert_ne!(first.container_id(), second.container_id());
        assert_ne!(first.bpid(), second.bpid());
        assert_ne!(first.dpio().qbman_portal_id, second.dpio().qbman_portal_id);

        first.initialize(1, &LinkState::default()).unwrap();
        second.initialize(2, &LinkState::default()).unwrap();
        first.transmit(Some(&test_header(&mc)), &[1u8; 50]).unwrap();
        let mut buffer = [0u8; 128];
        assert_eq!(second.receive(&mut buffer).err(), Some(efi::Status::NOT_READY));
        assert!(first.receive(&mut buffer).is_ok());

        first.destroy().unwrap();
        second.destroy().unwrap();
    }
}

//! [`Hal`] backed by identity-mapped MMIO and UEFI boot services.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!
use core::{ptr::NonNull, time::Duration};

use dpaa2_mc::{
    hal::mmio,
    mc::boot::MC_DRAM_BLOCK_GRANULE,
    Hal,
};
use uefi::boot::{self, AllocateType, MemoryType};

const EFI_PAGE_SIZE: u64 = 0x1000;

fn pages_for(size: u64) -> usize {
    size.div_ceil(EFI_PAGE_SIZE) as usize
}

pub struct UefiHal;

impl UefiHal {
    fn free_range(address: u64, pages: usize) {
        let Some(pointer) = NonNull::new(address as usize as *mut u8) else {
            return;
        };
        if let Err(err) = unsafe { boot::free_pages(pointer, pages) } {
            log::warn!(target: "dxe", "FreePages({:#x}, {}) failed: {:?}", address, pages, err.status());
        }
    }
}

impl Hal for UefiHal {
    fn read32(&self, address: u64) -> u32 {
        unsafe { mmio::read32(address) }
    }

    fn write32(&self, address: u64, value: u32) {
        unsafe { mmio::write32(address, value) }
    }

    fn read64(&self, address: u64) -> u64 {
        unsafe { mmio::read64(address) }
    }

    fn write64(&self, address: u64, value: u64) {
        unsafe { mmio::write64(address, value) }
    }

    fn read_bytes(&self, address: u64, buffer: &mut [u8]) {
        unsafe { mmio::read_bytes(address, buffer) }
    }

    fn write_bytes(&self, address: u64, data: &[u8]) {
        unsafe { mmio::write_bytes(address, data) }
    }

    fn data_memory_barrier(&self) {
        mmio::data_memory_barrier();
    }

    fn clean_dcache_range(&self, address: u64, length: usize) {
        mmio::clean_dcache_range(address, length);
    }

    fn stall(&self, micros: u64) {
        boot::stall(Duration::from_micros(micros));
    }

    /// Over-allocates by one alignment unit and returns the unaligned head and tail to the
    /// firmware. MC private DRAM must survive ExitBootServices, so granule aligned requests are
    /// carved from reserved memory.
    fn allocate_pages(&self, size: u64, alignment: u64) -> Option<u64> {
        let alignment = alignment.max(EFI_PAGE_SIZE);
        let pages = pages_for(size);
        let slack = if alignment > EFI_PAGE_SIZE { pages_for(alignment) } else { 0 };
        let memory_type =
            if alignment >= MC_DRAM_BLOCK_GRANULE { MemoryType::RESERVED } else { MemoryType::BOOT_SERVICES_DATA };

        let base = match boot::allocate_pages(AllocateType::AnyPages, memory_type, pages + slack) {
            Ok(pointer) => pointer.as_ptr() as u64,
            Err(err) => {
                log::error!(target: "dxe", "AllocatePages({} pages) failed: {:?}", pages + slack, err.status());
                return None;
            }
        };

        let aligned = base.next_multiple_of(alignment);
        let head = pages_for(aligned - base);
        if head > 0 {
            Self::free_range(base, head);
        }
        let tail = slack - head;
        if tail > 0 {
            Self::free_range(aligned + pages as u64 * EFI_PAGE_SIZE, tail);
        }

        unsafe { core::ptr::write_bytes(aligned as usize as *mut u8, 0, pages * EFI_PAGE_SIZE as usize) };
        Some(aligned)
    }

    fn free_pages(&self, address: u64, size: u64) {
        Self::free_range(address, pages_for(size));
    }
}

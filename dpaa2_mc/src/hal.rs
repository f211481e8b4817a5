//! Platform seam for register access, DMA memory, cache maintenance, delays and page allocation.
//!
//! All driver code reaches the hardware through [`Hal`]. Addresses are physical; the firmware
//! environment runs identity mapped, so [`mmio`] provides the volatile accessors a real platform
//! implementation forwards to.
//!
//! ## License
//!
//! Copyright (c) Microsoft Corporation.
//!
//! SPDX-License-Identifier: BSD-2-Clause-Patent
//!

/// Size of a data cache line on the supported SoCs.
pub const CACHE_LINE_SIZE: u64 = 64;

/// Platform services required by the DPAA2 drivers.
///
/// Implementations must perform MMIO accesses exactly once and in program order. Barrier and
/// cache maintenance calls are explicit in the drivers and must not be elided.
pub trait Hal {
    /// Reads a 32-bit little-endian device register.
    fn read32(&self, address: u64) -> u32;

    /// Writes a 32-bit little-endian device register.
    fn write32(&self, address: u64, value: u32);

    /// Reads a 64-bit little-endian device register.
    fn read64(&self, address: u64) -> u64;

    /// Writes a 64-bit little-endian device register.
    fn write64(&self, address: u64, value: u64);

    /// Copies `buffer.len()` bytes of physical memory starting at `address` into `buffer`.
    fn read_bytes(&self, address: u64, buffer: &mut [u8]);

    /// Copies `data` into physical memory starting at `address`.
    fn write_bytes(&self, address: u64, data: &[u8]);

    /// Orders all previous memory accesses before all subsequent ones, as observed by devices.
    fn data_memory_barrier(&self);

    /// Cleans and invalidates the data cache lines covering `[address, address + length)`.
    fn clean_dcache_range(&self, address: u64, length: usize);

    /// Busy-waits for at least `micros` microseconds.
    fn stall(&self, micros: u64);

    /// Allocates `size` bytes of zeroed, page granular memory aligned to `alignment` bytes.
    fn allocate_pages(&self, size: u64, alignment: u64) -> Option<u64>;

    /// Releases memory previously returned by [`Hal::allocate_pages`].
    fn free_pages(&self, address: u64, size: u64);
}

/// Polls `condition` every `interval_us` microseconds for at most `budget_us` microseconds.
///
/// An interval of zero is treated as one microsecond.
///
/// The condition is evaluated before the first delay, so a ready device costs no stall. Returns
/// `Some` with the first non-`None` value produced by the condition, or `None` once the budget is
/// spent.
pub fn poll_with_timeout<H, T, F>(hal: &H, interval_us: u64, budget_us: u64, mut condition: F) -> Option<T>
where
    H: Hal + ?Sized,
    F: FnMut() -> Option<T>,
{
    let mut remaining = budget_us;
    loop {
        if let Some(value) = condition() {
            return Some(value);
        }
        if remaining == 0 {
            return None;
        }
        let step = interval_us.max(1).min(remaining);
        hal.stall(step);
        remaining -= step;
    }
}

/// Identity-mapped volatile accessors and architecture cache primitives.
pub mod mmio {
    /// Reads a 32-bit register.
    ///
    /// # Safety
    /// `address` must be a mapped, 4-byte aligned device or memory location.
    #[inline(always)]
    pub unsafe fn read32(address: u64) -> u32 {
        unsafe { u32::from_le(core::ptr::read_volatile(address as usize as *const u32)) }
    }

    /// Writes a 32-bit register.
    ///
    /// # Safety
    /// `address` must be a mapped, 4-byte aligned device or memory location.
    #[inline(always)]
    pub unsafe fn write32(address: u64, value: u32) {
        unsafe { core::ptr::write_volatile(address as usize as *mut u32, value.to_le()) }
    }

    /// Reads a 64-bit register.
    ///
    /// # Safety
    /// `address` must be a mapped, 8-byte aligned device or memory location.
    #[inline(always)]
    pub unsafe fn read64(address: u64) -> u64 {
        unsafe { u64::from_le(core::ptr::read_volatile(address as usize as *const u64)) }
    }

    /// Writes a 64-bit register.
    ///
    /// # Safety
    /// `address` must be a mapped, 8-byte aligned device or memory location.
    #[inline(always)]
    pub unsafe fn write64(address: u64, value: u64) {
        unsafe { core::ptr::write_volatile(address as usize as *mut u64, value.to_le()) }
    }

    /// Copies memory out of the identity map.
    ///
    /// # Safety
    /// `[address, address + buffer.len())` must be mapped and not concurrently written by the CPU.
    pub unsafe fn read_bytes(address: u64, buffer: &mut [u8]) {
        unsafe { core::ptr::copy_nonoverlapping(address as usize as *const u8, buffer.as_mut_ptr(), buffer.len()) }
    }

    /// Copies memory into the identity map.
    ///
    /// # Safety
    /// `[address, address + data.len())` must be mapped, writable and not aliased by live references.
    pub unsafe fn write_bytes(address: u64, data: &[u8]) {
        unsafe { core::ptr::copy_nonoverlapping(data.as_ptr(), address as usize as *mut u8, data.len()) }
    }

    cfg_if::cfg_if! {
        if #[cfg(target_arch = "aarch64")] {
            /// Full-system data memory barrier.
            #[inline(always)]
            pub fn data_memory_barrier() {
                unsafe { core::arch::asm!("dmb sy", options(nostack, preserves_flags)) }
            }

            /// Cleans and invalidates every data cache line covering the range, then waits for
            /// completion.
            pub fn clean_dcache_range(address: u64, length: usize) {
                let line = super::CACHE_LINE_SIZE;
                let mut current = address & !(line - 1);
                let end = address.saturating_add(length as u64);
                while current < end {
                    unsafe { core::arch::asm!("dc civac, {}", in(reg) current, options(nostack, preserves_flags)) };
                    current += line;
                }
                unsafe { core::arch::asm!("dsb sy", options(nostack, preserves_flags)) }
            }
        } else {
            /// Full-system data memory barrier.
            #[inline(always)]
            pub fn data_memory_barrier() {
                core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
            }

            /// Coherent platforms need no maintenance; only ordering is enforced.
            pub fn clean_dcache_range(_address: u64, _length: usize) {
                core::sync::atomic::fence(core::sync::atomic::Ordering::SeqCst);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::SimHal;

    #[test]
    fn test_poll_ready_immediately_costs_nothing() {
        let hal = SimHal::new();
        let value = poll_with_timeout(&hal, 100, 2000, || Some(7u32));
        assert_eq!(value, Some(7));
        assert_eq!(hal.elapsed_us(), 0);
    }

    #[test]
    fn test_poll_times_out_after_budget() {
        let hal = SimHal::new();
        let mut calls = 0;
        let value: Option<()> = poll_with_timeout(&hal, 100, 2000, || {
            calls += 1;
            None
        });
        assert!(value.is_none());
        assert_eq!(hal.elapsed_us(), 2000);
        assert_eq!(calls, 21);
    }

    #[test]
    fn test_poll_partial_last_step() {
        let hal = SimHal::new();
        let _: Option<()> = poll_with_timeout(&hal, 300, 1000, || None);
        assert_eq!(hal.elapsed_us(), 1000);
    }

    #[test]
    fn test_poll_zero_interval_still_spends_budget() {
        let hal = SimHal::new();
        let mut calls = 0;
        let value: Option<()> = poll_with_timeout(&hal, 0, 5, || {
            calls += 1;
            None
        });
        assert!(value.is_none());
        assert_eq!(hal.elapsed_us(), 5);
        assert_eq!(calls, 6);
    }
}

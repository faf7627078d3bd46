//! VirtIO over MMIO.
//!
//! Supports both the legacy (version 1) register layout, where a queue is
//! described by a single page frame number, and the modern (version 2)
//! layout with separate 64-bit ring addresses.

use core::ptr::{self, NonNull};

use crate::ring::{Vring, LEGACY_QUEUE_ALIGN};
use crate::status::InterruptStatus;
use crate::{Result, VirtioError};

/// Magic value "virt" at offset 0 of every window.
pub const VIRTIO_MMIO_MAGIC: u32 = 0x7472_6976;

/// Size of one device register window.
pub const MMIO_WINDOW_SIZE: usize = 0x200;

/// Register offsets inside a window.
pub mod regs {
    pub const MAGIC_VALUE: usize = 0x000;
    pub const VERSION: usize = 0x004;
    pub const DEVICE_ID: usize = 0x008;
    pub const VENDOR_ID: usize = 0x00c;
    pub const DEVICE_FEATURES: usize = 0x010;
    pub const DEVICE_FEATURES_SEL: usize = 0x014;
    pub const DRIVER_FEATURES: usize = 0x020;
    pub const DRIVER_FEATURES_SEL: usize = 0x024;
    /// Legacy only.
    pub const GUEST_PAGE_SIZE: usize = 0x028;
    pub const QUEUE_SEL: usize = 0x030;
    pub const QUEUE_NUM_MAX: usize = 0x034;
    pub const QUEUE_NUM: usize = 0x038;
    /// Legacy only.
    pub const QUEUE_ALIGN: usize = 0x03c;
    /// Legacy only.
    pub const QUEUE_PFN: usize = 0x040;
    pub const QUEUE_READY: usize = 0x044;
    pub const QUEUE_NOTIFY: usize = 0x050;
    pub const INTERRUPT_STATUS: usize = 0x060;
    pub const INTERRUPT_ACK: usize = 0x064;
    pub const STATUS: usize = 0x070;
    pub const QUEUE_DESC_LOW: usize = 0x080;
    pub const QUEUE_DESC_HIGH: usize = 0x084;
    pub const QUEUE_DRIVER_LOW: usize = 0x090;
    pub const QUEUE_DRIVER_HIGH: usize = 0x094;
    pub const QUEUE_DEVICE_LOW: usize = 0x0a0;
    pub const QUEUE_DEVICE_HIGH: usize = 0x0a4;
    pub const CONFIG_GENERATION: usize = 0x0fc;
    pub const CONFIG: usize = 0x100;
}

/// Bytes of device-specific configuration in one window.
pub const MMIO_CONFIG_SIZE: usize = MMIO_WINDOW_SIZE - regs::CONFIG;

/// Page frame number of a legacy queue, if the 32-bit register can hold it.
pub fn legacy_pfn(addr: u64) -> Option<u32> {
    debug_assert!(addr % LEGACY_QUEUE_ALIGN as u64 == 0);
    u32::try_from(addr / LEGACY_QUEUE_ALIGN as u64).ok()
}

/// One VirtIO MMIO register window.
pub struct MmioTransport {
    base: NonNull<u8>,
    version: u32,
}

// Register access goes through volatile reads and writes only.
unsafe impl Send for MmioTransport {}

impl MmioTransport {
    /// Identify the device behind a register window.
    ///
    /// # Safety
    ///
    /// `base` must point to a mapped window of at least [`MMIO_WINDOW_SIZE`]
    /// bytes that stays mapped for the lifetime of the transport.
    pub unsafe fn probe(base: *mut u8) -> Result<Self> {
        let base = NonNull::new(base).ok_or(VirtioError::NotVirtio)?;
        let mut transport = Self { base, version: 0 };

        let magic = transport.read32(regs::MAGIC_VALUE);
        if magic != VIRTIO_MMIO_MAGIC {
            return Err(VirtioError::NotVirtio);
        }

        let version = transport.read32(regs::VERSION);
        if version != 1 && version != 2 {
            return Err(VirtioError::UnsupportedVersion(version));
        }
        transport.version = version;

        if transport.device_id() == 0 {
            return Err(VirtioError::NoDevice);
        }

        if transport.is_legacy() {
            transport.write32(regs::GUEST_PAGE_SIZE, LEGACY_QUEUE_ALIGN as u32);
        }

        Ok(transport)
    }

    fn read32(&self, offset: usize) -> u32 {
        debug_assert!(offset + 4 <= MMIO_WINDOW_SIZE);
        // SAFETY: offset is inside the window `probe` was given.
        unsafe { ptr::read_volatile(self.base.as_ptr().add(offset).cast::<u32>()) }
    }

    fn write32(&mut self, offset: usize, val: u32) {
        debug_assert!(offset + 4 <= MMIO_WINDOW_SIZE);
        // SAFETY: offset is inside the window `probe` was given.
        unsafe { ptr::write_volatile(self.base.as_ptr().add(offset).cast::<u32>(), val) }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    pub fn is_legacy(&self) -> bool {
        self.version == 1
    }

    pub fn device_id(&self) -> u32 {
        self.read32(regs::DEVICE_ID)
    }

    pub fn vendor_id(&self) -> u32 {
        self.read32(regs::VENDOR_ID)
    }

    /// Base address of the register window.
    pub fn base(&self) -> *mut u8 {
        self.base.as_ptr()
    }

    /// Start of the device-specific configuration space.
    pub fn config_ptr(&self) -> *mut u8 {
        // SAFETY: CONFIG is inside the window.
        unsafe { self.base.as_ptr().add(regs::CONFIG) }
    }

    pub fn status(&self) -> u8 {
        self.read32(regs::STATUS) as u8
    }

    pub fn set_status(&mut self, status: u8) {
        self.write32(regs::STATUS, status as u32);
    }

    pub fn device_features(&mut self) -> u64 {
        self.write32(regs::DEVICE_FEATURES_SEL, 0);
        let low = self.read32(regs::DEVICE_FEATURES) as u64;
        self.write32(regs::DEVICE_FEATURES_SEL, 1);
        let high = self.read32(regs::DEVICE_FEATURES) as u64;
        (high << 32) | low
    }

    pub fn set_driver_features(&mut self, features: u64) {
        self.write32(regs::DRIVER_FEATURES_SEL, 0);
        self.write32(regs::DRIVER_FEATURES, features as u32);
        self.write32(regs::DRIVER_FEATURES_SEL, 1);
        self.write32(regs::DRIVER_FEATURES, (features >> 32) as u32);
    }

    /// Largest queue size the device offers for `index`, 0 if none.
    pub fn queue_max(&mut self, index: u32) -> u32 {
        self.write32(regs::QUEUE_SEL, index);
        self.read32(regs::QUEUE_NUM_MAX)
    }

    /// Hand the ring's memory to the device as queue `index`.
    pub fn setup_queue(&mut self, index: u32, ring: &Vring) -> Result<()> {
        let max = self.queue_max(index);
        if max == 0 || (ring.num() as u32) > max {
            log::warn!(
                "[VirtIO MMIO] queue {} unavailable (max {}, want {})",
                index,
                max,
                ring.num()
            );
            return Err(VirtioError::QueueUnavailable);
        }

        if self.is_legacy() {
            let pfn = legacy_pfn(ring.desc_addr()).ok_or_else(|| {
                log::warn!("[VirtIO MMIO] ring at {:#x} beyond legacy reach", ring.desc_addr());
                VirtioError::AddressOutOfRange
            })?;
            self.write32(regs::QUEUE_NUM, ring.num() as u32);
            self.write32(regs::QUEUE_ALIGN, LEGACY_QUEUE_ALIGN as u32);
            self.write32(regs::QUEUE_PFN, pfn);
        } else {
            self.write32(regs::QUEUE_NUM, ring.num() as u32);
            self.write64(regs::QUEUE_DESC_LOW, regs::QUEUE_DESC_HIGH, ring.desc_addr());
            self.write64(regs::QUEUE_DRIVER_LOW, regs::QUEUE_DRIVER_HIGH, ring.avail_addr());
            self.write64(regs::QUEUE_DEVICE_LOW, regs::QUEUE_DEVICE_HIGH, ring.used_addr());
            self.write32(regs::QUEUE_READY, 1);
        }
        Ok(())
    }

    fn write64(&mut self, low: usize, high: usize, val: u64) {
        self.write32(low, val as u32);
        self.write32(high, (val >> 32) as u32);
    }

    pub fn notify(&mut self, index: u32) {
        self.write32(regs::QUEUE_NOTIFY, index);
    }

    /// Read the interrupt status and acknowledge every bit that was set.
    pub fn ack_interrupt(&mut self) -> InterruptStatus {
        let isr = self.read32(regs::INTERRUPT_STATUS);
        self.write32(regs::INTERRUPT_ACK, isr);
        InterruptStatus::from_bits_truncate(isr)
    }

    pub fn copy_config(&self, buf: &mut [u8]) -> Result<()> {
        if buf.len() > MMIO_CONFIG_SIZE {
            return Err(VirtioError::ConfigOutOfRange);
        }
        for (i, byte) in buf.iter_mut().enumerate() {
            // SAFETY: i < MMIO_CONFIG_SIZE keeps the read inside the window.
            *byte = unsafe { ptr::read_volatile(self.config_ptr().add(i)) };
        }
        Ok(())
    }
}

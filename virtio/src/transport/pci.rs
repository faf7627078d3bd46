//! VirtIO over PCI (modern interface).
//!
//! The device exposes its registers through vendor-specific PCI
//! capabilities, each pointing into one of the function's memory BARs:
//!
//! - common configuration: status, features, queue programming
//! - notification area: one doorbell per queue
//! - ISR status: read-to-clear interrupt cause byte
//! - device configuration: device-type specific fields
//!
//! Configuration-space access, BAR mapping and interrupt binding belong to
//! the platform and reach this module through [`PciFunction`].

use alloc::boxed::Box;
use core::ptr::{self, NonNull};

use crate::device_id;
use crate::ring::Vring;
use crate::status::InterruptStatus;
use crate::{Result, VirtioError, MAX_VIRTIO_RINGS};

/// PCI vendor ID of every VirtIO function.
pub const VIRTIO_PCI_VENDOR_ID: u16 = 0x1AF4;

/// First modern PCI device ID; the VirtIO device ID is added to it.
pub const VIRTIO_PCI_MODERN_BASE: u16 = 0x1040;

/// PCI capability ID for vendor-specific capabilities.
const PCI_CAP_ID_VENDOR: u8 = 0x09;

/// "Capabilities list" bit in the PCI status register.
const PCI_STATUS_CAP_LIST: u16 = 1 << 4;

const PCI_VENDOR_ID: u8 = 0x00;
const PCI_DEVICE_ID: u8 = 0x02;
const PCI_STATUS: u8 = 0x06;
const PCI_CAPABILITY_LIST: u8 = 0x34;

/// Upper bound on capability list entries; guards against a looping list.
const MAX_CAPABILITIES: usize = 48;

/// First config-space offset past the standard header.
const PCI_CAP_MIN_OFFSET: u8 = 0x40;

/// Bytes of a `virtio_pci_cap`; the notify capability adds a 32-bit multiplier.
const VIRTIO_CAP_LEN: u8 = 16;
const VIRTIO_NOTIFY_CAP_LEN: u8 = 20;

/// VirtIO capability `cfg_type` values.
mod cfg_type {
    pub const COMMON: u8 = 1;
    pub const NOTIFY: u8 = 2;
    pub const ISR: u8 = 3;
    pub const DEVICE: u8 = 4;
}

/// Offsets inside the common configuration structure.
pub mod common {
    pub const DEVICE_FEATURE_SELECT: usize = 0x00;
    pub const DEVICE_FEATURE: usize = 0x04;
    pub const DRIVER_FEATURE_SELECT: usize = 0x08;
    pub const DRIVER_FEATURE: usize = 0x0c;
    pub const MSIX_CONFIG: usize = 0x10;
    pub const NUM_QUEUES: usize = 0x12;
    pub const DEVICE_STATUS: usize = 0x14;
    pub const CONFIG_GENERATION: usize = 0x15;
    pub const QUEUE_SELECT: usize = 0x16;
    pub const QUEUE_SIZE: usize = 0x18;
    pub const QUEUE_MSIX_VECTOR: usize = 0x1a;
    pub const QUEUE_ENABLE: usize = 0x1c;
    pub const QUEUE_NOTIFY_OFF: usize = 0x1e;
    pub const QUEUE_DESC: usize = 0x20;
    pub const QUEUE_DRIVER: usize = 0x28;
    pub const QUEUE_DEVICE: usize = 0x30;
    /// Size of the structure up to and including `QUEUE_DEVICE`.
    pub const LEN: usize = 0x38;
}

/// Platform access to one PCI function.
pub trait PciFunction: Send {
    /// Read a byte of configuration space.
    fn read_config_u8(&self, offset: u8) -> u8;

    /// Read a 16-bit little-endian value of configuration space.
    fn read_config_u16(&self, offset: u8) -> u16;

    /// Read a 32-bit little-endian value of configuration space.
    fn read_config_u32(&self, offset: u8) -> u32;

    /// Address at which memory BAR `bar` is mapped, if it is a mapped
    /// memory BAR.
    fn bar_address(&self, bar: u8) -> Option<u64>;

    /// Bind the function's interrupt and return the IRQ line.
    fn allocate_irq(&mut self) -> Result<u32>;
}

/// Map a PCI device ID to a VirtIO device ID.
pub fn virtio_device_id(pci_device_id: u16) -> Option<u32> {
    match pci_device_id {
        0x1000 => Some(device_id::NET),
        0x1001 => Some(device_id::BLOCK),
        0x1002 => Some(device_id::MEM_BALLOON),
        0x1003 => Some(device_id::CONSOLE),
        0x1004 => Some(device_id::SCSI_HOST),
        0x1005 => Some(device_id::ENTROPY_SRC),
        0x1009 => Some(device_id::TRANSPORT_9P),
        0x1041..=0x107f => Some((pci_device_id - VIRTIO_PCI_MODERN_BASE) as u32),
        _ => None,
    }
}

/// One mapped capability region.
#[derive(Clone, Copy)]
struct Region {
    base: NonNull<u8>,
    len: usize,
}

impl Region {
    fn fits<T>(&self, offset: usize) -> bool {
        offset
            .checked_add(core::mem::size_of::<T>())
            .map_or(false, |end| end <= self.len)
    }

    fn read<T: Copy>(&self, offset: usize) -> T {
        assert!(self.fits::<T>(offset), "read at {:#x} outside region of {:#x}", offset, self.len);
        // SAFETY: the platform mapped `len` bytes at `base`; checked above.
        unsafe { ptr::read_volatile(self.base.as_ptr().add(offset).cast::<T>()) }
    }

    fn write<T: Copy>(&self, offset: usize, val: T) {
        assert!(self.fits::<T>(offset), "write at {:#x} outside region of {:#x}", offset, self.len);
        // SAFETY: as in `read`.
        unsafe { ptr::write_volatile(self.base.as_ptr().add(offset).cast::<T>(), val) }
    }
}

/// Capability regions found while walking the list.
#[derive(Default)]
struct Capabilities {
    common: Option<Region>,
    notify: Option<(Region, u32)>,
    isr: Option<Region>,
    device: Option<Region>,
}

/// Modern VirtIO PCI transport.
pub struct PciTransport {
    pci: Box<dyn PciFunction>,
    pci_device_id: u16,
    device_id: u32,
    common: Region,
    notify: Region,
    notify_off_multiplier: u32,
    isr: Region,
    device_cfg: Option<Region>,
    /// Byte offset of each queue's doorbell inside the notify region.
    queue_notify: [usize; MAX_VIRTIO_RINGS],
}

// Register access goes through volatile reads and writes only.
unsafe impl Send for PciTransport {}

impl PciTransport {
    /// Identify a VirtIO function and locate its register regions.
    pub fn new(pci: Box<dyn PciFunction>) -> Result<Self> {
        if pci.read_config_u16(PCI_VENDOR_ID) != VIRTIO_PCI_VENDOR_ID {
            return Err(VirtioError::NotVirtio);
        }

        let pci_device_id = pci.read_config_u16(PCI_DEVICE_ID);
        let device_id = virtio_device_id(pci_device_id).ok_or(VirtioError::NoDevice)?;

        let caps = Self::find_capabilities(pci.as_ref())?;
        let (common, isr) = match (caps.common, caps.isr) {
            (Some(common), Some(isr)) => (common, isr),
            _ => return Err(VirtioError::MissingCapability),
        };
        let (notify, notify_off_multiplier) = caps.notify.ok_or(VirtioError::MissingCapability)?;

        if common.len < common::LEN || isr.len < 1 || notify.len < 2 {
            log::warn!(
                "[VirtIO PCI] regions too small (common {:#x}, isr {:#x}, notify {:#x})",
                common.len,
                isr.len,
                notify.len
            );
            return Err(VirtioError::MissingCapability);
        }

        Ok(Self {
            pci,
            pci_device_id,
            device_id,
            common,
            notify,
            notify_off_multiplier,
            isr,
            device_cfg: caps.device,
            queue_notify: [0; MAX_VIRTIO_RINGS],
        })
    }

    fn find_capabilities(pci: &dyn PciFunction) -> Result<Capabilities> {
        let mut caps = Capabilities::default();
        if pci.read_config_u16(PCI_STATUS) & PCI_STATUS_CAP_LIST == 0 {
            return Err(VirtioError::MissingCapability);
        }

        let mut offset = pci.read_config_u8(PCI_CAPABILITY_LIST) & 0xfc;
        for _ in 0..MAX_CAPABILITIES {
            if offset == 0 {
                break;
            }
            if offset < PCI_CAP_MIN_OFFSET {
                log::warn!("[VirtIO PCI] capability pointer {:#x} inside header", offset);
                break;
            }

            let cap_id = pci.read_config_u8(offset);
            let next = pci.read_config_u8(offset + 1) & 0xfc;

            if cap_id == PCI_CAP_ID_VENDOR {
                if offset.checked_add(VIRTIO_CAP_LEN - 1).is_none() {
                    log::warn!("[VirtIO PCI] capability at {:#x} runs past config space", offset);
                    break;
                }
                let kind = pci.read_config_u8(offset + 3);
                let bar = pci.read_config_u8(offset + 4);
                let bar_offset = pci.read_config_u32(offset + 8);
                let length = pci.read_config_u32(offset + 12);

                let region = pci
                    .bar_address(bar)
                    .and_then(|addr| NonNull::new((addr + bar_offset as u64) as *mut u8))
                    .map(|base| Region {
                        base,
                        len: length as usize,
                    });

                match (kind, region) {
                    (cfg_type::COMMON, Some(r)) if caps.common.is_none() => caps.common = Some(r),
                    (cfg_type::NOTIFY, Some(r)) if caps.notify.is_none() => {
                        match offset.checked_add(VIRTIO_NOTIFY_CAP_LEN - 1) {
                            Some(_) => caps.notify = Some((r, pci.read_config_u32(offset + 16))),
                            None => log::warn!(
                                "[VirtIO PCI] notify capability at {:#x} runs past config space",
                                offset
                            ),
                        }
                    }
                    (cfg_type::ISR, Some(r)) if caps.isr.is_none() => caps.isr = Some(r),
                    (cfg_type::DEVICE, Some(r)) if caps.device.is_none() => caps.device = Some(r),
                    (_, None) => {
                        log::warn!("[VirtIO PCI] capability type {} on unmapped BAR {}", kind, bar)
                    }
                    _ => {}
                }
            }

            offset = next;
        }

        Ok(caps)
    }

    /// VirtIO device ID of the function.
    pub fn device_id(&self) -> u32 {
        self.device_id
    }

    pub fn pci_device_id(&self) -> u16 {
        self.pci_device_id
    }

    pub fn num_queues(&self) -> u16 {
        self.common.read(common::NUM_QUEUES)
    }

    pub fn status(&self) -> u8 {
        self.common.read(common::DEVICE_STATUS)
    }

    pub fn set_status(&mut self, status: u8) {
        self.common.write(common::DEVICE_STATUS, status);
    }

    pub fn device_features(&mut self) -> u64 {
        self.common.write(common::DEVICE_FEATURE_SELECT, 0u32);
        let low: u32 = self.common.read(common::DEVICE_FEATURE);
        self.common.write(common::DEVICE_FEATURE_SELECT, 1u32);
        let high: u32 = self.common.read(common::DEVICE_FEATURE);
        ((high as u64) << 32) | low as u64
    }

    pub fn set_driver_features(&mut self, features: u64) {
        self.common.write(common::DRIVER_FEATURE_SELECT, 0u32);
        self.common.write(common::DRIVER_FEATURE, features as u32);
        self.common.write(common::DRIVER_FEATURE_SELECT, 1u32);
        self.common.write(common::DRIVER_FEATURE, (features >> 32) as u32);
    }

    /// Largest queue size the device offers for `index`, 0 if none.
    pub fn queue_max(&mut self, index: u16) -> u16 {
        self.common.write(common::QUEUE_SELECT, index);
        self.common.read(common::QUEUE_SIZE)
    }

    /// Hand the ring's memory to the device as queue `index`.
    pub fn setup_queue(&mut self, index: u16, ring: &Vring) -> Result<()> {
        let slot = index as usize;
        if slot >= MAX_VIRTIO_RINGS {
            return Err(VirtioError::InvalidRingIndex(slot));
        }

        let max = self.queue_max(index);
        if max == 0 || ring.num() > max {
            log::warn!(
                "[VirtIO PCI] queue {} unavailable (max {}, want {})",
                index,
                max,
                ring.num()
            );
            return Err(VirtioError::QueueUnavailable);
        }

        let notify_off: u16 = self.common.read(common::QUEUE_NOTIFY_OFF);
        let doorbell = (notify_off as usize)
            .checked_mul(self.notify_off_multiplier as usize)
            .filter(|&offset| self.notify.fits::<u16>(offset))
            .ok_or_else(|| {
                log::warn!(
                    "[VirtIO PCI] queue {} doorbell {} x {} outside notify region of {:#x}",
                    index,
                    notify_off,
                    self.notify_off_multiplier,
                    self.notify.len
                );
                VirtioError::QueueUnavailable
            })?;

        self.common.write(common::QUEUE_SIZE, ring.num());
        self.write64(common::QUEUE_DESC, ring.desc_addr());
        self.write64(common::QUEUE_DRIVER, ring.avail_addr());
        self.write64(common::QUEUE_DEVICE, ring.used_addr());
        self.queue_notify[slot] = doorbell;
        self.common.write(common::QUEUE_ENABLE, 1u16);
        Ok(())
    }

    fn write64(&mut self, offset: usize, val: u64) {
        self.common.write(offset, val as u32);
        self.common.write(offset + 4, (val >> 32) as u32);
    }

    /// Ring the doorbell of queue `index`, as placed by `setup_queue`.
    pub fn notify(&mut self, index: u16) {
        let offset = self.queue_notify[index as usize];
        self.notify.write(offset, index);
    }

    /// Read (and thereby clear) the ISR status byte.
    pub fn ack_interrupt(&mut self) -> InterruptStatus {
        let isr: u8 = self.isr.read(0);
        InterruptStatus::from_bits_truncate(isr as u32)
    }

    pub fn copy_config(&self, buf: &mut [u8]) -> Result<()> {
        let region = self.device_cfg.ok_or(VirtioError::MissingCapability)?;
        if buf.len() > region.len {
            return Err(VirtioError::ConfigOutOfRange);
        }
        for (i, byte) in buf.iter_mut().enumerate() {
            *byte = region.read(i);
        }
        Ok(())
    }

    pub fn allocate_irq(&mut self) -> Result<u32> {
        self.pci.allocate_irq()
    }
}

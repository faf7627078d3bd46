//! VirtIO device handle.
//!
//! A [`VirtioDevice`] is what device-type drivers program against: it owns
//! up to [`MAX_VIRTIO_RINGS`] virtqueues, drives the status register and
//! turns device interrupts into per-completion callbacks.
//!
//! # Initialization sequence
//!
//! 1. `reset_device`
//! 2. `status_acknowledge_driver`
//! 3. feature negotiation and `alloc_ring` (owned by the device-type driver)
//! 4. `status_driver_ok`
//!
//! # Completion
//!
//! The interrupt path calls [`VirtioDevice::handle_irq`]. Every used-ring
//! entry is handed to the registered completion callback together with the
//! ring index. Descriptors are not reclaimed automatically: the callback (or
//! whoever it defers to) calls `free_desc_chain` once it is done with the
//! buffers.

use alloc::boxed::Box;
use core::any::Any;
use core::ops::{BitOr, BitOrAssign};

use crate::ring::{DescriptorMut, UsedElem, Vring, VringDesc};
use crate::status::{DeviceStatus, InterruptStatus};
use crate::transport::{MmioTransport, PciTransport, Transport};
use crate::{Result, VirtioError, MAX_VIRTIO_RINGS};

/// What the interrupt handler asks of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandlerReturn {
    /// Return to the interrupted context.
    NoReschedule,
    /// A thread was woken; reschedule on the way out.
    Reschedule,
}

impl BitOr for HandlerReturn {
    type Output = HandlerReturn;

    fn bitor(self, rhs: HandlerReturn) -> HandlerReturn {
        if self == HandlerReturn::Reschedule || rhs == HandlerReturn::Reschedule {
            HandlerReturn::Reschedule
        } else {
            HandlerReturn::NoReschedule
        }
    }
}

impl BitOrAssign for HandlerReturn {
    fn bitor_assign(&mut self, rhs: HandlerReturn) {
        *self = *self | rhs;
    }
}

/// Called once per used-ring entry with the ring index.
pub type IrqDriverCallback = fn(&mut VirtioDevice, usize, &UsedElem) -> HandlerReturn;

/// Called when the device signals a configuration change.
pub type ConfigChangeCallback = fn(&mut VirtioDevice) -> HandlerReturn;

/// One VirtIO device instance.
pub struct VirtioDevice {
    index: usize,
    irq: u32,
    transport: Transport,
    /// Private state of the device-type driver.
    driver_data: Option<Box<dyn Any + Send>>,
    irq_driver_callback: Option<IrqDriverCallback>,
    config_change_callback: Option<ConfigChangeCallback>,
    active_rings_bitmap: u32,
    rings: [Option<Vring>; MAX_VIRTIO_RINGS],
}

impl VirtioDevice {
    pub fn new(index: usize, irq: u32, transport: Transport) -> Self {
        Self {
            index,
            irq,
            transport,
            driver_data: None,
            irq_driver_callback: None,
            config_change_callback: None,
            active_rings_bitmap: 0,
            rings: [None, None, None, None],
        }
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn irq(&self) -> u32 {
        self.irq
    }

    pub fn transport(&self) -> &Transport {
        &self.transport
    }

    /// MMIO state, or `None` if the device is not on MMIO.
    pub fn mmio(&self) -> Option<&MmioTransport> {
        match &self.transport {
            Transport::Mmio(mmio) => Some(mmio),
            _ => None,
        }
    }

    /// PCI state, or `None` if the device is not on PCI.
    pub fn pci(&self) -> Option<&PciTransport> {
        match &self.transport {
            Transport::Pci(pci) => Some(pci),
            _ => None,
        }
    }

    pub fn pci_mut(&mut self) -> Option<&mut PciTransport> {
        match &mut self.transport {
            Transport::Pci(pci) => Some(pci),
            _ => None,
        }
    }

    // ── Driver hooks ─────────────────────────────────────────────────

    pub fn set_driver_data<T: Any + Send>(&mut self, data: T) {
        self.driver_data = Some(Box::new(data));
    }

    pub fn driver_data<T: Any + Send>(&self) -> Option<&T> {
        self.driver_data.as_ref()?.downcast_ref::<T>()
    }

    pub fn driver_data_mut<T: Any + Send>(&mut self) -> Option<&mut T> {
        self.driver_data.as_mut()?.downcast_mut::<T>()
    }

    pub fn set_irq_driver_callback(&mut self, callback: IrqDriverCallback) {
        self.irq_driver_callback = Some(callback);
    }

    pub fn set_config_change_callback(&mut self, callback: ConfigChangeCallback) {
        self.config_change_callback = Some(callback);
    }

    // ── Status ───────────────────────────────────────────────────────

    /// Write zero to the status register, returning the device to reset.
    pub fn reset_device(&mut self) {
        log::debug!("[VirtIO] device {} reset", self.index);
        self.transport.set_status(0);
    }

    /// Set ACKNOWLEDGE and DRIVER: a driver is present and negotiating.
    pub fn status_acknowledge_driver(&mut self) {
        let status = self.status() | DeviceStatus::ACKNOWLEDGE | DeviceStatus::DRIVER;
        self.transport.set_status(status.bits());
        log::debug!("[VirtIO] device {} status {:?}", self.index, status);
    }

    /// Set DRIVER_OK: the device may start processing available entries.
    pub fn status_driver_ok(&mut self) {
        let status = self.status() | DeviceStatus::DRIVER_OK;
        self.transport.set_status(status.bits());
        log::debug!("[VirtIO] device {} status {:?}", self.index, status);
    }

    pub fn status(&self) -> DeviceStatus {
        DeviceStatus::from_bits_truncate(self.transport.status())
    }

    pub fn device_features(&mut self) -> u64 {
        self.transport.device_features()
    }

    pub fn set_driver_features(&mut self, features: u64) {
        self.transport.set_driver_features(features);
    }

    /// Copy `buf.len()` bytes of device-specific configuration.
    pub fn copy_device_config(&self, buf: &mut [u8]) -> Result<()> {
        self.transport.copy_config(buf)
    }

    // ── Rings ────────────────────────────────────────────────────────

    pub fn active_rings_bitmap(&self) -> u32 {
        self.active_rings_bitmap
    }

    pub fn is_ring_active(&self, index: usize) -> bool {
        index < MAX_VIRTIO_RINGS && self.active_rings_bitmap & (1 << index) != 0
    }

    /// Allocate ring `index` with `len` descriptors and hand it to the device.
    pub fn alloc_ring(&mut self, index: usize, len: u16) -> Result<()> {
        if index >= MAX_VIRTIO_RINGS {
            return Err(VirtioError::InvalidRingIndex(index));
        }
        if self.is_ring_active(index) {
            return Err(VirtioError::RingAlreadyActive(index));
        }

        let ring = Vring::new(len)?;
        self.transport.setup_queue(index, &ring)?;

        log::info!(
            "[VirtIO] device {} ring {}: {} descriptors at {:#x}",
            self.index,
            index,
            len,
            ring.desc_addr()
        );
        self.rings[index] = Some(ring);
        self.active_rings_bitmap |= 1 << index;
        Ok(())
    }

    /// Ring `index`; panics if it was never allocated.
    pub fn ring(&self, index: usize) -> &Vring {
        match self.rings.get(index) {
            Some(Some(ring)) => ring,
            _ => panic!("ring {} not active", index),
        }
    }

    pub fn ring_mut(&mut self, index: usize) -> &mut Vring {
        match self.rings.get_mut(index) {
            Some(Some(ring)) => ring,
            _ => panic!("ring {} not active", index),
        }
    }

    /// Allocate one descriptor, [`crate::DESC_NONE`] when exhausted.
    pub fn alloc_desc(&mut self, ring: usize) -> u16 {
        self.ring_mut(ring).alloc_desc()
    }

    pub fn free_desc(&mut self, ring: usize, desc_index: u16) {
        self.ring_mut(ring).free_desc(desc_index)
    }

    pub fn free_desc_chain(&mut self, ring: usize, chain_head: u16) {
        self.ring_mut(ring).free_desc_chain(chain_head)
    }

    /// Allocate a chain of `count` descriptors; `None` leaves the ring as it was.
    pub fn alloc_desc_chain(&mut self, ring: usize, count: usize) -> Option<(u16, DescriptorMut<'_>)> {
        self.ring_mut(ring).alloc_desc_chain(count)
    }

    pub fn desc(&self, ring: usize, desc_index: u16) -> &VringDesc {
        self.ring(ring).desc(desc_index)
    }

    pub fn desc_mut(&mut self, ring: usize, desc_index: u16) -> DescriptorMut<'_> {
        self.ring_mut(ring).desc_mut(desc_index)
    }

    /// Publish a built chain on the available ring. Does not notify.
    pub fn submit_chain(&mut self, ring: usize, chain_head: u16) {
        self.ring_mut(ring).submit_chain(chain_head)
    }

    /// Tell the device that ring `ring` has new available entries.
    pub fn kick(&mut self, ring: usize) {
        assert!(self.is_ring_active(ring), "kick on inactive ring {}", ring);
        log::trace!("[VirtIO] device {} kick ring {}", self.index, ring);
        self.transport.notify(ring);
    }

    // ── Completion ───────────────────────────────────────────────────

    /// Hand every new used entry of every active ring to the callback.
    ///
    /// Entries are consumed in used-ring order, each exactly once, even
    /// when no callback is registered.
    pub fn dispatch_used(&mut self) -> HandlerReturn {
        let mut ret = HandlerReturn::NoReschedule;
        for ring in 0..MAX_VIRTIO_RINGS {
            if !self.is_ring_active(ring) {
                continue;
            }

            let mut consumed = 0u32;
            while let Some(elem) = self.ring_mut(ring).pop_used() {
                consumed += 1;
                if let Some(callback) = self.irq_driver_callback {
                    ret |= callback(self, ring, &elem);
                }
            }
            if consumed > 0 {
                log::trace!("[VirtIO] device {} ring {}: {} completions", self.index, ring, consumed);
            }
        }
        ret
    }

    /// Interrupt entry: acknowledge the device and dispatch by cause.
    pub fn handle_irq(&mut self) -> HandlerReturn {
        let isr = self.transport.ack_interrupt();
        let mut ret = HandlerReturn::NoReschedule;

        if isr.contains(InterruptStatus::USED_BUFFER) {
            ret |= self.dispatch_used();
        }

        if isr.contains(InterruptStatus::CONFIG_CHANGE) {
            log::debug!("[VirtIO] device {} config change", self.index);
            if let Some(callback) = self.config_change_callback {
                ret |= callback(self);
            }
        }

        ret
    }
}

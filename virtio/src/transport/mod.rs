//! Device transports.
//!
//! A device is reached through exactly one transport. [`Transport`] is the
//! tagged handle the device abstraction carries; variant-specific state is
//! only reachable after matching on it.

pub mod mmio;
pub mod pci;

pub use mmio::{MmioTransport, MMIO_WINDOW_SIZE, VIRTIO_MMIO_MAGIC};
pub use pci::{PciFunction, PciTransport};

use crate::ring::Vring;
use crate::status::InterruptStatus;
use crate::{Result, VirtioError};

/// Transport of one device.
pub enum Transport {
    /// Not bound to any transport yet.
    None,
    /// Detected through an MMIO register window.
    Mmio(MmioTransport),
    /// Detected on the PCI bus.
    Pci(PciTransport),
}

impl Transport {
    pub fn name(&self) -> &'static str {
        match self {
            Transport::None => "none",
            Transport::Mmio(_) => "mmio",
            Transport::Pci(_) => "pci",
        }
    }

    /// VirtIO device ID, 0 when unbound.
    pub fn device_id(&self) -> u32 {
        match self {
            Transport::None => 0,
            Transport::Mmio(mmio) => mmio.device_id(),
            Transport::Pci(pci) => pci.device_id(),
        }
    }

    pub fn status(&self) -> u8 {
        match self {
            Transport::None => 0,
            Transport::Mmio(mmio) => mmio.status(),
            Transport::Pci(pci) => pci.status(),
        }
    }

    pub fn set_status(&mut self, status: u8) {
        match self {
            Transport::None => {}
            Transport::Mmio(mmio) => mmio.set_status(status),
            Transport::Pci(pci) => pci.set_status(status),
        }
    }

    pub fn device_features(&mut self) -> u64 {
        match self {
            Transport::None => 0,
            Transport::Mmio(mmio) => mmio.device_features(),
            Transport::Pci(pci) => pci.device_features(),
        }
    }

    pub fn set_driver_features(&mut self, features: u64) {
        match self {
            Transport::None => {}
            Transport::Mmio(mmio) => mmio.set_driver_features(features),
            Transport::Pci(pci) => pci.set_driver_features(features),
        }
    }

    /// Program queue `index` with the ring's addresses.
    ///
    /// An unbound device accepts any ring; nothing is programmed.
    pub fn setup_queue(&mut self, index: usize, ring: &Vring) -> Result<()> {
        match self {
            Transport::None => Ok(()),
            Transport::Mmio(mmio) => mmio.setup_queue(index as u32, ring),
            Transport::Pci(pci) => pci.setup_queue(index as u16, ring),
        }
    }

    pub fn notify(&mut self, index: usize) {
        match self {
            Transport::None => {}
            Transport::Mmio(mmio) => mmio.notify(index as u32),
            Transport::Pci(pci) => pci.notify(index as u16),
        }
    }

    /// Read and acknowledge the interrupt cause.
    pub fn ack_interrupt(&mut self) -> InterruptStatus {
        match self {
            Transport::None => InterruptStatus::empty(),
            Transport::Mmio(mmio) => mmio.ack_interrupt(),
            Transport::Pci(pci) => pci.ack_interrupt(),
        }
    }

    pub fn copy_config(&self, buf: &mut [u8]) -> Result<()> {
        match self {
            Transport::None => Err(VirtioError::TransportMismatch),
            Transport::Mmio(mmio) => mmio.copy_config(buf),
            Transport::Pci(pci) => pci.copy_config(buf),
        }
    }
}

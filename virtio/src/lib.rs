//! VirtIO split-ring core.
//!
//! This crate provides the transport-independent part of a VirtIO driver
//! framework: the split virtqueue shared between a guest driver and a device
//! backend, the descriptor allocator behind it, and the completion path that
//! turns used-ring entries into driver callbacks.
//!
//! # Architecture
//!
//! - `ring`: descriptor table, free list, chain builder, available/used rings
//! - `status`: device status register bits
//! - `transport`: MMIO and PCI register access behind one tagged handle
//! - `device`: the per-device handle carrying up to [`MAX_VIRTIO_RINGS`] rings
//! - `bus`: device-class registry, MMIO detection and PCI registration
//!
//! Device-type drivers (block, net, console, ...) sit on top of `device` and
//! interpret the buffers their descriptors point at; this crate never does.
//!
//! # References
//!
//! - Virtual I/O Device (VIRTIO) Version 1.0, sections 2.4 and 4

#![cfg_attr(not(test), no_std)]

extern crate alloc;

pub mod bus;
pub mod device;
pub mod ring;
pub mod status;
pub mod transport;

#[cfg(test)]
mod testing;

use core::fmt;

pub use bus::{VirtioBus, VirtioDevClass};
pub use device::{HandlerReturn, VirtioDevice};
pub use ring::{DescFlags, DescriptorMut, Link, UsedElem, Vring, VringDesc};
pub use status::DeviceStatus;
pub use transport::Transport;

/// Maximum number of virtqueues a single device may own.
pub const MAX_VIRTIO_RINGS: usize = 4;

/// Sentinel descriptor index meaning "no descriptor".
pub const DESC_NONE: u16 = 0xFFFF;

/// Largest queue size allowed by the split-ring layout.
pub const MAX_RING_LEN: u16 = 32768;

/// Device IDs from section 5 of the VirtIO 1.0 specification.
pub mod device_id {
    pub const INVALID: u32 = 0x00;
    pub const NET: u32 = 0x01;
    pub const BLOCK: u32 = 0x02;
    pub const CONSOLE: u32 = 0x03;
    pub const ENTROPY_SRC: u32 = 0x04;
    pub const MEM_BALLOON: u32 = 0x05;
    pub const IO_MEMORY: u32 = 0x06;
    pub const RPMSG: u32 = 0x07;
    pub const SCSI_HOST: u32 = 0x08;
    pub const TRANSPORT_9P: u32 = 0x09;
    pub const MAC80211_WLAN: u32 = 0x0A;
    pub const RPROC_SERIAL: u32 = 0x0B;
    pub const CAIF: u32 = 0x0C;
    pub const GPU: u32 = 0x10;
    pub const INPUT: u32 = 0x12;
}

/// VirtIO error types.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VirtioError {
    /// Ring index is not below [`MAX_VIRTIO_RINGS`].
    InvalidRingIndex(usize),
    /// Ring was already allocated on this device.
    RingAlreadyActive(usize),
    /// Ring length is zero, not a power of two, or too large.
    UnsupportedRingLength(u16),
    /// Device does not offer a queue of the requested size.
    QueueUnavailable,
    /// Ring memory could not be allocated.
    NoMemory,
    /// Ring memory lies outside what the transport can address.
    AddressOutOfRange,
    /// MMIO window does not carry the VirtIO magic value.
    NotVirtio,
    /// Transport version is not supported.
    UnsupportedVersion(u32),
    /// Window or function is VirtIO but has no device behind it.
    NoDevice,
    /// A required PCI capability structure is missing.
    MissingCapability,
    /// Device configuration access past the end of the region.
    ConfigOutOfRange,
    /// Interrupt line could not be bound.
    IrqUnavailable,
    /// Operation does not apply to this transport.
    TransportMismatch,
    /// Device-class driver rejected the device.
    InitFailed,
}

impl fmt::Display for VirtioError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VirtioError::InvalidRingIndex(index) => write!(f, "invalid ring index {}", index),
            VirtioError::RingAlreadyActive(index) => write!(f, "ring {} already active", index),
            VirtioError::UnsupportedRingLength(len) => write!(f, "unsupported ring length {}", len),
            VirtioError::QueueUnavailable => write!(f, "queue unavailable"),
            VirtioError::NoMemory => write!(f, "out of memory"),
            VirtioError::AddressOutOfRange => write!(f, "ring address out of range"),
            VirtioError::NotVirtio => write!(f, "not a VirtIO device"),
            VirtioError::UnsupportedVersion(v) => write!(f, "unsupported transport version {}", v),
            VirtioError::NoDevice => write!(f, "no device present"),
            VirtioError::MissingCapability => write!(f, "missing PCI capability"),
            VirtioError::ConfigOutOfRange => write!(f, "config access out of range"),
            VirtioError::IrqUnavailable => write!(f, "interrupt unavailable"),
            VirtioError::TransportMismatch => write!(f, "wrong transport"),
            VirtioError::InitFailed => write!(f, "device init failed"),
        }
    }
}

/// Result type for VirtIO operations.
pub type Result<T> = core::result::Result<T, VirtioError>;

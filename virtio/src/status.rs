//! Device status register.

use bitflags::bitflags;

bitflags! {
    /// Device status bits, shared by every transport.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DeviceStatus: u8 {
        /// Guest has noticed the device.
        const ACKNOWLEDGE = 1;
        /// Guest knows how to drive the device.
        const DRIVER = 2;
        /// Driver is set up and ready to drive the device.
        const DRIVER_OK = 4;
        /// Feature negotiation complete.
        const FEATURES_OK = 8;
        /// Device hit an error it cannot recover from without a reset.
        const DEVICE_NEEDS_RESET = 64;
        /// Guest gave up on the device.
        const FAILED = 128;
    }
}

bitflags! {
    /// Interrupt status bits (MMIO `InterruptStatus`, PCI ISR byte).
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct InterruptStatus: u32 {
        /// Device used a buffer in at least one virtqueue.
        const USED_BUFFER = 1 << 0;
        /// Device configuration changed.
        const CONFIG_CHANGE = 1 << 1;
    }
}

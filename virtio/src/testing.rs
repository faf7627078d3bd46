//! Test doubles for the device side.
//!
//! Everything here talks to the driver the way real hardware would: through
//! register windows in memory and through the raw ring addresses.

use alloc::boxed::Box;
use alloc::vec;
use core::ptr;
use core::sync::atomic::{AtomicU16, Ordering};

use crate::ring::{UsedElem, Vring, VringDesc};
use crate::transport::mmio::{regs, MMIO_WINDOW_SIZE, VIRTIO_MMIO_MAGIC};
use crate::transport::pci::PciFunction;
use crate::{Result, VirtioError};

/// Heap-backed MMIO register windows, laid out back to back.
pub struct FakeMmioWindow {
    mem: *mut u32,
    words: usize,
}

impl FakeMmioWindow {
    /// `count` windows with no device behind them.
    pub fn empty(count: usize) -> Self {
        let words = count * MMIO_WINDOW_SIZE / 4;
        let mem = Box::into_raw(vec![0u32; words].into_boxed_slice()) as *mut u32;
        Self { mem, words }
    }

    /// One window holding a device.
    pub fn new(version: u32, device_id: u32) -> Self {
        let mut window = Self::empty(1);
        window.install(0, version, device_id);
        window
    }

    /// Populate the identification registers of window `i`.
    pub fn install(&mut self, i: usize, version: u32, device_id: u32) {
        self.set_at(i, regs::MAGIC_VALUE, VIRTIO_MMIO_MAGIC);
        self.set_at(i, regs::VERSION, version);
        self.set_at(i, regs::DEVICE_ID, device_id);
        self.set_at(i, regs::VENDOR_ID, 0x554d_4551);
        self.set_at(i, regs::QUEUE_NUM_MAX, 256);
    }

    pub fn base(&mut self) -> *mut u8 {
        self.mem.cast()
    }

    fn word(&self, i: usize, offset: usize) -> *mut u32 {
        let index = (i * MMIO_WINDOW_SIZE + offset) / 4;
        assert!(index < self.words);
        // SAFETY: bounds checked above.
        unsafe { self.mem.add(index) }
    }

    pub fn set_at(&mut self, i: usize, offset: usize, val: u32) {
        unsafe { ptr::write_volatile(self.word(i, offset), val) }
    }

    pub fn get_at(&self, i: usize, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.word(i, offset)) }
    }

    pub fn set(&mut self, offset: usize, val: u32) {
        self.set_at(0, offset, val)
    }

    pub fn get(&self, offset: usize) -> u32 {
        self.get_at(0, offset)
    }
}

impl Drop for FakeMmioWindow {
    fn drop(&mut self) {
        // SAFETY: created by Box::into_raw in `empty` with this length.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.mem, self.words)));
        }
    }
}

/// Offsets of the capability regions inside the fake BAR 0.
pub const BAR_COMMON: usize = 0x0000;
pub const BAR_ISR: usize = 0x1000;
pub const BAR_DEVICE: usize = 0x2000;
pub const BAR_NOTIFY: usize = 0x3000;
pub const BAR_SIZE: usize = 0x4000;
pub const NOTIFY_MULTIPLIER: u32 = 4;

/// View into the fake BAR memory that outlives the move into a transport.
#[derive(Clone, Copy)]
pub struct BarView {
    base: *mut u8,
}

impl BarView {
    fn at<T>(&self, offset: usize) -> *mut T {
        assert!(offset + core::mem::size_of::<T>() <= BAR_SIZE);
        unsafe { self.base.add(offset).cast() }
    }

    pub fn read8(&self, offset: usize) -> u8 {
        unsafe { ptr::read_volatile(self.at(offset)) }
    }

    pub fn read16(&self, offset: usize) -> u16 {
        unsafe { ptr::read_volatile(self.at(offset)) }
    }

    pub fn read32(&self, offset: usize) -> u32 {
        unsafe { ptr::read_volatile(self.at(offset)) }
    }

    pub fn read64(&self, offset: usize) -> u64 {
        (self.read32(offset + 4) as u64) << 32 | self.read32(offset) as u64
    }

    pub fn write8(&self, offset: usize, val: u8) {
        unsafe { ptr::write_volatile(self.at(offset), val) }
    }

    pub fn write16(&self, offset: usize, val: u16) {
        unsafe { ptr::write_volatile(self.at(offset), val) }
    }
}

/// A VirtIO PCI function with a heap-backed BAR 0.
pub struct FakePciFunction {
    config: [u8; 256],
    bar: *mut u64,
    irq: Option<u32>,
}

unsafe impl Send for FakePciFunction {}

impl FakePciFunction {
    /// Function with the four VirtIO capabilities all pointing into BAR 0.
    pub fn new(vendor_id: u16, device_id: u16) -> Self {
        let mut fake = Self::without_capabilities(device_id);
        fake.put16(0x00, vendor_id);
        fake.put16(0x06, 1 << 4);
        fake.config[0x34] = 0x40;

        // A non-vendor capability (power management) first, as on real hardware.
        fake.config[0x40] = 0x01;
        fake.config[0x41] = 0x50;

        fake.put_virtio_cap(0x50, 0x60, 1, BAR_COMMON, 0x38);
        fake.put_virtio_cap(0x60, 0x74, 2, BAR_NOTIFY, 0x100);
        fake.put32(0x70, NOTIFY_MULTIPLIER);
        fake.put_virtio_cap(0x74, 0x84, 3, BAR_ISR, 1);
        fake.put_virtio_cap(0x84, 0x00, 4, BAR_DEVICE, 0x100);

        // Device offers 256-entry queues.
        fake.bar().write16(BAR_COMMON + 0x18, 256);
        fake
    }

    /// VirtIO vendor and device IDs but an empty capability list.
    pub fn without_capabilities(device_id: u16) -> Self {
        let bar = Box::into_raw(vec![0u64; BAR_SIZE / 8].into_boxed_slice()) as *mut u64;
        let mut fake = Self {
            config: [0; 256],
            bar,
            irq: Some(32),
        };
        fake.put16(0x00, 0x1af4);
        fake.put16(0x02, device_id);
        fake
    }

    pub fn with_irq(mut self, irq: Option<u32>) -> Self {
        self.irq = irq;
        self
    }

    pub fn bar(&self) -> BarView {
        BarView { base: self.bar.cast() }
    }

    /// Overwrite one byte of configuration space.
    pub fn set_config_u8(&mut self, offset: usize, val: u8) {
        self.config[offset] = val;
    }

    pub fn set_config_u32(&mut self, offset: usize, val: u32) {
        self.put32(offset, val);
    }

    fn put16(&mut self, offset: usize, val: u16) {
        self.config[offset..offset + 2].copy_from_slice(&val.to_le_bytes());
    }

    fn put32(&mut self, offset: usize, val: u32) {
        self.config[offset..offset + 4].copy_from_slice(&val.to_le_bytes());
    }

    fn put_virtio_cap(&mut self, at: usize, next: u8, kind: u8, offset: usize, length: u32) {
        self.config[at] = 0x09;
        self.config[at + 1] = next;
        self.config[at + 2] = 16;
        self.config[at + 3] = kind;
        self.config[at + 4] = 0;
        self.put32(at + 8, offset as u32);
        self.put32(at + 12, length);
    }
}

impl Drop for FakePciFunction {
    fn drop(&mut self) {
        // SAFETY: created by Box::into_raw with BAR_SIZE / 8 words.
        unsafe {
            drop(Box::from_raw(ptr::slice_from_raw_parts_mut(self.bar, BAR_SIZE / 8)));
        }
    }
}

impl PciFunction for FakePciFunction {
    fn read_config_u8(&self, offset: u8) -> u8 {
        self.config[offset as usize]
    }

    fn read_config_u16(&self, offset: u8) -> u16 {
        let o = offset as usize;
        u16::from_le_bytes([self.config[o], self.config[o + 1]])
    }

    fn read_config_u32(&self, offset: u8) -> u32 {
        let o = offset as usize;
        u32::from_le_bytes([
            self.config[o],
            self.config[o + 1],
            self.config[o + 2],
            self.config[o + 3],
        ])
    }

    fn bar_address(&self, bar: u8) -> Option<u64> {
        (bar == 0).then(|| self.bar as u64)
    }

    fn allocate_irq(&mut self) -> Result<u32> {
        self.irq.ok_or(VirtioError::IrqUnavailable)
    }
}

/// Device half of a split ring, working only from the ring's addresses.
pub struct DeviceModel {
    desc: usize,
    avail: usize,
    used: usize,
    num: u16,
    last_avail: u16,
    used_idx: u16,
}

// Addresses only; the ring memory outlives every test's model.
unsafe impl Send for DeviceModel {}

impl DeviceModel {
    pub fn attach(ring: &Vring) -> Self {
        Self {
            desc: ring.desc_addr() as usize,
            avail: ring.avail_addr() as usize,
            used: ring.used_addr() as usize,
            num: ring.num(),
            last_avail: 0,
            used_idx: 0,
        }
    }

    fn avail_idx(&self) -> &AtomicU16 {
        unsafe { &*((self.avail + 2) as *const AtomicU16) }
    }

    fn used_idx_cell(&self) -> &AtomicU16 {
        unsafe { &*((self.used + 2) as *const AtomicU16) }
    }

    /// Next chain head the driver made available, if any.
    pub fn poll_avail(&mut self) -> Option<u16> {
        let published = self.avail_idx().load(Ordering::Acquire);
        if published == self.last_avail {
            return None;
        }
        let slot = (self.last_avail % self.num) as usize;
        let head = unsafe { ptr::read_volatile((self.avail + 4 + 2 * slot) as *const u16) };
        self.last_avail = self.last_avail.wrapping_add(1);
        Some(head)
    }

    pub fn read_desc(&self, index: u16) -> VringDesc {
        assert!(index < self.num);
        unsafe { ptr::read_volatile((self.desc + VringDesc::SIZE * index as usize) as *const VringDesc) }
    }

    /// Publish a used entry for `head`.
    pub fn complete(&mut self, head: u16, len: u32) {
        let slot = (self.used_idx % self.num) as usize;
        let elem = UsedElem { id: head as u32, len };
        unsafe { ptr::write_volatile((self.used + 4 + 8 * slot) as *mut UsedElem, elem) };
        self.used_idx = self.used_idx.wrapping_add(1);
        self.used_idx_cell().store(self.used_idx, Ordering::Release);
    }
}

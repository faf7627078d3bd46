//! Split-ring descriptor format.

use bitflags::bitflags;

use crate::DESC_NONE;

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct DescFlags: u16 {
        /// Buffer continues via the next field.
        const NEXT = 1 << 0;
        /// Buffer is write-only for the device.
        const WRITE = 1 << 1;
        /// Buffer contains a list of buffer descriptors.
        const INDIRECT = 1 << 2;
    }
}

/// A virtqueue descriptor, laid out exactly as the device reads it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct VringDesc {
    /// Address of the buffer.
    pub addr: u64,
    /// Length of the buffer.
    pub len: u32,
    /// Raw descriptor flags.
    pub flags: u16,
    /// Next descriptor in the chain, or next free slot while on the free list.
    pub next: u16,
}

const _: () = assert!(core::mem::size_of::<VringDesc>() == 16);

impl VringDesc {
    pub const SIZE: usize = core::mem::size_of::<Self>();

    /// Flags as a [`DescFlags`] bitfield.
    #[inline]
    pub fn flags(&self) -> DescFlags {
        DescFlags::from_bits_truncate(self.flags)
    }

    #[inline]
    pub fn has_next(&self) -> bool {
        self.flags().contains(DescFlags::NEXT)
    }

    #[inline]
    pub fn is_device_writable(&self) -> bool {
        self.flags().contains(DescFlags::WRITE)
    }

    /// Chain link of an allocated descriptor.
    #[inline]
    pub fn link(&self) -> Link {
        if self.has_next() {
            Link::Next(self.next)
        } else {
            Link::End
        }
    }
}

/// Chain link of an allocated descriptor.
///
/// The raw `next` field doubles as the free-list pointer inside the
/// allocator; outside of it only this view is handed out.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Link {
    /// Chain continues at this descriptor index.
    Next(u16),
    /// Last descriptor of its chain.
    End,
}

/// Mutable access to the payload fields of one allocated descriptor.
///
/// Address, length and the device-write direction belong to the caller.
/// Chain topology (`NEXT` and `next`) is set only by the chain builder, so a
/// `DescriptorMut` cannot extend a chain past what was allocated.
pub struct DescriptorMut<'a> {
    index: u16,
    desc: &'a mut VringDesc,
}

impl<'a> DescriptorMut<'a> {
    pub(crate) fn new(index: u16, desc: &'a mut VringDesc) -> Self {
        debug_assert!(index != DESC_NONE);
        Self { index, desc }
    }

    /// Index of this descriptor in its table.
    pub fn index(&self) -> u16 {
        self.index
    }

    pub fn set_addr(&mut self, addr: u64) -> &mut Self {
        self.desc.addr = addr;
        self
    }

    pub fn set_len(&mut self, len: u32) -> &mut Self {
        self.desc.len = len;
        self
    }

    /// Mark the buffer device-writable (`true`) or device-readable (`false`).
    pub fn set_device_writable(&mut self, writable: bool) -> &mut Self {
        let mut flags = self.desc.flags();
        flags.set(DescFlags::WRITE, writable);
        self.desc.flags = flags.bits();
        self
    }

    /// Fill address, length and direction in one go.
    pub fn set_buffer(&mut self, addr: u64, len: u32, device_writable: bool) -> &mut Self {
        self.set_addr(addr).set_len(len).set_device_writable(device_writable)
    }

    pub fn link(&self) -> Link {
        self.desc.link()
    }

    /// Read-only view of the underlying descriptor.
    pub fn get(&self) -> &VringDesc {
        self.desc
    }
}

/// Log the contents of a descriptor.
pub fn dump_desc(desc: &VringDesc) {
    log::info!(
        "[VirtIO] vring_desc {:p}: addr {:#x} len {:#x} flags {:#x} next {:#x}",
        desc as *const VringDesc,
        desc.addr,
        desc.len,
        desc.flags,
        desc.next
    );
}

//! Memory layout of a split virtqueue.
//!
//! One zeroed allocation holds the three parts of a ring, placed the way the
//! legacy interface requires so that a single base address describes the
//! whole queue:
//!
//! ```text
//! +--------------------+ 0
//! | descriptor table   | 16 * num
//! +--------------------+
//! | available ring     | flags, idx, ring[num], used_event
//! +--------------------+ aligned to LEGACY_QUEUE_ALIGN
//! | used ring          | flags, idx, ring[num] {id, len}, avail_event
//! +--------------------+
//! ```
//!
//! Modern transports take the three addresses separately and accept the
//! same placement.

use alloc::alloc::{alloc_zeroed, dealloc, Layout};
use core::ptr::NonNull;
use core::sync::atomic::AtomicU16;

use super::desc::VringDesc;
use crate::{Result, VirtioError};

/// Page size and used-ring alignment of the legacy interface.
pub const LEGACY_QUEUE_ALIGN: usize = 4096;

/// Used ring element.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsedElem {
    /// Index of the descriptor chain head.
    pub id: u32,
    /// Total bytes written into the chain's buffers by the device.
    pub len: u32,
}

const _: () = assert!(core::mem::size_of::<UsedElem>() == 8);

/// Available ring: `flags`, `idx`, `ring[num]`, `used_event`.
const AVAIL_IDX_OFFSET: usize = 2;
const AVAIL_RING_OFFSET: usize = 4;

/// Used ring: `flags`, `idx`, `ring[num]`, `avail_event`.
const USED_IDX_OFFSET: usize = 2;
const USED_RING_OFFSET: usize = 4;

#[inline]
const fn align_up(val: usize, align: usize) -> usize {
    (val + align - 1) & !(align - 1)
}

/// Bytes needed for a ring of `num` descriptors with the used ring at `align`.
pub const fn vring_size(num: usize, align: usize) -> usize {
    let desc_and_avail = VringDesc::SIZE * num + 2 * (3 + num);
    align_up(desc_and_avail, align) + 2 * 3 + core::mem::size_of::<UsedElem>() * num
}

/// Owned, page-aligned backing store of one split ring.
pub struct RingMemory {
    base: NonNull<u8>,
    layout: Layout,
    num: u16,
    avail_offset: usize,
    used_offset: usize,
}

// The allocation is exclusively owned; the device is the only other party.
unsafe impl Send for RingMemory {}

impl RingMemory {
    /// Allocate zeroed memory for a ring of `num` descriptors.
    pub fn new(num: u16) -> Result<Self> {
        let count = num as usize;
        let size = vring_size(count, LEGACY_QUEUE_ALIGN);
        let layout =
            Layout::from_size_align(size, LEGACY_QUEUE_ALIGN).map_err(|_| VirtioError::NoMemory)?;

        // SAFETY: layout has a non-zero size.
        let base = NonNull::new(unsafe { alloc_zeroed(layout) }).ok_or(VirtioError::NoMemory)?;

        let avail_offset = VringDesc::SIZE * count;
        let used_offset = align_up(avail_offset + 2 * (3 + count), LEGACY_QUEUE_ALIGN);

        Ok(Self {
            base,
            layout,
            num,
            avail_offset,
            used_offset,
        })
    }

    pub fn num(&self) -> u16 {
        self.num
    }

    /// Total size of the allocation in bytes.
    pub fn size(&self) -> usize {
        self.layout.size()
    }

    pub fn desc_addr(&self) -> u64 {
        self.base.as_ptr() as u64
    }

    pub fn avail_addr(&self) -> u64 {
        self.desc_addr() + self.avail_offset as u64
    }

    pub fn used_addr(&self) -> u64 {
        self.desc_addr() + self.used_offset as u64
    }

    pub(crate) fn desc_table(&self) -> *mut VringDesc {
        self.base.as_ptr().cast()
    }

    /// Driver-published available index.
    pub(crate) fn avail_idx(&self) -> &AtomicU16 {
        // SAFETY: in bounds and 2-byte aligned; AtomicU16 has u16's layout.
        unsafe { &*(self.base.as_ptr().add(self.avail_offset + AVAIL_IDX_OFFSET) as *const AtomicU16) }
    }

    pub(crate) fn avail_slot(&self, slot: u16) -> *mut u16 {
        debug_assert!(slot < self.num);
        // SAFETY: slot < num keeps the pointer inside the available ring.
        unsafe {
            self.base
                .as_ptr()
                .add(self.avail_offset + AVAIL_RING_OFFSET + 2 * slot as usize)
                .cast()
        }
    }

    /// Device-published used index.
    pub(crate) fn used_idx(&self) -> &AtomicU16 {
        // SAFETY: in bounds and aligned to LEGACY_QUEUE_ALIGN + 2.
        unsafe { &*(self.base.as_ptr().add(self.used_offset + USED_IDX_OFFSET) as *const AtomicU16) }
    }

    pub(crate) fn used_elem(&self, slot: u16) -> *const UsedElem {
        debug_assert!(slot < self.num);
        // SAFETY: slot < num keeps the pointer inside the used ring.
        unsafe {
            self.base
                .as_ptr()
                .add(self.used_offset + USED_RING_OFFSET + core::mem::size_of::<UsedElem>() * slot as usize)
                .cast()
        }
    }
}

impl Drop for RingMemory {
    fn drop(&mut self) {
        // SAFETY: allocated in `new` with this layout.
        unsafe { dealloc(self.base.as_ptr(), self.layout) };
    }
}

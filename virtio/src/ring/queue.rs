//! Driver side of one split virtqueue.
//!
//! A [`Vring`] owns the ring memory, the free list threaded through the
//! descriptors' `next` fields, and the two cursors the driver keeps: the
//! shadow available index and the last used index it has consumed.
//!
//! An ownership bitmap records which descriptors are handed out. Frees of
//! descriptors that are not owned, and chains that leave the owned set or
//! revisit a descriptor, are rejected whole, so the free list never holds
//! an index twice.

use alloc::vec;
use alloc::vec::Vec;
use core::ptr;
use core::sync::atomic::{fence, Ordering};

use super::desc::{DescFlags, DescriptorMut, VringDesc};
use super::layout::{RingMemory, UsedElem};
use crate::{Result, VirtioError, DESC_NONE, MAX_RING_LEN};

/// Check that `len` is a usable split-ring queue size.
pub fn is_valid_ring_len(len: u16) -> bool {
    len != 0 && len.is_power_of_two() && len <= MAX_RING_LEN
}

/// One split virtqueue.
pub struct Vring {
    mem: RingMemory,
    num: u16,
    free_list: u16,
    free_count: u16,
    /// One bit per descriptor, set while it is off the free list.
    in_use: Vec<u64>,
    avail_idx: u16,
    last_used: u16,
}

impl Vring {
    /// Allocate a ring of `num` descriptors with every descriptor free.
    pub fn new(num: u16) -> Result<Self> {
        if !is_valid_ring_len(num) {
            return Err(VirtioError::UnsupportedRingLength(num));
        }

        let mem = RingMemory::new(num)?;
        let mut ring = Vring {
            mem,
            num,
            free_list: DESC_NONE,
            free_count: 0,
            in_use: vec![0; (num as usize + 63) / 64],
            avail_idx: 0,
            last_used: 0,
        };
        ring.init_free_list();
        Ok(ring)
    }

    /// Thread the free list through every descriptor in index order.
    fn init_free_list(&mut self) {
        let num = self.num;
        for (i, desc) in self.table_mut().iter_mut().enumerate() {
            let i = i as u16;
            desc.flags = 0;
            desc.next = if i + 1 < num { i + 1 } else { DESC_NONE };
        }
        self.free_list = 0;
        self.free_count = num;
    }

    fn is_in_use(&self, index: u16) -> bool {
        self.in_use[index as usize / 64] & (1 << (index % 64)) != 0
    }

    fn set_in_use(&mut self, index: u16, in_use: bool) {
        let word = &mut self.in_use[index as usize / 64];
        if in_use {
            *word |= 1 << (index % 64);
        } else {
            *word &= !(1 << (index % 64));
        }
    }

    fn table(&self) -> &[VringDesc] {
        // SAFETY: the table holds `num` descriptors and lives as long as `mem`.
        unsafe { core::slice::from_raw_parts(self.mem.desc_table(), self.num as usize) }
    }

    fn table_mut(&mut self) -> &mut [VringDesc] {
        // SAFETY: as above; `&mut self` gives exclusive driver-side access.
        unsafe { core::slice::from_raw_parts_mut(self.mem.desc_table(), self.num as usize) }
    }

    /// Number of descriptors in the table.
    pub fn num(&self) -> u16 {
        self.num
    }

    pub fn free_count(&self) -> u16 {
        self.free_count
    }

    /// Driver's copy of the available index.
    pub fn avail_idx(&self) -> u16 {
        self.avail_idx
    }

    /// Used index up to which completions have been consumed.
    pub fn last_used(&self) -> u16 {
        self.last_used
    }

    pub fn desc_addr(&self) -> u64 {
        self.mem.desc_addr()
    }

    pub fn avail_addr(&self) -> u64 {
        self.mem.avail_addr()
    }

    pub fn used_addr(&self) -> u64 {
        self.mem.used_addr()
    }

    /// Look up a descriptor by index.
    ///
    /// Panics on [`DESC_NONE`] or an index outside the table.
    pub fn desc(&self, index: u16) -> &VringDesc {
        assert!(index != DESC_NONE, "descriptor index is the sentinel");
        &self.table()[index as usize]
    }

    /// Payload access to an allocated descriptor.
    ///
    /// Panics on [`DESC_NONE`] or an index outside the table.
    pub fn desc_mut(&mut self, index: u16) -> DescriptorMut<'_> {
        assert!(index != DESC_NONE, "descriptor index is the sentinel");
        DescriptorMut::new(index, &mut self.table_mut()[index as usize])
    }

    /// Pop a descriptor off the free list, or [`DESC_NONE`] when empty.
    pub fn alloc_desc(&mut self) -> u16 {
        let index = self.free_list;
        if index == DESC_NONE {
            return DESC_NONE;
        }

        let desc = &mut self.table_mut()[index as usize];
        let next = desc.next;
        desc.flags = 0;
        desc.next = 0;

        self.free_list = next;
        self.free_count -= 1;
        self.set_in_use(index, true);
        log::trace!("[VirtIO] alloc desc {} ({} free)", index, self.free_count);
        index
    }

    /// Push one descriptor back onto the free list.
    ///
    /// The descriptor must not be part of an in-flight chain or referenced
    /// by either ring. Freeing a descriptor that is already free is logged
    /// and ignored.
    pub fn free_desc(&mut self, index: u16) {
        assert!(index < self.num, "descriptor index {} out of range", index);
        if !self.is_in_use(index) {
            log::error!("[VirtIO] free of unallocated desc {}, ignored", index);
            return;
        }
        self.set_in_use(index, false);

        let head = self.free_list;
        let desc = &mut self.table_mut()[index as usize];
        desc.flags = 0;
        desc.next = head;

        self.free_list = index;
        self.free_count += 1;
        log::trace!("[VirtIO] free desc {} ({} free)", index, self.free_count);
    }

    /// Return every descriptor of the chain starting at `head`.
    ///
    /// A chain that reaches a free or out-of-range descriptor, or loops, is
    /// logged and left untouched.
    pub fn free_desc_chain(&mut self, head: u16) {
        let Some(len) = self.owned_chain_len(head) else {
            log::error!("[VirtIO] chain at {} is corrupt, not freed", head);
            return;
        };

        let mut index = head;
        for _ in 0..len {
            let next = self.table()[index as usize].next;
            self.free_desc(index);
            index = next;
        }
    }

    /// Length of the chain at `head` if every link stays inside the owned set.
    ///
    /// A walk longer than the number of owned descriptors must have revisited
    /// one of them.
    fn owned_chain_len(&self, head: u16) -> Option<u16> {
        let owned = self.num - self.free_count;
        let mut index = head;
        let mut len = 0;
        loop {
            if index >= self.num || !self.is_in_use(index) || len == owned {
                return None;
            }
            len += 1;

            let desc = &self.table()[index as usize];
            if !desc.has_next() {
                return Some(len);
            }
            index = desc.next;
        }
    }

    /// Allocate `count` descriptors linked in allocation order.
    ///
    /// Returns the head index and a handle to the head descriptor, or `None`
    /// with the free list untouched if `count` descriptors are not available.
    pub fn alloc_desc_chain(&mut self, count: usize) -> Option<(u16, DescriptorMut<'_>)> {
        if count == 0 || count > self.free_count as usize {
            return None;
        }

        let head = self.alloc_desc();
        debug_assert!(head != DESC_NONE, "free list shorter than free_count");
        self.clear_payload(head);

        let mut last = head;
        for _ in 1..count {
            let index = self.alloc_desc();
            debug_assert!(index != DESC_NONE, "free list shorter than free_count");
            self.clear_payload(index);

            let prev = &mut self.table_mut()[last as usize];
            prev.flags |= DescFlags::NEXT.bits();
            prev.next = index;
            last = index;
        }

        log::trace!("[VirtIO] alloc chain head {} len {}", head, count);
        Some((head, self.desc_mut(head)))
    }

    fn clear_payload(&mut self, index: u16) {
        self.table_mut()[index as usize] = VringDesc::default();
    }

    /// Iterate over the descriptor indices of a chain.
    pub fn chain(&self, head: u16) -> ChainIter<'_> {
        ChainIter {
            table: self.table(),
            next: Some(head),
            remaining: self.num,
        }
    }

    /// Log every descriptor of a chain; returns how many were printed.
    pub fn dump_chain(&self, head: u16) -> usize {
        let mut count = 0;
        for index in self.chain(head) {
            super::desc::dump_desc(self.desc(index));
            count += 1;
        }
        count
    }

    /// Publish a fully built chain on the available ring.
    pub fn submit_chain(&mut self, head: u16) {
        assert!(head < self.num, "chain head {} out of range", head);

        #[cfg(feature = "debug-rings")]
        self.dump_chain(head);

        let slot = self.avail_idx & (self.num - 1);

        // Descriptor contents before the slot.
        fence(Ordering::Release);
        // SAFETY: slot < num.
        unsafe { ptr::write_volatile(self.mem.avail_slot(slot), head) };

        // Slot before the index; the device may consume from here on.
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.mem.avail_idx().store(self.avail_idx, Ordering::Release);

        log::trace!("[VirtIO] submit chain {} at slot {}", head, slot);
    }

    /// True if the device has published used entries not yet consumed.
    pub fn has_used(&self) -> bool {
        self.mem.used_idx().load(Ordering::Acquire) != self.last_used
    }

    /// Take the next used entry, if the device has published one.
    pub fn pop_used(&mut self) -> Option<UsedElem> {
        let used_idx = self.mem.used_idx().load(Ordering::Acquire);
        if used_idx == self.last_used {
            return None;
        }

        let slot = self.last_used & (self.num - 1);
        // SAFETY: slot < num; the acquire load above orders this read.
        let elem = unsafe { ptr::read_volatile(self.mem.used_elem(slot)) };
        self.last_used = self.last_used.wrapping_add(1);
        Some(elem)
    }
}

/// Iterator over the indices of a descriptor chain.
pub struct ChainIter<'a> {
    table: &'a [VringDesc],
    next: Option<u16>,
    remaining: u16,
}

impl Iterator for ChainIter<'_> {
    type Item = u16;

    fn next(&mut self) -> Option<u16> {
        let index = self.next.take()?;
        if self.remaining == 0 || index as usize >= self.table.len() {
            return None;
        }
        self.remaining -= 1;

        let desc = &self.table[index as usize];
        if desc.has_next() {
            self.next = Some(desc.next);
        }
        Some(index)
    }
}

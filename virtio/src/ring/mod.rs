//! Split virtqueues.
//!
//! Virtqueues are the mechanism for bulk data transport between the driver
//! and the device. Each queue consists of:
//! - Descriptor table: describes memory buffers
//! - Available ring: driver tells device which chains are ready
//! - Used ring: device tells driver which chains are consumed
//!
//! Only descriptor indices cross the shared boundary; the driver never hands
//! the device a pointer into its own bookkeeping.

pub mod desc;
pub mod layout;
pub mod queue;

pub use desc::{dump_desc, DescFlags, DescriptorMut, Link, VringDesc};
pub use layout::{vring_size, RingMemory, UsedElem, LEGACY_QUEUE_ALIGN};
pub use queue::{is_valid_ring_len, ChainIter, Vring};

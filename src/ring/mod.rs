//! Split-ring virtqueue infrastructure.
//!
//! This module family implements the virtio split virtqueue: the shared
//! data structure through which a driver and a device exchange buffers.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────────┐
//! │                     Driver side (Virtqueue)                     │
//! │   - Builds descriptor chains for caller buffers                 │
//! │   - Publishes chain heads into the available ring               │
//! │   - Pops completions from the used ring                         │
//! └──────────────────────────┬──────────────────────────────────────┘
//!                            │ Shared memory (three ring structures)
//! ┌──────────────────────────▼──────────────────────────────────────┐
//! │                     Device side (DeviceQueue)                   │
//! │   - Pops chain heads from the available ring                    │
//! │   - Walks descriptor chains (direct or indirect)                │
//! │   - Publishes completions into the used ring                    │
//! └─────────────────────────────────────────────────────────────────┘
//! ```
//!
//! Each side is the sole writer of its own ring and the sole reader of the
//! peer's; no locks are shared. Correctness rests on single-writer
//! discipline, explicit fences at every index publication, and wrap-aware
//! u16 index arithmetic: the free-running `idx` counters wrap modulo 2^16
//! while ring slots are addressed modulo the queue size.
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>
//! section 2.6 (split virtqueues).

pub mod codec;
pub mod device;
pub mod driver;

use crate::mem::MemoryError;
use bitflags::bitflags;
use thiserror::Error;

// ============================================================================
// Wire constants
// ============================================================================

/// Maximum queue size the split ring supports.
pub const MAX_QUEUE_SIZE: u16 = 32768;

/// Alignment of the used ring relative to the ring base, per the PCI
/// transport layout.
pub const RING_ALIGN: u64 = 4096;

/// Size of one descriptor record on the wire.
pub const DESC_SIZE: u64 = 16;

/// Size of one used-ring element on the wire.
pub const USED_ELEM_SIZE: u64 = 8;

/// Used-ring flag: device asks the driver not to kick when buffers are added.
pub const USED_F_NO_NOTIFY: u16 = 1;

/// Available-ring flag: driver asks the device not to interrupt when buffers
/// are consumed.
pub const AVAIL_F_NO_INTERRUPT: u16 = 1;

bitflags! {
    /// Descriptor flags.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct DescFlags: u16 {
        /// Buffer continues via the `next` field.
        const NEXT = 1;
        /// Buffer is device-writable (otherwise device-readable).
        const WRITE = 2;
        /// Buffer holds an out-of-line table of further descriptors.
        const INDIRECT = 4;
    }
}

bitflags! {
    /// Negotiated feature bits the ring engine itself consumes.
    ///
    /// Bit positions match the virtio feature numbering so an embedder can
    /// mask these straight out of a transport's negotiated feature word.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct Features: u64 {
        /// Device wants a kick whenever the ring empties out.
        const NOTIFY_ON_EMPTY = 1 << 24;
        /// Indirect descriptor tables may be used.
        const INDIRECT_DESC = 1 << 28;
        /// Both sides publish event indices instead of the coarse
        /// suppression flags.
        const EVENT_IDX = 1 << 29;
    }
}

// ============================================================================
// Buffers
// ============================================================================

/// One physically-contiguous buffer inside the shared region.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Buffer {
    /// Address of the buffer within the shared region.
    pub addr: u64,
    /// Length of the buffer in bytes.
    pub len: u32,
}

impl Buffer {
    /// Convenience constructor.
    pub fn new(addr: u64, len: u32) -> Self {
        Self { addr, len }
    }
}

/// A caller-allocated region for an indirect descriptor table.
///
/// The table must be contiguous in the shared region and large enough for
/// `capacity` descriptor records (16 bytes each).
#[derive(Debug, Clone, Copy)]
pub struct IndirectTable {
    /// Address of the table within the shared region.
    pub addr: u64,
    /// Number of descriptor records the table can hold.
    pub capacity: u16,
}

// ============================================================================
// Index arithmetic
// ============================================================================

/// Whether a side that moved its ring index from `old_idx` to `new_idx`
/// needs to signal a peer that asked to be woken at `event_idx`.
///
/// This is the event-index suppression comparison; it must be computed in
/// wrapping u16 arithmetic exactly as written, since the free-running
/// indices wrap modulo 2^16. The condition holds when `event_idx` lies in
/// the half-open window `[old_idx, new_idx)`.
pub fn need_event(event_idx: u16, new_idx: u16, old_idx: u16) -> bool {
    new_idx.wrapping_sub(event_idx).wrapping_sub(1) < new_idx.wrapping_sub(old_idx)
}

// ============================================================================
// Ring layout
// ============================================================================

/// Byte addresses of every field of a split ring at a given base.
///
/// Layout, with `size` the queue size:
///
/// ```text
/// base                 desc[size]           16 × size bytes
/// base + 16*size       avail.flags          2 bytes
///                      avail.idx            2 bytes
///                      avail.ring[size]     2 × size bytes
///                      used_event           2 bytes
///                      ... padding to the next 4096 boundary ...
/// used base            used.flags           2 bytes
///                      used.idx             2 bytes
///                      used.ring[size]      8 × size bytes
///                      avail_event          2 bytes
/// ```
///
/// The two event words sit in the tail slot of the *opposite* ring: the
/// driver publishes `used_event` after its available ring, the device
/// publishes `avail_event` after its used ring.
#[derive(Debug, Clone, Copy)]
pub struct RingLayout {
    base: u64,
    size: u16,
}

impl RingLayout {
    /// Describe a ring of `size` entries based at `base`.
    pub fn new(base: u64, size: u16) -> Self {
        Self { base, size }
    }

    /// The queue size this layout was computed for.
    pub fn queue_size(&self) -> u16 {
        self.size
    }

    /// Base address of the ring structures.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Total bytes occupied by the three ring structures for `size` entries.
    pub fn byte_size(size: u16) -> u64 {
        let size = size as u64;
        let driver_area = DESC_SIZE * size + 2 * (3 + size);
        align_up(driver_area) + 2 * 3 + USED_ELEM_SIZE * size
    }

    /// Address of descriptor `index` in the descriptor table.
    pub fn desc_addr(&self, index: u16) -> u64 {
        self.base + DESC_SIZE * index as u64
    }

    /// Address of the available ring's flags word.
    pub fn avail_flags_addr(&self) -> u64 {
        self.base + DESC_SIZE * self.size as u64
    }

    /// Address of the available ring's free-running index.
    pub fn avail_idx_addr(&self) -> u64 {
        self.avail_flags_addr() + 2
    }

    /// Address of available ring slot `slot` (already reduced mod size).
    pub fn avail_slot_addr(&self, slot: u16) -> u64 {
        self.avail_flags_addr() + 4 + 2 * slot as u64
    }

    /// Address of the driver-published `used_event` word (tail of the
    /// available ring).
    pub fn used_event_addr(&self) -> u64 {
        self.avail_slot_addr(self.size)
    }

    /// Address of the used ring's flags word.
    pub fn used_flags_addr(&self) -> u64 {
        // The used ring starts at the next RING_ALIGN boundary after the
        // available ring's tail event word.
        self.base + align_up(self.used_event_addr() + 2 - self.base)
    }

    /// Address of the used ring's free-running index.
    pub fn used_idx_addr(&self) -> u64 {
        self.used_flags_addr() + 2
    }

    /// Address of used ring slot `slot` (already reduced mod size).
    pub fn used_slot_addr(&self, slot: u16) -> u64 {
        self.used_flags_addr() + 4 + USED_ELEM_SIZE * slot as u64
    }

    /// Address of the device-published `avail_event` word (tail of the used
    /// ring).
    pub fn avail_event_addr(&self) -> u64 {
        self.used_slot_addr(self.size)
    }

    /// One past the last byte of the ring structures.
    pub fn end(&self) -> u64 {
        self.base + Self::byte_size(self.size)
    }
}

/// Round `len` up to the next [`RING_ALIGN`] boundary.
fn align_up(len: u64) -> u64 {
    (len + RING_ALIGN - 1) & !(RING_ALIGN - 1)
}

// ============================================================================
// Errors
// ============================================================================

/// Errors from virtqueue operations.
///
/// `Full` and `IndirectCapacity` are recoverable: the caller retries once
/// the device drains the ring, or falls back to direct chaining. The
/// protocol-violation variants are fatal to the queue: they indicate a bug
/// or a misbehaving peer, the queue latches broken, and every subsequent
/// operation returns [`QueueError::Broken`].
#[derive(Debug, Error)]
pub enum QueueError {
    /// Not enough free descriptors for the requested chain.
    #[error("Queue is full")]
    Full,

    /// The caller-supplied indirect table cannot hold the chain.
    #[error("Indirect table too small: need {needed} descriptors, capacity {capacity}")]
    IndirectCapacity {
        /// Descriptors the chain requires.
        needed: u16,
        /// Descriptors the table can hold.
        capacity: u16,
    },

    /// Indirect descriptors were not negotiated for this queue.
    #[error("Indirect descriptors not negotiated")]
    IndirectUnsupported,

    /// A chain was submitted with no buffers at all.
    #[error("Descriptor chain has no buffers")]
    EmptyChain,

    /// Queue size is zero, not a power of two, or above the maximum.
    #[error("Invalid queue size {0} (must be a power of two <= {MAX_QUEUE_SIZE})")]
    InvalidQueueSize(u16),

    /// The peer referenced a descriptor index outside the table.
    #[error("Descriptor index {index} out of range (queue size {size})")]
    DescriptorOutOfRange {
        /// The offending index.
        index: u32,
        /// The queue size it had to stay below.
        size: u16,
    },

    /// A used-ring completion named an index that is not an in-flight chain
    /// head.
    #[error("Used element id {index} is not a chain head")]
    NotAChainHead {
        /// The offending index.
        index: u32,
    },

    /// A descriptor chain is longer than the walking bound allows, which
    /// implies a `next` cycle.
    #[error("Looped descriptor chain")]
    LoopedChain,

    /// An indirect table length is not a whole number of descriptors, is
    /// empty, or exceeds the queue size.
    #[error("Invalid indirect table length {len}")]
    BadIndirectLength {
        /// The table length in bytes.
        len: u32,
    },

    /// An indirect table contained another indirect descriptor; only one
    /// level of indirection is permitted.
    #[error("Nested indirect descriptor")]
    NestedIndirect,

    /// The driver moved the available index by more than the queue size in
    /// one step.
    #[error("Available index moved from {old} to {new}")]
    AvailIndexJump {
        /// Index the device had seen.
        old: u16,
        /// Index the driver published.
        new: u16,
    },

    /// The queue hit a fatal protocol violation earlier and is out of
    /// service until reset.
    #[error("Queue is broken")]
    Broken,

    /// The shared region rejected an access.
    #[error("Queue memory error: {0}")]
    Memory(#[from] MemoryError),
}

impl QueueError {
    /// Whether this error is a protocol violation that breaks the queue.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            QueueError::DescriptorOutOfRange { .. }
                | QueueError::NotAChainHead { .. }
                | QueueError::LoopedChain
                | QueueError::BadIndirectLength { .. }
                | QueueError::NestedIndirect
                | QueueError::AvailIndexJump { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_layout_size_256() {
        // Hand computation for queue size 256: descriptors fill 4096 bytes,
        // the available ring spans 4 + 512 + 2, and the used ring starts at
        // the next 4096 boundary.
        let layout = RingLayout::new(0, 256);
        assert_eq!(layout.avail_flags_addr(), 4096);
        assert_eq!(layout.avail_idx_addr(), 4098);
        assert_eq!(layout.avail_slot_addr(0), 4100);
        assert_eq!(layout.used_event_addr(), 4612);
        assert_eq!(layout.used_flags_addr(), 8192);
        assert_eq!(layout.used_idx_addr(), 8194);
        assert_eq!(layout.used_slot_addr(0), 8196);
        assert_eq!(layout.avail_event_addr(), 8196 + 8 * 256);
        assert_eq!(RingLayout::byte_size(256), 8192 + 6 + 8 * 256);
        assert_eq!(layout.end(), RingLayout::byte_size(256));
    }

    #[test]
    fn test_layout_nonzero_base() {
        let layout = RingLayout::new(0x1_0000, 4);
        assert_eq!(layout.desc_addr(0), 0x1_0000);
        assert_eq!(layout.desc_addr(3), 0x1_0000 + 48);
        assert_eq!(layout.avail_flags_addr(), 0x1_0000 + 64);
        // 64 + 4 + 8 + 2 = 78 bytes of driver area, used ring at +4096.
        assert_eq!(layout.used_flags_addr(), 0x1_0000 + 4096);
    }

    #[test]
    fn test_need_event_basic() {
        // Peer asked to be woken at 5; publishing 5 -> 6 crosses it.
        assert!(need_event(5, 6, 5));
        // Publishing 4 -> 5 has not crossed the watermark yet.
        assert!(!need_event(5, 5, 4));
        // A burst from 2 to 9 crosses a watermark of 5.
        assert!(need_event(5, 9, 2));
        // A burst from 6 to 9 does not.
        assert!(!need_event(5, 9, 6));
    }

    #[test]
    fn test_need_event_wraps() {
        // Watermark just before the wrap, publish just after it.
        assert!(need_event(0xffff, 0x0001, 0xfffe));
        // Watermark after the wrap, publish window entirely before it.
        assert!(!need_event(0x0005, 0xffff, 0xfff0));
        // Window spanning the wrap that covers the watermark.
        assert!(need_event(0x0002, 0x0005, 0xfff0));
    }

    #[test]
    fn test_fatal_classification() {
        assert!(!QueueError::Full.is_fatal());
        assert!(!QueueError::Broken.is_fatal());
        assert!(QueueError::LoopedChain.is_fatal());
        assert!(QueueError::AvailIndexJump { old: 0, new: 9 }.is_fatal());
    }
}

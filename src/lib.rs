//! Graphite - a virtio split-ring virtqueue engine.
//!
//! The split virtqueue is the data path shared by every virtio device: a
//! descriptor table, an available ring the driver produces into, and a used
//! ring the device produces into, all living in one byte-addressable shared
//! memory region. This crate implements both sides of that protocol as a
//! passive engine (no threads, no locks, no transport) so device modules
//! (block, network, console, entropy, ...) only supply buffers and consume
//! completions:
//!
//! - [`Virtqueue`] is the driver side: build descriptor chains, publish
//!   them, decide whether to kick, retrieve completions by cookie.
//! - [`DeviceQueue`] is the device side: pop published chains (direct or
//!   indirect), complete them, decide whether to interrupt.
//! - [`QueueMemory`] is the shared region both sides address by offset.
//!
//! Notification suppression in both directions (the `NO_NOTIFY` /
//! `NO_INTERRUPT` flags and the event-index watermarks) is implemented
//! with the exact wrapping-u16 window comparison the protocol requires;
//! see [`ring::need_event`].
//!
//! Reference: <https://docs.oasis-open.org/virtio/virtio/v1.1/virtio-v1.1.html>

pub mod mem;
pub mod ring;

pub use mem::{MemoryError, QueueMemory};
pub use ring::codec::{Descriptor, UsedElem};
pub use ring::device::{Chain, DeviceQueue};
pub use ring::driver::{Doorbell, Virtqueue};
pub use ring::{Buffer, DescFlags, Features, IndirectTable, QueueError, RingLayout};

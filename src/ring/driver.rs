//! Driver-side virtqueue state machine.
//!
//! The [`Virtqueue`] owns the producer half of the split-ring protocol: it
//! builds descriptor chains out of caller buffers, publishes their head
//! indices into the available ring, and retrieves completions from the used
//! ring. Each submitted chain carries an opaque cookie that comes back from
//! [`Virtqueue::get`] when the device finishes with it.
//!
//! # Protocol flow
//!
//! ```text
//! Driver                              Device
//!   │ add(bufs, cookie)                 │
//!   │   write descriptors               │
//!   │   publish head in avail ring      │
//!   │   release fence, bump avail.idx   │
//!   │ should_notify()? ── kick ────────►│
//!   │                                   │ pop chain, process buffers
//!   │                                   │ publish (head, len) in used ring
//!   │◄───────────── interrupt ───────── │ release fence, bump used.idx
//!   │ get() -> (cookie, len)            │
//!   │   acquire fence, read element     │
//!   │   recycle descriptors             │
//! ```
//!
//! # Concurrency
//!
//! The virtqueue is a passive structure with no internal locking. The
//! driver side is the sole writer of the descriptor table (for free
//! descriptors), the available ring, and `used_event`; it only reads the
//! used ring. Callers that share one queue between threads must serialize
//! `add`/`get` pairs with an external lock. None of the operations block:
//! `add` fails fast with [`QueueError::Full`] and `get` returns `None` when
//! the used ring is drained.
//!
//! A fatal protocol violation (the device publishing a nonsense completion)
//! breaks the queue: the error is returned once, and every later operation
//! reports [`QueueError::Broken`] until [`Virtqueue::reset`].

use super::codec::{AvailRing, DescTable, Descriptor, UsedRing};
use super::{
    need_event, Buffer, DescFlags, Features, IndirectTable, QueueError, RingLayout,
    AVAIL_F_NO_INTERRUPT, DESC_SIZE, MAX_QUEUE_SIZE, USED_F_NO_NOTIFY,
};
use crate::mem::QueueMemory;
use core::sync::atomic::{fence, Ordering};
use log::{error, trace, warn};

/// Doorbell used to signal the device that new buffers are available.
///
/// Implementors perform the transport-specific notify: a port write, an
/// MMIO store of the queue index, an eventfd signal. The engine only
/// decides *whether* to ring; *how* is the embedder's business.
pub trait Doorbell {
    /// Signal the device for queue `queue_index`.
    fn ring(&self, queue_index: u16);
}

/// Driver-side split virtqueue.
///
/// `T` is the caller's cookie type: one value is stored per in-flight
/// chain and returned verbatim by [`Virtqueue::get`] on completion.
pub struct Virtqueue<T> {
    /// Queue index, passed to the doorbell and carried in log lines.
    index: u16,
    /// Queue size (number of descriptors); a power of two.
    size: u16,
    /// Negotiated features this queue honors.
    features: Features,
    layout: RingLayout,
    desc: DescTable,
    avail: AvailRing,
    used: UsedRing,
    /// How to signal the device.
    doorbell: Box<dyn Doorbell>,
    /// Head of the free-descriptor list, linked through `Descriptor::next`.
    free_head: u16,
    /// Number of free descriptors.
    num_free: u16,
    /// Entries published since the last kick decision.
    num_added: u16,
    /// Local shadow of the published `avail.idx` (this side is its only
    /// writer).
    avail_idx: u16,
    /// Next used-ring position to consume.
    last_used_idx: u16,
    /// Chains submitted and not yet completed.
    in_flight: u32,
    /// Set on the first fatal protocol violation.
    broken: bool,
    /// Cookie per in-flight chain, indexed by head descriptor.
    cookies: Vec<Option<T>>,
}

impl<T> Virtqueue<T> {
    /// Create a queue of `size` descriptors with its rings based at `base`
    /// inside `mem`.
    ///
    /// Zeroes the ring area and links the descriptor free list, leaving the
    /// queue in the state a device expects after setup.
    ///
    /// # Errors
    ///
    /// `InvalidQueueSize` unless `size` is a nonzero power of two no larger
    /// than [`MAX_QUEUE_SIZE`]; a memory error if the ring area does not
    /// fit in `mem`.
    pub fn new(
        mem: &QueueMemory,
        base: u64,
        size: u16,
        index: u16,
        features: Features,
        doorbell: Box<dyn Doorbell>,
    ) -> Result<Self, QueueError> {
        if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
            return Err(QueueError::InvalidQueueSize(size));
        }
        let layout = RingLayout::new(base, size);
        let mut vq = Self {
            index,
            size,
            features,
            layout,
            desc: DescTable::new(layout),
            avail: AvailRing::new(layout),
            used: UsedRing::new(layout),
            doorbell,
            free_head: 0,
            num_free: size,
            num_added: 0,
            avail_idx: 0,
            last_used_idx: 0,
            in_flight: 0,
            broken: false,
            cookies: (0..size).map(|_| None).collect(),
        };
        vq.init_rings(mem)?;
        Ok(vq)
    }

    /// Queue size in descriptors.
    pub fn queue_size(&self) -> u16 {
        self.size
    }

    /// Chains submitted and not yet retrieved with [`Virtqueue::get`].
    pub fn in_flight(&self) -> u32 {
        self.in_flight
    }

    /// Free descriptors available for new chains.
    pub fn free_descriptors(&self) -> u16 {
        self.num_free
    }

    /// Whether the queue is out of service after a protocol violation.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Submit one chain: `out_bufs` device-readable buffers followed by
    /// `in_bufs` device-writable ones.
    ///
    /// The chain is published atomically from the device's point of view:
    /// descriptors and the available-ring slot are written first, then a
    /// release fence, then the index. On failure nothing is published.
    ///
    /// # Errors
    ///
    /// `Full` if fewer than `out_bufs.len() + in_bufs.len()` descriptors
    /// are free (when there are outgoing buffers the device is kicked
    /// anyway, so a stuffed ring drains sooner); `EmptyChain` for a chain
    /// with no buffers; `Broken` after a fatal violation.
    pub fn add(
        &mut self,
        mem: &QueueMemory,
        out_bufs: &[Buffer],
        in_bufs: &[Buffer],
        cookie: T,
    ) -> Result<(), QueueError> {
        self.check_broken()?;
        let total = out_bufs.len() + in_bufs.len();
        if total == 0 {
            return Err(QueueError::EmptyChain);
        }
        if (self.num_free as usize) < total {
            warn!(
                "queue {}: can't add chain of {} descriptors, {} free",
                self.index, total, self.num_free
            );
            // Historical behavior: a producer with outgoing data kicks the
            // device on a full ring so it services the queue sooner.
            if !out_bufs.is_empty() {
                self.kick();
            }
            return Err(QueueError::Full);
        }

        // Fill descriptors along the free list, preserving the free-list
        // links in `next`; the final descriptor drops NEXT so the links
        // beyond the chain stay intact for the free list.
        let head = self.free_head;
        let mut idx = self.free_head;
        let bufs = out_bufs
            .iter()
            .map(|b| (*b, false))
            .chain(in_bufs.iter().map(|b| (*b, true)));
        for (n, (buf, device_writes)) in bufs.enumerate() {
            let link = self.desc.read(mem, idx)?.next;
            let mut flags = if device_writes {
                DescFlags::WRITE
            } else {
                DescFlags::empty()
            };
            if n + 1 < total {
                flags |= DescFlags::NEXT;
            }
            self.desc.write(
                mem,
                idx,
                &Descriptor {
                    addr: buf.addr,
                    len: buf.len,
                    flags,
                    next: link,
                },
            )?;
            idx = link;
        }
        self.free_head = idx;
        self.num_free -= total as u16;

        self.publish(mem, head, cookie)
    }

    /// Submit one chain through a single `INDIRECT` descriptor pointing at
    /// the caller-allocated `table`.
    ///
    /// Only one free descriptor is consumed regardless of chain length,
    /// which is the point: a long scatter/gather list fits a nearly-full
    /// ring. One level of indirection only; the table holds ordinary
    /// descriptors.
    ///
    /// # Errors
    ///
    /// `IndirectUnsupported` unless `INDIRECT_DESC` was negotiated;
    /// `IndirectCapacity` if the table is too small for the chain (the
    /// caller can fall back to [`Virtqueue::add`]); otherwise as `add`.
    pub fn add_indirect(
        &mut self,
        mem: &QueueMemory,
        out_bufs: &[Buffer],
        in_bufs: &[Buffer],
        cookie: T,
        table: IndirectTable,
    ) -> Result<(), QueueError> {
        self.check_broken()?;
        if !self.features.contains(Features::INDIRECT_DESC) {
            return Err(QueueError::IndirectUnsupported);
        }
        let total = out_bufs.len() + in_bufs.len();
        if total == 0 {
            return Err(QueueError::EmptyChain);
        }
        if total > table.capacity as usize {
            return Err(QueueError::IndirectCapacity {
                needed: total as u16,
                capacity: table.capacity,
            });
        }
        if self.num_free == 0 {
            warn!("queue {}: can't add indirect chain, no free descriptors", self.index);
            if !out_bufs.is_empty() {
                self.kick();
            }
            return Err(QueueError::Full);
        }

        // Transfer the buffers into the out-of-line table.
        let bufs = out_bufs
            .iter()
            .map(|b| (*b, false))
            .chain(in_bufs.iter().map(|b| (*b, true)));
        for (n, (buf, device_writes)) in bufs.enumerate() {
            let last = n + 1 == total;
            let mut flags = if device_writes {
                DescFlags::WRITE
            } else {
                DescFlags::empty()
            };
            if !last {
                flags |= DescFlags::NEXT;
            }
            DescTable::write_indirect(
                mem,
                table.addr,
                n as u16,
                &Descriptor {
                    addr: buf.addr,
                    len: buf.len,
                    flags,
                    next: if last { 0 } else { n as u16 + 1 },
                },
            )?;
        }

        // One ring descriptor refers to the whole table.
        let head = self.free_head;
        let link = self.desc.read(mem, head)?.next;
        self.desc.write(
            mem,
            head,
            &Descriptor {
                addr: table.addr,
                len: total as u32 * DESC_SIZE as u32,
                flags: DescFlags::INDIRECT,
                next: link,
            },
        )?;
        self.free_head = link;
        self.num_free -= 1;

        self.publish(mem, head, cookie)
    }

    /// Ring the doorbell unconditionally.
    ///
    /// Pair with [`Virtqueue::should_notify`], which makes the suppression
    /// decision; `kick` itself is decision-free.
    pub fn kick(&self) {
        trace!("queue {}: kick", self.index);
        self.doorbell.ring(self.index);
    }

    /// Whether the device actually needs a doorbell for the entries
    /// published since the last call.
    ///
    /// With `EVENT_IDX` negotiated this compares the publish window against
    /// the device's `avail_event` watermark; otherwise it honors the
    /// device's `NO_NOTIFY` flag. Resets the publish window either way.
    pub fn should_notify(&mut self, mem: &QueueMemory) -> Result<bool, QueueError> {
        self.check_broken()?;
        // The published index must be visible before the watermark is
        // examined (store-load ordering).
        fence(Ordering::SeqCst);

        let new_idx = self.avail_idx;
        let old_idx = self.avail_idx.wrapping_sub(self.num_added);
        self.num_added = 0;

        if self.features.contains(Features::EVENT_IDX) {
            let event = self.used.avail_event(mem)?;
            Ok(need_event(event, new_idx, old_idx))
        } else {
            Ok(self.used.flags(mem)? & USED_F_NO_NOTIFY == 0)
        }
    }

    /// Retrieve the next completion, if any.
    ///
    /// Returns the cookie passed to `add` and the number of bytes the
    /// device wrote into the chain's device-writable buffers. `None` means
    /// the used ring is drained, a normal and frequent outcome rather than
    /// an error. The chain's descriptors return to the free list.
    ///
    /// # Errors
    ///
    /// A completion naming an out-of-range or non-head descriptor, or a
    /// chain that loops, is a fatal protocol violation: the queue breaks
    /// and the typed error is returned.
    pub fn get(&mut self, mem: &QueueMemory) -> Result<Option<(T, u32)>, QueueError> {
        self.check_broken()?;
        if self.used.idx(mem)? == self.last_used_idx {
            trace!("queue {}: no more used buffers", self.index);
            return Ok(None);
        }
        // Only read the element after its publication is visible.
        fence(Ordering::Acquire);

        let elem = self.used.ring(mem, self.last_used_idx)?;
        if elem.id >= self.size as u32 {
            return Err(self.fail(QueueError::DescriptorOutOfRange {
                index: elem.id,
                size: self.size,
            }));
        }
        let head = elem.id as u16;
        let cookie = match self.cookies[head as usize].take() {
            Some(c) => c,
            None => return Err(self.fail(QueueError::NotAChainHead { index: elem.id })),
        };
        if let Err(e) = self.detach_chain(mem, head) {
            return Err(self.fail(e));
        }
        self.last_used_idx = self.last_used_idx.wrapping_add(1);
        self.in_flight -= 1;

        // With interrupts enabled, tell the device where the next wanted
        // completion now sits, and flush that before the next used-ring
        // read.
        if self.avail.flags(mem)? & AVAIL_F_NO_INTERRUPT == 0 {
            self.avail.set_used_event(mem, self.last_used_idx)?;
            fence(Ordering::SeqCst);
        }

        trace!(
            "queue {}: completed chain head {} ({} bytes)",
            self.index,
            head,
            elem.len
        );
        Ok(Some((cookie, elem.len)))
    }

    /// Whether every submitted chain has been completed and retrieved.
    pub fn is_empty(&mut self, mem: &QueueMemory) -> Result<bool, QueueError> {
        self.check_broken()?;
        let used_idx = self.used.idx(mem)?;
        fence(Ordering::Acquire);
        Ok(used_idx == self.last_used_idx)
    }

    /// Re-enable completion interrupts.
    ///
    /// Returns `false` if completions arrived in the window between the
    /// last [`Virtqueue::get`] and the rearm: the caller must drain again
    /// before relying on an interrupt, otherwise that completion's
    /// notification is lost. Clears the suppression flag and publishes the
    /// `used_event` watermark at the current cursor, so either suppression
    /// mechanism rearms.
    pub fn enable_notifications(&mut self, mem: &QueueMemory) -> Result<bool, QueueError> {
        self.check_broken()?;
        let flags = self.avail.flags(mem)?;
        self.avail.set_flags(mem, flags & !AVAIL_F_NO_INTERRUPT)?;
        self.avail.set_used_event(mem, self.last_used_idx)?;
        fence(Ordering::SeqCst);
        Ok(self.used.idx(mem)? == self.last_used_idx)
    }

    /// Re-enable completion interrupts, hinting the device to hold the
    /// interrupt until about three quarters of the outstanding chains have
    /// completed.
    ///
    /// Returns `false` if the used ring has already advanced past that
    /// watermark, in which case the caller drains immediately.
    pub fn enable_notifications_delayed(
        &mut self,
        mem: &QueueMemory,
    ) -> Result<bool, QueueError> {
        self.check_broken()?;
        let flags = self.avail.flags(mem)?;
        self.avail.set_flags(mem, flags & !AVAIL_F_NO_INTERRUPT)?;
        let outstanding = self.avail_idx.wrapping_sub(self.last_used_idx);
        let bufs = (outstanding as u32 * 3 / 4) as u16;
        self.avail
            .set_used_event(mem, self.last_used_idx.wrapping_add(bufs))?;
        fence(Ordering::SeqCst);
        Ok(self.used.idx(mem)?.wrapping_sub(self.last_used_idx) <= bufs)
    }

    /// Disable completion interrupts.
    ///
    /// Advisory from the device's perspective: an interrupt already in
    /// flight may still arrive. Poll-mode callers pair this with a drain
    /// loop and [`Virtqueue::enable_notifications`].
    pub fn disable_notifications(&mut self, mem: &QueueMemory) -> Result<(), QueueError> {
        self.check_broken()?;
        let flags = self.avail.flags(mem)?;
        self.avail.set_flags(mem, flags | AVAIL_F_NO_INTERRUPT)?;
        Ok(())
    }

    /// Detach and return one still-outstanding cookie, unpublishing its
    /// chain.
    ///
    /// Only valid on a quiesced queue (device no longer processing); used
    /// before [`Virtqueue::reset`] to fail outstanding requests. Returns
    /// `None` once no chains remain.
    pub fn drain_unused(&mut self, mem: &QueueMemory) -> Result<Option<T>, QueueError> {
        for head in 0..self.size {
            if let Some(cookie) = self.cookies[head as usize].take() {
                self.detach_chain(mem, head)?;
                self.avail_idx = self.avail_idx.wrapping_sub(1);
                self.avail.set_idx(mem, self.avail_idx)?;
                self.in_flight -= 1;
                return Ok(Some(cookie));
            }
        }
        Ok(None)
    }

    /// Return the queue to its initial state.
    ///
    /// Zeroes the ring structures, relinks the free list, clears all
    /// cursors and the broken latch. Outstanding cookies are dropped: the
    /// virtqueue issues no completions for reset chains, so callers must
    /// fail their own outstanding requests (see
    /// [`Virtqueue::drain_unused`]).
    pub fn reset(&mut self, mem: &QueueMemory) -> Result<(), QueueError> {
        self.init_rings(mem)?;
        self.free_head = 0;
        self.num_free = self.size;
        self.num_added = 0;
        self.avail_idx = 0;
        self.last_used_idx = 0;
        self.in_flight = 0;
        self.broken = false;
        for cookie in &mut self.cookies {
            *cookie = None;
        }
        Ok(())
    }

    /// Zero the ring area and link the descriptor free list.
    fn init_rings(&mut self, mem: &QueueMemory) -> Result<(), QueueError> {
        mem.zero(self.layout.base(), RingLayout::byte_size(self.size))?;
        for i in 0..self.size - 1 {
            self.desc.write(
                mem,
                i,
                &Descriptor {
                    next: i + 1,
                    ..Descriptor::default()
                },
            )?;
        }
        Ok(())
    }

    /// Store the cookie and publish `head` into the available ring.
    fn publish(&mut self, mem: &QueueMemory, head: u16, cookie: T) -> Result<(), QueueError> {
        self.cookies[head as usize] = Some(cookie);

        self.avail.set_ring(mem, self.avail_idx, head)?;
        // The descriptors and the ring slot must be visible before the
        // index that exposes them.
        fence(Ordering::Release);
        self.avail_idx = self.avail_idx.wrapping_add(1);
        self.avail.set_idx(mem, self.avail_idx)?;

        self.in_flight += 1;
        self.num_added = self.num_added.wrapping_add(1);
        trace!("queue {}: added chain head {}", self.index, head);

        // Theoretically possible with a peer that never gets kicked: the
        // publish window is about to alias to zero, so force a sync now.
        if self.num_added == u16::MAX && self.should_notify(mem)? {
            self.kick();
        }
        Ok(())
    }

    /// Return the chain starting at `head` to the free list.
    fn detach_chain(&mut self, mem: &QueueMemory, head: u16) -> Result<(), QueueError> {
        let mut tail = head;
        let mut freed = 1u16;
        loop {
            let desc = self.desc.read(mem, tail)?;
            if !desc.flags.contains(DescFlags::NEXT) {
                break;
            }
            // More links than descriptors means the chain loops.
            if freed == self.size {
                return Err(QueueError::LoopedChain);
            }
            tail = desc.next;
            freed += 1;
        }
        let mut last = self.desc.read(mem, tail)?;
        last.next = self.free_head;
        self.desc.write(mem, tail, &last)?;
        self.free_head = head;
        self.num_free += freed;
        Ok(())
    }

    fn check_broken(&self) -> Result<(), QueueError> {
        if self.broken {
            return Err(QueueError::Broken);
        }
        Ok(())
    }

    /// Latch the broken state for fatal violations and hand the error back.
    fn fail(&mut self, err: QueueError) -> QueueError {
        if err.is_fatal() {
            error!("queue {}: fatal protocol violation: {}", self.index, err);
            self.broken = true;
        }
        err
    }
}

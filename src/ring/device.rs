//! Device-side virtqueue mirror.
//!
//! The [`DeviceQueue`] walks the same three ring structures from the other
//! direction: it consumes chain heads from the available ring, resolves
//! them into buffer lists (following `NEXT` links and one level of
//! `INDIRECT` tables), and publishes completions into the used ring. A VMM
//! embeds this to back a virtio device model; the in-crate protocol tests
//! drive it against [`Virtqueue`](super::driver::Virtqueue) over one shared
//! region to validate both state machines end to end.
//!
//! Interrupt delivery is the embedder's business: after publishing
//! completions, call [`DeviceQueue::should_interrupt`] and raise the
//! transport's interrupt if it says so. The suppression bookkeeping
//! (`signalled_used` window plus the driver's `used_event` watermark) lives
//! here.
//!
//! Everything the driver publishes is untrusted. A nonsense index, a
//! looped chain, or a malformed indirect table is a fatal protocol
//! violation: the queue latches broken and returns a typed error rather
//! than walking corrupted memory.

use super::codec::{AvailRing, DescTable, UsedElem, UsedRing};
use super::{
    need_event, Buffer, DescFlags, Features, QueueError, RingLayout, AVAIL_F_NO_INTERRUPT,
    DESC_SIZE, MAX_QUEUE_SIZE, USED_F_NO_NOTIFY,
};
use crate::mem::QueueMemory;
use core::sync::atomic::{fence, Ordering};
use log::{error, trace};

/// One descriptor chain resolved into buffer lists.
///
/// `readable` buffers come first on the wire (device-readable request
/// data), `writable` buffers after (space for the device's response).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chain {
    /// Head descriptor index; hand this back to [`DeviceQueue::fill`] or
    /// [`DeviceQueue::push`] when completing the chain.
    pub head: u16,
    /// Device-readable buffers, in chain order.
    pub readable: Vec<Buffer>,
    /// Device-writable buffers, in chain order.
    pub writable: Vec<Buffer>,
}

impl Chain {
    /// Total bytes of device-readable data.
    pub fn readable_len(&self) -> u64 {
        self.readable.iter().map(|b| b.len as u64).sum()
    }

    /// Total bytes of device-writable space.
    pub fn writable_len(&self) -> u64 {
        self.writable.iter().map(|b| b.len as u64).sum()
    }

    /// Gather the device-readable buffers into one contiguous request.
    pub fn read_out(&self, mem: &QueueMemory) -> Result<Vec<u8>, QueueError> {
        let mut data = Vec::with_capacity(self.readable_len() as usize);
        for buf in &self.readable {
            let mut part = vec![0u8; buf.len as usize];
            mem.read(buf.addr, &mut part)?;
            data.extend_from_slice(&part);
        }
        Ok(data)
    }

    /// Scatter `data` across the device-writable buffers.
    ///
    /// Returns the number of bytes actually written: `data.len()` capped
    /// by the chain's writable space. Pass this to the completion so the
    /// driver learns the response length.
    pub fn write_in(&self, mem: &QueueMemory, data: &[u8]) -> Result<u32, QueueError> {
        let mut offset = 0usize;
        for buf in &self.writable {
            if offset == data.len() {
                break;
            }
            let n = (data.len() - offset).min(buf.len as usize);
            mem.write(buf.addr, &data[offset..offset + n])?;
            offset += n;
        }
        Ok(offset as u32)
    }
}

/// Device-side split virtqueue.
pub struct DeviceQueue {
    /// Queue index, carried in log lines.
    index: u16,
    /// Queue size (number of descriptors); a power of two.
    size: u16,
    /// Negotiated features this queue honors.
    features: Features,
    desc: DescTable,
    avail: AvailRing,
    used: UsedRing,
    /// Next available-ring position to consume.
    last_avail_idx: u16,
    /// Local shadow of the published `used.idx` (this side is its only
    /// writer).
    used_idx: u16,
    /// Chains popped but not yet flushed.
    in_use: u16,
    /// Used index at the last interrupt decision.
    signalled_used: u16,
    /// Whether `signalled_used` reflects a real prior signal.
    signalled_used_valid: bool,
    /// Whether completion notification is currently wanted by the device
    /// model (drives `avail_event` republication).
    notification: bool,
    /// Set on the first fatal protocol violation.
    broken: bool,
}

impl DeviceQueue {
    /// Attach to a ring of `size` descriptors based at `base`.
    ///
    /// The driver side owns initialization; this only computes the layout
    /// and starts both cursors at zero.
    ///
    /// # Errors
    ///
    /// `InvalidQueueSize` unless `size` is a nonzero power of two no
    /// larger than [`MAX_QUEUE_SIZE`].
    pub fn new(base: u64, size: u16, index: u16, features: Features) -> Result<Self, QueueError> {
        if size == 0 || !size.is_power_of_two() || size > MAX_QUEUE_SIZE {
            return Err(QueueError::InvalidQueueSize(size));
        }
        let layout = RingLayout::new(base, size);
        Ok(Self {
            index,
            size,
            features,
            desc: DescTable::new(layout),
            avail: AvailRing::new(layout),
            used: UsedRing::new(layout),
            last_avail_idx: 0,
            used_idx: 0,
            in_use: 0,
            signalled_used: 0,
            signalled_used_valid: false,
            notification: true,
            broken: false,
        })
    }

    /// Queue size in descriptors.
    pub fn queue_size(&self) -> u16 {
        self.size
    }

    /// Chains popped and not yet flushed.
    pub fn in_use(&self) -> u16 {
        self.in_use
    }

    /// Whether the queue is out of service after a protocol violation.
    pub fn is_broken(&self) -> bool {
        self.broken
    }

    /// Whether the driver has published chains this side has not popped.
    pub fn has_pending(&self, mem: &QueueMemory) -> Result<bool, QueueError> {
        if self.broken {
            return Ok(false);
        }
        let avail_idx = self.avail.idx(mem)?;
        fence(Ordering::Acquire);
        Ok(avail_idx != self.last_avail_idx)
    }

    /// Pop the next published chain, if any.
    ///
    /// Resolves the chain into its buffer lists, following `NEXT` links
    /// and switching table and bound on an `INDIRECT` head (one level
    /// only). With `EVENT_IDX` negotiated and notification wanted, the
    /// `avail_event` watermark is republished at the driver's current
    /// index so the next publication kicks.
    ///
    /// # Errors
    ///
    /// Fatal protocol violations: `AvailIndexJump`, a head or `next`
    /// index out of range, `LoopedChain`, `BadIndirectLength`,
    /// `NestedIndirect`. The queue breaks.
    pub fn pop(&mut self, mem: &QueueMemory) -> Result<Option<Chain>, QueueError> {
        self.check_broken()?;
        let pending = match self.num_heads(mem) {
            Ok(n) => n,
            Err(e) => return Err(self.fail(e)),
        };
        if pending == 0 {
            return Ok(None);
        }
        // Only read ring entries after the index publishing them.
        fence(Ordering::Acquire);

        let head = self.avail.ring(mem, self.last_avail_idx)?;
        self.last_avail_idx = self.last_avail_idx.wrapping_add(1);

        if self.features.contains(Features::EVENT_IDX) && self.notification {
            self.used.set_avail_event(mem, self.avail.idx(mem)?)?;
        }

        if head >= self.size {
            return Err(self.fail(QueueError::DescriptorOutOfRange {
                index: head as u32,
                size: self.size,
            }));
        }
        match self.walk_chain(mem, head) {
            Ok(chain) => {
                self.in_use += 1;
                trace!(
                    "queue {}: popped chain head {} ({} readable, {} writable)",
                    self.index,
                    head,
                    chain.readable.len(),
                    chain.writable.len()
                );
                Ok(Some(chain))
            }
            Err(e) => Err(self.fail(e)),
        }
    }

    /// Stage a completion for the chain at `head` without publishing it.
    ///
    /// `offset` positions the element relative to the current used index,
    /// letting a device stage a batch before one [`DeviceQueue::flush`].
    pub fn fill(
        &self,
        mem: &QueueMemory,
        head: u16,
        len: u32,
        offset: u16,
    ) -> Result<(), QueueError> {
        self.check_broken()?;
        let pos = self.used_idx.wrapping_add(offset);
        self.used.set_ring(
            mem,
            pos,
            UsedElem {
                id: head as u32,
                len,
            },
        )
    }

    /// Publish `count` staged completions.
    ///
    /// Performs the release fence and bumps the used index; afterwards the
    /// driver can observe the elements. Tracks the signalled window so
    /// [`DeviceQueue::should_interrupt`] notices when publication ran past
    /// the last signalled point.
    pub fn flush(&mut self, mem: &QueueMemory, count: u16) -> Result<(), QueueError> {
        self.check_broken()?;
        // The staged elements must be visible before the index that
        // exposes them.
        fence(Ordering::Release);
        let old = self.used_idx;
        let new = old.wrapping_add(count);
        self.used.set_idx(mem, new)?;
        self.used_idx = new;
        self.in_use = self.in_use.saturating_sub(count);

        if (new.wrapping_sub(self.signalled_used) as i16 as i32)
            < (new.wrapping_sub(old) as i32)
        {
            self.signalled_used_valid = false;
        }
        Ok(())
    }

    /// Complete one chain: [`DeviceQueue::fill`] + [`DeviceQueue::flush`].
    pub fn push(&mut self, mem: &QueueMemory, chain: &Chain, len: u32) -> Result<(), QueueError> {
        self.fill(mem, chain.head, len, 0)?;
        self.flush(mem, 1)
    }

    /// Whether the driver actually needs an interrupt for the completions
    /// published so far.
    ///
    /// Always true when the driver has never been signalled, or when the
    /// ring went idle with `NOTIFY_ON_EMPTY` negotiated. Otherwise honors
    /// the driver's `NO_INTERRUPT` flag, or with `EVENT_IDX` the
    /// `used_event` watermark against the window since the last signal.
    pub fn should_interrupt(&mut self, mem: &QueueMemory) -> Result<bool, QueueError> {
        self.check_broken()?;
        // The published used index must be visible before the watermark is
        // examined (store-load ordering).
        fence(Ordering::SeqCst);

        if self.features.contains(Features::NOTIFY_ON_EMPTY)
            && self.in_use == 0
            && self.avail.idx(mem)? == self.last_avail_idx
        {
            return Ok(true);
        }
        if !self.features.contains(Features::EVENT_IDX) {
            return Ok(self.avail.flags(mem)? & AVAIL_F_NO_INTERRUPT == 0);
        }

        let was_valid = self.signalled_used_valid;
        let old = self.signalled_used;
        let new = self.used_idx;
        self.signalled_used = new;
        self.signalled_used_valid = true;
        Ok(!was_valid || need_event(self.avail.used_event(mem)?, new, old))
    }

    /// Ask the driver to kick (or stop kicking) on new publications.
    ///
    /// With `EVENT_IDX`, enabling republishes `avail_event` at the
    /// driver's current index; disabling leaves it behind so the driver's
    /// kick check goes quiet. Without it, toggles the `NO_NOTIFY` flag.
    pub fn set_notification(&mut self, mem: &QueueMemory, enable: bool) -> Result<(), QueueError> {
        self.check_broken()?;
        self.notification = enable;
        if self.features.contains(Features::EVENT_IDX) {
            if enable {
                self.used.set_avail_event(mem, self.avail.idx(mem)?)?;
            }
        } else {
            let flags = self.used.flags(mem)?;
            if enable {
                self.used.set_flags(mem, flags & !USED_F_NO_NOTIFY)?;
            } else {
                self.used.set_flags(mem, flags | USED_F_NO_NOTIFY)?;
            }
        }
        Ok(())
    }

    /// Forget all local state, matching a driver-side ring reset.
    pub fn reset(&mut self) {
        self.last_avail_idx = 0;
        self.used_idx = 0;
        self.in_use = 0;
        self.signalled_used = 0;
        self.signalled_used_valid = false;
        self.notification = true;
        self.broken = false;
    }

    /// Heads published since this side last consumed, validating that the
    /// driver has not moved its index by more than the queue size.
    fn num_heads(&self, mem: &QueueMemory) -> Result<u16, QueueError> {
        let avail_idx = self.avail.idx(mem)?;
        let n = avail_idx.wrapping_sub(self.last_avail_idx);
        if n > self.size {
            return Err(QueueError::AvailIndexJump {
                old: self.last_avail_idx,
                new: avail_idx,
            });
        }
        Ok(n)
    }

    /// Resolve the chain starting at `head` into buffer lists.
    fn walk_chain(&self, mem: &QueueMemory, head: u16) -> Result<Chain, QueueError> {
        let mut chain = Chain {
            head,
            readable: Vec::new(),
            writable: Vec::new(),
        };

        // Direct chains walk the descriptor table bounded by the queue
        // size; an INDIRECT head switches both the table and the bound.
        let mut max = self.size;
        let mut table: Option<u64> = None;
        let mut i = head;

        let first = self.desc.read(mem, head)?;
        if first.flags.contains(DescFlags::INDIRECT) {
            let len = first.len;
            let count = len / DESC_SIZE as u32;
            if len == 0 || len % DESC_SIZE as u32 != 0 || count > self.size as u32 {
                return Err(QueueError::BadIndirectLength { len });
            }
            max = count as u16;
            table = Some(first.addr);
            i = 0;
        }

        let mut num_bufs = 0u16;
        loop {
            num_bufs += 1;
            // More descriptors than the bound allows implies a loop.
            if num_bufs > max {
                return Err(QueueError::LoopedChain);
            }
            let desc = match table {
                Some(base) => DescTable::read_indirect(mem, base, i)?,
                None => self.desc.read(mem, i)?,
            };
            if table.is_some() && desc.flags.contains(DescFlags::INDIRECT) {
                return Err(QueueError::NestedIndirect);
            }
            let buf = Buffer::new(desc.addr, desc.len);
            if desc.flags.contains(DescFlags::WRITE) {
                chain.writable.push(buf);
            } else {
                chain.readable.push(buf);
            }
            if !desc.flags.contains(DescFlags::NEXT) {
                break;
            }
            if desc.next >= max {
                return Err(QueueError::DescriptorOutOfRange {
                    index: desc.next as u32,
                    size: max,
                });
            }
            i = desc.next;
        }
        Ok(chain)
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

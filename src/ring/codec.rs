//! Fixed-layout codecs for the three shared ring structures.
//!
//! Everything a virtqueue shares with its peer goes through this module:
//! 16-byte descriptor records, the available ring (driver-written), and the
//! used ring (device-written). Each codec is a dumb translation between
//! typed values and the little-endian wire layout: no fences, no slot
//! arithmetic beyond the modulo reduction, and no protocol decisions. The
//! driver and device state machines own the ordering rules.

use super::{DescFlags, QueueError, RingLayout, DESC_SIZE};
use crate::mem::QueueMemory;

/// One descriptor record.
///
/// Wire layout (16 bytes, little-endian):
///
/// ```text
/// offset 0   addr    u64   buffer address in the shared region
/// offset 8   len     u32   buffer length in bytes
/// offset 12  flags   u16   NEXT | WRITE | INDIRECT
/// offset 14  next    u16   index of the next descriptor if NEXT is set
/// ```
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Descriptor {
    /// Buffer address in the shared region.
    pub addr: u64,
    /// Buffer length in bytes.
    pub len: u32,
    /// Descriptor flags.
    pub flags: DescFlags,
    /// Index of the next descriptor if `NEXT` is set; doubles as the
    /// free-list link while the descriptor is unused.
    pub next: u16,
}

impl Descriptor {
    /// Encode to the 16-byte wire form.
    pub fn encode(&self) -> [u8; 16] {
        let mut buf = [0u8; 16];
        buf[0..8].copy_from_slice(&self.addr.to_le_bytes());
        buf[8..12].copy_from_slice(&self.len.to_le_bytes());
        buf[12..14].copy_from_slice(&self.flags.bits().to_le_bytes());
        buf[14..16].copy_from_slice(&self.next.to_le_bytes());
        buf
    }

    /// Decode from the 16-byte wire form.
    ///
    /// Unknown flag bits are dropped: only the bits this engine
    /// understands are retained.
    pub fn decode(buf: [u8; 16]) -> Self {
        Self {
            addr: u64::from_le_bytes([
                buf[0], buf[1], buf[2], buf[3], buf[4], buf[5], buf[6], buf[7],
            ]),
            len: u32::from_le_bytes([buf[8], buf[9], buf[10], buf[11]]),
            flags: DescFlags::from_bits_truncate(u16::from_le_bytes([buf[12], buf[13]])),
            next: u16::from_le_bytes([buf[14], buf[15]]),
        }
    }
}

/// One used-ring element.
///
/// Wire layout (8 bytes, little-endian): `u32 id | u32 len`. The id is the
/// head descriptor index of the completed chain; `len` is the byte count
/// the device wrote into the chain's device-writable buffers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UsedElem {
    /// Head descriptor index of the completed chain.
    pub id: u32,
    /// Bytes written by the device.
    pub len: u32,
}

/// Accessor for the descriptor table.
#[derive(Debug, Clone, Copy)]
pub struct DescTable {
    layout: RingLayout,
}

impl DescTable {
    /// Table accessor over `layout`.
    pub fn new(layout: RingLayout) -> Self {
        Self { layout }
    }

    /// Read descriptor `index`.
    ///
    /// # Errors
    ///
    /// `DescriptorOutOfRange` if `index` is not below the queue size.
    pub fn read(&self, mem: &QueueMemory, index: u16) -> Result<Descriptor, QueueError> {
        self.check(index)?;
        let mut buf = [0u8; 16];
        mem.read(self.layout.desc_addr(index), &mut buf)?;
        Ok(Descriptor::decode(buf))
    }

    /// Write descriptor `index`.
    ///
    /// # Errors
    ///
    /// `DescriptorOutOfRange` if `index` is not below the queue size.
    pub fn write(
        &self,
        mem: &QueueMemory,
        index: u16,
        desc: &Descriptor,
    ) -> Result<(), QueueError> {
        self.check(index)?;
        mem.write(self.layout.desc_addr(index), &desc.encode())?;
        Ok(())
    }

    /// Read descriptor `index` of an out-of-line indirect table at
    /// `table_addr`.
    ///
    /// The caller bounds `index` against the table's own length; this only
    /// performs the memory access.
    pub fn read_indirect(
        mem: &QueueMemory,
        table_addr: u64,
        index: u16,
    ) -> Result<Descriptor, QueueError> {
        let mut buf = [0u8; 16];
        mem.read(table_addr + DESC_SIZE * index as u64, &mut buf)?;
        Ok(Descriptor::decode(buf))
    }

    /// Write descriptor `index` of an out-of-line indirect table at
    /// `table_addr`.
    pub fn write_indirect(
        mem: &QueueMemory,
        table_addr: u64,
        index: u16,
        desc: &Descriptor,
    ) -> Result<(), QueueError> {
        mem.write(table_addr + DESC_SIZE * index as u64, &desc.encode())?;
        Ok(())
    }

    fn check(&self, index: u16) -> Result<(), QueueError> {
        if index >= self.layout.queue_size() {
            return Err(QueueError::DescriptorOutOfRange {
                index: index as u32,
                size: self.layout.queue_size(),
            });
        }
        Ok(())
    }
}

/// Accessor for the available ring (driver-written, device-read).
#[derive(Debug, Clone, Copy)]
pub struct AvailRing {
    layout: RingLayout,
}

impl AvailRing {
    /// Ring accessor over `layout`.
    pub fn new(layout: RingLayout) -> Self {
        Self { layout }
    }

    /// Read the ring's flags word.
    pub fn flags(&self, mem: &QueueMemory) -> Result<u16, QueueError> {
        Ok(mem.read_u16(self.layout.avail_flags_addr())?)
    }

    /// Write the ring's flags word.
    pub fn set_flags(&self, mem: &QueueMemory, flags: u16) -> Result<(), QueueError> {
        Ok(mem.write_u16(self.layout.avail_flags_addr(), flags)?)
    }

    /// Read the free-running index.
    pub fn idx(&self, mem: &QueueMemory) -> Result<u16, QueueError> {
        Ok(mem.read_u16(self.layout.avail_idx_addr())?)
    }

    /// Publish the free-running index.
    pub fn set_idx(&self, mem: &QueueMemory, idx: u16) -> Result<(), QueueError> {
        Ok(mem.write_u16(self.layout.avail_idx_addr(), idx)?)
    }

    /// Read the chain head published at position `pos` (free-running; the
    /// slot is reduced modulo the queue size here).
    pub fn ring(&self, mem: &QueueMemory, pos: u16) -> Result<u16, QueueError> {
        let slot = pos % self.layout.queue_size();
        Ok(mem.read_u16(self.layout.avail_slot_addr(slot))?)
    }

    /// Write chain head `head` at position `pos` (free-running).
    pub fn set_ring(&self, mem: &QueueMemory, pos: u16, head: u16) -> Result<(), QueueError> {
        let slot = pos % self.layout.queue_size();
        Ok(mem.write_u16(self.layout.avail_slot_addr(slot), head)?)
    }

    /// Read the driver-published `used_event` watermark.
    pub fn used_event(&self, mem: &QueueMemory) -> Result<u16, QueueError> {
        Ok(mem.read_u16(self.layout.used_event_addr())?)
    }

    /// Publish the `used_event` watermark.
    pub fn set_used_event(&self, mem: &QueueMemory, idx: u16) -> Result<(), QueueError> {
        Ok(mem.write_u16(self.layout.used_event_addr(), idx)?)
    }
}

/// Accessor for the used ring (device-written, driver-read).
#[derive(Debug, Clone, Copy)]
pub struct UsedRing {
    layout: RingLayout,
}

impl UsedRing {
    /// Ring accessor over `layout`.
    pub fn new(layout: RingLayout) -> Self {
        Self { layout }
    }

    /// Read the ring's flags word.
    pub fn flags(&self, mem: &QueueMemory) -> Result<u16, QueueError> {
        Ok(mem.read_u16(self.layout.used_flags_addr())?)
    }

    /// Write the ring's flags word.
    pub fn set_flags(&self, mem: &QueueMemory, flags: u16) -> Result<(), QueueError> {
        Ok(mem.write_u16(self.layout.used_flags_addr(), flags)?)
    }

    /// Read the free-running index.
    pub fn idx(&self, mem: &QueueMemory) -> Result<u16, QueueError> {
        Ok(mem.read_u16(self.layout.used_idx_addr())?)
    }

    /// Publish the free-running index.
    pub fn set_idx(&self, mem: &QueueMemory, idx: u16) -> Result<(), QueueError> {
        Ok(mem.write_u16(self.layout.used_idx_addr(), idx)?)
    }

    /// Read the element published at position `pos` (free-running).
    pub fn ring(&self, mem: &QueueMemory, pos: u16) -> Result<UsedElem, QueueError> {
        let slot = pos % self.layout.queue_size();
        let addr = self.layout.used_slot_addr(slot);
        Ok(UsedElem {
            id: mem.read_u32(addr)?,
            len: mem.read_u32(addr + 4)?,
        })
    }

    /// Write element `elem` at position `pos` (free-running).
    pub fn set_ring(&self, mem: &QueueMemory, pos: u16, elem: UsedElem) -> Result<(), QueueError> {
        let slot = pos % self.layout.queue_size();
        let addr = self.layout.used_slot_addr(slot);
        mem.write_u32(addr, elem.id)?;
        mem.write_u32(addr + 4, elem.len)?;
        Ok(())
    }

    /// Read the device-published `avail_event` watermark.
    pub fn avail_event(&self, mem: &QueueMemory) -> Result<u16, QueueError> {
        Ok(mem.read_u16(self.layout.avail_event_addr())?)
    }

    /// Publish the `avail_event` watermark.
    pub fn set_avail_event(&self, mem: &QueueMemory, idx: u16) -> Result<(), QueueError> {
        Ok(mem.write_u16(self.layout.avail_event_addr(), idx)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_descriptor_wire_offsets() {
        let desc = Descriptor {
            addr: 0x1122_3344_5566_7788,
            len: 0xaabb_ccdd,
            flags: DescFlags::NEXT | DescFlags::WRITE,
            next: 0x0102,
        };
        let buf = desc.encode();
        assert_eq!(&buf[0..8], &[0x88, 0x77, 0x66, 0x55, 0x44, 0x33, 0x22, 0x11]);
        assert_eq!(&buf[8..12], &[0xdd, 0xcc, 0xbb, 0xaa]);
        assert_eq!(&buf[12..14], &[0x03, 0x00]);
        assert_eq!(&buf[14..16], &[0x02, 0x01]);
        assert_eq!(Descriptor::decode(buf), desc);
    }

    #[test]
    fn test_descriptor_table_bounds() {
        let mem = QueueMemory::new(64 * 1024).unwrap();
        let table = DescTable::new(RingLayout::new(0, 8));
        let desc = Descriptor {
            addr: 0x4000,
            len: 16,
            flags: DescFlags::NEXT,
            next: 1,
        };
        table.write(&mem, 7, &desc).unwrap();
        assert_eq!(table.read(&mem, 7).unwrap(), desc);
        assert!(matches!(
            table.read(&mem, 8),
            Err(QueueError::DescriptorOutOfRange { index: 8, size: 8 })
        ));
        assert!(table.write(&mem, 8, &desc).is_err());
    }

    #[test]
    fn test_indirect_table_codec() {
        let mem = QueueMemory::new(64 * 1024).unwrap();
        let desc = Descriptor {
            addr: 0x8000,
            len: 512,
            flags: DescFlags::WRITE,
            next: 0,
        };
        DescTable::write_indirect(&mem, 0x2000, 3, &desc).unwrap();
        assert_eq!(DescTable::read_indirect(&mem, 0x2000, 3).unwrap(), desc);
        // Record 3 sits 48 bytes into the table.
        assert_eq!(mem.read_u64(0x2000 + 48).unwrap(), 0x8000);
    }

    #[test]
    fn test_avail_ring_slot_wrap() {
        let mem = QueueMemory::new(64 * 1024).unwrap();
        let avail = AvailRing::new(RingLayout::new(0, 4));
        // Position 6 lands in slot 2.
        avail.set_ring(&mem, 6, 3).unwrap();
        assert_eq!(avail.ring(&mem, 2).unwrap(), 3);
        avail.set_idx(&mem, 0xffff).unwrap();
        assert_eq!(avail.idx(&mem).unwrap(), 0xffff);
    }

    #[test]
    fn test_used_ring_elem() {
        let mem = QueueMemory::new(64 * 1024).unwrap();
        let used = UsedRing::new(RingLayout::new(0, 4));
        let elem = UsedElem { id: 2, len: 4096 };
        used.set_ring(&mem, 5, elem).unwrap();
        assert_eq!(used.ring(&mem, 1).unwrap(), elem);
    }

    #[test]
    fn test_event_words_do_not_collide() {
        let mem = QueueMemory::new(64 * 1024).unwrap();
        let layout = RingLayout::new(0, 4);
        let avail = AvailRing::new(layout);
        let used = UsedRing::new(layout);
        avail.set_used_event(&mem, 0x1111).unwrap();
        used.set_avail_event(&mem, 0x2222).unwrap();
        used.set_flags(&mem, 1).unwrap();
        used.set_idx(&mem, 7).unwrap();
        assert_eq!(avail.used_event(&mem).unwrap(), 0x1111);
        assert_eq!(used.avail_event(&mem).unwrap(), 0x2222);
        assert_eq!(used.flags(&mem).unwrap(), 1);
        assert_eq!(used.idx(&mem).unwrap(), 7);
    }
}

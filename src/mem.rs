//! Shared queue memory backed by the vm-memory crate.
//!
//! This module wraps `vm_memory::GuestMemoryMmap` to provide the
//! byte-addressable shared region that holds a virtqueue's three ring
//! structures and the data buffers they describe. The vm-memory crate is the
//! standard abstraction used across the rust-vmm ecosystem.
//!
//! # Memory Model
//!
//! The two sides of a virtqueue (driver and device) may live in different
//! execution contexts (a guest kernel and a VMM, or two threads of a test
//! harness) but both address the same flat region by offset:
//!
//! ```text
//! ring base ┌──────────────────────┐
//!           │ Descriptor table     │ 16 bytes × queue_size
//!           ├──────────────────────┤
//!           │ Available ring       │ driver-written, device-read
//!           ├─ ─ ─ padding ─ ─ ─ ─ ┤
//!           │ Used ring            │ device-written, driver-read (4K aligned)
//!           └──────────────────────┘
//!           ... data buffers anywhere else in the region ...
//! ```
//!
//! All multi-byte fields on the wire are little-endian. This module exposes
//! only bounds-checked byte and little-endian scalar accessors; nothing
//! above it touches raw pointers. Memory ordering (fences around index
//! publication) is the ring layer's responsibility, not this one's.

use thiserror::Error;
use vm_memory::{Bytes, GuestAddress, GuestMemoryMmap};

/// Errors from allocating or accessing the shared region.
#[derive(Debug, Error)]
pub enum MemoryError {
    /// The backing mmap could not be created.
    #[error("Failed to allocate queue memory: {0}")]
    Allocation(String),

    /// An access fell outside the region.
    #[error("Memory access at {addr:#x} ({len} bytes) out of bounds")]
    OutOfBounds {
        /// Start address of the failed access.
        addr: u64,
        /// Length of the failed access in bytes.
        len: usize,
    },
}

/// Shared memory region holding ring structures and data buffers.
///
/// This is a thin wrapper around `GuestMemoryMmap` providing a single
/// contiguous region starting at address 0, the same shape the rings assume
/// when a transport hands the driver a base address.
pub struct QueueMemory {
    /// The underlying vm-memory mapping.
    inner: GuestMemoryMmap,
    /// Size of the region in bytes.
    size: u64,
}

impl QueueMemory {
    /// Allocate a new region of `size` bytes, zero-filled.
    ///
    /// # Errors
    ///
    /// Returns an error if the mmap allocation fails.
    pub fn new(size: u64) -> Result<Self, MemoryError> {
        let regions = vec![(GuestAddress(0), size as usize)];
        let inner = GuestMemoryMmap::from_ranges(&regions)
            .map_err(|e| MemoryError::Allocation(e.to_string()))?;
        Ok(Self { inner, size })
    }

    /// Size of the region in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Read bytes at `addr` into `data`.
    ///
    /// # Errors
    ///
    /// Returns an error if the read would exceed the region.
    pub fn read(&self, addr: u64, data: &mut [u8]) -> Result<(), MemoryError> {
        self.inner
            .read_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }

    /// Write `data` at `addr`.
    ///
    /// # Errors
    ///
    /// Returns an error if the write would exceed the region.
    pub fn write(&self, addr: u64, data: &[u8]) -> Result<(), MemoryError> {
        self.inner
            .write_slice(data, GuestAddress(addr))
            .map_err(|_| MemoryError::OutOfBounds {
                addr,
                len: data.len(),
            })
    }

    /// Read a 16-bit little-endian value at `addr`.
    pub fn read_u16(&self, addr: u64) -> Result<u16, MemoryError> {
        let mut buf = [0u8; 2];
        self.read(addr, &mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    /// Read a 32-bit little-endian value at `addr`.
    pub fn read_u32(&self, addr: u64) -> Result<u32, MemoryError> {
        let mut buf = [0u8; 4];
        self.read(addr, &mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    /// Read a 64-bit little-endian value at `addr`.
    pub fn read_u64(&self, addr: u64) -> Result<u64, MemoryError> {
        let mut buf = [0u8; 8];
        self.read(addr, &mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    /// Write a 16-bit value at `addr` (little-endian).
    pub fn write_u16(&self, addr: u64, value: u16) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write a 32-bit value at `addr` (little-endian).
    pub fn write_u32(&self, addr: u64, value: u32) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Write a 64-bit value at `addr` (little-endian).
    pub fn write_u64(&self, addr: u64, value: u64) -> Result<(), MemoryError> {
        self.write(addr, &value.to_le_bytes())
    }

    /// Zero `len` bytes starting at `addr`.
    ///
    /// Used by queue reset to bring the ring structures back to their
    /// initial state.
    pub fn zero(&self, addr: u64, len: u64) -> Result<(), MemoryError> {
        // Chunked so a large ring region doesn't need a single allocation
        // of its full size.
        const CHUNK: u64 = 4096;
        let zeros = [0u8; CHUNK as usize];
        let mut offset = 0;
        while offset < len {
            let n = (len - offset).min(CHUNK);
            self.write(addr + offset, &zeros[..n as usize])?;
            offset += n;
        }
        Ok(())
    }
}

//! Defines buffers that are used to send packets.

#![no_std]

#[macro_use] extern crate log;
extern crate memory;
extern crate kernel_config;

use core::ops::{Deref, DerefMut};
use memory::{MappedRegion, MemoryError, MemorySubsystem, PhysicalAddress, create_contiguous_mapping};
use kernel_config::memory::PAGE_SIZE;

/// A buffer that stores a packet payload to be transmitted through the NIC
/// and is guaranteed to be contiguous in physical memory.
/// Auto-dereferences into a byte slice covering its logical length,
/// which may be shorter than the underlying memory.
pub struct TransmitBuffer<M: MappedRegion> {
    mp: M,
    phys_addr: PhysicalAddress,
    length: usize,
}

impl<M: MappedRegion> TransmitBuffer<M> {
    /// Creates a new TransmitBuffer with a logical length of `length` bytes,
    /// backed by `length + slack` bytes of DMA memory.
    pub fn new<S>(mem: &S, length: usize, slack: usize) -> Result<TransmitBuffer<M>, MemoryError>
        where S: MemorySubsystem<Mapping = M>
    {
        let size_in_bytes = length.checked_add(slack)
            .ok_or(MemoryError::Allocation("transmit buffer size overflows"))?;
        let (mp, phys_addr) = create_contiguous_mapping(mem, size_in_bytes, PAGE_SIZE)?;
        debug!("TransmitBuffer::new(): {:#X} bytes at {:?} ({:?})", size_in_bytes, mp.start_address(), phys_addr);
        Ok(TransmitBuffer { mp, phys_addr, length })
    }

    /// The physical (bus) address of the first byte of this buffer.
    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys_addr
    }

    /// The logical length of this buffer.
    pub fn length(&self) -> usize {
        self.length
    }

    /// The size of the memory backing this buffer, which bounds its logical length.
    pub fn capacity(&self) -> usize {
        self.mp.size_in_bytes()
    }

    /// Sets the buffer's logical length.
    ///
    /// Returns an error if the length is greater than the buffer's capacity.
    pub fn set_length(&mut self, length: usize) -> Result<(), &'static str> {
        if length > self.capacity() {
            Err("TransmitBuffer::set_length(): length too long")
        } else {
            self.length = length;
            Ok(())
        }
    }
}

impl<M: MappedRegion> Deref for TransmitBuffer<M> {
    type Target = [u8];

    fn deref(&self) -> &Self::Target {
        let start = self.mp.start_address().value() as *const u8;
        // SAFETY: `length` never exceeds the size of the mapping, which is valid while `self` lives.
        unsafe { core::slice::from_raw_parts(start, self.length) }
    }
}

impl<M: MappedRegion> DerefMut for TransmitBuffer<M> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        let start = self.mp.start_address().value() as *mut u8;
        // SAFETY: as above, and `&mut self` guarantees exclusive access.
        unsafe { core::slice::from_raw_parts_mut(start, self.length) }
    }
}

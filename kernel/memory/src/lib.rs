//! The memory subsystem interface that NIC drivers are built against.
//!
//! A driver never maps memory or translates addresses itself.
//! It asks an implementation of [`MemorySubsystem`] to:
//! * map a device's physical register window into virtual memory,
//! * allocate physically-contiguous, DMA-visible memory, and
//! * translate a virtual address into the physical (bus) address that the device uses.
//!
//! The returned regions implement [`MappedRegion`] and are unmapped or freed when dropped.
//!
//! [`HeapMemory`] is a simple implementation backed by the global allocator,
//! in which "physical" addresses are virtual addresses plus a fixed offset.

#![no_std]

extern crate alloc;
#[macro_use] extern crate log;
#[macro_use] extern crate derive_more;
extern crate bit_field;
extern crate kernel_config;

mod heap;

pub use heap::{HeapMemory, HeapMapping};

use core::{
    fmt,
    ops::{Add, AddAssign},
};
use bit_field::BitField;
use kernel_config::memory::PAGE_SIZE;


/// A virtual memory address, which is a `usize` under the hood.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    Display, Binary, Octal, LowerHex, UpperHex,
)]
#[repr(transparent)]
pub struct VirtualAddress(usize);

impl VirtualAddress {
    /// Creates a new `VirtualAddress`.
    pub const fn new_canonical(virt_addr: usize) -> VirtualAddress {
        VirtualAddress(virt_addr)
    }

    /// Creates a VirtualAddress with the value 0.
    pub const fn zero() -> VirtualAddress {
        VirtualAddress(0)
    }

    /// Returns the underlying `usize` value for this `VirtualAddress`.
    #[inline]
    pub const fn value(&self) -> usize {
        self.0
    }

    /// Returns the offset that this VirtualAddress specifies into its containing memory Page.
    pub const fn page_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl fmt::Debug for VirtualAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "v{:#X}", self.0)
    }
}

impl Add<usize> for VirtualAddress {
    type Output = VirtualAddress;

    fn add(self, rhs: usize) -> VirtualAddress {
        VirtualAddress(self.0.saturating_add(rhs))
    }
}

impl AddAssign<usize> for VirtualAddress {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl From<VirtualAddress> for usize {
    #[inline]
    fn from(virt_addr: VirtualAddress) -> usize {
        virt_addr.0
    }
}


/// A physical memory address, which is a `usize` under the hood.
///
/// This is the address a device uses when it accesses memory via DMA,
/// i.e., the bus address.
#[derive(
    Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default,
    Display, Binary, Octal, LowerHex, UpperHex,
)]
#[repr(transparent)]
pub struct PhysicalAddress(usize);

impl PhysicalAddress {
    /// Creates a new `PhysicalAddress`,
    /// checking that the bits (64:52] are 0.
    pub fn new(phys_addr: usize) -> Option<PhysicalAddress> {
        if (phys_addr as u64).get_bits(52..64) == 0 {
            Some(PhysicalAddress(phys_addr))
        } else {
            None
        }
    }

    /// Creates a new `PhysicalAddress` that is guaranteed to be canonical
    /// by forcing the upper bits (64:52] to be 0.
    pub fn new_canonical(phys_addr: usize) -> PhysicalAddress {
        let mut addr = phys_addr as u64;
        addr.set_bits(52..64, 0);
        PhysicalAddress(addr as usize)
    }

    /// Creates a PhysicalAddress with the value 0.
    pub const fn zero() -> PhysicalAddress {
        PhysicalAddress(0)
    }

    /// Returns the underlying `usize` value for this `PhysicalAddress`.
    #[inline]
    pub const fn value(&self) -> usize {
        self.0
    }

    /// Returns the offset that this PhysicalAddress specifies into its containing memory Frame.
    pub const fn frame_offset(&self) -> usize {
        self.0 & (PAGE_SIZE - 1)
    }
}

impl fmt::Debug for PhysicalAddress {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "p{:#X}", self.0)
    }
}

impl Add<usize> for PhysicalAddress {
    type Output = PhysicalAddress;

    fn add(self, rhs: usize) -> PhysicalAddress {
        PhysicalAddress::new_canonical(self.0.saturating_add(rhs))
    }
}

impl AddAssign<usize> for PhysicalAddress {
    fn add_assign(&mut self, rhs: usize) {
        *self = *self + rhs;
    }
}

impl From<PhysicalAddress> for usize {
    #[inline]
    fn from(phys_addr: PhysicalAddress) -> usize {
        phys_addr.0
    }
}


/// Errors reported by a [`MemorySubsystem`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MemoryError {
    /// A physical region (e.g., a device's register window) could not be mapped.
    Mapping(&'static str),
    /// Memory could not be allocated.
    Allocation(&'static str),
    /// A virtual address has no physical translation.
    Translation(VirtualAddress),
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            MemoryError::Mapping(msg)    => write!(f, "mapping failed: {}", msg),
            MemoryError::Allocation(msg) => write!(f, "allocation failed: {}", msg),
            MemoryError::Translation(v)  => write!(f, "no physical translation for {:?}", v),
        }
    }
}


/// A region of virtual memory that is mapped for the lifetime of this object.
///
/// # Safety
/// Implementors must guarantee that `size_in_bytes()` bytes starting at
/// `start_address()` are valid for volatile reads and writes for as long as
/// the region exists, and that no other live region overlaps it.
pub unsafe trait MappedRegion {
    /// The first virtual address of this region.
    fn start_address(&self) -> VirtualAddress;

    /// The size of this region in bytes.
    fn size_in_bytes(&self) -> usize;

    /// Returns a raw pointer to the byte at `offset` within this region.
    fn as_mut_ptr_at(&self, offset: usize) -> Result<*mut u8, &'static str> {
        if offset >= self.size_in_bytes() {
            return Err("MappedRegion::as_mut_ptr_at(): offset out of bounds");
        }
        Ok((self.start_address().value() + offset) as *mut u8)
    }

    /// Returns a byte slice of `length` bytes starting at `offset` within this region.
    fn as_slice(&self, offset: usize, length: usize) -> Result<&[u8], &'static str> {
        let end = offset.checked_add(length).ok_or("MappedRegion::as_slice(): length overflow")?;
        if end > self.size_in_bytes() {
            return Err("MappedRegion::as_slice(): requested slice exceeds the region");
        }
        let start = (self.start_address().value() + offset) as *const u8;
        // SAFETY: the range was bounds-checked and the region is valid per the trait contract.
        Ok(unsafe { core::slice::from_raw_parts(start, length) })
    }

    /// Returns a mutable byte slice of `length` bytes starting at `offset` within this region.
    fn as_slice_mut(&mut self, offset: usize, length: usize) -> Result<&mut [u8], &'static str> {
        let end = offset.checked_add(length).ok_or("MappedRegion::as_slice_mut(): length overflow")?;
        if end > self.size_in_bytes() {
            return Err("MappedRegion::as_slice_mut(): requested slice exceeds the region");
        }
        let start = (self.start_address().value() + offset) as *mut u8;
        // SAFETY: the range was bounds-checked, the region is valid per the trait contract,
        // and `&mut self` ensures exclusive access through this handle.
        Ok(unsafe { core::slice::from_raw_parts_mut(start, length) })
    }
}


/// The host-provided memory subsystem that a NIC driver relies upon.
///
/// # Safety
/// Every region returned must uphold the [`MappedRegion`] contract, and
/// `translate()` must return the address at which the device sees the given byte.
pub unsafe trait MemorySubsystem {
    /// The type of region returned by this memory subsystem.
    type Mapping: MappedRegion;

    /// Maps `size_in_bytes` of device memory starting at `phys_addr` as uncached memory.
    fn map_device_memory(&self, phys_addr: PhysicalAddress, size_in_bytes: usize) -> Result<Self::Mapping, MemoryError>;

    /// Allocates `size_in_bytes` of physically-contiguous memory that a device can access via DMA.
    /// The start of the region is aligned to at least `alignment` bytes, which must be a power of two.
    fn allocate_dma(&self, size_in_bytes: usize, alignment: usize) -> Result<Self::Mapping, MemoryError>;

    /// Translates the given virtual address into the physical (bus) address a device must use.
    fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress>;
}


/// Allocates a physically-contiguous DMA region and returns it along with its starting physical address.
pub fn create_contiguous_mapping<M: MemorySubsystem>(
    mem: &M,
    size_in_bytes: usize,
    alignment: usize,
) -> Result<(M::Mapping, PhysicalAddress), MemoryError> {
    let mapping = mem.allocate_dma(size_in_bytes, alignment)?;
    let vaddr = mapping.start_address();
    let paddr = mem.translate(vaddr).ok_or_else(|| {
        error!("memory::create_contiguous_mapping(): couldn't translate {:?}", vaddr);
        MemoryError::Translation(vaddr)
    })?;
    Ok((mapping, paddr))
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn physical_address_canonical() {
        assert!(PhysicalAddress::new(0x000F_FFFF_FFFF_FFFF).is_some());
        assert!(PhysicalAddress::new(0x0010_0000_0000_0000).is_none());
        assert_eq!(PhysicalAddress::new_canonical(0xFFF0_0000_1234_5678).value(), 0x1234_5678);
    }

    #[test]
    fn address_offsets() {
        let p = PhysicalAddress::new_canonical(0xF020_0123);
        assert_eq!(p.frame_offset(), 0x123);
        assert_eq!((p + 0x10).value(), 0xF020_0133);

        let mut v = VirtualAddress::new_canonical(0x1000);
        v += 0x20;
        assert_eq!(v.value(), 0x1020);
        assert_eq!(v.page_offset(), 0x20);
    }

    #[test]
    fn contiguous_mapping_translates_start() {
        let mem = HeapMemory::new().with_phys_offset(0x1_0000_0000);
        let (mp, paddr) = create_contiguous_mapping(&mem, 4096, 128).unwrap();
        assert_eq!(paddr.value(), mp.start_address().value() + 0x1_0000_0000);
        assert_eq!(mp.start_address().value() % 128, 0);
    }

    #[test]
    fn slices_are_bounds_checked() {
        let mem = HeapMemory::new();
        let mut mp = mem.allocate_dma(64, 16).unwrap();
        assert!(mp.as_slice(0, 64).is_ok());
        assert!(mp.as_slice(1, 64).is_err());
        assert!(mp.as_slice_mut(usize::MAX, 2).is_err());
        assert!(mp.as_mut_ptr_at(64).is_err());

        mp.as_slice_mut(10, 2).unwrap().copy_from_slice(&[0xAB, 0xCD]);
        assert_eq!(mp.as_slice(9, 4).unwrap(), &[0, 0xAB, 0xCD, 0]);
    }
}

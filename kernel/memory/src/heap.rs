//! A memory subsystem backed by the global heap allocator.
//!
//! Device memory is simulated by zeroed heap memory, so a driver's register
//! writes can be observed by reading the region back.
//! Physical addresses are the virtual address plus a configurable offset.

use core::{
    alloc::Layout,
    cell::Cell,
    ptr::NonNull,
};
use alloc::alloc::{alloc_zeroed, dealloc};
use super::{MappedRegion, MemoryError, MemorySubsystem, PhysicalAddress, VirtualAddress};

/// Device memory regions are always page-aligned.
const DEVICE_MEMORY_ALIGNMENT: usize = kernel_config::memory::PAGE_SIZE;

/// A [`MemorySubsystem`] that hands out zeroed heap allocations.
#[derive(Debug)]
pub struct HeapMemory {
    phys_offset: usize,
    device_memory_available: bool,
    allocations_left: Cell<Option<usize>>,
    dma_allocations: Cell<usize>,
    device_mappings: Cell<usize>,
}

impl HeapMemory {
    /// Creates a heap memory subsystem with an identity virtual-to-physical translation.
    pub const fn new() -> HeapMemory {
        HeapMemory {
            phys_offset: 0,
            device_memory_available: true,
            allocations_left: Cell::new(None),
            dma_allocations: Cell::new(0),
            device_mappings: Cell::new(0),
        }
    }

    /// Physical addresses will be reported as `virtual address + phys_offset`.
    pub fn with_phys_offset(mut self, phys_offset: usize) -> HeapMemory {
        self.phys_offset = phys_offset;
        self
    }

    /// Every subsequent request to map device memory will fail.
    pub fn without_device_memory(mut self) -> HeapMemory {
        self.device_memory_available = false;
        self
    }

    /// Only the next `count` DMA allocations will succeed.
    pub fn with_allocation_limit(self, count: usize) -> HeapMemory {
        self.allocations_left.set(Some(count));
        self
    }

    /// The number of successful DMA allocations so far.
    pub fn dma_allocations(&self) -> usize {
        self.dma_allocations.get()
    }

    /// The number of successful device memory mappings so far.
    pub fn device_mappings(&self) -> usize {
        self.device_mappings.get()
    }

    fn take_allocation(&self) -> bool {
        match self.allocations_left.get() {
            None => true,
            Some(0) => false,
            Some(n) => {
                self.allocations_left.set(Some(n - 1));
                true
            }
        }
    }
}

impl Default for HeapMemory {
    fn default() -> Self {
        HeapMemory::new()
    }
}

unsafe impl MemorySubsystem for HeapMemory {
    type Mapping = HeapMapping;

    fn map_device_memory(&self, phys_addr: PhysicalAddress, size_in_bytes: usize) -> Result<HeapMapping, MemoryError> {
        if !self.device_memory_available {
            return Err(MemoryError::Mapping("device memory is unavailable"));
        }
        let mapping = HeapMapping::allocate(size_in_bytes, DEVICE_MEMORY_ALIGNMENT)
            .ok_or(MemoryError::Mapping("couldn't allocate backing memory for device region"))?;
        self.device_mappings.set(self.device_mappings.get() + 1);
        debug!("HeapMemory: mapped device memory {:?} ({:#X} bytes) at {:?}", phys_addr, size_in_bytes, mapping.start_address());
        Ok(mapping)
    }

    fn allocate_dma(&self, size_in_bytes: usize, alignment: usize) -> Result<HeapMapping, MemoryError> {
        if !self.take_allocation() {
            return Err(MemoryError::Allocation("allocation limit reached"));
        }
        let mapping = HeapMapping::allocate(size_in_bytes, alignment)
            .ok_or(MemoryError::Allocation("out of heap memory"))?;
        self.dma_allocations.set(self.dma_allocations.get() + 1);
        Ok(mapping)
    }

    fn translate(&self, vaddr: VirtualAddress) -> Option<PhysicalAddress> {
        PhysicalAddress::new(vaddr.value().wrapping_add(self.phys_offset))
    }
}


/// A zeroed heap allocation, freed on drop.
#[derive(Debug)]
pub struct HeapMapping {
    ptr: NonNull<u8>,
    layout: Layout,
}

impl HeapMapping {
    fn allocate(size_in_bytes: usize, alignment: usize) -> Option<HeapMapping> {
        if size_in_bytes == 0 {
            return None;
        }
        let layout = Layout::from_size_align(size_in_bytes, alignment).ok()?;
        // SAFETY: the layout has a non-zero size.
        let ptr = NonNull::new(unsafe { alloc_zeroed(layout) })?;
        Some(HeapMapping { ptr, layout })
    }
}

unsafe impl MappedRegion for HeapMapping {
    fn start_address(&self) -> VirtualAddress {
        VirtualAddress::new_canonical(self.ptr.as_ptr() as usize)
    }

    fn size_in_bytes(&self) -> usize {
        self.layout.size()
    }
}

impl Drop for HeapMapping {
    fn drop(&mut self) {
        // SAFETY: `ptr` was allocated with `layout` by `alloc_zeroed`.
        unsafe { dealloc(self.ptr.as_ptr(), self.layout) }
    }
}

//! Functions that are used in a NIC initialization procedure.
//!
//! They include mapping the device's registers, and allocating and registering its transmit descriptor ring.

#![no_std]

#[macro_use] extern crate log;
extern crate memory;
extern crate intel_ethernet;
extern crate nic_queues;
extern crate kernel_config;

use memory::{MemoryError, MemorySubsystem, PhysicalAddress, MappedRegion, create_contiguous_mapping};
use intel_ethernet::types::{Tdbal, Tdbah, Tdlen};
use nic_queues::{TxDescriptorRing, TxQueueRegisters};
use kernel_config::nic::{DESC_RING_ALIGNMENT, DESC_SIZE};


/// Maps the memory-mapped registers of a device.
///
/// # Arguments
/// * `mem`: the memory subsystem that performs the mapping
/// * `mem_base`: starting physical address of the device's memory mapped registers
/// * `mem_size_in_bytes`: size of the register region
pub fn allocate_memory<M: MemorySubsystem>(mem: &M, mem_base: PhysicalAddress, mem_size_in_bytes: usize) -> Result<M::Mapping, MemoryError> {
    let mapping = mem.map_device_memory(mem_base, mem_size_in_bytes).map_err(|e| {
        error!("nic_initialization::allocate_memory(): failed to map {:#X} bytes at {:?}: {}", mem_size_in_bytes, mem_base, e);
        e
    })?;
    debug!("nic_initialization: memory base: {:?}, memory size: {:#X}, mapped at {:?}", mem_base, mem_size_in_bytes, mapping.start_address());
    Ok(mapping)
}

/// Splits a physical address into the low and high 32-bit halves written to the base address registers.
pub fn split_phys_addr(paddr: PhysicalAddress) -> (Tdbal, Tdbah) {
    let value = paddr.value() as u64;
    (value as u32, (value >> 32) as u32)
}

/// Allocates a ring of `num_desc` transmit descriptors and marks every descriptor as done.
pub fn allocate_tx_ring<M: MemorySubsystem>(mem: &M, num_desc: u16) -> Result<TxDescriptorRing<M::Mapping>, MemoryError> {
    let size_in_bytes_of_all_tx_descs = num_desc as usize * DESC_SIZE;

    // Tx descriptors must be 128 byte-aligned.
    let (tx_descs_mapped_pages, tx_descs_starting_phys_addr) = create_contiguous_mapping(mem, size_in_bytes_of_all_tx_descs, DESC_RING_ALIGNMENT)
        .map_err(|e| {
            error!("nic_initialization::allocate_tx_ring(): failed to allocate TX ring: {}", e);
            e
        })?;

    let mut tx_descs = TxDescriptorRing::new(tx_descs_mapped_pages, tx_descs_starting_phys_addr, num_desc)
        .map_err(MemoryError::Allocation)?;
    tx_descs.init();
    Ok(tx_descs)
}

/// Registers the given ring with the device: its base address, its length,
/// and head and tail indices of zero, since no descriptors are pending yet.
pub fn program_tx_queue<S: TxQueueRegisters, M: MappedRegion>(tx_descs: &TxDescriptorRing<M>, txq_regs: &mut S) {
    let (tx_desc_phys_addr_lower, tx_desc_phys_addr_higher) = split_phys_addr(tx_descs.phys_addr());
    debug!("nic_initialization::program_tx_queue(): phys_addr of tx_desc: {:?}", tx_descs.phys_addr());

    // write the physical address of the tx descs array
    txq_regs.set_tdbal(tx_desc_phys_addr_lower);
    txq_regs.set_tdbah(tx_desc_phys_addr_higher);

    // write the length (in total bytes) of the tx descs array
    txq_regs.set_tdlen(tx_descs.size_in_bytes() as Tdlen);

    // write the tail index and the head index (both 0 initially because there are no tx requests yet)
    txq_regs.set_tdt(0);
    txq_regs.set_tdh(0);
}

/// Steps to create and initialize a transmit descriptor queue
///
/// # Arguments
/// * `mem`: the memory subsystem from which the ring is allocated
/// * `num_desc`: number of descriptors in the queue
/// * `txq_regs`: registers needed to set up a transmit queue
pub fn init_tx_queue<M: MemorySubsystem, S: TxQueueRegisters>(mem: &M, num_desc: u16, txq_regs: &mut S)
    -> Result<TxDescriptorRing<M::Mapping>, MemoryError>
{
    let tx_descs = allocate_tx_ring(mem, num_desc)?;
    program_tx_queue(&tx_descs, txq_regs);
    Ok(tx_descs)
}

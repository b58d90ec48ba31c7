//! The transmit descriptor ring and the queue that hands its descriptors to a NIC.
//!
//! Ownership of ring slots alternates between software and hardware:
//! slots in `[head, tail)` belong to the hardware, all others belong to software.
//! Software fills slots starting at the tail and then writes the new tail index
//! to the device's tail register (the "doorbell"), after which the hardware
//! consumes descriptors and advances the head.
//! One slot is always left unused so that a full ring can be told apart from an empty one.

#![no_std]

#[macro_use] extern crate log;
extern crate memory;
extern crate intel_ethernet;
extern crate kernel_config;

use core::{
    fmt,
    ptr::{read_volatile, write_volatile},
    sync::atomic::{fence, Ordering},
};
use memory::{MappedRegion, PhysicalAddress};
use intel_ethernet::{
    descriptors::{DataDescriptor, DescriptorSlot, TsoContext, TxDescriptor},
    types::{Tdbal, Tdbah, Tdh, Tdlen, Tdt},
};
use kernel_config::nic::DESC_SIZE;


/// The set of functions required to program a transmit queue's registers.
pub trait TxQueueRegisters {
    fn set_tdbal(&mut self, value: Tdbal);
    fn set_tdbah(&mut self, value: Tdbah);
    fn set_tdlen(&mut self, value: Tdlen);
    fn set_tdh(&mut self, value: Tdh);
    fn set_tdt(&mut self, value: Tdt);
    /// Reads the head index, which only the hardware advances.
    fn get_tdh(&self) -> Tdh;
    fn get_tdt(&self) -> Tdt;
}


/// Errors that can occur when submitting frames on a transmit queue.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxError {
    /// A frame needs at least one data descriptor.
    EmptyFrame,
    /// A fragment or payload length doesn't fit in a descriptor's length field.
    LengthTooLong,
    /// The ring doesn't have enough free slots for the frame.
    RingFull { needed: u16, available: u16 },
    /// The hardware didn't finish consuming descriptors within the poll limit.
    Timeout,
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            TxError::EmptyFrame => write!(f, "frame has no data fragments"),
            TxError::LengthTooLong => write!(f, "length doesn't fit in a descriptor"),
            TxError::RingFull { needed, available } =>
                write!(f, "ring full: {} descriptors needed, {} available", needed, available),
            TxError::Timeout => write!(f, "timed out waiting for the hardware"),
        }
    }
}


/// One fragment of a TSO payload, described by a single data descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Fragment {
    pub phys_addr: PhysicalAddress,
    pub length: u32,
    /// Whether this fragment's descriptor carries the TCP Segmentation Enable bit.
    pub tse: bool,
}


/// Advances a ring index by `count` slots, wrapping around a ring of `num_descs` slots.
pub fn advance_index(index: u16, count: u16, num_descs: u16) -> u16 {
    ((index as u32 + count as u32) % num_descs as u32) as u16
}

/// The number of slots software may fill, given the hardware's head and software's tail.
pub fn free_slots(head: u16, tail: u16, num_descs: u16) -> u16 {
    let n = num_descs as u32;
    ((head as u32 % n + n - tail as u32 % n - 1) % n) as u16
}


/// A ring of transmit descriptors in physically-contiguous, DMA-visible memory.
pub struct TxDescriptorRing<M: MappedRegion> {
    mp: M,
    phys_addr: PhysicalAddress,
    num_descs: u16,
}

impl<M: MappedRegion> TxDescriptorRing<M> {
    /// Wraps the given memory as a ring of `num_descs` descriptors.
    /// The memory must start at `phys_addr`, be 16-byte aligned, and be large enough for every slot.
    pub fn new(mp: M, phys_addr: PhysicalAddress, num_descs: u16) -> Result<TxDescriptorRing<M>, &'static str> {
        if num_descs < 2 {
            return Err("TxDescriptorRing::new(): a ring needs at least 2 descriptors");
        }
        if mp.size_in_bytes() < num_descs as usize * DESC_SIZE {
            return Err("TxDescriptorRing::new(): memory is too small for the requested descriptors");
        }
        if mp.start_address().value() % DESC_SIZE != 0 || phys_addr.value() % DESC_SIZE != 0 {
            return Err("TxDescriptorRing::new(): descriptor memory must be 16-byte aligned");
        }
        Ok(TxDescriptorRing { mp, phys_addr, num_descs })
    }

    /// Marks every slot as done, clearing all other fields.
    pub fn init(&mut self) {
        let done = DescriptorSlot::done();
        for i in 0..self.num_descs {
            self.write_slot(i, done);
        }
    }

    /// The physical (bus) address of the first descriptor.
    pub fn phys_addr(&self) -> PhysicalAddress {
        self.phys_addr
    }

    /// The number of descriptors in this ring.
    pub fn len(&self) -> u16 {
        self.num_descs
    }

    /// The size in bytes of all descriptors in this ring, as programmed into the length register.
    pub fn size_in_bytes(&self) -> usize {
        self.num_descs as usize * DESC_SIZE
    }

    fn slot_ptr(&self, index: u16) -> *mut DescriptorSlot {
        let index = index % self.num_descs;
        (self.mp.start_address().value() + index as usize * DESC_SIZE) as *mut DescriptorSlot
    }

    /// Reads and decodes the descriptor in slot `index` (modulo the ring length).
    pub fn read(&self, index: u16) -> TxDescriptor {
        // SAFETY: the slot lies within the mapping and is 16-byte aligned, checked in `new()`.
        let slot = unsafe { read_volatile(self.slot_ptr(index)) };
        slot.decode()
    }

    /// Encodes `desc` into slot `index` (modulo the ring length).
    pub fn write(&mut self, index: u16, desc: &TxDescriptor) {
        self.write_slot(index, desc.encode());
    }

    fn write_slot(&mut self, index: u16, slot: DescriptorSlot) {
        // SAFETY: as in `read()`; `&mut self` guarantees no other software writer.
        unsafe { write_volatile(self.slot_ptr(index), slot) }
    }
}


/// A struct that holds all information for a transmit queue.
/// There should be one such object per queue.
pub struct TxQueue<S: TxQueueRegisters, M: MappedRegion> {
    /// The number of the queue, stored here for our convenience.
    pub id: u8,
    /// Registers for this transmit queue
    regs: S,
    /// Transmit descriptors
    tx_descs: TxDescriptorRing<M>,
    /// The software tail: the next slot to be filled, and the last value written to the tail register.
    tx_cur: u16,
}

impl<S: TxQueueRegisters, M: MappedRegion> TxQueue<S, M> {
    /// Creates a queue over a ring whose registers have already been programmed,
    /// starting at the tail index currently held by the device.
    pub fn new(id: u8, regs: S, tx_descs: TxDescriptorRing<M>) -> TxQueue<S, M> {
        let tx_cur = (regs.get_tdt() % tx_descs.len() as u32) as u16;
        TxQueue { id, regs, tx_descs, tx_cur }
    }

    pub fn num_tx_descs(&self) -> u16 {
        self.tx_descs.len()
    }

    /// The index of the next slot that software will fill.
    pub fn tail(&self) -> u16 {
        self.tx_cur
    }

    /// The index of the next slot that hardware will consume.
    pub fn head(&self) -> u16 {
        (self.regs.get_tdh() % self.num_tx_descs() as u32) as u16
    }

    pub fn descriptors(&self) -> &TxDescriptorRing<M> {
        &self.tx_descs
    }

    pub fn registers(&self) -> &S {
        &self.regs
    }

    pub fn registers_mut(&mut self) -> &mut S {
        &mut self.regs
    }

    /// The number of slots that can be filled without overwriting descriptors owned by hardware.
    pub fn free_descriptors(&self) -> u16 {
        free_slots(self.head(), self.tx_cur, self.num_tx_descs())
    }

    /// Writes one TSO frame (a context descriptor followed by one data descriptor per fragment)
    /// starting at the tail, then rings the doorbell.
    ///
    /// The last data descriptor is the only one marked End of Packet.
    /// Returns the new tail index.
    pub fn send_tso_frame(&mut self, context: &TsoContext, fragments: &[Fragment]) -> Result<u16, TxError> {
        if fragments.is_empty() {
            return Err(TxError::EmptyFrame);
        }
        let needed = u16::try_from(fragments.len() + 1).map_err(|_| TxError::LengthTooLong)?;
        let available = self.free_descriptors();
        if needed > available {
            warn!("TxQueue {}: ring full, {} descriptors needed but only {} available", self.id, needed, available);
            return Err(TxError::RingFull { needed, available });
        }

        // Encode everything up front so that a bad fragment leaves the ring untouched.
        let ctx = context.to_descriptor().map_err(|_| TxError::LengthTooLong)?;
        for frag in fragments {
            DataDescriptor::fragment(frag.phys_addr, frag.length, frag.tse, false).map_err(|_| TxError::LengthTooLong)?;
        }

        let start = self.tx_cur;
        self.tx_descs.write(start, &TxDescriptor::Context(ctx));
        let last = fragments.len() - 1;
        for (i, frag) in fragments.iter().enumerate() {
            let data = DataDescriptor::fragment(frag.phys_addr, frag.length, frag.tse, i == last)
                .map_err(|_| TxError::LengthTooLong)?;
            self.tx_descs.write(advance_index(start, i as u16 + 1, self.num_tx_descs()), &TxDescriptor::Data(data));
        }

        let new_tail = advance_index(start, needed, self.num_tx_descs());
        self.update_tdt(new_tail);
        debug!("TxQueue {}: submitted {} descriptors, tail {} -> {}", self.id, needed, start, new_tail);
        Ok(new_tail)
    }

    /// Writes the tail register, handing every slot before `new_tail` to the hardware.
    fn update_tdt(&mut self, new_tail: u16) {
        // Descriptor writes must be visible to the device before it sees the new tail.
        fence(Ordering::SeqCst);
        self.regs.set_tdt(new_tail as Tdt);
        self.tx_cur = new_tail;
    }

    /// Polls the head register until the hardware has consumed every submitted descriptor,
    /// giving up after `poll_limit` reads.
    pub fn wait_for_completion(&self, poll_limit: usize) -> Result<(), TxError> {
        for _ in 0..poll_limit {
            if self.head() == self.tx_cur {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        error!("TxQueue {}: hardware didn't reach tail {} (head {}) after {} polls", self.id, self.tx_cur, self.head(), poll_limit);
        Err(TxError::Timeout)
    }
}


#[cfg(test)]
mod test {
    use super::*;
    use intel_ethernet::descriptors::{DescriptorKind, DESC_DATA, EOP, REPORT_STATUS, TSE};
    use memory::{HeapMapping, HeapMemory, create_contiguous_mapping};

    #[derive(Default)]
    struct FakeRegs {
        tdbal: u32,
        tdbah: u32,
        tdlen: u32,
        tdh: u32,
        tdt: u32,
        tdt_writes: usize,
    }

    impl TxQueueRegisters for FakeRegs {
        fn set_tdbal(&mut self, value: Tdbal) { self.tdbal = value; }
        fn set_tdbah(&mut self, value: Tdbah) { self.tdbah = value; }
        fn set_tdlen(&mut self, value: Tdlen) { self.tdlen = value; }
        fn set_tdh(&mut self, value: Tdh) { self.tdh = value; }
        fn set_tdt(&mut self, value: Tdt) { self.tdt = value; self.tdt_writes += 1; }
        fn get_tdh(&self) -> Tdh { self.tdh }
        fn get_tdt(&self) -> Tdt { self.tdt }
    }

    fn queue(num_descs: u16) -> TxQueue<FakeRegs, HeapMapping> {
        let mem = HeapMemory::new();
        let (mp, paddr) = create_contiguous_mapping(&mem, num_descs as usize * DESC_SIZE, 128).unwrap();
        let mut ring = TxDescriptorRing::new(mp, paddr, num_descs).unwrap();
        ring.init();
        TxQueue::new(0, FakeRegs::default(), ring)
    }

    fn context(payload_len: u32) -> TsoContext {
        TsoContext { ip_config: 0, tcp_config: 0, payload_len, tcp_seg_setup: 0x3F9B, tcp_ip: true }
    }

    fn fragments(lengths: &[u32]) -> [Fragment; 4] {
        let mut frags = [Fragment { phys_addr: PhysicalAddress::new_canonical(0x8000), length: 0, tse: true }; 4];
        for (f, len) in frags.iter_mut().zip(lengths) {
            f.length = *len;
        }
        frags
    }

    #[test]
    fn index_arithmetic_wraps() {
        assert_eq!(advance_index(0, 5, 256), 5);
        assert_eq!(advance_index(254, 5, 256), 3);
        assert_eq!(advance_index(255, 1, 256), 0);
        for tail in 0..256u16 {
            for k in 0..8 {
                assert!(advance_index(tail, k, 256) < 256);
            }
        }
    }

    #[test]
    fn free_slot_accounting() {
        assert_eq!(free_slots(0, 0, 256), 255);
        assert_eq!(free_slots(0, 5, 256), 250);
        assert_eq!(free_slots(5, 5, 256), 255);
        assert_eq!(free_slots(6, 5, 256), 0);
        assert_eq!(free_slots(0, 255, 256), 0);
        assert_eq!(free_slots(3, 250, 256), 8);
    }

    #[test]
    fn ring_rejects_bad_memory() {
        let mem = HeapMemory::new();
        let (mp, paddr) = create_contiguous_mapping(&mem, 64, 16).unwrap();
        assert!(TxDescriptorRing::new(mp, paddr, 8).is_err());
        let (mp, paddr) = create_contiguous_mapping(&mem, 64, 16).unwrap();
        assert!(TxDescriptorRing::new(mp, paddr + 8, 4).is_err());
        let (mp, paddr) = create_contiguous_mapping(&mem, 64, 16).unwrap();
        let ring = TxDescriptorRing::new(mp, paddr, 4).unwrap();
        assert_eq!(ring.size_in_bytes(), 64);
    }

    #[test]
    fn init_marks_every_slot_done() {
        let q = queue(256);
        for i in 0..256 {
            assert!(q.descriptors().read(i).is_done_sentinel());
        }
    }

    #[test]
    fn submit_one_frame_from_empty_ring() {
        let mut q = queue(256);
        let new_tail = q.send_tso_frame(&context(0x400), &fragments(&[0x100; 4])).unwrap();

        assert_eq!(new_tail, 5);
        assert_eq!(q.tail(), 5);
        assert_eq!(q.registers().tdt, 5);
        assert_eq!(q.registers().tdt_writes, 1);
        assert_eq!(q.registers().tdh, 0);

        let kinds: [DescriptorKind; 5] = core::array::from_fn(|i| q.descriptors().read(i as u16).kind());
        assert_eq!(kinds, [DescriptorKind::Context, DescriptorKind::Data, DescriptorKind::Data, DescriptorKind::Data, DescriptorKind::Data]);

        let eops = (0..5).filter(|i| q.descriptors().read(*i).end_of_packet()).count();
        assert_eq!(eops, 1);
        assert!(q.descriptors().read(4).end_of_packet());
        assert_eq!(q.descriptors().read(4).cmd_and_length(), EOP | REPORT_STATUS | DESC_DATA | TSE | 0x100);

        for i in 0..5 {
            assert!(!q.descriptors().read(i).is_done_sentinel());
        }
        for i in 5..256 {
            assert!(q.descriptors().read(i).is_done_sentinel());
        }
    }

    #[test]
    fn full_ring_is_rejected_until_head_advances() {
        let mut q = queue(16);
        assert_eq!(q.free_descriptors(), 15);
        q.send_tso_frame(&context(64), &fragments(&[16; 4])).unwrap();
        q.send_tso_frame(&context(64), &fragments(&[16; 4])).unwrap();
        q.send_tso_frame(&context(64), &fragments(&[16; 4])).unwrap();
        assert_eq!(q.tail(), 15);

        let err = q.send_tso_frame(&context(64), &fragments(&[16; 4])).unwrap_err();
        assert_eq!(err, TxError::RingFull { needed: 5, available: 0 });
        assert_eq!(q.registers().tdt, 15);

        // Hardware consumes the first two frames.
        q.registers_mut().tdh = 10;
        assert_eq!(q.send_tso_frame(&context(64), &fragments(&[16; 4])), Ok(4));
        assert_eq!(q.descriptors().read(15).kind(), DescriptorKind::Context);
        for i in 0..4 {
            assert_eq!(q.descriptors().read(i).kind(), DescriptorKind::Data);
        }
        assert!(q.descriptors().read(3).end_of_packet());
    }

    #[test]
    fn invalid_frames_leave_ring_untouched() {
        let mut q = queue(16);
        assert_eq!(q.send_tso_frame(&context(64), &[]), Err(TxError::EmptyFrame));
        let frags = fragments(&[16, 1 << 20, 16, 16]);
        assert_eq!(q.send_tso_frame(&context(64), &frags), Err(TxError::LengthTooLong));
        assert_eq!(q.send_tso_frame(&context(1 << 20), &fragments(&[16; 4])), Err(TxError::LengthTooLong));

        assert_eq!(q.tail(), 0);
        assert_eq!(q.registers().tdt_writes, 0);
        assert!(q.descriptors().read(0).is_done_sentinel());
    }

    #[test]
    fn wait_for_completion_times_out_without_hardware() {
        let mut q = queue(16);
        assert_eq!(q.wait_for_completion(1), Ok(()));
        q.send_tso_frame(&context(64), &fragments(&[16; 4])).unwrap();
        assert_eq!(q.wait_for_completion(100), Err(TxError::Timeout));
        q.registers_mut().tdh = 5;
        assert_eq!(q.wait_for_completion(1), Ok(()));
    }
}

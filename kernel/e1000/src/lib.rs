//! A driver for the transmit path of the Intel e1000 NIC, using TCP segmentation offload (TSO).
//!
//! Bringing up the NIC maps its registers, resets the device and sets the link up,
//! then allocates a transmit descriptor ring and a payload buffer and registers the ring
//! with the device before enabling transmission.
//! Frames are then submitted through the NIC's single [`TxQueue`].
//!
//! [`init_module()`] performs the whole bring-up, sends a fixed test frame,
//! and returns an [`E1000Module`] that releases everything when dropped.

#![no_std]

#[macro_use] extern crate log;
#[macro_use] extern crate static_assertions;
#[macro_use] extern crate bitflags;
extern crate alloc;
extern crate volatile;
extern crate kernel_config;
extern crate memory;
extern crate intel_ethernet;
extern crate nic_buffers;
extern crate nic_queues;
extern crate nic_initialization;

pub mod config;
pub mod control_file;
pub mod regs;
pub mod test_e1000_driver;

use core::fmt;
use memory::{MappedRegion, MemoryError, MemorySubsystem, PhysicalAddress};
use kernel_config::{memory::PAGE_SIZE, nic::{DEVICE_NAME, MAJOR_NUM}};
use intel_ethernet::{
    descriptors::TsoContext,
    types::{Tdbah, Tdbal, Tdh, Tdlen, Tdt},
};
use nic_buffers::TransmitBuffer;
use nic_queues::{Fragment, TxError, TxQueue, TxQueueRegisters};
use nic_initialization::{allocate_memory, allocate_tx_ring, program_tx_queue};
pub use config::E1000Config;
use control_file::ControlFile;
use regs::*;


/// Errors that can occur while bringing up the e1000 or transmitting on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum E1000Error {
    /// The register region couldn't be mapped.
    Mapping(&'static str),
    /// The descriptor ring or the transmit buffer couldn't be allocated.
    Allocation(&'static str),
    /// The control file is already open.
    Busy,
    /// The device didn't finish resetting within the poll limit.
    Timeout,
    /// The given [`E1000Config`] is unusable.
    InvalidConfig(&'static str),
    Tx(TxError),
}

impl fmt::Display for E1000Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            E1000Error::Mapping(s) => write!(f, "couldn't map e1000 registers: {}", s),
            E1000Error::Allocation(s) => write!(f, "couldn't allocate e1000 memory: {}", s),
            E1000Error::Busy => write!(f, "device is busy"),
            E1000Error::Timeout => write!(f, "timed out waiting for the device to reset"),
            E1000Error::InvalidConfig(s) => write!(f, "invalid e1000 config: {}", s),
            E1000Error::Tx(e) => write!(f, "transmit error: {}", e),
        }
    }
}

impl From<MemoryError> for E1000Error {
    fn from(e: MemoryError) -> Self {
        match e {
            MemoryError::Mapping(s) => E1000Error::Mapping(s),
            MemoryError::Allocation(s) => E1000Error::Allocation(s),
            MemoryError::Translation(_) => E1000Error::Allocation("DMA memory has no physical address"),
        }
    }
}

impl From<TxError> for E1000Error {
    fn from(e: TxError) -> Self {
        E1000Error::Tx(e)
    }
}


/// A struct which contains a handle to the transmit queue registers and implements the `TxQueueRegisters` trait,
/// which is required to store the registers in a `TxQueue` object.
pub struct E1000TxQueueRegisters<R: MappedRegion>(RegisterWindow<R>);

impl<R: MappedRegion> TxQueueRegisters for E1000TxQueueRegisters<R> {
    fn set_tdbal(&mut self, value: Tdbal) {
        self.0.write(REG_TXDESCLO, value);
    }
    fn set_tdbah(&mut self, value: Tdbah) {
        self.0.write(REG_TXDESCHI, value);
    }
    fn set_tdlen(&mut self, value: Tdlen) {
        self.0.write(REG_TXDESCLEN, value);
    }
    fn set_tdh(&mut self, value: Tdh) {
        self.0.write(REG_TXDESCHEAD, value);
    }
    fn set_tdt(&mut self, value: Tdt) {
        self.0.write(REG_TXDESCTAIL, value);
    }
    fn get_tdh(&self) -> Tdh {
        self.0.read(REG_TXDESCHEAD)
    }
    fn get_tdt(&self) -> Tdt {
        self.0.read(REG_TXDESCTAIL)
    }
}


/// Struct representing an e1000 network interface card.
pub struct E1000Nic<M: MemorySubsystem> {
    /// MMIO Base Address
    mem_base: PhysicalAddress,
    /// memory-mapped registers
    regs: RegisterWindow<M::Mapping>,
    /// Transmit queue with descriptors
    tx_queue: TxQueue<E1000TxQueueRegisters<M::Mapping>, M::Mapping>,
    /// The buffer holding the payload of outgoing frames
    tx_buffer: TransmitBuffer<M::Mapping>,
    config: E1000Config,
}

impl<M: MemorySubsystem> E1000Nic<M> {
    /// Maps the e1000's registers as described by `config` and brings up its transmit path.
    pub fn init(mem: &M, config: E1000Config) -> Result<E1000Nic<M>, E1000Error> {
        config.validate().map_err(|e| {
            error!("e1000::init(): {}", e);
            E1000Error::InvalidConfig(e)
        })?;
        let mem_base = PhysicalAddress::new(config.mmio_base).ok_or_else(|| {
            error!("e1000::init(): invalid MMIO base address {:#X}", config.mmio_base);
            E1000Error::InvalidConfig("MMIO base isn't a valid physical address")
        })?;

        let mapping = allocate_memory(mem, mem_base, config.mmio_size)?;
        let regs = RegisterWindow::new(mapping).map_err(E1000Error::Mapping)?;
        Self::configure(mem, mem_base, regs, config)
    }

    /// Brings up the transmit path of an e1000 whose registers are already mapped into `regs`.
    ///
    /// If an allocation fails, the transmit queue registers are left unprogrammed.
    pub fn configure(
        mem: &M,
        mem_base: PhysicalAddress,
        mut regs: RegisterWindow<M::Mapping>,
        config: E1000Config,
    ) -> Result<E1000Nic<M>, E1000Error> {
        config.validate().map_err(E1000Error::InvalidConfig)?;

        Self::reset(&mut regs);
        if let Some(poll_limit) = config.reset_poll_limit {
            Self::wait_for_reset(&regs, poll_limit)?;
        }
        Self::start_link(&mut regs);

        let tx_descs = allocate_tx_ring(mem, config.num_tx_desc)?;
        let tx_buffer = TransmitBuffer::new(mem, config.payload_len, PAGE_SIZE).map_err(|e| {
            error!("e1000::configure(): failed to allocate a {:#X}-byte transmit buffer: {}", config.payload_len, e);
            e
        })?;

        let mut tx_registers = E1000TxQueueRegisters(regs.share());
        program_tx_queue(&tx_descs, &mut tx_registers);
        Self::tx_init(&mut regs, &config);
        let tx_queue = TxQueue::new(0, tx_registers, tx_descs);

        info!("e1000: initialized at {:?} with {} transmit descriptors", mem_base, config.num_tx_desc);
        Ok(E1000Nic { mem_base, regs, tx_queue, tx_buffer, config })
    }

    /// Triggers a device reset.
    pub fn reset(regs: &mut RegisterWindow<M::Mapping>) {
        regs.update(REG_CTRL, |ctrl| ctrl | CtrlFlags::RST.bits());
        debug!("e1000::reset(): REG_CTRL: {:#X}", regs.read(REG_CTRL));
    }

    /// Polls CTRL until the device clears the reset bit, at most `poll_limit` times.
    pub fn wait_for_reset(regs: &RegisterWindow<M::Mapping>, poll_limit: usize) -> Result<(), E1000Error> {
        for _ in 0..poll_limit {
            if !CtrlFlags::from_bits_truncate(regs.read(REG_CTRL)).contains(CtrlFlags::RST) {
                return Ok(());
            }
            core::hint::spin_loop();
        }
        error!("e1000::wait_for_reset(): reset didn't complete after {} polls, REG_CTRL: {:#X}", poll_limit, regs.read(REG_CTRL));
        Err(E1000Error::Timeout)
    }

    /// Start up the network
    pub fn start_link(regs: &mut RegisterWindow<M::Mapping>) {
        let link = CtrlFlags::ASDE | CtrlFlags::SLU | CtrlFlags::FD;
        regs.update(REG_CTRL, |ctrl| ctrl | link.bits());
        debug!("e1000::start_link(): REG_CTRL: {:#X}", regs.read(REG_CTRL));
    }

    /// Enables the transmitter.
    fn tx_init(regs: &mut RegisterWindow<M::Mapping>, config: &E1000Config) {
        let tctl = TctlFlags::transmit_enable(config.collision_threshold, config.collision_distance);
        regs.update(REG_TCTRL, |val| val | tctl.bits());
        debug!("e1000::tx_init(): REG_TCTRL: {:#X}", regs.read(REG_TCTRL));
    }

    /// Submits one TSO frame made of a context descriptor and one data descriptor per fragment.
    /// Returns the new tail index.
    pub fn send_tso_frame(&mut self, context: &TsoContext, fragments: &[Fragment]) -> Result<u16, E1000Error> {
        self.tx_queue.send_tso_frame(context, fragments).map_err(|e| {
            error!("e1000::send_tso_frame(): {}", e);
            E1000Error::from(e)
        })
    }

    /// Waits for the device to consume every submitted descriptor.
    pub fn wait_for_tx_completion(&self, poll_limit: usize) -> Result<(), E1000Error> {
        Ok(self.tx_queue.wait_for_completion(poll_limit)?)
    }

    pub fn mem_base(&self) -> PhysicalAddress {
        self.mem_base
    }

    pub fn registers(&self) -> &RegisterWindow<M::Mapping> {
        &self.regs
    }

    pub fn tx_queue(&self) -> &TxQueue<E1000TxQueueRegisters<M::Mapping>, M::Mapping> {
        &self.tx_queue
    }

    pub fn tx_buffer(&self) -> &TransmitBuffer<M::Mapping> {
        &self.tx_buffer
    }

    pub fn tx_buffer_mut(&mut self) -> &mut TransmitBuffer<M::Mapping> {
        &mut self.tx_buffer
    }

    pub fn config(&self) -> &E1000Config {
        &self.config
    }
}


/// Everything created by [`init_module()`].
///
/// Dropping it unregisters the control file and releases the
/// descriptor ring, the transmit buffer and the register mapping.
pub struct E1000Module<M: MemorySubsystem> {
    pub control_file: ControlFile,
    pub nic: E1000Nic<M>,
}

impl<M: MemorySubsystem> Drop for E1000Module<M> {
    fn drop(&mut self) {
        info!("e1000: removing driver for the NIC at {:?}", self.nic.mem_base());
    }
}

/// Registers the driver's control file, brings up the NIC and sends the test frame.
pub fn init_module<M: MemorySubsystem>(mem: &M, config: E1000Config) -> Result<E1000Module<M>, E1000Error> {
    let control_file = ControlFile::register(DEVICE_NAME, MAJOR_NUM);
    let mut nic = E1000Nic::init(mem, config)?;
    nic.send_test_frame()?;
    if let Some(poll_limit) = config.tx_poll_limit {
        nic.wait_for_tx_completion(poll_limit)?;
    }
    Ok(E1000Module { control_file, nic })
}


#[cfg(test)]
mod test {
    use super::*;
    use intel_ethernet::descriptors::{DescriptorKind, TxDescriptor, DESC_CTX, REPORT_STATUS, TCP_IP, TSE};
    use kernel_config::nic::{E1000_MMIO_BASE, E1000_MMIO_SIZE};
    use memory::HeapMemory;

    fn reg_window(mem: &HeapMemory) -> RegisterWindow<memory::HeapMapping> {
        let mapping = mem.map_device_memory(PhysicalAddress::new_canonical(E1000_MMIO_BASE), E1000_MMIO_SIZE).unwrap();
        RegisterWindow::new(mapping).unwrap()
    }

    #[test]
    fn init_and_send_test_frame() {
        let mem = HeapMemory::new().with_phys_offset(0x1_0000_0000);
        let module = init_module(&mem, E1000Config::default()).unwrap();
        let nic = &module.nic;
        let regs = nic.registers();

        // the reset bit never self-clears in heap memory
        let ctrl = CtrlFlags::RST | CtrlFlags::ASDE | CtrlFlags::SLU | CtrlFlags::FD;
        assert_eq!(regs.read(REG_CTRL), ctrl.bits());
        assert_eq!(regs.read(REG_TCTRL), TctlFlags::transmit_enable(0x10, 0x40).bits());

        let ring_addr = nic.tx_queue().descriptors().phys_addr().value() as u64;
        assert_eq!(regs.read(REG_TXDESCLEN), 256 * 16);
        assert_eq!(regs.read(REG_TXDESCLO), ring_addr as u32);
        assert_eq!(regs.read(REG_TXDESCHI), (ring_addr >> 32) as u32);
        assert_eq!(regs.read(REG_TXDESCTAIL), 5);
        assert_eq!(regs.read(REG_TXDESCHEAD), 0);

        let descs = nic.tx_queue().descriptors();
        let kinds: [DescriptorKind; 5] = core::array::from_fn(|i| descs.read(i as u16).kind());
        assert_eq!(kinds, [DescriptorKind::Context, DescriptorKind::Data, DescriptorKind::Data, DescriptorKind::Data, DescriptorKind::Data]);

        match descs.read(0) {
            TxDescriptor::Context(ctx) => {
                assert_eq!(ctx.cmd_and_length.get(), TCP_IP | REPORT_STATUS | DESC_CTX | TSE | 0x4000);
                assert_eq!(ctx.tcp_seg_setup.get(), 0x3FA0 - 5);
                assert_eq!((ctx.ip_config.get(), ctx.tcp_config.get()), (0, 0));
            }
            other => panic!("slot 0 holds {:?}", other),
        }
        let buffer_addr = nic.tx_buffer().phys_addr().value() as u64;
        let mut total_len = 0;
        for i in 1..5 {
            match descs.read(i) {
                TxDescriptor::Data(data) => {
                    assert_eq!(data.buffer_addr.get(), buffer_addr);
                    assert_eq!(data.lower.get() & TSE, TSE);
                    assert_eq!(data.end_of_packet(), i == 4);
                    total_len += data.length();
                }
                other => panic!("slot {} holds {:?}", i, other),
            }
        }
        assert_eq!(total_len, 0x4000);

        for i in 0..5 {
            assert!(!descs.read(i).is_done_sentinel());
        }
        for i in 5..256 {
            assert!(descs.read(i).is_done_sentinel());
        }

        assert_eq!(nic.tx_buffer().len(), 0x4000);
        assert!(nic.tx_buffer().iter().all(|b| *b == b'A'));
        assert_eq!(module.control_file.name(), "my_e1000_driver_file");
        assert_eq!(module.control_file.major(), 100);
    }

    #[test]
    fn mapping_failure_stops_initialization() {
        let mem = HeapMemory::new().without_device_memory();
        let res = init_module(&mem, E1000Config::default());
        assert!(matches!(res, Err(E1000Error::Mapping(_))));
        assert_eq!(mem.device_mappings(), 0);
        assert_eq!(mem.dma_allocations(), 0);
    }

    #[test]
    fn buffer_allocation_failure_leaves_ring_unprogrammed() {
        let mem = HeapMemory::new().with_allocation_limit(1);
        let regs = reg_window(&mem);
        let probe = regs.share();

        let res = E1000Nic::configure(&mem, PhysicalAddress::new_canonical(E1000_MMIO_BASE), regs, E1000Config::default());
        assert!(matches!(res, Err(E1000Error::Allocation(_))));
        assert_eq!(mem.dma_allocations(), 1);

        let link = CtrlFlags::RST | CtrlFlags::ASDE | CtrlFlags::SLU | CtrlFlags::FD;
        assert_eq!(probe.read(REG_CTRL), link.bits());
        for reg in [REG_TXDESCLO, REG_TXDESCHI, REG_TXDESCLEN, REG_TXDESCHEAD, REG_TXDESCTAIL, REG_TCTRL] {
            assert_eq!(probe.read(reg), 0);
        }
    }

    #[test]
    fn ring_allocation_failure_is_reported() {
        let mem = HeapMemory::new().with_allocation_limit(0);
        let res = E1000Nic::init(&mem, E1000Config::default());
        assert!(matches!(res, Err(E1000Error::Allocation(_))));
    }

    #[test]
    fn reset_wait() {
        let mem = HeapMemory::new();
        let config = E1000Config { reset_poll_limit: Some(10), ..Default::default() };
        assert_eq!(E1000Nic::init(&mem, config).err(), Some(E1000Error::Timeout));

        let mut regs = reg_window(&mem);
        E1000Nic::<HeapMemory>::reset(&mut regs);
        assert_eq!(E1000Nic::<HeapMemory>::wait_for_reset(&regs, 10), Err(E1000Error::Timeout));
        // simulate the device finishing its reset
        regs.update(REG_CTRL, |ctrl| ctrl & !CtrlFlags::RST.bits());
        assert_eq!(E1000Nic::<HeapMemory>::wait_for_reset(&regs, 1), Ok(()));
    }

    #[test]
    fn tx_completion_times_out_without_hardware() {
        let mem = HeapMemory::new();
        let config = E1000Config { tx_poll_limit: Some(3), ..Default::default() };
        let res = init_module(&mem, config);
        assert_eq!(res.err(), Some(E1000Error::Tx(TxError::Timeout)));
    }

    #[test]
    fn invalid_config_is_rejected_before_mapping() {
        let mem = HeapMemory::new();
        let config = E1000Config { num_tx_desc: 3, ..Default::default() };
        assert!(matches!(E1000Nic::init(&mem, config), Err(E1000Error::InvalidConfig(_))));
        assert_eq!(mem.device_mappings(), 0);
    }

    #[test]
    fn second_frame_follows_the_first() {
        let mem = HeapMemory::new();
        let mut nic = E1000Nic::init(&mem, E1000Config::default()).unwrap();
        assert_eq!(nic.send_test_frame(), Ok(5));
        assert_eq!(nic.send_test_frame(), Ok(10));
        assert_eq!(nic.registers().read(REG_TXDESCTAIL), 10);
        assert_eq!(nic.tx_queue().free_descriptors(), 256 - 10 - 1);
    }
}

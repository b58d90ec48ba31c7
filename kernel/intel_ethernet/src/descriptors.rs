//! Transmit descriptors used by the e1000 family for TCP segmentation offload (TSO).
//!
//! Every transmit descriptor occupies 16 bytes in the descriptor ring and has one of two layouts:
//! * a [`ContextDescriptor`], which sets up the offload parameters for the data that follows, and
//! * a [`DataDescriptor`], which points to one fragment of the packet payload.
//!
//! Both layouts keep their command/length word at byte offset 8.
//! The descriptor extension bit (`DEXT`) and the descriptor type field (`DTYP`) in that word
//! tell the hardware (and [`DescriptorSlot::decode()`]) which layout a slot holds.
//!
//! All fields are stored little-endian, as the hardware reads them,
//! independently of the host's byte order.

use core::fmt;
use bit_field::BitField;
use zerocopy::{
    AsBytes, FromBytes, FromZeroes,
    byteorder::{LittleEndian, U32, U64},
};
use memory::PhysicalAddress;
use kernel_config::nic::DESC_SIZE;


/* Bits of the command/length word (byte offset 8) */
/// The length field occupies bits `[19:0]`.
pub const TX_LENGTH_BITS: core::ops::Range<usize> = 0..20;
/// The descriptor type field occupies bits `[23:20]`.
pub const TX_DTYP_BITS: core::ops::Range<usize> = 20..24;
/// The largest length that fits in the length field.
pub const TX_MAX_LENGTH: u32 = (1 << 20) - 1;

/// Descriptor type value for a context descriptor.
pub const TX_DTYP_CONTEXT: u32 = 0x0;
/// Descriptor type value for a data descriptor.
pub const TX_DTYP_DATA: u32 = 0x1;

/// Data command: End of Packet
pub const EOP: u32 = 1 << 24;
/// Context command (TUCMD): the packet is TCP
pub const TUCMD_TCP: u32 = 1 << 24;
/// Context command (TUCMD): the packet is IPv4
pub const TUCMD_IP: u32 = 1 << 25;
/// Context command (TUCMD): TCP/IPv4 offload
pub const TCP_IP: u32 = TUCMD_TCP | TUCMD_IP;
/// Command: TCP Segmentation Enable
pub const TSE: u32 = 1 << 26;
/// Command: Report Status
pub const REPORT_STATUS: u32 = 1 << 27;
/// Command: Descriptor Extension, required for both context and data descriptors
pub const DEXT: u32 = 1 << 29;

/// Marks a context descriptor.
pub const DESC_CTX: u32 = DEXT | (TX_DTYP_CONTEXT << 20);
/// Marks a data descriptor.
pub const DESC_DATA: u32 = DEXT | (TX_DTYP_DATA << 20);
/// The value written into the command/length word of every idle descriptor slot.
pub const DESC_DONE: u32 = 0x0000_0001;

/// Status (upper word of a data descriptor): Descriptor Done, written back by hardware
pub const TX_STATUS_DD: u32 = 1 << 0;


/// A TSO context descriptor.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct ContextDescriptor {
    /// IP checksum setup: IPCSS, IPCSO and IPCSE
    pub ip_config:      U32<LittleEndian>,  // 0x0
    /// TCP/UDP checksum setup: TUCSS, TUCSO and TUCSE
    pub tcp_config:     U32<LittleEndian>,  // 0x4
    /// Total payload length, descriptor type and TUCMD flags
    pub cmd_and_length: U32<LittleEndian>,  // 0x8
    /// Status, header length and maximum segment size
    pub tcp_seg_setup:  U32<LittleEndian>,  // 0xC
}

impl ContextDescriptor {
    pub fn new(ip_config: u32, tcp_config: u32, cmd_and_length: u32, tcp_seg_setup: u32) -> ContextDescriptor {
        ContextDescriptor {
            ip_config:      U32::new(ip_config),
            tcp_config:     U32::new(tcp_config),
            cmd_and_length: U32::new(cmd_and_length),
            tcp_seg_setup:  U32::new(tcp_seg_setup),
        }
    }

    /// The payload length encoded in the command/length word.
    pub fn payload_len(&self) -> u32 {
        self.cmd_and_length.get().get_bits(TX_LENGTH_BITS)
    }
}

impl fmt::Debug for ContextDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{ip_config: {:#X}, tcp_config: {:#X}, cmd_and_length: {:#X}, tcp_seg_setup: {:#X}}}",
            self.ip_config.get(), self.tcp_config.get(), self.cmd_and_length.get(), self.tcp_seg_setup.get())
    }
}


/// A TSO data descriptor, which points to one fragment of the payload.
#[derive(FromZeroes, FromBytes, AsBytes, Clone, Copy, PartialEq, Eq)]
#[repr(C)]
pub struct DataDescriptor {
    /// The physical address of the fragment
    pub buffer_addr:    U64<LittleEndian>,  // 0x0
    /// Fragment length, descriptor type and DCMD flags
    pub lower:          U32<LittleEndian>,  // 0x8
    /// Status written back by the hardware, plus the POPTS and VLAN fields
    pub upper:          U32<LittleEndian>,  // 0xC
}

impl DataDescriptor {
    pub fn new(buffer_addr: PhysicalAddress, lower: u32, upper: u32) -> DataDescriptor {
        DataDescriptor {
            buffer_addr: U64::new(buffer_addr.value() as u64),
            lower:       U32::new(lower),
            upper:       U32::new(upper),
        }
    }

    /// Creates a data descriptor for a payload fragment of `length` bytes at `buffer_addr`.
    ///
    /// Status reporting is always requested; `tse` and `eop` select the TSE and EOP command bits.
    pub fn fragment(buffer_addr: PhysicalAddress, length: u32, tse: bool, eop: bool) -> Result<DataDescriptor, &'static str> {
        if length > TX_MAX_LENGTH {
            error!("DataDescriptor::fragment(): length {:#X} exceeds the maximum of {:#X}", length, TX_MAX_LENGTH);
            return Err("fragment length doesn't fit in a data descriptor");
        }
        let mut lower = REPORT_STATUS | DESC_DATA | length;
        if tse {
            lower |= TSE;
        }
        if eop {
            lower |= EOP;
        }
        Ok(DataDescriptor::new(buffer_addr, lower, 0))
    }

    /// The fragment length encoded in the lower word.
    pub fn length(&self) -> u32 {
        self.lower.get().get_bits(TX_LENGTH_BITS)
    }

    /// Returns true if this descriptor ends the packet.
    pub fn end_of_packet(&self) -> bool {
        self.lower.get() & EOP == EOP
    }

    /// Returns true if the hardware has written back the Descriptor Done status.
    pub fn descriptor_done(&self) -> bool {
        self.upper.get() & TX_STATUS_DD == TX_STATUS_DD
    }
}

impl fmt::Debug for DataDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{{addr: {:#X}, lower: {:#X}, upper: {:#X}}}",
            self.buffer_addr.get(), self.lower.get(), self.upper.get())
    }
}

const_assert_eq!(core::mem::size_of::<ContextDescriptor>(), DESC_SIZE);
const_assert_eq!(core::mem::size_of::<DataDescriptor>(), DESC_SIZE);


/// The offload parameters carried by a TSO context descriptor.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TsoContext {
    pub ip_config: u32,
    pub tcp_config: u32,
    /// Total length of the payload that the hardware will segment.
    pub payload_len: u32,
    /// The raw value of the segmentation setup word (status, header length and MSS).
    pub tcp_seg_setup: u32,
    /// Whether to request TCP/IPv4 checksum offload.
    pub tcp_ip: bool,
}

impl TsoContext {
    /// Encodes these parameters as a context descriptor.
    pub fn to_descriptor(&self) -> Result<ContextDescriptor, &'static str> {
        if self.payload_len > TX_MAX_LENGTH {
            error!("TsoContext::to_descriptor(): payload length {:#X} exceeds the maximum of {:#X}", self.payload_len, TX_MAX_LENGTH);
            return Err("payload length doesn't fit in a context descriptor");
        }
        let mut cmd_and_length = REPORT_STATUS | DESC_CTX | TSE | self.payload_len;
        if self.tcp_ip {
            cmd_and_length |= TCP_IP;
        }
        Ok(ContextDescriptor::new(self.ip_config, self.tcp_config, cmd_and_length, self.tcp_seg_setup))
    }
}


/// The interpretation of one descriptor slot.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum TxDescriptor {
    Context(ContextDescriptor),
    Data(DataDescriptor),
    /// A slot that holds neither layout, e.g., one still marked with [`DESC_DONE`].
    Idle { cmd_and_length: u32 },
}

/// The kind of a [`TxDescriptor`], without its contents.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum DescriptorKind {
    Context,
    Data,
    Idle,
}

impl TxDescriptor {
    pub fn kind(&self) -> DescriptorKind {
        match self {
            TxDescriptor::Context(_) => DescriptorKind::Context,
            TxDescriptor::Data(_)    => DescriptorKind::Data,
            TxDescriptor::Idle { .. } => DescriptorKind::Idle,
        }
    }

    /// The word at byte offset 8, which holds the command and length bits in both layouts.
    pub fn cmd_and_length(&self) -> u32 {
        match self {
            TxDescriptor::Context(c) => c.cmd_and_length.get(),
            TxDescriptor::Data(d)    => d.lower.get(),
            TxDescriptor::Idle { cmd_and_length } => *cmd_and_length,
        }
    }

    /// Returns true if this slot still carries the idle [`DESC_DONE`] sentinel.
    pub fn is_done_sentinel(&self) -> bool {
        self.cmd_and_length() == DESC_DONE
    }

    /// Returns true if this is a data descriptor with the EOP bit set.
    pub fn end_of_packet(&self) -> bool {
        matches!(self, TxDescriptor::Data(d) if d.end_of_packet())
    }

    /// Encodes this descriptor into its 16-byte hardware representation.
    pub fn encode(&self) -> DescriptorSlot {
        let mut slot = DescriptorSlot::zeroed();
        match self {
            TxDescriptor::Context(c) => slot.bytes.copy_from_slice(c.as_bytes()),
            TxDescriptor::Data(d)    => slot.bytes.copy_from_slice(d.as_bytes()),
            TxDescriptor::Idle { cmd_and_length } => slot.bytes[8..12].copy_from_slice(&cmd_and_length.to_le_bytes()),
        }
        slot
    }
}


/// The raw 16 bytes of one entry in a transmit descriptor ring.
#[derive(Clone, Copy, PartialEq, Eq)]
#[repr(C, align(16))]
pub struct DescriptorSlot {
    pub bytes: [u8; DESC_SIZE],
}

const_assert_eq!(core::mem::size_of::<DescriptorSlot>(), DESC_SIZE);
const_assert_eq!(core::mem::align_of::<DescriptorSlot>(), DESC_SIZE);

impl DescriptorSlot {
    pub const fn zeroed() -> DescriptorSlot {
        DescriptorSlot { bytes: [0; DESC_SIZE] }
    }

    /// A slot whose command/length word holds the [`DESC_DONE`] sentinel and is otherwise zero.
    pub fn done() -> DescriptorSlot {
        TxDescriptor::Idle { cmd_and_length: DESC_DONE }.encode()
    }

    /// The word at byte offset 8.
    pub fn cmd_and_length(&self) -> u32 {
        let mut word = [0u8; 4];
        word.copy_from_slice(&self.bytes[8..12]);
        u32::from_le_bytes(word)
    }

    /// Interprets this slot based on its `DEXT` and `DTYP` bits.
    pub fn decode(&self) -> TxDescriptor {
        let cmd_and_length = self.cmd_and_length();
        let idle = TxDescriptor::Idle { cmd_and_length };
        if cmd_and_length & DEXT != DEXT {
            return idle;
        }
        match cmd_and_length.get_bits(TX_DTYP_BITS) {
            TX_DTYP_CONTEXT => ContextDescriptor::read_from(&self.bytes[..]).map_or(idle, TxDescriptor::Context),
            TX_DTYP_DATA    => DataDescriptor::read_from(&self.bytes[..]).map_or(idle, TxDescriptor::Data),
            _ => idle,
        }
    }
}

impl fmt::Debug for DescriptorSlot {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{:?}", self.decode())
    }
}

//! Access to the e1000's memory-mapped registers, and the values written to them.
//!
//! The whole 128 KiB register region is mapped once into a [`RegisterWindow`].
//! Only the device control, transmit control and transmit queue registers are used,
//! so each register is addressed by its byte offset into the window
//! rather than by overlaying a struct on the entire region.

use alloc::sync::Arc;
use volatile::Volatile;
use memory::MappedRegion;
use kernel_config::nic::E1000_MMIO_SIZE;


pub const REG_CTRL:                 u32 = 0x0000;
pub const REG_STATUS:               u32 = 0x0008;

pub const REG_TCTRL:                u32 = 0x0400;
pub const REG_TXDESCLO:             u32 = 0x3800;
pub const REG_TXDESCHI:             u32 = 0x3804;
pub const REG_TXDESCLEN:            u32 = 0x3808;
pub const REG_TXDESCHEAD:           u32 = 0x3810;
pub const REG_TXDESCTAIL:           u32 = 0x3818;

// every register we touch must lie within the mapped window
const_assert!((REG_TXDESCTAIL as usize) + 4 <= E1000_MMIO_SIZE);


bitflags! {
    /// Device Control Register (CTRL) bits
    pub struct CtrlFlags: u32 {
        /// Full-Duplex
        const FD    = 1 << 0;
        /// Auto-Speed Detection Enable
        const ASDE  = 1 << 5;
        /// Set Link Up
        const SLU   = 1 << 6;
        /// Device Reset, self-clearing
        const RST   = 1 << 26;
    }
}

bitflags! {
    /// Transmit Control Register (TCTL) bits and fields
    pub struct TctlFlags: u32 {
        /// Transmit Enable
        const EN    = 1 << 1;
        /// Pad Short Packets
        const PSP   = 1 << 3;
        /// Collision Threshold
        const CT    = 0xFF << 8;
        /// Collision Distance
        const COLD  = 0x3FF << 12;
        /// Re-transmit on Late Collision
        const RTLC  = 1 << 24;
    }
}

/// Shift applied to the collision threshold before masking it with [`TctlFlags::CT`].
pub const TCTL_CT_SHIFT:            u32 = 8;
/// Shift applied to the collision distance before masking it with [`TctlFlags::COLD`].
pub const TCTL_COLD_SHIFT:          u32 = 12;

impl TctlFlags {
    /// The TCTL value that enables transmission with the given collision parameters.
    ///
    /// Each parameter is shifted to its field's position and then masked,
    /// so any bits that overflow the field are dropped.
    pub fn transmit_enable(collision_threshold: u32, collision_distance: u32) -> TctlFlags {
        let fields = ((collision_distance << TCTL_COLD_SHIFT) & TctlFlags::COLD.bits())
            | ((collision_threshold << TCTL_CT_SHIFT) & TctlFlags::CT.bits());
        TctlFlags::EN | TctlFlags::PSP | TctlFlags::RTLC | TctlFlags::from_bits_truncate(fields)
    }
}


/// The e1000's mapped register region, accessed as 32-bit volatile cells at fixed offsets.
///
/// The underlying mapping is reference-counted so that a transmit queue
/// can hold its own handle to the queue registers via [`RegisterWindow::share()`],
/// while the NIC keeps using the control registers.
/// The mapping is released once the last handle is dropped.
pub struct RegisterWindow<M: MappedRegion> {
    mapping: Arc<M>,
}

impl<M: MappedRegion> RegisterWindow<M> {
    /// Wraps a mapping of the device's registers.
    ///
    /// Returns an error if the mapping is smaller than the e1000's register region
    /// or isn't 4-byte aligned.
    pub fn new(mapping: M) -> Result<RegisterWindow<M>, &'static str> {
        if mapping.size_in_bytes() < E1000_MMIO_SIZE {
            error!("RegisterWindow::new(): mapping of {:#X} bytes is smaller than the register region ({:#X} bytes)",
                mapping.size_in_bytes(), E1000_MMIO_SIZE);
            return Err("register mapping is too small");
        }
        if mapping.start_address().value() % core::mem::align_of::<u32>() != 0 {
            return Err("register mapping isn't 4-byte aligned");
        }
        Ok(RegisterWindow { mapping: Arc::new(mapping) })
    }

    /// Returns another handle to the same registers.
    pub fn share(&self) -> RegisterWindow<M> {
        RegisterWindow { mapping: Arc::clone(&self.mapping) }
    }

    pub fn size_in_bytes(&self) -> usize {
        self.mapping.size_in_bytes()
    }

    fn register(&self, offset: u32) -> *mut Volatile<u32> {
        let offset = offset as usize;
        assert!(offset % 4 == 0 && offset + 4 <= E1000_MMIO_SIZE, "e1000 register offset {:#X} out of bounds", offset);
        (self.mapping.start_address().value() + offset) as *mut Volatile<u32>
    }

    /// Reads the 32-bit register at byte `offset`.
    pub fn read(&self, offset: u32) -> u32 {
        // SAFETY: `register()` checks that the cell is aligned and within the mapping, which lives as long as `self`.
        unsafe { (*self.register(offset)).read() }
    }

    /// Writes `value` to the 32-bit register at byte `offset`.
    pub fn write(&mut self, offset: u32, value: u32) {
        // SAFETY: as in `read()`.
        unsafe { (*self.register(offset)).write(value) }
    }

    /// Read-modify-write of the register at byte `offset`.
    pub fn update<F: FnOnce(u32) -> u32>(&mut self, offset: u32, f: F) {
        let value = self.read(offset);
        self.write(offset, f(value));
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn tctl_fields_are_masked_into_place() {
        let tctl = TctlFlags::transmit_enable(0x10, 0x40);
        assert_eq!(tctl.bits(), (1 << 1) | (1 << 3) | (0x10 << 8) | (0x40 << 12) | (1 << 24));
        assert!(tctl.contains(TctlFlags::EN | TctlFlags::PSP | TctlFlags::RTLC));

        // values wider than their field are truncated
        let tctl = TctlFlags::transmit_enable(0x1FF, 0);
        assert_eq!(tctl.bits() & TctlFlags::CT.bits(), 0xFF << 8);
    }

    #[test]
    fn ctrl_bits() {
        assert_eq!(CtrlFlags::FD.bits(), 0x1);
        assert_eq!(CtrlFlags::ASDE.bits(), 0x20);
        assert_eq!(CtrlFlags::SLU.bits(), 0x40);
        assert_eq!(CtrlFlags::RST.bits(), 0x0400_0000);
    }
}

//! Constants describing the e1000 device and its transmit ring.

/// Physical base address of the e1000 register window.
pub const E1000_MMIO_BASE: usize = 0xF020_0000;
/// Size in bytes of the e1000 register window (128 KiB).
pub const E1000_MMIO_SIZE: usize = 0x20000;

/// Number of descriptors in the transmit ring.
pub const NB_MAX_DESC: u16 = 256;
/// Size in bytes of a single transmit descriptor.
pub const DESC_SIZE: usize = 16;
/// Transmit descriptor rings must be aligned to this many bytes.
pub const DESC_RING_ALIGNMENT: usize = 128;

/// Logical length of the payload sent in the test frame.
pub const PAYLOAD_LEN: usize = 0x4000;
/// The largest frame the device will accept for transmission.
pub const E1K_MAX_TX_PKT_SIZE: u32 = 0x3FA0;

/// Name of the control file used to gate access to the driver.
pub const DEVICE_NAME: &str = "my_e1000_driver_file";
/// Major number under which the control file is registered.
pub const MAJOR_NUM: u32 = 100;
/// Suggested name of the device node users create for the control file.
pub const DEVICE_FILE_NAME: &str = "char_dev";

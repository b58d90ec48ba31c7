//! Runtime parameters for bringing up an e1000 NIC.

use kernel_config::nic::{E1000_MMIO_BASE, E1000_MMIO_SIZE, E1K_MAX_TX_PKT_SIZE, NB_MAX_DESC, PAYLOAD_LEN};
use intel_ethernet::descriptors::TX_MAX_LENGTH;

/// The TDLEN register must be a multiple of 128 bytes, i.e., 8 descriptors.
const TX_DESC_COUNT_GRANULARITY: u16 = 8;

/// Parameters used by [`E1000Nic::init()`](crate::E1000Nic::init).
/// The `Default` values match the device's fixed memory layout in `kernel_config`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct E1000Config {
    /// Physical base address of the register region
    pub mmio_base: usize,
    /// Size in bytes of the register region
    pub mmio_size: usize,
    /// Number of descriptors in the transmit ring
    pub num_tx_desc: u16,
    /// Logical length of the transmit buffer, which is the payload of the test frame
    pub payload_len: usize,
    /// The largest frame the device may put on the wire.
    pub max_tx_pkt_size: u32,
    /// Value of the TCTL collision threshold field
    pub collision_threshold: u32,
    /// Value of the TCTL collision distance field
    pub collision_distance: u32,
    /// If set, poll CTRL at most this many times for the reset bit to clear.
    pub reset_poll_limit: Option<usize>,
    /// If set, poll TDH at most this many times after submitting a frame.
    pub tx_poll_limit: Option<usize>,
}

impl Default for E1000Config {
    fn default() -> Self {
        E1000Config {
            mmio_base: E1000_MMIO_BASE,
            mmio_size: E1000_MMIO_SIZE,
            num_tx_desc: NB_MAX_DESC,
            payload_len: PAYLOAD_LEN,
            max_tx_pkt_size: E1K_MAX_TX_PKT_SIZE,
            collision_threshold: 0x10,
            collision_distance: 0x40,
            reset_poll_limit: None,
            tx_poll_limit: None,
        }
    }
}

impl E1000Config {
    /// Checks that these parameters describe a transmit queue the device can use.
    pub fn validate(&self) -> Result<(), &'static str> {
        if self.num_tx_desc < TX_DESC_COUNT_GRANULARITY || self.num_tx_desc % TX_DESC_COUNT_GRANULARITY != 0 {
            return Err("the number of transmit descriptors must be a non-zero multiple of 8");
        }
        if self.mmio_size < E1000_MMIO_SIZE {
            return Err("the register region is smaller than 128 KiB");
        }
        if self.payload_len == 0 || self.payload_len > TX_MAX_LENGTH as usize {
            return Err("the payload length doesn't fit in a context descriptor");
        }
        // the test frame's segment size is `max_tx_pkt_size - 5`
        if self.max_tx_pkt_size < 5 {
            return Err("the maximum packet size is too small");
        }
        Ok(())
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn default_is_valid() {
        let config = E1000Config::default();
        assert_eq!(config.validate(), Ok(()));
        assert_eq!(config.num_tx_desc, 256);
        assert_eq!(config.payload_len, 0x4000);
        assert_eq!(config.mmio_base, 0xF020_0000);
    }

    #[test]
    fn rejects_bad_parameters() {
        let default = E1000Config::default();
        assert!(E1000Config { num_tx_desc: 0, ..default }.validate().is_err());
        assert!(E1000Config { num_tx_desc: 12, ..default }.validate().is_err());
        assert!(E1000Config { num_tx_desc: 8, ..default }.validate().is_ok());
        assert!(E1000Config { mmio_size: 0x1000, ..default }.validate().is_err());
        assert!(E1000Config { payload_len: 1 << 20, ..default }.validate().is_err());
        assert!(E1000Config { payload_len: 0, ..default }.validate().is_err());
        assert!(E1000Config { max_tx_pkt_size: 4, ..default }.validate().is_err());
    }
}

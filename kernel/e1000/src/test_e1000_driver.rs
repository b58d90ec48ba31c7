//! Sends a fixed TSO frame: one context descriptor followed by four data descriptors,
//! all of which point at the NIC's transmit buffer filled with `'A'`.

use memory::MemorySubsystem;
use intel_ethernet::descriptors::TsoContext;
use nic_queues::{Fragment, TxError};
use crate::{E1000Error, E1000Nic};

/// The number of data descriptors in the test frame.
pub const TEST_FRAME_FRAGMENTS: usize = 4;

/// Splits `payload_len` across the test frame's data descriptors.
/// The first three get a quarter each and the last one gets the remainder,
/// so the lengths always add up to `payload_len`.
pub fn test_frame_fragment_lengths(payload_len: u32) -> [u32; TEST_FRAME_FRAGMENTS] {
    let quarter = payload_len / TEST_FRAME_FRAGMENTS as u32;
    [quarter, quarter, quarter, payload_len - 3 * quarter]
}

impl<M: MemorySubsystem> E1000Nic<M> {
    /// Fills the transmit buffer with `'A'` and submits it as one TSO frame.
    ///
    /// Every data descriptor points at the start of the buffer.
    /// Returns the new tail index.
    pub fn send_test_frame(&mut self) -> Result<u16, E1000Error> {
        self.tx_buffer.fill(b'A');
        let buffer_addr = self.tx_buffer.phys_addr();
        let payload_len = u32::try_from(self.tx_buffer.length()).map_err(|_| TxError::LengthTooLong)?;

        let context = TsoContext {
            ip_config: 0,
            tcp_config: 0,
            payload_len,
            tcp_seg_setup: self.config.max_tx_pkt_size.saturating_sub(5),
            tcp_ip: true,
        };
        let fragments = test_frame_fragment_lengths(payload_len)
            .map(|length| Fragment { phys_addr: buffer_addr, length, tse: true });

        let new_tail = self.send_tso_frame(&context, &fragments)?;
        info!("e1000::send_test_frame(): sent {:#X} bytes from {:?}, TDT is now {}", payload_len, buffer_addr, new_tail);
        Ok(new_tail)
    }
}


#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn fragment_lengths_cover_payload() {
        assert_eq!(test_frame_fragment_lengths(0x4000), [0x1000; 4]);
        assert_eq!(test_frame_fragment_lengths(10), [2, 2, 2, 4]);
        assert_eq!(test_frame_fragment_lengths(3), [0, 0, 0, 3]);
        for len in [1u32, 7, 0x3FA0, 0xFFFFF] {
            assert_eq!(test_frame_fragment_lengths(len).iter().sum::<u32>(), len);
        }
    }
}

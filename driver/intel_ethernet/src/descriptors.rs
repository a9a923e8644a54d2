//! The advanced receive and transmit descriptors of the 82599 family.

use bit_field::BitField;
use volatile::Volatile;

// Receive write-back status bits (extended status field).
/// Rx Status: Descriptor Done
pub const RX_STATUS_DD:                 u64 = 1 << 0;
/// Rx Status: End of Packet
pub const RX_STATUS_EOP:                u64 = 1 << 1;

// Transmit descriptor command and type bits (cmd_type_len field).
/// Tx Command: End of Packet
pub const TX_CMD_EOP:                   u32 = 1 << 24;
/// Tx Command: Insert FCS
pub const TX_CMD_IFCS:                  u32 = 1 << 25;
/// Tx Command: Report Status
pub const TX_CMD_RS:                    u32 = 1 << 27;
/// Tx Command: Descriptor Extension, always set for advanced descriptors
pub const TX_CMD_DEXT:                  u32 = 1 << 29;
/// Tx descriptor type: advanced data descriptor
pub const TX_DTYP_DATA:                 u32 = 0x3 << 20;
/// Tx write-back status: Descriptor Done
pub const TX_STATUS_DD:                 u32 = 1 << 0;
/// Shift of the payload length inside the Tx write-back field
pub const TX_PAYLEN_SHIFT:              u32 = 14;

/// The minimum a receive descriptor must offer so a queue can hand finished
/// packets to the driver and recycle the slot with a fresh buffer.
pub trait RxDescriptor {
    /// Points the descriptor at a fresh receive buffer and clears the
    /// write-back state, making the slot available to the hardware.
    fn refill(&mut self, packet_buffer_address: usize);

    /// Whether the hardware has written a packet into this slot.
    fn descriptor_done(&self) -> bool;

    /// Whether this slot holds the last (and, in one-buffer mode, only)
    /// piece of a frame.
    fn end_of_packet(&self) -> bool;

    /// Length in bytes of the received packet.
    fn length(&self) -> usize;
}

/// The minimum a transmit descriptor must offer so a queue can enqueue
/// packets and detect completed sends while cleaning.
pub trait TxDescriptor {
    /// Fills the descriptor for a single-buffer send of `len` bytes at
    /// `packet_buffer_address`.
    fn send(&mut self, packet_buffer_address: usize, len: usize);

    /// Whether the hardware has reported this send complete.
    fn descriptor_done(&self) -> bool;
}

/// Advanced receive descriptor, one-buffer mode.
///
/// In read format the first quadword is the packet buffer address and the
/// second the (unused) header buffer address. After write-back the first
/// quadword holds RSS/packet-type data and the second holds extended status,
/// errors, length and VLAN.
#[repr(C)]
pub struct AdvancedRxDescriptor {
    pub packet_buffer_address:  Volatile<u64>,
    pub header_buffer_address:  Volatile<u64>,
}

const _: () = assert!(core::mem::size_of::<AdvancedRxDescriptor>() == 16);

impl RxDescriptor for AdvancedRxDescriptor {
    fn refill(&mut self, packet_buffer_address: usize) {
        self.packet_buffer_address.write(packet_buffer_address as u64);
        // header splitting is not used on the 82599; zeroing also clears
        // the write-back status of the previous packet
        self.header_buffer_address.write(0);
    }

    fn descriptor_done(&self) -> bool {
        self.ext_status() & RX_STATUS_DD != 0
    }

    fn end_of_packet(&self) -> bool {
        self.ext_status() & RX_STATUS_EOP != 0
    }

    fn length(&self) -> usize {
        self.header_buffer_address.read().get_bits(32..48) as usize
    }
}

impl AdvancedRxDescriptor {
    /// Extended status field of the write-back format.
    pub fn ext_status(&self) -> u64 {
        self.header_buffer_address.read().get_bits(0..20)
    }

    /// Extended error field of the write-back format.
    pub fn ext_error(&self) -> u64 {
        self.header_buffer_address.read().get_bits(20..32)
    }

    /// VLAN tag of the write-back format, valid when stripping is enabled.
    pub fn vlan_tag(&self) -> u64 {
        self.header_buffer_address.read().get_bits(48..64)
    }
}

/// Advanced transmit data descriptor.
///
/// The third dword carries command, type and buffer length; the fourth is
/// written by the driver with the payload-length hint and overwritten by the
/// hardware with the done status.
#[repr(C)]
pub struct AdvancedTxDescriptor {
    pub packet_buffer_address:  Volatile<u64>,
    pub cmd_type_len:           Volatile<u32>,
    pub paylen_status:          Volatile<u32>,
}

const _: () = assert!(core::mem::size_of::<AdvancedTxDescriptor>() == 16);

impl TxDescriptor for AdvancedTxDescriptor {
    fn send(&mut self, packet_buffer_address: usize, len: usize) {
        self.packet_buffer_address.write(packet_buffer_address as u64);
        self.cmd_type_len
            .write(TX_CMD_EOP | TX_CMD_IFCS | TX_CMD_RS | TX_CMD_DEXT | TX_DTYP_DATA | len as u32);
        self.paylen_status.write((len as u32) << TX_PAYLEN_SHIFT);
    }

    fn descriptor_done(&self) -> bool {
        self.paylen_status.read() & TX_STATUS_DD != 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn zeroed_rx() -> AdvancedRxDescriptor {
        AdvancedRxDescriptor {
            packet_buffer_address: Volatile::new(0),
            header_buffer_address: Volatile::new(0),
        }
    }

    #[test]
    fn rx_refill_clears_writeback() {
        let mut desc = zeroed_rx();
        // simulate a completed packet: DD|EOP and a length of 60
        desc.header_buffer_address.write(RX_STATUS_DD | RX_STATUS_EOP | (60 << 32));
        assert!(desc.descriptor_done());
        assert!(desc.end_of_packet());
        assert_eq!(desc.length(), 60);

        desc.refill(0xDEAD_B000);
        assert_eq!(desc.packet_buffer_address.read(), 0xDEAD_B000);
        assert!(!desc.descriptor_done());
    }

    #[test]
    fn rx_length_uses_all_sixteen_bits() {
        let mut desc = zeroed_rx();
        desc.header_buffer_address.write(RX_STATUS_DD | (0x8001u64 << 32));
        assert_eq!(desc.length(), 0x8001);
    }

    #[test]
    fn tx_send_encodes_command_and_length() {
        let mut desc = AdvancedTxDescriptor {
            packet_buffer_address: Volatile::new(0),
            cmd_type_len: Volatile::new(0),
            paylen_status: Volatile::new(0),
        };
        desc.send(0x1000, 60);
        assert_eq!(desc.packet_buffer_address.read(), 0x1000);
        let ctl = desc.cmd_type_len.read();
        assert_eq!(ctl & 0xFFFF, 60);
        assert_ne!(ctl & TX_CMD_EOP, 0);
        assert_ne!(ctl & TX_CMD_RS, 0);
        assert_ne!(ctl & TX_CMD_DEXT, 0);
        assert_eq!(ctl & TX_DTYP_DATA, TX_DTYP_DATA);
        assert_eq!(desc.paylen_status.read(), 60 << TX_PAYLEN_SHIFT);
        assert!(!desc.descriptor_done());

        // hardware write-back sets DD in the status dword
        desc.paylen_status.write(TX_STATUS_DD);
        assert!(desc.descriptor_done());
    }
}

//! Tunnel Device Module
//!
//! The virtual network interface the bridge reads IPv6 packets from and
//! writes them back to.

pub mod linux;
pub mod memory;

pub use linux::LinuxTun;
pub use memory::{MemoryTun, MemoryTunHandle};

use async_trait::async_trait;

use crate::error::Result;

/// Headroom kept in front of every packet in bridge buffers
pub const TUN_OFFSET_BYTES: usize = 4;

/// Size of the bridge's packet buffers
pub const PACKET_BUFFER_SIZE: usize = 2048;

/// Largest MTU whose packets fit a bridge buffer after the headroom
pub const MAX_MTU: usize = PACKET_BUFFER_SIZE - TUN_OFFSET_BYTES;

/// Smallest MTU IPv6 allows
pub const MIN_MTU: usize = 1280;

/// Fixed IPv6 header length; anything shorter is not a packet
pub const IPV6_HEADER_LEN: usize = 40;

const SRC_RANGE: std::ops::Range<usize> = 8..24;
const DST_RANGE: std::ops::Range<usize> = 24..40;

/// Contract of the tunnel device consumed by the bridge.
///
/// Both operations take an `offset`: the packet starts at `buf[offset..]`
/// and the bytes before it are headroom the device may not touch.
#[async_trait]
pub trait TunDevice: Send + Sync {
    /// Read one packet into `buf[offset..]`, returning its length
    async fn read(&self, buf: &mut [u8], offset: usize) -> Result<usize>;

    /// Write the packet in `buf[offset..]`, returning the bytes written
    async fn write(&self, buf: &[u8], offset: usize) -> Result<usize>;

    /// Interface name
    fn name(&self) -> &str;

    /// Interface MTU
    fn mtu(&self) -> usize;
}

/// Source address bytes of an IPv6 packet
pub fn source_bytes(packet: &[u8]) -> Option<&[u8]> {
    packet.get(SRC_RANGE)
}

/// Destination address bytes of an IPv6 packet
pub fn destination_bytes(packet: &[u8]) -> Option<&[u8]> {
    packet.get(DST_RANGE)
}

#[cfg(test)]
pub(crate) mod testing {
    use super::IPV6_HEADER_LEN;
    use crate::address::Address;

    /// Minimal IPv6 packet from `src` to `dst` carrying `payload`
    pub fn ipv6_packet(src: &Address, dst: &Address, payload: &[u8]) -> Vec<u8> {
        let mut packet = vec![0u8; IPV6_HEADER_LEN];
        packet[0] = 0x60;
        packet[4..6].copy_from_slice(&(payload.len() as u16).to_be_bytes());
        packet[6] = 59; // no next header
        packet[7] = 64;
        packet[8..24].copy_from_slice(src.as_bytes());
        packet[24..40].copy_from_slice(dst.as_bytes());
        packet.extend_from_slice(payload);
        packet
    }
}

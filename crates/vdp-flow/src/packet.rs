//! Packet model and forwarding metadata
//!
//! Packets are owned values: the receive path hands one in, and exactly one
//! disposition consumes it (forward, trap, queue, or drop). The buffer
//! carries a movable data cursor so the datapath can step between the frame
//! start and the network header without copying.

use std::fmt;
use std::sync::Arc;

use bytes::BytesMut;

use crate::hooks::Nexthop;

/// Ethernet protocol number for IPv4
pub const ETH_PROTO_IP: u16 = 0x0800;

/// Per-packet dataplane flags
pub mod vp_flags {
    /// Packet is addressed to the router itself
    pub const TO_ME: u16 = 1 << 0;
    /// Flow classification already ran on this packet
    pub const FLOW_SET: u16 = 1 << 1;
    /// Somebody upstream requested a flow lookup
    pub const FLOW_GET: u16 = 1 << 2;
    /// Destination is broadcast/multicast
    pub const MULTICAST: u16 = 1 << 3;
}

/// An owned packet traversing the datapath
#[derive(Clone)]
pub struct Packet {
    data: BytesMut,
    head: usize,
    network_h: usize,
    /// Dataplane flags ([`vp_flags`])
    pub vp_flags: u16,
    /// Receiving interface has flow policy enabled
    pub policy_enabled: bool,
    /// Next hop already resolved for this packet, if any
    pub nexthop: Option<Arc<dyn Nexthop>>,
}

impl Packet {
    /// Wrap a received frame; the data cursor starts at the frame head
    pub fn new(data: BytesMut) -> Self {
        Self {
            data,
            head: 0,
            network_h: 0,
            vp_flags: 0,
            policy_enabled: false,
            nexthop: None,
        }
    }

    /// Record where the network header starts within the frame
    pub fn set_network_header(&mut self, offset: usize) {
        debug_assert!(offset <= self.data.len());
        self.network_h = offset;
    }

    /// Bytes from the data cursor to the end of the frame
    #[inline(always)]
    pub fn data(&self) -> &[u8] {
        &self.data[self.head..]
    }

    /// Mutable bytes from the data cursor
    #[inline(always)]
    pub fn data_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.head..]
    }

    /// Length from the data cursor to the end of the frame
    #[inline(always)]
    pub fn len(&self) -> usize {
        self.data.len() - self.head
    }

    /// True when no bytes remain at the cursor
    #[inline(always)]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Bytes from the network header to the end of the frame
    #[inline(always)]
    pub fn network_header(&self) -> &[u8] {
        &self.data[self.network_h..]
    }

    /// Mutable bytes from the network header
    #[inline(always)]
    pub fn network_header_mut(&mut self) -> &mut [u8] {
        &mut self.data[self.network_h..]
    }

    /// Move the data cursor to the network header
    pub fn set_data_to_network(&mut self) {
        self.head = self.network_h;
    }

    /// Move the data cursor back to the frame head
    pub fn reset(&mut self) {
        self.head = 0;
    }
}

impl fmt::Debug for Packet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Packet")
            .field("len", &self.len())
            .field("head", &self.head)
            .field("network_h", &self.network_h)
            .field("vp_flags", &self.vp_flags)
            .field("policy_enabled", &self.policy_enabled)
            .field("nexthop", &self.nexthop.is_some())
            .finish()
    }
}

/// Forwarding metadata threaded through classification and action
#[derive(Debug, Clone, Copy)]
pub struct ForwardingMd {
    /// Virtual index of the flow entry driving this packet, or -1
    pub flow_index: i32,
    /// ECMP next-hop index chosen by the entry, or -1
    pub ecmp_nh_index: i32,
    /// ECMP index of the reverse flow, or -1
    pub ecmp_src_nh_index: i32,
    /// Outer source address for tunneled arrivals
    pub outer_src_ip: u32,
}

impl Default for ForwardingMd {
    fn default() -> Self {
        Self {
            flow_index: -1,
            ecmp_nh_index: -1,
            ecmp_src_nh_index: -1,
            outer_src_ip: 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cursor_movement() {
        let mut data = BytesMut::from(&[0u8; 34][..]);
        data[14] = 0x45;
        let mut pkt = Packet::new(data);
        pkt.set_network_header(14);

        assert_eq!(pkt.len(), 34);
        assert_eq!(pkt.network_header().len(), 20);
        assert_eq!(pkt.network_header()[0], 0x45);

        pkt.set_data_to_network();
        assert_eq!(pkt.len(), 20);
        assert_eq!(pkt.data()[0], 0x45);

        pkt.reset();
        assert_eq!(pkt.len(), 34);
    }

    #[test]
    fn test_clone_is_deep() {
        let mut pkt = Packet::new(BytesMut::from(&[1u8, 2, 3, 4][..]));
        let clone = pkt.clone();
        pkt.data_mut()[0] = 9;
        assert_eq!(clone.data()[0], 1);
    }

    #[test]
    fn test_forwarding_md_defaults() {
        let fmd = ForwardingMd::default();
        assert_eq!(fmd.flow_index, -1);
        assert_eq!(fmd.ecmp_nh_index, -1);
        assert_eq!(fmd.ecmp_src_nh_index, -1);
        assert_eq!(fmd.outer_src_ip, 0);
    }
}

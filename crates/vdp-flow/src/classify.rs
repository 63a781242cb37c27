//! Packet classification
//!
//! The dataplane entry point: decide whether a packet bypasses the flow
//! table, is trapped straight to the agent, or goes through lookup; recover
//! transport ports for fragment continuations; and on a miss, claim a slot,
//! put it in Hold and gate against unresolved-hold buildup.

use crate::entry::FlowAction;
use crate::hooks::TrapReason;
use crate::ipv4;
use crate::key::FlowKey;
use crate::packet::{vp_flags, ForwardingMd, Packet};
use crate::router::Router;
use crate::stats::DropReason;
use crate::MAX_HOLD_COUNT;

/// UDP port a DHCP server listens on
const DHCP_SERVER_PORT: u16 = 67;
/// UDP port a DHCP client listens on
const DHCP_CLIENT_PORT: u16 = 68;

/// What classification decided for a packet
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FlowParse {
    /// Skip the flow table and forward
    Bypass,
    /// Hand to the agent
    Trap,
    /// Run the table lookup
    Lookup,
}

impl Router {
    /// Main packet entry point for IPv4 traffic
    ///
    /// `vrf` is the receiving routing domain, `proto` the Ethernet
    /// protocol. Exactly one disposition consumes the packet: bypass
    /// forward, trap, queue on a held flow, or drop with a recorded reason.
    pub fn inet_input(&self, vrf: u16, mut pkt: Packet, proto: u16, fmd: &mut ForwardingMd) {
        if pkt.vp_flags & vp_flags::TO_ME != 0 {
            self.hooks.ip.ip_rcv(pkt, fmd);
            return;
        }

        if !ipv4::header_ok(pkt.network_header()) {
            self.pfree(pkt, DropReason::InvalidProtocol);
            return;
        }
        let (transport_valid, frag_head, frag_tail, ip_id, ip_src, ip_dst) = {
            let header = pkt.network_header();
            (
                ipv4::transport_header_valid(header),
                ipv4::fragment_head(header),
                ipv4::fragment_tail(header),
                ipv4::id(header),
                ipv4::src(header),
                ipv4::dst(header),
            )
        };

        // Transport ports come from the header when it is present, from the
        // fragment cache for continuations, and matter only when the packet
        // is headed for a lookup.
        let ports = if transport_valid {
            let t = ipv4::transport(pkt.network_header());
            if t.len() >= 4 {
                Some((
                    u16::from_be_bytes([t[0], t[1]]),
                    u16::from_be_bytes([t[2], t[3]]),
                ))
            } else {
                Some((0, 0))
            }
        } else {
            let (parse, _) = self.flow_parse(None, &mut pkt);
            if parse == FlowParse::Lookup {
                let Some(frag) = self.hooks.fragments.get(vrf, ip_id, ip_src, ip_dst) else {
                    self.pfree(pkt, DropReason::Fragments);
                    return;
                };
                if frag_tail {
                    self.hooks.fragments.remove(vrf, ip_id, ip_src, ip_dst);
                }
                Some((frag.src_port, frag.dst_port))
            } else {
                None
            }
        };

        let Some((sport, dport)) = ports else {
            // not enough information for a key; forward as-is
            self.flow_forward(vrf, pkt, proto, fmd);
            return;
        };

        let key = FlowKey::from_packet(vrf, pkt.network_header(), sport, dport);
        let (parse, trap_reason) = self.flow_parse(Some(&key), &mut pkt);
        if parse == FlowParse::Lookup && frag_head {
            self.hooks
                .fragments
                .add(vrf, ip_id, ip_src, ip_dst, key.src_port, key.dst_port);
        }

        match parse {
            FlowParse::Bypass => self.flow_forward(vrf, pkt, proto, fmd),
            FlowParse::Trap => {
                let reason = trap_reason.unwrap_or(TrapReason::L3Protocols);
                self.hooks.agent.trap(pkt, vrf, reason, None);
            }
            FlowParse::Lookup => self.flow_lookup(&key, pkt, proto, fmd),
        }
    }

    /// Decide bypass / trap / lookup for a packet
    ///
    /// Without a key the answer can only come from packet state; with one,
    /// broadcast and multicast destinations force a bypass and DHCP traffic
    /// is trapped as link-layer service traffic.
    fn flow_parse(
        &self,
        key: Option<&FlowKey>,
        pkt: &mut Packet,
    ) -> (FlowParse, Option<TrapReason>) {
        let mut res = FlowParse::Bypass;
        let mut trap_reason = None;

        // one round of classification per packet
        if pkt.vp_flags & vp_flags::FLOW_SET != 0 {
            return (res, trap_reason);
        }

        if pkt.policy_enabled || pkt.vp_flags & vp_flags::FLOW_GET != 0 {
            res = FlowParse::Lookup;
        }

        if let Some(key) = key {
            if ipv4::is_bmcast(key.dst_ip) {
                res = FlowParse::Bypass;
                pkt.vp_flags |= vp_flags::MULTICAST | vp_flags::FLOW_SET;
            }

            if key.proto == ipv4::PROTO_UDP
                && (key.dst_port == DHCP_SERVER_PORT || key.dst_port == DHCP_CLIENT_PORT)
            {
                res = FlowParse::Trap;
                pkt.vp_flags |= vp_flags::FLOW_SET;
                trap_reason = Some(TrapReason::L3Protocols);
            }
        }

        (res, trap_reason)
    }

    /// Table lookup; a miss claims a slot and parks the flow in Hold
    fn flow_lookup(&self, key: &FlowKey, mut pkt: Packet, proto: u16, fmd: &mut ForwardingMd) {
        pkt.vp_flags |= vp_flags::FLOW_SET;

        if let Some((e, index)) = self.table().find(key) {
            self.do_flow_action(e, index, pkt, proto, fmd);
            return;
        }

        if self.info().unresolved_holds() >= MAX_HOLD_COUNT {
            self.pfree(pkt, DropReason::FlowUnusable);
            return;
        }

        let Some((e, index)) = self.table().find_free(key) else {
            self.pfree(pkt, DropReason::FlowTableFull);
            return;
        };

        e.set_action(FlowAction::Hold);
        self.info().note_hold(self.cpu());
        self.do_flow_action(e, index, pkt, proto, fmd);
    }
}

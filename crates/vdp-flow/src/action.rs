//! Per-flow action engine
//!
//! Every classified packet lands here: traffic accounting, the Hold
//! queue-and-trap path, source validation, mirroring, and the
//! drop/forward/NAT dispatch. NAT takes its replacement endpoints from the
//! reverse flow's key, so the agent installs rewrite identifiers once, on
//! the reverse entry, and flags the forward entry.

use crate::csum;
use crate::entry::{flags, FlowAction, FlowEntry};
use crate::hooks::{SourceVerdict, TrapReason};
use crate::ipv4;
use crate::packet::{ForwardingMd, Packet, ETH_PROTO_IP};
use crate::router::Router;
use crate::stats::DropReason;
use crate::{MAX_FLOW_QUEUE, MAX_MIRROR_INDICES};

impl Router {
    /// Account the packet against the entry and apply its action
    ///
    /// The single entry point after lookup; Hold engages the queue-and-trap
    /// path, everything else goes through [`flow_action`](Self::flow_action).
    pub(crate) fn do_flow_action(
        &self,
        e: &FlowEntry,
        index: u32,
        pkt: Packet,
        proto: u16,
        fmd: &mut ForwardingMd,
    ) {
        e.stats().update(pkt.len() as u32);

        if e.action_raw() == FlowAction::Hold as u8 {
            self.hold_packet(e, index, pkt, proto, fmd);
            return;
        }

        self.flow_action(e, index, pkt, proto, fmd);
    }

    /// Queue a packet on a held flow, trapping the first arrival
    ///
    /// The emptiness check and the append happen under the queue lock, so
    /// exactly one packet per hold cycle is trapped; arrivals beyond
    /// [`MAX_FLOW_QUEUE`] are dropped.
    fn hold_packet(
        &self,
        e: &FlowEntry,
        index: u32,
        pkt: Packet,
        proto: u16,
        fmd: &ForwardingMd,
    ) {
        let first = {
            let mut queue = e.hold_queue();
            if queue.len() >= MAX_FLOW_QUEUE {
                drop(queue);
                self.pfree(pkt, DropReason::QueueLimitExceeded);
                return;
            }
            let first = queue.is_empty();
            let trap_pkt = if first { Some(pkt.clone()) } else { None };
            // push cannot fail past the capacity check above
            if let Err(rejected) = queue.push(pkt, proto, fmd.outer_src_ip) {
                drop(queue);
                self.pfree(rejected, DropReason::QueueLimitExceeded);
                return;
            }
            drop(queue);
            trap_pkt
        };

        if let Some(trap_pkt) = first {
            self.trap_flow(e, trap_pkt, index);
        }
    }

    /// Apply a resolved action to a packet
    pub(crate) fn flow_action(
        &self,
        e: &FlowEntry,
        index: u32,
        pkt: Packet,
        proto: u16,
        fmd: &mut ForwardingMd,
    ) {
        let entry_flags = e.flags();
        let mut vrf = e.key().vrf_id;
        if entry_flags & flags::VRFT != 0 {
            vrf = e.dvrf();
        }

        self.set_forwarding_md(e, index, fmd);

        let Some(src_nh) = self.hooks.nexthops.nexthop(e.src_nh_index()) else {
            self.pfree(pkt, DropReason::InvalidNh);
            return;
        };

        if let Some(verdict) = src_nh.validate_source(vrf, &pkt, fmd) {
            match verdict {
                SourceVerdict::Valid => {}
                SourceVerdict::Invalid => {
                    self.pfree(pkt, DropReason::InvalidSource);
                    return;
                }
                SourceVerdict::Mismatch => {
                    self.hooks.agent.trap(
                        pkt,
                        vrf,
                        TrapReason::EcmpResolve,
                        Some(fmd.flow_index as u32),
                    );
                    return;
                }
            }
        }

        if entry_flags & flags::MIRROR != 0 {
            for id in [e.mirror_id(), e.sec_mirror_id()] {
                if id < MAX_MIRROR_INDICES {
                    let mut mirror_fmd = *fmd;
                    mirror_fmd.ecmp_nh_index = -1;
                    self.hooks.mirrors.mirror(id, &pkt, &mirror_fmd);
                }
            }
        }

        match e.action() {
            Some(FlowAction::Forward) => self.flow_forward(vrf, pkt, proto, fmd),
            Some(FlowAction::Nat) => self.flow_nat(vrf, e, pkt, proto, fmd),
            Some(FlowAction::Drop) => self.pfree(pkt, DropReason::ActionDrop),
            Some(FlowAction::Hold) | None => self.pfree(pkt, DropReason::ActionInvalid),
        }
    }

    /// Rebuild forwarding metadata from an entry
    pub(crate) fn set_forwarding_md(&self, e: &FlowEntry, index: u32, fmd: &mut ForwardingMd) {
        fmd.flow_index = index as i32;
        fmd.ecmp_nh_index = e.ecmp_nh_index();
        if e.flags() & flags::RFLOW_VALID != 0 {
            if let Some(rfe) = self.table().entry(e.rflow()) {
                fmd.ecmp_src_nh_index = rfe.ecmp_nh_index();
            }
        }
    }

    /// Forward a packet: resolved next hop if present, else IP input
    pub(crate) fn flow_forward(
        &self,
        vrf: u16,
        mut pkt: Packet,
        proto: u16,
        fmd: &ForwardingMd,
    ) {
        if proto != ETH_PROTO_IP {
            self.pfree(pkt, DropReason::InvalidProtocol);
            return;
        }

        if let Some(nh) = pkt.nexthop.take() {
            nh.output(vrf, pkt, fmd);
            return;
        }

        pkt.set_data_to_network();
        self.hooks.ip.ip_input(vrf, pkt, fmd);
    }

    /// Rewrite endpoints from the reverse key, fix checksums, forward
    fn flow_nat(
        &self,
        vrf: u16,
        e: &FlowEntry,
        mut pkt: Packet,
        proto: u16,
        fmd: &ForwardingMd,
    ) {
        let Some(rfe) = self.table().entry(e.rflow()) else {
            self.pfree(pkt, DropReason::NatNoRflow);
            return;
        };
        let rkey = rfe.key();
        let entry_flags = e.flags();

        let header = pkt.data_mut();
        if !ipv4::header_ok(header) {
            self.pfree(pkt, DropReason::InvalidProtocol);
            return;
        }

        let mut acc = 0u32;

        if entry_flags & flags::SNAT != 0 {
            acc = csum::diff32(acc, ipv4::src(header), rkey.dst_ip);
            ipv4::set_src(header, rkey.dst_ip);
        }
        if entry_flags & flags::DNAT != 0 {
            acc = csum::diff32(acc, ipv4::dst(header), rkey.src_ip);
            ipv4::set_dst(header, rkey.src_ip);
        }

        let ip_acc = acc;

        if ipv4::transport_header_valid(header) {
            let t = ipv4::transport_mut(header);
            if t.len() >= 4 {
                if entry_flags & flags::SPAT != 0 {
                    let old = u16::from_be_bytes([t[0], t[1]]);
                    acc = csum::diff16(acc, old, rkey.dst_port);
                    t[0..2].copy_from_slice(&rkey.dst_port.to_be_bytes());
                }
                if entry_flags & flags::DPAT != 0 {
                    let old = u16::from_be_bytes([t[2], t[3]]);
                    acc = csum::diff16(acc, old, rkey.src_port);
                    t[2..4].copy_from_slice(&rkey.src_port.to_be_bytes());
                }
            }
        }

        if ipv4::checksum(header) != csum::DIAG_IP_CSUM {
            csum::update_packet(header, ip_acc, acc);
        }

        self.flow_forward(vrf, pkt, proto, fmd);
    }

    /// Trap a copy of a packet to the agent with the flow index as cookie
    pub(crate) fn trap_flow(&self, e: &FlowEntry, pkt: Packet, index: u32) {
        let mut npkt = pkt;
        npkt.reset();

        let reason = if e.flags() & flags::TRAP_MASK == flags::TRAP_ECMP {
            TrapReason::EcmpResolve
        } else {
            TrapReason::FlowMiss
        };

        self.hooks.agent.trap(npkt, e.key().vrf_id, reason, Some(index));
    }
}

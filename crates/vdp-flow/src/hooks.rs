//! Collaborator interfaces
//!
//! Everything the flow core consumes but does not own: the IP stack it
//! re-enters, next-hop resolution, the fragment reassembly cache, the
//! mirror-session registry, the trap channel to the agent, the control
//! reply path, and the per-CPU deferred-work scheduler. Each is a narrow
//! trait held by the router container.

use std::sync::Arc;

use crate::control::FlowRequest;
use crate::flush::FlushWork;
use crate::packet::{ForwardingMd, Packet};

/// Outcome of next-hop source validation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceVerdict {
    /// Source is acceptable
    Valid,
    /// Source is not reachable over this next hop
    Invalid,
    /// Source resolves to a different ECMP member
    Mismatch,
}

/// A forwarding decision record produced by routing; opaque to the core
pub trait Nexthop: Send + Sync {
    /// Validate the packet source, if this next hop supplies validation
    fn validate_source(
        &self,
        _vrf: u16,
        _pkt: &Packet,
        _fmd: &ForwardingMd,
    ) -> Option<SourceVerdict> {
        None
    }

    /// Emit the packet over this next hop
    fn output(&self, vrf: u16, pkt: Packet, fmd: &ForwardingMd);
}

/// Next-hop lookup by index
pub trait NexthopTable: Send + Sync {
    /// Resolve a next-hop index; `None` for stale or negative indices
    fn nexthop(&self, index: i32) -> Option<Arc<dyn Nexthop>>;
}

/// Re-entry points into the IP stack
pub trait IpStack: Send + Sync {
    /// Deliver a packet addressed to the router itself
    fn ip_rcv(&self, pkt: Packet, fmd: &ForwardingMd);

    /// Re-enter IP input in `vrf` after classification or translation
    fn ip_input(&self, vrf: u16, pkt: Packet, fmd: &ForwardingMd);
}

/// Transport ports recovered from the fragment cache
#[derive(Debug, Clone, Copy)]
pub struct FragmentPorts {
    /// Transport source port of the head fragment
    pub src_port: u16,
    /// Transport destination port of the head fragment
    pub dst_port: u16,
}

/// Reassembly-cache interface keyed by (vrf, ip id, src, dst)
pub trait FragmentCache: Send + Sync {
    /// Ports published by the head fragment, if seen
    fn get(&self, vrf: u16, ip_id: u16, src_ip: u32, dst_ip: u32) -> Option<FragmentPorts>;

    /// Publish ports from a head fragment
    fn add(&self, vrf: u16, ip_id: u16, src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16);

    /// Drop the cache entry (tail fragment seen)
    fn remove(&self, vrf: u16, ip_id: u16, src_ip: u32, dst_ip: u32);
}

/// Pcap metadata attached to a mirrored flow
#[derive(Debug, Clone, Default)]
pub struct MirrorMeta {
    /// Mirror tunnel source address
    pub sip: u32,
    /// Mirror tunnel source port
    pub sport: u16,
    /// Mirror VRF
    pub vrf: u16,
    /// Opaque pcap metadata blob
    pub pcap: Vec<u8>,
}

/// Mirror-session registry with per-session reference counting
pub trait MirrorRegistry: Send + Sync {
    /// Take a reference on a mirror session; false when absent
    fn get(&self, id: u16) -> bool;

    /// Release a reference on a mirror session
    fn put(&self, id: u16);

    /// Copy a packet into a mirror session
    fn mirror(&self, id: u16, pkt: &Packet, fmd: &ForwardingMd);

    /// Install or refresh per-flow mirror metadata
    fn meta_set(&self, flow_index: u32, meta: MirrorMeta);

    /// Delete per-flow mirror metadata
    fn meta_del(&self, flow_index: u32);
}

/// Why a packet is handed to the agent
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrapReason {
    /// No policy installed for the flow
    FlowMiss,
    /// ECMP member needs resolution
    EcmpResolve,
    /// Link-layer service traffic (DHCP)
    L3Protocols,
}

/// Fire-and-forget packet delivery to the control agent
pub trait AgentTrap: Send + Sync {
    /// Hand a packet to the agent with a reason and optional flow cookie
    fn trap(&self, pkt: Packet, vrf: u16, reason: TrapReason, cookie: Option<u32>);
}

/// Control-plane reply path
pub trait Responder: Send + Sync {
    /// Answer a processed request with its exit code
    fn respond(&self, req: &FlowRequest, code: i32);
}

/// Per-CPU deferred-work posting
///
/// The embedding runtime owns the queues; posted work is eventually run on
/// the target CPU via [`Router::run_flush`](crate::Router::run_flush).
pub trait WorkScheduler: Send + Sync {
    /// Post flush work to one CPU's queue
    fn schedule(&self, cpu: usize, work: FlushWork);
}

/// The full set of collaborators held by a router
#[derive(Clone)]
pub struct Hooks {
    /// Next-hop resolution
    pub nexthops: Arc<dyn NexthopTable>,
    /// IP stack re-entry
    pub ip: Arc<dyn IpStack>,
    /// Fragment reassembly cache
    pub fragments: Arc<dyn FragmentCache>,
    /// Mirror-session registry
    pub mirrors: Arc<dyn MirrorRegistry>,
    /// Trap channel to the agent
    pub agent: Arc<dyn AgentTrap>,
    /// Control reply path
    pub responder: Arc<dyn Responder>,
    /// Deferred-work scheduler
    pub scheduler: Arc<dyn WorkScheduler>,
}

//! Shared mock collaborators and packet builders for tests

use std::collections::HashMap;
use std::sync::Arc;

use bytes::BytesMut;
use parking_lot::Mutex;

use crate::control::FlowRequest;
use crate::flush::FlushWork;
use crate::hooks::{
    AgentTrap, FragmentCache, FragmentPorts, Hooks, IpStack, MirrorMeta, MirrorRegistry,
    Nexthop, NexthopTable, Responder, SourceVerdict, TrapReason, WorkScheduler,
};
use crate::ipv4;
use crate::key::FlowKey;
use crate::packet::{ForwardingMd, Packet};
use crate::router::Router;

/// Next-hop index registered by every [`TestHooks`]
pub const VALID_NH: i32 = 1;

#[derive(Default)]
pub struct MockNexthop {
    verdict: Mutex<Option<SourceVerdict>>,
    pub outputs: Mutex<Vec<(u16, Packet)>>,
}

impl MockNexthop {
    pub fn set_verdict(&self, verdict: Option<SourceVerdict>) {
        *self.verdict.lock() = verdict;
    }
}

impl Nexthop for MockNexthop {
    fn validate_source(
        &self,
        _vrf: u16,
        _pkt: &Packet,
        _fmd: &ForwardingMd,
    ) -> Option<SourceVerdict> {
        *self.verdict.lock()
    }

    fn output(&self, vrf: u16, pkt: Packet, _fmd: &ForwardingMd) {
        self.outputs.lock().push((vrf, pkt));
    }
}

#[derive(Default)]
pub struct MockNexthops {
    nhs: Mutex<HashMap<i32, Arc<MockNexthop>>>,
}

impl MockNexthops {
    pub fn register(&self, index: i32) -> Arc<MockNexthop> {
        let nh = Arc::new(MockNexthop::default());
        self.nhs.lock().insert(index, nh.clone());
        nh
    }

    pub fn get(&self, index: i32) -> Arc<MockNexthop> {
        self.nhs.lock().get(&index).expect("nexthop registered").clone()
    }
}

impl NexthopTable for MockNexthops {
    fn nexthop(&self, index: i32) -> Option<Arc<dyn Nexthop>> {
        self.nhs
            .lock()
            .get(&index)
            .map(|nh| nh.clone() as Arc<dyn Nexthop>)
    }
}

#[derive(Default)]
pub struct MockIpStack {
    pub inputs: Mutex<Vec<(u16, Packet)>>,
    pub rcvs: Mutex<Vec<Packet>>,
    pub outer_src_ips: Mutex<Vec<u32>>,
}

impl IpStack for MockIpStack {
    fn ip_rcv(&self, pkt: Packet, _fmd: &ForwardingMd) {
        self.rcvs.lock().push(pkt);
    }

    fn ip_input(&self, vrf: u16, pkt: Packet, fmd: &ForwardingMd) {
        self.outer_src_ips.lock().push(fmd.outer_src_ip);
        self.inputs.lock().push((vrf, pkt));
    }
}

#[derive(Default)]
pub struct MockFragments {
    map: Mutex<HashMap<(u16, u16, u32, u32), (u16, u16)>>,
}

impl MockFragments {
    pub fn entries(&self) -> usize {
        self.map.lock().len()
    }
}

impl FragmentCache for MockFragments {
    fn get(&self, vrf: u16, ip_id: u16, src_ip: u32, dst_ip: u32) -> Option<FragmentPorts> {
        self.map
            .lock()
            .get(&(vrf, ip_id, src_ip, dst_ip))
            .map(|&(src_port, dst_port)| FragmentPorts { src_port, dst_port })
    }

    fn add(&self, vrf: u16, ip_id: u16, src_ip: u32, dst_ip: u32, src_port: u16, dst_port: u16) {
        self.map
            .lock()
            .insert((vrf, ip_id, src_ip, dst_ip), (src_port, dst_port));
    }

    fn remove(&self, vrf: u16, ip_id: u16, src_ip: u32, dst_ip: u32) {
        self.map.lock().remove(&(vrf, ip_id, src_ip, dst_ip));
    }
}

#[derive(Default)]
pub struct MockMirrors {
    counts: Mutex<HashMap<u16, i64>>,
    pub mirrored: Mutex<Vec<u16>>,
    pub metas: Mutex<HashMap<u32, MirrorMeta>>,
}

impl MockMirrors {
    pub fn refcount(&self, id: u16) -> i64 {
        self.counts.lock().get(&id).copied().unwrap_or(0)
    }
}

impl MirrorRegistry for MockMirrors {
    fn get(&self, id: u16) -> bool {
        *self.counts.lock().entry(id).or_insert(0) += 1;
        true
    }

    fn put(&self, id: u16) {
        *self.counts.lock().entry(id).or_insert(0) -= 1;
    }

    fn mirror(&self, id: u16, _pkt: &Packet, _fmd: &ForwardingMd) {
        self.mirrored.lock().push(id);
    }

    fn meta_set(&self, flow_index: u32, meta: MirrorMeta) {
        self.metas.lock().insert(flow_index, meta);
    }

    fn meta_del(&self, flow_index: u32) {
        self.metas.lock().remove(&flow_index);
    }
}

pub struct TrapRecord {
    pub pkt: Packet,
    pub vrf: u16,
    pub reason: TrapReason,
    pub cookie: Option<u32>,
}

#[derive(Default)]
pub struct MockAgent {
    pub traps: Mutex<Vec<TrapRecord>>,
}

impl AgentTrap for MockAgent {
    fn trap(&self, pkt: Packet, vrf: u16, reason: TrapReason, cookie: Option<u32>) {
        self.traps.lock().push(TrapRecord {
            pkt,
            vrf,
            reason,
            cookie,
        });
    }
}

#[derive(Default)]
pub struct MockResponder {
    pub replies: Mutex<Vec<i32>>,
}

impl Responder for MockResponder {
    fn respond(&self, _req: &FlowRequest, code: i32) {
        self.replies.lock().push(code);
    }
}

#[derive(Default)]
pub struct CollectScheduler {
    works: Mutex<Vec<(usize, FlushWork)>>,
}

impl CollectScheduler {
    pub fn drain(&self) -> Vec<(usize, FlushWork)> {
        std::mem::take(&mut *self.works.lock())
    }
}

impl WorkScheduler for CollectScheduler {
    fn schedule(&self, cpu: usize, work: FlushWork) {
        self.works.lock().push((cpu, work));
    }
}

/// All mock collaborators, individually reachable for assertions
pub struct TestHooks {
    pub nexthops: Arc<MockNexthops>,
    pub ip: Arc<MockIpStack>,
    pub fragments: Arc<MockFragments>,
    pub mirrors: Arc<MockMirrors>,
    pub agent: Arc<MockAgent>,
    pub responder: Arc<MockResponder>,
    pub scheduler: Arc<CollectScheduler>,
}

impl TestHooks {
    pub fn new() -> Self {
        let nexthops = Arc::new(MockNexthops::default());
        nexthops.register(VALID_NH);
        Self {
            nexthops,
            ip: Arc::new(MockIpStack::default()),
            fragments: Arc::new(MockFragments::default()),
            mirrors: Arc::new(MockMirrors::default()),
            agent: Arc::new(MockAgent::default()),
            responder: Arc::new(MockResponder::default()),
            scheduler: Arc::new(CollectScheduler::default()),
        }
    }

    pub fn hooks(&self) -> Hooks {
        Hooks {
            nexthops: self.nexthops.clone(),
            ip: self.ip.clone(),
            fragments: self.fragments.clone(),
            mirrors: self.mirrors.clone(),
            agent: self.agent.clone(),
            responder: self.responder.clone(),
            scheduler: self.scheduler.clone(),
        }
    }
}

/// Run everything the control plane has posted, until nothing is pending
pub fn run_pending_flushes(router: &Router, th: &TestHooks) {
    loop {
        let works = th.scheduler.drain();
        if works.is_empty() {
            break;
        }
        for (_cpu, work) in works {
            router.run_flush(work);
        }
    }
}

/// Build an Ethernet + IPv4 + transport frame matching `key`
///
/// Checksums are valid; the data cursor sits at the network header, as it
/// does when the classifier runs.
pub fn tcp_packet(key: &FlowKey) -> Packet {
    let transport_len = match key.proto {
        ipv4::PROTO_TCP => 20usize,
        ipv4::PROTO_UDP => 8,
        _ => 8,
    };
    let total = 14 + 20 + transport_len;
    let mut frame = vec![0u8; total];

    // Ethernet
    frame[12] = 0x08;
    frame[13] = 0x00;

    // IPv4
    let h = &mut frame[14..];
    h[0] = 0x45;
    h[2..4].copy_from_slice(&((20 + transport_len) as u16).to_be_bytes());
    h[4..6].copy_from_slice(&0x4242u16.to_be_bytes());
    h[8] = 64;
    h[9] = key.proto;
    h[12..16].copy_from_slice(&key.src_ip.to_be_bytes());
    h[16..20].copy_from_slice(&key.dst_ip.to_be_bytes());
    let c = ipv4::compute_checksum(h);
    h[10..12].copy_from_slice(&c.to_be_bytes());

    // transport ports
    let t = &mut h[20..];
    t[0..2].copy_from_slice(&key.src_port.to_be_bytes());
    t[2..4].copy_from_slice(&key.dst_port.to_be_bytes());

    match key.proto {
        ipv4::PROTO_TCP => {
            t[12] = 5 << 4; // data offset
            t[14..16].copy_from_slice(&0xffffu16.to_be_bytes()); // window
            let csum = tcp_checksum(&frame[14..]);
            frame[14 + 20 + 16..14 + 20 + 18].copy_from_slice(&csum.to_be_bytes());
        }
        ipv4::PROTO_UDP => {
            t[4..6].copy_from_slice(&(transport_len as u16).to_be_bytes());
            // checksum left at zero (not computed)
        }
        _ => {}
    }

    let mut pkt = Packet::new(BytesMut::from(&frame[..]));
    pkt.set_network_header(14);
    pkt.set_data_to_network();
    pkt
}

/// [`tcp_packet`] arriving on a policy-enabled interface
pub fn policy_packet(key: &FlowKey) -> Packet {
    let mut pkt = tcp_packet(key);
    pkt.policy_enabled = true;
    pkt
}

/// Transport ports as they sit in an IPv4 header slice
pub fn tcp_ports(header: &[u8]) -> (u16, u16) {
    let t = ipv4::transport(header);
    (
        u16::from_be_bytes([t[0], t[1]]),
        u16::from_be_bytes([t[2], t[3]]),
    )
}

fn pseudo_header_sum(header: &[u8]) -> u32 {
    let t_len = (header.len() - ipv4::ihl(header)) as u32;
    let mut sum = 0u32;
    for chunk in header[12..20].chunks_exact(2) {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    sum += ipv4::protocol(header) as u32;
    sum += t_len;
    sum
}

/// TCP checksum for a segment whose checksum field is zero
pub fn tcp_checksum(header: &[u8]) -> u16 {
    !fold(pseudo_header_sum(header) + segment_sum(ipv4::transport(header)))
}

/// Ones-complement sum over pseudo-header and segment as stored
///
/// `0xffff` means the transport checksum verifies.
pub fn tcp_checksum_sum(header: &[u8]) -> u16 {
    fold(pseudo_header_sum(header) + segment_sum(ipv4::transport(header)))
}

fn segment_sum(t: &[u8]) -> u32 {
    let mut sum = 0u32;
    let mut chunks = t.chunks_exact(2);
    for chunk in &mut chunks {
        sum += u16::from_be_bytes([chunk[0], chunk[1]]) as u32;
    }
    if let [last] = chunks.remainder() {
        sum += u16::from_be_bytes([*last, 0]) as u32;
    }
    sum
}

fn fold(mut sum: u32) -> u16 {
    while sum >> 16 != 0 {
        sum = (sum & 0xffff) + (sum >> 16);
    }
    sum as u16
}

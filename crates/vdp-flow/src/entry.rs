//! Flow entry model
//!
//! One table slot: the flags word whose `ACTIVE` bit is the CAS claim
//! primitive, the installed action and policy scalars, wrap-aware traffic
//! stats, and the bounded hold queue of packets awaiting the agent.
//!
//! # Concurrency
//!
//! The flags word is the only ordering primitive. A claimer wins the
//! inactive→`ACTIVE` CAS, initialises the scalars and writes the key; the
//! clearing store on reset is the final write that republishes the slot as
//! free. Scalar policy fields are plain atomics with relaxed ordering: the
//! dataplane may observe a control update half-applied, and the worst
//! outcome (one packet handled under the previous action) is recoverable.

use std::sync::atomic::{AtomicI32, AtomicU16, AtomicU8, AtomicU32, Ordering};

use parking_lot::{Mutex, MutexGuard, RwLock};
use serde::{Deserialize, Serialize};

use crate::key::FlowKey;
use crate::packet::Packet;
use crate::{MAX_FLOW_QUEUE, MAX_MIRROR_INDICES};

/// Entry flag bits carried in the atomic flags word
pub mod flags {
    /// Slot is live; set by the claim CAS, cleared last on reset
    pub const ACTIVE: u16 = 1 << 0;
    /// Mirror the packet to the configured sessions
    pub const MIRROR: u16 = 1 << 1;
    /// Forward into `dvrf` instead of the key's VRF
    pub const VRFT: u16 = 1 << 2;
    /// Rewrite the source address from the reverse key
    pub const SNAT: u16 = 1 << 3;
    /// Rewrite the destination address from the reverse key
    pub const DNAT: u16 = 1 << 4;
    /// Rewrite the transport source port from the reverse key
    pub const SPAT: u16 = 1 << 5;
    /// Rewrite the transport destination port from the reverse key
    pub const DPAT: u16 = 1 << 6;
    /// `rflow` indexes a live reverse entry
    pub const RFLOW_VALID: u16 = 1 << 7;
    /// Traps from this entry carry the ECMP-resolve reason
    pub const TRAP_ECMP: u16 = 1 << 8;
    /// Bits that select the trap reason
    pub const TRAP_MASK: u16 = TRAP_ECMP;
}

/// Per-flow policy action
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[repr(u8)]
pub enum FlowAction {
    /// Discard matching packets
    Drop = 0,
    /// No decision yet; queue and await the agent
    Hold = 1,
    /// Forward through IP input or a resolved next hop
    Forward = 2,
    /// Translate endpoints from the reverse key, then forward
    Nat = 3,
}

impl FlowAction {
    /// Decode a raw action byte
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(Self::Drop),
            1 => Some(Self::Hold),
            2 => Some(Self::Forward),
            3 => Some(Self::Nat),
            _ => None,
        }
    }
}

/// Wrap-aware 32-bit traffic counters
///
/// The base counters are atomic fetch-adds; a CPU that observes a wrap bumps
/// the companion overflow counter. Detection is approximate by design.
#[derive(Debug, Default)]
pub struct FlowStats {
    bytes: AtomicU32,
    bytes_oflow: AtomicU32,
    packets: AtomicU32,
    packets_oflow: AtomicU32,
}

impl FlowStats {
    /// Account one packet of `len` bytes
    #[inline(always)]
    pub fn update(&self, len: u32) {
        let new_bytes = self.bytes.fetch_add(len, Ordering::Relaxed).wrapping_add(len);
        if new_bytes < len {
            self.bytes_oflow.fetch_add(1, Ordering::Relaxed);
        }

        let new_packets = self.packets.fetch_add(1, Ordering::Relaxed).wrapping_add(1);
        if new_packets == 0 {
            self.packets_oflow.fetch_add(1, Ordering::Relaxed);
        }
    }

    /// Byte counter
    pub fn bytes(&self) -> u32 {
        self.bytes.load(Ordering::Relaxed)
    }

    /// Byte counter wraps
    pub fn bytes_oflow(&self) -> u32 {
        self.bytes_oflow.load(Ordering::Relaxed)
    }

    /// Packet counter
    pub fn packets(&self) -> u32 {
        self.packets.load(Ordering::Relaxed)
    }

    /// Packet counter wraps
    pub fn packets_oflow(&self) -> u32 {
        self.packets_oflow.load(Ordering::Relaxed)
    }

    /// Zero all counters
    pub fn reset(&self) {
        self.bytes.store(0, Ordering::Relaxed);
        self.bytes_oflow.store(0, Ordering::Relaxed);
        self.packets.store(0, Ordering::Relaxed);
        self.packets_oflow.store(0, Ordering::Relaxed);
    }
}

/// One deferred packet on a held flow
#[derive(Debug)]
pub struct PacketNode {
    /// The queued packet
    pub packet: Packet,
    /// Ethernet protocol it arrived with
    pub proto: u16,
    /// Outer source address captured at arrival
    pub outer_src_ip: u32,
    pub(crate) next: Option<Box<PacketNode>>,
}

/// Bounded FIFO of packets deferred while the flow is in Hold
#[derive(Debug, Default)]
pub struct HoldQueue {
    head: Option<Box<PacketNode>>,
}

impl HoldQueue {
    /// True when nothing is queued
    pub fn is_empty(&self) -> bool {
        self.head.is_none()
    }

    /// Number of queued packets
    pub fn len(&self) -> usize {
        let mut n = 0;
        let mut node = self.head.as_deref();
        while let Some(p) = node {
            n += 1;
            node = p.next.as_deref();
        }
        n
    }

    /// Append a packet; fails with the packet when the queue is full
    pub fn push(
        &mut self,
        packet: Packet,
        proto: u16,
        outer_src_ip: u32,
    ) -> Result<(), Packet> {
        let mut count = 0;
        let mut slot = &mut self.head;
        while let Some(node) = slot {
            count += 1;
            slot = &mut node.next;
        }

        if count >= MAX_FLOW_QUEUE {
            return Err(packet);
        }

        *slot = Some(Box::new(PacketNode {
            packet,
            proto,
            outer_src_ip,
            next: None,
        }));
        Ok(())
    }

    /// Detach the whole list in FIFO order
    pub fn take(&mut self) -> Option<Box<PacketNode>> {
        self.head.take()
    }

    /// Discard everything queued
    pub fn clear(&mut self) {
        self.head = None;
    }
}

/// One slot of the flow table
///
/// Entries are preallocated and never move; external consumers address them
/// by virtual index, including the agent-visible memory mapping.
#[derive(Debug, Default)]
#[repr(align(64))]
pub struct FlowEntry {
    entry_flags: AtomicU16,
    action: AtomicU8,
    dvrf: AtomicU16,
    mirror_id: AtomicU16,
    sec_mirror_id: AtomicU16,
    rflow: AtomicI32,
    src_nh_index: AtomicI32,
    ecmp_nh_index: AtomicI32,
    stats: FlowStats,
    key: RwLock<FlowKey>,
    hold: Mutex<HoldQueue>,
}

impl FlowEntry {
    /// Attempt the one-shot inactive→`ACTIVE` claim
    ///
    /// Exactly one caller wins; the winner's slot comes back with the
    /// reference scalars restored to their unset values and every other
    /// flag bit cleared.
    pub fn try_claim(&self) -> bool {
        let cur = self.entry_flags.load(Ordering::Acquire);
        if cur & flags::ACTIVE != 0 {
            return false;
        }
        if self
            .entry_flags
            .compare_exchange(cur, flags::ACTIVE, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        self.rflow.store(-1, Ordering::Relaxed);
        self.mirror_id.store(MAX_MIRROR_INDICES, Ordering::Relaxed);
        self.sec_mirror_id.store(MAX_MIRROR_INDICES, Ordering::Relaxed);
        self.ecmp_nh_index.store(-1, Ordering::Relaxed);
        true
    }

    /// Slot is live
    #[inline(always)]
    pub fn is_active(&self) -> bool {
        self.entry_flags.load(Ordering::Acquire) & flags::ACTIVE != 0
    }

    /// Current flags word
    #[inline(always)]
    pub fn flags(&self) -> u16 {
        self.entry_flags.load(Ordering::Acquire)
    }

    /// Replace the whole flags word (control plane)
    pub fn set_flags(&self, value: u16) {
        self.entry_flags.store(value, Ordering::Release);
    }

    /// Clear individual flag bits
    pub fn clear_flag(&self, bits: u16) {
        self.entry_flags.fetch_and(!bits, Ordering::AcqRel);
    }

    /// Zero the flags word; the final store that republishes a reset slot
    pub fn clear_flags(&self) {
        self.entry_flags.store(0, Ordering::Release);
    }

    /// Copy of the installed key
    pub fn key(&self) -> FlowKey {
        *self.key.read()
    }

    /// Install a key (claimer or control plane only)
    pub fn set_key(&self, key: FlowKey) {
        *self.key.write() = key;
    }

    /// Active and keyed exactly as `key`
    #[inline(always)]
    pub fn matches(&self, key: &FlowKey) -> bool {
        self.is_active() && *self.key.read() == *key
    }

    /// Raw action byte as installed
    #[inline(always)]
    pub fn action_raw(&self) -> u8 {
        self.action.load(Ordering::Relaxed)
    }

    /// Decoded action, if the raw byte is meaningful
    pub fn action(&self) -> Option<FlowAction> {
        FlowAction::from_u8(self.action_raw())
    }

    /// Install an action
    pub fn set_action(&self, action: FlowAction) {
        self.action.store(action as u8, Ordering::Relaxed);
    }

    /// Install a raw action byte from a control request
    pub fn set_action_raw(&self, action: u8) {
        self.action.store(action, Ordering::Relaxed);
    }

    /// Reverse-flow index, or -1
    pub fn rflow(&self) -> i32 {
        self.rflow.load(Ordering::Relaxed)
    }

    /// Set the reverse-flow index
    pub fn set_rflow(&self, index: i32) {
        self.rflow.store(index, Ordering::Relaxed);
    }

    /// Destination VRF used when `VRFT` is set
    pub fn dvrf(&self) -> u16 {
        self.dvrf.load(Ordering::Relaxed)
    }

    /// Set the destination VRF
    pub fn set_dvrf(&self, vrf: u16) {
        self.dvrf.store(vrf, Ordering::Relaxed);
    }

    /// Source next-hop index
    pub fn src_nh_index(&self) -> i32 {
        self.src_nh_index.load(Ordering::Relaxed)
    }

    /// Set the source next-hop index
    pub fn set_src_nh_index(&self, index: i32) {
        self.src_nh_index.store(index, Ordering::Relaxed);
    }

    /// ECMP next-hop index, or -1
    pub fn ecmp_nh_index(&self) -> i32 {
        self.ecmp_nh_index.load(Ordering::Relaxed)
    }

    /// Set the ECMP next-hop index
    pub fn set_ecmp_nh_index(&self, index: i32) {
        self.ecmp_nh_index.store(index, Ordering::Relaxed);
    }

    /// Primary mirror id, or the sentinel
    pub fn mirror_id(&self) -> u16 {
        self.mirror_id.load(Ordering::Relaxed)
    }

    /// Set the primary mirror id
    pub fn set_mirror_id(&self, id: u16) {
        self.mirror_id.store(id, Ordering::Relaxed);
    }

    /// Secondary mirror id, or the sentinel
    pub fn sec_mirror_id(&self) -> u16 {
        self.sec_mirror_id.load(Ordering::Relaxed)
    }

    /// Set the secondary mirror id
    pub fn set_sec_mirror_id(&self, id: u16) {
        self.sec_mirror_id.store(id, Ordering::Relaxed);
    }

    /// Traffic counters
    pub fn stats(&self) -> &FlowStats {
        &self.stats
    }

    /// Lock the hold queue
    pub fn hold_queue(&self) -> MutexGuard<'_, HoldQueue> {
        self.hold.lock()
    }

    /// Restore the non-flag state of a quiescent slot to its unset values
    ///
    /// The caller clears the flags word afterwards; mirror references must
    /// already have been released.
    pub(crate) fn reset_scalars(&self) {
        self.stats.reset();
        self.hold.lock().clear();
        *self.key.write() = FlowKey::default();
        self.ecmp_nh_index.store(-1, Ordering::Relaxed);
        self.src_nh_index.store(-1, Ordering::Relaxed);
        self.rflow.store(-1, Ordering::Relaxed);
        self.mirror_id.store(MAX_MIRROR_INDICES, Ordering::Relaxed);
        self.sec_mirror_id.store(MAX_MIRROR_INDICES, Ordering::Relaxed);
        self.action.store(FlowAction::Drop as u8, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::BytesMut;

    fn pkt() -> Packet {
        Packet::new(BytesMut::from(&[0u8; 40][..]))
    }

    #[test]
    fn test_claim_once() {
        let e = FlowEntry::default();
        assert!(!e.is_active());
        assert!(e.try_claim());
        assert!(e.is_active());
        assert!(!e.try_claim());

        assert_eq!(e.rflow(), -1);
        assert_eq!(e.ecmp_nh_index(), -1);
        assert_eq!(e.mirror_id(), MAX_MIRROR_INDICES);
        assert_eq!(e.sec_mirror_id(), MAX_MIRROR_INDICES);
    }

    #[test]
    fn test_concurrent_claim_single_winner() {
        use std::sync::Arc;
        use std::sync::atomic::AtomicUsize;
        use std::thread;

        let e = Arc::new(FlowEntry::default());
        let wins = Arc::new(AtomicUsize::new(0));
        let mut handles = Vec::new();

        for _ in 0..8 {
            let e = e.clone();
            let wins = wins.clone();
            handles.push(thread::spawn(move || {
                if e.try_claim() {
                    wins.fetch_add(1, Ordering::Relaxed);
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(wins.load(Ordering::Relaxed), 1);
        assert!(e.is_active());
    }

    #[test]
    fn test_hold_queue_bounded_fifo() {
        let mut q = HoldQueue::default();
        assert!(q.is_empty());

        for i in 0..MAX_FLOW_QUEUE {
            assert!(q.push(pkt(), 0x0800, i as u32).is_ok());
        }
        assert_eq!(q.len(), MAX_FLOW_QUEUE);

        // over the cap the packet comes back
        assert!(q.push(pkt(), 0x0800, 99).is_err());
        assert_eq!(q.len(), MAX_FLOW_QUEUE);

        // FIFO order on drain
        let mut node = q.take();
        let mut seen = Vec::new();
        while let Some(n) = node {
            seen.push(n.outer_src_ip);
            node = n.next;
        }
        assert_eq!(seen, vec![0, 1, 2]);
        assert!(q.is_empty());
    }

    #[test]
    fn test_stats_wrap() {
        let s = FlowStats::default();
        s.update(100);
        assert_eq!(s.bytes(), 100);
        assert_eq!(s.packets(), 1);
        assert_eq!(s.bytes_oflow(), 0);

        // push the byte counter over the 32-bit edge
        let s = FlowStats::default();
        s.update(u32::MAX - 10);
        s.update(100);
        assert_eq!(s.bytes_oflow(), 1);
    }

    #[test]
    fn test_reset_scalars() {
        let e = FlowEntry::default();
        assert!(e.try_claim());
        e.set_key(FlowKey::new(1, 2, 3, 4, 6, 0));
        e.set_rflow(7);
        e.set_action(FlowAction::Forward);
        e.stats().update(64);

        e.reset_scalars();
        e.clear_flags();

        assert!(!e.is_active());
        assert_eq!(e.key(), FlowKey::default());
        assert_eq!(e.rflow(), -1);
        assert_eq!(e.action(), Some(FlowAction::Drop));
        assert_eq!(e.stats().packets(), 0);
    }

    #[test]
    fn test_action_decoding() {
        assert_eq!(FlowAction::from_u8(0), Some(FlowAction::Drop));
        assert_eq!(FlowAction::from_u8(1), Some(FlowAction::Hold));
        assert_eq!(FlowAction::from_u8(2), Some(FlowAction::Forward));
        assert_eq!(FlowAction::from_u8(3), Some(FlowAction::Nat));
        assert_eq!(FlowAction::from_u8(200), None);
    }
}

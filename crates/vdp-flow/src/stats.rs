//! Datapath accounting
//!
//! Lock-free drop-reason counters plus the hold/action feedback signal that
//! gates new-flow creation. Both are deliberately approximate: the gate is
//! advisory, reads are unsynchronised, and that is cheap enough to sit on
//! the per-packet path.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

use crossbeam::utils::CachePadded;
use vdp_common::AtomicCounter;

/// Why a packet left the datapath without being forwarded
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// Non-IPv4 frame reached the flow forwarder
    InvalidProtocol,
    /// Both tables are out of free slots
    FlowTableFull,
    /// The per-flow hold queue is at capacity
    QueueLimitExceeded,
    /// Hold-queue node allocation failed
    NoMemory,
    /// The flow cannot make progress (backpressure gate)
    FlowUnusable,
    /// NAT entry has no resolvable reverse flow
    NatNoRflow,
    /// Source next-hop did not resolve
    InvalidNh,
    /// Source validation rejected the packet
    InvalidSource,
    /// The installed action is Drop
    ActionDrop,
    /// The installed action byte decodes to nothing
    ActionInvalid,
    /// Fragment continuation with no cached ports
    Fragments,
}

impl DropReason {
    const COUNT: usize = 11;

    #[inline(always)]
    fn index(self) -> usize {
        self as usize
    }
}

/// Per-reason drop counters (lock-free)
#[derive(Debug)]
pub struct DropStats {
    counts: [AtomicU64; DropReason::COUNT],
}

impl Default for DropStats {
    fn default() -> Self {
        Self {
            counts: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }
}

impl DropStats {
    /// Record one drop
    #[inline(always)]
    pub fn record(&self, reason: DropReason) {
        self.counts[reason.index()].fetch_add(1, Ordering::Relaxed);
    }

    /// Drops recorded for one reason
    pub fn count(&self, reason: DropReason) -> u64 {
        self.counts[reason.index()].load(Ordering::Relaxed)
    }

    /// Drops recorded across all reasons
    pub fn total(&self) -> u64 {
        self.counts
            .iter()
            .map(|c| c.load(Ordering::Relaxed))
            .sum()
    }
}

/// Hold/action accounting for the new-flow backpressure gate
///
/// Each CPU owns one hold-counter lane; the control plane bumps the shared
/// action counter once per resolved hold. The difference approximates the
/// number of unresolved flows.
#[derive(Debug)]
pub struct TableInfo {
    hold_count: Vec<CachePadded<AtomicU32>>,
    action_count: AtomicCounter,
}

impl TableInfo {
    /// Accounting block for `num_cpus` dataplane lanes
    pub fn new(num_cpus: usize) -> Self {
        Self {
            hold_count: (0..num_cpus.max(1))
                .map(|_| CachePadded::new(AtomicU32::new(0)))
                .collect(),
            action_count: AtomicCounter::new(0),
        }
    }

    /// Unresolved holds: total hold_count minus action_count, clamped at zero
    pub fn unresolved_holds(&self) -> u64 {
        let held: u64 = self
            .hold_count
            .iter()
            .map(|c| c.load(Ordering::Relaxed) as u64)
            .sum();
        held.saturating_sub(self.action_count.get())
    }

    /// Account one entry transitioned to Hold by `cpu`
    ///
    /// Before bumping the lane, opportunistically reconcile it against the
    /// action counter so neither side grows without bound. The trigger is
    /// the lane sitting at its wrap point.
    pub fn note_hold(&self, cpu: usize) {
        let lane = &self.hold_count[cpu % self.hold_count.len()];
        let held = lane.load(Ordering::Relaxed);

        if held.wrapping_add(1) < held {
            let actions = self.action_count.get();
            if actions > held as u64 {
                self.action_count.sub(held as u64);
                lane.store(0, Ordering::Relaxed);
            } else {
                lane.store(held - actions as u32, Ordering::Relaxed);
                self.action_count.sub(actions);
            }
        }

        lane.fetch_add(1, Ordering::Relaxed);
    }

    /// Account one Hold entry resolved to a concrete action
    #[inline(always)]
    pub fn note_action(&self) {
        self.action_count.inc();
    }

    /// Hold counter of one CPU lane
    pub fn hold_count(&self, cpu: usize) -> u32 {
        self.hold_count[cpu % self.hold_count.len()].load(Ordering::Relaxed)
    }

    /// Global action counter
    pub fn action_count(&self) -> u64 {
        self.action_count.get()
    }

    /// Zero all lanes and the action counter
    pub fn reset(&self) {
        for lane in &self.hold_count {
            lane.store(0, Ordering::Relaxed);
        }
        self.action_count.reset();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_drop_stats() {
        let stats = DropStats::default();
        stats.record(DropReason::FlowTableFull);
        stats.record(DropReason::FlowTableFull);
        stats.record(DropReason::ActionDrop);

        assert_eq!(stats.count(DropReason::FlowTableFull), 2);
        assert_eq!(stats.count(DropReason::ActionDrop), 1);
        assert_eq!(stats.count(DropReason::Fragments), 0);
        assert_eq!(stats.total(), 3);
    }

    #[test]
    fn test_unresolved_holds() {
        let info = TableInfo::new(4);
        info.note_hold(0);
        info.note_hold(1);
        info.note_hold(1);
        assert_eq!(info.unresolved_holds(), 3);

        info.note_action();
        assert_eq!(info.unresolved_holds(), 2);

        // more actions than holds clamps at zero
        info.note_action();
        info.note_action();
        info.note_action();
        assert_eq!(info.unresolved_holds(), 0);
    }

    #[test]
    fn test_reset() {
        let info = TableInfo::new(2);
        info.note_hold(0);
        info.note_action();
        info.reset();
        assert_eq!(info.hold_count(0), 0);
        assert_eq!(info.action_count(), 0);
        assert_eq!(info.unresolved_holds(), 0);
    }
}

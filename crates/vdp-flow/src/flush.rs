//! Flush and reset
//!
//! Control-plane mutations never touch queued packets directly; they post
//! flush work back to a dataplane CPU. The work replays the entry's hold
//! queue through the action engine with freshly rebuilt forwarding
//! metadata, and for deletes it then resets the slot, clearing `ACTIVE`
//! last so the slot republishes as free only when fully quiescent.

use tracing::info;

use crate::entry::{flags, FlowAction, FlowEntry};
use crate::packet::ForwardingMd;
use crate::router::Router;

/// One unit of deferred flush work
#[derive(Debug, Clone, Copy)]
pub struct FlushWork {
    /// Virtual index of the entry to flush
    pub index: u32,
    /// Request flags word; a cleared `ACTIVE` bit makes this a delete
    pub flags: u16,
    /// Request action byte
    pub action: u8,
}

impl Router {
    /// Post a flush for an entry to the calling CPU's work queue
    pub(crate) fn schedule_transition(&self, index: u32, work_flags: u16, action: u8) {
        self.hooks.scheduler.schedule(
            self.cpu(),
            FlushWork {
                index,
                flags: work_flags,
                action,
            },
        );
    }

    /// Execute posted flush work on the current thread
    ///
    /// Invoked by the embedding runtime when the per-CPU scheduler hands
    /// the work back. Absent entries are a no-op.
    pub fn run_flush(&self, work: FlushWork) {
        let Some(e) = self.table().entry(work.index as i32) else {
            return;
        };

        let mut fmd = ForwardingMd::default();
        self.set_forwarding_md(e, work.index, &mut fmd);
        self.flush_entry(e, work.index, &mut fmd);

        if work.flags & flags::ACTIVE == 0 {
            self.reset_entry(e, work.index);
        }
    }

    /// Drain an entry's hold queue through the action engine in FIFO order
    pub(crate) fn flush_entry(&self, e: &FlowEntry, index: u32, fmd: &mut ForwardingMd) {
        let mut node = e.hold_queue().take();
        while let Some(boxed) = node {
            let n = *boxed;
            node = n.next;
            fmd.outer_src_ip = n.outer_src_ip;
            self.flow_action(e, index, n.packet, n.proto, fmd);
        }
    }

    /// Reset a quiescent slot: stats, queue, key, mirrors, scalars, flags
    ///
    /// The flags word is zeroed last; that store is what republishes the
    /// slot as free to the claim CAS.
    pub(crate) fn reset_entry(&self, e: &FlowEntry, index: u32) {
        self.reset_mirror(e, index);
        e.reset_scalars();
        e.clear_flags();
    }

    /// Flush and reset every slot, then zero the accounting block
    pub fn reset(&self) {
        for index in 0..self.table().entries() {
            if let Some(e) = self.table().entry_at(index) {
                let mut fmd = ForwardingMd::default();
                e.set_action(FlowAction::Drop);
                self.flush_entry(e, index as u32, &mut fmd);
                self.reset_entry(e, index as u32);
            }
        }

        self.info().reset();
        info!("flow table reset");
    }

    /// Module teardown: flush and reset all state
    ///
    /// On a soft reset the table memory stays for reuse; on a hard exit the
    /// backing arrays are released when the router is dropped.
    pub fn exit(&self, soft_reset: bool) {
        self.reset();
        if !soft_reset {
            info!("flow table shut down");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{FlowOp, FlowRequest};
    use crate::ipv4::PROTO_TCP;
    use crate::key::FlowKey;
    use crate::packet::ETH_PROTO_IP;
    use crate::router::RouterConfig;
    use crate::testutil::{policy_packet, run_pending_flushes, TestHooks, VALID_NH};
    use crate::MAX_FLOW_QUEUE;

    fn setup() -> (TestHooks, Router) {
        let th = TestHooks::new();
        let router = Router::new(
            RouterConfig {
                flow_entries: 64,
                oflow_entries: 8,
                num_cpus: 1,
                flow_dev: 0,
            },
            th.hooks(),
        )
        .unwrap();
        (th, router)
    }

    fn key() -> FlowKey {
        FlowKey::new(0x0a000001, 0x0a000002, 1000, 80, PROTO_TCP, 1)
    }

    fn hold_flow(router: &Router, k: &FlowKey, packets: usize) -> u32 {
        let mut fmd = crate::ForwardingMd::default();
        for _ in 0..packets {
            router.inet_input(1, policy_packet(k), ETH_PROTO_IP, &mut fmd);
        }
        router.table().find(k).unwrap().1
    }

    #[test]
    fn test_flush_replays_in_arrival_order() {
        let (th, router) = setup();
        let k = key();
        let index = hold_flow(&router, &k, MAX_FLOW_QUEUE);

        // stamp distinct outer sources onto the queued nodes
        {
            let (e, _) = router.table().find(&k).unwrap();
            let mut q = e.hold_queue();
            let mut node = q.take();
            let mut rebuilt = crate::entry::HoldQueue::default();
            let mut outer = 1u32;
            while let Some(n) = node {
                node = n.next;
                rebuilt.push(n.packet, n.proto, outer).unwrap();
                outer += 1;
            }
            *q = rebuilt;
        }

        let mut req = FlowRequest {
            op: FlowOp::Set,
            index: index as i32,
            action: crate::FlowAction::Forward as u8,
            flags: flags::ACTIVE,
            sip: k.src_ip,
            dip: k.dst_ip,
            sport: k.src_port,
            dport: k.dst_port,
            proto: k.proto,
            vrf: k.vrf_id,
            src_nh_index: VALID_NH,
            ..FlowRequest::default()
        };
        assert_eq!(router.flow_request_process(&mut req), 0);
        run_pending_flushes(&router, &th);

        // FIFO: forwarding metadata saw outer sources in arrival order
        let outers = th.ip.outer_src_ips.lock();
        assert_eq!(outers.as_slice(), &[1, 2, 3]);
    }

    #[test]
    fn test_run_flush_on_absent_index_is_noop() {
        let (_th, router) = setup();
        router.run_flush(FlushWork {
            index: 1 << 20,
            flags: 0,
            action: 0,
        });
    }

    #[test]
    fn test_global_reset_clears_everything() {
        let (_th, router) = setup();
        let k = key();
        hold_flow(&router, &k, 2);
        assert_eq!(router.info().unresolved_holds(), 1);

        router.reset();

        assert!(router.table().find(&k).is_none());
        assert_eq!(router.info().unresolved_holds(), 0);
        assert_eq!(router.info().action_count(), 0);
        // both queued packets were replayed and disposed of; the held flow
        // never had a next hop installed
        assert_eq!(router.drops().count(crate::DropReason::InvalidNh), 2);
    }

    #[test]
    fn test_exit_soft_reset_keeps_geometry() {
        let (_th, router) = setup();
        let k = key();
        hold_flow(&router, &k, 1);

        router.exit(true);
        assert!(router.table().find(&k).is_none());
        assert_eq!(router.table().entries(), 72);
    }
}

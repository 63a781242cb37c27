//! Control-plane request handling
//!
//! The agent drives the table with two operations: `TABLE_GET` reports the
//! exported table geometry for the memory mapping, and `FLOW_SET` is the
//! unified create/update/delete selected by the `ACTIVE` bit of the request
//! flags. Validation is fatal-first: nothing is mutated past the first
//! failing check.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use crate::entry::{flags, FlowAction, FlowEntry};
use crate::hooks::MirrorMeta;
use crate::key::FlowKey;
use crate::router::Router;
use crate::{MAX_MIRROR_INDICES, MAX_VRFS};

/// Control operation selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum FlowOp {
    /// Report table geometry for the memory mapping
    #[default]
    TableGet,
    /// Create, update or delete a flow entry
    Set,
}

/// Agent request and response record
///
/// The wire codec lives outside the core; this is the decoded shape the
/// handler consumes. Response-only fields are filled in place.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlowRequest {
    /// Operation selector
    pub op: FlowOp,
    /// Router id
    pub rid: u16,
    /// Target virtual index; -1 to address by key
    pub index: i32,
    /// Requested action byte
    pub action: u8,
    /// Requested flags word
    pub flags: u16,
    /// Key: source address
    pub sip: u32,
    /// Key: destination address
    pub dip: u32,
    /// Key: source port
    pub sport: u16,
    /// Key: destination port
    pub dport: u16,
    /// Key: IP protocol
    pub proto: u8,
    /// Key: routing domain
    pub vrf: u16,
    /// Reverse-flow virtual index, or -1
    pub rflow_index: i32,
    /// Source next-hop index
    pub src_nh_index: i32,
    /// ECMP next-hop index, or -1
    pub ecmp_nh_index: i32,
    /// Destination VRF when `VRFT` is requested
    pub dvrf: u16,
    /// Primary mirror id, or -1
    pub mirror_id: i32,
    /// Secondary mirror id, or -1
    pub sec_mirror_id: i32,
    /// Mirror tunnel source address
    pub mirror_sip: u32,
    /// Mirror tunnel source port
    pub mirror_sport: u16,
    /// Mirror VRF
    pub mirror_vrf: u16,
    /// Opaque pcap metadata blob
    pub pcap_meta: Vec<u8>,
    /// Response: exported table size in bytes
    pub ftable_size: u64,
    /// Response: device identifier for the memory mapping
    pub ftable_dev: u16,
}

impl Default for FlowRequest {
    fn default() -> Self {
        Self {
            op: FlowOp::default(),
            rid: 0,
            index: -1,
            action: FlowAction::Drop as u8,
            flags: 0,
            sip: 0,
            dip: 0,
            sport: 0,
            dport: 0,
            proto: 0,
            vrf: 0,
            rflow_index: -1,
            src_nh_index: -1,
            ecmp_nh_index: -1,
            dvrf: 0,
            mirror_id: -1,
            sec_mirror_id: -1,
            mirror_sip: 0,
            mirror_sport: 0,
            mirror_vrf: 0,
            pcap_meta: Vec::new(),
            ftable_size: 0,
            ftable_dev: 0,
        }
    }
}

impl FlowRequest {
    /// The flow key carried by the request
    pub fn key(&self) -> FlowKey {
        FlowKey::new(self.sip, self.dip, self.sport, self.dport, self.proto, self.vrf)
    }
}

/// Control-plane request failures, mapped to errno-style exit codes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum RequestError {
    /// Request key does not match the targeted entry
    #[error("key fields do not match the targeted entry")]
    KeyMismatch,
    /// Malformed request or dangling reference
    #[error("malformed request or missing reference")]
    Invalid,
    /// Both tables are full
    #[error("flow table full")]
    NoSpace,
    /// Allocation failed
    #[error("out of memory")]
    NoMemory,
}

impl RequestError {
    /// Negative errno-domain exit code
    pub fn code(&self) -> i32 {
        match self {
            Self::KeyMismatch => -9,  // EBADF
            Self::Invalid => -22,     // EINVAL
            Self::NoSpace => -28,     // ENOSPC
            Self::NoMemory => -12,    // ENOMEM
        }
    }
}

impl Router {
    /// Dispatch one agent request and answer through the responder
    ///
    /// Returns the exit code that was also sent on the reply path: zero on
    /// success, a negative errno-domain value otherwise.
    pub fn flow_request_process(&self, req: &mut FlowRequest) -> i32 {
        let ret = match req.op {
            FlowOp::TableGet => {
                req.ftable_size = (self.table_size() + self.oflow_table_size()) as u64;
                req.ftable_dev = self.config().flow_dev;
                0
            }
            FlowOp::Set => match self.flow_set(req) {
                Ok(()) => 0,
                Err(err) => {
                    warn!(index = req.index, %err, "flow set refused");
                    err.code()
                }
            },
        };

        self.hooks.responder.respond(req, ret);
        ret
    }

    /// Apply a `FLOW_SET`: create/update when `ACTIVE` is requested,
    /// delete otherwise
    fn flow_set(&self, req: &mut FlowRequest) -> Result<(), RequestError> {
        let target = self.table().entry(req.index);

        self.validate_request(req, target)?;

        // one action-count tick per hold resolved or abandoned
        if let Some(e) = target {
            if e.action_raw() == FlowAction::Hold as u8
                && (req.action != FlowAction::Hold as u8 || req.flags & flags::ACTIVE == 0)
            {
                self.info().note_action();
            }
        }

        if req.flags & flags::ACTIVE == 0 {
            let e = target.ok_or(RequestError::Invalid)?;
            return self.flow_delete(req, e);
        }

        let e = match target {
            Some(e) => e,
            None => {
                let key = req.key();
                let (e, index) = self.table().add(&key).ok_or(RequestError::NoSpace)?;
                req.index = index as i32;
                e
            }
        };

        self.set_mirrors(req, e);

        if req.flags & flags::RFLOW_VALID != 0 {
            e.set_rflow(req.rflow_index);
        } else {
            e.set_rflow(-1);
        }

        if req.flags & flags::VRFT != 0 {
            e.set_dvrf(req.dvrf);
        }

        e.set_ecmp_nh_index(req.ecmp_nh_index);
        e.set_src_nh_index(req.src_nh_index);
        e.set_action_raw(req.action);
        e.set_flags(req.flags);

        debug!(index = req.index, action = req.action, "flow installed");
        self.schedule_transition(req.index as u32, req.flags, req.action);
        Ok(())
    }

    /// Validate a `FLOW_SET` request against the table state
    fn validate_request(
        &self,
        req: &FlowRequest,
        target: Option<&FlowEntry>,
    ) -> Result<(), RequestError> {
        // index reuse protection: the addressed slot must still carry the
        // request's key
        if let Some(e) = target {
            if e.key() != req.key() {
                return Err(RequestError::KeyMismatch);
            }
        }

        if req.flags & flags::VRFT != 0 && req.dvrf >= MAX_VRFS {
            return Err(RequestError::Invalid);
        }

        if req.flags & flags::MIRROR != 0 {
            let primary_ok = (0..MAX_MIRROR_INDICES as i32).contains(&req.mirror_id);
            let secondary_ok = (0..MAX_MIRROR_INDICES as i32).contains(&req.sec_mirror_id);
            if !primary_ok && !secondary_ok {
                return Err(RequestError::Invalid);
            }
        }

        if req.flags & flags::RFLOW_VALID != 0
            && self.table().entry(req.rflow_index).is_none()
        {
            return Err(RequestError::Invalid);
        }

        // delete does not need a resolvable next hop
        if req.flags & flags::ACTIVE != 0
            && self.hooks.nexthops.nexthop(req.src_nh_index).is_none()
        {
            return Err(RequestError::Invalid);
        }

        Ok(())
    }

    /// Delete path: park the entry on Drop, release mirrors, schedule the
    /// flush that will reset the slot
    fn flow_delete(&self, req: &FlowRequest, e: &FlowEntry) -> Result<(), RequestError> {
        e.set_action(FlowAction::Drop);
        self.reset_mirror(e, req.index as u32);

        debug!(index = req.index, "flow delete scheduled");
        self.schedule_transition(req.index as u32, req.flags, req.action);
        Ok(())
    }

    /// Reconcile entry mirror state with a request
    ///
    /// Old references are released before new ones are taken; a missing new
    /// session is tolerated because validation already ran.
    fn set_mirrors(&self, req: &FlowRequest, e: &FlowEntry) {
        if req.flags & flags::MIRROR == 0 {
            if e.flags() & flags::MIRROR != 0 {
                self.reset_mirror(e, req.index as u32);
            }
            return;
        }

        if e.mirror_id() as i32 != req.mirror_id {
            if e.mirror_id() < MAX_MIRROR_INDICES {
                self.hooks.mirrors.put(e.mirror_id());
                e.set_mirror_id(MAX_MIRROR_INDICES);
            }
            if (0..MAX_MIRROR_INDICES as i32).contains(&req.mirror_id)
                && self.hooks.mirrors.get(req.mirror_id as u16)
            {
                e.set_mirror_id(req.mirror_id as u16);
            }
        }

        if e.sec_mirror_id() as i32 != req.sec_mirror_id {
            if e.sec_mirror_id() < MAX_MIRROR_INDICES {
                self.hooks.mirrors.put(e.sec_mirror_id());
                e.set_sec_mirror_id(MAX_MIRROR_INDICES);
            }
            if (0..MAX_MIRROR_INDICES as i32).contains(&req.sec_mirror_id)
                && self.hooks.mirrors.get(req.sec_mirror_id as u16)
            {
                e.set_sec_mirror_id(req.sec_mirror_id as u16);
            }
        }

        if !req.pcap_meta.is_empty() {
            self.hooks.mirrors.meta_set(
                req.index as u32,
                MirrorMeta {
                    sip: req.mirror_sip,
                    sport: req.mirror_sport,
                    vrf: req.mirror_vrf,
                    pcap: req.pcap_meta.clone(),
                },
            );
        }
    }

    /// Release an entry's mirror references and metadata
    pub(crate) fn reset_mirror(&self, e: &FlowEntry, index: u32) {
        if e.flags() & flags::MIRROR != 0 {
            if e.mirror_id() < MAX_MIRROR_INDICES {
                self.hooks.mirrors.put(e.mirror_id());
            }
            if e.sec_mirror_id() < MAX_MIRROR_INDICES {
                self.hooks.mirrors.put(e.sec_mirror_id());
            }
            self.hooks.mirrors.meta_del(index);
            e.clear_flag(flags::MIRROR);
        }
        e.set_mirror_id(MAX_MIRROR_INDICES);
        e.set_sec_mirror_id(MAX_MIRROR_INDICES);
    }
}

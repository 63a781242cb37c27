//! Router container
//!
//! Owns the flow table, the hold/action accounting block, the drop
//! counters, and the collaborator hooks. All dataplane and control entry
//! points hang off this type; the per-path logic lives in `classify`,
//! `action`, `control` and `flush`.

use serde::{Deserialize, Serialize};
use tracing::info;
use vdp_common::{cpu, CoreResult};

use crate::entry::FlowEntry;
use crate::hooks::Hooks;
use crate::packet::Packet;
use crate::stats::{DropReason, DropStats, TableInfo};
use crate::table::{FlowTable, TableConfig};
use crate::{DEFAULT_FLOW_ENTRIES, DEFAULT_OFLOW_ENTRIES};

/// Router configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    /// Primary table entries; must be a multiple of the bucket width
    pub flow_entries: usize,
    /// Overflow table entries
    pub oflow_entries: usize,
    /// Dataplane CPU lanes
    pub num_cpus: usize,
    /// Device identifier reported for the table memory mapping
    pub flow_dev: u16,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            flow_entries: DEFAULT_FLOW_ENTRIES,
            oflow_entries: DEFAULT_OFLOW_ENTRIES,
            num_cpus: cpu::count(),
            flow_dev: 0,
        }
    }
}

/// The flow-table core of one virtual router
pub struct Router {
    config: RouterConfig,
    table: FlowTable,
    info: TableInfo,
    drops: DropStats,
    pub(crate) hooks: Hooks,
}

impl Router {
    /// Allocate the tables and accounting block
    ///
    /// Fails on unusable geometry; a failed construction leaves nothing
    /// allocated.
    pub fn new(config: RouterConfig, hooks: Hooks) -> CoreResult<Self> {
        let table = FlowTable::new(&TableConfig {
            flow_entries: config.flow_entries,
            oflow_entries: config.oflow_entries,
        })?;
        let info = TableInfo::new(config.num_cpus);

        info!(
            flow_entries = config.flow_entries,
            oflow_entries = config.oflow_entries,
            num_cpus = config.num_cpus,
            "flow table initialised"
        );

        Ok(Self {
            config,
            table,
            info,
            drops: DropStats::default(),
            hooks,
        })
    }

    /// The configuration this router was built with
    pub fn config(&self) -> &RouterConfig {
        &self.config
    }

    /// The two-tier table store
    pub fn table(&self) -> &FlowTable {
        &self.table
    }

    /// Hold/action accounting
    pub fn info(&self) -> &TableInfo {
        &self.info
    }

    /// Per-reason drop counters
    pub fn drops(&self) -> &DropStats {
        &self.drops
    }

    /// Primary table size in bytes
    pub fn table_size(&self) -> usize {
        self.table.size_bytes()
    }

    /// Overflow table size in bytes
    pub fn oflow_table_size(&self) -> usize {
        self.table.oflow_size_bytes()
    }

    /// Address inside the exported table region at a byte offset
    ///
    /// The exported region is the primary entries immediately followed by
    /// the overflow entries, byte-identical to the live layout.
    pub fn flow_va(&self, offset: usize) -> Option<*const FlowEntry> {
        self.table.va(offset)
    }

    /// Logical CPU lane of the calling thread
    #[inline(always)]
    pub(crate) fn cpu(&self) -> usize {
        cpu::current() % self.config.num_cpus.max(1)
    }

    /// Dispose of a packet with a reason
    ///
    /// Packet buffers are owned values: recording the reason is the
    /// disposition, dropping the value frees the buffer.
    #[inline(always)]
    pub(crate) fn pfree(&self, pkt: Packet, reason: DropReason) {
        self.drops.record(reason);
        drop(pkt);
    }
}

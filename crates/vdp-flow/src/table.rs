//! Two-tier flow table store
//!
//! A bucketed primary array backed by a linearly probed overflow array.
//! Both are preallocated and addressed through one virtual index space:
//! `0..N` is the primary, `N..N+M` the overflow. External consumers (the
//! agent's memory mapping) see the two arrays as one contiguous byte range.
//!
//! Slot acquisition is the entry's claim CAS; the probe sequence is the
//! only other moving part. Lookup prefers the primary, so if concurrent
//! inserts ever land one key in both tiers the primary match wins.

use serde::{Deserialize, Serialize};
use vdp_common::{CoreError, CoreResult};

use crate::entry::FlowEntry;
use crate::key::FlowKey;
use crate::{DEFAULT_FLOW_ENTRIES, DEFAULT_OFLOW_ENTRIES, FLOW_ENTRIES_PER_BUCKET};

/// Flow table geometry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TableConfig {
    /// Primary entries; must be a positive multiple of the bucket width
    pub flow_entries: usize,
    /// Overflow entries; must be positive
    pub oflow_entries: usize,
}

impl Default for TableConfig {
    fn default() -> Self {
        Self {
            flow_entries: DEFAULT_FLOW_ENTRIES,
            oflow_entries: DEFAULT_OFLOW_ENTRIES,
        }
    }
}

/// Primary + overflow entry arrays with atomic slot acquisition
#[derive(Debug)]
pub struct FlowTable {
    primary: Box<[FlowEntry]>,
    overflow: Box<[FlowEntry]>,
}

impl FlowTable {
    /// Allocate both tiers per `config`
    pub fn new(config: &TableConfig) -> CoreResult<Self> {
        if config.flow_entries == 0 || config.flow_entries % FLOW_ENTRIES_PER_BUCKET != 0 {
            return Err(CoreError::InvalidConfig(format!(
                "{} primary entries not a multiple of bucket width {}",
                config.flow_entries, FLOW_ENTRIES_PER_BUCKET
            )));
        }
        if config.oflow_entries == 0 {
            return Err(CoreError::InvalidConfig(
                "overflow table must hold at least one entry".into(),
            ));
        }

        let primary = (0..config.flow_entries)
            .map(|_| FlowEntry::default())
            .collect();
        let overflow = (0..config.oflow_entries)
            .map(|_| FlowEntry::default())
            .collect();

        Ok(Self { primary, overflow })
    }

    /// Primary entry count
    pub fn flow_entries(&self) -> usize {
        self.primary.len()
    }

    /// Overflow entry count
    pub fn oflow_entries(&self) -> usize {
        self.overflow.len()
    }

    /// Total entries across both tiers
    pub fn entries(&self) -> usize {
        self.primary.len() + self.overflow.len()
    }

    /// Primary tier size in bytes
    pub fn size_bytes(&self) -> usize {
        self.primary.len() * std::mem::size_of::<FlowEntry>()
    }

    /// Overflow tier size in bytes
    pub fn oflow_size_bytes(&self) -> usize {
        self.overflow.len() * std::mem::size_of::<FlowEntry>()
    }

    /// Entry at a virtual index; negative or out-of-range yields `None`
    pub fn entry(&self, index: i32) -> Option<&FlowEntry> {
        if index < 0 {
            return None;
        }
        self.entry_at(index as usize)
    }

    /// Entry at a non-negative virtual index
    pub fn entry_at(&self, index: usize) -> Option<&FlowEntry> {
        if index < self.primary.len() {
            Some(&self.primary[index])
        } else {
            self.overflow.get(index - self.primary.len())
        }
    }

    /// Address inside the exported region at a byte offset
    ///
    /// The region is the primary tier immediately followed by the overflow
    /// tier, byte-identical to the live entries.
    pub fn va(&self, offset: usize) -> Option<*const FlowEntry> {
        let psize = self.size_bytes();
        let (base, off) = if offset < psize {
            (self.primary.as_ptr(), offset)
        } else if offset - psize < self.oflow_size_bytes() {
            (self.overflow.as_ptr(), offset - psize)
        } else {
            return None;
        };

        // Byte arithmetic inside a live allocation; offsets were bounds
        // checked above.
        Some(unsafe { base.cast::<u8>().add(off).cast::<FlowEntry>() })
    }

    /// Find the Active entry holding `key`
    ///
    /// Primary bucket first, then a full linear probe of the overflow.
    /// Returns the entry and its virtual index.
    pub fn find(&self, key: &FlowKey) -> Option<(&FlowEntry, u32)> {
        let hash = key.hash() as usize;

        let n = self.primary.len();
        let base = (hash % n) & !(FLOW_ENTRIES_PER_BUCKET - 1);
        for i in 0..FLOW_ENTRIES_PER_BUCKET {
            let index = (base + i) % n;
            let e = &self.primary[index];
            if e.matches(key) {
                return Some((e, index as u32));
            }
        }

        let m = self.overflow.len();
        let start = hash % m;
        for i in 0..m {
            let index = (start + i) % m;
            let e = &self.overflow[index];
            if e.matches(key) {
                return Some((e, (n + index) as u32));
            }
        }

        None
    }

    /// Claim a free slot on `key`'s probe path and install the key
    ///
    /// The same probe sequence as [`find`](Self::find), but the predicate
    /// is a winning claim CAS; a losing CAS moves to the next slot. Fails
    /// only when both tiers are exhausted along the path.
    pub fn find_free(&self, key: &FlowKey) -> Option<(&FlowEntry, u32)> {
        let hash = key.hash() as usize;

        let n = self.primary.len();
        let base = (hash % n) & !(FLOW_ENTRIES_PER_BUCKET - 1);
        for i in 0..FLOW_ENTRIES_PER_BUCKET {
            let index = (base + i) % n;
            let e = &self.primary[index];
            if e.try_claim() {
                e.set_key(*key);
                return Some((e, index as u32));
            }
        }

        let m = self.overflow.len();
        let start = hash % m;
        for i in 0..m {
            let index = (start + i) % m;
            let e = &self.overflow[index];
            if e.try_claim() {
                e.set_key(*key);
                return Some((e, (n + index) as u32));
            }
        }

        None
    }

    /// Existing Active entry for `key`, or a freshly claimed slot
    ///
    /// Control-plane path only; the dataplane goes through the classifier.
    pub fn add(&self, key: &FlowKey) -> Option<(&FlowEntry, u32)> {
        self.find(key).or_else(|| self.find_free(key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entry::FlowAction;
    use crate::ipv4::PROTO_TCP;

    fn small_table() -> FlowTable {
        FlowTable::new(&TableConfig {
            flow_entries: 64,
            oflow_entries: 8,
        })
        .unwrap()
    }

    fn key(n: u32) -> FlowKey {
        FlowKey::new(n, 0x0a000002, 1000, 80, PROTO_TCP, 1)
    }

    #[test]
    fn test_geometry_validation() {
        assert!(FlowTable::new(&TableConfig {
            flow_entries: 63,
            oflow_entries: 8
        })
        .is_err());
        assert!(FlowTable::new(&TableConfig {
            flow_entries: 0,
            oflow_entries: 8
        })
        .is_err());
        assert!(FlowTable::new(&TableConfig {
            flow_entries: 64,
            oflow_entries: 0
        })
        .is_err());
        assert!(FlowTable::new(&TableConfig::default()).is_ok());
    }

    #[test]
    fn test_find_free_then_find() {
        let t = small_table();
        let k = key(1);

        assert!(t.find(&k).is_none());
        let (e, index) = t.find_free(&k).unwrap();
        assert!(e.is_active());
        assert_eq!(e.key(), k);

        let (found, found_index) = t.find(&k).unwrap();
        assert_eq!(found_index, index);
        assert_eq!(found.key(), k);
    }

    #[test]
    fn test_bucket_fills_then_overflow() {
        let t = small_table();
        let k = key(42);

        // Same key claimed repeatedly exhausts its 4-slot bucket, then the
        // probe spills into the overflow tier.
        let mut indices = Vec::new();
        for _ in 0..6 {
            let (_, index) = t.find_free(&k).unwrap();
            indices.push(index);
        }

        let in_primary = indices.iter().filter(|&&i| (i as usize) < 64).count();
        let in_overflow = indices.iter().filter(|&&i| (i as usize) >= 64).count();
        assert_eq!(in_primary, FLOW_ENTRIES_PER_BUCKET);
        assert_eq!(in_overflow, 2);

        // lookup prefers the primary tier
        let (_, found) = t.find(&k).unwrap();
        assert!((found as usize) < 64);
    }

    #[test]
    fn test_table_full() {
        let t = FlowTable::new(&TableConfig {
            flow_entries: 4,
            oflow_entries: 2,
        })
        .unwrap();
        let k = key(7);

        for _ in 0..6 {
            assert!(t.find_free(&k).is_some());
        }
        assert!(t.find_free(&k).is_none());
    }

    #[test]
    fn test_virtual_index_translation() {
        let t = small_table();
        assert!(t.entry(-1).is_none());
        assert!(t.entry(0).is_some());
        assert!(t.entry(63).is_some());
        assert!(t.entry(64).is_some()); // first overflow slot
        assert!(t.entry(71).is_some());
        assert!(t.entry(72).is_none());
    }

    #[test]
    fn test_add_is_idempotent_per_key() {
        let t = small_table();
        let k = key(9);

        let (_, first) = t.add(&k).unwrap();
        let (_, second) = t.add(&k).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn test_va_spans_both_tiers() {
        let t = small_table();
        let entry_size = std::mem::size_of::<FlowEntry>();

        let p0 = t.va(0).unwrap();
        assert_eq!(p0, &t.primary[0] as *const FlowEntry);

        let p1 = t.va(entry_size).unwrap();
        assert_eq!(p1, &t.primary[1] as *const FlowEntry);

        let o0 = t.va(t.size_bytes()).unwrap();
        assert_eq!(o0, &t.overflow[0] as *const FlowEntry);

        assert!(t.va(t.size_bytes() + t.oflow_size_bytes()).is_none());
    }

    #[test]
    fn test_concurrent_distinct_claims() {
        use std::sync::Arc;
        use std::thread;

        let t = Arc::new(FlowTable::new(&TableConfig {
            flow_entries: 4096,
            oflow_entries: 64,
        })
        .unwrap());

        let mut handles = Vec::new();
        for thread_id in 0..4u32 {
            let t = t.clone();
            handles.push(thread::spawn(move || {
                let mut indices = Vec::new();
                for i in 0..256 {
                    let k = key(thread_id * 10_000 + i);
                    let (e, index) = t.find_free(&k).unwrap();
                    e.set_action(FlowAction::Hold);
                    indices.push(index);
                }
                indices
            }));
        }

        let mut all: Vec<u32> = handles
            .into_iter()
            .flat_map(|h| h.join().unwrap())
            .collect();
        all.sort_unstable();
        let before = all.len();
        all.dedup();
        // every claim won a distinct slot
        assert_eq!(all.len(), before);
        assert_eq!(before, 1024);
    }
}

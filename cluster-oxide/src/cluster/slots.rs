//! Slot table: which shard owns each of the 16384 hash slots
//!
//! A [`SlotTable`] is an immutable snapshot. Refreshes build a new table and
//! swap it in whole, so a reader always sees one consistent assignment.

use super::CLUSTER_SLOTS;
use cluster_oxide_core::types::{NodeAddress, NodeRole, SlotRange};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;

/// One node of a shard
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ShardNode {
    /// Reachable address (after address remapping)
    pub address: NodeAddress,
    /// Node id, when the server reported one
    pub id: Option<String>,
    /// Master or replica
    pub role: NodeRole,
}

impl ShardNode {
    /// A master node
    pub fn master(address: NodeAddress) -> Self {
        Self {
            address,
            id: None,
            role: NodeRole::Master,
        }
    }

    /// A replica node
    pub fn replica(address: NodeAddress) -> Self {
        Self {
            address,
            id: None,
            role: NodeRole::Replica,
        }
    }

    /// Attach the server-reported node id
    #[must_use]
    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.id = Some(id.into());
        self
    }
}

/// A master, its replicas and the slot ranges they serve
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Shard {
    /// The shard's master
    pub master: ShardNode,
    /// Replicas in the order the server listed them
    pub replicas: Vec<ShardNode>,
    /// Slot ranges owned by the shard
    pub ranges: Vec<SlotRange>,
}

impl Shard {
    /// Master first, then replicas
    pub fn nodes(&self) -> impl Iterator<Item = &ShardNode> {
        std::iter::once(&self.master).chain(self.replicas.iter())
    }

    /// Number of slots owned by the shard
    pub fn slot_count(&self) -> usize {
        self.ranges.iter().map(SlotRange::len).sum()
    }
}

/// One row of a topology reply: a range and the nodes serving it
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SlotAssignment {
    /// The slot range
    pub range: SlotRange,
    /// Master serving the range
    pub master: ShardNode,
    /// Replicas serving the range
    pub replicas: Vec<ShardNode>,
}

/// Immutable slot → shard mapping
#[derive(Debug, Clone)]
pub struct SlotTable {
    shards: Vec<Arc<Shard>>,
    slots: Box<[Option<u32>]>,
    by_address: HashMap<NodeAddress, usize>,
    epoch: u64,
}

impl SlotTable {
    /// A table with no shards; every slot is unassigned
    pub fn empty() -> Self {
        Self {
            shards: Vec::new(),
            slots: vec![None; CLUSTER_SLOTS as usize].into_boxed_slice(),
            by_address: HashMap::new(),
            epoch: 0,
        }
    }

    /// Build a table from topology rows.
    ///
    /// Rows with the same master address are merged into one shard. Shards
    /// keep the order in which their master first appears. When two rows
    /// claim the same slot the later row wins.
    pub fn from_assignments(assignments: Vec<SlotAssignment>, epoch: u64) -> Self {
        let mut shards: Vec<Shard> = Vec::new();
        let mut by_master: HashMap<NodeAddress, usize> = HashMap::new();
        let mut slots = vec![None; CLUSTER_SLOTS as usize].into_boxed_slice();

        for assignment in assignments {
            let index = *by_master
                .entry(assignment.master.address.clone())
                .or_insert_with(|| {
                    shards.push(Shard {
                        master: assignment.master.clone(),
                        replicas: Vec::new(),
                        ranges: Vec::new(),
                    });
                    shards.len() - 1
                });

            let shard = &mut shards[index];
            for replica in assignment.replicas {
                if !shard.replicas.iter().any(|r| r.address == replica.address) {
                    shard.replicas.push(replica);
                }
            }

            let end = assignment.range.end.min(CLUSTER_SLOTS - 1);
            if assignment.range.start > end {
                continue;
            }
            shard.ranges.push(SlotRange::new(assignment.range.start, end));
            for slot in assignment.range.start..=end {
                slots[slot as usize] = Some(index as u32);
            }
        }

        let mut by_address = HashMap::new();
        for (index, shard) in shards.iter().enumerate() {
            for node in shard.nodes() {
                by_address.entry(node.address.clone()).or_insert(index);
            }
        }

        Self {
            shards: shards.into_iter().map(Arc::new).collect(),
            slots,
            by_address,
            epoch,
        }
    }

    /// Topology version this table was installed with
    pub fn epoch(&self) -> u64 {
        self.epoch
    }

    /// The shard owning `slot`, if any
    pub fn shard_for_slot(&self, slot: u16) -> Option<&Arc<Shard>> {
        let index = (*self.slots.get(slot as usize)?)?;
        self.shards.get(index as usize)
    }

    /// Every shard, in discovery order
    pub fn all_shards(&self) -> &[Arc<Shard>] {
        &self.shards
    }

    /// Every master
    pub fn masters(&self) -> impl Iterator<Item = &ShardNode> {
        self.shards.iter().map(|s| &s.master)
    }

    /// Every replica
    pub fn replicas(&self) -> impl Iterator<Item = &ShardNode> {
        self.shards.iter().flat_map(|s| s.replicas.iter())
    }

    /// The shard a node belongs to
    pub fn shard_by_address(&self, address: &NodeAddress) -> Option<&Arc<Shard>> {
        self.shards.get(*self.by_address.get(address)?)
    }

    /// The node with this address
    pub fn node_by_address(&self, address: &NodeAddress) -> Option<&ShardNode> {
        self.shard_by_address(address)?
            .nodes()
            .find(|n| &n.address == address)
    }

    /// Every node address in the table
    pub fn addresses(&self) -> impl Iterator<Item = &NodeAddress> {
        self.by_address.keys()
    }

    /// True when the table knows this address
    pub fn contains_address(&self, address: &NodeAddress) -> bool {
        self.by_address.contains_key(address)
    }

    /// Number of slots that have an owner
    pub fn covered_slots(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }
}

impl Default for SlotTable {
    fn default() -> Self {
        Self::empty()
    }
}

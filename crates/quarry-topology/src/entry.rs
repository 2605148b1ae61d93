//! Entity records stored in the topology arenas

use quarry_common::{
    BrickId, ClusterFlags, ClusterId, DeviceId, DeviceState, Durability, NodeHostnames, NodeId,
    NodeState, VolumeId,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;

/// A cluster: the top-level grouping of nodes and volumes
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ClusterEntry {
    /// Cluster id
    pub id: ClusterId,
    /// Capability flags (external policy input)
    pub flags: ClusterFlags,
    /// Nodes registered under this cluster
    pub nodes: BTreeSet<NodeId>,
    /// Volumes placed in this cluster
    pub volumes: BTreeSet<VolumeId>,
}

impl ClusterEntry {
    /// A cluster may only be destroyed once it is empty
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty() && self.volumes.is_empty()
    }
}

/// A node: a host contributing devices to a cluster
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NodeEntry {
    /// Node id
    pub id: NodeId,
    /// Owning cluster
    pub cluster: ClusterId,
    /// Placement-spread zone
    pub zone: u32,
    /// Management and storage network identities
    pub hostnames: NodeHostnames,
    /// Operational state
    pub state: NodeState,
    /// Devices owned by this node
    pub devices: BTreeSet<DeviceId>,
}

/// A device: a physical disk with exact capacity accounting.
///
/// `used` is maintained as the sum of hosted brick sizes at every observable
/// point; `free()` is always `total - used`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DeviceEntry {
    /// Device id
    pub id: DeviceId,
    /// Owning node
    pub node: NodeId,
    /// Device name as known to the execution backend (e.g. "/dev/vdb")
    pub name: String,
    /// Lifecycle state
    pub state: DeviceState,
    /// Total capacity in bytes
    pub total: u64,
    /// Bytes consumed by hosted bricks
    pub used: u64,
    /// Bricks currently hosted
    pub bricks: BTreeSet<BrickId>,
}

impl DeviceEntry {
    /// Free capacity in bytes
    #[must_use]
    pub const fn free(&self) -> u64 {
        self.total.saturating_sub(self.used)
    }

    /// Whether the device may accept a new brick of `size` bytes
    #[must_use]
    pub fn can_host(&self, size: u64) -> bool {
        self.state == DeviceState::Online && self.free() >= size
    }
}

/// A brick: one physical storage extent backing part of a volume
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrickEntry {
    /// Brick id
    pub id: BrickId,
    /// Hosting device
    pub device: DeviceId,
    /// Owning volume
    pub volume: VolumeId,
    /// Index of the owning replica set within the volume
    pub set_index: usize,
    /// Brick size in bytes
    pub size: u64,
    /// Backend path of the brick, as reported by the execution backend
    pub path: String,
}

/// An ordered group of bricks holding identical data for one volume segment
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct ReplicaSet {
    /// Member bricks, each on a distinct device
    pub bricks: Vec<BrickId>,
}

impl ReplicaSet {
    /// Current member count
    #[must_use]
    pub fn width(&self) -> usize {
        self.bricks.len()
    }
}

/// A volume: a durability policy over an ordered collection of replica sets
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeEntry {
    /// Volume id
    pub id: VolumeId,
    /// Cluster the volume was placed in
    pub cluster: ClusterId,
    /// Total requested size in bytes
    pub size: u64,
    /// Size of each brick
    pub brick_size: u64,
    /// Current effective durability (may have been reduced by eviction)
    pub durability: Durability,
    /// Replica sets in order
    pub replica_sets: Vec<ReplicaSet>,
}

impl VolumeEntry {
    /// Iterate over every brick id of the volume
    pub fn brick_ids(&self) -> impl Iterator<Item = BrickId> + '_ {
        self.replica_sets.iter().flat_map(|s| s.bricks.iter().copied())
    }

    /// Width of the narrowest replica set, or 0 for a volume with no sets
    #[must_use]
    pub fn min_set_width(&self) -> usize {
        self.replica_sets.iter().map(ReplicaSet::width).min().unwrap_or(0)
    }
}

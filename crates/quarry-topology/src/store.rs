//! The topology store.
//!
//! Arena maps keyed by entity id, with child-id indices kept in lockstep.
//! All methods validate referential integrity before mutating, and multi-step
//! mutations (volume commit, brick replacement) validate fully before
//! applying so a failed call leaves the store untouched.

use crate::entry::{BrickEntry, ClusterEntry, DeviceEntry, NodeEntry, ReplicaSet, VolumeEntry};
use quarry_common::{
    BrickId, ClusterFlags, ClusterId, DeviceId, DeviceState, Durability, Error, NodeHostnames,
    NodeId, NodeState, Result, VolumeId,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashMap};

/// The authoritative graph of clusters, nodes, devices, volumes and bricks
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
pub struct Topology {
    clusters: HashMap<ClusterId, ClusterEntry>,
    nodes: HashMap<NodeId, NodeEntry>,
    devices: HashMap<DeviceId, DeviceEntry>,
    volumes: HashMap<VolumeId, VolumeEntry>,
    bricks: HashMap<BrickId, BrickEntry>,
}

impl Topology {
    /// Create an empty topology
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Point-in-time snapshot for read-side consumers
    #[must_use]
    pub fn snapshot(&self) -> Self {
        self.clone()
    }

    // ---- Clusters ----

    /// Register a new cluster
    pub fn add_cluster(&mut self, flags: ClusterFlags) -> ClusterId {
        let id = ClusterId::new();
        self.clusters.insert(
            id,
            ClusterEntry {
                id,
                flags,
                nodes: BTreeSet::new(),
                volumes: BTreeSet::new(),
            },
        );
        id
    }

    /// Look up a cluster
    pub fn cluster(&self, id: ClusterId) -> Result<&ClusterEntry> {
        self.clusters.get(&id).ok_or(Error::ClusterNotFound(id))
    }

    /// Cluster ids in stable order
    #[must_use]
    pub fn cluster_ids(&self) -> Vec<ClusterId> {
        let mut ids: Vec<_> = self.clusters.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Unregister a cluster; it must hold no nodes and no volumes
    pub fn remove_cluster(&mut self, id: ClusterId) -> Result<()> {
        let cluster = self.cluster(id)?;
        if !cluster.is_empty() {
            return Err(Error::conflict(format!(
                "cluster {id} still has {} node(s) and {} volume(s)",
                cluster.nodes.len(),
                cluster.volumes.len()
            )));
        }
        self.clusters.remove(&id);
        Ok(())
    }

    // ---- Nodes ----

    /// Register a node under an existing cluster
    pub fn add_node(
        &mut self,
        cluster: ClusterId,
        zone: u32,
        hostnames: NodeHostnames,
    ) -> Result<NodeId> {
        if !self.clusters.contains_key(&cluster) {
            return Err(Error::ClusterNotFound(cluster));
        }
        let id = NodeId::new();
        self.nodes.insert(
            id,
            NodeEntry {
                id,
                cluster,
                zone,
                hostnames,
                state: NodeState::Online,
                devices: BTreeSet::new(),
            },
        );
        self.clusters
            .get_mut(&cluster)
            .expect("cluster checked above")
            .nodes
            .insert(id);
        Ok(id)
    }

    /// Look up a node
    pub fn node(&self, id: NodeId) -> Result<&NodeEntry> {
        self.nodes.get(&id).ok_or(Error::NodeNotFound(id))
    }

    /// Set a node's operational state
    pub fn set_node_state(&mut self, id: NodeId, state: NodeState) -> Result<()> {
        let node = self.nodes.get_mut(&id).ok_or(Error::NodeNotFound(id))?;
        node.state = state;
        Ok(())
    }

    /// Unregister a node; it must own no devices
    pub fn remove_node(&mut self, id: NodeId) -> Result<()> {
        let node = self.node(id)?;
        if !node.devices.is_empty() {
            return Err(Error::conflict(format!(
                "node {id} still owns {} device(s)",
                node.devices.len()
            )));
        }
        let cluster = node.cluster;
        self.nodes.remove(&id);
        if let Some(cluster) = self.clusters.get_mut(&cluster) {
            cluster.nodes.remove(&id);
        }
        Ok(())
    }

    // ---- Devices ----

    /// Register a device under an existing, online node
    pub fn add_device(&mut self, node: NodeId, name: String, total: u64) -> Result<DeviceId> {
        let owner = self.node(node)?;
        if owner.state != NodeState::Online {
            return Err(Error::conflict(format!(
                "node {node} is offline; devices can only be added to online nodes"
            )));
        }
        let id = DeviceId::new();
        self.devices.insert(
            id,
            DeviceEntry {
                id,
                node,
                name,
                state: DeviceState::Online,
                total,
                used: 0,
                bricks: BTreeSet::new(),
            },
        );
        self.nodes
            .get_mut(&node)
            .expect("node checked above")
            .devices
            .insert(id);
        Ok(id)
    }

    /// Look up a device
    pub fn device(&self, id: DeviceId) -> Result<&DeviceEntry> {
        self.devices.get(&id).ok_or(Error::DeviceNotFound(id))
    }

    /// Set a device's lifecycle state.
    ///
    /// Transition legality is the lifecycle state machine's concern; the
    /// store only records the result.
    pub fn set_device_state(&mut self, id: DeviceId, state: DeviceState) -> Result<()> {
        let device = self.devices.get_mut(&id).ok_or(Error::DeviceNotFound(id))?;
        device.state = state;
        Ok(())
    }

    /// Unregister a device; it must host no bricks
    pub fn remove_device(&mut self, id: DeviceId) -> Result<()> {
        let device = self.device(id)?;
        if !device.bricks.is_empty() {
            return Err(Error::conflict(format!(
                "device {id} still hosts {} brick(s)",
                device.bricks.len()
            )));
        }
        let node = device.node;
        self.devices.remove(&id);
        if let Some(node) = self.nodes.get_mut(&node) {
            node.devices.remove(&id);
        }
        Ok(())
    }

    /// Devices of a cluster paired with their owning node, in stable order
    pub fn cluster_devices(&self, cluster: ClusterId) -> Result<Vec<(&NodeEntry, &DeviceEntry)>> {
        let cluster = self.cluster(cluster)?;
        let mut out = Vec::new();
        for node_id in &cluster.nodes {
            let node = &self.nodes[node_id];
            for device_id in &node.devices {
                out.push((node, &self.devices[device_id]));
            }
        }
        Ok(out)
    }

    /// Free bytes across a cluster's online devices
    pub fn free_capacity(&self, cluster: ClusterId) -> Result<u64> {
        Ok(self
            .cluster_devices(cluster)?
            .iter()
            .filter(|(_, d)| d.state == DeviceState::Online)
            .map(|(_, d)| d.free())
            .sum())
    }

    // ---- Volumes and bricks ----

    /// Look up a volume
    pub fn volume(&self, id: VolumeId) -> Result<&VolumeEntry> {
        self.volumes.get(&id).ok_or(Error::VolumeNotFound(id))
    }

    /// Volume ids in stable order
    #[must_use]
    pub fn volume_ids(&self) -> Vec<VolumeId> {
        let mut ids: Vec<_> = self.volumes.keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    /// Look up a brick
    pub fn brick(&self, id: BrickId) -> Result<&BrickEntry> {
        self.bricks.get(&id).ok_or(Error::BrickNotFound(id))
    }

    /// Bricks currently hosted by a device
    pub fn bricks_on_device(&self, id: DeviceId) -> Result<Vec<BrickEntry>> {
        let device = self.device(id)?;
        Ok(device
            .bricks
            .iter()
            .map(|b| self.bricks[b].clone())
            .collect())
    }

    /// Commit a fully planned volume: the volume entry plus every brick, as
    /// one atomic unit. Capacity and placement eligibility are re-verified
    /// here against committed state; on any failure nothing is applied.
    pub fn commit_volume(&mut self, volume: VolumeEntry, bricks: Vec<BrickEntry>) -> Result<()> {
        if self.volumes.contains_key(&volume.id) {
            return Err(Error::conflict(format!(
                "volume {} already exists",
                volume.id
            )));
        }
        if !self.clusters.contains_key(&volume.cluster) {
            return Err(Error::ClusterNotFound(volume.cluster));
        }
        let set_ids: BTreeSet<BrickId> = volume.brick_ids().collect();
        let brick_ids: BTreeSet<BrickId> = bricks.iter().map(|b| b.id).collect();
        if set_ids != brick_ids || brick_ids.len() != bricks.len() {
            return Err(Error::validation(
                "volume replica sets and brick list disagree",
            ));
        }
        self.check_brick_load(&bricks)?;

        for brick in bricks {
            let device = self
                .devices
                .get_mut(&brick.device)
                .expect("verified by check_brick_load");
            device.used += brick.size;
            device.bricks.insert(brick.id);
            self.bricks.insert(brick.id, brick);
        }
        self.clusters
            .get_mut(&volume.cluster)
            .expect("cluster checked above")
            .volumes
            .insert(volume.id);
        self.volumes.insert(volume.id, volume);
        Ok(())
    }

    /// Append planned replica sets to an existing volume (expansion), with
    /// the same validate-then-apply contract as [`Self::commit_volume`].
    pub fn commit_expansion(
        &mut self,
        volume: VolumeId,
        added_size: u64,
        sets: Vec<ReplicaSet>,
        bricks: Vec<BrickEntry>,
    ) -> Result<()> {
        if !self.volumes.contains_key(&volume) {
            return Err(Error::VolumeNotFound(volume));
        }
        let set_ids: BTreeSet<BrickId> = sets
            .iter()
            .flat_map(|s| s.bricks.iter().copied())
            .collect();
        let brick_ids: BTreeSet<BrickId> = bricks.iter().map(|b| b.id).collect();
        if set_ids != brick_ids || brick_ids.len() != bricks.len() {
            return Err(Error::validation(
                "expansion replica sets and brick list disagree",
            ));
        }
        self.check_brick_load(&bricks)?;

        for brick in bricks {
            let device = self
                .devices
                .get_mut(&brick.device)
                .expect("verified by check_brick_load");
            device.used += brick.size;
            device.bricks.insert(brick.id);
            self.bricks.insert(brick.id, brick);
        }
        let entry = self.volumes.get_mut(&volume).expect("volume checked above");
        entry.size += added_size;
        entry.replica_sets.extend(sets);
        Ok(())
    }

    /// Verify every brick in `load` fits on its (existing, online) device,
    /// accounting for other bricks in the same load.
    fn check_brick_load(&self, load: &[BrickEntry]) -> Result<()> {
        let mut pending: HashMap<DeviceId, u64> = HashMap::new();
        for brick in load {
            if self.bricks.contains_key(&brick.id) {
                return Err(Error::conflict(format!("brick {} already exists", brick.id)));
            }
            let device = self.device(brick.device)?;
            let claimed = pending.entry(brick.device).or_insert(0);
            if device.state != DeviceState::Online || device.free() < *claimed + brick.size {
                return Err(Error::Capacity {
                    requested: brick.size,
                    available: device.free().saturating_sub(*claimed),
                });
            }
            *claimed += brick.size;
        }
        Ok(())
    }

    /// Destroy a volume, freeing every brick it owns and restoring capacity
    /// on every device that held them.
    pub fn remove_volume(&mut self, id: VolumeId) -> Result<VolumeEntry> {
        let volume = self.volume(id)?.clone();
        for brick_id in volume.brick_ids() {
            let brick = self
                .bricks
                .remove(&brick_id)
                .expect("volume set members exist in the brick arena");
            if let Some(device) = self.devices.get_mut(&brick.device) {
                device.used -= brick.size;
                device.bricks.remove(&brick_id);
            }
        }
        if let Some(cluster) = self.clusters.get_mut(&volume.cluster) {
            cluster.volumes.remove(&id);
        }
        self.volumes.remove(&id);
        Ok(volume)
    }

    /// Swap one replica-set member for a replacement brick: the new brick is
    /// inserted, membership updated in place, the old brick removed and both
    /// devices' capacity adjusted, all in one unit.
    pub fn replace_brick(&mut self, old: BrickId, new: BrickEntry) -> Result<()> {
        let old_entry = self.brick(old)?.clone();
        if old_entry.volume != new.volume || old_entry.set_index != new.set_index {
            return Err(Error::validation(
                "replacement brick belongs to a different replica set",
            ));
        }
        {
            let device = self.device(new.device)?;
            if !device.can_host(new.size) {
                return Err(Error::Capacity {
                    requested: new.size,
                    available: device.free(),
                });
            }
        }

        let device = self
            .devices
            .get_mut(&new.device)
            .expect("device checked above");
        device.used += new.size;
        device.bricks.insert(new.id);

        let volume = self
            .volumes
            .get_mut(&old_entry.volume)
            .expect("brick owner exists");
        let set = &mut volume.replica_sets[old_entry.set_index];
        let position = set
            .bricks
            .iter()
            .position(|b| *b == old)
            .expect("old brick is a member of its set");
        set.bricks[position] = new.id;

        if let Some(device) = self.devices.get_mut(&old_entry.device) {
            device.used -= old_entry.size;
            device.bricks.remove(&old);
        }
        self.bricks.remove(&old);
        self.bricks.insert(new.id, new);
        Ok(())
    }

    /// Remove a brick from its replica set (degradation), restoring capacity
    /// on the hosting device. The caller updates the volume's reported
    /// durability afterwards.
    pub fn remove_brick(&mut self, id: BrickId) -> Result<()> {
        let brick = self.brick(id)?.clone();
        if let Some(device) = self.devices.get_mut(&brick.device) {
            device.used -= brick.size;
            device.bricks.remove(&id);
        }
        let volume = self
            .volumes
            .get_mut(&brick.volume)
            .expect("brick owner exists");
        volume.replica_sets[brick.set_index].bricks.retain(|b| *b != id);
        self.bricks.remove(&id);
        Ok(())
    }

    /// Update a volume's reported durability
    pub fn set_volume_durability(&mut self, id: VolumeId, durability: Durability) -> Result<()> {
        let volume = self.volumes.get_mut(&id).ok_or(Error::VolumeNotFound(id))?;
        volume.durability = durability;
        Ok(())
    }

    /// Verify the store's structural invariants. Intended for tests and
    /// debug assertions; a healthy store always passes.
    pub fn check_invariants(&self) -> Result<()> {
        for device in self.devices.values() {
            let hosted: u64 = device.bricks.iter().map(|b| self.bricks[b].size).sum();
            if hosted != device.used {
                return Err(Error::validation(format!(
                    "device {}: used {} != hosted {}",
                    device.id, device.used, hosted
                )));
            }
            if device.used > device.total {
                return Err(Error::validation(format!(
                    "device {} overcommitted: {} > {}",
                    device.id, device.used, device.total
                )));
            }
            if device.state == DeviceState::Failed && !device.bricks.is_empty() {
                return Err(Error::validation(format!(
                    "failed device {} still hosts bricks",
                    device.id
                )));
            }
        }
        for volume in self.volumes.values() {
            for set in &volume.replica_sets {
                let devices: BTreeSet<DeviceId> =
                    set.bricks.iter().map(|b| self.bricks[b].device).collect();
                if devices.len() != set.bricks.len() {
                    return Err(Error::validation(format!(
                        "volume {}: replica set places two bricks on one device",
                        volume.id
                    )));
                }
            }
        }
        Ok(())
    }
}

//! The engine facade
//!
//! Async entry points consumed by the request layer: cluster/node/device
//! CRUD, volume planning and deletion, device lifecycle transitions and node
//! removal. Operations on one device or one volume serialize on keyed locks;
//! fan-outs across independent devices run concurrently and report every
//! result.

use crate::executor::{BrickExecutor, BrickSpec};
use crate::lifecycle::{self, Transition};
use crate::planner::{self, VolumePlan, VolumeRequest};
use dashmap::DashMap;
use futures::future::join_all;
use parking_lot::RwLock;
use quarry_common::{
    BrickId, ClusterFlags, ClusterId, DeviceId, DeviceState, Durability, EngineConfig, Error,
    NodeHostnames, NodeId, NodeState, Result, VolumeId,
};
use quarry_topology::{BrickEntry, ClusterEntry, DeviceEntry, NodeEntry, Topology};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// One brick of a volume layout, as reported to callers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrickInfo {
    /// Brick id
    pub id: BrickId,
    /// Hosting device
    pub device: DeviceId,
    /// Node owning the device
    pub node: NodeId,
    /// Brick size in bytes
    pub size: u64,
    /// Backend path
    pub path: String,
}

/// A volume layout, as reported to callers
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct VolumeInfo {
    /// Volume id
    pub id: VolumeId,
    /// Cluster the volume lives in
    pub cluster: ClusterId,
    /// Usable size in bytes
    pub size: u64,
    /// Brick size in bytes
    pub brick_size: u64,
    /// Current effective durability
    pub durability: Durability,
    /// Replica sets in order, each a list of member bricks
    pub replica_sets: Vec<Vec<BrickInfo>>,
}

impl VolumeInfo {
    /// Every brick of the volume, across all replica sets
    pub fn bricks(&self) -> impl Iterator<Item = &BrickInfo> {
        self.replica_sets.iter().flatten()
    }
}

/// The orchestration engine: topology, allocator and lifecycle glue
pub struct Engine {
    pub(crate) topology: RwLock<Topology>,
    pub(crate) executor: Arc<dyn BrickExecutor>,
    pub(crate) config: EngineConfig,
    device_locks: DashMap<DeviceId, Arc<Mutex<()>>>,
    volume_locks: DashMap<VolumeId, Arc<Mutex<()>>>,
    /// Serializes volume planning so two plans cannot book the same free space
    planning_lock: Mutex<()>,
}

impl Engine {
    /// Create an engine over an empty topology
    #[must_use]
    pub fn new(executor: Arc<dyn BrickExecutor>, config: EngineConfig) -> Self {
        Self {
            topology: RwLock::new(Topology::new()),
            executor,
            config,
            device_locks: DashMap::new(),
            volume_locks: DashMap::new(),
            planning_lock: Mutex::new(()),
        }
    }

    /// Point-in-time snapshot of the whole topology
    #[must_use]
    pub fn snapshot(&self) -> Topology {
        self.topology.read().snapshot()
    }

    pub(crate) fn device_lock(&self, id: DeviceId) -> Arc<Mutex<()>> {
        self.device_locks.entry(id).or_default().clone()
    }

    pub(crate) fn volume_lock(&self, id: VolumeId) -> Arc<Mutex<()>> {
        self.volume_locks.entry(id).or_default().clone()
    }

    // ---- Cluster / node / device CRUD ----

    /// Register a cluster
    pub fn create_cluster(&self, flags: ClusterFlags) -> ClusterId {
        let id = self.topology.write().add_cluster(flags);
        info!(cluster = %id, ?flags, "cluster created");
        id
    }

    /// Unregister a cluster; fails while nodes or volumes remain
    pub fn delete_cluster(&self, id: ClusterId) -> Result<()> {
        self.topology.write().remove_cluster(id)?;
        info!(cluster = %id, "cluster deleted");
        Ok(())
    }

    /// Register a node under a cluster
    pub fn add_node(
        &self,
        cluster: ClusterId,
        zone: u32,
        hostnames: NodeHostnames,
    ) -> Result<NodeId> {
        let id = self.topology.write().add_node(cluster, zone, hostnames)?;
        info!(cluster = %cluster, node = %id, zone, "node added");
        Ok(id)
    }

    /// Toggle a node online/offline
    pub fn set_node_state(&self, node: NodeId, state: NodeState) -> Result<()> {
        self.topology.write().set_node_state(node, state)?;
        info!(node = %node, ?state, "node state changed");
        Ok(())
    }

    /// Unregister a node; fails while it owns devices. See
    /// [`Self::remove_node`] for the evacuating variant.
    pub fn delete_node(&self, node: NodeId) -> Result<()> {
        self.topology.write().remove_node(node)?;
        info!(node = %node, "node deleted");
        Ok(())
    }

    /// Register a device under an online node
    pub fn add_device(&self, node: NodeId, name: String, capacity: u64) -> Result<DeviceId> {
        let id = self.topology.write().add_device(node, name, capacity)?;
        info!(node = %node, device = %id, capacity, "device added");
        Ok(id)
    }

    /// Unregister a failed, fully evacuated device
    pub async fn delete_device(&self, device: DeviceId) -> Result<()> {
        let lock = self.device_lock(device);
        let _guard = lock.lock().await;

        let state = self.topology.read().device(device)?.state;
        if state != DeviceState::Failed {
            return Err(Error::conflict(format!(
                "device {device} is {state}; only failed devices can be deleted"
            )));
        }
        self.topology.write().remove_device(device)?;
        self.device_locks.remove(&device);
        info!(device = %device, "device deleted");
        Ok(())
    }

    // ---- Read side ----

    /// Cluster details
    pub fn cluster_info(&self, id: ClusterId) -> Result<ClusterEntry> {
        self.topology.read().cluster(id).map(Clone::clone)
    }

    /// Node details
    pub fn node_info(&self, id: NodeId) -> Result<NodeEntry> {
        self.topology.read().node(id).map(Clone::clone)
    }

    /// Device details
    pub fn device_info(&self, id: DeviceId) -> Result<DeviceEntry> {
        self.topology.read().device(id).map(Clone::clone)
    }

    /// Volume layout
    pub fn volume_info(&self, id: VolumeId) -> Result<VolumeInfo> {
        build_volume_info(&self.topology.read(), id)
    }

    /// Registered cluster ids, in stable order
    #[must_use]
    pub fn list_clusters(&self) -> Vec<ClusterId> {
        self.topology.read().cluster_ids()
    }

    /// Registered volume ids, in stable order
    #[must_use]
    pub fn list_volumes(&self) -> Vec<VolumeId> {
        self.topology.read().volume_ids()
    }

    // ---- Volumes ----

    /// Create a volume: plan placements, provision bricks on the backend,
    /// commit atomically. Fails all-or-nothing; a partial volume is never
    /// left visible.
    pub async fn create_volume(&self, request: &VolumeRequest) -> Result<VolumeInfo> {
        planner::validate_request(request)?;
        let _planning = self.planning_lock.lock().await;

        let snapshot = self.topology.read().snapshot();
        let clusters = if request.clusters.is_empty() {
            snapshot.cluster_ids()
        } else {
            for cluster in &request.clusters {
                snapshot.cluster(*cluster)?;
            }
            request.clusters.clone()
        };

        let mut last_error = Error::Capacity {
            requested: request.size,
            available: 0,
        };
        for cluster in clusters {
            match planner::plan_volume(&snapshot, cluster, request, &self.config.brick) {
                Ok(plan) => return self.realize_volume(plan).await,
                Err(error) => {
                    debug!(cluster = %cluster, %error, "cluster cannot host volume");
                    last_error = error;
                }
            }
        }
        Err(last_error)
    }

    /// Provision a plan's bricks and commit the volume
    async fn realize_volume(&self, mut plan: VolumePlan) -> Result<VolumeInfo> {
        let specs: Vec<BrickSpec> = plan
            .bricks
            .iter()
            .map(|b| brick_spec(&b.entry, b.node))
            .collect();

        let results = join_all(specs.iter().map(|s| self.executor.create_brick(s))).await;
        let mut paths = Vec::with_capacity(results.len());
        let mut failure = None;
        for (spec, result) in specs.iter().zip(results) {
            match result {
                Ok(path) => paths.push((spec.brick, path)),
                Err(error) => {
                    failure.get_or_insert(error);
                }
            }
        }
        if let Some(error) = failure {
            self.scrap_bricks(&specs, &paths).await;
            return Err(error);
        }
        for (planned, (_, path)) in plan.bricks.iter_mut().zip(paths.iter()) {
            planned.entry.path = path.clone();
        }

        let volume = plan.volume.clone();
        let entries: Vec<BrickEntry> = plan.bricks.iter().map(|b| b.entry.clone()).collect();
        if let Err(error) = self.topology.write().commit_volume(volume, entries) {
            // committed state changed underneath the plan; undo the backend work
            self.scrap_bricks(&specs, &paths).await;
            return Err(error);
        }

        info!(
            volume = %plan.volume.id,
            size = plan.volume.size,
            durability = %plan.volume.durability,
            sets = plan.volume.replica_sets.len(),
            "volume created"
        );
        self.volume_info(plan.volume.id)
    }

    /// Best-effort destruction of provisioned bricks after a failed create
    async fn scrap_bricks(&self, specs: &[BrickSpec], created: &[(BrickId, String)]) {
        let doomed: Vec<&BrickSpec> = specs
            .iter()
            .filter(|s| created.iter().any(|(id, _)| *id == s.brick))
            .collect();
        for (spec, result) in doomed
            .iter()
            .zip(join_all(doomed.iter().map(|s| self.executor.delete_brick(s))).await)
        {
            if let Err(error) = result {
                warn!(brick = %spec.brick, %error, "failed to scrap provisional brick");
            }
        }
    }

    /// Grow a volume by at least `delta` bytes by appending replica sets
    pub async fn expand_volume(&self, id: VolumeId, delta: u64) -> Result<VolumeInfo> {
        if delta == 0 {
            return Err(Error::validation("expansion size must be greater than zero"));
        }
        let lock = self.volume_lock(id);
        let _guard = lock.lock().await;
        let _planning = self.planning_lock.lock().await;

        let snapshot = self.topology.read().snapshot();
        let volume = snapshot.volume(id)?.clone();
        let (added_size, sets, bricks) = planner::plan_expansion(&snapshot, &volume, delta)?;

        let specs: Vec<BrickSpec> = bricks.iter().map(|b| brick_spec(&b.entry, b.node)).collect();
        let results = join_all(specs.iter().map(|s| self.executor.create_brick(s))).await;
        let mut paths = Vec::with_capacity(results.len());
        let mut failure = None;
        for (spec, result) in specs.iter().zip(results) {
            match result {
                Ok(path) => paths.push((spec.brick, path)),
                Err(error) => {
                    failure.get_or_insert(error);
                }
            }
        }
        if let Some(error) = failure {
            self.scrap_bricks(&specs, &paths).await;
            return Err(error);
        }

        let mut entries: Vec<BrickEntry> = bricks.into_iter().map(|b| b.entry).collect();
        for entry in &mut entries {
            if let Some((_, path)) = paths.iter().find(|(id, _)| *id == entry.id) {
                entry.path = path.clone();
            }
        }
        if let Err(error) = self
            .topology
            .write()
            .commit_expansion(id, added_size, sets, entries)
        {
            self.scrap_bricks(&specs, &paths).await;
            return Err(error);
        }

        info!(volume = %id, added = added_size, "volume expanded");
        self.volume_info(id)
    }

    /// Destroy a volume, releasing every brick and its capacity
    pub async fn delete_volume(&self, id: VolumeId) -> Result<()> {
        let lock = self.volume_lock(id);
        let _guard = lock.lock().await;

        let specs: Vec<BrickSpec> = {
            let topology = self.topology.read();
            let volume = topology.volume(id)?;
            volume
                .brick_ids()
                .map(|brick| {
                    let entry = topology.brick(brick)?;
                    let device = topology.device(entry.device)?;
                    Ok(brick_spec(entry, device.node))
                })
                .collect::<Result<_>>()?
        };

        for result in join_all(specs.iter().map(|s| self.executor.delete_brick(s))).await {
            result?;
        }

        self.topology.write().remove_volume(id)?;
        self.volume_locks.remove(&id);
        info!(volume = %id, bricks = specs.len(), "volume deleted");
        Ok(())
    }

    // ---- Device lifecycle ----

    /// Drive a device through its lifecycle. Offline→Failed triggers the
    /// eviction engine and only succeeds if every hosted brick is replaced
    /// or degraded under policy.
    pub async fn set_device_state(&self, device: DeviceId, target: DeviceState) -> Result<()> {
        let lock = self.device_lock(device);
        let _guard = lock.lock().await;

        let current = self.topology.read().device(device)?.state;
        match lifecycle::classify(current, target)? {
            Transition::Noop => Ok(()),
            Transition::Apply => {
                self.topology.write().set_device_state(device, target)?;
                info!(device = %device, from = %current, to = %target, "device state changed");
                Ok(())
            }
            Transition::Evict => self.evict_and_fail(device).await,
        }
    }

    // ---- Node removal ----

    /// Remove a node by evacuating and deleting every one of its devices
    /// concurrently. All device results are collected; the node is removed
    /// only if every device reached deletion. Devices already deleted by an
    /// earlier attempt are simply no longer listed, so retries converge.
    pub async fn remove_node(&self, node: NodeId) -> Result<()> {
        let devices: Vec<DeviceId> = self
            .topology
            .read()
            .node(node)?
            .devices
            .iter()
            .copied()
            .collect();
        info!(node = %node, devices = devices.len(), "node removal started");

        let results = join_all(devices.iter().map(|device| {
            let device = *device;
            async move { (device, self.evacuate_device(device).await) }
        }))
        .await;

        let failures: Vec<(DeviceId, Box<Error>)> = results
            .into_iter()
            .filter_map(|(device, result)| result.err().map(|e| (device, Box::new(e))))
            .collect();
        if !failures.is_empty() {
            warn!(node = %node, failed = failures.len(), "node removal incomplete");
            return Err(Error::Fanout {
                attempted: devices.len(),
                failures,
            });
        }

        self.topology.write().remove_node(node)?;
        info!(node = %node, "node removed");
        Ok(())
    }

    /// Offline → Failed → Deleted for one device
    async fn evacuate_device(&self, device: DeviceId) -> Result<()> {
        self.set_device_state(device, DeviceState::Offline).await?;
        self.set_device_state(device, DeviceState::Failed).await?;
        self.delete_device(device).await
    }
}

/// Backend addressing for one brick entry
pub(crate) fn brick_spec(entry: &BrickEntry, node: NodeId) -> BrickSpec {
    BrickSpec {
        brick: entry.id,
        volume: entry.volume,
        device: entry.device,
        node,
        size: entry.size,
    }
}

/// Assemble the caller-facing layout of a volume
pub(crate) fn build_volume_info(topology: &Topology, id: VolumeId) -> Result<VolumeInfo> {
    let volume = topology.volume(id)?;
    let mut replica_sets = Vec::with_capacity(volume.replica_sets.len());
    for set in &volume.replica_sets {
        let mut members = Vec::with_capacity(set.bricks.len());
        for brick_id in &set.bricks {
            let brick = topology.brick(*brick_id)?;
            let device = topology.device(brick.device)?;
            members.push(BrickInfo {
                id: brick.id,
                device: brick.device,
                node: device.node,
                size: brick.size,
                path: brick.path.clone(),
            });
        }
        replica_sets.push(members);
    }
    Ok(VolumeInfo {
        id: volume.id,
        cluster: volume.cluster,
        size: volume.size,
        brick_size: volume.brick_size,
        durability: volume.durability,
        replica_sets,
    })
}

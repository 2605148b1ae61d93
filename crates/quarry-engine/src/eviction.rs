//! Brick eviction and replacement
//!
//! Runs once per device during its Offline→Failed transition, over the set
//! of bricks the device hosts at that moment. Every brick is first resolved
//! against a snapshot (a replacement placement, or a replica-count
//! degradation where policy allows) and only then is the backend asked to
//! provision and migrate. Membership swaps, degradations, durability
//! reductions and the device's Failed state all commit in one store section,
//! so no partial eviction is ever visible. Any unresolved brick rejects the
//! whole transition and the device stays offline with its bricks unchanged.

use crate::engine::{Engine, brick_spec};
use crate::planner;
use quarry_common::{
    BrickId, DeviceId, DeviceState, Durability, EngineConfig, Error, NodeId, Result, VolumeId,
};
use quarry_placement::{DeviceCandidate, PlacementRequest, rank};
use quarry_topology::{BrickEntry, Topology};
use std::collections::HashMap;
use tracing::{info, warn};

/// How one brick stranded on a failing device gets resolved
#[derive(Clone, Debug)]
pub(crate) enum Resolution {
    /// Move the replica to a new device
    Replace {
        old: BrickEntry,
        /// Width of the owning replica set at planning time
        set_width: usize,
        /// Ranked replacement targets, siblings' nodes already excluded
        candidates: Vec<DeviceCandidate>,
        /// Current position in `candidates`
        cursor: usize,
        /// Backend-provisioned replacement awaiting commit, with its node
        created: Option<(BrickEntry, NodeId)>,
    },
    /// Drop the replica, shrinking its set by one
    Degrade { old: BrickEntry },
}

impl Resolution {
    fn old(&self) -> &BrickEntry {
        match self {
            Self::Replace { old, .. } | Self::Degrade { old } => old,
        }
    }
}

/// Resolve every brick on `device` against a snapshot.
///
/// A replacement must not land on a device or node used by a live
/// sibling of the same replica set; the node rule is what forces degradation
/// when the only free space left sits next to existing replicas. If neither
/// replacement nor degradation is possible for any single brick, the whole
/// plan fails.
pub(crate) fn plan_device_eviction(
    snapshot: &Topology,
    config: &EngineConfig,
    device: DeviceId,
) -> Result<Vec<Resolution>> {
    let entry = snapshot.device(device)?;
    let cluster = snapshot.node(entry.node)?.cluster;
    let bricks = snapshot.bricks_on_device(device)?;
    let mut pool = planner::build_pool(snapshot, cluster)?;
    let mut resolutions = Vec::with_capacity(bricks.len());

    for brick in bricks {
        let volume = snapshot.volume(brick.volume)?;
        let set = &volume.replica_sets[brick.set_index];

        let mut sibling_devices = Vec::with_capacity(set.width());
        let mut sibling_nodes = Vec::with_capacity(set.width());
        let mut sibling_zones = Vec::with_capacity(set.width());
        for sibling in set.bricks.iter().filter(|b| **b != brick.id) {
            let sibling_entry = snapshot.brick(*sibling)?;
            let sibling_node = snapshot.node(snapshot.device(sibling_entry.device)?.node)?;
            sibling_devices.push(sibling_entry.device);
            sibling_nodes.push(sibling_node.id);
            sibling_zones.push(sibling_node.zone);
        }

        let placement = rank(
            &pool,
            &PlacementRequest {
                volume: volume.id,
                set_index: brick.set_index as u32,
                brick_size: brick.size,
                needed: 1,
                exclude_devices: &sibling_devices,
                used_nodes: &sibling_nodes,
                used_zones: &sibling_zones,
            },
        );
        let candidates: Vec<DeviceCandidate> = placement
            .candidates()
            .iter()
            .filter(|c| !sibling_nodes.contains(&c.node))
            .cloned()
            .collect();

        let set_width = set.width();
        if let Some(first) = candidates.first() {
            planner::reserve(&mut pool, first.device, brick.size);
            resolutions.push(Resolution::Replace {
                old: brick,
                set_width,
                candidates,
                cursor: 0,
                created: None,
            });
        } else if may_degrade(set_width, config) {
            resolutions.push(Resolution::Degrade { old: brick });
        } else {
            return Err(Error::brick_removal_not_permitted());
        }
    }
    Ok(resolutions)
}

/// Whether a set of `width` members may lose one under the configured floor
fn may_degrade(width: usize, config: &EngineConfig) -> bool {
    width >= 2 && u8::try_from(width - 1).unwrap_or(u8::MAX) >= config.replica_floor
}

/// Commit every resolution plus the device's Failed state in one section.
///
/// Validates capacity on every target first, since concurrent committers may
/// have consumed it since planning, and returns the index of the first
/// conflicting resolution instead of applying anything.
fn try_commit(
    store: &mut Topology,
    device: DeviceId,
    resolutions: &[Resolution],
) -> std::result::Result<(), usize> {
    let mut pending: HashMap<DeviceId, u64> = HashMap::new();
    for (index, resolution) in resolutions.iter().enumerate() {
        if let Resolution::Replace {
            created: Some((entry, _)), ..
        } = resolution
        {
            let claimed = pending.entry(entry.device).or_insert(0);
            match store.device(entry.device) {
                Ok(target) if target.can_host(*claimed + entry.size) => *claimed += entry.size,
                _ => return Err(index),
            }
        }
    }

    for resolution in resolutions {
        match resolution {
            Resolution::Replace {
                old,
                created: Some((entry, _)),
                ..
            } => {
                store
                    .replace_brick(old.id, entry.clone())
                    .expect("replacement validated against this store state");
            }
            Resolution::Replace { created: None, .. } => {
                unreachable!("every replacement is provisioned before commit")
            }
            Resolution::Degrade { old } => {
                store
                    .remove_brick(old.id)
                    .expect("degraded brick exists under the volume lock");
            }
        }
    }

    let mut volumes: Vec<VolumeId> = resolutions.iter().map(|r| r.old().volume).collect();
    volumes.sort_unstable();
    volumes.dedup();
    for volume in volumes {
        let entry = store.volume(volume).expect("volume held under lock");
        let width = u8::try_from(entry.min_set_width()).unwrap_or(u8::MAX);
        if width < entry.durability.replica_count() {
            let reduced = Durability::reduced_to(width);
            info!(volume = %volume, durability = %reduced, "volume durability reduced");
            store
                .set_volume_durability(volume, reduced)
                .expect("volume held under lock");
        }
    }

    store
        .set_device_state(device, DeviceState::Failed)
        .expect("device held under lock");
    Ok(())
}

impl Engine {
    /// Evict every brick from an offline device and mark it failed.
    ///
    /// Caller holds the device lock; this acquires the lock of every touched
    /// volume in ascending id order before planning.
    pub(crate) async fn evict_and_fail(&self, device: DeviceId) -> Result<()> {
        let mut volumes: Vec<VolumeId> = {
            let topology = self.topology.read();
            topology
                .bricks_on_device(device)?
                .iter()
                .map(|b| b.volume)
                .collect()
        };
        volumes.sort_unstable();
        volumes.dedup();
        let mut _volume_guards = Vec::with_capacity(volumes.len());
        for volume in &volumes {
            _volume_guards.push(self.volume_lock(*volume).lock_owned().await);
        }

        let node = self.topology.read().device(device)?.node;
        let mut resolutions = {
            let snapshot = self.topology.read().snapshot();
            plan_device_eviction(&snapshot, &self.config, device)?
        };

        let outcome = self.drive_eviction(device, node, &mut resolutions).await;
        if let Err(error) = outcome {
            self.rollback_created(&mut resolutions).await;
            return Err(error);
        }

        // capacity is already released; destroying the old bricks on the
        // (failed) hardware is best effort
        let mut replaced = 0usize;
        let mut degraded = 0usize;
        for resolution in &resolutions {
            match resolution {
                Resolution::Replace { .. } => replaced += 1,
                Resolution::Degrade { .. } => degraded += 1,
            }
            let old = resolution.old();
            if let Err(error) = self.executor.delete_brick(&brick_spec(old, node)).await {
                warn!(device = %device, brick = %old.id, %error, "failed to destroy evicted brick");
            }
        }
        info!(device = %device, replaced, degraded, "device evicted and failed");
        Ok(())
    }

    /// Provision replacements, migrate data and commit, falling back along
    /// each resolution's ranked candidates when a concurrent committer takes
    /// the capacity first.
    async fn drive_eviction(
        &self,
        device: DeviceId,
        node: NodeId,
        resolutions: &mut Vec<Resolution>,
    ) -> Result<()> {
        loop {
            for resolution in resolutions.iter_mut() {
                let Resolution::Replace {
                    old,
                    candidates,
                    cursor,
                    created,
                    ..
                } = resolution
                else {
                    continue;
                };
                if created.is_some() {
                    continue;
                }
                let target = candidates[*cursor].clone();
                let mut entry = BrickEntry {
                    id: BrickId::new(),
                    device: target.device,
                    volume: old.volume,
                    set_index: old.set_index,
                    size: old.size,
                    path: String::new(),
                };
                let spec = brick_spec(&entry, target.node);
                entry.path = self.executor.create_brick(&spec).await?;
                *created = Some((entry, target.node));
                self.executor
                    .migrate_brick_data(&brick_spec(old, node), &spec)
                    .await?;
            }

            let conflict = {
                let mut store = self.topology.write();
                try_commit(&mut store, device, resolutions)
            };
            let Err(index) = conflict else {
                return Ok(());
            };

            let Resolution::Replace {
                old,
                set_width,
                candidates,
                cursor,
                created,
            } = &mut resolutions[index]
            else {
                unreachable!("only replacements can conflict at commit")
            };
            if let Some((entry, target_node)) = created.take() {
                if let Err(error) = self
                    .executor
                    .delete_brick(&brick_spec(&entry, target_node))
                    .await
                {
                    warn!(brick = %entry.id, %error, "failed to scrap displaced replacement");
                }
            }
            *cursor += 1;
            if *cursor >= candidates.len() {
                if may_degrade(*set_width, &self.config) {
                    let old = old.clone();
                    resolutions[index] = Resolution::Degrade { old };
                } else {
                    return Err(Error::brick_removal_not_permitted());
                }
            }
        }
    }

    /// Destroy every provisioned replacement after an aborted eviction
    async fn rollback_created(&self, resolutions: &mut [Resolution]) {
        for resolution in resolutions.iter_mut() {
            if let Resolution::Replace { created, .. } = resolution {
                if let Some((entry, node)) = created.take() {
                    if let Err(error) =
                        self.executor.delete_brick(&brick_spec(&entry, node)).await
                    {
                        warn!(brick = %entry.id, %error, "failed to roll back replacement brick");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::{ClusterFlags, NodeHostnames};
    use quarry_topology::{ReplicaSet, VolumeEntry};

    struct Fixture {
        topology: Topology,
        devices: Vec<DeviceId>,
    }

    /// nodes × devices cluster with one volume of `replica` bricks in one
    /// set, brick 300 on 500-capacity devices, one brick per node
    fn fixture(nodes: usize, devices_per_node: usize, replica: usize) -> (Fixture, VolumeId) {
        let mut topology = Topology::new();
        let cluster = topology.add_cluster(ClusterFlags::default());
        let mut devices = Vec::new();
        let mut first_device_per_node = Vec::new();
        for n in 0..nodes {
            let node = topology
                .add_node(cluster, (n % 2 + 1) as u32, NodeHostnames::single(format!("n{n}")))
                .unwrap();
            for d in 0..devices_per_node {
                let device = topology
                    .add_device(node, format!("/dev/vd{d}"), 500)
                    .unwrap();
                if d == 0 {
                    first_device_per_node.push(device);
                }
                devices.push(device);
            }
        }

        let volume_id = VolumeId::new();
        let bricks: Vec<BrickEntry> = first_device_per_node
            .iter()
            .take(replica)
            .map(|device| BrickEntry {
                id: BrickId::new(),
                device: *device,
                volume: volume_id,
                set_index: 0,
                size: 300,
                path: "/bricks/test".to_string(),
            })
            .collect();
        let volume = VolumeEntry {
            id: volume_id,
            cluster,
            size: 300,
            brick_size: 300,
            durability: if replica == 1 {
                Durability::Distribute
            } else {
                Durability::Replicate {
                    replica: replica as u8,
                }
            },
            replica_sets: vec![ReplicaSet {
                bricks: bricks.iter().map(|b| b.id).collect(),
            }],
        };
        topology.commit_volume(volume, bricks).unwrap();
        (Fixture { topology, devices }, volume_id)
    }

    #[test]
    fn test_replacement_found_on_spare_device() {
        let (mut fixture, _) = fixture(3, 2, 1);
        let failing = fixture.devices[0];
        fixture
            .topology
            .set_device_state(failing, DeviceState::Offline)
            .unwrap();

        let plan =
            plan_device_eviction(&fixture.topology, &EngineConfig::default(), failing).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan[0], Resolution::Replace { candidates, .. } if !candidates.is_empty()));
    }

    #[test]
    fn test_no_replacement_anywhere_is_not_permitted() {
        let (mut fixture, _) = fixture(1, 1, 1);
        let failing = fixture.devices[0];
        fixture
            .topology
            .set_device_state(failing, DeviceState::Offline)
            .unwrap();

        let err = plan_device_eviction(&fixture.topology, &EngineConfig::default(), failing)
            .unwrap_err();
        assert!(err.to_string().contains("brick removal is not permitted"));
    }

    #[test]
    fn test_replicated_brick_degrades_without_replacement() {
        // three nodes, one device each, all used by the set: no eligible
        // node remains, so the brick is dropped instead
        let (mut fixture, _) = fixture(3, 1, 3);
        let failing = fixture.devices[0];
        fixture
            .topology
            .set_device_state(failing, DeviceState::Offline)
            .unwrap();

        let plan =
            plan_device_eviction(&fixture.topology, &EngineConfig::default(), failing).unwrap();
        assert_eq!(plan.len(), 1);
        assert!(matches!(&plan[0], Resolution::Degrade { .. }));
    }

    #[test]
    fn test_replica_floor_blocks_degradation() {
        let (mut fixture, _) = fixture(2, 1, 2);
        let failing = fixture.devices[0];
        fixture
            .topology
            .set_device_state(failing, DeviceState::Offline)
            .unwrap();

        let config = EngineConfig {
            replica_floor: 2,
            ..EngineConfig::default()
        };
        let err = plan_device_eviction(&fixture.topology, &config, failing).unwrap_err();
        assert!(err.is_allocation());
    }

    #[test]
    fn test_replacement_skips_sibling_nodes() {
        // node 0 fully offline (as during node removal): the only spare
        // devices sit on the siblings' nodes, so the brick degrades instead
        // of colliding with a live replica
        let (mut fixture, _) = fixture(3, 2, 3);
        let failing = fixture.devices[0];
        fixture
            .topology
            .set_device_state(failing, DeviceState::Offline)
            .unwrap();
        fixture
            .topology
            .set_device_state(fixture.devices[1], DeviceState::Offline)
            .unwrap();

        let plan =
            plan_device_eviction(&fixture.topology, &EngineConfig::default(), failing).unwrap();
        assert!(matches!(&plan[0], Resolution::Degrade { .. }));
    }

    #[test]
    fn test_replacement_may_use_spare_device_of_own_node() {
        // the failing brick's own node is not a sibling; its spare device
        // is a legal replacement target
        let (mut fixture, _) = fixture(3, 2, 3);
        let failing = fixture.devices[0];
        fixture
            .topology
            .set_device_state(failing, DeviceState::Offline)
            .unwrap();

        let plan =
            plan_device_eviction(&fixture.topology, &EngineConfig::default(), failing).unwrap();
        match &plan[0] {
            Resolution::Replace { candidates, .. } => {
                assert_eq!(candidates.len(), 1);
                assert_eq!(candidates[0].device, fixture.devices[1]);
            }
            other => panic!("expected replacement, got {other:?}"),
        }
    }

    #[test]
    fn test_commit_applies_replacement_and_fails_device() {
        let (mut fixture, volume) = fixture(3, 2, 1);
        let failing = fixture.devices[0];
        fixture
            .topology
            .set_device_state(failing, DeviceState::Offline)
            .unwrap();

        let mut plan =
            plan_device_eviction(&fixture.topology, &EngineConfig::default(), failing).unwrap();
        let Resolution::Replace {
            old,
            candidates,
            created,
            ..
        } = &mut plan[0]
        else {
            panic!("expected replacement");
        };
        let target = candidates[0].clone();
        *created = Some((
            BrickEntry {
                id: BrickId::new(),
                device: target.device,
                volume: old.volume,
                set_index: old.set_index,
                size: old.size,
                path: "/bricks/replacement".to_string(),
            },
            target.node,
        ));

        try_commit(&mut fixture.topology, failing, &plan).unwrap();
        let device = fixture.topology.device(failing).unwrap();
        assert_eq!(device.state, DeviceState::Failed);
        assert!(device.bricks.is_empty());
        assert_eq!(device.used, 0);
        assert_eq!(fixture.topology.volume(volume).unwrap().min_set_width(), 1);
        fixture.topology.check_invariants().unwrap();
    }

    #[test]
    fn test_commit_reports_conflicts_without_applying() {
        let (mut fixture, _) = fixture(3, 2, 1);
        let failing = fixture.devices[0];
        fixture
            .topology
            .set_device_state(failing, DeviceState::Offline)
            .unwrap();

        let mut plan =
            plan_device_eviction(&fixture.topology, &EngineConfig::default(), failing).unwrap();
        let Resolution::Replace {
            old,
            candidates,
            created,
            ..
        } = &mut plan[0]
        else {
            panic!("expected replacement");
        };
        let target = candidates[0].clone();
        *created = Some((
            BrickEntry {
                id: BrickId::new(),
                device: target.device,
                volume: old.volume,
                set_index: old.set_index,
                size: old.size,
                path: "/bricks/replacement".to_string(),
            },
            target.node,
        ));
        // concurrent committer takes the target offline
        fixture
            .topology
            .set_device_state(target.device, DeviceState::Offline)
            .unwrap();

        assert_eq!(try_commit(&mut fixture.topology, failing, &plan), Err(0));
        let device = fixture.topology.device(failing).unwrap();
        assert_eq!(device.state, DeviceState::Offline);
        assert_eq!(device.bricks.len(), 1);
    }

    #[test]
    fn test_degradation_reduces_reported_durability() {
        let (mut fixture, volume) = fixture(3, 1, 3);
        let failing = fixture.devices[0];
        fixture
            .topology
            .set_device_state(failing, DeviceState::Offline)
            .unwrap();

        let plan =
            plan_device_eviction(&fixture.topology, &EngineConfig::default(), failing).unwrap();
        try_commit(&mut fixture.topology, failing, &plan).unwrap();

        let entry = fixture.topology.volume(volume).unwrap();
        assert_eq!(entry.durability, Durability::Replicate { replica: 2 });
        assert_eq!(entry.min_set_width(), 2);
        fixture.topology.check_invariants().unwrap();
    }
}

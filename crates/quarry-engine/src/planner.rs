//! Volume planning
//!
//! Turns a volume request into a concrete set of brick placements by
//! consulting the allocator once per replica-set member. Planning runs
//! against a topology snapshot and tracks its own provisional reservations;
//! nothing here mutates shared state. The engine commits the resulting plan
//! atomically (or not at all).

use quarry_common::{
    BrickId, BrickLimits, ClusterId, DeviceId, DeviceState, Durability, Error, NodeId, Result,
    VolumeId,
};
use quarry_placement::{DeviceCandidate, PlacementRequest, rank};
use quarry_topology::{BrickEntry, ReplicaSet, Topology, VolumeEntry};
use std::collections::HashSet;

/// A volume creation request
#[derive(Clone, Debug)]
pub struct VolumeRequest {
    /// Requested usable size in bytes; rounded up to a brick multiple
    pub size: u64,
    /// Durability policy
    pub durability: Durability,
    /// Restrict placement to these clusters; empty means any cluster
    pub clusters: Vec<ClusterId>,
}

/// A brick placement decided by the planner, with the node the execution
/// backend must address
#[derive(Clone, Debug)]
pub(crate) struct PlannedBrick {
    pub entry: BrickEntry,
    pub node: NodeId,
}

/// A fully planned volume, ready for backend provisioning and commit
#[derive(Clone, Debug)]
pub(crate) struct VolumePlan {
    pub volume: VolumeEntry,
    pub bricks: Vec<PlannedBrick>,
}

/// Reject malformed volume requests up front
pub(crate) fn validate_request(request: &VolumeRequest) -> Result<()> {
    if request.size == 0 {
        return Err(Error::validation("volume size must be greater than zero"));
    }
    if let Durability::Replicate { replica } = request.durability {
        if !(2..=4).contains(&replica) {
            return Err(Error::validation(format!(
                "unsupported replica count {replica}; supported range is 2..=4"
            )));
        }
    }
    Ok(())
}

/// Split a requested size into replica sets: the brick size is halved
/// (doubling the set count) until it fits under the configured maximum.
pub(crate) fn brick_granularity(size: u64, limits: &BrickLimits) -> Result<(u64, usize)> {
    let mut sets: usize = 1;
    let mut brick_size = size;
    while brick_size > limits.max_brick_size {
        sets *= 2;
        brick_size = size.div_ceil(sets as u64);
    }
    if brick_size < limits.min_brick_size {
        return Err(Error::validation(format!(
            "volume of {size} bytes splits into bricks of {brick_size} bytes, below the minimum of {}",
            limits.min_brick_size
        )));
    }
    Ok((brick_size, sets))
}

/// Allocator view of a cluster's devices at snapshot time
pub(crate) fn build_pool(snapshot: &Topology, cluster: ClusterId) -> Result<Vec<DeviceCandidate>> {
    Ok(snapshot
        .cluster_devices(cluster)?
        .into_iter()
        .map(|(node, device)| DeviceCandidate {
            device: device.id,
            node: node.id,
            zone: node.zone,
            free: device.free(),
            online: device.state == DeviceState::Online,
        })
        .collect())
}

/// Record a provisional placement against the planning pool
pub(crate) fn reserve(pool: &mut [DeviceCandidate], device: DeviceId, size: u64) {
    if let Some(candidate) = pool.iter_mut().find(|c| c.device == device) {
        candidate.free = candidate.free.saturating_sub(size);
    }
}

/// Distinguish "the cluster is simply out of space" from "space exists but
/// no device satisfies the placement constraints".
fn shortfall(snapshot: &Topology, cluster: ClusterId, required: u64) -> Error {
    let available = snapshot.free_capacity(cluster).unwrap_or(0);
    if available < required {
        Error::Capacity {
            requested: required,
            available,
        }
    } else {
        Error::allocation(format!(
            "no eligible device for a replica-set member in cluster {cluster}"
        ))
    }
}

/// Plan a volume into `cluster`. Fails without side effects if any replica
/// set cannot be fully allocated.
pub(crate) fn plan_volume(
    snapshot: &Topology,
    cluster: ClusterId,
    request: &VolumeRequest,
    limits: &BrickLimits,
) -> Result<VolumePlan> {
    let (brick_size, sets) = brick_granularity(request.size, limits)?;
    let replica = usize::from(request.durability.replica_count());
    let required = brick_size * sets as u64 * replica as u64;

    let volume_id = VolumeId::new();
    let mut pool = build_pool(snapshot, cluster)?;
    let mut replica_sets = Vec::with_capacity(sets);
    let mut bricks = Vec::with_capacity(sets * replica);
    // devices used by earlier sets of this volume; a secondary check keeps
    // distribute-style layouts to one brick per device while the pool lasts
    let mut volume_devices = HashSet::new();

    for set_index in 0..sets {
        let mut set = ReplicaSet::default();
        let mut used_devices = Vec::with_capacity(replica);
        let mut used_nodes = Vec::with_capacity(replica);
        let mut used_zones = Vec::with_capacity(replica);

        for _member in 0..replica {
            let placement = rank(
                &pool,
                &PlacementRequest {
                    volume: volume_id,
                    set_index: set_index as u32,
                    brick_size,
                    needed: 1,
                    exclude_devices: &used_devices,
                    used_nodes: &used_nodes,
                    used_zones: &used_zones,
                },
            );
            // node/zone spread is already encoded in the ranking; for
            // initial placement the best remaining candidate is acceptable
            // even when it shares a node with a sibling. Prefer devices no
            // earlier set of this volume used, falling back once the pool
            // is smaller than the brick count.
            let choice = placement
                .candidates()
                .iter()
                .find(|c| !volume_devices.contains(&c.device))
                .or_else(|| placement.candidates().first())
                .cloned();
            let Some(choice) = choice else {
                return Err(shortfall(snapshot, cluster, required));
            };

            let brick = BrickId::new();
            set.bricks.push(brick);
            bricks.push(PlannedBrick {
                entry: BrickEntry {
                    id: brick,
                    device: choice.device,
                    volume: volume_id,
                    set_index,
                    size: brick_size,
                    path: String::new(),
                },
                node: choice.node,
            });
            used_devices.push(choice.device);
            used_nodes.push(choice.node);
            used_zones.push(choice.zone);
            volume_devices.insert(choice.device);
            reserve(&mut pool, choice.device, brick_size);
        }
        replica_sets.push(set);
    }

    Ok(VolumePlan {
        volume: VolumeEntry {
            id: volume_id,
            cluster,
            size: brick_size * sets as u64,
            brick_size,
            durability: request.durability,
            replica_sets,
        },
        bricks,
    })
}

/// Plan additional replica sets to grow `volume` by at least `delta` bytes,
/// at the volume's existing brick granularity and current effective width.
pub(crate) fn plan_expansion(
    snapshot: &Topology,
    volume: &VolumeEntry,
    delta: u64,
) -> Result<(u64, Vec<ReplicaSet>, Vec<PlannedBrick>)> {
    let brick_size = volume.brick_size;
    let added_sets = delta.div_ceil(brick_size) as usize;
    let replica = usize::from(volume.durability.replica_count());
    let required = brick_size * added_sets as u64 * replica as u64;

    let mut pool = build_pool(snapshot, volume.cluster)?;
    let mut sets = Vec::with_capacity(added_sets);
    let mut bricks = Vec::new();
    let mut volume_devices: HashSet<_> = volume
        .brick_ids()
        .filter_map(|b| snapshot.brick(b).ok().map(|b| b.device))
        .collect();

    for offset in 0..added_sets {
        let set_index = volume.replica_sets.len() + offset;
        let mut set = ReplicaSet::default();
        let mut used_devices = Vec::with_capacity(replica);
        let mut used_nodes = Vec::with_capacity(replica);
        let mut used_zones = Vec::with_capacity(replica);

        for _member in 0..replica {
            let placement = rank(
                &pool,
                &PlacementRequest {
                    volume: volume.id,
                    set_index: set_index as u32,
                    brick_size,
                    needed: 1,
                    exclude_devices: &used_devices,
                    used_nodes: &used_nodes,
                    used_zones: &used_zones,
                },
            );
            let choice = placement
                .candidates()
                .iter()
                .find(|c| !volume_devices.contains(&c.device))
                .or_else(|| placement.candidates().first())
                .cloned();
            let Some(choice) = choice else {
                return Err(shortfall(snapshot, volume.cluster, required));
            };

            let brick = BrickId::new();
            set.bricks.push(brick);
            bricks.push(PlannedBrick {
                entry: BrickEntry {
                    id: brick,
                    device: choice.device,
                    volume: volume.id,
                    set_index,
                    size: brick_size,
                    path: String::new(),
                },
                node: choice.node,
            });
            used_devices.push(choice.device);
            used_nodes.push(choice.node);
            used_zones.push(choice.zone);
            volume_devices.insert(choice.device);
            reserve(&mut pool, choice.device, brick_size);
        }
        sets.push(set);
    }

    Ok((brick_size * added_sets as u64, sets, bricks))
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_common::{ClusterFlags, NodeHostnames};
    use std::collections::HashSet;

    fn cluster_of(nodes: usize, devices_per_node: usize, capacity: u64) -> (Topology, ClusterId) {
        let mut topology = Topology::new();
        let cluster = topology.add_cluster(ClusterFlags::default());
        for n in 0..nodes {
            let node = topology
                .add_node(
                    cluster,
                    (n % 2 + 1) as u32,
                    NodeHostnames::single(format!("node-{n}")),
                )
                .unwrap();
            for d in 0..devices_per_node {
                topology
                    .add_device(node, format!("/dev/vd{d}"), capacity)
                    .unwrap();
            }
        }
        (topology, cluster)
    }

    fn limits(max: u64, min: u64) -> BrickLimits {
        BrickLimits {
            max_brick_size: max,
            min_brick_size: min,
        }
    }

    #[test]
    fn test_granularity_halves_until_it_fits() {
        let (brick, sets) = brick_granularity(300, &limits(100, 1)).unwrap();
        assert_eq!(sets, 4);
        assert_eq!(brick, 75);

        let (brick, sets) = brick_granularity(300, &limits(1000, 1)).unwrap();
        assert_eq!(sets, 1);
        assert_eq!(brick, 300);
    }

    #[test]
    fn test_granularity_rejects_slivers() {
        let err = brick_granularity(300, &limits(100, 80)).unwrap_err();
        assert!(matches!(err, Error::Validation(_)));
    }

    #[test]
    fn test_replica_count_range() {
        for replica in [2, 3, 4] {
            assert!(
                validate_request(&VolumeRequest {
                    size: 100,
                    durability: Durability::Replicate { replica },
                    clusters: vec![],
                })
                .is_ok()
            );
        }
        for replica in [0, 1, 5] {
            assert!(
                validate_request(&VolumeRequest {
                    size: 100,
                    durability: Durability::Replicate { replica },
                    clusters: vec![],
                })
                .is_err()
            );
        }
    }

    #[test]
    fn test_distribute_sets_land_on_distinct_devices() {
        let (topology, cluster) = cluster_of(3, 2, 500);
        let request = VolumeRequest {
            size: 400,
            durability: Durability::Distribute,
            clusters: vec![],
        };
        let plan = plan_volume(&topology, cluster, &request, &limits(100, 1)).unwrap();

        assert_eq!(plan.volume.replica_sets.len(), 4);
        let devices: HashSet<_> = plan.bricks.iter().map(|b| b.entry.device).collect();
        assert_eq!(devices.len(), 4, "each brick on its own device");
    }

    #[test]
    fn test_replica_set_spreads_across_nodes() {
        let (topology, cluster) = cluster_of(3, 2, 500);
        let request = VolumeRequest {
            size: 300,
            durability: Durability::Replicate { replica: 3 },
            clusters: vec![],
        };
        let plan = plan_volume(&topology, cluster, &request, &limits(1000, 1)).unwrap();

        assert_eq!(plan.volume.replica_sets.len(), 1);
        let nodes: HashSet<_> = plan.bricks.iter().map(|b| b.node).collect();
        assert_eq!(nodes.len(), 3, "three nodes available, three used");
    }

    #[test]
    fn test_same_node_fallback_is_allowed_initially() {
        // one node, two devices: a replica pair still places, on distinct
        // devices of the single node
        let (topology, cluster) = cluster_of(1, 2, 500);
        let request = VolumeRequest {
            size: 300,
            durability: Durability::Replicate { replica: 2 },
            clusters: vec![],
        };
        let plan = plan_volume(&topology, cluster, &request, &limits(1000, 1)).unwrap();

        let devices: HashSet<_> = plan.bricks.iter().map(|b| b.entry.device).collect();
        assert_eq!(devices.len(), 2);
    }

    #[test]
    fn test_capacity_shortfall_is_a_capacity_error() {
        let (topology, cluster) = cluster_of(1, 1, 200);
        let request = VolumeRequest {
            size: 300,
            durability: Durability::Distribute,
            clusters: vec![],
        };
        let err = plan_volume(&topology, cluster, &request, &limits(1000, 1)).unwrap_err();
        assert!(err.is_capacity());
    }

    #[test]
    fn test_fragmentation_is_an_allocation_error() {
        // aggregate free space suffices, but no single device can host a
        // 300-byte brick
        let (topology, cluster) = cluster_of(2, 1, 200);
        let request = VolumeRequest {
            size: 300,
            durability: Durability::Distribute,
            clusters: vec![],
        };
        let err = plan_volume(&topology, cluster, &request, &limits(1000, 1)).unwrap_err();
        assert!(err.is_allocation());
    }

    #[test]
    fn test_expansion_appends_sets() {
        let (topology, cluster) = cluster_of(3, 2, 500);
        let request = VolumeRequest {
            size: 300,
            durability: Durability::Distribute,
            clusters: vec![],
        };
        let plan = plan_volume(&topology, cluster, &request, &limits(1000, 1)).unwrap();

        let (added, sets, bricks) = plan_expansion(&topology, &plan.volume, 600).unwrap();
        assert_eq!(added, 600);
        assert_eq!(sets.len(), 2);
        assert_eq!(bricks.len(), 2);
        assert_eq!(bricks[0].entry.set_index, 1);
        assert_eq!(bricks[1].entry.set_index, 2);
    }
}

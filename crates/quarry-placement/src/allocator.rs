//! Candidate filtering and ranking
//!
//! Filtering order: a device must be online with enough free space and must
//! not already be used by the requesting replica set (both hard); a node or
//! zone already used by the set only demotes a candidate in the ranking
//! (soft). The returned sequence is the full eligible pool, longer than
//! strictly needed, so callers can apply their own secondary checks and skip
//! candidates without re-querying.

use crate::ring::{DeviceCandidate, ring_order};
use quarry_common::{DeviceId, NodeId, VolumeId};

/// One replica-set member placement request
#[derive(Clone, Debug)]
pub struct PlacementRequest<'a> {
    /// Volume being placed
    pub volume: VolumeId,
    /// Replica set within the volume
    pub set_index: u32,
    /// Required brick size in bytes
    pub brick_size: u64,
    /// How many candidates the caller needs for this request
    pub needed: usize,
    /// Devices already used by other members of the same replica set (hard)
    pub exclude_devices: &'a [DeviceId],
    /// Nodes already used by other members of the same replica set (soft)
    pub used_nodes: &'a [NodeId],
    /// Zones already used by other members of the same replica set (soft)
    pub used_zones: &'a [u32],
}

/// Outcome of a placement query. All three variants are normal results; an
/// empty pool is not an error.
#[derive(Clone, Debug)]
pub enum Placement {
    /// At least `needed` eligible devices, best spread first
    Ranked(Vec<DeviceCandidate>),
    /// Some devices are eligible, but fewer than the caller asked for
    Insufficient {
        /// The eligible devices, ranked
        candidates: Vec<DeviceCandidate>,
        /// What the caller asked for
        needed: usize,
    },
    /// No online device passed the capacity and exclusion filters
    NoEligibleDevice,
}

impl Placement {
    /// The ranked candidates regardless of sufficiency
    #[must_use]
    pub fn candidates(&self) -> &[DeviceCandidate] {
        match self {
            Self::Ranked(candidates) | Self::Insufficient { candidates, .. } => candidates,
            Self::NoEligibleDevice => &[],
        }
    }
}

/// Spread quality of a candidate relative to the requesting set; lower ranks
/// first. Ring order is preserved within each class.
fn spread_class(candidate: &DeviceCandidate, request: &PlacementRequest<'_>) -> u8 {
    if request.used_nodes.contains(&candidate.node) {
        2
    } else if request.used_zones.contains(&candidate.zone) {
        1
    } else {
        0
    }
}

/// Rank the eligible devices of `pool` for one replica-set member.
///
/// Pure function of the pool snapshot and the request: repeated calls for
/// the same logical placement produce the same sequence.
#[must_use]
pub fn rank(pool: &[DeviceCandidate], request: &PlacementRequest<'_>) -> Placement {
    let ranked: Vec<DeviceCandidate> = {
        let mut eligible: Vec<&DeviceCandidate> =
            ring_order(pool, request.volume, request.set_index)
                .into_iter()
                .map(|i| &pool[i])
                .filter(|c| {
                    c.online
                        && c.free >= request.brick_size
                        && !request.exclude_devices.contains(&c.device)
                })
                .collect();
        // stable: ring order survives within each spread class
        eligible.sort_by_key(|c| spread_class(c, request));
        eligible.into_iter().cloned().collect()
    };

    if ranked.is_empty() {
        Placement::NoEligibleDevice
    } else if ranked.len() < request.needed {
        Placement::Insufficient {
            candidates: ranked,
            needed: request.needed,
        }
    } else {
        Placement::Ranked(ranked)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    fn candidate(seed: u8, zone: u32, free: u64) -> DeviceCandidate {
        DeviceCandidate {
            device: DeviceId::from_uuid(Uuid::from_bytes([seed; 16])),
            node: NodeId::from_uuid(Uuid::from_bytes([seed | 0x80; 16])),
            zone,
            free,
            online: true,
        }
    }

    fn request<'a>(
        volume: VolumeId,
        brick_size: u64,
        exclude_devices: &'a [DeviceId],
        used_nodes: &'a [NodeId],
        used_zones: &'a [u32],
    ) -> PlacementRequest<'a> {
        PlacementRequest {
            volume,
            set_index: 0,
            brick_size,
            needed: 1,
            exclude_devices,
            used_nodes,
            used_zones,
        }
    }

    #[test]
    fn test_filters_offline_and_full_devices() {
        let volume = VolumeId::from_uuid(Uuid::from_bytes([1; 16]));
        let mut pool = vec![
            candidate(1, 1, 500),
            candidate(2, 1, 100),
            candidate(3, 2, 500),
        ];
        pool[2].online = false;

        let placement = rank(&pool, &request(volume, 300, &[], &[], &[]));
        let candidates = placement.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].device, pool[0].device);
    }

    #[test]
    fn test_sibling_devices_are_excluded_hard() {
        let volume = VolumeId::from_uuid(Uuid::from_bytes([1; 16]));
        let pool = vec![candidate(1, 1, 500), candidate(2, 2, 500)];
        let exclude = [pool[0].device];

        let placement = rank(&pool, &request(volume, 300, &exclude, &[], &[]));
        let candidates = placement.candidates();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].device, pool[1].device);
    }

    #[test]
    fn test_used_nodes_rank_last_but_stay_eligible() {
        let volume = VolumeId::from_uuid(Uuid::from_bytes([1; 16]));
        let pool = vec![
            candidate(1, 1, 500),
            candidate(2, 1, 500),
            candidate(3, 2, 500),
        ];
        let used_nodes = [pool[0].node, pool[1].node];
        let used_zones = [1];

        let placement = rank(&pool, &request(volume, 300, &[], &used_nodes, &used_zones));
        let candidates = placement.candidates();
        assert_eq!(candidates.len(), 3);
        // the only fresh node/zone ranks first
        assert_eq!(candidates[0].device, pool[2].device);
    }

    #[test]
    fn test_zone_preference_is_soft() {
        let volume = VolumeId::from_uuid(Uuid::from_bytes([1; 16]));
        // distinct nodes, same zone everywhere
        let pool = vec![candidate(1, 1, 500), candidate(2, 1, 500)];
        let used_zones = [1];

        let placement = rank(&pool, &request(volume, 300, &[], &[], &used_zones));
        assert_eq!(placement.candidates().len(), 2);
    }

    #[test]
    fn test_no_eligible_device_is_a_normal_result() {
        let volume = VolumeId::from_uuid(Uuid::from_bytes([1; 16]));
        let pool = vec![candidate(1, 1, 100)];

        assert!(matches!(
            rank(&pool, &request(volume, 300, &[], &[], &[])),
            Placement::NoEligibleDevice
        ));
    }

    #[test]
    fn test_insufficient_is_distinct_from_empty() {
        let volume = VolumeId::from_uuid(Uuid::from_bytes([1; 16]));
        let pool = vec![candidate(1, 1, 500), candidate(2, 2, 500)];
        let mut req = request(volume, 300, &[], &[], &[]);
        req.needed = 3;

        match rank(&pool, &req) {
            Placement::Insufficient { candidates, needed } => {
                assert_eq!(candidates.len(), 2);
                assert_eq!(needed, 3);
            }
            other => panic!("expected Insufficient, got {other:?}"),
        }
    }

    #[test]
    fn test_ranking_is_deterministic() {
        let volume = VolumeId::from_uuid(Uuid::from_bytes([5; 16]));
        let pool: Vec<_> = (1..=8).map(|i| candidate(i, u32::from(i % 3), 500)).collect();

        let first = rank(&pool, &request(volume, 300, &[], &[], &[]));
        let second = rank(&pool, &request(volume, 300, &[], &[], &[]));
        assert_eq!(first.candidates(), second.candidates());
    }
}

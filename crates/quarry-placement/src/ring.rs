//! The logical device ring
//!
//! Every device hashes to a fixed ring position independent of any volume.
//! A placement walk starts at a point derived from the volume id and the
//! replica-set index and proceeds clockwise, wrapping at the end. Two walks
//! for the same (volume, set) are identical; walks for different volumes
//! start at different points, spreading load across the pool.

use quarry_common::{DeviceId, NodeId, VolumeId};
use serde::{Deserialize, Serialize};
use xxhash_rust::xxh64::xxh64;

/// A device as seen by the allocator: the minimal snapshot of topology state
/// needed for a placement decision.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceCandidate {
    /// Device id
    pub device: DeviceId,
    /// Owning node
    pub node: NodeId,
    /// Zone of the owning node
    pub zone: u32,
    /// Committed free capacity in bytes
    pub free: u64,
    /// Whether the device is in the online state
    pub online: bool,
}

/// Ring position of a device
#[must_use]
fn position(device: DeviceId) -> u64 {
    xxh64(device.as_bytes(), 0)
}

/// Starting point of the walk for one replica-set member group
#[must_use]
pub fn walk_start(volume: VolumeId, set_index: u32) -> u64 {
    let mut key = [0u8; 20];
    key[..16].copy_from_slice(volume.as_bytes());
    key[16..].copy_from_slice(&set_index.to_le_bytes());
    xxh64(&key, 0)
}

/// Indices into `pool` in ring order, walked from the start point for
/// (`volume`, `set_index`). Position ties break on the device id so the
/// order is total.
#[must_use]
pub fn ring_order(pool: &[DeviceCandidate], volume: VolumeId, set_index: u32) -> Vec<usize> {
    let mut indices: Vec<usize> = (0..pool.len()).collect();
    indices.sort_unstable_by_key(|&i| (position(pool[i].device), pool[i].device));

    let start = walk_start(volume, set_index);
    let split = indices.partition_point(|&i| position(pool[i].device) < start);
    indices.rotate_left(split);
    indices
}

//! Configuration types for Quarry
//!
//! This module defines the engine configuration structures. Values are plain
//! data with sensible defaults; the request layer is expected to deserialize
//! them from whatever configuration source it owns.

use serde::{Deserialize, Serialize};

const GIB: u64 = 1024 * 1024 * 1024;
const TIB: u64 = 1024 * GIB;

/// Root configuration for the engine
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Brick sizing limits used by the volume planner
    pub brick: BrickLimits,
    /// Minimum replica-set width a degradation may leave behind.
    ///
    /// With the default of 1, a replica set may shrink to a single brick and
    /// the volume is then reported as distribute-only. Raising the floor to 2
    /// makes eviction fail instead of producing unreplicated data.
    pub replica_floor: u8,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            brick: BrickLimits::default(),
            replica_floor: 1,
        }
    }
}

/// Brick sizing limits
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct BrickLimits {
    /// Largest brick the planner will create; volumes above this are split
    /// into more replica sets
    pub max_brick_size: u64,
    /// Smallest brick the planner will create
    pub min_brick_size: u64,
}

impl Default for BrickLimits {
    fn default() -> Self {
        Self {
            max_brick_size: 4 * TIB,
            min_brick_size: GIB,
        }
    }
}

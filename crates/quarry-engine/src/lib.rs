//! Quarry Engine - volume planning, device lifecycle and brick eviction
//!
//! The decision core of the control plane. The [`Engine`] owns the topology
//! store, consults the allocator for placements, and drives the device
//! lifecycle state machine: failing an offline device evicts every hosted
//! brick, replacing each on a new device where possible and degrading the
//! replica count where not. Node removal fans the same lifecycle out across
//! all of a node's devices and aggregates the results.
//!
//! Actual brick provisioning, data migration and destruction are delegated
//! to a [`BrickExecutor`]; the engine only decides and records.

pub mod engine;
pub mod eviction;
pub mod executor;
pub mod lifecycle;
pub mod planner;

pub use engine::{BrickInfo, Engine, VolumeInfo};
pub use executor::{BrickExecutor, BrickSpec, MemoryExecutor};
pub use planner::VolumeRequest;

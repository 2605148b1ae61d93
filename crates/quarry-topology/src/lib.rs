//! Quarry Topology - authoritative cluster graph
//!
//! This crate holds the Cluster → Node → Device → Brick ← Volume graph with
//! exact capacity accounting. Entities live in arenas keyed by their stable
//! ids with explicit child-id indices, so the cyclic node↔device↔brick↔volume
//! references never become ownership cycles and a point-in-time snapshot is a
//! plain clone.
//!
//! The store is pure data plus referential-integrity and capacity checks; it
//! carries no placement or lifecycle policy. Every mutation is a single
//! `&mut self` method, so no caller can observe a half-applied brick move.

pub mod entry;
pub mod store;

pub use entry::{BrickEntry, ClusterEntry, DeviceEntry, NodeEntry, ReplicaSet, VolumeEntry};
pub use store::Topology;

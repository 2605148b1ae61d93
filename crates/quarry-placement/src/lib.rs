//! Quarry Placement - deterministic brick placement
//!
//! Given a snapshot of a cluster's device pool, the allocator produces a
//! ranked, reproducible sequence of candidate devices for one replica-set
//! member. Devices sit at fixed positions on a logical ring; the walk starts
//! at a point derived from the volume and replica-set identifiers, so the
//! same logical placement always sees the same sequence while different
//! volumes start at different devices.
//!
//! Ranking is a pure function of (pool snapshot, volume id, set index):
//! nothing here reads shared state, which keeps allocation decisions
//! reproducible under test.

pub mod allocator;
pub mod ring;

pub use allocator::{Placement, PlacementRequest, rank};
pub use ring::{DeviceCandidate, ring_order, walk_start};

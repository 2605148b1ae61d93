//! Execution backend seam
//!
//! The engine decides *where* bricks live; a [`BrickExecutor`] makes it so on
//! the actual storage hosts. Implementations are expected to be idempotent
//! for deletes (removing an already-absent brick succeeds) so that retried
//! operations converge.

use async_trait::async_trait;
use parking_lot::Mutex;
use quarry_common::{BrickId, DeviceId, Error, NodeId, Result, VolumeId};
use std::collections::HashMap;
use tracing::debug;

/// Everything a backend needs to address one brick
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct BrickSpec {
    /// Brick id (engine-assigned)
    pub brick: BrickId,
    /// Owning volume
    pub volume: VolumeId,
    /// Hosting device
    pub device: DeviceId,
    /// Node owning the device
    pub node: NodeId,
    /// Brick size in bytes
    pub size: u64,
}

/// Asynchronous execution backend for brick operations
#[async_trait]
pub trait BrickExecutor: Send + Sync {
    /// Provision a brick on its device; returns the backend path
    async fn create_brick(&self, spec: &BrickSpec) -> Result<String>;

    /// Destroy a brick; succeeds if the brick is already gone
    async fn delete_brick(&self, spec: &BrickSpec) -> Result<()>;

    /// Copy a replica's data from `source` onto `destination`
    async fn migrate_brick_data(&self, source: &BrickSpec, destination: &BrickSpec)
    -> Result<()>;
}

/// In-memory backend for tests and local development.
///
/// Tracks provisioned bricks so tests can assert the backend and the
/// topology store agree.
#[derive(Debug, Default)]
pub struct MemoryExecutor {
    bricks: Mutex<HashMap<BrickId, BrickSpec>>,
}

impl MemoryExecutor {
    /// Create an empty backend
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of bricks currently provisioned
    #[must_use]
    pub fn brick_count(&self) -> usize {
        self.bricks.lock().len()
    }

    /// Whether a brick is currently provisioned
    #[must_use]
    pub fn has_brick(&self, brick: BrickId) -> bool {
        self.bricks.lock().contains_key(&brick)
    }
}

#[async_trait]
impl BrickExecutor for MemoryExecutor {
    async fn create_brick(&self, spec: &BrickSpec) -> Result<String> {
        let mut bricks = self.bricks.lock();
        if bricks.contains_key(&spec.brick) {
            return Err(Error::backend(format!(
                "brick {} already provisioned",
                spec.brick
            )));
        }
        let path = format!("/bricks/{}/{}", spec.volume, spec.brick);
        bricks.insert(spec.brick, spec.clone());
        debug!(brick = %spec.brick, device = %spec.device, "provisioned brick");
        Ok(path)
    }

    async fn delete_brick(&self, spec: &BrickSpec) -> Result<()> {
        self.bricks.lock().remove(&spec.brick);
        debug!(brick = %spec.brick, "destroyed brick");
        Ok(())
    }

    async fn migrate_brick_data(
        &self,
        source: &BrickSpec,
        destination: &BrickSpec,
    ) -> Result<()> {
        let bricks = self.bricks.lock();
        if !bricks.contains_key(&source.brick) {
            return Err(Error::backend(format!(
                "migration source {} not provisioned",
                source.brick
            )));
        }
        if !bricks.contains_key(&destination.brick) {
            return Err(Error::backend(format!(
                "migration destination {} not provisioned",
                destination.brick
            )));
        }
        debug!(source = %source.brick, destination = %destination.brick, "migrated brick data");
        Ok(())
    }
}

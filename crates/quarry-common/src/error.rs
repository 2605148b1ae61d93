//! Error types for Quarry
//!
//! One error enum covers every core operation; each variant maps to one of
//! the caller-visible failure kinds (validation, capacity, allocation,
//! conflict, not-found, backend, aggregated fan-out).

use crate::types::{BrickId, ClusterId, DeviceId, NodeId, VolumeId};
use thiserror::Error;

/// Common result type for Quarry operations
pub type Result<T> = std::result::Result<T, Error>;

/// Common error type for Quarry
#[derive(Debug, Error)]
pub enum Error {
    /// Malformed or out-of-range request
    #[error("invalid request: {0}")]
    Validation(String),

    /// Aggregate free space insufficient to satisfy a new volume
    #[error("insufficient free space: requested {requested} bytes, {available} bytes available")]
    Capacity {
        /// Bytes the request needed
        requested: u64,
        /// Bytes actually free across eligible devices
        available: u64,
    },

    /// A placement or eviction step found no eligible device and no safe
    /// degradation path
    #[error("allocation failed: {0}")]
    Allocation(String),

    /// Requested state transition invalid for the current lifecycle state,
    /// or the entity still has dependents blocking deletion
    #[error("conflict: {0}")]
    Conflict(String),

    #[error("cluster not found: {0}")]
    ClusterNotFound(ClusterId),

    #[error("node not found: {0}")]
    NodeNotFound(NodeId),

    #[error("device not found: {0}")]
    DeviceNotFound(DeviceId),

    #[error("volume not found: {0}")]
    VolumeNotFound(VolumeId),

    #[error("brick not found: {0}")]
    BrickNotFound(BrickId),

    /// Execution backend reported a failure
    #[error("execution backend error: {0}")]
    Backend(String),

    /// Aggregated failures from a fan-out of per-device operations
    #[error("{} of {} device operations failed", .failures.len(), .attempted)]
    Fanout {
        /// Number of device operations attempted
        attempted: usize,
        /// Every failing device with its error
        failures: Vec<(DeviceId, Box<Error>)>,
    },
}

impl Error {
    /// Create a validation error
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    /// Create an allocation error
    pub fn allocation(msg: impl Into<String>) -> Self {
        Self::Allocation(msg.into())
    }

    /// Create a conflict error
    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    /// Create a backend error
    pub fn backend(msg: impl Into<String>) -> Self {
        Self::Backend(msg.into())
    }

    /// The allocation error raised when a brick must leave a device but no
    /// replacement capacity exists and degradation is not possible
    #[must_use]
    pub fn brick_removal_not_permitted() -> Self {
        Self::Allocation(
            "brick removal is not permitted when no replacement capacity is available".to_string(),
        )
    }

    /// Check if this is a not-found error
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(
            self,
            Self::ClusterNotFound(_)
                | Self::NodeNotFound(_)
                | Self::DeviceNotFound(_)
                | Self::VolumeNotFound(_)
                | Self::BrickNotFound(_)
        )
    }

    /// Check if this is a lifecycle/dependency conflict
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }

    /// Check if this is an allocation failure
    #[must_use]
    pub const fn is_allocation(&self) -> bool {
        matches!(self, Self::Allocation(_))
    }

    /// Check if this is a capacity failure
    #[must_use]
    pub const fn is_capacity(&self) -> bool {
        matches!(self, Self::Capacity { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_predicates() {
        assert!(Error::DeviceNotFound(DeviceId::new()).is_not_found());
        assert!(Error::conflict("busy").is_conflict());
        assert!(Error::brick_removal_not_permitted().is_allocation());
        assert!(
            Error::Capacity {
                requested: 10,
                available: 5
            }
            .is_capacity()
        );
        assert!(!Error::validation("bad").is_conflict());
    }

    #[test]
    fn test_not_permitted_message() {
        let err = Error::brick_removal_not_permitted();
        assert!(err.to_string().contains("brick removal is not permitted"));
    }

    #[test]
    fn test_fanout_display() {
        let err = Error::Fanout {
            attempted: 2,
            failures: vec![(DeviceId::new(), Box::new(Error::conflict("x")))],
        };
        assert_eq!(err.to_string(), "1 of 2 device operations failed");
    }
}

//! Core type definitions for Quarry
//!
//! This module defines the identifiers and value types shared by the
//! topology store, the allocator and the engine.

use derive_more::{From, Into};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Declares a uuid-backed entity identifier.
///
/// All topology entities are addressed by stable random ids; the ids are
/// plain values with no embedded structure.
macro_rules! entity_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, From, Into)]
        pub struct $name(Uuid);

        impl $name {
            /// Generate a new random id
            #[must_use]
            pub fn new() -> Self {
                Self(Uuid::new_v4())
            }

            /// Create from an existing UUID
            #[must_use]
            pub const fn from_uuid(uuid: Uuid) -> Self {
                Self(uuid)
            }

            /// Get as bytes
            #[must_use]
            pub fn as_bytes(&self) -> &[u8; 16] {
                self.0.as_bytes()
            }
        }

        impl Default for $name {
            fn default() -> Self {
                Self::new()
            }
        }

        impl fmt::Debug for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, concat!(stringify!($name), "({})"), self.0)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

entity_id! {
    /// Unique identifier for a cluster
    ClusterId
}

entity_id! {
    /// Unique identifier for a node
    NodeId
}

entity_id! {
    /// Unique identifier for a device
    DeviceId
}

entity_id! {
    /// Unique identifier for a volume
    VolumeId
}

entity_id! {
    /// Unique identifier for a brick
    BrickId
}

/// Capability flags attached to a cluster.
///
/// Stored as external policy input; placement decisions do not consult them.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterFlags {
    /// Cluster supports block workloads
    pub block: bool,
    /// Cluster supports file workloads
    pub file: bool,
}

/// Management and storage network identities of a node
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeHostnames {
    /// Management network hostnames
    pub manage: Vec<String>,
    /// Storage network hostnames
    pub storage: Vec<String>,
}

impl NodeHostnames {
    /// Create hostnames with a single address on both networks
    #[must_use]
    pub fn single(address: impl Into<String>) -> Self {
        let address = address.into();
        Self {
            manage: vec![address.clone()],
            storage: vec![address],
        }
    }
}

/// Node operational state
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum NodeState {
    /// Node is reachable and may receive new devices
    #[default]
    Online,
    /// Node is administratively offline
    Offline,
}

/// Device operational state
///
/// The terminal `Deleted` state of the lifecycle is not stored: deletion
/// removes the device record entirely.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceState {
    /// Device accepts new bricks
    #[default]
    Online,
    /// Device is quiesced; existing bricks untouched, no new bricks
    Offline,
    /// Device has been failed and fully evacuated
    Failed,
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Online => write!(f, "online"),
            Self::Offline => write!(f, "offline"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

/// Volume durability policy.
///
/// `Replicate` carries the *current effective* replica count: eviction may
/// reduce it below the originally requested value, and a volume degraded all
/// the way to a single member per replica set is reported as `Distribute`.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum Durability {
    /// No redundancy; every replica set holds exactly one brick
    Distribute,
    /// n-way redundancy per replica set
    Replicate {
        /// Number of bricks per replica set
        replica: u8,
    },
}

impl Durability {
    /// Bricks per replica set under this policy
    #[must_use]
    pub const fn replica_count(&self) -> u8 {
        match self {
            Self::Distribute => 1,
            Self::Replicate { replica } => *replica,
        }
    }

    /// Policy after a replica set shrank to `count` members
    #[must_use]
    pub const fn reduced_to(count: u8) -> Self {
        if count <= 1 {
            Self::Distribute
        } else {
            Self::Replicate { replica: count }
        }
    }

    /// Whether the policy provides redundancy
    #[must_use]
    pub const fn is_replicated(&self) -> bool {
        matches!(self, Self::Replicate { .. })
    }
}

impl Default for Durability {
    fn default() -> Self {
        Self::Distribute
    }
}

impl fmt::Display for Durability {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Distribute => write!(f, "distribute"),
            Self::Replicate { replica } => write!(f, "replicate-{replica}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_id_roundtrip() {
        let id = DeviceId::new();
        let uuid: Uuid = id.into();
        assert_eq!(DeviceId::from_uuid(uuid), id);
        assert_eq!(id.as_bytes().len(), 16);
    }

    #[test]
    fn test_durability_reduction() {
        assert_eq!(
            Durability::reduced_to(3),
            Durability::Replicate { replica: 3 }
        );
        assert_eq!(Durability::reduced_to(1), Durability::Distribute);
        assert_eq!(Durability::reduced_to(0), Durability::Distribute);
    }

    #[test]
    fn test_replica_count() {
        assert_eq!(Durability::Distribute.replica_count(), 1);
        assert_eq!(Durability::Replicate { replica: 4 }.replica_count(), 4);
    }
}

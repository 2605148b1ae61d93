//! Device lifecycle state machine
//!
//! Online → Offline → Failed → Deleted. Online↔Offline is reversible and
//! side-effect free; Offline→Failed is gated on a successful eviction of
//! every hosted brick; deletion (handled by the engine) is only legal for a
//! failed device. A device must be quiesced before it can be failed.

use quarry_common::{DeviceState, Error, Result};

/// What a requested transition requires of the engine
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum Transition {
    /// Already in the target state
    Noop,
    /// Plain state update
    Apply,
    /// Evict every hosted brick, then mark failed
    Evict,
}

/// Classify a requested device state transition
pub(crate) fn classify(current: DeviceState, target: DeviceState) -> Result<Transition> {
    use DeviceState::{Failed, Offline, Online};
    match (current, target) {
        (Online, Online) | (Offline, Offline) | (Failed, Failed) => Ok(Transition::Noop),
        (Online, Offline) | (Offline, Online) => Ok(Transition::Apply),
        (Offline, Failed) => Ok(Transition::Evict),
        (Online, Failed) => Err(Error::conflict(
            "device must be set offline before it can be failed",
        )),
        (Failed, Online | Offline) => Err(Error::conflict(
            "failed device cannot return to service",
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_legal_transitions() {
        assert_eq!(
            classify(DeviceState::Online, DeviceState::Offline).unwrap(),
            Transition::Apply
        );
        assert_eq!(
            classify(DeviceState::Offline, DeviceState::Online).unwrap(),
            Transition::Apply
        );
        assert_eq!(
            classify(DeviceState::Offline, DeviceState::Failed).unwrap(),
            Transition::Evict
        );
    }

    #[test]
    fn test_same_state_is_noop() {
        for state in [DeviceState::Online, DeviceState::Offline, DeviceState::Failed] {
            assert_eq!(classify(state, state).unwrap(), Transition::Noop);
        }
    }

    #[test]
    fn test_illegal_transitions() {
        assert!(
            classify(DeviceState::Online, DeviceState::Failed)
                .unwrap_err()
                .is_conflict()
        );
        assert!(
            classify(DeviceState::Failed, DeviceState::Online)
                .unwrap_err()
                .is_conflict()
        );
        assert!(
            classify(DeviceState::Failed, DeviceState::Offline)
                .unwrap_err()
                .is_conflict()
        );
    }
}

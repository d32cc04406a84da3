use std::fmt::{self, Display};

use serde::{Deserialize, Serialize};

use crate::{EmberError, EmberResult};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The lifecycle state of a microVM.
///
/// ```text
/// Created ──► Started ──► Stopped
///    │           │
///    └───────────┴──────► Failed
/// ```
///
/// `Stopped` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VmState {
    /// Accepted; resources are being prepared and the hypervisor is not yet ready.
    Created,

    /// The hypervisor booted the guest.
    Started,

    /// Boot or runtime failure.
    Failed,

    /// Shut down gracefully or by force.
    Stopped,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmState {
    /// All states, in declaration order.
    pub const ALL: [VmState; 4] = [
        VmState::Created,
        VmState::Started,
        VmState::Failed,
        VmState::Stopped,
    ];

    /// Whether no further transitions are possible.
    pub fn is_terminal(self) -> bool {
        matches!(self, VmState::Stopped | VmState::Failed)
    }

    /// Whether moving from `self` to `next` is a legal transition.
    pub fn can_transition_to(self, next: VmState) -> bool {
        matches!(
            (self, next),
            (VmState::Created, VmState::Started)
                | (VmState::Created, VmState::Failed)
                | (VmState::Started, VmState::Stopped)
                | (VmState::Started, VmState::Failed)
        )
    }

    /// Returns `next` if the transition is legal.
    pub fn transition(self, next: VmState) -> EmberResult<VmState> {
        if self.can_transition_to(next) {
            Ok(next)
        } else {
            Err(EmberError::InvalidTransition {
                from: self,
                to: next,
            })
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for VmState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VmState::Created => "created",
            VmState::Started => "started",
            VmState::Failed => "failed",
            VmState::Stopped => "stopped",
        };

        write!(f, "{}", name)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_table_is_exhaustive() {
        use VmState::*;

        let allowed = [
            (Created, Started),
            (Created, Failed),
            (Started, Stopped),
            (Started, Failed),
        ];

        for from in VmState::ALL {
            for to in VmState::ALL {
                let expected = allowed.contains(&(from, to));
                assert_eq!(
                    from.can_transition_to(to),
                    expected,
                    "{} -> {} should be {}",
                    from,
                    to,
                    if expected { "allowed" } else { "rejected" }
                );
                assert_eq!(from.transition(to).is_ok(), expected);
            }
        }
    }

    #[test]
    fn test_created_never_goes_straight_to_stopped() {
        let err = VmState::Created.transition(VmState::Stopped).unwrap_err();
        assert!(matches!(
            err,
            EmberError::InvalidTransition {
                from: VmState::Created,
                to: VmState::Stopped
            }
        ));
    }

    #[test]
    fn test_terminal_states_have_no_exits() {
        for terminal in [VmState::Stopped, VmState::Failed] {
            assert!(terminal.is_terminal());
            for to in VmState::ALL {
                assert!(!terminal.can_transition_to(to));
            }
        }

        assert!(!VmState::Created.is_terminal());
        assert!(!VmState::Started.is_terminal());
    }

    #[test]
    fn test_state_serializes_lowercase() -> anyhow::Result<()> {
        assert_eq!(serde_json::to_string(&VmState::Started)?, "\"started\"");
        let state: VmState = serde_json::from_str("\"failed\"")?;
        assert_eq!(state, VmState::Failed);
        Ok(())
    }
}

//! Server state shared by every handler.

use std::sync::Arc;

use tokio_util::sync::CancellationToken;

use crate::management::VmManager;

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Shared server state.
///
/// Cheap to clone: the manager is shared and the token is a handle.
#[derive(Clone)]
pub struct ServerState {
    /// The VM manager requests are served by.
    manager: Arc<VmManager>,

    /// Cancelled when the server shuts down. Boots in flight are derived from it.
    shutdown: CancellationToken,
}

//-------------------------------------------------------------------------------------------------
// Methods
//-------------------------------------------------------------------------------------------------

impl ServerState {
    /// Creates server state around `manager`. Cancelling `shutdown` aborts boots in flight.
    pub fn new(manager: Arc<VmManager>, shutdown: CancellationToken) -> Self {
        Self { manager, shutdown }
    }

    /// Gets the VM manager.
    pub fn manager(&self) -> &Arc<VmManager> {
        &self.manager
    }

    /// A token for one long-running request. Cancelled when the server shuts down, or when the
    /// returned token's drop guard goes out of scope.
    pub fn request_token(&self) -> CancellationToken {
        self.shutdown.child_token()
    }
}

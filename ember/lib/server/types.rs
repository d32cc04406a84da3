//! Request and response bodies of the HTTP API.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use crate::{management::VmInfo, vm::SnapshotKind};

//-------------------------------------------------------------------------------------------------
// Types
//-------------------------------------------------------------------------------------------------

/// Request body for the /delete, /stop and /resume endpoints
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmIdRequest {
    /// Id of the VM
    pub id: String,
}

/// Request body for the /snapshot endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SnapshotRequest {
    /// Id of the VM
    pub id: String,

    /// Base path of the snapshot files. Relative paths land in the snapshot directory
    #[serde(default)]
    pub base: Option<PathBuf>,

    /// Full or diff. Full by default
    #[serde(default)]
    pub kind: SnapshotKind,
}

/// Response body carrying a single VM
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VmResponse {
    /// The VM after the operation
    pub vm: VmInfo,
}

/// Response body for the /list endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListResponse {
    /// Every VM, oldest first
    pub vms: Vec<VmInfo>,
}

/// Response body for the /delete endpoint
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeleteResponse {
    /// Id of the removed VM
    pub deleted: String,
}

/// Error response body
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Error message
    pub error: String,
}

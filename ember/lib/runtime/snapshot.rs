use std::{
    path::{Path, PathBuf},
    sync::Arc,
    time::Instant,
};

use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use crate::{
    management::VmRecord,
    vm::{FirecrackerClient, Machine, SnapshotFiles, SnapshotKind, SnapshotMetadata},
    EmberError, EmberResult,
};

use super::VmmSupervisor;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Captures running VMs to disk and brings them back.
pub struct SnapshotManager {
    supervisor: Arc<VmmSupervisor>,
}

/// Outcome of a capture.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotReport {
    /// Base path the snapshot files share.
    pub base: PathBuf,

    /// Memory and state files.
    pub files: SnapshotFiles,

    /// Full or diff.
    pub kind: SnapshotKind,

    /// How long the guest was paused, in milliseconds.
    pub pause_ms: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotManager {
    /// Creates a manager relaunching VMs through `supervisor`.
    pub fn new(supervisor: Arc<VmmSupervisor>) -> Self {
        Self { supervisor }
    }

    /// Pauses the VM, writes `{base}.mem`, `{base}.file`, a copy of the root disk and the
    /// metadata, then resumes it.
    ///
    /// The guest is resumed even if the capture fails. A VM that was already paused is captured
    /// as is and stays paused. Diff snapshots are refused for VMs booted without dirty page
    /// tracking.
    pub async fn create(
        &self,
        record: &VmRecord,
        base: &Path,
        kind: SnapshotKind,
    ) -> EmberResult<SnapshotReport> {
        let machine = record.machine().ok_or_else(|| {
            EmberError::InvalidState(format!("vm {} has no running hypervisor", record.get_id()))
        })?;

        if kind == SnapshotKind::Diff && !record.get_config().get_machine().track_dirty_pages {
            return Err(EmberError::Validation(format!(
                "vm {} was booted without dirty page tracking and cannot take diff snapshots",
                record.get_id()
            )));
        }

        if let Some(parent) = base.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let files = SnapshotFiles::from_base(base);
        let disk_path = SnapshotMetadata::disk_path_for(base);
        let already_paused = record.is_paused();

        let paused_at = Instant::now();
        if !already_paused {
            machine.pause().await?;
        }

        let captured = self
            .capture(machine.as_ref(), record, &files, &disk_path, kind)
            .await;

        let resumed = if already_paused {
            Ok(())
        } else {
            machine.resume().await
        };
        let pause_ms = paused_at.elapsed().as_millis() as u64;

        captured?;
        resumed?;

        SnapshotMetadata::builder()
            .vm_name(record.get_name())
            .image(record.get_image())
            .host_byte(record.get_identity().get_host_byte())
            .kind(kind)
            .config(record.get_config().clone())
            .disk_path(disk_path)
            .build()
            .write(base)
            .await?;

        tracing::info!(
            vm_id = %record.get_id(),
            base = %base.display(),
            ?kind,
            pause_ms,
            "snapshot created"
        );

        Ok(SnapshotReport {
            base: base.to_path_buf(),
            files,
            kind,
            pause_ms,
        })
    }

    /// Relaunches the VM described by `record` from `files` and resumes it.
    ///
    /// Fails with [`EmberError::SocketInUse`] before touching anything if a live hypervisor
    /// already answers on the record's socket.
    pub async fn restore(
        &self,
        record: &VmRecord,
        files: SnapshotFiles,
        cancel: &CancellationToken,
    ) -> EmberResult<Arc<dyn Machine>> {
        let config = record.get_config().with_snapshot(files);
        Self::ensure_socket_available(config.get_socket_path()).await?;

        tracing::info!(vm_id = %record.get_id(), socket = %config.get_socket_path().display(), "restoring vm from snapshot");
        self.supervisor.start(record, &config, cancel).await
    }

    /// Fails if something accepts connections on `socket_path`. A leftover socket file with no
    /// listener is fine; the launch removes it.
    pub async fn ensure_socket_available(socket_path: &Path) -> EmberResult<()> {
        if FirecrackerClient::new(socket_path).is_reachable().await {
            return Err(EmberError::SocketInUse(socket_path.to_path_buf()));
        }
        Ok(())
    }

    async fn capture(
        &self,
        machine: &dyn Machine,
        record: &VmRecord,
        files: &SnapshotFiles,
        disk_path: &Path,
        kind: SnapshotKind,
    ) -> EmberResult<()> {
        machine.create_snapshot(files, kind).await?;
        tokio::fs::copy(record.get_rootfs().get_path(), disk_path).await?;
        Ok(())
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

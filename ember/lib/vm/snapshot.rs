use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    utils::{self, SNAPSHOT_MEM_EXTENSION, SNAPSHOT_META_EXTENSION, SNAPSHOT_STATE_EXTENSION},
    EmberError, EmberResult,
};

use super::{HypervisorConfig, SnapshotKind};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Extension of the disk image saved with a snapshot.
pub const SNAPSHOT_DISK_EXTENSION: &str = "ext4";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The two files a snapshot consists of.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SnapshotFiles {
    /// Guest memory.
    mem_path: PathBuf,

    /// Device and vCPU state.
    state_path: PathBuf,
}

/// Everything needed to bring a snapshot back as a new VM, stored as `{base}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct SnapshotMetadata {
    /// Name of the VM the snapshot was taken from.
    #[builder(setter(into))]
    vm_name: String,

    /// Container image the VM was built from.
    #[builder(setter(into))]
    image: String,

    /// Host byte of the VM. The guest has its address baked in, so a restore must reuse it.
    host_byte: u8,

    /// Full or diff.
    kind: SnapshotKind,

    /// When the snapshot was taken.
    #[builder(default = Utc::now())]
    created_at: DateTime<Utc>,

    /// The launch config of the VM.
    config: HypervisorConfig,

    /// Copy of the root disk taken while the guest was paused.
    #[builder(default, setter(into))]
    disk_path: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl SnapshotFiles {
    /// Creates a pair from explicit paths.
    pub fn new(mem_path: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            mem_path: mem_path.into(),
            state_path: state_path.into(),
        }
    }

    /// `{base}.mem` and `{base}.file`.
    pub fn from_base(base: impl AsRef<Path>) -> Self {
        let base = base.as_ref();
        Self::new(
            utils::with_suffix(base, SNAPSHOT_MEM_EXTENSION),
            utils::with_suffix(base, SNAPSHOT_STATE_EXTENSION),
        )
    }

    /// Whether both files exist.
    pub async fn exist(&self) -> bool {
        let mem = tokio::fs::try_exists(&self.mem_path).await.unwrap_or(false);
        let state = tokio::fs::try_exists(&self.state_path)
            .await
            .unwrap_or(false);
        mem && state
    }
}

impl SnapshotMetadata {
    /// `{base}.json`.
    pub fn path_for(base: impl AsRef<Path>) -> PathBuf {
        utils::with_suffix(base, SNAPSHOT_META_EXTENSION)
    }

    /// `{base}.ext4`, where the disk copy is kept.
    pub fn disk_path_for(base: impl AsRef<Path>) -> PathBuf {
        utils::with_suffix(base, SNAPSHOT_DISK_EXTENSION)
    }

    /// Writes the metadata next to the snapshot at `base`.
    pub async fn write(&self, base: impl AsRef<Path>) -> EmberResult<()> {
        let content = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(Self::path_for(base), content).await?;
        Ok(())
    }

    /// Reads the metadata of the snapshot at `base`.
    pub async fn read(base: impl AsRef<Path>) -> EmberResult<Self> {
        let path = Self::path_for(base);
        let content = tokio::fs::read(&path).await.map_err(|e| {
            EmberError::Validation(format!(
                "cannot read snapshot metadata {}: {}",
                path.display(),
                e
            ))
        })?;
        Ok(serde_json::from_slice(&content)?)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

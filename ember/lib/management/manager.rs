use std::{
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU64, Ordering},
        Arc, LazyLock,
    },
};

use async_trait::async_trait;
use chrono::Utc;
use emberutils::{CommandRunner, SystemRunner};
use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use typed_builder::TypedBuilder;
use uuid::Uuid;

use crate::{
    config::{EmberConfig, ExecutionMode},
    network::{IdentityAllocator, IdentityLease, NetworkProvisioner},
    rootfs::{RootfsArtifact, RootfsBuilder},
    runtime::{ShutdownMode, ShutdownTarget, SnapshotManager, SnapshotReport, VmmSupervisor},
    vm::{
        FirecrackerDriver, HypervisorConfig, Machine, MachineDriver, SnapshotFiles, SnapshotKind,
        SnapshotMetadata, VmState,
    },
    EmberError, EmberResult,
};

use super::{VmInfo, VmRecord, VmRegistry};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Upper bound on vCPUs per VM.
pub const MAX_VCPUS: u8 = 32;

/// Lower bound on guest memory, in MiB.
pub const MIN_MEM_MIB: u32 = 128;

static VM_NAME_PATTERN: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^[a-zA-Z0-9][a-zA-Z0-9_.-]{0,62}$").expect("vm name pattern is valid")
});

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The control surface: creates, inspects, pauses, snapshots and removes VMs.
///
/// Every operation works on its own VM; nothing here holds a lock across unrelated VMs.
pub struct VmManager {
    config: EmberConfig,
    allocator: Arc<IdentityAllocator>,
    rootfs: RootfsBuilder,
    supervisor: Arc<VmmSupervisor>,
    snapshots: SnapshotManager,
    registry: VmRegistry,
    rootfs_index: AtomicU64,
    shutting_down: AtomicBool,
}

/// What to create.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct CreateVmRequest {
    /// Human readable name. Also names the rootfs image.
    #[builder(setter(into))]
    pub name: String,

    /// Container image the root filesystem is exported from.
    #[builder(setter(into))]
    pub image: String,

    /// vCPUs. Falls back to the configured default.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub vcpus: Option<u8>,

    /// Guest memory in MiB. Falls back to the configured default.
    #[serde(default)]
    #[builder(default, setter(strip_option))]
    pub mem_mib: Option<u32>,
}

/// What to restore.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct RestoreVmRequest {
    /// Base path of the snapshot. Relative paths are taken from the snapshot directory.
    #[builder(setter(into))]
    pub snapshot: PathBuf,

    /// Name for the restored VM. Defaults to the name recorded in the snapshot.
    #[serde(default)]
    #[builder(default, setter(strip_option, into))]
    pub name: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmManager {
    /// Creates a manager that runs host commands through `runner` and hypervisors through
    /// `driver`.
    pub fn new(
        config: EmberConfig,
        runner: Arc<dyn CommandRunner>,
        driver: Arc<dyn MachineDriver>,
    ) -> Self {
        let provisioner = Arc::new(NetworkProvisioner::new(
            Arc::clone(&runner),
            config.get_network().get_uplink_interface(),
        ));
        let supervisor = Arc::new(VmmSupervisor::new(
            provisioner,
            driver,
            config.shutdown_grace(),
        ));

        Self {
            allocator: Arc::new(IdentityAllocator::new(config.get_network().clone())),
            rootfs: RootfsBuilder::new(
                runner,
                config.rootfs_dir(),
                config.get_init_binary(),
                *config.get_rootfs_size_mb(),
            ),
            snapshots: SnapshotManager::new(Arc::clone(&supervisor)),
            supervisor,
            registry: VmRegistry::new(),
            rootfs_index: AtomicU64::new(0),
            shutting_down: AtomicBool::new(false),
            config,
        }
    }

    /// Creates a manager driving the real host: shell commands through `sudo` when needed and
    /// Firecracker (directly or under the jailer) for hypervisors.
    pub fn with_host(config: EmberConfig) -> EmberResult<Self> {
        let firecracker = emberutils::resolve_binary(config.get_firecracker_binary())?;
        if let ExecutionMode::Jailed(jailer) = config.get_execution() {
            emberutils::resolve_binary(jailer.get_jailer_binary())?;
        }

        let driver = FirecrackerDriver::new(firecracker, config.boot_timeout());
        Ok(Self::new(config, Arc::new(SystemRunner::new()), Arc::new(driver)))
    }

    /// The deployment config.
    pub fn config(&self) -> &EmberConfig {
        &self.config
    }

    /// Number of network identities currently leased.
    pub fn identities_in_use(&self) -> usize {
        self.allocator.in_use()
    }

    /// Builds a rootfs, wires up the network and boots a VM.
    ///
    /// Nothing is registered unless the guest reaches `started`. A failure or cancellation at
    /// any step releases everything acquired before it.
    pub async fn create(
        &self,
        request: CreateVmRequest,
        cancel: &CancellationToken,
    ) -> EmberResult<VmInfo> {
        self.ensure_accepting()?;
        let (vcpus, mem_mib) = self.validate(&request)?;

        let lease = self.allocator.allocate()?;
        let id = Uuid::new_v4().to_string();
        let rootfs_index = self.next_rootfs_index(&request.name).await;

        tracing::info!(
            vm_id = %id,
            name = %request.name,
            image = %request.image,
            host_byte = lease.get_host_byte(),
            rootfs_index,
            "creating vm"
        );

        let rootfs = self
            .rootfs
            .build(rootfs_index, &request.name, &request.image, cancel)
            .await?;

        let config = HypervisorConfig::compose(
            &id,
            lease.identity(),
            rootfs.get_path(),
            vcpus,
            mem_mib,
            &self.config,
        );
        let record = Arc::new(VmRecord::new(
            id,
            request.name,
            request.image,
            lease.identity().clone(),
            rootfs.clone(),
            config.clone(),
        ));

        let machine = match self.supervisor.start(&record, &config, cancel).await {
            Ok(machine) => machine,
            Err(e) => {
                discard_rootfs(&rootfs).await;
                return Err(e);
            }
        };

        self.admit(record, machine, lease).await
    }

    /// Shuts the VM down gracefully, releases its network and identity, deletes its rootfs and
    /// forgets it.
    pub async fn delete(&self, id: &str) -> EmberResult<()> {
        let record = self.registry.get(id).await?;
        tracing::info!(vm_id = %id, "deleting vm");

        self.retire(&record, ShutdownMode::Graceful).await;
        self.registry.remove(id).await?;
        Ok(())
    }

    /// Pauses the guest. Pausing a paused VM does nothing.
    pub async fn stop(&self, id: &str) -> EmberResult<VmInfo> {
        self.set_paused(id, true).await
    }

    /// Resumes a paused guest. Resuming a running VM does nothing.
    pub async fn resume(&self, id: &str) -> EmberResult<VmInfo> {
        self.set_paused(id, false).await
    }

    /// Every VM, oldest first.
    pub async fn list(&self) -> Vec<VmInfo> {
        self.registry.list().await
    }

    /// One VM.
    pub async fn info(&self, id: &str) -> EmberResult<VmInfo> {
        Ok(self.registry.get(id).await?.info())
    }

    /// Captures a running VM.
    ///
    /// `base` names the snapshot files without extension. Relative paths, and the default of
    /// `{name}-{timestamp}`, live under the snapshot directory.
    pub async fn snapshot(
        &self,
        id: &str,
        base: Option<&Path>,
        kind: SnapshotKind,
    ) -> EmberResult<SnapshotReport> {
        let record = self.registry.get(id).await?;
        let _control = record.lock_control().await;
        ensure_started(&record)?;

        let base = match base {
            Some(base) => self.resolve_snapshot_base(base),
            None => self.config.snapshot_dir().join(format!(
                "{}-{}",
                record.get_name(),
                Utc::now().format("%Y%m%dT%H%M%S")
            )),
        };

        self.snapshots.create(&record, &base, kind).await
    }

    /// Boots a new VM from a snapshot written by [`VmManager::snapshot`].
    ///
    /// The restored VM gets a fresh id but keeps the snapshot's address and root disk, so the
    /// VM it was taken from must be gone first.
    pub async fn restore(
        &self,
        request: RestoreVmRequest,
        cancel: &CancellationToken,
    ) -> EmberResult<VmInfo> {
        self.ensure_accepting()?;

        let base = self.resolve_snapshot_base(&request.snapshot);
        let metadata = SnapshotMetadata::read(&base).await?;
        if *metadata.get_kind() == SnapshotKind::Diff {
            return Err(EmberError::Validation(format!(
                "{} is a diff snapshot and cannot be restored without its base",
                base.display()
            )));
        }

        let files = SnapshotFiles::from_base(&base);
        if !files.exist().await {
            return Err(EmberError::Validation(format!(
                "snapshot files for {} are missing",
                base.display()
            )));
        }

        let name = request
            .name
            .unwrap_or_else(|| metadata.get_vm_name().clone());
        if !VM_NAME_PATTERN.is_match(&name) {
            return Err(EmberError::Validation(format!("invalid vm name `{}`", name)));
        }

        let config = metadata.get_config();
        SnapshotManager::ensure_socket_available(config.get_socket_path()).await?;

        let rootfs_path = config.rootfs_path().ok_or_else(|| {
            EmberError::Validation(format!("snapshot {} has no root drive", base.display()))
        })?;
        if let Some(owner) = self.rootfs_owner(rootfs_path).await {
            return Err(EmberError::Allocation(format!(
                "root disk {} still belongs to vm {}",
                rootfs_path.display(),
                owner
            )));
        }

        let lease = self.allocator.claim(*metadata.get_host_byte())?;
        let rootfs = RootfsArtifact::new(rootfs_path);
        let copied_disk = restore_disk(metadata.get_disk_path().as_deref(), rootfs_path).await?;

        let id = Uuid::new_v4().to_string();
        tracing::info!(vm_id = %id, name = %name, snapshot = %base.display(), "restoring vm");

        let record = Arc::new(VmRecord::new(
            id,
            name,
            metadata.get_image().clone(),
            lease.identity().clone(),
            rootfs.clone(),
            config.clone(),
        ));

        let machine = match self.snapshots.restore(&record, files, cancel).await {
            Ok(machine) => machine,
            Err(e) => {
                if copied_disk {
                    discard_rootfs(&rootfs).await;
                }
                return Err(e);
            }
        };

        self.admit(record, machine, lease).await
    }

    /// Brings every VM down and forgets it. Later creates and restores are refused.
    ///
    /// Safe to call again while a previous sweep is running, for example to escalate a graceful
    /// sweep to a forced one.
    pub async fn shutdown_all(&self, mode: ShutdownMode) {
        self.shutting_down.store(true, Ordering::SeqCst);

        let records = self.registry.records().await;
        tracing::info!(count = records.len(), ?mode, "stopping all vms");

        futures::future::join_all(records.iter().map(|record| self.retire(record, mode))).await;

        for record in records {
            // A concurrent sweep or delete may have removed it already.
            let _ = self.registry.remove(record.get_id()).await;
        }
    }

    async fn admit(
        &self,
        record: Arc<VmRecord>,
        machine: Arc<dyn Machine>,
        lease: IdentityLease,
    ) -> EmberResult<VmInfo> {
        self.supervisor.watch(Arc::clone(&record), machine, lease);

        if let Err(e) = self.registry.insert(Arc::clone(&record)).await {
            self.retire(&record, ShutdownMode::Forced).await;
            return Err(e);
        }

        // A sweep that started while this VM was booting took its list without it.
        if self.shutting_down.load(Ordering::SeqCst) {
            tracing::info!(vm_id = %record.get_id(), "vm came up during shutdown, stopping it");
            self.retire(&record, ShutdownMode::Forced).await;
            let _ = self.registry.remove(record.get_id()).await;
            return Err(shutting_down_error());
        }

        Ok(record.info())
    }

    async fn retire(&self, record: &VmRecord, mode: ShutdownMode) {
        self.supervisor.shutdown(record, mode).await;
        record.join_watcher().await;
        discard_rootfs(record.get_rootfs()).await;
    }

    async fn set_paused(&self, id: &str, paused: bool) -> EmberResult<VmInfo> {
        let record = self.registry.get(id).await?;
        let _control = record.lock_control().await;
        ensure_started(&record)?;

        if record.is_paused() == paused {
            tracing::debug!(vm_id = %id, paused, "vm already in requested run state");
            return Ok(record.info());
        }

        let machine = record.machine().ok_or_else(|| {
            EmberError::InvalidState(format!("vm {} has no running hypervisor", id))
        })?;

        if paused {
            machine.pause().await?;
        } else {
            machine.resume().await?;
        }

        record.set_paused(paused);
        tracing::info!(vm_id = %id, paused, "vm run state changed");
        Ok(record.info())
    }

    fn validate(&self, request: &CreateVmRequest) -> EmberResult<(u8, u32)> {
        if !VM_NAME_PATTERN.is_match(&request.name) {
            return Err(EmberError::Validation(format!(
                "invalid vm name `{}`: use up to 63 letters, digits, `_`, `.` or `-`",
                request.name
            )));
        }

        if request.image.is_empty() || request.image.chars().any(char::is_whitespace) {
            return Err(EmberError::Validation(format!(
                "invalid image reference `{}`",
                request.image
            )));
        }

        let vcpus = request.vcpus.unwrap_or(*self.config.get_default_vcpus());
        if vcpus == 0 || vcpus > MAX_VCPUS {
            return Err(EmberError::Validation(format!(
                "vcpus must be between 1 and {}, got {}",
                MAX_VCPUS, vcpus
            )));
        }

        let mem_mib = request.mem_mib.unwrap_or(*self.config.get_default_ram_mib());
        if mem_mib < MIN_MEM_MIB {
            return Err(EmberError::Validation(format!(
                "memory must be at least {} MiB, got {}",
                MIN_MEM_MIB, mem_mib
            )));
        }

        Ok((vcpus, mem_mib))
    }

    fn ensure_accepting(&self) -> EmberResult<()> {
        if self.shutting_down.load(Ordering::SeqCst) {
            return Err(shutting_down_error());
        }
        Ok(())
    }

    /// Next rootfs index whose image path is free. Indexes are never reused within a process, so
    /// a failed VM kept for inspection never shares its disk with a new one.
    async fn next_rootfs_index(&self, name: &str) -> u64 {
        loop {
            let index = self.rootfs_index.fetch_add(1, Ordering::SeqCst);
            let path = self.rootfs.image_path(index, name);
            if !tokio::fs::try_exists(&path).await.unwrap_or(false) {
                return index;
            }
        }
    }

    /// Id of the registered VM booted from `rootfs_path`, if any.
    async fn rootfs_owner(&self, rootfs_path: &Path) -> Option<String> {
        self.registry
            .records()
            .await
            .into_iter()
            .find(|record| record.get_rootfs().get_path() == rootfs_path)
            .map(|record| record.get_id().clone())
    }

    fn resolve_snapshot_base(&self, base: &Path) -> PathBuf {
        if base.is_absolute() {
            base.to_path_buf()
        } else {
            self.config.snapshot_dir().join(base)
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn shutting_down_error() -> EmberError {
    EmberError::InvalidState("control plane is shutting down".to_string())
}

fn ensure_started(record: &VmRecord) -> EmberResult<()> {
    match record.state() {
        VmState::Started => Ok(()),
        state => Err(EmberError::InvalidState(format!(
            "vm {} is {}",
            record.get_id(),
            state
        ))),
    }
}

async fn discard_rootfs(rootfs: &RootfsArtifact) {
    if let Err(e) = rootfs.remove().await {
        tracing::warn!(path = %rootfs.get_path().display(), error = %e, "failed to remove rootfs");
    }
}

/// Puts the snapshot's disk copy back at `rootfs_path`. Returns whether a copy was made.
async fn restore_disk(disk_path: Option<&Path>, rootfs_path: &Path) -> EmberResult<bool> {
    match disk_path {
        Some(disk) if tokio::fs::try_exists(disk).await? => {
            if let Some(parent) = rootfs_path.parent() {
                tokio::fs::create_dir_all(parent).await?;
            }
            tokio::fs::copy(disk, rootfs_path).await?;
            Ok(true)
        }
        _ if tokio::fs::try_exists(rootfs_path).await? => Ok(false),
        _ => Err(EmberError::Validation(format!(
            "root disk {} for snapshot is missing",
            rootfs_path.display()
        ))),
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl ShutdownTarget for VmManager {
    async fn shutdown_all(&self, mode: ShutdownMode) {
        VmManager::shutdown_all(self, mode).await
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

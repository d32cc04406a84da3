use std::{
    net::Ipv4Addr,
    path::PathBuf,
    sync::{Arc, Mutex, MutexGuard, OnceLock, PoisonError},
};

use chrono::{DateTime, Utc};
use getset::Getters;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;

use crate::{
    network::NetworkIdentity,
    rootfs::RootfsArtifact,
    vm::{HypervisorConfig, Machine, MachineExit, VmState},
    EmberResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// One VM known to the control plane.
///
/// Immutable facts are plain fields. Lifecycle state sits behind its own lock so the background
/// exit watcher and request handlers can update it concurrently.
#[derive(Getters)]
#[getset(get = "pub with_prefix")]
pub struct VmRecord {
    /// Unique id.
    id: String,

    /// Name given at creation.
    name: String,

    /// Container image the rootfs was built from.
    image: String,

    /// Addressing of the VM.
    identity: NetworkIdentity,

    /// The VM's root disk.
    rootfs: RootfsArtifact,

    /// Launch config.
    config: HypervisorConfig,

    /// When the record was created.
    created_at: DateTime<Utc>,

    #[getset(skip)]
    status: Mutex<VmStatus>,

    #[getset(skip)]
    machine: OnceLock<Arc<dyn Machine>>,

    #[getset(skip)]
    watcher: Mutex<Option<JoinHandle<()>>>,

    #[getset(skip)]
    control: tokio::sync::Mutex<()>,
}

#[derive(Debug, Clone)]
struct VmStatus {
    state: VmState,
    paused: bool,
    stop_requested: bool,
    failure: Option<String>,
    pid: Option<u32>,
}

/// A point-in-time view of a VM, as returned by list and info.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VmInfo {
    /// Unique id.
    pub id: String,

    /// Name given at creation.
    pub name: String,

    /// Source container image.
    pub image: String,

    /// Lifecycle state.
    pub state: VmState,

    /// Whether the guest's vCPUs are paused. Only meaningful while `started`.
    pub paused: bool,

    /// Guest address.
    pub ip: Ipv4Addr,

    /// Guest default gateway.
    pub gateway: Ipv4Addr,

    /// Guest MAC address.
    pub mac: String,

    /// Host tap device.
    pub tap: String,

    /// Hypervisor pid, once launched.
    pub pid: Option<u32>,

    /// vCPUs.
    pub vcpus: u8,

    /// Guest memory in MiB.
    pub mem_mib: u32,

    /// Hypervisor API socket.
    pub socket_path: PathBuf,

    /// Root disk image.
    pub rootfs_path: PathBuf,

    /// When the VM was created.
    pub created_at: DateTime<Utc>,

    /// Why the VM failed, if it did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmRecord {
    /// Creates a record in the `created` state.
    pub fn new(
        id: impl Into<String>,
        name: impl Into<String>,
        image: impl Into<String>,
        identity: NetworkIdentity,
        rootfs: RootfsArtifact,
        config: HypervisorConfig,
    ) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            image: image.into(),
            identity,
            rootfs,
            config,
            created_at: Utc::now(),
            status: Mutex::new(VmStatus {
                state: VmState::Created,
                paused: false,
                stop_requested: false,
                failure: None,
                pid: None,
            }),
            machine: OnceLock::new(),
            watcher: Mutex::new(None),
            control: tokio::sync::Mutex::new(()),
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> VmState {
        self.status().state
    }

    /// Whether the guest is paused.
    pub fn is_paused(&self) -> bool {
        self.status().paused
    }

    /// The hypervisor, once started.
    pub fn machine(&self) -> Option<Arc<dyn Machine>> {
        self.machine.get().cloned()
    }

    /// Moves to `next`, failing on an illegal transition.
    pub fn transition(&self, next: VmState) -> EmberResult<()> {
        let mut status = self.status();
        let from = status.state;
        status.state = from.transition(next)?;
        drop(status);

        tracing::info!(vm_id = %self.id, from = %from, to = %next, "vm state changed");
        Ok(())
    }

    /// Records the running hypervisor and moves to `started`.
    pub fn mark_started(&self, machine: Arc<dyn Machine>) -> EmberResult<()> {
        self.transition(VmState::Started)?;
        self.status().pid = machine.pid();
        // A record is started at most once, so the cell is always empty here.
        let _ = self.machine.set(machine);
        Ok(())
    }

    /// Moves to `failed`, keeping `reason` for info.
    pub fn fail(&self, reason: impl Into<String>) -> EmberResult<()> {
        self.transition(VmState::Failed)?;
        self.status().failure = Some(reason.into());
        Ok(())
    }

    /// Settles the state after the hypervisor exited and returns it.
    ///
    /// A requested stop or a clean exit ends in `stopped`, anything else in `failed`. A record that
    /// is already terminal is left alone.
    pub fn finish(&self, exit: MachineExit) -> VmState {
        let mut status = self.status();
        if status.state.is_terminal() {
            return status.state;
        }

        let from = status.state;
        let next = if status.stop_requested || exit.success() {
            VmState::Stopped
        } else {
            status.failure = Some(format!("hypervisor exited unexpectedly with {}", exit));
            VmState::Failed
        };

        match from.transition(next) {
            Ok(state) => {
                status.state = state;
                status.paused = false;
                drop(status);
                tracing::info!(vm_id = %self.id, from = %from, to = %next, %exit, "vm state changed");
                next
            }
            Err(e) => {
                tracing::warn!(vm_id = %self.id, error = %e, "cannot settle vm state after exit");
                from
            }
        }
    }

    /// Marks the coming exit as intended. Returns whether a stop was already requested.
    pub fn request_stop(&self) -> bool {
        std::mem::replace(&mut self.status().stop_requested, true)
    }

    /// Records whether the guest is paused.
    pub fn set_paused(&self, paused: bool) {
        self.status().paused = paused;
    }

    /// Attaches the task watching the hypervisor for exit.
    pub fn attach_watcher(&self, handle: JoinHandle<()>) {
        *self.watcher_slot() = Some(handle);
    }

    /// Waits for the exit watcher to finish its cleanup. Returns immediately if there is none or
    /// another caller already waited for it.
    pub async fn join_watcher(&self) {
        let handle = self.watcher_slot().take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!(vm_id = %self.id, error = %e, "vm exit watcher failed");
            }
        }
    }

    /// Serializes control operations (pause, resume, snapshot) on this VM.
    pub async fn lock_control(&self) -> tokio::sync::MutexGuard<'_, ()> {
        self.control.lock().await
    }

    /// A point-in-time view of the record.
    pub fn info(&self) -> VmInfo {
        let status = self.status().clone();
        let machine = self.config.get_machine();

        VmInfo {
            id: self.id.clone(),
            name: self.name.clone(),
            image: self.image.clone(),
            state: status.state,
            paused: status.paused,
            ip: self.identity.get_ip(),
            gateway: self.identity.get_gateway(),
            mac: self.identity.get_mac().clone(),
            tap: self.identity.get_tap_name().clone(),
            pid: status.pid,
            vcpus: machine.vcpu_count,
            mem_mib: machine.mem_size_mib,
            socket_path: self.config.get_socket_path().clone(),
            rootfs_path: self.rootfs.get_path().clone(),
            created_at: self.created_at,
            failure: status.failure,
        }
    }

    fn status(&self) -> MutexGuard<'_, VmStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn watcher_slot(&self) -> MutexGuard<'_, Option<JoinHandle<()>>> {
        self.watcher.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl std::fmt::Debug for VmRecord {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VmRecord")
            .field("id", &self.id)
            .field("name", &self.name)
            .field("image", &self.image)
            .field("host_byte", &self.identity.get_host_byte())
            .field("status", &*self.status())
            .finish_non_exhaustive()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

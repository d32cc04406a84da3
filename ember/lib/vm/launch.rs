use std::{
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use async_trait::async_trait;
use nix::unistd::{chown, Gid, Uid};
use tokio::fs;

use crate::{config::JailerConfig, EmberError, EmberResult};

use super::{HypervisorConfig, JAILED_SOCKET_PATH};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// What to spawn for one VM and how the hypervisor will see its files.
#[derive(Debug, Clone)]
pub struct LaunchPlan {
    /// Program to execute.
    pub program: PathBuf,

    /// Its arguments.
    pub args: Vec<String>,

    /// Host path of the API socket the process will bind.
    pub socket_path: PathBuf,

    /// The config with paths translated to what the hypervisor process sees.
    pub api_config: HypervisorConfig,

    /// Host directory the hypervisor writes into, when it is confined to one.
    pub jail_root: Option<PathBuf>,
}

/// Turns a [`HypervisorConfig`] into a process to spawn.
#[async_trait]
pub trait LaunchStrategy: Send + Sync + 'static {
    /// Prepares the host for the launch and returns the command to run.
    async fn prepare(&self, config: &HypervisorConfig) -> EmberResult<LaunchPlan>;

    /// Removes whatever [`prepare`](Self::prepare) created, after the process has exited.
    async fn cleanup(&self, plan: &LaunchPlan) -> EmberResult<()>;
}

/// Runs the hypervisor binary directly as the current user.
#[derive(Debug, Clone)]
pub struct DirectLaunch {
    firecracker_binary: PathBuf,
}

/// Runs the hypervisor through the jailer, inside a per-VM chroot with dropped privileges.
#[derive(Debug, Clone)]
pub struct JailedLaunch {
    firecracker_binary: PathBuf,
    jailer: JailerConfig,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl DirectLaunch {
    /// Creates a strategy spawning `firecracker_binary`.
    pub fn new(firecracker_binary: impl Into<PathBuf>) -> Self {
        Self {
            firecracker_binary: firecracker_binary.into(),
        }
    }
}

impl JailedLaunch {
    /// Creates a strategy spawning `firecracker_binary` through the jailer described by `jailer`.
    pub fn new(firecracker_binary: impl Into<PathBuf>, jailer: JailerConfig) -> Self {
        Self {
            firecracker_binary: firecracker_binary.into(),
            jailer,
        }
    }

    /// Makes `source` visible at the top of the jail and returns its path inside the jail.
    ///
    /// A `writable` file must be hard linked so the guest writes land in `source`. Read-only
    /// inputs fall back to a copy when the link fails.
    async fn expose(&self, root: &Path, source: &Path, writable: bool) -> EmberResult<PathBuf> {
        let name = source.file_name().ok_or_else(|| {
            EmberError::Supervisor(format!("{} has no file name", source.display()))
        })?;
        let target = root.join(name);

        match fs::remove_file(&target).await {
            Err(e) if e.kind() != io::ErrorKind::NotFound => return Err(e.into()),
            _ => {}
        }

        // Hard links fail across filesystems.
        if let Err(e) = fs::hard_link(source, &target).await {
            if writable {
                return Err(EmberError::Supervisor(format!(
                    "cannot link writable disk {} into {}: {}",
                    source.display(),
                    root.display(),
                    e
                )));
            }
            fs::copy(source, &target).await?;
        }

        self.give_to_jail_user(&target)?;
        Ok(Path::new("/").join(name))
    }

    fn give_to_jail_user(&self, path: &Path) -> EmberResult<()> {
        chown(
            path,
            Some(Uid::from_raw(*self.jailer.get_uid())),
            Some(Gid::from_raw(*self.jailer.get_gid())),
        )
        .map_err(|e| {
            EmberError::Supervisor(format!("cannot chown {}: {}", path.display(), e))
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Picks the strategy matching the config: jailed when jailer parameters are present.
pub fn strategy_for(
    config: &HypervisorConfig,
    firecracker_binary: impl Into<PathBuf>,
) -> Arc<dyn LaunchStrategy> {
    match config.get_jailer() {
        Some(jailer) => Arc::new(JailedLaunch::new(firecracker_binary, jailer.clone())),
        None => Arc::new(DirectLaunch::new(firecracker_binary)),
    }
}

/// Host path of the jailer's chroot for a VM, `{chroot_base}/{exec name}/{vm_id}/root`.
pub fn jail_root(jailer: &JailerConfig, firecracker_binary: &Path, vm_id: &str) -> PathBuf {
    let exec_name = firecracker_binary
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "firecracker".to_string());

    jailer
        .get_chroot_base_dir()
        .join(exec_name)
        .join(vm_id)
        .join("root")
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl LaunchStrategy for DirectLaunch {
    async fn prepare(&self, config: &HypervisorConfig) -> EmberResult<LaunchPlan> {
        let socket_path = config.get_socket_path().clone();
        if let Some(parent) = socket_path.parent() {
            fs::create_dir_all(parent).await?;
        }

        Ok(LaunchPlan {
            program: self.firecracker_binary.clone(),
            args: vec![
                "--api-sock".to_string(),
                socket_path.to_string_lossy().into_owned(),
            ],
            socket_path,
            api_config: config.clone(),
            jail_root: None,
        })
    }

    async fn cleanup(&self, _plan: &LaunchPlan) -> EmberResult<()> {
        Ok(())
    }
}

#[async_trait]
impl LaunchStrategy for JailedLaunch {
    async fn prepare(&self, config: &HypervisorConfig) -> EmberResult<LaunchPlan> {
        let root = jail_root(&self.jailer, &self.firecracker_binary, config.get_vm_id());
        let run_dir = root.join("run");
        fs::create_dir_all(&run_dir).await?;
        self.give_to_jail_user(&root)?;
        self.give_to_jail_user(&run_dir)?;

        let mut exposed = Vec::new();
        exposed.push((
            config.get_kernel_image().clone(),
            self.expose(&root, config.get_kernel_image(), false).await?,
        ));
        for drive in config.get_drives() {
            exposed.push((
                drive.path_on_host.clone(),
                self.expose(&root, &drive.path_on_host, !drive.is_read_only)
                    .await?,
            ));
        }
        if let Some(snapshot) = config.get_snapshot() {
            for path in [snapshot.files.get_mem_path(), snapshot.files.get_state_path()] {
                exposed.push((path.clone(), self.expose(&root, path, false).await?));
            }
        }

        let api_config = config.map_paths(|host| {
            exposed
                .iter()
                .find(|(source, _)| source == host)
                .map(|(_, inside)| inside.clone())
                .unwrap_or_else(|| host.to_path_buf())
        });

        let args = vec![
            "--id".to_string(),
            config.get_vm_id().clone(),
            "--exec-file".to_string(),
            self.firecracker_binary.to_string_lossy().into_owned(),
            "--uid".to_string(),
            self.jailer.get_uid().to_string(),
            "--gid".to_string(),
            self.jailer.get_gid().to_string(),
            "--node".to_string(),
            self.jailer.get_numa_node().to_string(),
            "--chroot-base-dir".to_string(),
            self.jailer.get_chroot_base_dir().to_string_lossy().into_owned(),
            "--cgroup-version".to_string(),
            self.jailer.get_cgroup_version().to_string(),
            "--".to_string(),
            "--api-sock".to_string(),
            JAILED_SOCKET_PATH.to_string(),
        ];

        tracing::debug!(vm_id = %config.get_vm_id(), jail = %root.display(), "prepared jail");

        Ok(LaunchPlan {
            program: self.jailer.get_jailer_binary().clone(),
            args,
            socket_path: root.join(JAILED_SOCKET_PATH.trim_start_matches('/')),
            api_config,
            jail_root: Some(root),
        })
    }

    async fn cleanup(&self, plan: &LaunchPlan) -> EmberResult<()> {
        let Some(root) = &plan.jail_root else {
            return Ok(());
        };

        // The jailer creates `{chroot_base}/{exec}/{id}`; `root` is its `root` child.
        let vm_dir = root.parent().unwrap_or(root);
        match fs::remove_dir_all(vm_dir).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

use std::{
    fmt::{self, Display},
    io,
    path::{Path, PathBuf},
    process::Stdio,
    sync::Arc,
    time::Duration,
};

use async_trait::async_trait;
use tokio::{
    fs,
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    sync::watch,
};
use tokio_util::sync::CancellationToken;

use crate::{EmberError, EmberResult};

use super::{
    launch::{self, LaunchPlan, LaunchStrategy},
    BootSource, FirecrackerClient, HypervisorConfig, MemoryBackend, MemoryBackendType,
    SnapshotCreateParams, SnapshotFiles, SnapshotKind, SnapshotLoadParams,
};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// How often the API socket is polled while waiting for the hypervisor to come up.
const SOCKET_POLL_INTERVAL: Duration = Duration::from_millis(10);

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// How a hypervisor process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MachineExit {
    /// Exit code, absent when the process was killed by a signal.
    pub code: Option<i32>,
}

/// A running hypervisor process and its API.
#[async_trait]
pub trait Machine: Send + Sync + 'static {
    /// Pid of the hypervisor process.
    fn pid(&self) -> Option<u32>;

    /// Host path of the API socket.
    fn socket_path(&self) -> &Path;

    /// How the process ended, if it has.
    fn exit_status(&self) -> Option<MachineExit>;

    /// Resolves once the process has exited. Can be awaited any number of times.
    async fn wait(&self) -> MachineExit;

    /// Asks the guest to shut down.
    async fn send_ctrl_alt_del(&self) -> EmberResult<()>;

    /// Freezes the guest.
    async fn pause(&self) -> EmberResult<()>;

    /// Unfreezes the guest.
    async fn resume(&self) -> EmberResult<()>;

    /// Writes a snapshot of the paused guest to `files`.
    async fn create_snapshot(&self, files: &SnapshotFiles, kind: SnapshotKind) -> EmberResult<()>;

    /// Kills the process and waits for it to exit. Safe to call repeatedly.
    async fn kill(&self);
}

/// Launches hypervisor processes.
#[async_trait]
pub trait MachineDriver: Send + Sync + 'static {
    /// Spawns a hypervisor for `config` and returns once the guest is running, or, for a config
    /// carrying a snapshot, once the snapshot is loaded and the guest is still paused.
    ///
    /// No process is left behind when this fails.
    async fn launch(
        &self,
        config: &HypervisorConfig,
        cancel: &CancellationToken,
    ) -> EmberResult<Arc<dyn Machine>>;
}

/// Launches Firecracker, directly or through the jailer depending on the config.
#[derive(Debug, Clone)]
pub struct FirecrackerDriver {
    firecracker_binary: PathBuf,
    boot_timeout: Duration,
}

/// A Firecracker process spawned by [`FirecrackerDriver`].
#[derive(Debug)]
pub struct FirecrackerMachine {
    vm_id: String,
    pid: Option<u32>,
    client: FirecrackerClient,
    jail_root: Option<PathBuf>,
    exit: watch::Receiver<Option<MachineExit>>,
    kill: CancellationToken,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl MachineExit {
    /// Exit of a process whose status could not be collected.
    pub const UNKNOWN: MachineExit = MachineExit { code: None };

    /// Whether the process exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl FirecrackerDriver {
    /// Creates a driver for `firecracker_binary`, allowing `boot_timeout` for the API socket to
    /// appear and the guest to start.
    pub fn new(firecracker_binary: impl Into<PathBuf>, boot_timeout: Duration) -> Self {
        Self {
            firecracker_binary: firecracker_binary.into(),
            boot_timeout,
        }
    }

    async fn spawn(&self, plan: &LaunchPlan, vm_id: &str) -> EmberResult<Child> {
        let mut child = Command::new(&plan.program)
            .args(&plan.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                EmberError::Supervisor(format!(
                    "failed to spawn {}: {}",
                    plan.program.display(),
                    e
                ))
            })?;

        if let Some(stdout) = child.stdout.take() {
            tokio::spawn(forward_output(vm_id.to_string(), "stdout", stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            tokio::spawn(forward_output(vm_id.to_string(), "stderr", stderr));
        }

        Ok(child)
    }
}

impl FirecrackerMachine {
    async fn boot(
        &self,
        config: &HypervisorConfig,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> EmberResult<()> {
        let ready = async {
            self.wait_for_api().await;
            match config.get_snapshot() {
                Some(snapshot) => {
                    self.client
                        .load_snapshot(&SnapshotLoadParams {
                            snapshot_path: snapshot.files.get_state_path().clone(),
                            mem_backend: MemoryBackend {
                                backend_type: MemoryBackendType::File,
                                backend_path: snapshot.files.get_mem_path().clone(),
                            },
                            enable_diff_snapshots: snapshot.enable_diff_snapshots,
                            resume_vm: false,
                        })
                        .await
                }
                None => self.configure_and_start(config).await,
            }
        };

        tokio::select! {
            result = tokio::time::timeout(timeout, ready) => result.map_err(|_| {
                EmberError::Timeout(format!(
                    "vm {} was not ready within {}s",
                    self.vm_id,
                    timeout.as_secs_f32()
                ))
            })?,
            exit = self.wait_exit() => Err(EmberError::Supervisor(format!(
                "hypervisor for vm {} exited during boot with {}",
                self.vm_id, exit
            ))),
            _ = cancel.cancelled() => Err(EmberError::Cancelled(format!("boot of vm {}", self.vm_id))),
        }
    }

    async fn configure_and_start(&self, config: &HypervisorConfig) -> EmberResult<()> {
        self.client
            .put_boot_source(&BootSource {
                kernel_image_path: config.get_kernel_image().clone(),
                boot_args: config.get_boot_args().clone(),
            })
            .await?;

        for drive in config.get_drives() {
            self.client.put_drive(drive).await?;
        }

        self.client.put_machine_config(config.get_machine()).await?;

        for iface in config.get_network_interfaces() {
            self.client.put_network_interface(iface).await?;
        }

        self.client.start_instance().await
    }

    /// Polls until the API answers a request, not just a connect.
    async fn wait_for_api(&self) {
        loop {
            match self.client.describe_instance().await {
                Ok(instance) => {
                    tracing::debug!(vm_id = %self.vm_id, state = %instance["state"], "hypervisor api is up");
                    return;
                }
                Err(_) => tokio::time::sleep(SOCKET_POLL_INTERVAL).await,
            }
        }
    }

    async fn wait_exit(&self) -> MachineExit {
        let mut exit = self.exit.clone();
        let waited = exit.wait_for(Option::is_some).await.map(|status| *status);
        let status = match waited {
            Ok(status) => status,
            Err(_) => *exit.borrow(),
        };
        status.unwrap_or(MachineExit::UNKNOWN)
    }

    /// The path the hypervisor sees for `host`, and where it will appear on the host.
    fn jailed_target(&self, host: &Path) -> EmberResult<(PathBuf, PathBuf)> {
        match &self.jail_root {
            None => Ok((host.to_path_buf(), host.to_path_buf())),
            Some(root) => {
                let name = host.file_name().ok_or_else(|| {
                    EmberError::Supervisor(format!("{} has no file name", host.display()))
                })?;
                Ok((Path::new("/").join(name), root.join(name)))
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Removes a leftover API socket file. The hypervisor cannot bind its socket while one exists.
pub async fn remove_stale_socket(path: &Path) -> EmberResult<()> {
    match fs::remove_file(path).await {
        Ok(()) => {
            tracing::debug!(socket = %path.display(), "removed stale api socket");
            Ok(())
        }
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn forward_output(vm_id: String, stream: &'static str, output: impl AsyncRead + Unpin) {
    let mut lines = BufReader::new(output).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => tracing::info!(vm_id = %vm_id, vmm_stream = stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                tracing::debug!(vm_id = %vm_id, vmm_stream = stream, error = %e, "stopped reading hypervisor output");
                break;
            }
        }
    }
}

/// Owns the child process until it exits, then cleans up after the launch and publishes the
/// exit status.
async fn reap(
    mut child: Child,
    kill: CancellationToken,
    exit_tx: watch::Sender<Option<MachineExit>>,
    strategy: Arc<dyn LaunchStrategy>,
    plan: LaunchPlan,
    vm_id: String,
) {
    let status = tokio::select! {
        status = child.wait() => status,
        _ = kill.cancelled() => {
            if let Err(e) = child.start_kill() {
                tracing::warn!(vm_id = %vm_id, error = %e, "failed to kill hypervisor");
            }
            child.wait().await
        }
    };

    let exit = match status {
        Ok(status) => MachineExit {
            code: status.code(),
        },
        Err(e) => {
            tracing::warn!(vm_id = %vm_id, error = %e, "failed to collect hypervisor exit status");
            MachineExit::UNKNOWN
        }
    };

    tracing::info!(vm_id = %vm_id, status = %exit, "hypervisor exited");

    if let Err(e) = strategy.cleanup(&plan).await {
        tracing::warn!(vm_id = %vm_id, error = %e, "failed to clean up after hypervisor");
    }

    exit_tx.send_replace(Some(exit));
}

async fn move_file(from: &Path, to: &Path) -> EmberResult<()> {
    if from == to {
        return Ok(());
    }

    if fs::rename(from, to).await.is_err() {
        fs::copy(from, to).await?;
        fs::remove_file(from).await?;
    }
    Ok(())
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for MachineExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.code {
            Some(code) => write!(f, "exit status {}", code),
            None => write!(f, "termination by signal"),
        }
    }
}

#[async_trait]
impl MachineDriver for FirecrackerDriver {
    async fn launch(
        &self,
        config: &HypervisorConfig,
        cancel: &CancellationToken,
    ) -> EmberResult<Arc<dyn Machine>> {
        let vm_id = config.get_vm_id().clone();
        let strategy = launch::strategy_for(config, &self.firecracker_binary);
        let plan = strategy.prepare(config).await?;

        let child = match self.spawn(&plan, &vm_id).await {
            Ok(child) => child,
            Err(e) => {
                if let Err(cleanup) = strategy.cleanup(&plan).await {
                    tracing::warn!(vm_id = %vm_id, error = %cleanup, "failed to clean up after launch");
                }
                return Err(e);
            }
        };

        let pid = child.id();
        tracing::info!(vm_id = %vm_id, pid, socket = %plan.socket_path.display(), "spawned hypervisor");

        let (exit_tx, exit_rx) = watch::channel(None);
        let kill = CancellationToken::new();
        let machine = Arc::new(FirecrackerMachine {
            vm_id: vm_id.clone(),
            pid,
            client: FirecrackerClient::new(&plan.socket_path),
            jail_root: plan.jail_root.clone(),
            exit: exit_rx,
            kill: kill.clone(),
        });

        let api_config = plan.api_config.clone();
        tokio::spawn(reap(child, kill, exit_tx, strategy, plan, vm_id.clone()));

        if let Err(e) = machine.boot(&api_config, self.boot_timeout, cancel).await {
            tracing::warn!(vm_id = %vm_id, error = %e, "hypervisor failed to become ready");
            machine.kill().await;
            return Err(e);
        }

        tracing::info!(vm_id = %vm_id, restored = api_config.is_restore(), "vm is ready");
        Ok(machine)
    }
}

#[async_trait]
impl Machine for FirecrackerMachine {
    fn pid(&self) -> Option<u32> {
        self.pid
    }

    fn socket_path(&self) -> &Path {
        self.client.socket_path()
    }

    fn exit_status(&self) -> Option<MachineExit> {
        *self.exit.borrow()
    }

    async fn wait(&self) -> MachineExit {
        self.wait_exit().await
    }

    async fn send_ctrl_alt_del(&self) -> EmberResult<()> {
        self.client.send_ctrl_alt_del().await
    }

    async fn pause(&self) -> EmberResult<()> {
        self.client.pause().await
    }

    async fn resume(&self) -> EmberResult<()> {
        self.client.resume().await
    }

    async fn create_snapshot(&self, files: &SnapshotFiles, kind: SnapshotKind) -> EmberResult<()> {
        let (state_inside, state_on_host) = self.jailed_target(files.get_state_path())?;
        let (mem_inside, mem_on_host) = self.jailed_target(files.get_mem_path())?;

        self.client
            .create_snapshot(&SnapshotCreateParams {
                snapshot_type: kind,
                snapshot_path: state_inside,
                mem_file_path: mem_inside,
            })
            .await?;

        move_file(&state_on_host, files.get_state_path()).await?;
        move_file(&mem_on_host, files.get_mem_path()).await?;
        Ok(())
    }

    async fn kill(&self) {
        self.kill.cancel();
        self.wait_exit().await;
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::os::unix::fs::PermissionsExt;

    use serial_test::serial;
    use tempfile::TempDir;

    use crate::{
        config::{EmberConfig, NetworkConfig},
        network::NetworkIdentity,
    };

    use super::*;

    fn config(dir: &TempDir) -> HypervisorConfig {
        HypervisorConfig::compose(
            "vm-test",
            &NetworkIdentity::derive(&NetworkConfig::default(), 6),
            &dir.path().join("6-a.ext4"),
            1,
            256,
            &EmberConfig::builder().socket_dir(dir.path()).build(),
        )
    }

    #[test]
    fn test_exit_display() {
        assert_eq!(MachineExit { code: Some(3) }.to_string(), "exit status 3");
        assert_eq!(MachineExit::UNKNOWN.to_string(), "termination by signal");
        assert!(MachineExit { code: Some(0) }.success());
    }

    #[test_log::test(tokio::test)]
    async fn test_missing_binary_is_a_supervisor_error() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let driver = FirecrackerDriver::new(
            dir.path().join("no-such-firecracker"),
            Duration::from_secs(1),
        );

        let err = driver
            .launch(&config(&dir), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EmberError::Supervisor(_)));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_early_exit_fails_launch() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let driver = FirecrackerDriver::new("false", Duration::from_secs(5));

        let err = driver
            .launch(&config(&dir), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(err.to_string().contains("exited during boot"));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    #[serial]
    async fn test_boot_timeout_kills_process() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let script = dir.path().join("silent-vmm");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n")?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;

        let driver = FirecrackerDriver::new(&script, Duration::from_millis(200));
        let err = driver
            .launch(&config(&dir), &CancellationToken::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, EmberError::Timeout(_)));
        Ok(())
    }

    #[test_log::test(tokio::test)]
    #[serial]
    async fn test_cancelled_boot() -> anyhow::Result<()> {
        let dir = TempDir::new()?;
        let script = dir.path().join("silent-vmm");
        std::fs::write(&script, "#!/bin/sh\nexec sleep 30\n")?;
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755))?;

        let cancel = CancellationToken::new();
        cancel.cancel();

        let driver = FirecrackerDriver::new(&script, Duration::from_secs(5));
        let err = driver.launch(&config(&dir), &cancel).await.err().unwrap();
        assert!(matches!(err, EmberError::Cancelled(_)));
        Ok(())
    }
}

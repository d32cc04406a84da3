//! In-memory stand-ins for the host and the hypervisor, used by unit tests.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering},
        Arc, Mutex, MutexGuard,
    },
};

use async_trait::async_trait;
use emberutils::{CommandOutput, CommandRunner, EmberutilsResult, HostCommand};
use tokio::sync::{watch, Semaphore};
use tokio_util::sync::CancellationToken;

use crate::{
    vm::{HypervisorConfig, Machine, MachineDriver, MachineExit, SnapshotFiles, SnapshotKind},
    EmberError, EmberResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A [`CommandRunner`] that models just enough host state (tap devices, iptables rules, mounts,
/// docker containers) for provisioning and rootfs tests to assert on.
#[derive(Debug, Default)]
pub(crate) struct FakeHost {
    state: Mutex<HostState>,
}

/// A [`MachineDriver`] whose machines live in memory. Restored machines take their marker from
/// the snapshot's memory file, so tests can tell which guest a restore brought back.
#[derive(Debug)]
pub(crate) struct FakeDriver {
    machines: Mutex<Vec<Arc<FakeMachine>>>,
    launches: AtomicUsize,
    fail: AtomicBool,
    unresponsive: AtomicBool,
    held: AtomicBool,
    gate: Semaphore,
    next_pid: AtomicU32,
}

/// A hypervisor that exists only as state, apart from an empty file standing in for its API
/// socket.
#[derive(Debug)]
pub(crate) struct FakeMachine {
    pid: u32,
    socket_path: PathBuf,
    marker: String,
    responsive: bool,
    track_dirty_pages: bool,
    paused: AtomicBool,
    ctrl_alt_del: AtomicUsize,
    exit: watch::Sender<Option<MachineExit>>,
}

#[derive(Debug, Default)]
struct HostState {
    calls: Vec<String>,
    failures: Vec<String>,
    taps: HashSet<String>,
    rules: Vec<String>,
    mounts: HashSet<String>,
    containers: HashSet<String>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl FakeHost {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    /// Makes every command whose command line contains `pattern` exit with status 1.
    pub(crate) fn fail_when(&self, pattern: &str) {
        self.lock().failures.push(pattern.to_string());
    }

    pub(crate) fn add_tap(&self, tap: &str) {
        self.lock().taps.insert(tap.to_string());
    }

    pub(crate) fn tap_exists(&self, tap: &str) -> bool {
        self.lock().taps.contains(tap)
    }

    pub(crate) fn tap_count(&self) -> usize {
        self.lock().taps.len()
    }

    pub(crate) fn rule_count(&self) -> usize {
        self.lock().rules.len()
    }

    pub(crate) fn mount_count(&self) -> usize {
        self.lock().mounts.len()
    }

    pub(crate) fn container_count(&self) -> usize {
        self.lock().containers.len()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    /// Calls that change host state, skipping existence checks.
    pub(crate) fn mutating_calls(&self) -> Vec<String> {
        self.calls()
            .into_iter()
            .filter(|c| !c.contains("link show"))
            .filter(|c| !(c.contains("iptables") && c.contains(" -C ")))
            .collect()
    }

    pub(crate) fn count_calls(&self, pattern: &str) -> usize {
        self.lock()
            .calls
            .iter()
            .filter(|c| c.contains(pattern))
            .count()
    }

    fn lock(&self) -> MutexGuard<'_, HostState> {
        self.state.lock().expect("fake host state poisoned")
    }
}

impl FakeDriver {
    pub(crate) fn new() -> Self {
        Self {
            machines: Mutex::new(Vec::new()),
            launches: AtomicUsize::new(0),
            fail: AtomicBool::new(false),
            unresponsive: AtomicBool::new(false),
            held: AtomicBool::new(false),
            gate: Semaphore::new(0),
            next_pid: AtomicU32::new(1000),
        }
    }

    /// Makes later launches block until [`release_launches`](Self::release_launches).
    pub(crate) fn hold_launches(&self) {
        self.held.store(true, Ordering::SeqCst);
    }

    /// Lets held launches, and every later one, through.
    pub(crate) fn release_launches(&self) {
        self.gate.close();
    }

    /// Makes every later launch fail.
    pub(crate) fn fail_launches(&self) {
        self.fail.store(true, Ordering::SeqCst);
    }

    /// Makes later machines ignore shutdown requests.
    pub(crate) fn ignore_ctrl_alt_del(&self) {
        self.unresponsive.store(true, Ordering::SeqCst);
    }

    /// Machines launched successfully, in launch order.
    pub(crate) fn machines(&self) -> Vec<Arc<FakeMachine>> {
        self.machines
            .lock()
            .expect("fake driver poisoned")
            .clone()
    }

    /// Launch attempts, successful or not.
    pub(crate) fn launch_count(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    /// Machines whose process has not exited.
    pub(crate) fn running_count(&self) -> usize {
        self.machines()
            .iter()
            .filter(|m| m.exit_status().is_none())
            .count()
    }
}

impl FakeMachine {
    pub(crate) fn new(pid: u32, socket_path: impl Into<PathBuf>, marker: impl Into<String>) -> Self {
        Self {
            pid,
            socket_path: socket_path.into(),
            marker: marker.into(),
            responsive: true,
            track_dirty_pages: false,
            paused: AtomicBool::new(false),
            ctrl_alt_del: AtomicUsize::new(0),
            exit: watch::channel(None).0,
        }
    }

    /// Identifies the guest this machine runs.
    pub(crate) fn marker(&self) -> &str {
        &self.marker
    }

    pub(crate) fn is_paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    pub(crate) fn ctrl_alt_del_count(&self) -> usize {
        self.ctrl_alt_del.load(Ordering::SeqCst)
    }

    /// Makes the process exit on its own with `code`.
    pub(crate) fn crash(&self, code: i32) {
        self.exit_with(Some(code));
    }

    fn exit_with(&self, code: Option<i32>) {
        self.exit.send_if_modified(|exit| {
            if exit.is_some() {
                return false;
            }
            *exit = Some(MachineExit { code });
            true
        });
    }

    fn ensure_running(&self) -> EmberResult<()> {
        match self.exit_status() {
            Some(_) => Err(EmberError::HypervisorTransport(format!(
                "cannot connect to {}: connection refused",
                self.socket_path.display()
            ))),
            None => Ok(()),
        }
    }
}

impl HostState {
    fn simulate(&mut self, command: &HostCommand) -> i32 {
        let args: Vec<&str> = command.get_args().iter().map(String::as_str).collect();
        match (command.get_program(), args.as_slice()) {
            ("ip", ["link", "show", "dev", tap]) => exit(self.taps.contains(*tap)),
            ("ip", ["link", "del", tap]) => exit(self.taps.remove(*tap)),
            ("ip", ["tuntap", "add", "dev", tap, ..]) => exit(self.taps.insert(tap.to_string())),
            ("iptables", _) => self.simulate_iptables(&args),
            ("mount", [.., target]) => exit(self.mounts.insert(target.to_string())),
            ("umount", [target]) => {
                if self.mounts.remove(*target) {
                    0
                } else {
                    32
                }
            }
            ("docker", ["create", "--name", name, _image]) => {
                exit(self.containers.insert(name.to_string()))
            }
            ("docker", ["export", name, "-o", archive]) => {
                if !self.containers.contains(*name) {
                    return 1;
                }
                exit(std::fs::write(archive, b"").is_ok())
            }
            ("docker", ["rm", "-f", name]) => {
                self.containers.remove(*name);
                0
            }
            _ => 0,
        }
    }

    fn simulate_iptables(&mut self, args: &[&str]) -> i32 {
        let Some(position) = args.iter().position(|a| matches!(*a, "-A" | "-D" | "-C")) else {
            return 0;
        };

        let mut key: Vec<&str> = args.to_vec();
        let action = key.remove(position);
        let key = key.join(" ");

        match action {
            "-A" => {
                self.rules.push(key);
                0
            }
            "-D" => match self.rules.iter().position(|r| *r == key) {
                Some(index) => {
                    self.rules.remove(index);
                    0
                }
                None => 1,
            },
            _ => exit(self.rules.contains(&key)),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn exit(ok: bool) -> i32 {
    if ok {
        0
    } else {
        1
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

#[async_trait]
impl CommandRunner for FakeHost {
    async fn output(&self, command: &HostCommand) -> EmberutilsResult<CommandOutput> {
        let line = command.to_string();
        let mut state = self.lock();
        state.calls.push(line.clone());

        if state.failures.iter().any(|f| line.contains(f.as_str())) {
            return Ok(CommandOutput {
                code: Some(1),
                stdout: String::new(),
                stderr: "injected failure".to_string(),
            });
        }

        let code = state.simulate(command);
        Ok(CommandOutput {
            code: Some(code),
            ..Default::default()
        })
    }
}

#[async_trait]
impl MachineDriver for FakeDriver {
    async fn launch(
        &self,
        config: &HypervisorConfig,
        cancel: &CancellationToken,
    ) -> EmberResult<Arc<dyn Machine>> {
        self.launches.fetch_add(1, Ordering::SeqCst);

        if self.held.load(Ordering::SeqCst) {
            // Resolves with an error once the gate is closed.
            let _ = self.gate.acquire().await;
        }

        if cancel.is_cancelled() {
            return Err(EmberError::Cancelled(format!("boot of vm {}", config.get_vm_id())));
        }
        if self.fail.load(Ordering::SeqCst) {
            return Err(EmberError::Supervisor("injected launch failure".to_string()));
        }

        let (marker, track_dirty_pages) = match config.get_snapshot() {
            Some(snapshot) => (
                tokio::fs::read_to_string(snapshot.files.get_mem_path()).await?,
                snapshot.enable_diff_snapshots,
            ),
            None => (
                config.get_vm_id().clone(),
                config.get_machine().track_dirty_pages,
            ),
        };

        let socket_path = config.get_socket_path();
        if let Some(parent) = socket_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(socket_path, b"").await?;

        let mut machine = FakeMachine::new(
            self.next_pid.fetch_add(1, Ordering::SeqCst),
            config.get_socket_path(),
            marker,
        );
        machine.responsive = !self.unresponsive.load(Ordering::SeqCst);
        machine.track_dirty_pages = track_dirty_pages;
        machine.paused = AtomicBool::new(config.is_restore());

        let machine = Arc::new(machine);
        self.machines
            .lock()
            .expect("fake driver poisoned")
            .push(Arc::clone(&machine));
        Ok(machine)
    }
}

#[async_trait]
impl Machine for FakeMachine {
    fn pid(&self) -> Option<u32> {
        Some(self.pid)
    }

    fn socket_path(&self) -> &Path {
        &self.socket_path
    }

    fn exit_status(&self) -> Option<MachineExit> {
        *self.exit.borrow()
    }

    async fn wait(&self) -> MachineExit {
        let mut exit = self.exit.subscribe();
        exit.wait_for(Option::is_some)
            .await
            .map(|status| *status)
            .ok()
            .flatten()
            .unwrap_or(MachineExit::UNKNOWN)
    }

    async fn send_ctrl_alt_del(&self) -> EmberResult<()> {
        self.ensure_running()?;
        self.ctrl_alt_del.fetch_add(1, Ordering::SeqCst);
        if self.responsive {
            self.exit_with(Some(0));
        }
        Ok(())
    }

    async fn pause(&self) -> EmberResult<()> {
        self.ensure_running()?;
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self) -> EmberResult<()> {
        self.ensure_running()?;
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn create_snapshot(&self, files: &SnapshotFiles, kind: SnapshotKind) -> EmberResult<()> {
        self.ensure_running()?;
        if !self.is_paused() {
            return Err(EmberError::Hypervisor {
                method: "PUT".to_string(),
                path: "/snapshot/create".to_string(),
                status: 400,
                body: "the vm must be paused".to_string(),
            });
        }
        if kind == SnapshotKind::Diff && !self.track_dirty_pages {
            return Err(EmberError::Hypervisor {
                method: "PUT".to_string(),
                path: "/snapshot/create".to_string(),
                status: 400,
                body: "diff snapshots are not allowed with dirty page tracking disabled"
                    .to_string(),
            });
        }

        tokio::fs::write(files.get_mem_path(), &self.marker).await?;
        tokio::fs::write(files.get_state_path(), format!("{:?}", kind)).await?;
        Ok(())
    }

    async fn kill(&self) {
        self.exit_with(None);
    }
}

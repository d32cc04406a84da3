use std::{io, sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;

use crate::{
    management::VmRecord,
    network::{IdentityLease, NetworkIdentity, NetworkProvisioner},
    vm::{self, HypervisorConfig, Machine, MachineDriver},
    EmberResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Brings hypervisors up and down, keeping the host network and the VM's record in step with the
/// process.
pub struct VmmSupervisor {
    provisioner: Arc<NetworkProvisioner>,
    driver: Arc<dyn MachineDriver>,
    shutdown_grace: Duration,
}

/// How running VMs are brought down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ShutdownMode {
    /// Ask the guest to shut down and kill the hypervisor if it has not exited within the grace
    /// period.
    Graceful,

    /// Kill the hypervisor right away.
    Forced,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl VmmSupervisor {
    /// Creates a supervisor that wires networks with `provisioner` and spawns hypervisors with
    /// `driver`.
    pub fn new(
        provisioner: Arc<NetworkProvisioner>,
        driver: Arc<dyn MachineDriver>,
        shutdown_grace: Duration,
    ) -> Self {
        Self {
            provisioner,
            driver,
            shutdown_grace,
        }
    }

    /// Clears a stale API socket, provisions the network, launches the hypervisor and waits until
    /// the guest runs.
    ///
    /// A config carrying a snapshot is resumed once loaded. On success the record is `started`.
    /// On failure everything set up so far is undone, no process is left running and the record
    /// is `failed`.
    pub async fn start(
        &self,
        record: &VmRecord,
        config: &HypervisorConfig,
        cancel: &CancellationToken,
    ) -> EmberResult<Arc<dyn Machine>> {
        let identity = record.get_identity();

        if let Err(e) = vm::remove_stale_socket(config.get_socket_path()).await {
            self.mark_failed(record, &e.to_string());
            return Err(e);
        }

        if let Err(e) = self.provisioner.provision(identity, cancel).await {
            self.mark_failed(record, &e.to_string());
            return Err(e);
        }

        let machine = match self.driver.launch(config, cancel).await {
            Ok(machine) => machine,
            Err(e) => {
                self.teardown_network(identity).await;
                self.mark_failed(record, &e.to_string());
                return Err(e);
            }
        };

        let started = async {
            if config.is_restore() {
                machine.resume().await?;
            }
            record.mark_started(Arc::clone(&machine))
        };

        if let Err(e) = started.await {
            machine.kill().await;
            self.teardown_network(identity).await;
            self.mark_failed(record, &e.to_string());
            return Err(e);
        }

        tracing::info!(
            vm_id = %record.get_id(),
            pid = machine.pid(),
            ip = %identity.get_ip(),
            "vm started"
        );
        Ok(machine)
    }

    /// Spawns the task that waits for the hypervisor to exit.
    ///
    /// When it exits the record settles in a terminal state, the host network is torn down, the
    /// socket file is removed and `lease` is dropped, returning the identity to the pool.
    pub fn watch(
        self: &Arc<Self>,
        record: Arc<VmRecord>,
        machine: Arc<dyn Machine>,
        lease: IdentityLease,
    ) {
        let supervisor = Arc::clone(self);
        let watched = Arc::clone(&record);

        let handle = tokio::spawn(async move {
            let exit = machine.wait().await;
            let state = watched.finish(exit);

            supervisor.teardown_network(watched.get_identity()).await;
            if let Err(e) = tokio::fs::remove_file(machine.socket_path()).await {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(vm_id = %watched.get_id(), error = %e, "failed to remove api socket");
                }
            }

            drop(lease);
            tracing::info!(vm_id = %watched.get_id(), state = %state, "vm resources released");
        });

        record.attach_watcher(handle);
    }

    /// Brings the VM down according to `mode` and waits for the hypervisor to exit.
    ///
    /// Marks the exit as requested, so the record ends in `stopped`. Calling this on a VM whose
    /// hypervisor already exited is a no-op.
    pub async fn shutdown(&self, record: &VmRecord, mode: ShutdownMode) {
        let Some(machine) = record.machine() else {
            return;
        };

        record.request_stop();
        if machine.exit_status().is_some() {
            return;
        }

        let vm_id = record.get_id();
        match mode {
            ShutdownMode::Forced => {
                tracing::info!(vm_id = %vm_id, "killing hypervisor");
                machine.kill().await;
            }
            ShutdownMode::Graceful => {
                // A paused guest cannot react to the reset.
                if record.is_paused() {
                    if let Err(e) = machine.resume().await {
                        tracing::debug!(vm_id = %vm_id, error = %e, "failed to resume before shutdown");
                    }
                }

                if let Err(e) = machine.send_ctrl_alt_del().await {
                    tracing::warn!(vm_id = %vm_id, error = %e, "graceful shutdown request failed, killing hypervisor");
                    machine.kill().await;
                    return;
                }

                if tokio::time::timeout(self.shutdown_grace, machine.wait())
                    .await
                    .is_err()
                {
                    tracing::warn!(
                        vm_id = %vm_id,
                        grace_secs = self.shutdown_grace.as_secs(),
                        "guest did not shut down in time, killing hypervisor"
                    );
                    machine.kill().await;
                }
            }
        }
    }

    async fn teardown_network(&self, identity: &NetworkIdentity) {
        if let Err(e) = self.provisioner.teardown(identity).await {
            tracing::warn!(tap = %identity.get_tap_name(), error = %e, "failed to tear down vm network");
        }
    }

    fn mark_failed(&self, record: &VmRecord, reason: &str) {
        if let Err(e) = record.fail(reason) {
            tracing::warn!(vm_id = %record.get_id(), error = %e, "cannot mark vm as failed");
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tempfile::TempDir;

    use crate::{
        config::{EmberConfig, NetworkConfig},
        network::IdentityAllocator,
        rootfs::RootfsArtifact,
        utils::fakes::{FakeDriver, FakeHost},
        vm::{MachineExit, VmState},
        EmberError,
    };

    use super::*;

    struct Harness {
        host: Arc<FakeHost>,
        driver: Arc<FakeDriver>,
        supervisor: Arc<VmmSupervisor>,
        allocator: Arc<IdentityAllocator>,
        _dir: TempDir,
        socket_dir: std::path::PathBuf,
    }

    impl Harness {
        fn new(grace: Duration) -> Self {
            let dir = TempDir::new().unwrap();
            let host = Arc::new(FakeHost::new());
            let driver = Arc::new(FakeDriver::new());
            let provisioner = Arc::new(NetworkProvisioner::new(host.clone(), "eth0"));
            Self {
                supervisor: Arc::new(VmmSupervisor::new(provisioner, driver.clone(), grace)),
                allocator: Arc::new(IdentityAllocator::new(NetworkConfig::default())),
                socket_dir: dir.path().to_path_buf(),
                host,
                driver,
                _dir: dir,
            }
        }

        fn record(&self, lease: &IdentityLease) -> (Arc<VmRecord>, HypervisorConfig) {
            let config = HypervisorConfig::compose(
                "vm-test",
                lease,
                Path::new("/srv/rootfs/x.ext4"),
                1,
                256,
                &EmberConfig::builder().socket_dir(&self.socket_dir).build(),
            );
            let record = Arc::new(VmRecord::new(
                "vm-test",
                "x",
                "alpine",
                lease.identity().clone(),
                RootfsArtifact::new("/srv/rootfs/x.ext4"),
                config.clone(),
            ));
            (record, config)
        }
    }

    #[test_log::test(tokio::test)]
    async fn test_start_and_graceful_shutdown_release_everything() -> anyhow::Result<()> {
        let harness = Harness::new(Duration::from_secs(5));
        let lease = harness.allocator.allocate()?;
        let (record, config) = harness.record(&lease);

        let machine = harness
            .supervisor
            .start(&record, &config, &CancellationToken::new())
            .await?;
        assert_eq!(record.state(), VmState::Started);
        assert_eq!(harness.host.tap_count(), 1);

        harness
            .supervisor
            .watch(record.clone(), machine.clone(), lease);
        harness
            .supervisor
            .shutdown(&record, ShutdownMode::Graceful)
            .await;
        record.join_watcher().await;

        assert_eq!(record.state(), VmState::Stopped);
        assert_eq!(machine.exit_status(), Some(MachineExit { code: Some(0) }));
        assert_eq!(harness.host.tap_count(), 0);
        assert_eq!(harness.host.rule_count(), 0);
        assert_eq!(harness.allocator.in_use(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unresponsive_guest_is_killed_after_grace() -> anyhow::Result<()> {
        let harness = Harness::new(Duration::from_millis(50));
        harness.driver.ignore_ctrl_alt_del();
        let lease = harness.allocator.allocate()?;
        let (record, config) = harness.record(&lease);

        let machine = harness
            .supervisor
            .start(&record, &config, &CancellationToken::new())
            .await?;
        harness.supervisor.watch(record.clone(), machine.clone(), lease);

        harness
            .supervisor
            .shutdown(&record, ShutdownMode::Graceful)
            .await;
        record.join_watcher().await;

        assert_eq!(machine.exit_status(), Some(MachineExit::UNKNOWN));
        assert_eq!(record.state(), VmState::Stopped);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_launch_failure_undoes_network_and_fails_record() -> anyhow::Result<()> {
        let harness = Harness::new(Duration::from_secs(1));
        harness.driver.fail_launches();
        let lease = harness.allocator.allocate()?;
        let (record, config) = harness.record(&lease);

        let err = harness
            .supervisor
            .start(&record, &config, &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, EmberError::Supervisor(_)));
        assert_eq!(record.state(), VmState::Failed);
        assert_eq!(harness.host.tap_count(), 0);
        assert_eq!(harness.host.rule_count(), 0);
        assert!(harness.driver.machines().is_empty());
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_provisioning_failure_never_launches() -> anyhow::Result<()> {
        let harness = Harness::new(Duration::from_secs(1));
        harness.host.fail_when("MASQUERADE");
        let lease = harness.allocator.allocate()?;
        let (record, config) = harness.record(&lease);

        let err = harness
            .supervisor
            .start(&record, &config, &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, EmberError::Provisioning { .. }));
        assert_eq!(record.state(), VmState::Failed);
        assert_eq!(harness.driver.launch_count(), 0);
        assert_eq!(harness.host.tap_count(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unremovable_socket_fails_before_provisioning() -> anyhow::Result<()> {
        let harness = Harness::new(Duration::from_secs(1));
        let lease = harness.allocator.allocate()?;
        let (record, config) = harness.record(&lease);

        // A non-empty directory cannot be removed as a file.
        std::fs::create_dir_all(config.get_socket_path().join("occupied"))?;

        let err = harness
            .supervisor
            .start(&record, &config, &CancellationToken::new())
            .await
            .err()
            .unwrap();

        assert!(matches!(err, EmberError::Io(_)), "{:?}", err);
        assert_eq!(record.state(), VmState::Failed);
        assert!(harness.host.calls().is_empty());
        assert_eq!(harness.driver.launch_count(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_unexpected_exit_marks_failed_and_cleans_up() -> anyhow::Result<()> {
        let harness = Harness::new(Duration::from_secs(1));
        let lease = harness.allocator.allocate()?;
        let (record, config) = harness.record(&lease);

        let machine = harness
            .supervisor
            .start(&record, &config, &CancellationToken::new())
            .await?;
        harness.supervisor.watch(record.clone(), machine, lease);

        harness.driver.machines()[0].crash(137);
        record.join_watcher().await;

        assert_eq!(record.state(), VmState::Failed);
        assert!(record.info().failure.unwrap().contains("exit status 137"));
        assert_eq!(harness.host.tap_count(), 0);
        assert_eq!(harness.allocator.in_use(), 0);
        Ok(())
    }

    #[test_log::test(tokio::test)]
    async fn test_shutdown_of_exited_vm_is_noop() -> anyhow::Result<()> {
        let harness = Harness::new(Duration::from_secs(1));
        let lease = harness.allocator.allocate()?;
        let (record, config) = harness.record(&lease);

        let machine = harness
            .supervisor
            .start(&record, &config, &CancellationToken::new())
            .await?;
        harness.supervisor.watch(record.clone(), machine, lease);

        harness
            .supervisor
            .shutdown(&record, ShutdownMode::Forced)
            .await;
        record.join_watcher().await;
        harness
            .supervisor
            .shutdown(&record, ShutdownMode::Graceful)
            .await;

        assert_eq!(record.state(), VmState::Stopped);
        assert_eq!(harness.driver.machines()[0].ctrl_alt_del_count(), 0);
        Ok(())
    }
}

use std::path::{Path, PathBuf};

use getset::Getters;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    config::{EmberConfig, ExecutionMode, JailerConfig},
    network::NetworkIdentity,
    utils,
};

use super::{jail_root, Drive, MachineConfiguration, NetworkInterface, SnapshotFiles};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// Id of the root drive.
pub const ROOT_DRIVE_ID: &str = "1";

/// Id of the guest's only network interface.
pub const PRIMARY_IFACE_ID: &str = "1";

/// Socket path the hypervisor is told to bind inside its jail.
pub const JAILED_SOCKET_PATH: &str = "/run/firecracker.socket";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Everything the hypervisor needs to boot one VM, with paths as seen from the host.
///
/// Stored next to every snapshot so the VM can be relaunched from it later.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
pub struct HypervisorConfig {
    /// Identifier passed to the jailer and used to name the chroot.
    #[builder(setter(into))]
    vm_id: String,

    /// Host path of the API socket.
    #[builder(setter(into))]
    socket_path: PathBuf,

    /// Host path of the guest kernel.
    #[builder(setter(into))]
    kernel_image: PathBuf,

    /// Full kernel command line, including the `ip=` setting.
    #[builder(setter(into))]
    boot_args: String,

    /// vCPU and memory sizing.
    machine: MachineConfiguration,

    /// Block devices. The first is the root device.
    drives: Vec<Drive>,

    /// Network interfaces.
    network_interfaces: Vec<NetworkInterface>,

    /// Jailer parameters when the VM runs sandboxed.
    #[builder(default)]
    jailer: Option<JailerConfig>,

    /// Snapshot to restore from instead of booting the kernel.
    #[builder(default)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    snapshot: Option<SnapshotSource>,
}

/// A snapshot the hypervisor should load at startup.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotSource {
    /// Memory and state files.
    pub files: SnapshotFiles,

    /// Keep dirty page tracking on after the load.
    pub enable_diff_snapshots: bool,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HypervisorConfig {
    /// Builds the launch config of a fresh VM from its identity, its rootfs and the deployment
    /// config.
    pub fn compose(
        vm_id: &str,
        identity: &NetworkIdentity,
        rootfs: &Path,
        vcpu_count: u8,
        mem_size_mib: u32,
        ember: &EmberConfig,
    ) -> Self {
        let boot_args = format!("{} {}", ember.get_boot_args(), identity.kernel_ip_arg());

        let jailer = match ember.get_execution() {
            ExecutionMode::Direct => None,
            ExecutionMode::Jailed(jailer) => Some(jailer.clone()),
        };

        let socket_path = match &jailer {
            None => ember
                .get_socket_dir()
                .join(utils::socket_file_name(identity.get_host_byte())),
            Some(jailer) => jailed_socket_path(jailer, ember.get_firecracker_binary(), vm_id),
        };

        Self::builder()
            .vm_id(vm_id)
            .socket_path(socket_path)
            .kernel_image(ember.get_kernel_image().clone())
            .boot_args(boot_args)
            .machine(MachineConfiguration {
                vcpu_count,
                mem_size_mib,
                smt: false,
                track_dirty_pages: *ember.get_track_dirty_pages(),
            })
            .drives(vec![Drive {
                drive_id: ROOT_DRIVE_ID.to_string(),
                path_on_host: rootfs.to_path_buf(),
                is_root_device: true,
                is_read_only: false,
            }])
            .network_interfaces(vec![NetworkInterface {
                iface_id: PRIMARY_IFACE_ID.to_string(),
                guest_mac: identity.get_mac().clone(),
                host_dev_name: identity.get_tap_name().clone(),
            }])
            .jailer(jailer)
            .build()
    }

    /// Returns a copy that restores from `files` instead of booting. Dirty page tracking carries
    /// over from the captured machine.
    pub fn with_snapshot(&self, files: SnapshotFiles) -> Self {
        Self {
            snapshot: Some(SnapshotSource {
                files,
                enable_diff_snapshots: self.machine.track_dirty_pages,
            }),
            ..self.clone()
        }
    }

    /// Returns a copy with every path rewritten by `map`, used to translate host paths into the
    /// jail's view.
    pub fn map_paths(&self, map: impl Fn(&Path) -> PathBuf) -> Self {
        let mut mapped = self.clone();
        mapped.kernel_image = map(&self.kernel_image);
        for drive in &mut mapped.drives {
            drive.path_on_host = map(&drive.path_on_host);
        }
        if let Some(snapshot) = &mut mapped.snapshot {
            snapshot.files = SnapshotFiles::new(
                map(snapshot.files.get_mem_path()),
                map(snapshot.files.get_state_path()),
            );
        }
        mapped
    }

    /// Host path of the root drive image.
    pub fn rootfs_path(&self) -> Option<&Path> {
        self.drives
            .iter()
            .find(|d| d.is_root_device)
            .map(|d| d.path_on_host.as_path())
    }

    /// Whether this config restores a snapshot.
    pub fn is_restore(&self) -> bool {
        self.snapshot.is_some()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Host path of the API socket of a jailed hypervisor.
pub fn jailed_socket_path(jailer: &JailerConfig, firecracker_binary: &Path, vm_id: &str) -> PathBuf {
    jail_root(jailer, firecracker_binary, vm_id)
        .join(JAILED_SOCKET_PATH.trim_start_matches('/'))
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use crate::config::NetworkConfig;

    use super::*;

    fn identity(byte: u8) -> NetworkIdentity {
        NetworkIdentity::derive(&NetworkConfig::default(), byte)
    }

    #[test]
    fn test_compose_direct() {
        let config = HypervisorConfig::compose(
            "vm-1",
            &identity(7),
            Path::new("/srv/rootfs/7-web.ext4"),
            2,
            512,
            &EmberConfig::default(),
        );

        assert_eq!(
            config.get_socket_path(),
            Path::new("/tmp/firecracker-ip7.sock")
        );
        assert!(config.get_boot_args().starts_with("ro console=ttyS0"));
        assert!(config
            .get_boot_args()
            .ends_with("ip=172.102.0.7::172.102.0.1:255.255.255.0::eth0:off"));
        assert_eq!(config.get_machine().vcpu_count, 2);
        assert_eq!(config.get_machine().mem_size_mib, 512);
        assert!(!config.get_machine().smt);
        assert!(!config.get_machine().track_dirty_pages);
        assert_eq!(
            config.rootfs_path(),
            Some(Path::new("/srv/rootfs/7-web.ext4"))
        );
        assert_eq!(config.get_network_interfaces()[0].host_dev_name, "fc-tap-7");
        assert_eq!(
            config.get_network_interfaces()[0].guest_mac,
            "02:FC:00:00:00:07"
        );
        assert!(config.get_jailer().is_none());
        assert!(!config.is_restore());
    }

    #[test]
    fn test_compose_jailed_puts_socket_in_chroot() {
        let ember = EmberConfig::builder()
            .execution(ExecutionMode::Jailed(
                JailerConfig::builder().chroot_base_dir("/srv/jail").build(),
            ))
            .build();

        let config = HypervisorConfig::compose(
            "abc",
            &identity(9),
            Path::new("/srv/rootfs/9-db.ext4"),
            1,
            256,
            &ember,
        );

        assert_eq!(
            config.get_socket_path(),
            Path::new("/srv/jail/firecracker/abc/root/run/firecracker.socket")
        );
        assert!(config.get_jailer().is_some());
    }

    #[test]
    fn test_map_paths_rewrites_kernel_drives_and_snapshot() {
        let config = HypervisorConfig::compose(
            "vm-2",
            &identity(4),
            Path::new("/srv/rootfs/4-a.ext4"),
            1,
            256,
            &EmberConfig::builder()
                .kernel_image("/boot/vmlinux.bin")
                .track_dirty_pages(true)
                .build(),
        )
        .with_snapshot(SnapshotFiles::from_base("/srv/snaps/a"));

        let mapped = config.map_paths(|p| {
            Path::new("/").join(p.file_name().unwrap_or_default())
        });

        assert_eq!(mapped.get_kernel_image(), Path::new("/vmlinux.bin"));
        assert_eq!(mapped.rootfs_path(), Some(Path::new("/4-a.ext4")));
        let snapshot = mapped.get_snapshot().as_ref().unwrap();
        assert_eq!(snapshot.files.get_mem_path(), Path::new("/a.mem"));
        assert_eq!(snapshot.files.get_state_path(), Path::new("/a.file"));
        assert!(snapshot.enable_diff_snapshots);
        assert_eq!(mapped.get_socket_path(), config.get_socket_path());
    }
}

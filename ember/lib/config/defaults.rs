use std::{path::PathBuf, sync::LazyLock};

use crate::utils::EMBER_HOME_DIR;

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The default number of vCPUs to give a microVM.
pub const DEFAULT_NUM_VCPUS: u8 = 1;

/// The default amount of RAM in MiB to give a microVM.
pub const DEFAULT_RAM_MIB: u32 = 256;

/// Default port for the HTTP server
pub const DEFAULT_SERVER_PORT: u16 = 8080;

/// Default host for the HTTP server
pub const DEFAULT_SERVER_HOST: &str = "127.0.0.1";

/// The private /24 VM addresses are carved from.
pub const DEFAULT_SUBNET: &str = "172.102.0.0/24";

/// First host byte handed out to VMs. Lower bytes are left for the gateway and host services.
pub const DEFAULT_POOL_START: u8 = 4;

/// Last host byte handed out to VMs.
pub const DEFAULT_POOL_END: u8 = 254;

/// Host interface that reaches the outside world.
pub const DEFAULT_UPLINK_INTERFACE: &str = "eth0";

/// Size of a freshly allocated rootfs image, in megabytes.
pub const DEFAULT_ROOTFS_SIZE_MB: u64 = 526;

/// Kernel command line without the per-VM `ip=` setting.
pub const DEFAULT_BOOT_ARGS: &str =
    "ro console=ttyS0 noapic reboot=k panic=1 pci=off init=/init nomodules random.trust_cpu=on";

/// Hypervisor binary.
pub const DEFAULT_FIRECRACKER_BINARY: &str = "firecracker";

/// Jailer binary.
pub const DEFAULT_JAILER_BINARY: &str = "jailer";

/// Guest kernel image.
pub const DEFAULT_KERNEL_IMAGE: &str = "vmlinux.bin";

/// Guest init binary injected into every rootfs.
pub const DEFAULT_INIT_BINARY: &str = "ember-init";

/// Directory where control sockets are created in direct mode.
pub const DEFAULT_SOCKET_DIR: &str = "/tmp";

/// Chroot base directory for jailed mode.
pub const DEFAULT_CHROOT_BASE_DIR: &str = "/tmp";

/// Cgroup version passed to the jailer.
pub const DEFAULT_CGROUP_VERSION: u8 = 1;

/// Default uid and gid the jailer drops to.
pub const DEFAULT_JAIL_ID: u32 = 1;

/// How long to wait for the hypervisor API to come up and the guest to start.
pub const DEFAULT_BOOT_TIMEOUT_SECS: u64 = 10;

/// How long a graceful shutdown may take before the hypervisor is killed.
pub const DEFAULT_SHUTDOWN_GRACE_SECS: u64 = 20;

/// The path where all ember global data is stored.
pub static DEFAULT_EMBER_HOME: LazyLock<PathBuf> = LazyLock::new(|| {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("/var/lib"))
        .join(EMBER_HOME_DIR)
});

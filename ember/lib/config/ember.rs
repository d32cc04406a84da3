use std::{
    net::Ipv4Addr,
    path::{Path, PathBuf},
    time::Duration,
};

use getset::Getters;
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

use crate::{
    utils::{self, ROOTFS_SUBDIR, SNAPSHOTS_SUBDIR},
    EmberError, EmberResult,
};

use super::*;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// Deployment configuration of the control plane.
///
/// Loaded from `ember.toml`. Every field has a default so an empty file is a valid config.
///
/// ```toml
/// kernel_image = "/var/lib/ember/vmlinux.bin"
/// shutdown_grace_secs = 20
/// track_dirty_pages = true
///
/// [network]
/// subnet = "172.102.0.0/24"
/// uplink_interface = "enp0s25"
///
/// [execution]
/// mode = "jailed"
/// uid = 123
/// gid = 100
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct EmberConfig {
    /// Directory holding rootfs images and snapshots.
    #[builder(default = utils::get_ember_home_path(), setter(into))]
    home_dir: PathBuf,

    /// Guest kernel image.
    #[builder(default = PathBuf::from(DEFAULT_KERNEL_IMAGE), setter(into))]
    kernel_image: PathBuf,

    /// Hypervisor binary, by name or path.
    #[builder(default = PathBuf::from(DEFAULT_FIRECRACKER_BINARY), setter(into))]
    firecracker_binary: PathBuf,

    /// Guest init binary copied into each rootfs as `/init`.
    #[builder(default = PathBuf::from(DEFAULT_INIT_BINARY), setter(into))]
    init_binary: PathBuf,

    /// Kernel command line without the per-VM `ip=` setting.
    #[builder(default = DEFAULT_BOOT_ARGS.to_string(), setter(into))]
    boot_args: String,

    /// Address pool and uplink.
    #[builder(default)]
    network: NetworkConfig,

    /// Size of each rootfs image, in megabytes.
    #[builder(default = DEFAULT_ROOTFS_SIZE_MB)]
    rootfs_size_mb: u64,

    /// Directory for control sockets in direct mode.
    #[builder(default = PathBuf::from(DEFAULT_SOCKET_DIR), setter(into))]
    socket_dir: PathBuf,

    /// Seconds allowed for the API socket to appear and the guest to start.
    #[builder(default = DEFAULT_BOOT_TIMEOUT_SECS)]
    boot_timeout_secs: u64,

    /// Seconds a graceful shutdown may take before the hypervisor is killed.
    #[builder(default = DEFAULT_SHUTDOWN_GRACE_SECS)]
    shutdown_grace_secs: u64,

    /// How the hypervisor process is launched.
    #[builder(default)]
    execution: ExecutionMode,

    /// vCPUs used when a request does not specify any.
    #[builder(default = DEFAULT_NUM_VCPUS)]
    default_vcpus: u8,

    /// Memory used when a request does not specify any.
    #[builder(default = DEFAULT_RAM_MIB)]
    default_ram_mib: u32,

    /// Boot guests with dirty page tracking so diff snapshots can be taken. Costs some guest
    /// memory performance.
    #[builder(default)]
    track_dirty_pages: bool,
}

/// The VM address pool and the host's uplink.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct NetworkConfig {
    /// The private /24 VM addresses come from. `.1` is the guests' gateway.
    #[builder(default = default_subnet())]
    subnet: Ipv4Network,

    /// Host interface NAT traffic leaves through.
    #[builder(default = DEFAULT_UPLINK_INTERFACE.to_string(), setter(into))]
    uplink_interface: String,

    /// First host byte handed out.
    #[builder(default = DEFAULT_POOL_START)]
    pool_start: u8,

    /// Last host byte handed out.
    #[builder(default = DEFAULT_POOL_END)]
    pool_end: u8,
}

/// How the hypervisor process is launched.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", rename_all = "lowercase")]
pub enum ExecutionMode {
    /// Spawn the hypervisor binary directly.
    #[default]
    Direct,

    /// Spawn the hypervisor through the jailer.
    Jailed(JailerConfig),
}

/// Isolation parameters for jailed execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, TypedBuilder, Getters)]
#[getset(get = "pub with_prefix")]
#[serde(default)]
pub struct JailerConfig {
    /// Jailer binary, by name or path.
    #[builder(default = PathBuf::from(DEFAULT_JAILER_BINARY), setter(into))]
    jailer_binary: PathBuf,

    /// Uid the hypervisor runs as.
    #[builder(default = DEFAULT_JAIL_ID)]
    uid: u32,

    /// Gid the hypervisor runs as.
    #[builder(default = DEFAULT_JAIL_ID)]
    gid: u32,

    /// NUMA node the hypervisor is pinned to.
    #[builder(default)]
    numa_node: u32,

    /// Base directory under which per-VM chroots are created.
    #[builder(default = PathBuf::from(DEFAULT_CHROOT_BASE_DIR), setter(into))]
    chroot_base_dir: PathBuf,

    /// Cgroup hierarchy version.
    #[builder(default = DEFAULT_CGROUP_VERSION)]
    cgroup_version: u8,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EmberConfig {
    /// Parses and validates a TOML config.
    pub fn from_toml_str(content: &str) -> EmberResult<Self> {
        let config: EmberConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads and validates the config at `path`.
    pub async fn load(path: impl AsRef<Path>) -> EmberResult<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path).await.map_err(|e| {
            EmberError::InvalidConfig(format!("cannot read {}: {}", path.display(), e))
        })?;

        Self::from_toml_str(&content)
    }

    /// Loads the config for a server run.
    ///
    /// An explicit `path` must exist. Without one, the default location is used if a file is
    /// there and built-in defaults otherwise.
    pub async fn locate(path: Option<&Path>) -> EmberResult<Self> {
        if let Some(path) = path {
            return Self::load(path).await;
        }

        let default_path = utils::get_ember_config_path();
        if tokio::fs::try_exists(&default_path).await? {
            tracing::info!(path = %default_path.display(), "loading config");
            return Self::load(&default_path).await;
        }

        tracing::info!(path = %default_path.display(), "no config file found, using defaults");
        let config = Self::default();
        config.validate()?;
        Ok(config)
    }

    /// Checks cross-field constraints serde cannot express.
    pub fn validate(&self) -> EmberResult<()> {
        self.network.validate()?;

        if self.rootfs_size_mb == 0 {
            return Err(EmberError::InvalidConfig(
                "rootfs_size_mb must be greater than zero".to_string(),
            ));
        }

        if self.default_vcpus == 0 || self.default_ram_mib == 0 {
            return Err(EmberError::InvalidConfig(
                "default vcpus and memory must be greater than zero".to_string(),
            ));
        }

        if let ExecutionMode::Jailed(jailer) = &self.execution {
            if !matches!(jailer.cgroup_version, 1 | 2) {
                return Err(EmberError::InvalidConfig(format!(
                    "unsupported cgroup version {}",
                    jailer.cgroup_version
                )));
            }
        }

        Ok(())
    }

    /// Directory where rootfs images are built.
    pub fn rootfs_dir(&self) -> PathBuf {
        self.home_dir.join(ROOTFS_SUBDIR)
    }

    /// Directory where snapshots land when a relative base path is given.
    pub fn snapshot_dir(&self) -> PathBuf {
        self.home_dir.join(SNAPSHOTS_SUBDIR)
    }

    /// Boot timeout as a duration.
    pub fn boot_timeout(&self) -> Duration {
        Duration::from_secs(self.boot_timeout_secs)
    }

    /// Shutdown grace period as a duration.
    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

impl NetworkConfig {
    /// Checks that the pool fits inside a /24 and leaves room for the gateway.
    pub fn validate(&self) -> EmberResult<()> {
        if self.subnet.prefix() != 24 {
            return Err(EmberError::InvalidConfig(format!(
                "subnet {} must be a /24",
                self.subnet
            )));
        }

        if self.pool_start < 2 || self.pool_start > self.pool_end || self.pool_end == u8::MAX {
            return Err(EmberError::InvalidConfig(format!(
                "invalid pool range {}..={}",
                self.pool_start, self.pool_end
            )));
        }

        Ok(())
    }

    /// The guests' default gateway, the first address of the subnet.
    pub fn gateway(&self) -> Ipv4Addr {
        self.address_for(1)
    }

    /// The address with the given host byte.
    pub fn address_for(&self, host_byte: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.subnet.network().octets();
        Ipv4Addr::new(a, b, c, host_byte)
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

fn default_subnet() -> Ipv4Network {
    DEFAULT_SUBNET
        .parse()
        .expect("default subnet is a valid network")
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Default for EmberConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

impl Default for JailerConfig {
    fn default() -> Self {
        Self::builder().build()
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

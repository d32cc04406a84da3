use std::path::{Path, PathBuf};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The directory name under the user's home where ember keeps its state.
pub const EMBER_HOME_DIR: &str = ".ember";

/// The sub directory where built rootfs images are stored.
pub const ROOTFS_SUBDIR: &str = "rootfs";

/// The sub directory where snapshots are written by default.
pub const SNAPSHOTS_SUBDIR: &str = "snapshots";

/// The default deployment config file name.
pub const EMBER_CONFIG_FILENAME: &str = "ember.toml";

/// Extension of the guest memory file of a snapshot.
pub const SNAPSHOT_MEM_EXTENSION: &str = "mem";

/// Extension of the VM state file of a snapshot.
pub const SNAPSHOT_STATE_EXTENSION: &str = "file";

/// Extension of the metadata sidecar written next to a snapshot.
pub const SNAPSHOT_META_EXTENSION: &str = "json";

/// File name the guest init binary gets inside the rootfs image.
pub const GUEST_INIT_PATH: &str = "init";

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Base name shared by a VM's rootfs image, export archive and temporary docker container.
///
/// The index keeps builds for the same name from colliding.
pub fn rootfs_base_name(vm_index: u64, name: &str) -> String {
    format!("{}-{}", vm_index, name)
}

/// File name of the hypervisor control socket for a host byte.
pub fn socket_file_name(host_byte: u8) -> String {
    format!("firecracker-ip{}.sock", host_byte)
}

/// Appends `.{extension}` to a snapshot base path without replacing any existing extension.
pub fn with_suffix(base: impl AsRef<Path>, extension: &str) -> PathBuf {
    let mut path = base.as_ref().as_os_str().to_owned();
    path.push(".");
    path.push(extension);
    PathBuf::from(path)
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

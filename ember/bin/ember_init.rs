//! Guest init for ember microVMs.
//!
//! Copied into every root filesystem as `/init` and started by the kernel as PID 1. Mounts the
//! pseudo filesystems a container image expects, sets the hostname and hands the console to
//! `/bin/sh`.

use std::{fs, path::Path, process::Command};

use nix::{mount::MsFlags, unistd::sethostname};
use tracing_subscriber::{fmt, EnvFilter};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

const GUEST_HOSTNAME: &str = "drop-vm";

const GUEST_PATH: &str = "/usr/local/bin:/usr/local/sbin:/usr/bin:/usr/sbin:/bin:/sbin";

const GUEST_SHELL: &str = "/bin/sh";

/// `(target, fstype)` pairs mounted at boot, in order.
const PSEUDO_MOUNTS: &[(&str, &str)] = &[
    ("/proc", "proc"),
    ("/dev/pts", "devpts"),
    ("/dev/mqueue", "mqueue"),
    ("/dev/shm", "tmpfs"),
    ("/sys", "sysfs"),
    ("/sys/fs/cgroup", "cgroup"),
];

//--------------------------------------------------------------------------------------------------
// Functions: main
//--------------------------------------------------------------------------------------------------

fn main() {
    fmt()
        .with_target(false)
        .with_level(true)
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "ember init booting");

    for (target, fstype) in PSEUDO_MOUNTS {
        mount_pseudo(Path::new(target), fstype);
    }

    if let Err(e) = sethostname(GUEST_HOSTNAME) {
        tracing::error!(hostname = GUEST_HOSTNAME, error = %e, "cannot set hostname");
        std::process::exit(1);
    }

    tracing::info!(shell = GUEST_SHELL, "starting shell");
    let status = Command::new(GUEST_SHELL)
        .env_clear()
        .env("PATH", GUEST_PATH)
        .status();

    match status {
        Ok(status) => {
            tracing::info!(%status, "shell exited");
            std::process::exit(status.code().unwrap_or(1));
        }
        Err(e) => {
            tracing::error!(shell = GUEST_SHELL, error = %e, "could not start shell");
            std::process::exit(1);
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions: Helpers
//--------------------------------------------------------------------------------------------------

/// Mounts a pseudo filesystem, creating the mount point first. Failures are logged and boot goes
/// on; an image may lack support for one of them.
fn mount_pseudo(target: &Path, fstype: &str) {
    if let Err(e) = fs::create_dir_all(target) {
        tracing::warn!(target = %target.display(), error = %e, "cannot create mount point");
        return;
    }

    if let Err(e) = nix::mount::mount(
        Some("none"),
        target,
        Some(fstype),
        MsFlags::empty(),
        None::<&str>,
    ) {
        tracing::warn!(target = %target.display(), fstype, error = %e, "mount failed");
    }
}

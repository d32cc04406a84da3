use std::{
    fmt::{self, Display},
    io,
    path::{Path, PathBuf},
    sync::Arc,
};

use emberutils::{CommandRunner, EmberutilsError, HostCommand};
use getset::Getters;
use scopeguard::ScopeGuard;
use tokio::fs;
use tokio_util::sync::CancellationToken;

use crate::{
    utils::{self, GUEST_INIT_PATH},
    EmberError, EmberResult,
};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A step of turning a container image into a bootable ext4 image.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BuildStep {
    /// Creating the sized image file.
    Allocate,

    /// `mkfs.ext4`.
    Format,

    /// Creating the temporary mount point and loop-mounting the image.
    Mount,

    /// `docker create` and `docker export`.
    Export,

    /// Unpacking the exported archive into the mount.
    Extract,

    /// Copying the guest init binary into the image.
    InjectInit,

    /// `umount`.
    Unmount,
}

/// A built rootfs image on the host.
#[derive(Debug, Clone, PartialEq, Eq, Getters)]
#[getset(get = "pub with_prefix")]
pub struct RootfsArtifact {
    /// Path of the ext4 image.
    path: PathBuf,
}

/// Materializes container images into ext4 root filesystems.
pub struct RootfsBuilder {
    runner: Arc<dyn CommandRunner>,
    output_dir: PathBuf,
    init_binary: PathBuf,
    size_bytes: u64,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl RootfsBuilder {
    /// Creates a builder writing `size_mb` megabyte images into `output_dir`.
    pub fn new(
        runner: Arc<dyn CommandRunner>,
        output_dir: impl Into<PathBuf>,
        init_binary: impl Into<PathBuf>,
        size_mb: u64,
    ) -> Self {
        Self {
            runner,
            output_dir: output_dir.into(),
            init_binary: init_binary.into(),
            size_bytes: size_mb * 1_000_000,
        }
    }

    /// Path of the image [`build`](Self::build) writes for `vm_index` and `name`.
    pub fn image_path(&self, vm_index: u64, name: &str) -> PathBuf {
        self.output_dir
            .join(format!("{}.ext4", utils::rootfs_base_name(vm_index, name)))
    }

    /// Builds `{output_dir}/{vm_index}-{name}.ext4` from `image`.
    ///
    /// An existing image at that path is never overwritten; the build fails at
    /// [`BuildStep::Allocate`] instead. The temporary mount point is removed and the image is
    /// unmounted on every path out of this function. On failure the half-built image is deleted
    /// too.
    pub async fn build(
        &self,
        vm_index: u64,
        name: &str,
        image: &str,
        cancel: &CancellationToken,
    ) -> EmberResult<RootfsArtifact> {
        let base = utils::rootfs_base_name(vm_index, name);
        let image_path = self.image_path(vm_index, name);

        tracing::info!(image = %image, path = %image_path.display(), "building rootfs");

        fs::create_dir_all(&self.output_dir)
            .await
            .map_err(|e| EmberError::build(BuildStep::Allocate, e))?;

        let file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&image_path)
            .await
            .map_err(|e| EmberError::build(BuildStep::Allocate, e))?;

        let image_guard = scopeguard::guard(image_path.clone(), |path| {
            if let Err(e) = std::fs::remove_file(&path) {
                if e.kind() != io::ErrorKind::NotFound {
                    tracing::warn!(path = %path.display(), error = %e, "failed to remove partial rootfs image");
                }
            }
        });

        self.allocate(file)
            .await
            .map_err(|e| EmberError::build(BuildStep::Allocate, e))?;

        self.step(
            BuildStep::Format,
            HostCommand::new("mkfs.ext4").arg("-F").path_arg(&image_path),
            cancel,
        )
        .await?;

        let mount_dir = tempfile::Builder::new()
            .prefix(&format!("{}-", base))
            .tempdir()
            .map_err(|e| EmberError::build(BuildStep::Mount, e))?;

        self.step(
            BuildStep::Mount,
            HostCommand::privileged("mount")
                .args(["-o", "loop"])
                .path_arg(&image_path)
                .path_arg(mount_dir.path()),
            cancel,
        )
        .await?;

        let populated = self.populate(&base, image, mount_dir.path(), cancel).await;

        // Unmount regardless of how population went.
        let unmounted = self
            .runner
            .run(&HostCommand::privileged("umount").path_arg(mount_dir.path()))
            .await;

        if let Err(e) = unmounted {
            // Removing a still-mounted directory would recurse into the image.
            let leaked = mount_dir.keep();
            tracing::error!(mount_dir = %leaked.display(), error = %e, "failed to unmount rootfs build dir");
            return Err(populated
                .err()
                .unwrap_or_else(|| EmberError::build(BuildStep::Unmount, e)));
        }

        drop(mount_dir);
        populated?;

        let path = ScopeGuard::into_inner(image_guard);
        tracing::info!(path = %path.display(), "built rootfs");
        Ok(RootfsArtifact { path })
    }

    async fn allocate(&self, file: fs::File) -> io::Result<()> {
        file.set_len(self.size_bytes).await?;
        file.sync_all().await
    }

    /// Exports `image` through a temporary container and unpacks it plus the init binary into
    /// `mount_dir`. The container and the archive are always removed.
    async fn populate(
        &self,
        base: &str,
        image: &str,
        mount_dir: &Path,
        cancel: &CancellationToken,
    ) -> EmberResult<()> {
        let archive = self.output_dir.join(format!("{}.tar", base));

        self.step(
            BuildStep::Export,
            HostCommand::new("docker").args(["create", "--name", base, image]),
            cancel,
        )
        .await?;

        let result = async {
            self.step(
                BuildStep::Export,
                HostCommand::new("docker")
                    .args(["export", base, "-o"])
                    .path_arg(&archive),
                cancel,
            )
            .await?;

            self.step(
                BuildStep::Extract,
                HostCommand::privileged("tar")
                    .arg("-xf")
                    .path_arg(&archive)
                    .arg("-C")
                    .path_arg(mount_dir),
                cancel,
            )
            .await?;

            self.step(
                BuildStep::InjectInit,
                HostCommand::privileged("cp")
                    .path_arg(&self.init_binary)
                    .path_arg(mount_dir.join(GUEST_INIT_PATH)),
                cancel,
            )
            .await
        }
        .await;

        if let Err(e) = fs::remove_file(&archive).await {
            if e.kind() != io::ErrorKind::NotFound {
                tracing::warn!(archive = %archive.display(), error = %e, "failed to remove exported archive");
            }
        }

        if let Err(e) = self
            .runner
            .run(&HostCommand::new("docker").args(["rm", "-f", base]))
            .await
        {
            tracing::warn!(container = %base, error = %e, "failed to remove export container");
        }

        result
    }

    async fn step(
        &self,
        step: BuildStep,
        command: HostCommand,
        cancel: &CancellationToken,
    ) -> EmberResult<()> {
        if cancel.is_cancelled() {
            return Err(EmberError::Cancelled(format!("rootfs {}", step)));
        }

        self.runner
            .run(&command)
            .await
            .map_err(|e: EmberutilsError| EmberError::build(step, e))?;

        tracing::debug!(step = %step, "rootfs step completed");
        Ok(())
    }
}

impl RootfsArtifact {
    /// Wraps an existing image path.
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    /// Deletes the image. A missing file is not an error.
    pub async fn remove(&self) -> EmberResult<()> {
        match fs::remove_file(&self.path).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for BuildStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            BuildStep::Allocate => "allocate",
            BuildStep::Format => "format",
            BuildStep::Mount => "mount",
            BuildStep::Export => "export",
            BuildStep::Extract => "extract",
            BuildStep::InjectInit => "inject init",
            BuildStep::Unmount => "unmount",
        };

        write!(f, "{}", name)
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

//! `emberutils::command` runs host commands and reports their exit status.
//!
//! Network and disk provisioning shell out to host tools (`ip`, `iptables`, `mkfs.ext4`,
//! `mount`, `docker`). Callers describe a command with [`HostCommand`] and run it through a
//! [`CommandRunner`] so the runner can be swapped out when the host should not be touched.

use std::{
    fmt::{self, Display},
    path::{Path, PathBuf},
    process::Stdio,
};

use async_trait::async_trait;
use tokio::process::Command;

use crate::{EmberutilsError, EmberutilsResult};

//--------------------------------------------------------------------------------------------------
// Constants
//--------------------------------------------------------------------------------------------------

/// The binary used to elevate privileged commands when not running as root.
pub const SUDO_BINARY: &str = "sudo";

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// A single host command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostCommand {
    /// The program to run.
    program: String,

    /// Arguments passed to the program.
    args: Vec<String>,

    /// Whether the command needs root privileges.
    privileged: bool,
}

/// Captured result of a command that ran to completion.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// The exit code, or `None` if the process was terminated by a signal.
    pub code: Option<i32>,

    /// Captured stdout.
    pub stdout: String,

    /// Captured stderr.
    pub stderr: String,
}

/// Runs [`HostCommand`]s.
#[async_trait]
pub trait CommandRunner: Send + Sync + 'static {
    /// Runs the command and returns its output regardless of exit status.
    async fn output(&self, command: &HostCommand) -> EmberutilsResult<CommandOutput>;

    /// Runs the command and fails with [`EmberutilsError::CommandFailed`] on a non-zero exit.
    async fn run(&self, command: &HostCommand) -> EmberutilsResult<CommandOutput> {
        let output = self.output(command).await?;
        if !output.success() {
            return Err(EmberutilsError::CommandFailed {
                command: command.to_string(),
                code: output.code,
                stderr: output.stderr.trim().to_string(),
            });
        }

        Ok(output)
    }
}

/// A [`CommandRunner`] that spawns real processes on the host.
///
/// Privileged commands are prefixed with `sudo` unless the current process already runs as root.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    sudo: Option<PathBuf>,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl HostCommand {
    /// Creates an unprivileged command.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            privileged: false,
        }
    }

    /// Creates a command that must run as root.
    pub fn privileged(program: impl Into<String>) -> Self {
        Self {
            privileged: true,
            ..Self::new(program)
        }
    }

    /// Appends a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Appends several arguments.
    pub fn args(mut self, args: impl IntoIterator<Item = impl Into<String>>) -> Self {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Appends a path argument.
    pub fn path_arg(self, path: impl AsRef<Path>) -> Self {
        let arg = path.as_ref().to_string_lossy().into_owned();
        self.arg(arg)
    }

    /// The program name.
    pub fn get_program(&self) -> &str {
        &self.program
    }

    /// The program arguments.
    pub fn get_args(&self) -> &[String] {
        &self.args
    }

    /// Whether the command needs root privileges.
    pub fn is_privileged(&self) -> bool {
        self.privileged
    }
}

impl CommandOutput {
    /// Returns true if the command exited with status 0.
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

impl SystemRunner {
    /// Creates a runner that elevates privileged commands with `sudo` when not already root.
    pub fn new() -> Self {
        let sudo = if nix::unistd::geteuid().is_root() {
            None
        } else {
            which::which(SUDO_BINARY).ok()
        };

        Self { sudo }
    }

    fn build(&self, command: &HostCommand) -> Command {
        match (&self.sudo, command.privileged) {
            (Some(sudo), true) => {
                let mut cmd = Command::new(sudo);
                cmd.arg(&command.program).args(&command.args);
                cmd
            }
            _ => {
                let mut cmd = Command::new(&command.program);
                cmd.args(&command.args);
                cmd
            }
        }
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Resolves a binary by name on `PATH`, or checks that an explicit path exists.
pub fn resolve_binary(name: impl AsRef<Path>) -> EmberutilsResult<PathBuf> {
    let name = name.as_ref();
    if name.is_absolute() {
        if name.exists() {
            return Ok(name.to_path_buf());
        }

        return Err(EmberutilsError::BinaryNotFound(
            name.display().to_string(),
            "path does not exist".to_string(),
        ));
    }

    which::which(name).map_err(|e| {
        EmberutilsError::BinaryNotFound(name.display().to_string(), e.to_string())
    })
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl Display for HostCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.privileged {
            write!(f, "{} ", SUDO_BINARY)?;
        }

        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }

        Ok(())
    }
}

impl Default for SystemRunner {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn output(&self, command: &HostCommand) -> EmberutilsResult<CommandOutput> {
        tracing::debug!(command = %command, "running host command");

        let output = self
            .build(command)
            .stdin(Stdio::null())
            .output()
            .await
            .map_err(|source| EmberutilsError::CommandSpawn {
                command: command.to_string(),
                source,
            })?;

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

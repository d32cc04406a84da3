use std::{
    error::Error,
    fmt::{self, Display},
    path::PathBuf,
};

use emberutils::EmberutilsError;
use thiserror::Error;

use crate::{network::NetworkStep, rootfs::BuildStep, vm::VmState};

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an ember-related operation.
pub type EmberResult<T> = Result<T, EmberError>;

/// An error that occurred while provisioning or controlling a microVM.
#[derive(pretty_error_debug::Debug, Error)]
pub enum EmberError {
    /// The creation request was malformed or incomplete.
    #[error("validation error: {0}")]
    Validation(String),

    /// No network identity could be handed out.
    #[error("allocation error: {0}")]
    Allocation(String),

    /// Building the root filesystem image failed.
    #[error("rootfs build failed at step `{step}`: {source}")]
    Build {
        /// The step that failed.
        step: BuildStep,

        /// The underlying failure, including command line and exit status for host commands.
        #[source]
        source: EmberutilsError,
    },

    /// Wiring the host network for a VM failed.
    #[error("network provisioning failed at step `{step}`: {source}")]
    Provisioning {
        /// The step that failed.
        step: NetworkStep,

        /// The underlying failure, including command line and exit status.
        #[source]
        source: EmberutilsError,
    },

    /// Launching or controlling the hypervisor process failed.
    #[error("supervisor error: {0}")]
    Supervisor(String),

    /// The hypervisor API rejected a request.
    #[error("hypervisor rejected {method} {path} with status {status}: {body}")]
    Hypervisor {
        /// HTTP method of the rejected request.
        method: String,

        /// API path of the rejected request.
        path: String,

        /// HTTP status code returned.
        status: u16,

        /// Response body, usually a `fault_message`.
        body: String,
    },

    /// The hypervisor API could not be reached.
    #[error("hypervisor api transport error: {0}")]
    HypervisorTransport(String),

    /// No VM with the given id exists.
    #[error("vm not found: {0}")]
    NotFound(String),

    /// A VM with the given id is already registered.
    #[error("vm already registered: {0}")]
    DuplicateVm(String),

    /// The operation is not allowed in the VM's current state.
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// The requested lifecycle transition is not allowed.
    #[error("invalid state transition from {from} to {to}")]
    InvalidTransition {
        /// The current state.
        from: VmState,

        /// The requested state.
        to: VmState,
    },

    /// A live hypervisor already answers on the control socket.
    #[error("socket already in use: {0}")]
    SocketInUse(PathBuf),

    /// The operation was cancelled by the caller.
    #[error("operation cancelled during {0}")]
    Cancelled(String),

    /// The operation did not finish in time.
    #[error("timed out: {0}")]
    Timeout(String),

    /// The deployment configuration is invalid.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// An error from host command or process utilities.
    #[error(transparent)]
    Utils(#[from] EmberutilsError),

    /// An I/O error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// A JSON (de)serialization error.
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    /// A TOML parse error.
    #[error("toml error: {0}")]
    Toml(#[from] toml::de::Error),

    /// An error that occurred when a join handle returned an error.
    #[error("join error: {0}")]
    JoinError(#[from] tokio::task::JoinError),

    /// An error that can represent any error.
    #[error(transparent)]
    Custom(#[from] AnyError),
}

/// An error that can represent any error.
#[derive(Debug)]
pub struct AnyError {
    error: anyhow::Error,
}

//--------------------------------------------------------------------------------------------------
// Methods
//--------------------------------------------------------------------------------------------------

impl EmberError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> EmberError {
        EmberError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Wraps a failure of a rootfs build step.
    pub fn build(step: BuildStep, source: impl Into<EmberutilsError>) -> EmberError {
        EmberError::Build {
            step,
            source: source.into(),
        }
    }

    /// Wraps a failure of a network provisioning step.
    pub fn provisioning(step: NetworkStep, source: impl Into<EmberutilsError>) -> EmberError {
        EmberError::Provisioning {
            step,
            source: source.into(),
        }
    }
}

impl AnyError {
    /// Downcasts the error to a `T`.
    pub fn downcast<T>(&self) -> Option<&T>
    where
        T: Display + fmt::Debug + Send + Sync + 'static,
    {
        self.error.downcast_ref::<T>()
    }
}

//--------------------------------------------------------------------------------------------------
// Functions
//--------------------------------------------------------------------------------------------------

/// Creates an `Ok` `EmberResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> EmberResult<T> {
    Result::Ok(value)
}

//--------------------------------------------------------------------------------------------------
// Trait Implementations
//--------------------------------------------------------------------------------------------------

impl PartialEq for AnyError {
    fn eq(&self, other: &Self) -> bool {
        self.error.to_string() == other.error.to_string()
    }
}

impl Display for AnyError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.error)
    }
}

impl Error for AnyError {}

//--------------------------------------------------------------------------------------------------
// Tests
//--------------------------------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_build_error_names_step_and_command() {
        let err = EmberError::build(
            BuildStep::Export,
            EmberutilsError::CommandFailed {
                command: "docker export 3-web -o 3-web.tar".to_string(),
                code: Some(1),
                stderr: "No such container".to_string(),
            },
        );

        let message = err.to_string();
        assert!(message.contains("export"));
        assert!(message.contains("docker export 3-web -o 3-web.tar"));
        assert!(message.contains("exit status 1"));
    }

    #[test]
    fn test_provisioning_error_names_step() {
        let err = EmberError::provisioning(
            NetworkStep::ProxyArp,
            EmberutilsError::CommandFailed {
                command: "sysctl -w net.ipv4.conf.fc-tap-9.proxy_arp=1".to_string(),
                code: Some(255),
                stderr: String::new(),
            },
        );

        assert!(err.to_string().contains("proxy_arp"));
        assert!(err.to_string().contains("exit status 255"));
    }

    #[test]
    fn test_invalid_transition_message() {
        let err = EmberError::InvalidTransition {
            from: VmState::Created,
            to: VmState::Stopped,
        };
        assert_eq!(
            err.to_string(),
            "invalid state transition from created to stopped"
        );
    }
}

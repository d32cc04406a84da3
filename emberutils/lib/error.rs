//! `emberutils::error` is a module containing error utilities for the ember project.

use std::{
    error::Error,
    fmt::{self, Display},
};

use thiserror::Error;

//--------------------------------------------------------------------------------------------------
// Types
//--------------------------------------------------------------------------------------------------

/// The result of an emberutils-related operation.
pub type EmberutilsResult<T> = Result<T, EmberutilsError>;

/// An error that occurred while running host commands or managing processes.
#[derive(pretty_error_debug::Debug, Error)]
pub enum EmberutilsError {
    /// A host command ran but exited unsuccessfully.
    #[error("command `{command}` exited with {}: {stderr}", describe_exit_code(.code))]
    CommandFailed {
        /// The full command line that was run.
        command: String,

        /// The exit code, or `None` if the process was terminated by a signal.
        code: Option<i32>,

        /// The trimmed stderr output of the command.
        stderr: String,
    },

    /// A host command could not be spawned at all.
    #[error("failed to spawn command `{command}`: {source}")]
    CommandSpawn {
        /// The full command line that was attempted.
        command: String,

        /// The underlying spawn error.
        #[source]
        source: std::io::Error,
    },

    /// An error that occurred when resolving a binary
    #[error("binary not found: {0}\nSource: {1}")]
    BinaryNotFound(String, String),

    /// An error that occurred when performing an IO operation
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),

    /// Custom error.
    #[error("Custom error: {0}")]
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

impl EmberutilsError {
    /// Creates a new `Err` result.
    pub fn custom(error: impl Into<anyhow::Error>) -> EmberutilsError {
        EmberutilsError::Custom(AnyError {
            error: error.into(),
        })
    }

    /// Returns the exit code if this error came from a command that ran to completion.
    pub fn exit_code(&self) -> Option<i32> {
        match self {
            EmberutilsError::CommandFailed { code, .. } => *code,
            _ => None,
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

/// Creates an `Ok` `EmberutilsResult`.
#[allow(non_snake_case)]
pub fn Ok<T>(value: T) -> EmberutilsResult<T> {
    Result::Ok(value)
}

fn describe_exit_code(code: &Option<i32>) -> String {
    match code {
        Some(code) => format!("exit status {}", code),
        None => "termination by signal".to_string(),
    }
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
    fn test_command_failed_message_names_command_and_status() {
        let err = EmberutilsError::CommandFailed {
            command: "sudo ip tuntap add dev fc-tap-4 mode tap".to_string(),
            code: Some(2),
            stderr: "ioctl(TUNSETIFF): Device or resource busy".to_string(),
        };

        let message = err.to_string();
        assert!(message.contains("ip tuntap add dev fc-tap-4 mode tap"));
        assert!(message.contains("exit status 2"));
        assert!(message.contains("Device or resource busy"));
        assert_eq!(err.exit_code(), Some(2));
    }

    #[test]
    fn test_command_failed_by_signal() {
        let err = EmberutilsError::CommandFailed {
            command: "mkfs.ext4 -F disk.ext4".to_string(),
            code: None,
            stderr: String::new(),
        };

        assert!(err.to_string().contains("termination by signal"));
        assert_eq!(err.exit_code(), None);
    }
}

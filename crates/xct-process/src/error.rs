//! Error types for process orchestration

use std::io;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use thiserror::Error;

use crate::stream::OutputSource;

/// Process orchestration errors
#[derive(Debug, Error)]
pub enum ProcessError {
    /// An OS call failed
    #[error("{operation} failed: {errno}")]
    System {
        operation: &'static str,
        errno: Errno,
    },

    /// Failed to spawn process
    #[error("Failed to spawn process: {0}")]
    SpawnFailed(#[from] io::Error),

    /// Descriptors must be sent but the launcher location is unknown
    #[error("XCT_EXEC_PATH is not set; cannot locate the fd launcher")]
    ExecPathNotSet,

    /// The signal disposition was changed behind the registry's back
    #[error("Handler for {signal:?} was changed outside of the signal registry")]
    SignalHandlerChangedExternally { signal: Signal },

    /// Malformed descriptor transfer
    #[error("Descriptor transfer protocol error: {0}")]
    Protocol(String),

    /// Reading one captured descriptor failed
    #[error("Failed to read output from fd {fd}: {error}")]
    StreamRead {
        fd: OutputSource,
        #[source]
        error: io::Error,
    },

    /// Captured output was not valid UTF-8
    #[error("Output from fd {fd} is not valid UTF-8")]
    InvalidEncoding { fd: OutputSource },

    /// Process terminated with something other than a clean exit
    #[error("Process terminated unexpectedly: {0}")]
    UnexpectedExit(crate::ExitOutcome),

    /// Invalid configuration
    #[error("Invalid process configuration: {0}")]
    InvalidConfig(String),
}

impl ProcessError {
    /// Shorthand for wrapping a failed OS call.
    pub(crate) fn system(operation: &'static str) -> impl FnOnce(Errno) -> Self {
        move |errno| ProcessError::System { operation, errno }
    }

    /// The OS error behind this error, if there is one.
    pub fn os_error(&self) -> Option<Errno> {
        match self {
            ProcessError::System { errno, .. } => Some(*errno),
            ProcessError::SpawnFailed(e) => e.raw_os_error().map(Errno::from_raw),
            ProcessError::StreamRead { error, .. } => error.raw_os_error().map(Errno::from_raw),
            _ => None,
        }
    }

    /// Exit code a launcher reports for this error.
    pub fn exit_code(&self) -> i32 {
        match self.os_error() {
            Some(errno) if errno as i32 != 0 => errno as i32,
            _ => 1,
        }
    }
}

/// Result type for process operations
pub type Result<T> = std::result::Result<T, ProcessError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_system_error_exposes_errno() {
        let err = ProcessError::system("pipe")(Errno::EMFILE);
        assert_eq!(err.os_error(), Some(Errno::EMFILE));
        assert_eq!(err.exit_code(), Errno::EMFILE as i32);
        assert_eq!(err.to_string(), format!("pipe failed: {}", Errno::EMFILE));
    }

    #[test]
    fn test_exit_code_without_errno() {
        assert_eq!(ProcessError::ExecPathNotSet.exit_code(), 1);
        assert_eq!(ProcessError::Protocol("x".into()).exit_code(), 1);
    }

    #[test]
    fn test_spawn_error_keeps_os_code() {
        let err = ProcessError::from(io::Error::from_raw_os_error(Errno::ENOENT as i32));
        assert_eq!(err.os_error(), Some(Errno::ENOENT));
    }
}

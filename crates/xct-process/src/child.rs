//! Spawned child process wrapper

use std::collections::HashMap;
use std::ffi::OsString;
use std::fmt;
use std::os::fd::RawFd;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;

use nix::sys::signal::{kill, Signal};
use nix::unistd::Pid;
use tokio::process::Child;
use tracing::{debug, warn};

use crate::error::{ProcessError, Result};

/// Why a process terminated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExitReason {
    Exited,
    Signaled,
}

/// How a process terminated.
///
/// For [`ExitReason::Signaled`], `status` is the signal number.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExitOutcome {
    pub status: i32,
    pub reason: ExitReason,
}

impl ExitOutcome {
    /// Clean exit with status 0
    pub const SUCCESS: ExitOutcome = ExitOutcome {
        status: 0,
        reason: ExitReason::Exited,
    };

    pub fn exited(status: i32) -> Self {
        Self {
            status,
            reason: ExitReason::Exited,
        }
    }

    pub fn signaled(signal: Signal) -> Self {
        Self {
            status: signal as i32,
            reason: ExitReason::Signaled,
        }
    }

    pub fn success(&self) -> bool {
        *self == Self::SUCCESS
    }

    /// Terminating signal, if any
    pub fn signal(&self) -> Option<Signal> {
        match self.reason {
            ExitReason::Signaled => Signal::try_from(self.status).ok(),
            ExitReason::Exited => None,
        }
    }
}

impl From<ExitStatus> for ExitOutcome {
    fn from(status: ExitStatus) -> Self {
        match (status.code(), status.signal()) {
            (Some(code), _) => Self::exited(code),
            (None, Some(signo)) => Self {
                status: signo,
                reason: ExitReason::Signaled,
            },
            (None, None) => Self::exited(status.into_raw()),
        }
    }
}

impl fmt::Display for ExitOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (self.reason, self.signal()) {
            (ExitReason::Exited, _) => write!(f, "exited with status {}", self.status),
            (ExitReason::Signaled, Some(signal)) => write!(f, "killed by {signal}"),
            (ExitReason::Signaled, None) => write!(f, "killed by signal {}", self.status),
        }
    }
}

/// What was launched, kept alongside the running child
#[derive(Debug, Clone, Default)]
pub struct LaunchRecord {
    pub executable: PathBuf,
    pub args: Vec<OsString>,
    pub working_dir: Option<PathBuf>,
    pub env: HashMap<OsString, OsString>,
    /// Child-side numbers of the descriptors sent through the launcher
    pub sent_fds: Vec<RawFd>,
}

/// A spawned child, owned by one orchestration until it is reaped
pub struct ProcessHandle {
    child: Child,
    pid: Pid,
    record: LaunchRecord,
    exit: Option<ExitOutcome>,
}

impl ProcessHandle {
    pub(crate) fn new(child: Child, record: LaunchRecord) -> Result<Self> {
        let pid = child.id().ok_or_else(|| {
            ProcessError::SpawnFailed(std::io::Error::new(
                std::io::ErrorKind::Other,
                "Failed to get process ID",
            ))
        })?;
        Ok(Self {
            child,
            pid: Pid::from_raw(pid as i32),
            record,
            exit: None,
        })
    }

    pub fn pid(&self) -> Pid {
        self.pid
    }

    pub fn executable(&self) -> &Path {
        &self.record.executable
    }

    pub fn args(&self) -> &[OsString] {
        &self.record.args
    }

    pub fn working_dir(&self) -> Option<&Path> {
        self.record.working_dir.as_deref()
    }

    pub fn env(&self) -> &HashMap<OsString, OsString> {
        &self.record.env
    }

    pub fn sent_fds(&self) -> &[RawFd] {
        &self.record.sent_fds
    }

    /// Exit outcome once the child has been reaped
    pub fn exit_outcome(&self) -> Option<ExitOutcome> {
        self.exit
    }

    /// Wait for the child to exit and reap it.
    pub async fn wait(&mut self) -> Result<ExitOutcome> {
        if let Some(exit) = self.exit {
            return Ok(exit);
        }
        let status = self.child.wait().await?;
        let exit = ExitOutcome::from(status);
        debug!(pid = %self.pid, exit = %exit, "Process exited");
        self.exit = Some(exit);
        Ok(exit)
    }

    /// Send `signal` to the child. A no-op once it has been reaped.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        if self.exit.is_some() {
            return Ok(());
        }
        kill(self.pid, signal).map_err(ProcessError::system("kill"))
    }

    /// SIGKILL the child and reap it, logging rather than failing.
    pub async fn kill_and_reap(&mut self) {
        if self.exit.is_some() {
            return;
        }
        debug!(pid = %self.pid, "Killing process");
        if let Err(e) = self.child.start_kill() {
            warn!(pid = %self.pid, error = %e, "Failed to kill process");
        }
        if let Err(e) = self.wait().await {
            warn!(pid = %self.pid, error = %e, "Error waiting for killed process");
        }
    }
}

impl fmt::Debug for ProcessHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ProcessHandle")
            .field("pid", &self.pid)
            .field("record", &self.record)
            .field("exit", &self.exit)
            .finish()
    }
}

//! Process configuration

use std::collections::HashMap;
use std::ffi::{OsStr, OsString};
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use nix::sys::signal::Signal;
use tracing::debug;

use crate::child::ExitOutcome;
use crate::error::{ProcessError, Result};
use crate::stream::{LineSeparators, OutputLine, StreamInterest};

/// Environment variable naming the directory that holds the `xct` binary.
pub const EXEC_PATH_ENV: &str = "XCT_EXEC_PATH";

/// Search path used when no `PATH` is available at all.
pub const DEFAULT_SEARCH_PATH: &str = "/usr/bin:/bin";

/// Signals forwarded to the child unless the caller says otherwise.
pub const DEFAULT_FORWARDED_SIGNALS: [Signal; 3] =
    [Signal::SIGINT, Signal::SIGTERM, Signal::SIGHUP];

/// Where the child's stdin comes from
#[derive(Debug, Default)]
pub enum StdinMode {
    /// Share the parent's stdin
    Inherit,
    /// Read from `/dev/null`
    #[default]
    Null,
    /// Read from the given descriptor (closed in the parent once spawned)
    Fd(OwnedFd),
}

/// What happens to the child's stdout or stderr
#[derive(Debug, Default)]
pub enum RedirectMode {
    /// Share the parent's descriptor
    Inherit,
    /// Send to `/dev/null`
    Discard,
    /// Capture through a pipe and deliver line by line
    #[default]
    Capture,
    /// Write to the given descriptor (closed in the parent once spawned)
    ToFd(OwnedFd),
}

/// Where bare executable names are looked up
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum SearchPath {
    /// `PATH` from the configured environment, else the parent's `PATH`,
    /// else [`DEFAULT_SEARCH_PATH`]
    #[default]
    Environment,
    /// [`DEFAULT_SEARCH_PATH`], whatever the environment says
    SystemDefault,
    /// Exactly these directories, in order. An empty entry is the current
    /// directory and an empty list disables the lookup.
    ///
    /// Entries containing `:` cannot be passed to the fd launcher and are
    /// skipped when descriptors are sent.
    Custom(Vec<PathBuf>),
}

impl SearchPath {
    /// The directories to search, every one made absolute against `cwd`.
    pub fn directories(&self, env: &HashMap<OsString, OsString>, cwd: &Path) -> Vec<PathBuf> {
        match self {
            SearchPath::Environment => {
                let path = env
                    .get(OsStr::new("PATH"))
                    .cloned()
                    .or_else(|| std::env::var_os("PATH"))
                    .unwrap_or_else(|| DEFAULT_SEARCH_PATH.into());
                std::env::split_paths(&path).map(|dir| absolute_dir(&dir, cwd)).collect()
            }
            SearchPath::SystemDefault => std::env::split_paths(DEFAULT_SEARCH_PATH)
                .map(|dir| absolute_dir(&dir, cwd))
                .collect(),
            SearchPath::Custom(dirs) => dirs.iter().map(|dir| absolute_dir(dir, cwd)).collect(),
        }
    }

    /// The directories joined for the fd launcher's `--path`.
    ///
    /// `None` when no usable directory is left.
    pub fn launcher_path(&self, env: &HashMap<OsString, OsString>, cwd: &Path) -> Option<OsString> {
        let dirs: Vec<PathBuf> = self
            .directories(env, cwd)
            .into_iter()
            .filter(|dir| {
                let usable = !dir.as_os_str().as_bytes().contains(&b':');
                if !usable {
                    debug!(dir = %dir.display(), "Skipping search directory containing ':'");
                }
                usable
            })
            .collect();
        if dirs.is_empty() {
            None
        } else {
            std::env::join_paths(dirs).ok()
        }
    }
}

fn absolute_dir(dir: &Path, cwd: &Path) -> PathBuf {
    if dir.as_os_str().is_empty() {
        cwd.to_path_buf()
    } else if dir.is_relative() {
        cwd.join(dir)
    } else {
        dir.to_path_buf()
    }
}

/// Exit outcomes the checked helpers treat as success
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ExpectedExits {
    /// Exit status 0. When a [`StreamInterest`] may close streams early,
    /// death by `SIGPIPE` is accepted too.
    #[default]
    Default,
    /// Any outcome
    Any,
    /// Exactly one of these
    Only(Vec<ExitOutcome>),
}

impl ExpectedExits {
    pub fn accepts(&self, exit: ExitOutcome, streams_may_close: bool) -> bool {
        match self {
            ExpectedExits::Default => {
                exit.success() || (streams_may_close && exit == ExitOutcome::signaled(Signal::SIGPIPE))
            }
            ExpectedExits::Any => true,
            ExpectedExits::Only(accepted) => accepted.contains(&exit),
        }
    }
}

/// A descriptor to install in the child at a given number
#[derive(Debug)]
pub struct DescriptorToSend {
    /// Number the descriptor gets in the child
    pub child_fd: RawFd,
    /// Parent copy, closed once sent
    pub fd: OwnedFd,
}

/// Configuration for spawning a process
#[derive(Debug)]
pub struct ProcessConfig {
    /// Executable path or name
    pub executable: PathBuf,
    /// Arguments, not including argv[0]
    pub args: Vec<OsString>,
    /// Working directory (None = current dir)
    pub working_dir: Option<PathBuf>,
    /// Environment variables (added to parent env)
    pub env: HashMap<OsString, OsString>,
    /// Search PATH for bare executable names
    pub use_path: bool,
    pub search_path: SearchPath,
    pub stdin: StdinMode,
    pub stdout: RedirectMode,
    pub stderr: RedirectMode,
    /// Extra descriptors passed through the fd launcher
    pub fds_to_send: Vec<DescriptorToSend>,
    /// Extra descriptors read alongside stdout/stderr
    pub additional_output_fds: Vec<OwnedFd>,
    pub signals_to_forward: Vec<Signal>,
    pub line_separators: LineSeparators,
    /// Asked after every line whether its stream is still wanted
    pub stream_interest: Option<StreamInterest>,
    pub expected_exits: ExpectedExits,
}

impl ProcessConfig {
    /// Create new process configuration
    pub fn new(executable: impl Into<PathBuf>) -> Self {
        Self {
            executable: executable.into(),
            args: vec![],
            working_dir: None,
            env: HashMap::new(),
            use_path: true,
            search_path: SearchPath::default(),
            stdin: StdinMode::default(),
            stdout: RedirectMode::default(),
            stderr: RedirectMode::default(),
            fds_to_send: vec![],
            additional_output_fds: vec![],
            signals_to_forward: DEFAULT_FORWARDED_SIGNALS.to_vec(),
            line_separators: LineSeparators::default(),
            stream_interest: None,
            expected_exits: ExpectedExits::default(),
        }
    }

    /// Set command arguments
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args = args.into_iter().map(Into::into).collect();
        self
    }

    /// Set working directory
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Add environment variable
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    pub fn use_path(mut self, use_path: bool) -> Self {
        self.use_path = use_path;
        self
    }

    /// Look bare names up in `search_path` instead of `PATH`
    pub fn search_path(mut self, search_path: SearchPath) -> Self {
        self.search_path = search_path;
        self
    }

    pub fn stdin(mut self, mode: StdinMode) -> Self {
        self.stdin = mode;
        self
    }

    pub fn stdout(mut self, mode: RedirectMode) -> Self {
        self.stdout = mode;
        self
    }

    pub fn stderr(mut self, mode: RedirectMode) -> Self {
        self.stderr = mode;
        self
    }

    /// Install `fd` as descriptor `child_fd` in the child.
    ///
    /// Any descriptor sent forces the spawn through the fd launcher.
    pub fn send_fd(mut self, child_fd: RawFd, fd: impl Into<OwnedFd>) -> Self {
        self.fds_to_send.push(DescriptorToSend {
            child_fd,
            fd: fd.into(),
        });
        self
    }

    /// Capture output written to `fd` (usually the read end of a pipe whose
    /// write end is sent to the child). Lines are tagged with `fd`'s number.
    pub fn capture_fd(mut self, fd: impl Into<OwnedFd>) -> Self {
        self.additional_output_fds.push(fd.into());
        self
    }

    /// Replace the set of signals forwarded to the child
    pub fn forward_signals<I>(mut self, signals: I) -> Self
    where
        I: IntoIterator<Item = Signal>,
    {
        self.signals_to_forward = signals.into_iter().collect();
        self
    }

    pub fn line_separators(mut self, separators: LineSeparators) -> Self {
        self.line_separators = separators;
        self
    }

    /// Stop reading a stream as soon as `interest` returns false for one of
    /// its lines. That line is still delivered; its descriptor is closed, so
    /// a child that keeps writing gets `SIGPIPE`.
    pub fn stream_interest<F>(mut self, interest: F) -> Self
    where
        F: Fn(&OutputLine) -> bool + Send + Sync + 'static,
    {
        self.stream_interest = Some(StreamInterest::new(interest));
        self
    }

    pub fn expect_exits(mut self, expected: ExpectedExits) -> Self {
        self.expected_exits = expected;
        self
    }

    /// Whether `exit` counts as success for the checked helpers
    pub fn accepts_exit(&self, exit: ExitOutcome) -> bool {
        self.expected_exits.accepts(exit, self.stream_interest.is_some())
    }

    /// Whether spawning needs the fd launcher
    pub fn needs_launcher(&self) -> bool {
        !self.fds_to_send.is_empty()
    }

    /// Check for descriptor numbers requested twice or out of range.
    pub fn validate(&self) -> Result<()> {
        let mut seen = Vec::with_capacity(self.fds_to_send.len());
        for send in &self.fds_to_send {
            if send.child_fd < 0 || send.child_fd == RawFd::MAX {
                return Err(ProcessError::InvalidConfig(format!(
                    "invalid child descriptor {}",
                    send.child_fd
                )));
            }
            if seen.contains(&send.child_fd) {
                return Err(ProcessError::InvalidConfig(format!(
                    "descriptor {} requested twice",
                    send.child_fd
                )));
            }
            seen.push(send.child_fd);
        }
        for fd in &self.additional_output_fds {
            if self
                .additional_output_fds
                .iter()
                .filter(|other| other.as_raw_fd() == fd.as_raw_fd())
                .count()
                > 1
            {
                return Err(ProcessError::InvalidConfig(format!(
                    "descriptor {} captured twice",
                    fd.as_raw_fd()
                )));
            }
        }
        Ok(())
    }
}

/// Where to find the fd launcher binary
#[derive(Debug, Clone)]
pub struct LauncherConfig {
    /// Directory containing the launcher (None = not configured)
    pub exec_dir: Option<PathBuf>,
    /// File name of the launcher inside `exec_dir`
    pub binary_name: String,
}

impl LauncherConfig {
    /// Read the launcher location from `XCT_EXEC_PATH`.
    pub fn from_env() -> Self {
        Self {
            exec_dir: std::env::var_os(EXEC_PATH_ENV)
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            ..Self::default()
        }
    }

    /// Launcher in an explicit directory
    pub fn in_dir(dir: impl Into<PathBuf>) -> Self {
        Self {
            exec_dir: Some(dir.into()),
            ..Self::default()
        }
    }

    /// Full path of the launcher binary.
    pub fn launcher_path(&self) -> Result<PathBuf> {
        self.exec_dir
            .as_deref()
            .map(|dir| dir.join(&self.binary_name))
            .ok_or(ProcessError::ExecPathNotSet)
    }
}

impl Default for LauncherConfig {
    fn default() -> Self {
        Self {
            exec_dir: None,
            binary_name: "xct".to_string(),
        }
    }
}

//! Process manager - spawn, stream, forward, reap

use std::collections::HashMap;
use std::ffi::OsString;
use std::fs::File;
use std::io;
use std::os::fd::{AsFd, AsRawFd, BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::libc;
use nix::sys::signal::Signal;
use nix::unistd::Pid;
use tokio::process::Command;
use tracing::{debug, info};

use crate::{
    child::{ExitOutcome, LaunchRecord, ProcessHandle},
    config::{DescriptorToSend, LauncherConfig, ProcessConfig, RedirectMode, SearchPath, StdinMode},
    error::{ProcessError, Result},
    fd_transfer::{self, FdSender},
    launcher::LaunchRequest,
    signals::SignalForwarder,
    stream::{OutputLine, OutputSource, OutputStream, StreamMultiplexer},
    sys,
};

/// Spawns processes and drains their output
#[derive(Debug, Clone)]
pub struct ProcessManager {
    launcher: LauncherConfig,
}

impl ProcessManager {
    /// Create a manager that locates the fd launcher through `XCT_EXEC_PATH`
    pub fn new() -> Self {
        Self::with_launcher(LauncherConfig::from_env())
    }

    pub fn with_launcher(launcher: LauncherConfig) -> Self {
        Self { launcher }
    }

    pub fn launcher(&self) -> &LauncherConfig {
        &self.launcher
    }

    /// Spawn a process and hand back its output stream without waiting.
    ///
    /// Descriptors listed in the config are sent through the fd launcher,
    /// the requested signals are forwarded until the returned value is
    /// dropped or completed.
    ///
    /// # Examples
    /// ```no_run
    /// use xct_process::{ProcessManager, ProcessConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let manager = ProcessManager::new();
    /// let config = ProcessConfig::new("sleep").args(["1000"]);
    /// let process = manager.spawn_streamed(config).await?;
    /// process.signal(nix::sys::signal::Signal::SIGTERM)?;
    /// let outcome = process.wait_with(|_| {}).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn spawn_streamed(&self, config: ProcessConfig) -> Result<StreamedProcess> {
        config.validate()?;
        let launcher_path = if config.needs_launcher() {
            Some(self.launcher.launcher_path()?)
        } else {
            None
        };

        let ProcessConfig {
            executable,
            args,
            working_dir,
            env,
            use_path,
            search_path,
            stdin,
            stdout,
            stderr,
            fds_to_send,
            additional_output_fds,
            signals_to_forward,
            line_separators,
            stream_interest,
            expected_exits: _,
        } = config;

        debug!(
            executable = %executable.display(),
            args = ?args,
            sent_fds = fds_to_send.len(),
            "Spawning process"
        );

        let mut output = StreamMultiplexer::new(line_separators);
        if let Some(interest) = stream_interest {
            output.set_interest(interest);
        }
        let stdout = redirect(stdout, OutputSource::STDOUT, &mut output)?;
        let stderr = redirect(stderr, OutputSource::STDERR, &mut output)?;
        for fd in additional_output_fds {
            let tag = OutputSource(fd.as_raw_fd());
            output.add_source(fd, tag);
        }

        let record = LaunchRecord {
            executable: executable.clone(),
            args: args.clone(),
            working_dir: working_dir.clone(),
            env: env.clone(),
            sent_fds: fds_to_send.iter().map(|d| d.child_fd).collect(),
        };

        let (mut cmd, transfer) = match launcher_path {
            None => {
                let mut cmd = Command::new(direct_program(&executable, use_path, &search_path, &env)?);
                cmd.args(&args).stdin(stdin_stdio(stdin)?);
                (cmd, None)
            }
            Some(launcher) => {
                // The launcher runs in `working_dir`, so the lookup it does
                // must not depend on relative entries.
                let search_path = if use_path && is_bare(&executable) {
                    search_path.launcher_path(&env, &std::env::current_dir()?)
                } else {
                    None
                };
                let request = LaunchRequest {
                    executable: executable.into_os_string(),
                    args,
                    use_path: search_path.is_some(),
                    search_path,
                };
                let mut to_send = fds_to_send;
                if !to_send.iter().any(|d| d.child_fd == 0) {
                    to_send.push(DescriptorToSend {
                        child_fd: 0,
                        fd: stdin_fd(stdin)?,
                    });
                }
                let (parent_end, child_end) = fd_transfer::channel()?;

                let mut cmd = Command::new(launcher);
                cmd.args(request.to_cli_args()).stdin(Stdio::from(child_end));
                (cmd, Some((parent_end, to_send)))
            }
        };

        if let Some(dir) = &working_dir {
            cmd.current_dir(dir);
        }
        cmd.envs(&env).stdout(stdout).stderr(stderr).process_group(0);

        let child = cmd.spawn()?;
        // Release the parent's copies of the child's stdio.
        drop(cmd);
        let mut handle = ProcessHandle::new(child, record)?;

        if let Some((channel, to_send)) = transfer {
            if let Err(e) = send_descriptors(&channel, &to_send) {
                handle.kill_and_reap().await;
                return Err(e);
            }
        }

        info!(
            pid = %handle.pid(),
            executable = %handle.executable().display(),
            sent_fds = ?handle.sent_fds(),
            "Process spawned"
        );

        let forwarder = match SignalForwarder::start(handle.pid(), &signals_to_forward) {
            Ok(forwarder) => forwarder,
            Err(e) => {
                handle.kill_and_reap().await;
                return Err(e);
            }
        };

        let output = match output.start() {
            Ok(output) => output,
            Err(e) => {
                drop(forwarder);
                handle.kill_and_reap().await;
                return Err(e);
            }
        };

        Ok(StreamedProcess {
            handle,
            output,
            forwarder,
        })
    }

    /// Spawn a process, deliver each output line to `on_line`, and return
    /// once the process exited and every captured stream hit EOF.
    ///
    /// # Examples
    /// ```no_run
    /// use xct_process::{ProcessManager, ProcessConfig};
    ///
    /// # #[tokio::main]
    /// # async fn main() -> Result<(), Box<dyn std::error::Error>> {
    /// let manager = ProcessManager::new();
    /// let config = ProcessConfig::new("echo").args(["hello"]);
    /// let outcome = manager
    ///     .spawn_and_stream(config, |line| print!("{}", line.to_string_lossy()))
    ///     .await?;
    /// assert!(outcome.success());
    /// # Ok(())
    /// # }
    /// ```
    pub async fn spawn_and_stream<F>(&self, config: ProcessConfig, on_line: F) -> Result<ExitOutcome>
    where
        F: FnMut(OutputLine),
    {
        self.spawn_streamed(config).await?.wait_with(on_line).await
    }

    /// Spawn a process and buffer all of its output.
    pub async fn spawn_and_get_output(&self, config: ProcessConfig) -> Result<ProcessOutput> {
        let mut lines = Vec::new();
        let exit = self.spawn_and_stream(config, |line| lines.push(line)).await?;
        Ok(ProcessOutput { exit, lines })
    }

    /// Spawn a process and return its stdout lines, without separators.
    ///
    /// An exit the config's [`ExpectedExits`](crate::config::ExpectedExits)
    /// does not accept is an error.
    pub async fn spawn_and_get_stdout(&self, config: ProcessConfig) -> Result<Vec<String>> {
        let expected = config.expected_exits.clone();
        let streams_may_close = config.stream_interest.is_some();
        let output = self.spawn_and_get_output(config).await?;
        if !expected.accepts(output.exit, streams_may_close) {
            return Err(ProcessError::UnexpectedExit(output.exit));
        }
        output
            .lines_from(OutputSource::STDOUT)
            .map(|line| line.line_str().map(str::to_string))
            .collect()
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        Self::new()
    }
}

/// A running process whose output is being drained
#[derive(Debug)]
pub struct StreamedProcess {
    handle: ProcessHandle,
    output: OutputStream,
    forwarder: SignalForwarder,
}

impl StreamedProcess {
    pub fn handle(&self) -> &ProcessHandle {
        &self.handle
    }

    pub fn pid(&self) -> Pid {
        self.handle.pid()
    }

    /// Send a signal to the child, e.g. to implement a timeout.
    pub fn signal(&self, signal: Signal) -> Result<()> {
        self.handle.signal(signal)
    }

    /// Stop reading one of the captured streams; see
    /// [`OutputStream::close_source`].
    pub fn close_output(&mut self, source: OutputSource) -> bool {
        self.output.close_source(source)
    }

    /// Deliver output lines to `on_line` until the process exited and every
    /// stream is drained.
    ///
    /// A read error on one stream does not stop the others; the first one is
    /// returned once everything else has completed.
    pub async fn wait_with<F>(self, mut on_line: F) -> Result<ExitOutcome>
    where
        F: FnMut(OutputLine),
    {
        let StreamedProcess {
            mut handle,
            mut output,
            forwarder,
        } = self;

        let mut exit = None;
        let mut drained = false;
        let mut read_error = None;
        let wait = handle.wait();
        tokio::pin!(wait);

        let exit = loop {
            if let (true, Some(exit)) = (drained, exit) {
                break exit;
            }
            tokio::select! {
                status = &mut wait, if exit.is_none() => {
                    forwarder.mark_exited();
                    exit = Some(status?);
                }
                event = output.next(), if !drained => match event {
                    Some(Ok(line)) => on_line(line),
                    Some(Err(e)) => {
                        read_error.get_or_insert(e);
                    }
                    None => drained = true,
                },
            }
        };

        drop(forwarder);
        match read_error {
            Some(e) => Err(e),
            None => Ok(exit),
        }
    }
}

/// Buffered result of [`ProcessManager::spawn_and_get_output`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessOutput {
    pub exit: ExitOutcome,
    /// Every line in arrival order
    pub lines: Vec<OutputLine>,
}

impl ProcessOutput {
    pub fn lines_from(&self, source: OutputSource) -> impl Iterator<Item = &OutputLine> {
        self.lines.iter().filter(move |line| line.source == source)
    }

    /// All text from `source`, separators included
    pub fn text(&self, source: OutputSource) -> Result<String> {
        self.lines_from(source).map(OutputLine::text).collect()
    }

    pub fn stdout(&self) -> Result<String> {
        self.text(OutputSource::STDOUT)
    }

    pub fn stderr(&self) -> Result<String> {
        self.text(OutputSource::STDERR)
    }
}

fn is_bare(executable: &Path) -> bool {
    !executable.as_os_str().as_bytes().contains(&b'/')
}

/// Program to hand to `Command` when no launcher is involved.
fn direct_program(
    executable: &Path,
    use_path: bool,
    search_path: &SearchPath,
    env: &HashMap<OsString, OsString>,
) -> Result<PathBuf> {
    if !is_bare(executable) {
        return Ok(executable.to_path_buf());
    }
    if !use_path {
        return Ok(Path::new(".").join(executable));
    }
    if let SearchPath::Environment = search_path {
        // `Command` already looks in a PATH set through `env`.
        return Ok(executable.to_path_buf());
    }
    let dirs = search_path.directories(env, &std::env::current_dir()?);
    if dirs.is_empty() {
        return Ok(Path::new(".").join(executable));
    }
    sys::find_executable(executable, &dirs)
        .ok_or_else(|| ProcessError::SpawnFailed(io::Error::from_raw_os_error(libc::ENOENT)))
}

fn redirect(mode: RedirectMode, tag: OutputSource, output: &mut StreamMultiplexer) -> Result<Stdio> {
    Ok(match mode {
        RedirectMode::Inherit => Stdio::inherit(),
        RedirectMode::Discard => Stdio::null(),
        RedirectMode::ToFd(fd) => Stdio::from(fd),
        RedirectMode::Capture => {
            let (read, write) = sys::cloexec_pipe()?;
            output.add_source(read, tag);
            Stdio::from(write)
        }
    })
}

fn stdin_stdio(mode: StdinMode) -> Result<Stdio> {
    Ok(match mode {
        StdinMode::Inherit => Stdio::inherit(),
        StdinMode::Null => Stdio::null(),
        StdinMode::Fd(fd) => Stdio::from(fd),
    })
}

/// The descriptor the target should see as stdin behind the launcher.
fn stdin_fd(mode: StdinMode) -> Result<OwnedFd> {
    Ok(match mode {
        StdinMode::Inherit => std::io::stdin().as_fd().try_clone_to_owned()?,
        StdinMode::Null => File::open("/dev/null")?.into(),
        StdinMode::Fd(fd) => fd,
    })
}

fn send_descriptors(channel: &OwnedFd, to_send: &[DescriptorToSend]) -> Result<()> {
    let pairs: Vec<(BorrowedFd<'_>, RawFd)> = to_send
        .iter()
        .map(|d| (d.fd.as_fd(), d.child_fd))
        .collect();
    FdSender::new(channel).send_all(&pairs)?;
    debug!(count = pairs.len(), "Descriptors sent to launcher");
    Ok(())
}

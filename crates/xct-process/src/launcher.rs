//! The receiving half of descriptor passing
//!
//! `xct internal-fd-get-launcher` is spawned with one end of a transfer
//! channel as its stdin. It installs every descriptor it receives at the
//! requested number, then replaces itself with the real target.

use std::convert::Infallible;
use std::ffi::{CString, OsStr, OsString};
use std::fs::File;
use std::os::fd::{BorrowedFd, OwnedFd, RawFd};
use std::os::unix::ffi::OsStrExt;
use std::path::Path;

use nix::errno::Errno;
use nix::unistd::execv;
use tracing::debug;

use crate::config::DEFAULT_SEARCH_PATH;
use crate::error::{ProcessError, Result};
use crate::fd_transfer::FdReceiver;
use crate::sys;

/// Name of the `xct` subcommand that runs [`exec_with_received_fds`].
pub const LAUNCHER_SUBCOMMAND: &str = "internal-fd-get-launcher";

/// What the launcher should exec once descriptors are in place
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LaunchRequest {
    pub executable: OsString,
    pub args: Vec<OsString>,
    /// Look bare names up in the search path
    pub use_path: bool,
    /// Search path; falls back to `PATH`
    pub search_path: Option<OsString>,
}

impl LaunchRequest {
    /// Arguments for `xct` that reproduce this request.
    pub fn to_cli_args(&self) -> Vec<OsString> {
        let mut args: Vec<OsString> = vec![LAUNCHER_SUBCOMMAND.into()];
        args.push(if self.use_path { "--use-path" } else { "--no-use-path" }.into());
        if let Some(path) = &self.search_path {
            args.push("--path".into());
            args.push(path.clone());
        }
        args.push("--".into());
        args.push(self.executable.clone());
        args.extend(self.args.iter().cloned());
        args
    }
}

/// Receive descriptors on stdin, install them, and exec the target.
///
/// Only returns on failure.
pub fn exec_with_received_fds(request: &LaunchRequest) -> ProcessError {
    match install_received_fds().and_then(|()| exec(request)) {
        Ok(never) => match never {},
        Err(e) => e,
    }
}

fn install_received_fds() -> Result<()> {
    // SAFETY: stdin stays open for the lifetime of the launcher.
    let channel = unsafe { BorrowedFd::borrow_raw(0) };
    let received = FdReceiver::new(channel).receive_all()?;

    // Park everything above the highest destination first, so no dup2 can
    // clobber a descriptor that still has to be moved.
    let floor = parking_floor(received.iter().map(|r| r.child_fd))?;
    let parked = received
        .into_iter()
        .map(|r| Ok((sys::dup_above(&r.fd, floor)?, r.child_fd)))
        .collect::<Result<Vec<(OwnedFd, RawFd)>>>()?;

    for (fd, child_fd) in &parked {
        sys::dup_onto(fd, *child_fd)?;
        debug!(child_fd, "Installed descriptor");
    }
    if !parked.iter().any(|(_, child_fd)| *child_fd == 0) {
        // Never leave the channel behind as the target's stdin.
        sys::dup_onto(&File::open("/dev/null")?, 0)?;
    }
    Ok(())
}

/// Lowest descriptor number above every destination (and above stdio).
fn parking_floor(destinations: impl IntoIterator<Item = RawFd>) -> Result<RawFd> {
    match destinations.into_iter().max() {
        None => Ok(3),
        Some(max) => max
            .checked_add(1)
            .map(|floor| floor.max(3))
            .ok_or(ProcessError::System {
                operation: "fcntl",
                errno: Errno::EBADF,
            }),
    }
}

fn to_cstring(value: &OsStr) -> Result<CString> {
    CString::new(value.as_bytes())
        .map_err(|_| ProcessError::InvalidConfig(format!("{value:?} contains a NUL byte")))
}

fn exec(request: &LaunchRequest) -> Result<Infallible> {
    let argv = std::iter::once(request.executable.as_os_str())
        .chain(request.args.iter().map(OsString::as_os_str))
        .map(to_cstring)
        .collect::<Result<Vec<CString>>>()?;

    let bare_name = !request.executable.as_bytes().contains(&b'/');
    if !(request.use_path && bare_name) {
        let path = to_cstring(&request.executable)?;
        return execv(&path, &argv).map_err(ProcessError::system("execv"));
    }

    let search_path = request
        .search_path
        .clone()
        .or_else(|| std::env::var_os("PATH"))
        .unwrap_or_else(|| DEFAULT_SEARCH_PATH.into());

    let mut denied = false;
    for dir in std::env::split_paths(&search_path) {
        let dir = if dir.as_os_str().is_empty() { Path::new(".").to_path_buf() } else { dir };
        let candidate = to_cstring(dir.join(&request.executable).as_os_str())?;
        match execv(&candidate, &argv) {
            Ok(never) => match never {},
            Err(Errno::EACCES) => denied = true,
            Err(Errno::ENOENT) | Err(Errno::ENOTDIR) => {}
            Err(errno) => return Err(ProcessError::System { operation: "execv", errno }),
        }
    }

    Err(ProcessError::System {
        operation: "execvp",
        errno: if denied { Errno::EACCES } else { Errno::ENOENT },
    })
}

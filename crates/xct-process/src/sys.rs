//! Thin wrappers over descriptor syscalls

use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use nix::errno::Errno;
use nix::libc;

use crate::error::{ProcessError, Result};

/// Create a close-on-exec pipe, returning `(read, write)`.
#[cfg(not(any(target_os = "macos", target_os = "ios")))]
pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    nix::unistd::pipe2(nix::fcntl::OFlag::O_CLOEXEC).map_err(ProcessError::system("pipe"))
}

#[cfg(any(target_os = "macos", target_os = "ios"))]
pub(crate) fn cloexec_pipe() -> Result<(OwnedFd, OwnedFd)> {
    let (read, write) = nix::unistd::pipe().map_err(ProcessError::system("pipe"))?;
    set_cloexec(read.as_raw_fd())?;
    set_cloexec(write.as_raw_fd())?;
    Ok((read, write))
}

/// Mark a descriptor close-on-exec.
#[allow(dead_code)]
pub(crate) fn set_cloexec(fd: RawFd) -> Result<()> {
    // SAFETY: plain fcntl calls on a descriptor the caller keeps open.
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFD) })
        .map_err(ProcessError::system("fcntl(F_GETFD)"))?;
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFD, flags | libc::FD_CLOEXEC) })
        .map(drop)
        .map_err(ProcessError::system("fcntl(F_SETFD)"))
}

/// Switch a descriptor to non-blocking mode.
pub(crate) fn set_nonblocking(fd: RawFd) -> Result<()> {
    // SAFETY: plain fcntl calls on a descriptor the caller keeps open.
    let flags = Errno::result(unsafe { libc::fcntl(fd, libc::F_GETFL) })
        .map_err(ProcessError::system("fcntl(F_GETFL)"))?;
    if flags & libc::O_NONBLOCK != 0 {
        return Ok(());
    }
    Errno::result(unsafe { libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK) })
        .map(drop)
        .map_err(ProcessError::system("fcntl(F_SETFL)"))
}

/// Duplicate `fd` to the lowest free number at or above `min`, close-on-exec.
pub(crate) fn dup_above(fd: &impl AsRawFd, min: RawFd) -> Result<OwnedFd> {
    // SAFETY: F_DUPFD_CLOEXEC returns a fresh descriptor we own.
    let raw = Errno::result(unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_DUPFD_CLOEXEC, min) })
        .map_err(ProcessError::system("fcntl(F_DUPFD_CLOEXEC)"))?;
    Ok(unsafe { OwnedFd::from_raw_fd(raw) })
}

/// `dup2(fd, target)`. The copy at `target` is not close-on-exec.
pub(crate) fn dup_onto(fd: &impl AsRawFd, target: RawFd) -> Result<()> {
    loop {
        // SAFETY: the target number is chosen by the caller, who takes over
        // whatever previously lived there.
        match Errno::result(unsafe { libc::dup2(fd.as_raw_fd(), target) }) {
            Ok(_) => return Ok(()),
            Err(Errno::EINTR) => continue,
            Err(errno) => return Err(ProcessError::System { operation: "dup2", errno }),
        }
    }
}

/// First `dir/name` that is an executable regular file.
pub(crate) fn find_executable(name: &Path, dirs: &[PathBuf]) -> Option<PathBuf> {
    dirs.iter().map(|dir| dir.join(name)).find(|candidate| {
        std::fs::metadata(candidate)
            .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
            .unwrap_or(false)
    })
}

//! Spawning under descriptor pressure
//!
//! Lives in its own test binary: it changes RLIMIT_NOFILE for the whole
//! process.

use std::fs::File;
use std::path::PathBuf;

use nix::errno::Errno;
use nix::sys::resource::{getrlimit, setrlimit, Resource};
use nix::sys::wait::{waitpid, WaitPidFlag};
use serial_test::serial;
use xct_process::{LauncherConfig, ProcessConfig, ProcessError, ProcessManager};

const SOFT_LIMIT: u64 = 256;
const RELEASED: usize = 64;
/// More datagrams than a socket send buffer holds, so the transfer has to
/// wait for the launcher.
const SENT: i32 = 1000;

fn echo_hello() -> ProcessConfig {
    ProcessConfig::new("sh")
        .args(["-c", "echo hello"])
        .forward_signals([])
}

#[tokio::test]
#[serial]
async fn test_spawn_fails_cleanly_without_descriptors() {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
    setrlimit(Resource::RLIMIT_NOFILE, SOFT_LIMIT.min(soft as u64) as _, hard).unwrap();

    let mut hog = Vec::new();
    loop {
        match File::open("/dev/null") {
            Ok(file) => hog.push(file),
            Err(e) => {
                assert_eq!(e.raw_os_error(), Some(Errno::EMFILE as i32));
                break;
            }
        }
    }
    assert!(hog.len() > RELEASED);

    let manager = ProcessManager::with_launcher(LauncherConfig::default());
    let err = manager.spawn_and_get_output(echo_hello()).await.unwrap_err();
    assert!(matches!(err, ProcessError::System { .. }), "{err}");
    assert_eq!(err.os_error(), Some(Errno::EMFILE));

    // nothing was spawned
    assert_eq!(
        waitpid(None, Some(WaitPidFlag::WNOHANG)).unwrap_err(),
        Errno::ECHILD
    );

    hog.truncate(hog.len() - RELEASED);
    let output = manager.spawn_and_get_output(echo_hello()).await.unwrap();
    assert!(output.exit.success());
    assert_eq!(output.stdout().unwrap(), "hello\n");

    drop(hog);
    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).unwrap();
}

/// A launcher that exits without reading breaks the transfer; the launcher
/// is killed and reaped before the error is returned.
#[tokio::test]
#[serial]
async fn test_failed_transfer_reaps_launcher() {
    let (soft, hard) = getrlimit(Resource::RLIMIT_NOFILE).unwrap();
    let needed = (SENT as u64 + 256).min(hard);
    if soft < needed {
        setrlimit(Resource::RLIMIT_NOFILE, needed, hard).unwrap();
    }

    let launcher = LauncherConfig {
        exec_dir: Some(PathBuf::from("/usr/bin")),
        binary_name: "true".to_string(),
    };
    let manager = ProcessManager::with_launcher(launcher);
    let mut config = echo_hello();
    for child_fd in 3..3 + SENT {
        config = config.send_fd(child_fd, File::open("/dev/null").unwrap());
    }

    let err = manager.spawn_streamed(config).await.unwrap_err();
    assert!(matches!(err, ProcessError::System { .. }), "{err}");
    assert_eq!(
        waitpid(None, Some(WaitPidFlag::WNOHANG)).unwrap_err(),
        Errno::ECHILD
    );

    setrlimit(Resource::RLIMIT_NOFILE, soft, hard).unwrap();
}

//! # xct-process
//!
//! **Purpose**: Process spawning and output streaming for xct
//!
//! Spawns a child, drains any number of its output descriptors concurrently,
//! optionally passes extra descriptors into it, forwards signals the parent
//! receives, and reports the exit status only once every stream is drained.
//!
//! ## Features
//!
//! - **Line Streaming**: stdout, stderr and extra descriptors, tagged per source
//! - **Descriptor Passing**: `SCM_RIGHTS` transfer through the `xct` fd launcher
//! - **Signal Forwarding**: one process-wide registry that chains to the
//!   handlers that were installed before it
//! - **Completion**: exit status and end of output are both awaited
//! - **Early Close**: a stream can be dropped once the caller has seen enough
//!
//! ## Usage
//!
//! ```rust,no_run
//! use xct_process::{OutputSource, ProcessConfig, ProcessManager, RedirectMode};
//!
//! # #[tokio::main]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let manager = ProcessManager::new();
//!
//! let config = ProcessConfig::new("sh")
//!     .args(["-c", "echo out; echo err >&2"])
//!     .stdout(RedirectMode::Capture)
//!     .stderr(RedirectMode::Capture);
//!
//! let outcome = manager
//!     .spawn_and_stream(config, |line| {
//!         let tag = if line.source == OutputSource::STDERR { "err" } else { "out" };
//!         println!("[{tag}] {}", line.to_string_lossy().trim_end());
//!     })
//!     .await?;
//!
//! println!("{outcome}");
//! # Ok(())
//! # }
//! ```

#![cfg(unix)]

pub mod child;
pub mod config;
pub mod error;
pub mod fd_transfer;
pub mod launcher;
pub mod manager;
pub mod signals;
pub mod stream;
mod sys;

pub use child::{ExitOutcome, ExitReason, ProcessHandle};
pub use config::{
    ExpectedExits, LauncherConfig, ProcessConfig, RedirectMode, SearchPath, StdinMode, EXEC_PATH_ENV,
};
pub use error::{ProcessError, Result};
pub use launcher::LaunchRequest;
pub use manager::{ProcessManager, ProcessOutput, StreamedProcess};
pub use stream::{LineSeparators, OutputLine, OutputSource, StreamInterest};

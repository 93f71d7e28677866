//! # xct
//!
//! Entry point for xct tools. `xct <tool> args…` runs `xct-<tool>` with
//! `XCT_EXEC_PATH` pointing at this binary's directory; the hidden
//! `internal-fd-get-launcher` subcommand receives descriptors for
//! [`xct_process`] and execs the real target.

pub mod cli;
pub mod commands;
pub mod logging;

use anyhow::Result;

use cli::{Cli, Command};

/// Run a parsed command line. Returns only on failure or for commands that
/// do not replace the process.
pub fn run(cli: Cli) -> Result<()> {
    match cli.command {
        Command::FdLauncher(args) => commands::launcher::run(args),
        Command::Tool(argv) => {
            let exec_path = commands::tool::resolve_exec_path(cli.exec_path)?;
            commands::tool::exec_tool(&exec_path, cli.working_dir.as_deref(), &argv)
        }
    }
}

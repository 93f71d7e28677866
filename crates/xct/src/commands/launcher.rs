//! `xct internal-fd-get-launcher`

use tracing::error;
use xct_process::launcher;

use crate::cli::LauncherArgs;

/// Install the descriptors sent on stdin and exec the requested command.
///
/// Exits with the OS error code when anything fails.
pub fn run(args: LauncherArgs) -> ! {
    let request = args.into_request();
    let err = launcher::exec_with_received_fds(&request);
    error!(
        executable = ?request.executable,
        error = %err,
        "fd launcher failed"
    );
    std::process::exit(err.exit_code())
}

//! Command-line definition

use std::ffi::OsString;
use std::path::PathBuf;

use clap::{ArgAction, Args, Parser, Subcommand};
use xct_process::launcher::{LaunchRequest, LAUNCHER_SUBCOMMAND};
use xct_process::EXEC_PATH_ENV;

#[derive(Parser, Debug)]
#[command(name = "xct")]
#[command(about = "Run xct tools", long_about = None)]
#[command(version, disable_help_subcommand = true)]
pub struct Cli {
    /// Directory containing the xct binary (defaults to the running binary's)
    #[arg(long = "exec-path", env = EXEC_PATH_ENV, value_name = "PATH")]
    pub exec_path: Option<PathBuf>,

    /// Run as if xct was started in <path>
    #[arg(short = 'C', value_name = "path")]
    pub working_dir: Option<PathBuf>,

    /// More logging (-v debug, -vv trace)
    #[arg(short, long, action = ArgAction::Count, global = true)]
    pub verbose: u8,

    #[command(subcommand)]
    pub command: Command,
}

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Receive descriptors on stdin, install them and exec a command
    #[command(name = LAUNCHER_SUBCOMMAND, hide = true)]
    FdLauncher(LauncherArgs),

    /// Any other tool runs as `xct-<tool>` from PATH
    #[command(external_subcommand)]
    Tool(Vec<OsString>),
}

#[derive(Args, Debug)]
pub struct LauncherArgs {
    /// Look the executable up in the search path
    #[arg(long = "use-path", overrides_with = "no_use_path")]
    pub use_path: bool,

    /// Treat the executable as a path
    #[arg(long = "no-use-path", overrides_with = "use_path")]
    pub no_use_path: bool,

    /// Search path to use instead of $PATH
    #[arg(long = "path", value_name = "PATH")]
    pub search_path: Option<OsString>,

    /// Executable followed by its arguments
    #[arg(required = true, num_args = 1.., trailing_var_arg = true, allow_hyphen_values = true)]
    pub command: Vec<OsString>,
}

impl LauncherArgs {
    pub fn into_request(self) -> LaunchRequest {
        let use_path = !self.no_use_path;
        let mut command = self.command.into_iter();
        LaunchRequest {
            executable: command.next().unwrap_or_default(),
            args: command.collect(),
            use_path,
            search_path: self.search_path,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(args).unwrap()
    }

    #[test]
    fn test_launcher_arguments() {
        let cli = parse(&[
            "xct",
            "internal-fd-get-launcher",
            "--no-use-path",
            "--",
            "/bin/sh",
            "-c",
            "echo hi >&5",
        ]);
        let Command::FdLauncher(args) = cli.command else {
            panic!("expected launcher");
        };
        let request = args.into_request();
        assert!(!request.use_path);
        assert_eq!(request.executable, "/bin/sh");
        assert_eq!(request.args, vec![OsString::from("-c"), OsString::from("echo hi >&5")]);
    }

    #[test]
    fn test_launcher_request_round_trips_through_cli() {
        let request = LaunchRequest {
            executable: "cat".into(),
            args: vec!["-u".into(), "file".into()],
            use_path: true,
            search_path: Some("/usr/bin:/bin".into()),
        };
        let argv = std::iter::once(OsString::from("xct")).chain(request.to_cli_args());
        let cli = Cli::try_parse_from(argv).unwrap();
        let Command::FdLauncher(args) = cli.command else {
            panic!("expected launcher");
        };
        assert_eq!(args.into_request(), request);
    }

    #[test]
    fn test_use_path_defaults_on() {
        let cli = parse(&["xct", "internal-fd-get-launcher", "ls", "-l"]);
        let Command::FdLauncher(args) = cli.command else {
            panic!("expected launcher");
        };
        let request = args.into_request();
        assert!(request.use_path);
        assert_eq!(request.executable, "ls");
        assert_eq!(request.args, vec![OsString::from("-l")]);
    }

    #[test]
    fn test_external_tool_with_global_options() {
        let cli = parse(&["xct", "-C", "/tmp", "--exec-path", "/opt/xct", "build", "--release"]);
        assert_eq!(cli.working_dir, Some(PathBuf::from("/tmp")));
        assert_eq!(cli.exec_path, Some(PathBuf::from("/opt/xct")));
        let Command::Tool(argv) = cli.command else {
            panic!("expected external tool");
        };
        assert_eq!(argv, vec![OsString::from("build"), OsString::from("--release")]);
    }

    #[test]
    fn test_launcher_requires_command() {
        assert!(Cli::try_parse_from(["xct", "internal-fd-get-launcher", "--use-path"]).is_err());
    }
}

//! Dispatch to `xct-<tool>` executables

use std::ffi::{OsStr, OsString};
use std::os::unix::process::CommandExt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{anyhow, bail, Context, Result};
use tracing::debug;
use xct_process::EXEC_PATH_ENV;

/// Name of the executable implementing `tool`
pub fn tool_program(tool: &OsStr) -> OsString {
    let mut program = OsString::from("xct-");
    program.push(tool);
    program
}

/// Absolute directory of the `xct` binary.
///
/// `configured` comes from `--exec-path` or the environment; otherwise the
/// running executable's directory is used.
pub fn resolve_exec_path(configured: Option<PathBuf>) -> Result<PathBuf> {
    let path = match configured {
        Some(path) => path,
        None => {
            let exe = std::env::current_exe().context("cannot locate the xct binary")?;
            exe.parent()
                .map(Path::to_path_buf)
                .ok_or_else(|| anyhow!("xct binary has no parent directory"))?
        }
    };
    if path.is_absolute() {
        Ok(path)
    } else {
        Ok(std::env::current_dir()
            .context("cannot read the current directory")?
            .join(path))
    }
}

/// Replace this process with `xct-<tool>`.
///
/// Only returns on failure.
pub fn exec_tool(exec_path: &Path, working_dir: Option<&Path>, argv: &[OsString]) -> Result<()> {
    let Some((tool, args)) = argv.split_first() else {
        bail!("no tool given");
    };

    if let Some(dir) = working_dir {
        std::env::set_current_dir(dir)
            .with_context(|| format!("cannot change directory to {}", dir.display()))?;
    }
    std::env::set_var(EXEC_PATH_ENV, exec_path);

    let program = tool_program(tool);
    debug!(program = ?program, args = ?args, "Executing tool");
    let err = Command::new(&program).args(args).exec();
    Err(err).with_context(|| format!("failed to run {}", program.to_string_lossy()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tool_program() {
        assert_eq!(tool_program(OsStr::new("build")), OsString::from("xct-build"));
    }

    #[test]
    fn test_relative_exec_path_is_made_absolute() {
        let resolved = resolve_exec_path(Some(PathBuf::from("bin"))).unwrap();
        assert!(resolved.is_absolute());
        assert!(resolved.ends_with("bin"));

        let resolved = resolve_exec_path(Some(PathBuf::from("/opt/xct"))).unwrap();
        assert_eq!(resolved, PathBuf::from("/opt/xct"));
    }

    #[test]
    fn test_default_exec_path_is_binary_dir() {
        let resolved = resolve_exec_path(None).unwrap();
        let exe = std::env::current_exe().unwrap();
        assert_eq!(Some(resolved.as_path()), exe.parent());
    }

    #[test]
    fn test_empty_argv_is_rejected() {
        assert!(exec_tool(Path::new("/opt/xct"), None, &[]).is_err());
    }
}

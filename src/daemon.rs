//! Background mode
//!
//! `--daemon` re-invokes the binary detached from the terminal with
//! `--supervise`. The supervisor then runs the real shard as a foreground
//! child marked with `--child` and restarts it once if it fails.
//!
//! Everything here is synchronous and runs before any async runtime is
//! created.

use std::ffi::OsString;
use std::process::{Command, ExitStatus, Stdio};

use anyhow::{Context, Result};
use tracing::{error, info, warn};

/// Marker flag for a shard process started by the supervisor
pub const CHILD_FLAG: &str = "--child";

/// Flag that turns the process into the restart supervisor
pub const SUPERVISE_FLAG: &str = "--supervise";

/// How many times a failed child is started again
pub const MAX_RESTARTS: u32 = 1;

/// Arguments for the detached supervisor: the invoking ones plus `--supervise`
pub fn supervisor_args(args: &[OsString]) -> Vec<OsString> {
    let mut out: Vec<OsString> = args
        .iter()
        .filter(|a| !is_flag(a, SUPERVISE_FLAG))
        .cloned()
        .collect();
    out.push(SUPERVISE_FLAG.into());
    out
}

/// Arguments for the shard child: the invoking ones with `--supervise`
/// replaced by `--child`
pub fn child_args(args: &[OsString]) -> Vec<OsString> {
    let mut out: Vec<OsString> = args
        .iter()
        .filter(|a| !is_flag(a, SUPERVISE_FLAG) && !is_flag(a, CHILD_FLAG))
        .cloned()
        .collect();
    out.push(CHILD_FLAG.into());
    out
}

fn is_flag(arg: &OsString, flag: &str) -> bool {
    arg.to_str() == Some(flag)
}

/// Spawn a detached supervisor and return its pid.
///
/// `args` excludes the program name. The supervisor gets its own process
/// group and no stdio, so it outlives the invoking terminal.
pub fn spawn_supervisor(args: &[OsString]) -> Result<u32> {
    let exe = std::env::current_exe().context("Failed to locate the memdb executable")?;

    let mut command = Command::new(&exe);
    command
        .args(supervisor_args(args))
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null());

    #[cfg(unix)]
    {
        use std::os::unix::process::CommandExt;
        command.process_group(0);
    }

    let child = command
        .spawn()
        .with_context(|| format!("Failed to start {} in the background", exe.display()))?;
    Ok(child.id())
}

/// Run the shard child, restarting it at most [`MAX_RESTARTS`] times after
/// an unsuccessful exit.
///
/// Returns the exit code the supervisor should exit with. Only the direct
/// child is ever waited on; nothing is killed.
pub fn supervise(args: &[OsString]) -> Result<i32> {
    let exe = std::env::current_exe().context("Failed to locate the memdb executable")?;
    let child_args = child_args(args);

    run_supervised(MAX_RESTARTS, || {
        Command::new(&exe)
            .args(&child_args)
            .status()
            .with_context(|| format!("Failed to run {}", exe.display()))
    })
}

/// Restart loop, separated from process spawning so it can be tested
fn run_supervised<F>(max_restarts: u32, mut run_child: F) -> Result<i32>
where
    F: FnMut() -> Result<ExitStatus>,
{
    let mut restarts = 0;
    loop {
        let status = run_child()?;
        if status.success() {
            info!("Shard process exited cleanly");
            return Ok(0);
        }

        let code = status.code().unwrap_or(1);
        if restarts >= max_restarts {
            error!("Shard process exited with {}, giving up", status);
            return Ok(code);
        }

        restarts += 1;
        warn!("Shard process exited with {}, restarting ({}/{})", status, restarts, max_restarts);
    }
}

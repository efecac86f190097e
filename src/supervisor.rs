//! Child-process supervisor
//!
//! Spawns the child with configured stdio redirection, environment overlay,
//! and working directory; forwards signals; performs graceful-then-forced
//! termination. Grounded in the same `tokio::process::Command` + best-effort
//! `libc::kill` pattern the teacher's MCP stdio transport uses to drive and
//! tear down a child process.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;

use tokio::process::{Child, Command};

use crate::codec::{StderrDisposition, StdoutDisposition};
use crate::error::{CwcError, Result};

/// A spawned child process plus the handles the multiplexer needs.
pub struct Supervised {
    /// The running child. `stdin`/`stdout`/`stderr` are taken by the
    /// multiplexer immediately after spawn.
    pub child: Child,
    /// Whether stderr was merged into stdout at spawn time (so the
    /// multiplexer knows not to start a separate stderr reader).
    pub stderr_merged: bool,
}

/// Spawn `argv` with the requested stdio dispositions, environment overlay,
/// and working directory.
///
/// `stdin` is always a writable pipe, even if the client never sends data.
/// The child's environment is the server's own environment overlaid with
/// `env_overlay` (overlay wins on key collision) -- `tokio::process::Command`
/// inherits the parent's environment by default, so this is expressed as a
/// plain `cmd.envs(env_overlay)` rather than clearing first.
pub fn spawn(
    argv: &[String],
    stdout: StdoutDisposition,
    stderr: StderrDisposition,
    env_overlay: &HashMap<String, String>,
    cwd: &Path,
) -> Result<Supervised> {
    let (program, args) = argv
        .split_first()
        .ok_or_else(|| anyhow::anyhow!(CwcError::Spawn {
            argv: argv.to_vec(),
            source: std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty argv"),
        }))?;

    let mut cmd = Command::new(program);
    cmd.args(args);
    cmd.current_dir(cwd);
    cmd.envs(env_overlay);
    cmd.stdin(Stdio::piped());

    match stdout {
        StdoutDisposition::Pipe => {
            cmd.stdout(Stdio::piped());
        }
        StdoutDisposition::Null => {
            cmd.stdout(Stdio::null());
        }
    }

    let stderr_merged = matches!(stderr, StderrDisposition::Stdout);
    match stderr {
        StderrDisposition::Pipe => {
            cmd.stderr(Stdio::piped());
        }
        StderrDisposition::Null => {
            cmd.stderr(Stdio::null());
        }
        StderrDisposition::Stdout => {
            // Merging stderr into stdout at the OS level requires the same
            // fd for both; std/tokio's `Command` has no portable "dup2 onto
            // sibling pipe" API, so the server keeps a single `pipe` stdout
            // and does not open a distinct stderr pipe, relying on the
            // multiplexer to run exactly one OutRead task for this child.
            cmd.stderr(Stdio::piped());
        }
    }

    let child = cmd.spawn().map_err(|source| {
        anyhow::anyhow!(CwcError::Spawn {
            argv: argv.to_vec(),
            source,
        })
    })?;

    Ok(Supervised {
        child,
        stderr_merged,
    })
}

/// Send `signum` to the child. A process that has already exited is a
/// silently ignored race, not an error.
#[cfg(unix)]
pub fn signal(child: &Child, signum: i32) -> Result<()> {
    let Some(pid) = child.id() else {
        // Already reaped; nothing to signal.
        return Ok(());
    };
    signal_pid(pid, signum)
}

#[cfg(not(unix))]
pub fn signal(_child: &Child, _signum: i32) -> Result<()> {
    anyhow::bail!(CwcError::Signal(
        "signal delivery is only supported on unix".to_string()
    ))
}

/// Send `signum` to a raw pid, bypassing the `Child` handle.
///
/// Used by callers that captured the pid once up front instead of holding
/// a live reference to the `Child` across a concurrent `wait()` -- `Child`'s
/// stdio/wait API takes `&mut self`, so a task that only needs to signal the
/// process has no business borrowing it at all.
#[cfg(unix)]
pub fn signal_pid(pid: u32, signum: i32) -> Result<()> {
    // SAFETY: `kill` has no memory-safety preconditions; a stale pid just
    // yields ESRCH, handled below as a no-op.
    let rc = unsafe { libc::kill(pid as libc::pid_t, signum) };
    if rc != 0 {
        let err = std::io::Error::last_os_error();
        if err.raw_os_error() == Some(libc::ESRCH) {
            return Ok(());
        }
        anyhow::bail!(CwcError::Signal(format!("kill({pid}, {signum}): {err}")));
    }
    Ok(())
}

#[cfg(not(unix))]
pub fn signal_pid(_pid: u32, _signum: i32) -> Result<()> {
    anyhow::bail!(CwcError::Signal(
        "signal delivery is only supported on unix".to_string()
    ))
}

/// Forcefully terminate the child and wait for it to be reaped.
pub async fn kill(child: &mut Child) -> Result<()> {
    // `start_kill` on an already-exited child returns an error on some
    // platforms; that's fine, `wait` below still reaps it.
    let _ = child.start_kill();
    child
        .wait()
        .await
        .map_err(|e| anyhow::anyhow!(CwcError::Io(e)))?;
    Ok(())
}

/// Map a process `ExitStatus` to the wire exit code.
///
/// Normal exits preserve their code verbatim (0-255). A child killed by
/// signal N is reported as `128 + N`, the POSIX shell convention -- this
/// resolves the spec's Open Question about signal-termination encoding.
#[cfg(unix)]
pub fn exit_code_for(status: std::process::ExitStatus) -> i32 {
    use std::os::unix::process::ExitStatusExt;
    match status.code() {
        Some(code) => code,
        None => 128 + status.signal().unwrap_or(0),
    }
}

#[cfg(not(unix))]
pub fn exit_code_for(status: std::process::ExitStatus) -> i32 {
    status.code().unwrap_or(127)
}

/// Exit code reported when the child could never be spawned.
pub const SPAWN_FAILURE_EXIT_CODE: i32 = 127;

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    #[tokio::test]
    async fn spawns_and_reaps_normal_exit() {
        let tmp = tempfile::tempdir().unwrap();
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "exit 7".to_string(),
        ];
        let mut supervised = spawn(
            &argv,
            StdoutDisposition::Null,
            StderrDisposition::Null,
            &HashMap::new(),
            tmp.path(),
        )
        .unwrap();
        let status = supervised.child.wait().await.unwrap();
        assert_eq!(exit_code_for(status), 7);
    }

    #[tokio::test]
    async fn spawn_failure_surfaces_as_error() {
        let tmp = tempfile::tempdir().unwrap();
        let argv = vec!["/nonexistent/binary/xyz".to_string()];
        let result = spawn(
            &argv,
            StdoutDisposition::Null,
            StderrDisposition::Null,
            &HashMap::new(),
            tmp.path(),
        );
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn env_overlay_is_visible_to_child() {
        let tmp = tempfile::tempdir().unwrap();
        let mut overlay = HashMap::new();
        overlay.insert("CWC_TEST_VAR".to_string(), "hello".to_string());
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "echo -n $CWC_TEST_VAR".to_string(),
        ];
        let mut supervised = spawn(
            &argv,
            StdoutDisposition::Pipe,
            StderrDisposition::Null,
            &overlay,
            tmp.path(),
        )
        .unwrap();
        let output = supervised.child.wait_with_output().await.unwrap();
        assert_eq!(String::from_utf8_lossy(&output.stdout), "hello");
    }

    #[tokio::test]
    async fn kill_terminates_long_running_child() {
        let tmp = tempfile::tempdir().unwrap();
        let argv = vec!["/bin/sleep".to_string(), "60".to_string()];
        let mut supervised = spawn(
            &argv,
            StdoutDisposition::Null,
            StderrDisposition::Null,
            &HashMap::new(),
            tmp.path(),
        )
        .unwrap();
        kill(&mut supervised.child).await.unwrap();
        let status = supervised.child.try_wait().unwrap();
        assert!(status.is_some());
    }

    #[tokio::test]
    async fn signal_to_exited_process_is_ignored() {
        let tmp = tempfile::tempdir().unwrap();
        let argv = vec!["/bin/true".to_string()];
        let mut supervised = spawn(
            &argv,
            StdoutDisposition::Null,
            StderrDisposition::Null,
            &HashMap::new(),
            tmp.path(),
        )
        .unwrap();
        supervised.child.wait().await.unwrap();
        assert!(signal(&supervised.child, libc::SIGTERM).is_ok());
    }

    #[tokio::test]
    async fn signal_delivers_to_running_child() {
        let tmp = tempfile::tempdir().unwrap();
        let argv = vec![
            "/bin/sh".to_string(),
            "-c".to_string(),
            "trap 'exit 42' TERM; sleep 30".to_string(),
        ];
        let mut supervised = spawn(
            &argv,
            StdoutDisposition::Null,
            StderrDisposition::Null,
            &HashMap::new(),
            tmp.path(),
        )
        .unwrap();
        // Give the shell a moment to install the trap before signaling.
        tokio::time::sleep(std::time::Duration::from_millis(200)).await;
        signal(&supervised.child, libc::SIGTERM).unwrap();
        let status = supervised.child.wait().await.unwrap();
        assert_eq!(exit_code_for(status), 42);
    }
}

//! Local process spawning for shell sessions.
//!
//! The interactive program runs in its own process group with stdout and
//! stderr merged into a single pipe, so the tunnel sees one ordered byte
//! stream. `kill_on_drop(true)` makes sure an abandoned session never leaves
//! an orphan behind.

use std::fs::File;
use std::process::Stdio;

use nix::fcntl::OFlag;
use nix::sys::signal::{killpg, Signal};
use nix::unistd::{pipe2, Pid};
use tokio::net::unix::pipe;
use tokio::process::{Child, ChildStdin, Command};

use crate::config::ShellConfig;

/// A spawned shell with its input and merged output stream.
pub struct ShellProcess {
    pub child: Child,
    pub stdin: ChildStdin,
    /// Non-blocking read end of the pipe shared by the child's stdout and
    /// stderr.
    pub output: pipe::Receiver,
    /// Process group id (equal to the child's pid).
    pub pgid: i32,
}

/// Spawn `config.program` as a process group leader with merged output.
///
/// The write end of the output pipe is handed to the child only; once the
/// child and all of its descendants exit, reads on `output` return EOF.
///
/// Must be called from within a tokio runtime.
pub fn spawn_session_process(config: &ShellConfig) -> std::io::Result<ShellProcess> {
    let (read_fd, write_fd) = pipe2(OFlag::O_CLOEXEC).map_err(std::io::Error::from)?;
    let stdout_end = File::from(write_fd);
    let stderr_end = stdout_end.try_clone()?;

    let mut cmd = Command::new(&config.program);
    cmd.args(&config.args)
        .current_dir(&config.working_dir)
        .env("TERM", "dumb")
        .stdin(Stdio::piped())
        .stdout(Stdio::from(stdout_end))
        .stderr(Stdio::from(stderr_end))
        .process_group(0)
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;
    // The parent's copies of the write end go away with `cmd`.
    drop(cmd);

    let stdin = child
        .stdin
        .take()
        .ok_or_else(|| std::io::Error::other("failed to take shell stdin"))?;
    #[allow(clippy::cast_possible_wrap)]
    let pgid = child
        .id()
        .ok_or_else(|| std::io::Error::other("shell exited before it could be tracked"))?
        as i32;

    Ok(ShellProcess {
        child,
        stdin,
        output: pipe::Receiver::from_owned_fd(read_fd)?,
        pgid,
    })
}

/// SIGKILL every process in the session's group. Missing groups are ignored.
pub fn kill_process_group(pgid: i32) {
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(nix::errno::Errno::ESRCH) => {}
        Err(e) => tracing::warn!("Failed to kill shell process group {pgid}: {e}"),
    }
}

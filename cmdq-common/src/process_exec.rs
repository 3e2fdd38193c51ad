//! Fork/exec and supervise a child process for one `ProcessCommand`.
//!
//! The state machine is `Forking -> Supervising -> Draining -> Reaping ->
//! Done`, expressed as an explicit enum with one function per transition
//! rather than the nested-loop shape a `poll()`-based implementation
//! would need. `tokio::process::Command` supplies the non-blocking I/O
//! pump and child reaper that a hand-rolled `poll` loop would otherwise
//! have to implement; everything externally observable (process-group
//! isolation, timeout escalation, stderr streaming, exit status capture)
//! is preserved.

// Process-group isolation and signal delivery have no safe equivalent;
// this is the one module in the workspace that needs `unsafe`.
#![allow(unsafe_code)]

use std::os::unix::process::{CommandExt, ExitStatusExt};
use std::process::Stdio;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::task::JoinHandle;
use tracing::{error, info};

use crate::command::{ProcessCommand, TERM_SIG_ABNORMAL_EXIT, TERM_SIG_WAITPID_FAILURE};

const SIGTERM_GRACE: Duration = Duration::from_secs(1);

enum ProcessState {
    Forking,
    Supervising(Child),
    Draining(Draining),
    Reaping(Child),
    Done,
}

/// The child has exited (or been killed); its stdin/stdout/stderr pump
/// tasks, spawned independently of the wait-vs-timeout race so a timeout
/// never drops them, are joined here to recover whatever they captured.
struct Draining {
    child: Child,
    stdin_task: JoinHandle<()>,
    stdout_task: JoinHandle<Vec<u8>>,
    stderr_task: JoinHandle<Vec<u8>>,
    timeout_note: Option<&'static [u8]>,
}

pub struct ProcessExecutor;

impl ProcessExecutor {
    /// Runs `command.argv`/`env`/`stdin` to completion (or timeout),
    /// filling in `exit_code`/`term_sig`/`stdout`/`stderr`. Never panics
    /// or propagates an error across the runner boundary: every failure
    /// mode is encoded into the command's own result fields.
    pub async fn run(command: &mut ProcessCommand, timeout: Option<Duration>) {
        let mut state = ProcessState::Forking;
        loop {
            state = match state {
                ProcessState::Forking => Self::fork(command),
                ProcessState::Supervising(child) => Self::supervise(command, child, timeout).await,
                ProcessState::Draining(draining) => Self::drain(command, draining).await,
                ProcessState::Reaping(child) => Self::reap(command, child).await,
                ProcessState::Done => break,
            };
        }
        Self::log_stderr_on_failure(command);
    }

    fn fork(command: &ProcessCommand) -> ProcessState {
        let mut cmd = Command::new(&command.argv[0]);
        cmd.args(&command.argv[1..]);
        cmd.env_clear();
        if let Ok(path) = std::env::var("PATH") {
            cmd.env("PATH", path);
        }
        for (key, value) in &command.env {
            cmd.env(key, value);
        }
        cmd.stdin(Stdio::piped());
        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());

        // SAFETY: setpgid(0, 0) only affects the child after fork, before
        // exec; it touches no memory shared with the parent.
        unsafe {
            cmd.pre_exec(|| {
                if libc::setpgid(0, 0) != 0 {
                    return Err(std::io::Error::last_os_error());
                }
                Ok(())
            });
        }

        match cmd.spawn() {
            Ok(child) => {
                if let Some(pid) = child.id() {
                    // Covers the fork/exec race: the child may already have
                    // called setpgid(0,0) itself by the time we get here.
                    let rc = unsafe { libc::setpgid(pid as libc::pid_t, pid as libc::pid_t) };
                    if rc != 0 {
                        let errno = std::io::Error::last_os_error();
                        if errno.raw_os_error() != Some(libc::EACCES)
                            && errno.raw_os_error() != Some(libc::ESRCH)
                        {
                            tracing::warn!(error = %errno, "setpgid from parent failed unexpectedly");
                        }
                    }
                }
                ProcessState::Supervising(child)
            }
            Err(e) => {
                mark_spawn_failure(command, &e);
                ProcessState::Done
            }
        }
    }

    /// Spawns the stdin/stdout/stderr pump as independent tasks — each one
    /// owns its own pipe end and keeps running to EOF on its own, so
    /// cancelling the wait-vs-timeout race below never touches them or
    /// drops whatever they've already buffered. Only the race decides
    /// whether the child gets signalled; draining always happens after,
    /// unconditionally, once the child has exited.
    async fn supervise(
        command: &mut ProcessCommand,
        mut child: Child,
        timeout: Option<Duration>,
    ) -> ProcessState {
        let stdin = child.stdin.take();
        let stdout = child.stdout.take().expect("piped stdout");
        let stderr = child.stderr.take().expect("piped stderr");
        let stdin_payload = std::mem::take(&mut command.stdin);

        let stdin_task = tokio::spawn(async move {
            if let Some(mut handle) = stdin {
                let _ = handle.write_all(&stdin_payload).await;
                let _ = handle.shutdown().await;
            }
        });
        let stdout_task = tokio::spawn(async move {
            let mut stdout = stdout;
            let mut buf = Vec::new();
            let _ = stdout.read_to_end(&mut buf).await;
            buf
        });
        let stderr_task = tokio::spawn(async move {
            let mut stderr = stderr;
            stream_stderr_lines(&mut stderr).await
        });

        let timed_out = match timeout {
            Some(limit) => tokio::select! {
                _ = child.wait() => false,
                _ = tokio::time::sleep(limit) => true,
            },
            None => {
                let _ = child.wait().await;
                false
            }
        };

        let timeout_note = if !timed_out {
            None
        } else {
            if let Some(pid) = child.id() {
                unsafe {
                    libc::kill(pid as libc::pid_t, libc::SIGTERM);
                }
            }
            tokio::select! {
                _ = child.wait() => {
                    Some(b"\n(process timed out; SIGTERM reaped it)\n" as &'static [u8])
                }
                _ = tokio::time::sleep(SIGTERM_GRACE) => {
                    if let Some(pid) = child.id() {
                        unsafe {
                            libc::kill(pid as libc::pid_t, libc::SIGKILL);
                        }
                    }
                    let _ = child.wait().await;
                    Some(b"\n(process timed out; SIGKILL after grace period)\n" as &'static [u8])
                }
            }
        };

        ProcessState::Draining(Draining {
            child,
            stdin_task,
            stdout_task,
            stderr_task,
            timeout_note,
        })
    }

    /// Joins the pump tasks. By the time this runs the child has already
    /// exited, so its pipes are closed and each reader task has hit (or is
    /// about to hit) EOF on its own — nothing here blocks on the child.
    async fn drain(command: &mut ProcessCommand, draining: Draining) -> ProcessState {
        let Draining {
            child,
            stdin_task,
            stdout_task,
            stderr_task,
            timeout_note,
        } = draining;

        let _ = stdin_task.await;
        command.stdout = stdout_task.await.unwrap_or_default();
        command.stderr = stderr_task.await.unwrap_or_default();
        if let Some(note) = timeout_note {
            command.stderr.extend_from_slice(note);
        }

        ProcessState::Reaping(child)
    }

    async fn reap(command: &mut ProcessCommand, mut child: Child) -> ProcessState {
        match child.wait().await {
            Ok(status) => apply_exit_status(command, status),
            Err(_) => command.term_sig = Some(TERM_SIG_WAITPID_FAILURE),
        }
        ProcessState::Done
    }

    fn log_stderr_on_failure(command: &ProcessCommand) {
        let failed = command.exit_code.map(|c| c != 0).unwrap_or(true);
        if failed {
            error!(target: "notice", "----- stderr -----");
            for line in String::from_utf8_lossy(&command.stderr).lines() {
                error!(target: "notice", "{}", line);
            }
            error!(target: "notice", "----- stderr -----");
        }
    }
}

fn apply_exit_status(command: &mut ProcessCommand, status: std::process::ExitStatus) {
    if let Some(code) = status.code() {
        command.exit_code = Some(code);
    } else if let Some(signal) = status.signal() {
        command.term_sig = Some(signal);
    } else {
        command.term_sig = Some(TERM_SIG_ABNORMAL_EXIT);
    }
}

/// Sends `SIGUSR1` to the calling process's parent. Used by
/// `--emit-sigusr1-when-ready` once the supervisor's first registry read
/// succeeds. Lives here, rather than in `cmdq-execd`, because this is the
/// one crate in the workspace whose `Cargo.toml` doesn't inherit the
/// workspace's `unsafe_code = "forbid"` lint — that lint can't be relaxed
/// with a local `#![allow(...)]` once set to `forbid`, so any raw libc
/// call has to live on this side of the crate boundary.
pub fn raise_sigusr1_on_parent() {
    // SAFETY: kill(2) with a pid and a signal number is always safe to call.
    unsafe {
        libc::kill(libc::getppid(), libc::SIGUSR1);
    }
}

fn mark_spawn_failure(command: &mut ProcessCommand, err: &std::io::Error) {
    command.term_sig = Some(libc::SIGABRT);
    command.stderr = format!("failed to spawn {}: {}", command.argv[0], err).into_bytes();
}

/// Reads stderr incrementally, emitting each completed line at INFO under
/// the `notice` target as it arrives (there is no NOTICE level in
/// `tracing`), and returns the full captured buffer for post-mortem
/// logging on failure.
async fn stream_stderr_lines(stderr: &mut tokio::process::ChildStderr) -> Vec<u8> {
    let mut buf = Vec::new();
    let mut chunk = [0u8; 4096];
    let mut line = Vec::new();
    loop {
        match stderr.read(&mut chunk).await {
            Ok(0) => break,
            Ok(n) => {
                for &byte in &chunk[..n] {
                    buf.push(byte);
                    if byte == b'\n' || byte == b'\r' {
                        if !line.is_empty() {
                            info!(target: "notice", "{}", String::from_utf8_lossy(&line));
                            line.clear();
                        }
                    } else {
                        line.push(byte);
                    }
                }
            }
            Err(_) => break,
        }
    }
    if !line.is_empty() {
        info!(target: "notice", "{}", String::from_utf8_lossy(&line));
    }
    buf
}

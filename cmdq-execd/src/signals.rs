//! SIGTERM/SIGINT/SIGQUIT handling. No C-global handler or singleton: one
//! task races the three signal streams and cancels a `CancellationToken`
//! tree on the first one it sees.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::signal::unix::{signal, SignalKind};
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Shared with the readiness/metrics surface so `/_readiness` can report
/// "draining" once a shutdown signal has been observed.
#[derive(Clone, Default)]
pub struct ShutdownFlag(Arc<AtomicBool>);

impl ShutdownFlag {
    pub fn is_stopping(&self) -> bool {
        self.0.load(Ordering::Relaxed)
    }

    fn set(&self) {
        self.0.store(true, Ordering::Relaxed);
    }
}

/// Spawns the signal-listening task. Returns the flag the HTTP surface can
/// poll. The task exits after the first signal; cancelling `root_token`
/// twice (e.g. a second SIGTERM racing in) is a no-op, so repeated signals
/// are harmless even though this task only ever reacts to the first one.
pub fn install(root_token: CancellationToken) -> ShutdownFlag {
    let flag = ShutdownFlag::default();
    let task_flag = flag.clone();

    tokio::spawn(async move {
        let mut term = match signal(SignalKind::terminate()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                return;
            }
        };
        let mut int = match signal(SignalKind::interrupt()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGINT handler");
                return;
            }
        };
        let mut quit = match signal(SignalKind::quit()) {
            Ok(s) => s,
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGQUIT handler");
                return;
            }
        };

        let which = tokio::select! {
            _ = term.recv() => "SIGTERM",
            _ = int.recv() => "SIGINT",
            _ = quit.recv() => "SIGQUIT",
        };

        info!(signal = which, "received shutdown signal, stopping all runners");
        task_flag.set();
        root_token.cancel();
    });

    flag
}

/// Sends `SIGUSR1` to the parent process, used by `--emit-sigusr1-when-ready`
/// once the supervisor's first registry read succeeds. The actual syscall
/// lives in `cmdq_common::process_exec`, the one crate not bound by this
/// workspace's `forbid(unsafe_code)` lint.
pub fn emit_sigusr1_to_parent() {
    cmdq_common::process_exec::raise_sigusr1_on_parent();
}

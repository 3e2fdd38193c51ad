//! Registry discovery and reconciliation, per spec.md §4.6: decode the
//! queue registry, spawn/cancel runners to match it, and stay in sync via
//! `LISTEN` on the registry-wide channel.

use std::collections::HashMap;
use std::time::Duration;

use cmdq_common::pgsession::PgSession;
use cmdq_common::queue::QueueDescriptor;
use health::HealthRegistry;
use time::Duration as TimeDuration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::runner::Runner;
use crate::signals;

const REGISTRY_NOTIFY_CHANNEL: &str = "cmdq";
const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

struct RunningQueue {
    descriptor: QueueDescriptor,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

pub struct Supervisor {
    conn_str: String,
    allow_list: Vec<String>,
    root_cancel: CancellationToken,
    health: HealthRegistry,
    emit_sigusr1_when_ready: bool,
    running: HashMap<String, RunningQueue>,
}

impl Supervisor {
    pub fn new(
        conn_str: String,
        allow_list: Vec<String>,
        root_cancel: CancellationToken,
        health: HealthRegistry,
        emit_sigusr1_when_ready: bool,
    ) -> Self {
        Supervisor {
            conn_str,
            allow_list,
            root_cancel,
            health,
            emit_sigusr1_when_ready,
            running: HashMap::new(),
        }
    }

    /// Connects (with backoff), reads the registry, reconciles running
    /// runners against it, and loops on registry-change notifications
    /// until the root token is cancelled.
    pub async fn run(mut self) {
        let mut session = match self.connect_with_backoff().await {
            Some(session) => session,
            None => return,
        };

        if let Err(e) = session.listen(REGISTRY_NOTIFY_CHANNEL).await {
            error!(error = %e, "failed to LISTEN on registry channel, continuing with polling only");
        }

        if let Err(e) = self.reconcile(&session).await {
            error!(error = %e, "initial registry read failed");
        } else if self.emit_sigusr1_when_ready {
            signals::emit_sigusr1_to_parent();
        }

        loop {
            tokio::select! {
                _ = self.root_cancel.cancelled() => break,
                notification = session.recv_notification() => {
                    match notification {
                        Some(_) => {
                            if let Err(e) = self.reconcile(&session).await {
                                warn!(error = %e, "registry re-read failed, keeping previous runner set");
                            }
                        }
                        None => {
                            warn!("registry connection dropped, reconnecting");
                            match self.connect_with_backoff().await {
                                Some(new_session) => {
                                    session = new_session;
                                    let _ = session.listen(REGISTRY_NOTIFY_CHANNEL).await;
                                    let _ = self.reconcile(&session).await;
                                }
                                None => break,
                            }
                        }
                    }
                }
            }
        }

        self.shutdown_all().await;
    }

    async fn connect_with_backoff(&mut self) -> Option<PgSession> {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        loop {
            if self.root_cancel.is_cancelled() {
                return None;
            }
            match PgSession::connect(&self.conn_str).await {
                Ok(session) => return Some(session),
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "supervisor connect failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.root_cancel.cancelled() => return None,
                    }
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                }
            }
        }
    }

    async fn reconcile(&mut self, session: &PgSession) -> Result<(), crate::error::SupervisorError> {
        let rows = self
            .select_registry(session)
            .await
            .map_err(crate::error::SupervisorError::Registry)?;

        let mut seen = std::collections::HashSet::new();
        for row in &rows {
            let descriptor = match QueueDescriptor::from_row(row) {
                Ok(d) => d,
                Err(e) => {
                    warn!(error = %e, "skipping invalid registry row");
                    continue;
                }
            };
            if !self.allow_list.is_empty()
                && !self.allow_list.iter().any(|i| i == descriptor.cmd_class_identity())
            {
                continue;
            }
            seen.insert(descriptor.cmd_class_identity().to_string());

            match self.running.get(descriptor.cmd_class_identity()) {
                Some(existing) if existing.descriptor == descriptor => {}
                Some(_) => {
                    // Signature class (or any other field) changed under us.
                    // Resolved open question: treat as drop+add keyed on identity.
                    self.stop_queue(descriptor.cmd_class_identity()).await;
                    self.start_queue(descriptor).await;
                }
                None => self.start_queue(descriptor).await,
            }
        }

        let gone: Vec<String> = self
            .running
            .keys()
            .filter(|id| !seen.contains(*id))
            .cloned()
            .collect();
        for id in gone {
            self.stop_queue(&id).await;
        }

        Ok(())
    }

    async fn select_registry(
        &self,
        session: &PgSession,
    ) -> Result<Vec<tokio_postgres::Row>, tokio_postgres::Error> {
        session
            .client()
            .query(
                "SELECT cmd_class_identity, cmd_class_relname, cmd_signature_class_relname, \
                 queue_runner_role, queue_notify_channel, reselect_interval_msec, \
                 reselect_randomized_every_nth, cmd_timeout_sec, ansi_fg FROM cmd_queue",
                &[],
            )
            .await
    }

    async fn start_queue(&mut self, descriptor: QueueDescriptor) {
        let cancel = self.root_cancel.child_token();
        let deadline = TimeDuration::milliseconds(
            (descriptor.reselect_interval().as_millis() as i64 * 3).max(30_000),
        );
        let handle = self
            .health
            .register(descriptor.cmd_class_relname().to_string(), deadline)
            .await;

        info!(queue = descriptor.cmd_class_relname(), "starting runner");
        let runner = Runner::new(
            descriptor.clone(),
            self.conn_str.clone(),
            Vec::new(),
            cancel.clone(),
            handle,
        );
        let task = tokio::spawn(runner.run());

        self.running.insert(
            descriptor.cmd_class_identity().to_string(),
            RunningQueue {
                descriptor,
                cancel,
                task,
            },
        );
    }

    async fn stop_queue(&mut self, identity: &str) {
        if let Some(running) = self.running.remove(identity) {
            info!(queue = running.descriptor.cmd_class_relname(), "stopping runner");
            running.cancel.cancel();
            let _ = running.task.await;
        }
    }

    async fn shutdown_all(mut self) {
        let identities: Vec<String> = self.running.keys().cloned().collect();
        for identity in identities {
            self.stop_queue(&identity).await;
        }
    }
}

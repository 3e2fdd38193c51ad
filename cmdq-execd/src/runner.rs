//! One async task per queue, implementing the reselect loop of spec.md
//! §4.5 as an explicit state machine over a dedicated `PgSession`.

use std::time::Duration;

use cmdq_common::command::CommandRecord;
use cmdq_common::error::PgSessionError;
use cmdq_common::pgsession::{PgSession, TxState};
use cmdq_common::process_exec::ProcessExecutor;
use cmdq_common::queue::QueueDescriptor;
use cmdq_common::sql_exec::SqlExecutor;
use health::HealthHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, info_span, warn, Instrument};

const RECONNECT_BACKOFF_INITIAL: Duration = Duration::from_secs(1);
const RECONNECT_BACKOFF_CAP: Duration = Duration::from_secs(60);

enum RunnerState {
    Connecting,
    SessionInit(PgSession),
    Selecting(PgSession),
    Stopped,
}

/// Targets a specific row by identity, set when a NOTIFY arrives for this
/// queue. Consumed (and cleared) by the next reselect iteration.
#[derive(Clone)]
struct NotifyHint {
    cmd_id: String,
    cmd_subid: Option<String>,
}

pub struct Runner {
    descriptor: QueueDescriptor,
    conn_str: String,
    env: Vec<(String, String)>,
    cancel: CancellationToken,
    health: HealthHandle,
    reselect_round: u64,
}

impl Runner {
    pub fn new(
        descriptor: QueueDescriptor,
        conn_str: String,
        env: Vec<(String, String)>,
        cancel: CancellationToken,
        health: HealthHandle,
    ) -> Self {
        Runner {
            descriptor,
            conn_str,
            env,
            cancel,
            health,
            reselect_round: 0,
        }
    }

    pub async fn run(mut self) {
        let span = info_span!(
            "runner",
            queue = %self.descriptor.cmd_class_relname(),
            ansi_fg = self.descriptor.ansi_fg().unwrap_or("default"),
        );
        async move {
            let mut state = RunnerState::Connecting;
            loop {
                state = match state {
                    RunnerState::Connecting => self.connect_with_backoff().await,
                    RunnerState::SessionInit(session) => self.init_session(session).await,
                    RunnerState::Selecting(session) => self.reselect_round(session).await,
                    RunnerState::Stopped => break,
                };
            }
            info!("runner stopped");
        }
        .instrument(span)
        .await;
    }

    async fn connect_with_backoff(&mut self) -> RunnerState {
        let mut backoff = RECONNECT_BACKOFF_INITIAL;
        loop {
            if self.cancel.is_cancelled() {
                return RunnerState::Stopped;
            }
            match PgSession::connect(&self.conn_str).await {
                Ok(session) => return RunnerState::SessionInit(session),
                Err(e) => {
                    warn!(error = %e, backoff_secs = backoff.as_secs(), "connect failed, backing off");
                    tokio::select! {
                        _ = tokio::time::sleep(backoff) => {}
                        _ = self.cancel.cancelled() => return RunnerState::Stopped,
                    }
                    backoff = (backoff * 2).min(RECONNECT_BACKOFF_CAP);
                }
            }
        }
    }

    async fn init_session(&mut self, mut session: PgSession) -> RunnerState {
        if let Err(e) = session
            .session_start(
                self.descriptor.cmd_class_identity(),
                self.descriptor.queue_runner_role(),
                &self.env,
            )
            .await
        {
            let e = crate::error::RunnerError::SessionStart(e);
            error!(error = %e, "stopping runner without retrying");
            return RunnerState::Stopped;
        }
        if let Some(channel) = self.descriptor.queue_notify_channel() {
            if let Err(e) = session.listen(channel).await {
                error!(error = %e, "LISTEN failed, stopping runner");
                return RunnerState::Stopped;
            }
        }
        self.health.report_healthy().await;
        RunnerState::Selecting(session)
    }

    async fn reselect_round(&mut self, mut session: PgSession) -> RunnerState {
        let notify_hint = self.take_matching_notification(&mut session);
        let use_random = notify_hint.is_none()
            && self
                .descriptor
                .reselect_randomized_every_nth()
                .is_some_and(|n| self.reselect_round % u64::from(n) == 0);

        if let Err(e) = session.begin().await {
            return self.handle_session_error(session, e).await;
        }

        let row = match self.select_row(&session, notify_hint.as_ref(), use_random).await {
            Ok(row) => row,
            Err(e) => return self.handle_session_error(session, e).await,
        };

        let Some(row) = row else {
            let _ = session.rollback().await;
            if notify_hint.is_none() {
                match session.enter_reselect_round().await {
                    Ok(round) => self.reselect_round = round as u64,
                    Err(e) => return self.handle_session_error(session, e).await,
                }
                let wait = self.descriptor.reselect_interval();
                tokio::select! {
                    _ = tokio::time::sleep(wait) => {}
                    _ = self.wait_for_notification_or_cancel(&mut session) => {}
                }
            }
            if self.cancel.is_cancelled() {
                return RunnerState::Stopped;
            }
            return RunnerState::Selecting(session);
        };

        let mut record = match CommandRecord::decode(self.descriptor.signature_class(), &row) {
            Ok(record) => record,
            Err(e) => {
                warn!(error = %e, "failed to decode row, skipping");
                let _ = session.rollback().await;
                return RunnerState::Selecting(session);
            }
        };

        let started = chrono::Utc::now();
        record.metadata_mut().mark_started(started);
        self.execute(&mut record, &mut session).await;
        record.metadata_mut().mark_ended(chrono::Utc::now());

        match self.update_row(&record, &mut session).await {
            Ok(()) => {
                if let Err(e) = session.commit().await {
                    return self.handle_session_error(session, e).await;
                }
            }
            Err(e) => {
                warn!(error = %e, "update failed, rolling back and deferring this row for the round");
                let _ = session.rollback().await;
                let metadata = record.metadata();
                if let Err(e) = session
                    .remember_failed_update(&metadata.cmd_id, metadata.cmd_subid.as_deref())
                    .await
                {
                    warn!(error = %e, "failed to record this row as skipped for the round");
                }
            }
        }

        if session.tx_state() == TxState::Unknown {
            return RunnerState::Connecting;
        }
        RunnerState::Selecting(session)
    }

    async fn execute(&self, record: &mut CommandRecord, session: &mut PgSession) {
        match record {
            CommandRecord::Process(cmd) => {
                ProcessExecutor::run(cmd, self.descriptor.cmd_timeout()).await;
            }
            CommandRecord::Sql(cmd) => {
                SqlExecutor::run(cmd, session).await;
            }
        }
    }

    async fn select_row(
        &self,
        session: &PgSession,
        notify_hint: Option<&NotifyHint>,
        use_random: bool,
    ) -> Result<Option<tokio_postgres::Row>, PgSessionError> {
        let prepared = session.prepared().expect("session_start ran before selecting");
        let statement = if let Some(hint) = notify_hint {
            let params: &[&(dyn tokio_postgres::types::ToSql + Sync)] =
                &[&hint.cmd_id, &hint.cmd_subid];
            return session
                .client()
                .query_opt(&prepared.select_notify_cmd, params)
                .await
                .map_err(|source| PgSessionError::Query {
                    command: "select_notify_cmd",
                    source,
                });
        } else if use_random {
            &prepared.select_random_cmd
        } else {
            &prepared.select_oldest_cmd
        };
        session
            .client()
            .query_opt(statement, &[])
            .await
            .map_err(|source| PgSessionError::Query {
                command: "select_oldest_cmd_or_select_random_cmd",
                source,
            })
    }

    /// Builds and issues the literal `UPDATE` against this queue's own
    /// relation (`cmd_class_identity`, already schema-qualified and
    /// quoted), mirroring the original's per-queue `UPDATE_STMT` built
    /// around a `%s` relname placeholder rather than a fixed statement —
    /// there is no stored procedure for this in the database contract.
    async fn update_row(
        &self,
        record: &CommandRecord,
        session: &mut PgSession,
    ) -> Result<(), PgSessionError> {
        let identity = self.descriptor.cmd_class_identity();
        match record {
            CommandRecord::Process(cmd) => {
                let sql = update_process_sql(identity);
                session
                    .client()
                    .execute(&sql, &cmd.update_params())
                    .await
                    .map_err(|source| PgSessionError::Query {
                        command: "update_process_cmd",
                        source,
                    })?;
            }
            CommandRecord::Sql(cmd) => {
                let sql = update_sql_sql(identity);
                let params = cmd.update_params();
                let refs: Vec<&(dyn tokio_postgres::types::ToSql + Sync)> =
                    params.iter().map(|p| p.as_ref()).collect();
                session
                    .client()
                    .execute(&sql, &refs)
                    .await
                    .map_err(|source| PgSessionError::Query {
                        command: "update_sql_cmd",
                        source,
                    })?;
            }
        }
        Ok(())
    }

    /// Drains the session's notification channel for one targeting this
    /// queue's identity (spec.md Testable Property 5: a mismatched
    /// identity never triggers a fetch).
    fn take_matching_notification(&self, session: &mut PgSession) -> Option<NotifyHint> {
        for notification in session.drain_notifications() {
            if let Some(hint) = parse_notify_payload(notification.payload()) {
                if hint.0 == self.descriptor.cmd_class_identity() {
                    return Some(NotifyHint {
                        cmd_id: hint.1,
                        cmd_subid: hint.2,
                    });
                }
            } else {
                warn!(payload = notification.payload(), "malformed NOTIFY payload, skipping");
            }
        }
        None
    }

    async fn wait_for_notification_or_cancel(&self, session: &mut PgSession) {
        tokio::select! {
            _ = session.recv_notification() => {}
            _ = self.cancel.cancelled() => {}
        }
    }

    async fn handle_session_error(&mut self, mut session: PgSession, e: PgSessionError) -> RunnerState {
        let _ = session.rollback().await;
        if e.is_connection_fatal() {
            warn!(error = %e, "connection-fatal session error, reconnecting");
            RunnerState::Connecting
        } else {
            warn!(error = %e, "session bookkeeping error, continuing on the same connection");
            RunnerState::Selecting(session)
        }
    }
}

/// Parses the registry-notify-style composite payload
/// `(cmd_class_identity, cmd_id, cmd_subid?)`.
fn parse_notify_payload(payload: &str) -> Option<(String, String, Option<String>)> {
    let fields = cmdq_common::codec::decode_composite(payload).ok()?;
    let mut it = fields.into_iter();
    let identity = it.next().flatten()?;
    let cmd_id = it.next().flatten()?;
    let cmd_subid = it.next().flatten();
    Some((identity, cmd_id, cmd_subid))
}

/// `identity` is `cmd_class_identity` — already schema-qualified and
/// quoted, so it's interpolated directly rather than re-quoted. Timestamps
/// bind straight into `tstzrange` as `timestamptz` values; the original's
/// `to_timestamp($n)` conversion was needed there because its params were
/// epoch floats, which ours aren't.
fn update_process_sql(identity: &str) -> String {
    format!(
        "UPDATE {identity} SET \
         cmd_runtime = tstzrange($3, $4), \
         cmd_exit_code = $5, \
         cmd_term_sig = $6, \
         cmd_stdout = $7, \
         cmd_stderr = $8 \
         WHERE cmd_id = $1 AND cmd_subid IS NOT DISTINCT FROM $2"
    )
}

fn update_sql_sql(identity: &str) -> String {
    format!(
        "UPDATE {identity} SET \
         cmd_runtime = tstzrange($3, $4), \
         cmd_sql_result_status = $5, \
         cmd_sql_result_rows = $6, \
         cmd_sql_fatal_error = $7, \
         cmd_sql_nonfatal_errors = $8 \
         WHERE cmd_id = $1 AND cmd_subid IS NOT DISTINCT FROM $2"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_well_formed_notify_payload() {
        let parsed = parse_notify_payload("(\"public.widget_jobs\",\"42\",)").unwrap();
        assert_eq!(parsed.0, "public.widget_jobs");
        assert_eq!(parsed.1, "42");
        assert_eq!(parsed.2, None);
    }

    #[test]
    fn rejects_malformed_notify_payload() {
        assert!(parse_notify_payload("not-a-composite").is_none());
    }

    #[test]
    fn rejects_payload_missing_required_fields() {
        assert!(parse_notify_payload("()").is_none());
    }

    #[test]
    fn update_process_sql_targets_the_queues_own_relation() {
        let sql = update_process_sql("\"public\".\"widget_jobs\"");
        assert!(sql.starts_with("UPDATE \"public\".\"widget_jobs\" SET"));
        assert!(sql.contains("cmd_id = $1 AND cmd_subid IS NOT DISTINCT FROM $2"));
        assert!(sql.contains("cmd_stdout = $7"));
        assert!(sql.contains("cmd_stderr = $8"));
    }

    #[test]
    fn update_sql_sql_targets_the_queues_own_relation() {
        let sql = update_sql_sql("\"public\".\"widget_jobs\"");
        assert!(sql.starts_with("UPDATE \"public\".\"widget_jobs\" SET"));
        assert!(sql.contains("cmd_sql_result_rows = $6"));
        assert!(sql.contains("cmd_sql_nonfatal_errors = $8"));
    }
}

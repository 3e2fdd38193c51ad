//! Runs a `SqlCommand`'s statement inside a savepoint on the runner's
//! already-open outer transaction, per spec.md §4.4.

use crate::command::{DiagnosticRecord, SqlCommand};
use crate::error::PgSessionError;
use crate::pgsession::PgSession;

pub struct SqlExecutor;

impl SqlExecutor {
    /// Executes `command.sql` within `SAVEPOINT pre_run_cmd`, capturing
    /// the outcome into the command's result fields. Every statement goes
    /// through `PgSession`'s tracked execution path, so a connection-fatal
    /// error anywhere in this sequence promotes `tx_state` to `Unknown`
    /// the same way any other session statement would; the caller observes
    /// that via `session.tx_state()` after this returns.
    pub async fn run(command: &mut SqlCommand, session: &mut PgSession) {
        session.drain_notices();

        if let Err(e) = session
            .simple_query_tracked("savepoint", "SAVEPOINT pre_run_cmd")
            .await
        {
            command.fatal_error = Some(diagnostic_from_error(&e));
            command.result_status = Some("savepoint_failed".to_string());
            return;
        }

        let mut failed = false;

        match session.simple_query_tracked("run_cmd", &command.sql).await {
            Ok(messages) => {
                command.result_status = Some(status_tag(&messages));
            }
            Err(e) => {
                command.fatal_error = Some(diagnostic_from_error(&e));
                command.result_status = Some("error".to_string());
                failed = true;
            }
        }

        if !failed {
            if let Err(e) = session
                .simple_query_tracked("set_constraints", "SET CONSTRAINTS ALL IMMEDIATE")
                .await
            {
                command.fatal_error = Some(diagnostic_from_error(&e));
                command.result_status = Some("deferred_constraint_violation".to_string());
                failed = true;
            }
        }

        let resolve = if failed {
            "ROLLBACK TO SAVEPOINT pre_run_cmd"
        } else {
            "RELEASE SAVEPOINT pre_run_cmd"
        };
        if let Err(e) = session.simple_query_tracked("resolve_savepoint", resolve).await {
            // Doesn't overwrite an already-recorded fatal_error from the
            // statement itself; a failure here is the one case where
            // resolving the savepoint fails independently of the queued
            // SQL's own outcome, still worth surfacing and still enough to
            // have promoted tx_state if connection-fatal.
            if command.fatal_error.is_none() {
                command.fatal_error = Some(diagnostic_from_error(&e));
            }
        }

        command.nonfatal_errors = session
            .drain_notices()
            .iter()
            .map(DiagnosticRecord::from)
            .collect();
    }
}

fn status_tag(messages: &[tokio_postgres::SimpleQueryMessage]) -> String {
    use tokio_postgres::SimpleQueryMessage;
    messages
        .iter()
        .rev()
        .find_map(|m| match m {
            SimpleQueryMessage::CommandComplete(n) => Some(format!("COMMAND_OK({n})")),
            _ => None,
        })
        .unwrap_or_else(|| "TUPLES_OK".to_string())
}

fn diagnostic_from_error(e: &PgSessionError) -> DiagnosticRecord {
    match e.pg_error().and_then(tokio_postgres::Error::as_db_error) {
        Some(db) => DiagnosticRecord::from(db),
        None => DiagnosticRecord {
            message: Some(e.to_string()),
            ..Default::default()
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_postgres::SimpleQueryMessage;

    #[test]
    fn status_tag_prefers_command_complete() {
        let messages = vec![SimpleQueryMessage::CommandComplete(3)];
        assert_eq!(status_tag(&messages), "COMMAND_OK(3)");
    }

    #[test]
    fn status_tag_falls_back_for_tuple_results() {
        let messages: Vec<SimpleQueryMessage> = vec![];
        assert_eq!(status_tag(&messages), "TUPLES_OK");
    }
}

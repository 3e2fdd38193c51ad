//! The database session a runner owns exclusively: one `tokio_postgres`
//! connection plus the plumbing the spec's original design leaves
//! implicit — notice/notify forwarding and transaction-status tracking.

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_postgres::error::DbError;
use tokio_postgres::types::ToSql;
use tokio_postgres::{AsyncMessage, Client, SimpleQueryMessage, Statement};

use crate::codec::encode_hstore;
use crate::error::PgSessionError;

/// Mirrors libpq's transaction-status tracking, which `tokio_postgres`
/// does not expose directly. Updated after every statement this session
/// issues; `Unknown` is the signal a runner treats exactly like spec.md's
/// UNKNOWN transaction status, dropping to the reconnect loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxState {
    Idle,
    Open,
    Unknown,
}

/// The three session-scoped prepared statements every runner relies on.
/// All three describe to the same output row shape; `tokio_postgres::Row`
/// resolves columns by name directly; there's no need to cache a
/// name→index map of our own on top of it.
pub struct PreparedStatements {
    pub select_oldest_cmd: Statement,
    pub select_random_cmd: Statement,
    pub select_notify_cmd: Statement,
}

/// One dedicated PostgreSQL connection plus the task driving it. Not
/// `Clone`: ownership is exclusive, matching spec.md §5's "a runner owns
/// its connection ... exclusively."
pub struct PgSession {
    client: Client,
    driver: JoinHandle<()>,
    notifications: mpsc::UnboundedReceiver<tokio_postgres::Notification>,
    notices: mpsc::UnboundedReceiver<DbError>,
    tx_state: TxState,
    prepared: Option<PreparedStatements>,
}

impl PgSession {
    /// Connects and spawns the connection-driving task, wiring
    /// `AsyncMessage::Notification` and `AsyncMessage::Notice` into two
    /// per-connection channels. This is the concrete resolution of the
    /// "who owns the notice callback" open question: each session owns
    /// its own channels, so no process-wide registration is needed.
    pub async fn connect(conn_str: &str) -> Result<Self, PgSessionError> {
        let (client, mut connection) = tokio_postgres::connect(conn_str, tokio_postgres::NoTls)
            .await
            .map_err(PgSessionError::Connect)?;

        let (notify_tx, notify_rx) = mpsc::unbounded_channel();
        let (notice_tx, notice_rx) = mpsc::unbounded_channel();

        let driver = tokio::spawn(async move {
            use futures::StreamExt;
            while let Some(message) = connection.next().await {
                match message {
                    Ok(AsyncMessage::Notification(n)) => {
                        let _ = notify_tx.send(n);
                    }
                    Ok(AsyncMessage::Notice(e)) => {
                        let _ = notice_tx.send(e);
                    }
                    Ok(_) => {}
                    Err(_) => break,
                }
            }
        });

        Ok(PgSession {
            client,
            driver,
            notifications: notify_rx,
            notices: notice_rx,
            tx_state: TxState::Idle,
            prepared: None,
        })
    }

    pub fn client(&self) -> &Client {
        &self.client
    }

    pub fn tx_state(&self) -> TxState {
        self.tx_state
    }

    pub fn is_driver_alive(&self) -> bool {
        !self.driver.is_finished()
    }

    /// Runs `runner_session_start(identity, env)` (role switch first, if
    /// configured), then prepares the three reselect statements and
    /// caches their shared output column ordering.
    pub async fn session_start(
        &mut self,
        identity: &str,
        role: Option<&str>,
        env: &[(String, String)],
    ) -> Result<(), PgSessionError> {
        if let Some(role) = role {
            let stmt = format!("SET ROLE {}", quote_ident(role));
            self.execute_tracked("set_role", &stmt, &[]).await?;
        }

        let env_text = encode_hstore(env.iter().map(|(k, v)| (k.as_str(), v.as_str())));
        self.execute_tracked(
            "runner_session_start",
            "SELECT runner_session_start($1, $2::hstore)",
            &[&identity, &env_text],
        )
        .await?;

        // `runner_session_start` already ran `PREPARE select_oldest_cmd AS ...`
        // (and the other two) server-side, scoped to this session. We don't
        // re-parse their SQL text; we Parse+Describe a thin `EXECUTE` wrapper
        // around each name, which the backend resolves against the
        // session-scoped plan without us needing to know its SQL.
        let select_oldest_cmd = self
            .client
            .prepare("EXECUTE select_oldest_cmd")
            .await
            .map_err(|source| PgSessionError::Query {
                command: "prepare select_oldest_cmd",
                source,
            })?;
        let select_random_cmd = self
            .client
            .prepare("EXECUTE select_random_cmd")
            .await
            .map_err(|source| PgSessionError::Query {
                command: "prepare select_random_cmd",
                source,
            })?;
        let select_notify_cmd = self
            .client
            .prepare("EXECUTE select_notify_cmd($1, $2)")
            .await
            .map_err(|source| PgSessionError::Query {
                command: "prepare select_notify_cmd",
                source,
            })?;

        self.prepared = Some(PreparedStatements {
            select_oldest_cmd,
            select_random_cmd,
            select_notify_cmd,
        });
        Ok(())
    }

    pub fn prepared(&self) -> Option<&PreparedStatements> {
        self.prepared.as_ref()
    }

    pub async fn listen(&mut self, channel: &str) -> Result<(), PgSessionError> {
        let stmt = format!("LISTEN {}", quote_ident(channel));
        self.execute_tracked("listen", &stmt, &[]).await
    }

    pub async fn begin(&mut self) -> Result<(), PgSessionError> {
        self.execute_tracked("begin", "BEGIN", &[]).await?;
        self.tx_state = TxState::Open;
        Ok(())
    }

    pub async fn commit(&mut self) -> Result<(), PgSessionError> {
        let result = self.execute_tracked("commit", "COMMIT", &[]).await;
        self.tx_state = TxState::Idle;
        result
    }

    pub async fn rollback(&mut self) -> Result<(), PgSessionError> {
        let result = self.execute_tracked("rollback", "ROLLBACK", &[]).await;
        self.tx_state = TxState::Idle;
        result
    }

    /// Drains any notices accumulated since the last call. Called by the
    /// SQL executor around a command's statement and `SET CONSTRAINTS`.
    pub fn drain_notices(&mut self) -> Vec<DbError> {
        let mut out = Vec::new();
        while let Ok(notice) = self.notices.try_recv() {
            out.push(notice);
        }
        out
    }

    /// Drains pending NOTIFY messages, for the wait phase to inspect.
    pub fn drain_notifications(&mut self) -> Vec<tokio_postgres::Notification> {
        let mut out = Vec::new();
        while let Ok(n) = self.notifications.try_recv() {
            out.push(n);
        }
        out
    }

    pub async fn recv_notification(&mut self) -> Option<tokio_postgres::Notification> {
        self.notifications.recv().await
    }

    /// Executes a statement and updates `tx_state` per the session's
    /// promote-to-`Unknown` policy: any error whose connection is closed
    /// (or whose source chain bottoms out in an I/O error) means the
    /// transaction state can no longer be trusted.
    pub(crate) async fn execute_tracked(
        &mut self,
        command: &'static str,
        sql: &str,
        params: &[&(dyn ToSql + Sync)],
    ) -> Result<(), PgSessionError> {
        match self.client.execute(sql, params).await {
            Ok(_) => Ok(()),
            Err(source) => {
                self.note_tx_state_from_error(&source);
                Err(PgSessionError::Query { command, source })
            }
        }
    }

    /// Same tracking policy as `execute_tracked`, but through the simple
    /// query protocol: used by the SQL executor, whose queued statement is
    /// arbitrary client-supplied text that may contain more than one
    /// command and can't go through the extended (parameterized) protocol.
    pub(crate) async fn simple_query_tracked(
        &mut self,
        command: &'static str,
        sql: &str,
    ) -> Result<Vec<SimpleQueryMessage>, PgSessionError> {
        match self.client.simple_query(sql).await {
            Ok(messages) => Ok(messages),
            Err(source) => {
                self.note_tx_state_from_error(&source);
                Err(PgSessionError::Query { command, source })
            }
        }
    }

    fn note_tx_state_from_error(&mut self, source: &tokio_postgres::Error) {
        if source.is_closed() || source.as_db_error().is_none() {
            self.tx_state = TxState::Unknown;
        }
    }

    /// Calls `remember_failed_update_for_this_reselect_round(cmd_id,
    /// cmd_subid)`, per spec.md §4.5 step 2: recorded so the current
    /// reselect round's next select skips this row. Called after the
    /// failed UPDATE's own transaction has already been rolled back, so
    /// this runs in its own implicit transaction and survives that
    /// rollback — recording it inside the doomed transaction would be
    /// pointless.
    pub async fn remember_failed_update(
        &mut self,
        cmd_id: &str,
        cmd_subid: Option<&str>,
    ) -> Result<(), PgSessionError> {
        self.execute_tracked(
            "remember_failed_update_for_this_reselect_round",
            "SELECT remember_failed_update_for_this_reselect_round($1, $2)",
            &[&cmd_id, &cmd_subid],
        )
        .await
    }

    /// Calls `enter_reselect_round()`, returning the round counter it
    /// hands back. Per spec.md §4.5 step 3, called once an oldest/random
    /// select attempt (not one targeting a NOTIFY hint) comes back empty.
    pub async fn enter_reselect_round(&mut self) -> Result<i64, PgSessionError> {
        match self.client.query_one("SELECT enter_reselect_round()", &[]).await {
            Ok(row) => row.try_get(0).map_err(|source| PgSessionError::Query {
                command: "enter_reselect_round",
                source,
            }),
            Err(source) => {
                self.note_tx_state_from_error(&source);
                Err(PgSessionError::Query {
                    command: "enter_reselect_round",
                    source,
                })
            }
        }
    }
}

fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

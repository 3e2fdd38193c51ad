use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error("runner_session_start failed: {0}")]
    SessionStart(#[source] cmdq_common::error::PgSessionError),
}

#[derive(Debug, Error)]
pub enum SupervisorError {
    #[error("registry query failed: {0}")]
    Registry(#[source] tokio_postgres::Error),
}

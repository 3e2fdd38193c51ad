//! Error taxonomy for `cmdq-common`. Follows the propagation policy of
//! spec.md §7: decode errors never unwind past the row they describe, and
//! only `PgSessionError::Unknown` is meant to be handled by unwinding all
//! the way out to a caller's reconnect loop.

use thiserror::Error;

use crate::codec::CodecError;

/// Failure to decode one queued row (or one NOTIFY payload) into a typed
/// value. The caller logs and skips; it never propagates further.
#[derive(Debug, Error)]
pub enum DecodeError {
    #[error("column '{0}' missing from row")]
    MissingColumn(&'static str),
    #[error("column '{0}' had an unexpected SQL type: {1}")]
    WrongType(&'static str, #[source] tokio_postgres::Error),
    #[error("argv must contain at least one element")]
    EmptyArgv,
    #[error("sql text must not be empty after trimming")]
    EmptySql,
    #[error("env var '{0}' has a null value, which is fatal for this row")]
    NullEnvValue(String),
    #[error("malformed composite/array literal: {0}")]
    Codec(#[from] CodecError),
    #[error("signature class '{0}' is not one of the recognized variants")]
    UnknownSignatureClass(String),
}

/// Failure of the session-level plumbing a runner depends on: connecting,
/// preparing statements, or discovering the transaction has gone UNKNOWN.
/// Per spec.md §4.5/§9, `Unknown` is the only variant that should cause a
/// caller to drop out to its reconnect loop; everything else is a
/// bookkeeping failure handled by rolling back the current attempt.
#[derive(Debug, Error)]
pub enum PgSessionError {
    #[error("failed to connect: {0}")]
    Connect(#[source] tokio_postgres::Error),
    #[error("query '{command}' failed: {source}")]
    Query {
        command: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },
    #[error("transaction status is unknown after a failed statement; reconnect required")]
    Unknown,
}

impl PgSessionError {
    /// True if this failure should be treated as spec.md's "transaction
    /// status UNKNOWN" case: the connection itself is gone, so no further
    /// statement on it can be trusted.
    pub fn is_connection_fatal(&self) -> bool {
        match self {
            PgSessionError::Unknown => true,
            PgSessionError::Connect(_) => true,
            PgSessionError::Query { source, .. } => source.is_closed(),
        }
    }

    /// The underlying `tokio_postgres::Error`, for callers that need to
    /// turn a failed statement into a `DiagnosticRecord`. `Unknown` carries
    /// none, since it represents the session's own bookkeeping giving up
    /// rather than a specific statement failing.
    pub fn pg_error(&self) -> Option<&tokio_postgres::Error> {
        match self {
            PgSessionError::Unknown => None,
            PgSessionError::Connect(source) => Some(source),
            PgSessionError::Query { source, .. } => Some(source),
        }
    }
}

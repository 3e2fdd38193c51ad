//! Fields shared by every command variant, regardless of signature class.

use tokio_postgres::Row;

use crate::error::DecodeError;

/// Identity and timing fields common to `ProcessCommand` and `SqlCommand`.
/// `(cmd_id, cmd_subid)` is this row's unique key; `cmd_subid` comparison
/// is NULL-safe throughout (an absent `cmd_subid` compares equal only to
/// another absent one, never to an empty string).
#[derive(Debug, Clone)]
pub struct CommandMetadata {
    pub cmd_class_identity: String,
    pub cmd_class_relname: String,
    pub cmd_id: String,
    pub cmd_subid: Option<String>,
    pub cmd_queued_since: chrono::DateTime<chrono::Utc>,
    pub cmd_runtime_start: Option<chrono::DateTime<chrono::Utc>>,
    pub cmd_runtime_end: Option<chrono::DateTime<chrono::Utc>>,
}

impl CommandMetadata {
    pub fn decode(row: &Row) -> Result<Self, DecodeError> {
        let cmd_class_identity = get_str(row, "cmd_class_identity")?;
        let cmd_class_relname = get_str(row, "cmd_class_relname")?;
        let cmd_id = get_str(row, "cmd_id")?;
        let cmd_subid: Option<String> = row
            .try_get("cmd_subid")
            .map_err(|e| DecodeError::WrongType("cmd_subid", e))?;
        let cmd_queued_since = row
            .try_get("cmd_queued_since")
            .map_err(|e| DecodeError::WrongType("cmd_queued_since", e))?;

        Ok(CommandMetadata {
            cmd_class_identity,
            cmd_class_relname,
            cmd_id,
            cmd_subid,
            cmd_queued_since,
            cmd_runtime_start: None,
            cmd_runtime_end: None,
        })
    }

    /// True if `other` names the same row, using NULL-safe `cmd_subid`
    /// comparison (already implied by `Option<String>`'s own `PartialEq`).
    pub fn identity_matches(&self, cmd_id: &str, cmd_subid: Option<&str>) -> bool {
        self.cmd_id == cmd_id && self.cmd_subid.as_deref() == cmd_subid
    }

    pub fn mark_started(&mut self, at: chrono::DateTime<chrono::Utc>) {
        self.cmd_runtime_start = Some(at);
    }

    pub fn mark_ended(&mut self, at: chrono::DateTime<chrono::Utc>) {
        self.cmd_runtime_end = Some(at);
    }
}

fn get_str(row: &Row, column: &'static str) -> Result<String, DecodeError> {
    row.try_get(column)
        .map_err(|e| DecodeError::WrongType(column, e))
}

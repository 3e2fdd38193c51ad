//! The `Sql` command variant: a row whose body is a SQL statement
//! executed inside the runner's outer transaction via a savepoint.

use postgres_types::ToSql;
use tokio_postgres::error::DbError;
use tokio_postgres::Row;

use super::metadata::CommandMetadata;
use crate::codec::{decode_composite, encode_array, encode_composite};
use crate::error::DecodeError;

/// Every diagnostic field PostgreSQL's wire protocol exposes for an error
/// or notice response, captured verbatim so a failed command's UPDATE can
/// report exactly what the server said. Encoded as a ten-field composite;
/// field order here is the field order on the wire, not alphabetical.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DiagnosticRecord {
    pub severity: Option<String>,
    pub code: Option<String>,
    pub message: Option<String>,
    pub detail: Option<String>,
    pub hint: Option<String>,
    pub position: Option<String>,
    pub where_: Option<String>,
    pub schema: Option<String>,
    pub table: Option<String>,
    pub column: Option<String>,
    pub datatype: Option<String>,
    pub constraint: Option<String>,
    pub file: Option<String>,
    pub line: Option<String>,
    pub routine: Option<String>,
}

impl From<&DbError> for DiagnosticRecord {
    fn from(e: &DbError) -> Self {
        DiagnosticRecord {
            severity: Some(e.severity().to_string()),
            code: Some(e.code().code().to_string()),
            message: Some(e.message().to_string()),
            detail: e.detail().map(str::to_string),
            hint: e.hint().map(str::to_string),
            position: e.position().map(|p| format!("{:?}", p)),
            where_: e.where_().map(str::to_string),
            schema: e.schema().map(str::to_string),
            table: e.table().map(str::to_string),
            column: e.column().map(str::to_string),
            datatype: e.datatype().map(str::to_string),
            constraint: e.constraint().map(str::to_string),
            file: e.file().map(str::to_string),
            line: e.line().map(|l| l.to_string()),
            routine: e.routine().map(str::to_string),
        }
    }
}

impl DiagnosticRecord {
    pub fn encode(&self) -> String {
        encode_composite(vec![
            self.severity.as_deref(),
            self.code.as_deref(),
            self.message.as_deref(),
            self.detail.as_deref(),
            self.hint.as_deref(),
            self.position.as_deref(),
            self.where_.as_deref(),
            self.schema.as_deref(),
            self.table.as_deref(),
            self.column.as_deref(),
            self.datatype.as_deref(),
            self.constraint.as_deref(),
            self.file.as_deref(),
            self.line.as_deref(),
            self.routine.as_deref(),
        ])
    }

    pub fn decode(input: &str) -> Result<Self, DecodeError> {
        let fields = decode_composite(input)?;
        let mut it = fields.into_iter();
        let mut next = || it.next().flatten();
        Ok(DiagnosticRecord {
            severity: next(),
            code: next(),
            message: next(),
            detail: next(),
            hint: next(),
            position: next(),
            where_: next(),
            schema: next(),
            table: next(),
            column: next(),
            datatype: next(),
            constraint: next(),
            file: next(),
            line: next(),
            routine: next(),
        })
    }
}

/// A command whose body is a SQL statement, executed via
/// `SqlExecutor::run` inside a `SAVEPOINT`.
#[derive(Debug, Clone)]
pub struct SqlCommand {
    pub metadata: CommandMetadata,
    pub sql: String,
    pub result_status: Option<String>,
    pub result_rows: Option<i64>,
    pub fatal_error: Option<DiagnosticRecord>,
    pub nonfatal_errors: Vec<DiagnosticRecord>,
}

impl SqlCommand {
    pub fn decode(row: &Row) -> Result<Self, DecodeError> {
        let metadata = CommandMetadata::decode(row)?;
        let sql: String = row.try_get("sql").map_err(|e| DecodeError::WrongType("sql", e))?;
        let sql = sql.trim().to_string();
        if sql.is_empty() {
            return Err(DecodeError::EmptySql);
        }

        Ok(SqlCommand {
            metadata,
            sql,
            result_status: None,
            result_rows: None,
            fatal_error: None,
            nonfatal_errors: Vec::new(),
        })
    }

    fn nonfatal_errors_encoded(&self) -> String {
        let encoded: Vec<String> = self
            .nonfatal_errors
            .iter()
            .map(DiagnosticRecord::encode)
            .collect();
        let refs: Vec<&str> = encoded.iter().map(String::as_str).collect();
        encode_array(refs)
    }

    /// Positional parameters for the prepared UPDATE. `fatal_error` and
    /// every entry of `nonfatal_errors` bind as text composite/array
    /// literals — see `cmdq_common::codec`. `result_rows` is always `None`
    /// for now (reserved for future row-count capture) but still occupies
    /// its own column position. Everything is boxed as owned so the
    /// returned vector does not borrow from `self`.
    pub fn update_params(&self) -> Vec<Box<dyn ToSql + Sync>> {
        let fatal_error_text = self.fatal_error.as_ref().map(DiagnosticRecord::encode);
        vec![
            Box::new(self.metadata.cmd_id.clone()) as Box<dyn ToSql + Sync>,
            Box::new(self.metadata.cmd_subid.clone()),
            Box::new(self.metadata.cmd_runtime_start),
            Box::new(self.metadata.cmd_runtime_end),
            Box::new(self.result_status.clone()),
            Box::new(self.result_rows),
            Box::new(fatal_error_text),
            Box::new(self.nonfatal_errors_encoded()),
        ]
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> SqlCommand {
        SqlCommand {
            metadata: CommandMetadata {
                cmd_class_identity: "\"public\".\"widget_sql_jobs\"".to_string(),
                cmd_class_relname: "widget_sql_jobs".to_string(),
                cmd_id: "42".to_string(),
                cmd_subid: None,
                cmd_queued_since: chrono::Utc::now(),
                cmd_runtime_start: Some(chrono::Utc::now()),
                cmd_runtime_end: Some(chrono::Utc::now()),
            },
            sql: "SELECT 1".to_string(),
            result_status: Some("COMMAND_OK(1)".to_string()),
            result_rows: None,
            fatal_error: None,
            nonfatal_errors: Vec::new(),
        }
    }

    #[test]
    fn update_params_has_eight_positions_with_result_rows_reserved() {
        let cmd = sample();
        let params = cmd.update_params();
        assert_eq!(params.len(), 8, "must match the UPDATE's $1..$8 placeholders");
    }
}

mod metadata;
mod process;
mod sql;

pub use metadata::CommandMetadata;
pub use process::{ProcessCommand, TERM_SIG_ABNORMAL_EXIT, TERM_SIG_WAITPID_FAILURE};
pub use sql::{DiagnosticRecord, SqlCommand};

use tokio_postgres::Row;

use crate::error::DecodeError;
use crate::queue::SignatureClass;

/// A decoded row dispatched to the executor appropriate for its queue's
/// signature class.
#[derive(Debug, Clone)]
pub enum CommandRecord {
    Process(ProcessCommand),
    Sql(SqlCommand),
}

impl CommandRecord {
    pub fn decode(class: SignatureClass, row: &Row) -> Result<Self, DecodeError> {
        match class {
            SignatureClass::Process => Ok(CommandRecord::Process(ProcessCommand::decode(row)?)),
            SignatureClass::Sql => Ok(CommandRecord::Sql(SqlCommand::decode(row)?)),
        }
    }

    pub fn metadata(&self) -> &CommandMetadata {
        match self {
            CommandRecord::Process(p) => &p.metadata,
            CommandRecord::Sql(s) => &s.metadata,
        }
    }

    pub fn metadata_mut(&mut self) -> &mut CommandMetadata {
        match self {
            CommandRecord::Process(p) => &mut p.metadata,
            CommandRecord::Sql(s) => &mut s.metadata,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn diagnostic_record_round_trip() {
        let record = DiagnosticRecord {
            severity: Some("ERROR".to_string()),
            code: Some("23505".to_string()),
            message: Some("duplicate key value violates unique constraint".to_string()),
            detail: Some("Key (id)=(1) already exists.".to_string()),
            hint: None,
            position: None,
            where_: None,
            schema: Some("public".to_string()),
            table: Some("widgets".to_string()),
            column: None,
            datatype: None,
            constraint: Some("widgets_pkey".to_string()),
            file: None,
            line: None,
            routine: None,
        };
        let encoded = record.encode();
        let decoded = DiagnosticRecord::decode(&encoded).unwrap();
        assert_eq!(decoded, record);
    }
}

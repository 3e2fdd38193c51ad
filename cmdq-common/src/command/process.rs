//! The `Process` command variant: a row whose execution means forking and
//! execing an external program, with its stdout/stderr/exit status
//! reported back through the UPDATE statement.

use postgres_types::ToSql;
use tokio_postgres::Row;

use super::metadata::CommandMetadata;
use crate::codec::decode_hstore;
use crate::error::DecodeError;

/// `waitpid` itself failed; never set alongside `exit_code`.
pub const TERM_SIG_WAITPID_FAILURE: i32 = -1;
/// The child neither exited normally nor died by signal.
pub const TERM_SIG_ABNORMAL_EXIT: i32 = -2;

/// A command whose body is an argv/env/stdin triple executed as a child
/// process. Result fields start `None`/empty and are filled in by
/// `ProcessExecutor::run`.
#[derive(Debug, Clone)]
pub struct ProcessCommand {
    pub metadata: CommandMetadata,
    pub argv: Vec<String>,
    pub env: Vec<(String, String)>,
    pub stdin: Vec<u8>,
    pub exit_code: Option<i32>,
    pub term_sig: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl ProcessCommand {
    pub fn decode(row: &Row) -> Result<Self, DecodeError> {
        let metadata = CommandMetadata::decode(row)?;

        let argv: Vec<String> = row
            .try_get("argv")
            .map_err(|e| DecodeError::WrongType("argv", e))?;
        if argv.is_empty() {
            return Err(DecodeError::EmptyArgv);
        }

        let env_text: String = row
            .try_get("env")
            .map_err(|e| DecodeError::WrongType("env", e))?;
        let mut env = Vec::new();
        for (key, value) in decode_hstore(&env_text)? {
            let value = value.ok_or(DecodeError::NullEnvValue(key.clone()))?;
            env.push((key, value));
        }

        let stdin: Vec<u8> = row
            .try_get("stdin")
            .map_err(|e| DecodeError::WrongType("stdin", e))?;

        Ok(ProcessCommand {
            metadata,
            argv,
            env,
            stdin,
            exit_code: None,
            term_sig: None,
            stdout: Vec::new(),
            stderr: Vec::new(),
        })
    }

    /// Enforces the data-model invariant that exactly one of `exit_code`
    /// and `term_sig` is set once execution has produced an outcome.
    pub fn has_consistent_outcome(&self) -> bool {
        self.exit_code.is_some() ^ self.term_sig.is_some()
    }

    /// Positional parameters for the prepared UPDATE, in column order:
    /// identity, runtime range, then the process-specific outcome columns.
    /// `stdout`/`stderr` bind through `bytea`'s native binary `ToSql`.
    pub fn update_params(&self) -> Vec<&(dyn ToSql + Sync)> {
        vec![
            &self.metadata.cmd_id,
            &self.metadata.cmd_subid,
            &self.metadata.cmd_runtime_start,
            &self.metadata.cmd_runtime_end,
            &self.exit_code,
            &self.term_sig,
            &self.stdout,
            &self.stderr,
        ]
    }
}

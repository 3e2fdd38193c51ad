//! Immutable per-queue configuration, decoded once from a row of the
//! supervisor's registry query and shared by reference with the runner
//! task that services it.

use std::sync::Arc;

use thiserror::Error;
use tokio_postgres::Row;

/// Which executor variant a queue's rows dispatch to. Corresponds 1:1 with
/// the `*_queue_cmd_template` relation the queue's row type conforms to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignatureClass {
    Process,
    Sql,
}

impl SignatureClass {
    pub fn from_relname(relname: &str) -> Option<Self> {
        match relname {
            "nix_queue_cmd_template" => Some(SignatureClass::Process),
            "sql_queue_cmd_template" => Some(SignatureClass::Sql),
            _ => None,
        }
    }
}

#[derive(Debug, Error)]
pub enum QueueDescriptorError {
    #[error("column '{0}' missing from registry row")]
    MissingColumn(&'static str),
    #[error("column '{column}' has an unexpected type: {source}")]
    WrongType {
        column: &'static str,
        #[source]
        source: tokio_postgres::Error,
    },
    #[error("cmd_signature_class_relname '{0}' is not a recognized queue template")]
    UnknownSignatureClass(String),
    #[error("cmd_class_relname '{0}' is longer than 15 characters")]
    RelnameTooLong(String),
    #[error("reselect_interval_msec must be non-negative, got {0}")]
    NegativeInterval(i64),
    #[error("reselect_randomized_every_nth must be positive, got {0}")]
    NonPositiveRandomizedNth(i32),
}

/// Immutable, cheaply-cloneable per-queue configuration. Constructed once
/// per registry row; never mutated afterwards. A queue whose configuration
/// changes is represented as a brand new `QueueDescriptor` replacing the
/// old one (drop+add), never as an in-place mutation — see DESIGN.md for
/// why this was the chosen resolution of spec.md's open question on
/// registry mutation.
#[derive(Debug, Clone)]
pub struct QueueDescriptor(Arc<Inner>);

#[derive(Debug)]
struct Inner {
    cmd_class_identity: String,
    cmd_class_relname: String,
    signature_class: SignatureClass,
    queue_runner_role: Option<String>,
    queue_notify_channel: Option<String>,
    reselect_interval_msec: u64,
    reselect_randomized_every_nth: Option<u32>,
    cmd_timeout_sec: f64,
    ansi_fg: Option<String>,
}

impl QueueDescriptor {
    /// Decode one tuple of the supervisor's registry query. A row that
    /// fails to decode produces an `Err` carrying a human-readable reason;
    /// the supervisor logs and skips it rather than starting a runner.
    pub fn from_row(row: &Row) -> Result<Self, QueueDescriptorError> {
        let cmd_class_identity: String = get(row, "cmd_class_identity")?;
        let cmd_class_relname: String = get(row, "cmd_class_relname")?;
        if cmd_class_relname.len() > 15 {
            return Err(QueueDescriptorError::RelnameTooLong(cmd_class_relname));
        }

        let signature_relname: String = get(row, "cmd_signature_class_relname")?;
        let signature_class = SignatureClass::from_relname(&signature_relname)
            .ok_or(QueueDescriptorError::UnknownSignatureClass(signature_relname))?;

        let queue_runner_role: Option<String> = get(row, "queue_runner_role")?;
        let queue_notify_channel: Option<String> = get(row, "queue_notify_channel")?;

        let reselect_interval_msec_raw: i64 = get(row, "reselect_interval_msec")?;
        if reselect_interval_msec_raw < 0 {
            return Err(QueueDescriptorError::NegativeInterval(
                reselect_interval_msec_raw,
            ));
        }

        let reselect_randomized_every_nth: Option<i32> =
            get(row, "reselect_randomized_every_nth")?;
        if let Some(n) = reselect_randomized_every_nth {
            if n <= 0 {
                return Err(QueueDescriptorError::NonPositiveRandomizedNth(n));
            }
        }

        let cmd_timeout_sec: f64 = get(row, "cmd_timeout_sec")?;
        let ansi_fg: Option<String> = get(row, "ansi_fg")?;

        Ok(QueueDescriptor(Arc::new(Inner {
            cmd_class_identity,
            cmd_class_relname,
            signature_class,
            queue_runner_role,
            queue_notify_channel,
            reselect_interval_msec: reselect_interval_msec_raw as u64,
            reselect_randomized_every_nth: reselect_randomized_every_nth.map(|n| n as u32),
            cmd_timeout_sec,
            ansi_fg,
        })))
    }

    pub fn cmd_class_identity(&self) -> &str {
        &self.0.cmd_class_identity
    }

    pub fn cmd_class_relname(&self) -> &str {
        &self.0.cmd_class_relname
    }

    pub fn signature_class(&self) -> SignatureClass {
        self.0.signature_class
    }

    pub fn queue_runner_role(&self) -> Option<&str> {
        self.0.queue_runner_role.as_deref()
    }

    pub fn queue_notify_channel(&self) -> Option<&str> {
        self.0.queue_notify_channel.as_deref()
    }

    pub fn reselect_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.0.reselect_interval_msec)
    }

    pub fn reselect_randomized_every_nth(&self) -> Option<u32> {
        self.0.reselect_randomized_every_nth
    }

    pub fn cmd_timeout(&self) -> Option<std::time::Duration> {
        if self.0.cmd_timeout_sec <= 0.0 {
            None
        } else {
            Some(std::time::Duration::from_secs_f64(self.0.cmd_timeout_sec))
        }
    }

    pub fn ansi_fg(&self) -> Option<&str> {
        self.0.ansi_fg.as_deref()
    }
}

impl PartialEq for QueueDescriptor {
    /// Descriptors compare equal by content, not by `Arc` pointer identity,
    /// so the supervisor can detect "nothing changed" across registry polls.
    fn eq(&self, other: &Self) -> bool {
        self.0.cmd_class_identity == other.0.cmd_class_identity
            && self.0.cmd_class_relname == other.0.cmd_class_relname
            && self.0.signature_class == other.0.signature_class
            && self.0.queue_runner_role == other.0.queue_runner_role
            && self.0.queue_notify_channel == other.0.queue_notify_channel
            && self.0.reselect_interval_msec == other.0.reselect_interval_msec
            && self.0.reselect_randomized_every_nth == other.0.reselect_randomized_every_nth
            && self.0.cmd_timeout_sec == other.0.cmd_timeout_sec
            && self.0.ansi_fg == other.0.ansi_fg
    }
}

fn get<T>(row: &Row, column: &'static str) -> Result<T, QueueDescriptorError>
where
    T: for<'a> tokio_postgres::types::FromSql<'a>,
{
    let idx = row
        .columns()
        .iter()
        .position(|c| c.name() == column)
        .ok_or(QueueDescriptorError::MissingColumn(column))?;
    row.try_get(idx)
        .map_err(|source| QueueDescriptorError::WrongType { column, source })
}

impl std::fmt::Display for SignatureClass {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SignatureClass::Process => write!(f, "nix_queue_cmd_template"),
            SignatureClass::Sql => write!(f, "sql_queue_cmd_template"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_class_from_relname() {
        assert_eq!(
            SignatureClass::from_relname("nix_queue_cmd_template"),
            Some(SignatureClass::Process)
        );
        assert_eq!(
            SignatureClass::from_relname("sql_queue_cmd_template"),
            Some(SignatureClass::Sql)
        );
        assert_eq!(SignatureClass::from_relname("bogus_template"), None);
    }
}

//! Flag parsing for `pg_cmdqd [options] [connection_string]`, per spec.md §6.
//! Hand-rolled rather than pulled from a flags crate: the teacher's own
//! binaries read all of their configuration from the environment via
//! `envconfig`, so there is no existing CLI-parsing dependency in this
//! workspace to build on, and the surface here is small enough that
//! reaching for one would be the outlier, not the default.

use std::fmt;

#[derive(Debug, Clone)]
pub struct Cli {
    pub log_level: Option<String>,
    pub log_times: Option<bool>,
    pub cmd_queues: Vec<String>,
    pub emit_sigusr1_when_ready: bool,
    pub connection_string: Option<String>,
}

#[derive(Debug)]
pub enum CliError {
    MissingValue(&'static str),
    UnknownFlag(String),
    Help,
}

impl fmt::Display for CliError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CliError::MissingValue(flag) => write!(f, "{flag} requires a value"),
            CliError::UnknownFlag(flag) => write!(f, "unrecognized option '{flag}'"),
            CliError::Help => write!(f, "{USAGE}"),
        }
    }
}

const USAGE: &str = "\
usage: pg_cmdqd [options] [connection_string]

options:
  --log-level LEVEL          NONE|PANIC|FATAL|LOG|ERROR|WARNING|NOTICE|INFO|DEBUG1-5 (default INFO)
  --log-times / --no-log-times
  --cmd-queue IDENT           restrict to this queue identity (repeatable)
  --emit-sigusr1-when-ready   signal the parent process once the registry is first read
  -h, --help                  show this message";

impl Cli {
    pub fn parse<I: IntoIterator<Item = String>>(args: I) -> Result<Self, CliError> {
        let mut cli = Cli {
            log_level: None,
            log_times: None,
            cmd_queues: Vec::new(),
            emit_sigusr1_when_ready: false,
            connection_string: None,
        };

        let mut args = args.into_iter().peekable();
        while let Some(arg) = args.next() {
            match arg.as_str() {
                "-h" | "--help" => return Err(CliError::Help),
                "--log-level" => {
                    cli.log_level = Some(args.next().ok_or(CliError::MissingValue("--log-level"))?);
                }
                "--log-times" => cli.log_times = Some(true),
                "--no-log-times" => cli.log_times = Some(false),
                "--cmd-queue" => {
                    cli.cmd_queues
                        .push(args.next().ok_or(CliError::MissingValue("--cmd-queue"))?);
                }
                "--emit-sigusr1-when-ready" => cli.emit_sigusr1_when_ready = true,
                other if other.starts_with('-') => {
                    return Err(CliError::UnknownFlag(other.to_string()))
                }
                positional => cli.connection_string = Some(positional.to_string()),
            }
        }

        Ok(cli)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn args(s: &[&str]) -> Vec<String> {
        s.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn parses_repeatable_cmd_queue() {
        let cli = Cli::parse(args(&[
            "--cmd-queue",
            "widget_jobs",
            "--cmd-queue",
            "report_jobs",
        ]))
        .unwrap();
        assert_eq!(cli.cmd_queues, vec!["widget_jobs", "report_jobs"]);
    }

    #[test]
    fn parses_connection_string_positional() {
        let cli = Cli::parse(args(&["postgres://localhost/db"])).unwrap();
        assert_eq!(cli.connection_string.as_deref(), Some("postgres://localhost/db"));
    }

    #[test]
    fn rejects_unknown_flag() {
        assert!(matches!(
            Cli::parse(args(&["--bogus"])),
            Err(CliError::UnknownFlag(_))
        ));
    }

    #[test]
    fn help_flag_short_circuits() {
        assert!(matches!(Cli::parse(args(&["-h"])), Err(CliError::Help)));
    }
}

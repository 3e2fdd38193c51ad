//! Ambient configuration: environment-variable fallbacks for everything
//! the CLI doesn't set explicitly, per spec.md §6.

use std::str::FromStr;

use envconfig::Envconfig;

#[derive(Envconfig, Clone)]
pub struct Config {
    #[envconfig(from = "PG_CMDQD_LOG_LEVEL", default = "INFO")]
    pub log_level: String,

    #[envconfig(from = "PG_CMDQD_LOG_TIMES", default = "true")]
    pub log_times: Truthy,

    #[envconfig(from = "BIND_HOST", default = "0.0.0.0")]
    pub host: String,

    #[envconfig(from = "BIND_PORT", default = "3320")]
    pub port: u16,
}

impl Config {
    pub fn bind(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Parses the environment's truthy-string convention: `true`/`TRUE`/`yes`/`YES`.
#[derive(Debug, Clone, Copy)]
pub struct Truthy(pub bool);

#[derive(Debug, PartialEq, Eq)]
pub struct ParseTruthyError;

impl FromStr for Truthy {
    type Err = ParseTruthyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Truthy(matches!(s, "true" | "TRUE" | "yes" | "YES")))
    }
}

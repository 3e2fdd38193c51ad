//! Shared types and plumbing for the command-queue daemon: queue
//! configuration, command decoding, the process/SQL executors, the
//! PostgreSQL session wrapper, and ambient metrics wiring.

pub mod codec;
pub mod command;
pub mod error;
pub mod metrics;
pub mod pgsession;
pub mod process_exec;
pub mod queue;
pub mod sql_exec;

pub use command::CommandRecord;
pub use queue::QueueDescriptor;

//! The Weft event log.
//!
//! Every state transition in the orchestrator is appended here *before*
//! the in-memory state it describes is mutated. That ordering is the
//! whole crash-consistency story: replaying the log from position zero
//! reconstructs exactly the state any external observer could have seen.
//!
//! The log is SQLite-backed and strictly ordered by a monotonically
//! increasing position. An optional [`mirror::LogMirror`] forwards every
//! record to an external collector for replication beyond the local
//! durability domain; mirroring is best-effort and never gates appends.

pub mod log;
pub mod mirror;
pub mod record;

pub use log::{EventLog, LogEntry, WalError};
pub use mirror::{spawn_mirror, HttpMirror, LogMirror};
pub use record::{EventRecord, OutputRecord};

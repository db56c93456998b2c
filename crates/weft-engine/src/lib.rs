//! The orchestration engine: walks a validated DAG in dependency order,
//! places each ready node on an executor server, drives its lifecycle
//! through the recoverable state machine, and folds the event log back
//! into memory after a restart.

pub mod engine;
pub mod fleet;
pub mod recovery;
pub mod scheduler;
pub mod state;

pub use engine::{EngineError, ExecutionEngine};
pub use fleet::{ServerFleet, ServerInfo};
pub use recovery::RecoveryReport;
pub use scheduler::{select_server, Placement, PlacementReason};
pub use state::{ExecutionRecord, ExecutionStatus, NodeExecution, NodeState};

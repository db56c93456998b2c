//! Workflow DAG model.
//!
//! A workflow arrives as a declarative [`WorkflowSpec`] (nodes + data
//! edges) and is validated exactly once, at submission time, into an
//! immutable [`WorkflowDag`]. Node types are an open, server-defined
//! catalog: the orchestrator never inspects a node's configuration, it
//! only routes it.

pub mod graph;
pub mod spec;

pub use graph::{DagError, WorkflowDag};
pub use spec::{EdgeSpec, ExecutionConfig, NodeSpec, PortSpec, WorkflowSpec};

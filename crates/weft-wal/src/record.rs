use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use weft_data::{DataRef, Tier};

/// One named output of a completed node. Small values may ride along
/// inline so downstream dispatches can forward them without a fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputRecord {
    pub name: String,
    pub data_uuid: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<serde_json::Value>,
}

/// One state transition, as persisted in the event log.
///
/// The variants are the complete transition vocabulary of the
/// orchestrator; recovery folds them, in position order, back into
/// engine and registry state.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventRecord {
    /// A workflow definition was accepted. Carries the full submission
    /// so definitions survive restarts alongside their executions.
    WorkflowDefined {
        workflow_id: Uuid,
        name: String,
        spec: serde_json::Value,
        timestamp: DateTime<Utc>,
    },

    /// A workflow definition was dropped via the management API.
    WorkflowRemoved {
        workflow_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    ExecutionStarted {
        workflow_id: Uuid,
        execution_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    ExecutionCompleted {
        execution_id: Uuid,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    ExecutionFailed {
        execution_id: Uuid,
        error: String,
        timestamp: DateTime<Utc>,
    },

    ExecutionCancelled {
        execution_id: Uuid,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A node left Pending: a target server was selected.
    NodeScheduled {
        execution_id: Uuid,
        node_id: Uuid,
        server: String,
        timestamp: DateTime<Utc>,
    },

    /// The server acknowledged the dispatch; the node is Running.
    NodeDispatched {
        execution_id: Uuid,
        node_id: Uuid,
        task_id: Uuid,
        server: String,
        timestamp: DateTime<Utc>,
    },

    NodeProgress {
        execution_id: Uuid,
        node_id: Uuid,
        progress: f64,
        timestamp: DateTime<Utc>,
    },

    NodeCompleted {
        execution_id: Uuid,
        node_id: Uuid,
        outputs: Vec<OutputRecord>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },

    NodeFailed {
        execution_id: Uuid,
        node_id: Uuid,
        error: String,
        retry_count: u32,
        timestamp: DateTime<Utc>,
    },

    NodeRetrying {
        execution_id: Uuid,
        node_id: Uuid,
        retry_count: u32,
        delay_ms: u64,
        timestamp: DateTime<Utc>,
    },

    NodeCancelled {
        execution_id: Uuid,
        node_id: Uuid,
        timestamp: DateTime<Utc>,
    },

    DataCreated {
        data_ref: DataRef,
        timestamp: DateTime<Utc>,
    },

    DataTierChanged {
        data_uuid: Uuid,
        from: Tier,
        to: Tier,
        timestamp: DateTime<Utc>,
    },

    DataRetired {
        data_uuid: Uuid,
        timestamp: DateTime<Utc>,
    },

    ServerRegistered {
        address: String,
        capabilities: Vec<String>,
        timestamp: DateTime<Utc>,
    },

    ServerRemoved {
        address: String,
        timestamp: DateTime<Utc>,
    },
}

impl EventRecord {
    /// Stable name of the variant, used as the indexed type column.
    pub fn record_type(&self) -> &'static str {
        match self {
            EventRecord::WorkflowDefined { .. } => "workflow_defined",
            EventRecord::WorkflowRemoved { .. } => "workflow_removed",
            EventRecord::ExecutionStarted { .. } => "execution_started",
            EventRecord::ExecutionCompleted { .. } => "execution_completed",
            EventRecord::ExecutionFailed { .. } => "execution_failed",
            EventRecord::ExecutionCancelled { .. } => "execution_cancelled",
            EventRecord::NodeScheduled { .. } => "node_scheduled",
            EventRecord::NodeDispatched { .. } => "node_dispatched",
            EventRecord::NodeProgress { .. } => "node_progress",
            EventRecord::NodeCompleted { .. } => "node_completed",
            EventRecord::NodeFailed { .. } => "node_failed",
            EventRecord::NodeRetrying { .. } => "node_retrying",
            EventRecord::NodeCancelled { .. } => "node_cancelled",
            EventRecord::DataCreated { .. } => "data_created",
            EventRecord::DataTierChanged { .. } => "data_tier_changed",
            EventRecord::DataRetired { .. } => "data_retired",
            EventRecord::ServerRegistered { .. } => "server_registered",
            EventRecord::ServerRemoved { .. } => "server_removed",
        }
    }

    pub fn execution_id(&self) -> Option<Uuid> {
        match self {
            EventRecord::ExecutionStarted { execution_id, .. }
            | EventRecord::ExecutionCompleted { execution_id, .. }
            | EventRecord::ExecutionFailed { execution_id, .. }
            | EventRecord::ExecutionCancelled { execution_id, .. }
            | EventRecord::NodeScheduled { execution_id, .. }
            | EventRecord::NodeDispatched { execution_id, .. }
            | EventRecord::NodeProgress { execution_id, .. }
            | EventRecord::NodeCompleted { execution_id, .. }
            | EventRecord::NodeFailed { execution_id, .. }
            | EventRecord::NodeRetrying { execution_id, .. }
            | EventRecord::NodeCancelled { execution_id, .. } => Some(*execution_id),
            _ => None,
        }
    }

    pub fn node_id(&self) -> Option<Uuid> {
        match self {
            EventRecord::NodeScheduled { node_id, .. }
            | EventRecord::NodeDispatched { node_id, .. }
            | EventRecord::NodeProgress { node_id, .. }
            | EventRecord::NodeCompleted { node_id, .. }
            | EventRecord::NodeFailed { node_id, .. }
            | EventRecord::NodeRetrying { node_id, .. }
            | EventRecord::NodeCancelled { node_id, .. } => Some(*node_id),
            _ => None,
        }
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            EventRecord::WorkflowDefined { timestamp, .. }
            | EventRecord::WorkflowRemoved { timestamp, .. }
            | EventRecord::ExecutionStarted { timestamp, .. }
            | EventRecord::ExecutionCompleted { timestamp, .. }
            | EventRecord::ExecutionFailed { timestamp, .. }
            | EventRecord::ExecutionCancelled { timestamp, .. }
            | EventRecord::NodeScheduled { timestamp, .. }
            | EventRecord::NodeDispatched { timestamp, .. }
            | EventRecord::NodeProgress { timestamp, .. }
            | EventRecord::NodeCompleted { timestamp, .. }
            | EventRecord::NodeFailed { timestamp, .. }
            | EventRecord::NodeRetrying { timestamp, .. }
            | EventRecord::NodeCancelled { timestamp, .. }
            | EventRecord::DataCreated { timestamp, .. }
            | EventRecord::DataTierChanged { timestamp, .. }
            | EventRecord::DataRetired { timestamp, .. }
            | EventRecord::ServerRegistered { timestamp, .. }
            | EventRecord::ServerRemoved { timestamp, .. } => *timestamp,
        }
    }

    /// Whether this record ends an execution.
    pub fn is_execution_terminal(&self) -> bool {
        matches!(
            self,
            EventRecord::ExecutionCompleted { .. }
                | EventRecord::ExecutionFailed { .. }
                | EventRecord::ExecutionCancelled { .. }
        )
    }

    /// Whether this record ends a node's lifecycle.
    pub fn is_node_terminal(&self) -> bool {
        matches!(
            self,
            EventRecord::NodeCompleted { .. } | EventRecord::NodeCancelled { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roundtrip_tagged_json() {
        let record = EventRecord::NodeScheduled {
            execution_id: Uuid::new_v4(),
            node_id: Uuid::new_v4(),
            server: "http://exec-1:9090".to_string(),
            timestamp: Utc::now(),
        };

        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains(r#""type":"node_scheduled""#));
        let parsed: EventRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(parsed.record_type(), "node_scheduled");
        assert_eq!(parsed.execution_id(), record.execution_id());
    }

    #[test]
    fn terminality() {
        let done = EventRecord::ExecutionCompleted {
            execution_id: Uuid::new_v4(),
            duration_ms: 12,
            timestamp: Utc::now(),
        };
        assert!(done.is_execution_terminal());
        assert!(!done.is_node_terminal());
        assert!(done.node_id().is_none());
    }
}

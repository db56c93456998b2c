use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Per-node lifecycle states.
///
/// ```text
///  Pending ──schedule──► Scheduled ──accepted──► Running ──complete──► Done
///                            │                      │
///                            └───────failure────────┤
///                                                   ▼
///                          Retrying ◄──(budget)── Failed ──(exhausted: terminal)
///                              │
///                              └───backoff───► Scheduled
/// ```
///
/// `Cancelled` is reachable from every non-terminal state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeState {
    /// Waiting for upstream dependencies.
    Pending,
    /// A target server was selected; dispatch in flight.
    Scheduled,
    /// The server acknowledged the dispatch.
    Running,
    /// Completed successfully. Terminal.
    Done,
    /// Last attempt failed. Terminal once the retry budget is spent.
    Failed,
    /// Cancelled, explicitly or by an upstream terminal failure. Terminal.
    Cancelled,
    /// Failure accepted for retry; waiting out the backoff.
    Retrying,
}

impl Default for NodeState {
    fn default() -> Self {
        NodeState::Pending
    }
}

impl NodeState {
    pub fn valid_transitions(&self) -> &'static [NodeState] {
        match self {
            NodeState::Pending => &[NodeState::Scheduled, NodeState::Cancelled],
            NodeState::Scheduled => &[
                NodeState::Running,
                NodeState::Failed,
                NodeState::Cancelled,
            ],
            NodeState::Running => &[NodeState::Done, NodeState::Failed, NodeState::Cancelled],
            NodeState::Failed => &[NodeState::Retrying, NodeState::Cancelled],
            NodeState::Retrying => &[NodeState::Scheduled, NodeState::Cancelled],
            NodeState::Done | NodeState::Cancelled => &[],
        }
    }

    pub fn can_transition_to(&self, to: NodeState) -> bool {
        self.valid_transitions().contains(&to)
    }

    pub fn is_in_flight(&self) -> bool {
        matches!(self, NodeState::Scheduled | NodeState::Running)
    }
}

impl std::fmt::Display for NodeState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            NodeState::Pending => "pending",
            NodeState::Scheduled => "scheduled",
            NodeState::Running => "running",
            NodeState::Done => "done",
            NodeState::Failed => "failed",
            NodeState::Cancelled => "cancelled",
            NodeState::Retrying => "retrying",
        };
        write!(f, "{}", s)
    }
}

/// One named output produced by a completed node. The inline value is
/// kept when the executor reported the output inline, so downstream
/// dispatches can forward it without a data-plane fetch.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutputSlot {
    pub data_uuid: Uuid,
    pub inline: Option<serde_json::Value>,
}

/// Run-time record of one node within one execution.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeExecution {
    pub node_id: Uuid,
    pub state: NodeState,
    pub retry_count: u32,
    pub assigned_server: Option<String>,
    pub task_id: Option<Uuid>,
    /// Fractional completion in [0, 1], from progress callbacks.
    pub progress: f64,
    pub last_error: Option<String>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub outputs: HashMap<String, OutputSlot>,
    /// Set once a driver task owns this node, so two completing parents
    /// cannot both spawn it.
    #[serde(skip)]
    pub claimed: bool,
}

impl NodeExecution {
    pub fn new(node_id: Uuid) -> Self {
        Self {
            node_id,
            state: NodeState::Pending,
            retry_count: 0,
            assigned_server: None,
            task_id: None,
            progress: 0.0,
            last_error: None,
            started_at: None,
            completed_at: None,
            outputs: HashMap::new(),
            claimed: false,
        }
    }

    /// Validated state transition with timestamp and retry bookkeeping.
    pub fn transition(&mut self, to: NodeState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                node_id: self.node_id,
                from: self.state,
                to,
            });
        }

        match to {
            NodeState::Running => {
                if self.started_at.is_none() {
                    self.started_at = Some(Utc::now());
                }
                self.progress = 0.0;
            }
            NodeState::Retrying => {
                self.retry_count += 1;
            }
            NodeState::Done | NodeState::Failed | NodeState::Cancelled => {
                self.completed_at = Some(Utc::now());
            }
            _ => {}
        }

        self.state = to;
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidTransition {
    pub node_id: Uuid,
    pub from: NodeState,
    pub to: NodeState,
}

/// Overall status of one execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
    /// Recovery found the log referencing state that no longer resolves.
    /// Scheduling refuses to resume until an operator intervenes.
    Quarantined,
}

impl ExecutionStatus {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, ExecutionStatus::Running)
    }
}

/// One execution of one workflow: node table plus aggregate status.
/// Owned exclusively by the engine; handlers get cloned snapshots.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionRecord {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: ExecutionStatus,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub nodes: HashMap<Uuid, NodeExecution>,
}

impl ExecutionRecord {
    pub fn new(execution_id: Uuid, workflow_id: Uuid, workflow_name: &str, node_ids: &[Uuid]) -> Self {
        Self {
            execution_id,
            workflow_id,
            workflow_name: workflow_name.to_string(),
            status: ExecutionStatus::Running,
            started_at: Utc::now(),
            completed_at: None,
            nodes: node_ids
                .iter()
                .map(|id| (*id, NodeExecution::new(*id)))
                .collect(),
        }
    }

    pub fn node(&self, id: Uuid) -> Option<&NodeExecution> {
        self.nodes.get(&id)
    }

    pub fn node_mut(&mut self, id: Uuid) -> Option<&mut NodeExecution> {
        self.nodes.get_mut(&id)
    }

    /// Fraction of nodes in Done, in [0, 1].
    pub fn progress(&self) -> f64 {
        if self.nodes.is_empty() {
            return 0.0;
        }
        let done = self
            .nodes
            .values()
            .filter(|n| n.state == NodeState::Done)
            .count();
        done as f64 / self.nodes.len() as f64
    }

    pub fn all_done(&self) -> bool {
        self.nodes.values().all(|n| n.state == NodeState::Done)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn happy_path_transitions() {
        let mut node = NodeExecution::new(Uuid::new_v4());
        node.transition(NodeState::Scheduled).unwrap();
        node.transition(NodeState::Running).unwrap();
        assert!(node.started_at.is_some());
        node.transition(NodeState::Done).unwrap();
        assert!(node.completed_at.is_some());
        assert!(node.state.valid_transitions().is_empty());
    }

    #[test]
    fn rejects_skipping_states() {
        let mut node = NodeExecution::new(Uuid::new_v4());
        let err = node.transition(NodeState::Done).unwrap_err();
        assert_eq!(err.from, NodeState::Pending);
        assert_eq!(err.to, NodeState::Done);
    }

    #[test]
    fn retry_count_increments_on_each_retry() {
        let mut node = NodeExecution::new(Uuid::new_v4());
        node.transition(NodeState::Scheduled).unwrap();
        node.transition(NodeState::Running).unwrap();

        for expected in 1..=3u32 {
            node.transition(NodeState::Failed).unwrap();
            node.transition(NodeState::Retrying).unwrap();
            assert_eq!(node.retry_count, expected);
            node.transition(NodeState::Scheduled).unwrap();
            node.transition(NodeState::Running).unwrap();
        }
    }

    #[test]
    fn cancelled_is_reachable_from_pending() {
        let mut node = NodeExecution::new(Uuid::new_v4());
        node.transition(NodeState::Cancelled).unwrap();
        assert_eq!(node.state, NodeState::Cancelled);
        assert!(node.transition(NodeState::Scheduled).is_err());
    }

    #[test]
    fn execution_progress() {
        let ids: Vec<Uuid> = (0..4).map(|_| Uuid::new_v4()).collect();
        let mut exec = ExecutionRecord::new(Uuid::new_v4(), Uuid::new_v4(), "test", &ids);
        assert_eq!(exec.progress(), 0.0);

        let node = exec.node_mut(ids[0]).unwrap();
        node.transition(NodeState::Scheduled).unwrap();
        node.transition(NodeState::Running).unwrap();
        node.transition(NodeState::Done).unwrap();
        assert_eq!(exec.progress(), 0.25);
        assert!(!exec.all_done());
    }
}

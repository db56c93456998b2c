use serde::{Deserialize, Serialize};
use uuid::Uuid;

use weft_core::config::RetryConfig;

/// A complete workflow submission: nodes, data edges, and execution
/// settings. Immutable once validated; a new version is a new workflow.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowSpec {
    pub id: Uuid,
    pub name: String,
    #[serde(default = "default_version")]
    pub version: u32,
    pub nodes: Vec<NodeSpec>,
    #[serde(default)]
    pub edges: Vec<EdgeSpec>,
    pub execution: ExecutionConfig,
}

fn default_version() -> u32 {
    1
}

impl WorkflowSpec {
    pub fn new(name: &str, execution: ExecutionConfig) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.to_string(),
            version: 1,
            nodes: Vec::new(),
            edges: Vec::new(),
            execution,
        }
    }
}

/// One computation unit. `node_type` and `config` are opaque to the
/// orchestrator and passed through verbatim to the executor server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeSpec {
    pub id: Uuid,
    /// Server-defined type identifier (e.g. "ai.chat", "code.python").
    #[serde(rename = "type")]
    pub node_type: String,
    pub name: String,
    #[serde(default)]
    pub config: serde_json::Value,
    #[serde(default)]
    pub inputs: Vec<PortSpec>,
    #[serde(default)]
    pub outputs: Vec<PortSpec>,
}

impl NodeSpec {
    pub fn new(node_type: &str, name: &str) -> Self {
        Self {
            id: Uuid::new_v4(),
            node_type: node_type.to_string(),
            name: name.to_string(),
            config: serde_json::Value::Object(Default::default()),
            inputs: Vec::new(),
            outputs: Vec::new(),
        }
    }

    pub fn with_config(mut self, config: serde_json::Value) -> Self {
        self.config = config;
        self
    }

    pub fn input(mut self, name: &str, dtype: &str, required: bool) -> Self {
        self.inputs.push(PortSpec {
            name: name.to_string(),
            dtype: dtype.to_string(),
            required,
            default: None,
        });
        self
    }

    pub fn output(mut self, name: &str, dtype: &str) -> Self {
        self.outputs.push(PortSpec {
            name: name.to_string(),
            dtype: dtype.to_string(),
            required: false,
            default: None,
        });
        self
    }

    /// Session or model identity declared in the node config, used by the
    /// scheduler for warm-cache affinity. Absent for stateless nodes.
    pub fn session_hint(&self) -> Option<&str> {
        self.config
            .get("session_id")
            .or_else(|| self.config.get("model"))
            .and_then(|v| v.as_str())
    }
}

/// Named input/output port on a node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortSpec {
    pub name: String,
    pub dtype: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
}

/// A data dependency: `source` node's `source_output` feeds `target`
/// node's `target_input`, optionally through a transform expression that
/// the executor server evaluates.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EdgeSpec {
    pub source: Uuid,
    pub source_output: String,
    pub target: Uuid,
    pub target_input: String,
    #[serde(default)]
    pub transform: Option<String>,
}

impl EdgeSpec {
    pub fn new(source: Uuid, source_output: &str, target: Uuid, target_input: &str) -> Self {
        Self {
            source,
            source_output: source_output.to_string(),
            target,
            target_input: target_input.to_string(),
            transform: None,
        }
    }
}

/// Per-workflow execution settings.
///
/// `callback_timeout_ms` has no default on purpose: how long to wait for
/// a task callback before declaring the dispatch dead depends entirely on
/// the workload, so every submission must state it.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Max time to wait for any callback on a dispatched task.
    pub callback_timeout_ms: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// Optional wall-clock bound for the whole execution.
    #[serde(default)]
    pub workflow_timeout_ms: Option<u64>,
}

impl ExecutionConfig {
    pub fn with_timeout(callback_timeout_ms: u64) -> Self {
        Self {
            callback_timeout_ms,
            retry: RetryConfig::default(),
            workflow_timeout_ms: None,
        }
    }
}

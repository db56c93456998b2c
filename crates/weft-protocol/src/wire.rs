use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use weft_data::{AccessToken, DataRef};

/// Task submission sent to an executor server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskRequest {
    pub node_id: Uuid,
    /// Open server-defined type identifier, passed through verbatim.
    pub node_type: String,
    pub inputs: Vec<TaskInput>,
    /// Opaque node configuration, passed through verbatim.
    pub config: serde_json::Value,
    /// Where the executor posts progress/complete/failed callbacks.
    pub callback_url: String,
    pub timeout_ms: u64,
    /// Capability tokens for every referenced input the target server
    /// does not already hold.
    #[serde(default)]
    pub access_tokens: Vec<AccessToken>,
}

/// One task input: a reference to remote data, or a small inline value.
/// The optional transform expression is evaluated by the executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskInput {
    Ref {
        name: String,
        data_ref: DataRef,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transform: Option<String>,
    },
    Inline {
        name: String,
        value: serde_json::Value,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        transform: Option<String>,
    },
}

impl TaskInput {
    pub fn name(&self) -> &str {
        match self {
            TaskInput::Ref { name, .. } | TaskInput::Inline { name, .. } => name,
        }
    }
}

/// One task output reported by a completion callback.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum TaskOutput {
    Ref { name: String, data_ref: DataRef },
    Inline { name: String, value: serde_json::Value },
}

impl TaskOutput {
    pub fn name(&self) -> &str {
        match self {
            TaskOutput::Ref { name, .. } | TaskOutput::Inline { name, .. } => name,
        }
    }
}

/// Positive dispatch acknowledgement (`202 Accepted`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatchAck {
    pub task_id: Uuid,
    pub accepted_at: DateTime<Utc>,
}

/// Inbound callback from an executor server.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum CallbackMessage {
    Progress {
        task_id: Uuid,
        /// Fractional completion in [0, 1].
        progress: f64,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        timestamp: DateTime<Utc>,
    },
    Complete {
        task_id: Uuid,
        outputs: Vec<TaskOutput>,
        duration_ms: u64,
        timestamp: DateTime<Utc>,
    },
    Failed {
        task_id: Uuid,
        error: String,
        /// Set when the failure is a server-level fault rather than a
        /// task-level one; retries then prefer a different server.
        #[serde(default)]
        server_fault: bool,
        timestamp: DateTime<Utc>,
    },
}

impl CallbackMessage {
    pub fn task_id(&self) -> Uuid {
        match self {
            CallbackMessage::Progress { task_id, .. }
            | CallbackMessage::Complete { task_id, .. }
            | CallbackMessage::Failed { task_id, .. } => *task_id,
        }
    }

    pub fn progress(task_id: Uuid, progress: f64) -> Self {
        CallbackMessage::Progress {
            task_id,
            progress,
            message: None,
            timestamp: Utc::now(),
        }
    }

    pub fn complete(task_id: Uuid, outputs: Vec<TaskOutput>, duration_ms: u64) -> Self {
        CallbackMessage::Complete {
            task_id,
            outputs,
            duration_ms,
            timestamp: Utc::now(),
        }
    }

    pub fn failed(task_id: Uuid, error: &str, server_fault: bool) -> Self {
        CallbackMessage::Failed {
            task_id,
            error: error.to_string(),
            server_fault,
            timestamp: Utc::now(),
        }
    }
}

/// Remote task state as reported by the status endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RemoteTaskStatus {
    Accepted,
    Running,
    Complete,
    Failed,
    Cancelled,
}

/// Snapshot from `GET {server}/task/{id}`, used by the reconciliation
/// poll after a restart to recover callbacks missed while down.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskStatusView {
    pub task_id: Uuid,
    pub status: RemoteTaskStatus,
    #[serde(default)]
    pub progress: Option<f64>,
    #[serde(default)]
    pub outputs: Option<Vec<TaskOutput>>,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub duration_ms: Option<u64>,
}

/// Uniform `{success, data, error}` envelope for the HTTP surface.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ApiError>,
}

impl<T> ApiResponse<T> {
    pub fn ok(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            error: None,
        }
    }

    pub fn err(code: &str, message: &str) -> Self {
        Self {
            success: false,
            data: None,
            error: Some(ApiError {
                code: code.to_string(),
                message: message.to_string(),
            }),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiError {
    pub code: String,
    pub message: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use weft_data::PayloadKind;

    #[test]
    fn task_input_untagged_roundtrip() {
        let data_ref = DataRef::new("server-a", Uuid::new_v4(), 512, PayloadKind::Json);
        let inputs = vec![
            TaskInput::Ref {
                name: "left".to_string(),
                data_ref,
                transform: None,
            },
            TaskInput::Inline {
                name: "right".to_string(),
                value: serde_json::json!({"k": 1}),
                transform: Some("value.k".to_string()),
            },
        ];

        let json = serde_json::to_string(&inputs).unwrap();
        let parsed: Vec<TaskInput> = serde_json::from_str(&json).unwrap();
        assert!(matches!(&parsed[0], TaskInput::Ref { name, .. } if name == "left"));
        assert!(matches!(&parsed[1], TaskInput::Inline { transform: Some(t), .. } if t == "value.k"));
    }

    #[test]
    fn callback_status_tag() {
        let msg = CallbackMessage::progress(Uuid::new_v4(), 0.4);
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains(r#""status":"progress""#));

        let failed = CallbackMessage::failed(Uuid::new_v4(), "oom", true);
        let json = serde_json::to_string(&failed).unwrap();
        let parsed: CallbackMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, CallbackMessage::Failed { server_fault: true, .. }));
    }

    #[test]
    fn server_fault_defaults_to_false() {
        let json = format!(
            r#"{{"status":"failed","task_id":"{}","error":"boom","timestamp":"2026-01-05T10:00:00Z"}}"#,
            Uuid::new_v4()
        );
        let parsed: CallbackMessage = serde_json::from_str(&json).unwrap();
        assert!(matches!(parsed, CallbackMessage::Failed { server_fault: false, .. }));
    }

    #[test]
    fn api_response_envelope() {
        let ok: ApiResponse<u32> = ApiResponse::ok(7);
        let json = serde_json::to_string(&ok).unwrap();
        let parsed: ApiResponse<u32> = serde_json::from_str(&json).unwrap();
        assert!(parsed.success);
        assert_eq!(parsed.data, Some(7));

        let err: ApiResponse<u32> = ApiResponse::err("not_found", "no such workflow");
        assert!(!err.success);
        assert_eq!(err.error.unwrap().code, "not_found");
    }
}

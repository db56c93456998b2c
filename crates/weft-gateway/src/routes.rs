use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use weft_dag::WorkflowSpec;
use weft_data::DataRef;
use weft_engine::{EngineError, ExecutionRecord, NodeState, ServerInfo};
use weft_protocol::{ApiResponse, CallbackMessage};

use crate::state::AppState;

// ── Health ──────────────────────────────────────────────────────────

// GET /api/health
pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

// ── Workflows ───────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct WorkflowSummary {
    pub workflow_id: Uuid,
    pub name: String,
    pub nodes: usize,
}

// GET /api/workflows
pub async fn list_workflows(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<WorkflowSummary>>> {
    let mut summaries: Vec<WorkflowSummary> = state
        .engine
        .list_workflows()
        .await
        .iter()
        .map(|dag| WorkflowSummary {
            workflow_id: dag.workflow_id(),
            name: dag.name().to_string(),
            nodes: dag.node_count(),
        })
        .collect();
    summaries.sort_by(|a, b| a.name.cmp(&b.name));
    Json(ApiResponse::ok(summaries))
}

#[derive(Debug, Serialize)]
pub struct WorkflowCreated {
    pub workflow_id: Uuid,
}

// POST /api/workflows
pub async fn create_workflow(
    State(state): State<Arc<AppState>>,
    Json(spec): Json<WorkflowSpec>,
) -> (StatusCode, Json<ApiResponse<WorkflowCreated>>) {
    match state.engine.define_workflow(spec).await {
        Ok(workflow_id) => (
            StatusCode::CREATED,
            Json(ApiResponse::ok(WorkflowCreated { workflow_id })),
        ),
        Err(e @ EngineError::Dag(_)) => {
            warn!(error = %e, "Workflow submission rejected");
            (
                StatusCode::BAD_REQUEST,
                Json(ApiResponse::err("validation_error", &e.to_string())),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("internal", &e.to_string())),
        ),
    }
}

// GET /api/workflows/{id}
pub async fn get_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<WorkflowSummary>>) {
    match state.engine.workflow(id).await {
        Some(dag) => (
            StatusCode::OK,
            Json(ApiResponse::ok(WorkflowSummary {
                workflow_id: dag.workflow_id(),
                name: dag.name().to_string(),
                nodes: dag.node_count(),
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such workflow")),
        ),
    }
}

// DELETE /api/workflows/{id}
pub async fn delete_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.engine.remove_workflow(id).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(EngineError::WorkflowBusy(_)) => (
            StatusCode::CONFLICT,
            Json(ApiResponse::err("workflow_busy", "executions still live")),
        ),
        Err(EngineError::UnknownWorkflow(_)) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such workflow")),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("internal", &e.to_string())),
        ),
    }
}

// ── Execution control ───────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct ExecutionStarted {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
}

// POST /api/workflows/{id}/execute
pub async fn execute_workflow(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<ExecutionStarted>>) {
    match state.engine.start_execution(id).await {
        Ok(execution_id) => (
            StatusCode::ACCEPTED,
            Json(ApiResponse::ok(ExecutionStarted {
                execution_id,
                workflow_id: id,
            })),
        ),
        Err(EngineError::UnknownWorkflow(_)) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such workflow")),
        ),
        Err(e @ EngineError::Quarantined(_)) => (
            StatusCode::CONFLICT,
            Json(ApiResponse::err("quarantined", &e.to_string())),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("internal", &e.to_string())),
        ),
    }
}

#[derive(Debug, Serialize)]
pub struct ExecutionSummary {
    pub execution_id: Uuid,
    pub workflow_id: Uuid,
    pub workflow_name: String,
    pub status: String,
    pub progress: f64,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub completed_at: Option<chrono::DateTime<chrono::Utc>>,
}

fn summarize(exec: &ExecutionRecord) -> ExecutionSummary {
    ExecutionSummary {
        execution_id: exec.execution_id,
        workflow_id: exec.workflow_id,
        workflow_name: exec.workflow_name.clone(),
        status: format!("{:?}", exec.status).to_lowercase(),
        progress: exec.progress(),
        started_at: exec.started_at,
        completed_at: exec.completed_at,
    }
}

// GET /api/workflows/{id}/status
pub async fn workflow_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<Vec<ExecutionSummary>>>) {
    if state.engine.workflow(id).await.is_none() {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such workflow")),
        );
    }
    let mut summaries: Vec<ExecutionSummary> = state
        .engine
        .executions_for_workflow(id)
        .await
        .iter()
        .map(summarize)
        .collect();
    summaries.sort_by_key(|s| s.started_at);
    (StatusCode::OK, Json(ApiResponse::ok(summaries)))
}

// GET /api/executions
pub async fn list_executions(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<ExecutionSummary>>> {
    let mut summaries: Vec<ExecutionSummary> = state
        .engine
        .list_executions()
        .await
        .iter()
        .map(summarize)
        .collect();
    summaries.sort_by_key(|s| s.started_at);
    Json(ApiResponse::ok(summaries))
}

#[derive(Debug, Serialize)]
pub struct NodeSnapshot {
    pub node_id: Uuid,
    pub state: NodeState,
    pub retry_count: u32,
    pub progress: f64,
    pub server: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ExecutionDetail {
    #[serde(flatten)]
    pub summary: ExecutionSummary,
    pub nodes: Vec<NodeSnapshot>,
}

// GET /api/executions/{id}
pub async fn get_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<ExecutionDetail>>) {
    match state.engine.execution(id).await {
        Some(exec) => {
            let mut nodes: Vec<NodeSnapshot> = exec
                .nodes
                .values()
                .map(|n| NodeSnapshot {
                    node_id: n.node_id,
                    state: n.state,
                    retry_count: n.retry_count,
                    progress: n.progress,
                    server: n.assigned_server.clone(),
                    error: n.last_error.clone(),
                })
                .collect();
            nodes.sort_by_key(|n| n.node_id);
            (
                StatusCode::OK,
                Json(ApiResponse::ok(ExecutionDetail {
                    summary: summarize(&exec),
                    nodes,
                })),
            )
        }
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such execution")),
        ),
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CancelBody {
    #[serde(default)]
    pub reason: Option<String>,
}

// POST /api/executions/{id}/cancel
pub async fn cancel_execution(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
    body: Option<Json<CancelBody>>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    let reason = body.and_then(|b| b.0.reason);
    match state.engine.cancel_execution(id, reason).await {
        Ok(()) => (StatusCode::ACCEPTED, Json(ApiResponse::ok(()))),
        Err(EngineError::UnknownExecution(_)) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such execution")),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("internal", &e.to_string())),
        ),
    }
}

// ── Tasks ───────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
pub struct TaskSnapshot {
    pub task_id: Uuid,
    pub execution_id: Uuid,
    pub node_id: Uuid,
    pub state: NodeState,
    pub progress: f64,
}

// GET /api/tasks/{id}
pub async fn get_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<TaskSnapshot>>) {
    let Some((execution_id, node_id)) = state.engine.find_task(id).await else {
        return (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such task")),
        );
    };
    let node = state
        .engine
        .execution(execution_id)
        .await
        .and_then(|e| e.node(node_id).cloned());
    match node {
        Some(node) => (
            StatusCode::OK,
            Json(ApiResponse::ok(TaskSnapshot {
                task_id: id,
                execution_id,
                node_id,
                state: node.state,
                progress: node.progress,
            })),
        ),
        None => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such task")),
        ),
    }
}

// POST /api/tasks/{id}/cancel
pub async fn cancel_task(
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.engine.cancel_task(id).await {
        Ok(true) => (StatusCode::ACCEPTED, Json(ApiResponse::ok(()))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such task")),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("internal", &e.to_string())),
        ),
    }
}

// ── Callback fan-in ─────────────────────────────────────────────────

/// POST /api/callback — executor servers report task progress,
/// completion, and failure here. Unknown task ids (late callbacks after
/// a timeout, or a confused server) are acknowledged with 404 so the
/// server stops resending.
pub async fn handle_callback(
    State(state): State<Arc<AppState>>,
    Json(message): Json<CallbackMessage>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    let task_id = message.task_id();
    match state.engine.handle_callback(message).await {
        Ok(true) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Ok(false) => {
            info!(task_id = %task_id, "Callback for unknown task");
            (
                StatusCode::NOT_FOUND,
                Json(ApiResponse::err("unknown_task", "no continuation waiting")),
            )
        }
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("internal", &e.to_string())),
        ),
    }
}

// ── Data plane hooks ────────────────────────────────────────────────

// GET /api/data/{uuid}
pub async fn get_data(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<DataRef>>) {
    match state.engine.registry().resolve(uuid) {
        Ok(data_ref) => (StatusCode::OK, Json(ApiResponse::ok(data_ref))),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such dataref")),
        ),
    }
}

// POST /api/data/{uuid}/retire
pub async fn retire_data(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.engine.retire_data(uuid).await {
        Ok(()) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(EngineError::Data(_)) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such dataref")),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("internal", &e.to_string())),
        ),
    }
}

/// DELETE /api/data/{uuid} — confirmation hook from the external data
/// plane. Only retired refs can be dropped; content-bearing refs are
/// never deleted behind the scheduler's back.
pub async fn delete_data(
    State(state): State<Arc<AppState>>,
    Path(uuid): Path<Uuid>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.engine.registry().remove(uuid) {
        Ok(_) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Err(weft_data::DataError::NotRetired(_)) => (
            StatusCode::CONFLICT,
            Json(ApiResponse::err("not_retired", "retire the dataref first")),
        ),
        Err(_) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such dataref")),
        ),
    }
}

// ── Server fleet ────────────────────────────────────────────────────

// GET /api/servers
pub async fn list_servers(
    State(state): State<Arc<AppState>>,
) -> Json<ApiResponse<Vec<ServerInfo>>> {
    Json(ApiResponse::ok(state.engine.fleet().list()))
}

// POST /api/servers
pub async fn register_server(
    State(state): State<Arc<AppState>>,
    Json(server): Json<ServerInfo>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.engine.register_server(server).await {
        Ok(()) => (StatusCode::CREATED, Json(ApiResponse::ok(()))),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("internal", &e.to_string())),
        ),
    }
}

// DELETE /api/servers/{address} (address is percent-encoded)
pub async fn unregister_server(
    State(state): State<Arc<AppState>>,
    Path(address): Path<String>,
) -> (StatusCode, Json<ApiResponse<()>>) {
    match state.engine.remove_server(&address).await {
        Ok(true) => (StatusCode::OK, Json(ApiResponse::ok(()))),
        Ok(false) => (
            StatusCode::NOT_FOUND,
            Json(ApiResponse::err("not_found", "no such server")),
        ),
        Err(e) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(ApiResponse::err("internal", &e.to_string())),
        ),
    }
}

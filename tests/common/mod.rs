//! Shared fixtures: a scripted in-process transport and workflow builders.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use futures::future::BoxFuture;
use tokio::sync::mpsc;
use uuid::Uuid;

use weft_core::config::{RetryConfig, TokenConfig};
use weft_dag::{EdgeSpec, ExecutionConfig, NodeSpec, WorkflowSpec};
use weft_data::{DataRegistry, TokenService};
use weft_engine::{ExecutionEngine, ExecutionRecord, ServerFleet, ServerInfo};
use weft_protocol::{DispatchAck, ProtocolError, TaskRequest, TaskStatusView, TaskTransport};
use weft_wal::EventLog;

/// One captured outbound dispatch, with the task id the mock assigned.
pub struct DispatchCapture {
    pub server: String,
    pub request: TaskRequest,
    pub task_id: Uuid,
}

/// In-process transport: every dispatch is acknowledged and captured on
/// a channel so the test can play the executor side; `poll_status`
/// serves whatever the test scripted into `statuses`.
pub struct MockTransport {
    tx: mpsc::UnboundedSender<DispatchCapture>,
    pub statuses: Mutex<HashMap<Uuid, TaskStatusView>>,
    pub cancelled: Mutex<Vec<Uuid>>,
}

impl MockTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<DispatchCapture>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Arc::new(Self {
                tx,
                statuses: Mutex::new(HashMap::new()),
                cancelled: Mutex::new(Vec::new()),
            }),
            rx,
        )
    }

    pub fn script_status(&self, task_id: Uuid, view: TaskStatusView) {
        self.statuses.lock().unwrap().insert(task_id, view);
    }
}

impl TaskTransport for MockTransport {
    fn dispatch<'a>(
        &'a self,
        server: &'a str,
        request: TaskRequest,
    ) -> BoxFuture<'a, Result<DispatchAck, ProtocolError>> {
        let task_id = Uuid::new_v4();
        let _ = self.tx.send(DispatchCapture {
            server: server.to_string(),
            request,
            task_id,
        });
        Box::pin(async move {
            Ok(DispatchAck {
                task_id,
                accepted_at: Utc::now(),
            })
        })
    }

    fn poll_status<'a>(
        &'a self,
        _server: &'a str,
        task_id: Uuid,
    ) -> BoxFuture<'a, Result<TaskStatusView, ProtocolError>> {
        Box::pin(async move {
            self.statuses
                .lock()
                .unwrap()
                .get(&task_id)
                .cloned()
                .ok_or(ProtocolError::Rejected {
                    status: 404,
                    message: "unknown task".to_string(),
                })
        })
    }

    fn cancel<'a>(
        &'a self,
        _server: &'a str,
        task_id: Uuid,
    ) -> BoxFuture<'a, Result<(), ProtocolError>> {
        self.cancelled.lock().unwrap().push(task_id);
        Box::pin(async move { Ok(()) })
    }
}

/// Engine over a fresh fleet of two servers (registered through the
/// engine so the fleet survives replay).
pub async fn build_engine(
    wal: Arc<EventLog>,
    transport: Arc<dyn TaskTransport>,
) -> Arc<ExecutionEngine> {
    let engine = build_bare_engine(wal, transport);
    engine
        .register_server(ServerInfo::new("http://exec-a:9090"))
        .await
        .expect("register server");
    engine
        .register_server(ServerInfo::new("http://exec-b:9090"))
        .await
        .expect("register server");
    engine
}

/// Engine without any fleet registration, for recovery tests where the
/// fleet comes back out of the replayed log.
pub fn build_bare_engine(
    wal: Arc<EventLog>,
    transport: Arc<dyn TaskTransport>,
) -> Arc<ExecutionEngine> {
    ExecutionEngine::new(
        wal,
        Arc::new(DataRegistry::new()),
        Arc::new(TokenService::new("test-orchestrator", b"test-key".to_vec())),
        transport,
        Arc::new(ServerFleet::new()),
        "http://orchestrator:7540",
        TokenConfig::default(),
    )
}

/// Fast retry policy so failure tests finish in milliseconds.
pub fn fast_execution_config(max_retries: u32) -> ExecutionConfig {
    ExecutionConfig {
        callback_timeout_ms: 60_000,
        retry: RetryConfig {
            max_retries,
            initial_delay_ms: 10,
            multiplier: 2.0,
            max_delay_ms: 100,
        },
        workflow_timeout_ms: None,
    }
}

/// A → B, A → C, B → D, C → D.
pub fn diamond_spec(max_retries: u32) -> (WorkflowSpec, [Uuid; 4]) {
    let mut spec = WorkflowSpec::new("diamond", fast_execution_config(max_retries));
    let nodes: Vec<NodeSpec> = ["a", "b", "c", "d"]
        .iter()
        .map(|n| NodeSpec::new("test.unit", n))
        .collect();
    let ids = [nodes[0].id, nodes[1].id, nodes[2].id, nodes[3].id];
    spec.nodes = nodes;
    spec.edges = vec![
        EdgeSpec::new(ids[0], "out", ids[1], "in"),
        EdgeSpec::new(ids[0], "out", ids[2], "in"),
        EdgeSpec::new(ids[1], "out", ids[3], "left"),
        EdgeSpec::new(ids[2], "out", ids[3], "right"),
    ];
    (spec, ids)
}

/// A → B chain.
pub fn chain_spec(max_retries: u32) -> (WorkflowSpec, Uuid, Uuid) {
    let mut spec = WorkflowSpec::new("chain", fast_execution_config(max_retries));
    let a = NodeSpec::new("test.unit", "first").output("out", "json");
    let b = NodeSpec::new("test.unit", "second").input("in", "json", true);
    let (ida, idb) = (a.id, b.id);
    spec.nodes = vec![a, b];
    spec.edges = vec![EdgeSpec::new(ida, "out", idb, "in")];
    (spec, ida, idb)
}

/// Wait until the continuation for a freshly acked task is registered,
/// so a scripted callback cannot race the dispatch ack.
pub async fn wait_task_indexed(engine: &Arc<ExecutionEngine>, task_id: Uuid) {
    for _ in 0..500 {
        if engine.find_task(task_id).await.is_some() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(2)).await;
    }
    panic!("task {} never indexed", task_id);
}

/// Poll until the execution reaches a terminal status.
pub async fn wait_terminal(engine: &Arc<ExecutionEngine>, execution_id: Uuid) -> ExecutionRecord {
    for _ in 0..2000 {
        if let Some(exec) = engine.execution(execution_id).await {
            if exec.status.is_terminal() {
                return exec;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("execution {} never reached a terminal state", execution_id);
}

pub async fn next_dispatch(
    rx: &mut mpsc::UnboundedReceiver<DispatchCapture>,
) -> DispatchCapture {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("timed out waiting for a dispatch")
        .expect("dispatch channel closed")
}

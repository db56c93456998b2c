use std::collections::{HashMap, HashSet};
use std::sync::{Arc, Weak};

use chrono::Utc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use weft_core::config::{RetryConfig, TokenConfig};
use weft_dag::{DagError, WorkflowDag, WorkflowSpec};
use weft_data::{DataError, DataRef, DataRegistry, TokenService};
use weft_protocol::{
    CallbackMessage, CallbackRouter, DispatchAck, ProtocolError, TaskInput, TaskOutcome,
    TaskOutput, TaskRequest, TaskTransport,
};
use weft_wal::{EventLog, EventRecord, OutputRecord, WalError};

use crate::fleet::{ServerFleet, ServerInfo};
use crate::scheduler::{jittered, select_server};
use crate::state::{
    ExecutionRecord, ExecutionStatus, InvalidTransition, NodeExecution, NodeState, OutputSlot,
};

/// The orchestration engine.
///
/// Owns every NodeExecution it creates. All shared state is mutated
/// only after the describing record is durably appended to the event
/// log; the append is the single serialization point per node, and the
/// DAG's dependency structure is what keeps concurrent nodes honest.
pub struct ExecutionEngine {
    pub(crate) workflows: RwLock<HashMap<Uuid, Arc<WorkflowDag>>>,
    pub(crate) executions: RwLock<HashMap<Uuid, ExecutionRecord>>,
    /// task id → (execution, node), for callback routing.
    pub(crate) task_index: RwLock<HashMap<Uuid, (Uuid, Uuid)>>,
    pub(crate) cancel_tokens: RwLock<HashMap<Uuid, CancellationToken>>,
    /// session/model hint → server last running it warm.
    pub(crate) affinity: RwLock<HashMap<String, String>>,
    /// Workflows recovery refused to resume. Operator intervention only.
    pub(crate) quarantined: RwLock<HashSet<Uuid>>,
    pub(crate) wal: Arc<EventLog>,
    pub(crate) registry: Arc<DataRegistry>,
    pub(crate) tokens: Arc<TokenService>,
    pub(crate) transport: Arc<dyn TaskTransport>,
    pub(crate) router: CallbackRouter,
    pub(crate) fleet: Arc<ServerFleet>,
    /// Base URL executor servers post callbacks to.
    pub(crate) callback_url: String,
    pub(crate) token_config: TokenConfig,
    /// Back-reference for spawning driver tasks from `&self` methods.
    self_handle: Weak<ExecutionEngine>,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        wal: Arc<EventLog>,
        registry: Arc<DataRegistry>,
        tokens: Arc<TokenService>,
        transport: Arc<dyn TaskTransport>,
        fleet: Arc<ServerFleet>,
        callback_url: &str,
        token_config: TokenConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|self_handle| Self {
            workflows: RwLock::new(HashMap::new()),
            executions: RwLock::new(HashMap::new()),
            task_index: RwLock::new(HashMap::new()),
            cancel_tokens: RwLock::new(HashMap::new()),
            affinity: RwLock::new(HashMap::new()),
            quarantined: RwLock::new(HashSet::new()),
            wal,
            registry,
            tokens,
            transport,
            router: CallbackRouter::new(),
            fleet,
            callback_url: callback_url.trim_end_matches('/').to_string(),
            token_config,
            self_handle: self_handle.clone(),
        })
    }

    /// Strong handle to self, for handing to spawned driver tasks.
    /// The engine only ever lives inside the Arc built by [`new`].
    ///
    /// [`new`]: ExecutionEngine::new
    pub(crate) fn handle(&self) -> Arc<Self> {
        self.self_handle
            .upgrade()
            .expect("engine accessed outside its Arc")
    }

    pub fn registry(&self) -> &Arc<DataRegistry> {
        &self.registry
    }

    pub fn fleet(&self) -> &Arc<ServerFleet> {
        &self.fleet
    }

    pub fn wal(&self) -> &Arc<EventLog> {
        &self.wal
    }

    // ── Workflow definitions ────────────────────────────────────────

    /// Validate and store a workflow definition.
    pub async fn define_workflow(&self, spec: WorkflowSpec) -> Result<Uuid, EngineError> {
        let raw = serde_json::to_value(&spec)?;
        let name = spec.name.clone();
        let dag = Arc::new(WorkflowDag::validate(spec)?);
        let workflow_id = dag.workflow_id();

        self.wal.append(EventRecord::WorkflowDefined {
            workflow_id,
            name: name.clone(),
            spec: raw,
            timestamp: Utc::now(),
        })?;
        self.workflows.write().await.insert(workflow_id, dag);

        info!(workflow_id = %workflow_id, name = %name, "Workflow defined");
        Ok(workflow_id)
    }

    pub async fn workflow(&self, id: Uuid) -> Option<Arc<WorkflowDag>> {
        self.workflows.read().await.get(&id).cloned()
    }

    pub async fn list_workflows(&self) -> Vec<Arc<WorkflowDag>> {
        self.workflows.read().await.values().cloned().collect()
    }

    /// Drop a definition. Refused while executions of it are live.
    pub async fn remove_workflow(&self, id: Uuid) -> Result<(), EngineError> {
        {
            let executions = self.executions.read().await;
            if executions
                .values()
                .any(|e| e.workflow_id == id && !e.status.is_terminal())
            {
                return Err(EngineError::WorkflowBusy(id));
            }
        }
        if !self.workflows.read().await.contains_key(&id) {
            return Err(EngineError::UnknownWorkflow(id));
        }
        self.wal.append(EventRecord::WorkflowRemoved {
            workflow_id: id,
            timestamp: Utc::now(),
        })?;
        self.workflows.write().await.remove(&id);
        Ok(())
    }

    // ── Execution lifecycle ─────────────────────────────────────────

    /// Begin executing a defined workflow. Returns the execution id;
    /// progress is observed via the status API, never synchronously.
    pub async fn start_execution(&self, workflow_id: Uuid) -> Result<Uuid, EngineError> {
        if self.quarantined.read().await.contains(&workflow_id) {
            return Err(EngineError::Quarantined(workflow_id));
        }
        let dag = self
            .workflow(workflow_id)
            .await
            .ok_or(EngineError::UnknownWorkflow(workflow_id))?;

        let execution_id = Uuid::new_v4();
        self.wal.append(EventRecord::ExecutionStarted {
            workflow_id,
            execution_id,
            timestamp: Utc::now(),
        })?;

        let mut record =
            ExecutionRecord::new(execution_id, workflow_id, dag.name(), dag.topo_order());
        let roots = dag.roots();
        for root in &roots {
            if let Some(node) = record.node_mut(*root) {
                node.claimed = true;
            }
        }
        self.executions.write().await.insert(execution_id, record);

        let cancel = CancellationToken::new();
        self.cancel_tokens
            .write()
            .await
            .insert(execution_id, cancel.clone());

        if let Some(timeout_ms) = dag.execution().workflow_timeout_ms {
            self.spawn_execution_watchdog(execution_id, timeout_ms);
        }

        info!(
            execution_id = %execution_id,
            workflow_id = %workflow_id,
            nodes = dag.node_count(),
            "Execution started"
        );
        for root in roots {
            self.spawn_node(dag.clone(), execution_id, root);
        }
        Ok(execution_id)
    }

    pub async fn execution(&self, id: Uuid) -> Option<ExecutionRecord> {
        self.executions.read().await.get(&id).cloned()
    }

    pub async fn list_executions(&self) -> Vec<ExecutionRecord> {
        self.executions.read().await.values().cloned().collect()
    }

    pub async fn executions_for_workflow(&self, workflow_id: Uuid) -> Vec<ExecutionRecord> {
        self.executions
            .read()
            .await
            .values()
            .filter(|e| e.workflow_id == workflow_id)
            .cloned()
            .collect()
    }

    pub async fn find_task(&self, task_id: Uuid) -> Option<(Uuid, Uuid)> {
        self.task_index.read().await.get(&task_id).copied()
    }

    /// Cooperative cancellation of a whole execution.
    ///
    /// The cancel record is appended first; once durable, local state is
    /// authoritative. In-flight servers get a best-effort cancel
    /// notification that is never awaited.
    pub async fn cancel_execution(
        &self,
        execution_id: Uuid,
        reason: Option<String>,
    ) -> Result<(), EngineError> {
        {
            let executions = self.executions.read().await;
            let exec = executions
                .get(&execution_id)
                .ok_or(EngineError::UnknownExecution(execution_id))?;
            if exec.status.is_terminal() {
                return Ok(());
            }
        }

        self.wal.append(EventRecord::ExecutionCancelled {
            execution_id,
            reason: reason.clone(),
            timestamp: Utc::now(),
        })?;

        // Per-node cancel records, so replay applies record-by-record
        // without re-deriving the cascade.
        let victims: Vec<Uuid> = {
            let executions = self.executions.read().await;
            match executions.get(&execution_id) {
                Some(exec) => exec
                    .nodes
                    .values()
                    .filter(|n| n.state.can_transition_to(NodeState::Cancelled))
                    .map(|n| n.node_id)
                    .collect(),
                None => Vec::new(),
            }
        };
        for node_id in &victims {
            self.wal.append(EventRecord::NodeCancelled {
                execution_id,
                node_id: *node_id,
                timestamp: Utc::now(),
            })?;
        }

        let mut in_flight: Vec<(String, Uuid)> = Vec::new();
        {
            let mut executions = self.executions.write().await;
            if let Some(exec) = executions.get_mut(&execution_id) {
                for node_id in &victims {
                    if let Some(node) = exec.node_mut(*node_id) {
                        if node.state.is_in_flight() {
                            if let (Some(server), Some(task_id)) =
                                (node.assigned_server.clone(), node.task_id)
                            {
                                in_flight.push((server, task_id));
                            }
                        }
                        if node.state.can_transition_to(NodeState::Cancelled) {
                            let _ = node.transition(NodeState::Cancelled);
                        }
                        node.claimed = true;
                    }
                }
                exec.status = ExecutionStatus::Cancelled;
                exec.completed_at = Some(Utc::now());
            }
        }

        if let Some(token) = self.cancel_tokens.read().await.get(&execution_id) {
            token.cancel();
        }

        for (server, task_id) in in_flight {
            self.router.abandon(task_id).await;
            self.task_index.write().await.remove(&task_id);
            let transport = self.transport.clone();
            tokio::spawn(async move {
                if let Err(e) = transport.cancel(&server, task_id).await {
                    debug!(task_id = %task_id, error = %e, "Best-effort task cancel failed");
                }
            });
        }

        info!(execution_id = %execution_id, reason = ?reason, "Execution cancelled");
        Ok(())
    }

    /// Best-effort cancellation of a single remote task.
    pub async fn cancel_task(&self, task_id: Uuid) -> Result<bool, EngineError> {
        let Some((execution_id, node_id)) = self.find_task(task_id).await else {
            return Ok(false);
        };
        let server = {
            let executions = self.executions.read().await;
            executions
                .get(&execution_id)
                .and_then(|e| e.node(node_id))
                .and_then(|n| n.assigned_server.clone())
        };
        if let Some(server) = server {
            let transport = self.transport.clone();
            tokio::spawn(async move {
                let _ = transport.cancel(&server, task_id).await;
            });
        }
        Ok(true)
    }

    // ── Callbacks ───────────────────────────────────────────────────

    /// Route one inbound callback. Returns false for unknown task ids
    /// (a late callback after timeout/cancel, or a stray server).
    pub async fn handle_callback(&self, message: CallbackMessage) -> Result<bool, EngineError> {
        match message {
            CallbackMessage::Progress {
                task_id, progress, ..
            } => {
                let Some((execution_id, node_id)) = self.find_task(task_id).await else {
                    return Ok(false);
                };
                self.wal.append(EventRecord::NodeProgress {
                    execution_id,
                    node_id,
                    progress,
                    timestamp: Utc::now(),
                })?;
                let mut executions = self.executions.write().await;
                if let Some(node) = executions
                    .get_mut(&execution_id)
                    .and_then(|e| e.node_mut(node_id))
                {
                    if node.state == NodeState::Running {
                        node.progress = progress.clamp(0.0, 1.0);
                    }
                }
                Ok(true)
            }
            CallbackMessage::Complete {
                task_id,
                outputs,
                duration_ms,
                ..
            } => Ok(self
                .router
                .resolve(
                    task_id,
                    TaskOutcome::Complete {
                        outputs,
                        duration_ms,
                    },
                )
                .await),
            CallbackMessage::Failed {
                task_id,
                error,
                server_fault,
                ..
            } => Ok(self
                .router
                .resolve(task_id, TaskOutcome::Failed { error, server_fault })
                .await),
        }
    }

    // ── Fleet and data plane ────────────────────────────────────────

    pub async fn register_server(&self, server: ServerInfo) -> Result<(), EngineError> {
        self.wal.append(EventRecord::ServerRegistered {
            address: server.address.clone(),
            capabilities: server.capabilities.clone(),
            timestamp: Utc::now(),
        })?;
        info!(address = %server.address, "Server registered");
        self.fleet.upsert(server);
        Ok(())
    }

    pub async fn remove_server(&self, address: &str) -> Result<bool, EngineError> {
        self.wal.append(EventRecord::ServerRemoved {
            address: address.to_string(),
            timestamp: Utc::now(),
        })?;
        Ok(self.fleet.remove(address).is_some())
    }

    pub async fn retire_data(&self, data_uuid: Uuid) -> Result<(), EngineError> {
        if !self.registry.contains(data_uuid) {
            return Err(DataError::NotFound(data_uuid).into());
        }
        self.wal.append(EventRecord::DataRetired {
            data_uuid,
            timestamp: Utc::now(),
        })?;
        self.registry.retire(data_uuid)?;
        Ok(())
    }

    /// External memory-pressure hook: downgrade the `n` coldest refs one
    /// tier, logging each move before applying it.
    pub async fn evict_under_pressure(&self, n: usize) -> Result<usize, EngineError> {
        let moves = self.registry.eviction_candidates(n);
        for (data_uuid, from, to) in &moves {
            self.wal.append(EventRecord::DataTierChanged {
                data_uuid: *data_uuid,
                from: *from,
                to: *to,
                timestamp: Utc::now(),
            })?;
            self.registry.set_tier(*data_uuid, *to)?;
            info!(data_uuid = %data_uuid, from = %from, to = %to, "Tier downgraded under pressure");
        }
        Ok(moves.len())
    }

    // ── Node driver ─────────────────────────────────────────────────

    pub(crate) fn spawn_node(&self, dag: Arc<WorkflowDag>, execution_id: Uuid, node_id: Uuid) {
        let engine = self.handle();
        tokio::spawn(async move {
            if let Err(e) = engine.run_node(dag, execution_id, node_id).await {
                error!(
                    execution_id = %execution_id,
                    node_id = %node_id,
                    error = %e,
                    "Node driver aborted"
                );
            }
        });
    }

    /// Drive one node from ready to terminal, including the retry loop.
    async fn run_node(
        self: Arc<Self>,
        dag: Arc<WorkflowDag>,
        execution_id: Uuid,
        node_id: Uuid,
    ) -> Result<(), EngineError> {
        let spec = dag
            .node(node_id)
            .ok_or(EngineError::UnknownNode(node_id))?
            .clone();
        let exec_cfg = dag.execution().clone();
        let cancel = self.cancel_token(execution_id).await;
        let mut avoid: Option<String> = None;

        loop {
            if cancel.is_cancelled() {
                return Ok(());
            }

            // 0-based attempt number = failures so far.
            let attempt = {
                let executions = self.executions.read().await;
                executions
                    .get(&execution_id)
                    .ok_or(EngineError::UnknownExecution(execution_id))?
                    .node(node_id)
                    .ok_or(EngineError::UnknownNode(node_id))?
                    .retry_count
            };

            let (inputs, input_refs) = self.collect_inputs(&dag, execution_id, node_id).await?;

            let session_server = match spec.session_hint() {
                Some(hint) => self.affinity.read().await.get(hint).cloned(),
                None => None,
            };

            let placement = select_server(
                &self.fleet,
                &spec,
                &input_refs,
                session_server.as_deref(),
                avoid.as_deref(),
            );
            let Some(placement) = placement else {
                // No healthy candidate at all; burn one retry and back off.
                warn!(node_id = %node_id, "No eligible server for node");
                match self
                    .account_failure(&dag, execution_id, node_id, attempt, &exec_cfg.retry,
                        "no eligible server in fleet", &cancel)
                    .await?
                {
                    FailureVerdict::RetryScheduled => continue,
                    FailureVerdict::Terminal | FailureVerdict::CancelledMeanwhile => return Ok(()),
                }
            };

            self.log_transition(
                execution_id,
                node_id,
                EventRecord::NodeScheduled {
                    execution_id,
                    node_id,
                    server: placement.server.clone(),
                    timestamp: Utc::now(),
                },
                NodeState::Scheduled,
                |node| node.assigned_server = Some(placement.server.clone()),
            )
            .await?;
            debug!(
                node_id = %node_id,
                server = %placement.server,
                reason = ?placement.reason,
                attempt,
                "Node scheduled"
            );

            let access_tokens = self.issue_tokens(&inputs, &placement.server);
            let request = TaskRequest {
                node_id,
                node_type: spec.node_type.clone(),
                inputs: inputs.clone(),
                config: spec.config.clone(),
                callback_url: format!("{}/api/callback", self.callback_url),
                timeout_ms: exec_cfg.callback_timeout_ms,
                access_tokens,
            };

            let outcome = match self
                .dispatch_with_retry(&placement.server, request, &exec_cfg.retry, &cancel)
                .await
            {
                Ok(ack) => {
                    match self
                        .await_task(&ack, execution_id, node_id, &placement.server, &exec_cfg, &cancel)
                        .await?
                    {
                        Some(outcome) => outcome,
                        None => return Ok(()), // cancelled while waiting
                    }
                }
                Err(_) if cancel.is_cancelled() => return Ok(()),
                Err(e) => {
                    // Redispatch budget spent without an ack.
                    TaskOutcome::Failed {
                        error: format!("dispatch failed: {}", e),
                        server_fault: true,
                    }
                }
            };

            match outcome {
                TaskOutcome::Complete {
                    outputs,
                    duration_ms,
                } => {
                    self.complete_node(&dag, execution_id, node_id, &placement.server, outputs, duration_ms)
                        .await?;
                    return Ok(());
                }
                TaskOutcome::Failed { error, server_fault } => {
                    if server_fault {
                        avoid = Some(placement.server.clone());
                    } else {
                        avoid = None;
                    }
                    match self
                        .account_failure(&dag, execution_id, node_id, attempt, &exec_cfg.retry, &error, &cancel)
                        .await?
                    {
                        FailureVerdict::RetryScheduled => continue,
                        FailureVerdict::Terminal | FailureVerdict::CancelledMeanwhile => {
                            return Ok(())
                        }
                    }
                }
            }
        }
    }

    /// Register the continuation, mark the node Running, and wait for
    /// its terminal callback (or synthesize one on timeout).
    /// Returns None when the execution was cancelled while waiting.
    pub(crate) async fn await_task(
        &self,
        ack: &DispatchAck,
        execution_id: Uuid,
        node_id: Uuid,
        server: &str,
        exec_cfg: &weft_dag::ExecutionConfig,
        cancel: &CancellationToken,
    ) -> Result<Option<TaskOutcome>, EngineError> {
        let task_id = ack.task_id;
        let rx = self.router.register(task_id).await;
        self.task_index
            .write()
            .await
            .insert(task_id, (execution_id, node_id));

        self.log_transition(
            execution_id,
            node_id,
            EventRecord::NodeDispatched {
                execution_id,
                node_id,
                task_id,
                server: server.to_string(),
                timestamp: Utc::now(),
            },
            NodeState::Running,
            |node| node.task_id = Some(task_id),
        )
        .await?;

        let timeout = std::time::Duration::from_millis(exec_cfg.callback_timeout_ms);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.router.abandon(task_id).await;
                self.task_index.write().await.remove(&task_id);
                return Ok(None);
            }
            waited = tokio::time::timeout(timeout, rx) => match waited {
                Ok(Ok(outcome)) => outcome,
                Ok(Err(_)) => TaskOutcome::Failed {
                    error: "callback continuation dropped".to_string(),
                    server_fault: false,
                },
                Err(_) => {
                    self.router.abandon(task_id).await;
                    TaskOutcome::Failed {
                        error: ProtocolError::CallbackTimeout.to_string(),
                        server_fault: true,
                    }
                }
            },
        };
        self.task_index.write().await.remove(&task_id);
        Ok(Some(outcome))
    }

    /// Bounded redispatch loop against one server, exponential backoff.
    async fn dispatch_with_retry(
        &self,
        server: &str,
        request: TaskRequest,
        retry: &RetryConfig,
        cancel: &CancellationToken,
    ) -> Result<DispatchAck, ProtocolError> {
        let mut last_err: Option<ProtocolError> = None;
        for attempt in 0..=retry.max_retries {
            if attempt > 0 {
                let delay = retry.delay_ms(attempt - 1);
                warn!(
                    server,
                    attempt,
                    max_retries = retry.max_retries,
                    delay_ms = delay,
                    "Redispatching after backoff"
                );
                tokio::select! {
                    _ = cancel.cancelled() => {
                        return Err(last_err.unwrap_or(ProtocolError::CallbackTimeout));
                    }
                    _ = tokio::time::sleep(jittered(delay)) => {}
                }
            }
            match self.transport.dispatch(server, request.clone()).await {
                Ok(ack) => return Ok(ack),
                Err(e) if e.is_retryable() && attempt < retry.max_retries => {
                    warn!(server, error = %e, "Dispatch attempt failed");
                    last_err = Some(e);
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or(ProtocolError::CallbackTimeout))
    }

    /// Record a failure and decide between retry and terminal failure.
    pub(crate) async fn account_failure(
        &self,
        dag: &Arc<WorkflowDag>,
        execution_id: Uuid,
        node_id: Uuid,
        attempt: u32,
        retry: &RetryConfig,
        reason: &str,
        cancel: &CancellationToken,
    ) -> Result<FailureVerdict, EngineError> {
        let error = reason.to_string();
        self.log_transition(
            execution_id,
            node_id,
            EventRecord::NodeFailed {
                execution_id,
                node_id,
                error: error.clone(),
                retry_count: attempt,
                timestamp: Utc::now(),
            },
            NodeState::Failed,
            |node| node.last_error = Some(error),
        )
        .await?;

        if attempt < retry.max_retries {
            let delay = retry.delay_ms(attempt);
            self.log_transition(
                execution_id,
                node_id,
                EventRecord::NodeRetrying {
                    execution_id,
                    node_id,
                    retry_count: attempt + 1,
                    delay_ms: delay,
                    timestamp: Utc::now(),
                },
                NodeState::Retrying,
                |_| {},
            )
            .await?;
            info!(
                node_id = %node_id,
                retry = attempt + 1,
                delay_ms = delay,
                "Node will retry"
            );
            tokio::select! {
                _ = cancel.cancelled() => return Ok(FailureVerdict::CancelledMeanwhile),
                _ = tokio::time::sleep(jittered(delay)) => {}
            }
            Ok(FailureVerdict::RetryScheduled)
        } else {
            self.fail_terminally(dag, execution_id, node_id).await?;
            Ok(FailureVerdict::Terminal)
        }
    }

    /// Shared terminal-outcome handling for the reconciliation paths:
    /// apply a completion, or account the failure and respawn the driver
    /// if a retry was granted.
    pub(crate) async fn handle_outcome(
        &self,
        dag: &Arc<WorkflowDag>,
        execution_id: Uuid,
        node_id: Uuid,
        server: &str,
        outcome: TaskOutcome,
    ) -> Result<(), EngineError> {
        match outcome {
            TaskOutcome::Complete {
                outputs,
                duration_ms,
            } => {
                self.complete_node(dag, execution_id, node_id, server, outputs, duration_ms)
                    .await
            }
            TaskOutcome::Failed { error, .. } => {
                let attempt = {
                    let executions = self.executions.read().await;
                    executions
                        .get(&execution_id)
                        .and_then(|e| e.node(node_id))
                        .map(|n| n.retry_count)
                        .unwrap_or(0)
                };
                let cancel = self.cancel_token(execution_id).await;
                let retry = dag.execution().retry.clone();
                match self
                    .account_failure(dag, execution_id, node_id, attempt, &retry, &error, &cancel)
                    .await?
                {
                    FailureVerdict::RetryScheduled => {
                        self.spawn_node(dag.clone(), execution_id, node_id);
                        Ok(())
                    }
                    FailureVerdict::Terminal | FailureVerdict::CancelledMeanwhile => Ok(()),
                }
            }
        }
    }

    /// Terminal failure: cascade-cancel every transitive dependent and
    /// mark the execution failed. Independent branches keep running.
    pub(crate) async fn fail_terminally(
        &self,
        dag: &Arc<WorkflowDag>,
        execution_id: Uuid,
        node_id: Uuid,
    ) -> Result<(), EngineError> {
        warn!(execution_id = %execution_id, node_id = %node_id, "Node failed terminally");

        for dependent in dag.descendants(node_id) {
            let cancellable = {
                let executions = self.executions.read().await;
                executions
                    .get(&execution_id)
                    .and_then(|e| e.node(dependent))
                    .map(|n| n.state.can_transition_to(NodeState::Cancelled))
                    .unwrap_or(false)
            };
            if !cancellable {
                continue;
            }
            self.wal.append(EventRecord::NodeCancelled {
                execution_id,
                node_id: dependent,
                timestamp: Utc::now(),
            })?;
            let mut executions = self.executions.write().await;
            if let Some(node) = executions
                .get_mut(&execution_id)
                .and_then(|e| e.node_mut(dependent))
            {
                let _ = node.transition(NodeState::Cancelled);
                node.claimed = true;
            }
        }

        let should_mark_failed = {
            let executions = self.executions.read().await;
            executions
                .get(&execution_id)
                .map(|e| e.status == ExecutionStatus::Running)
                .unwrap_or(false)
        };
        if should_mark_failed {
            let error = {
                let executions = self.executions.read().await;
                executions
                    .get(&execution_id)
                    .and_then(|e| e.node(node_id))
                    .and_then(|n| n.last_error.clone())
                    .unwrap_or_else(|| "node failed".to_string())
            };
            self.wal.append(EventRecord::ExecutionFailed {
                execution_id,
                error,
                timestamp: Utc::now(),
            })?;
            let mut executions = self.executions.write().await;
            if let Some(exec) = executions.get_mut(&execution_id) {
                exec.status = ExecutionStatus::Failed;
                exec.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }

    /// Apply a completion: register outputs, mark Done, refresh session
    /// affinity, then fan out to newly ready dependents.
    pub(crate) async fn complete_node(
        &self,
        dag: &Arc<WorkflowDag>,
        execution_id: Uuid,
        node_id: Uuid,
        server: &str,
        outputs: Vec<TaskOutput>,
        duration_ms: u64,
    ) -> Result<(), EngineError> {
        let workflow_id = dag.workflow_id();
        let mut slots: HashMap<String, OutputSlot> = HashMap::new();
        let mut records: Vec<OutputRecord> = Vec::new();

        for output in outputs {
            let (name, data_ref, inline) = match output {
                TaskOutput::Ref { name, data_ref } => (name, data_ref, None),
                TaskOutput::Inline { name, value } => {
                    let data_ref = DataRef::json(server, workflow_id, &value);
                    (name, data_ref, Some(value))
                }
            };
            self.wal.append(EventRecord::DataCreated {
                data_ref: data_ref.clone(),
                timestamp: Utc::now(),
            })?;
            self.registry.register(data_ref.clone())?;
            slots.insert(
                name.clone(),
                OutputSlot {
                    data_uuid: data_ref.uuid,
                    inline: inline.clone(),
                },
            );
            records.push(OutputRecord {
                name,
                data_uuid: data_ref.uuid,
                inline,
            });
        }

        self.log_transition(
            execution_id,
            node_id,
            EventRecord::NodeCompleted {
                execution_id,
                node_id,
                outputs: records,
                duration_ms,
                timestamp: Utc::now(),
            },
            NodeState::Done,
            |node| {
                node.outputs = slots;
                node.progress = 1.0;
            },
        )
        .await?;
        info!(execution_id = %execution_id, node_id = %node_id, duration_ms, "Node completed");

        if let Some(hint) = dag.node(node_id).and_then(|n| n.session_hint()) {
            self.affinity
                .write()
                .await
                .insert(hint.to_string(), server.to_string());
        }

        self.finish_if_complete(execution_id).await?;
        self.spawn_ready_dependents(dag, execution_id, node_id).await;
        Ok(())
    }

    async fn finish_if_complete(&self, execution_id: Uuid) -> Result<(), EngineError> {
        let done = {
            let executions = self.executions.read().await;
            executions
                .get(&execution_id)
                .map(|e| e.status == ExecutionStatus::Running && e.all_done())
                .unwrap_or(false)
        };
        if !done {
            return Ok(());
        }

        let duration_ms = {
            let executions = self.executions.read().await;
            executions
                .get(&execution_id)
                .map(|e| (Utc::now() - e.started_at).num_milliseconds().max(0) as u64)
                .unwrap_or(0)
        };
        self.wal.append(EventRecord::ExecutionCompleted {
            execution_id,
            duration_ms,
            timestamp: Utc::now(),
        })?;
        let mut executions = self.executions.write().await;
        if let Some(exec) = executions.get_mut(&execution_id) {
            exec.status = ExecutionStatus::Completed;
            exec.completed_at = Some(Utc::now());
            info!(execution_id = %execution_id, duration_ms, "Execution completed");
        }
        Ok(())
    }

    /// Claim-and-spawn dependents whose parents are now all Done. The
    /// claim happens under the write lock so two completing parents
    /// cannot both spawn the same child.
    pub(crate) async fn spawn_ready_dependents(
        &self,
        dag: &Arc<WorkflowDag>,
        execution_id: Uuid,
        completed: Uuid,
    ) {
        let mut to_spawn: Vec<Uuid> = Vec::new();
        {
            let mut executions = self.executions.write().await;
            let Some(exec) = executions.get_mut(&execution_id) else {
                return;
            };
            if matches!(
                exec.status,
                ExecutionStatus::Cancelled | ExecutionStatus::Quarantined
            ) {
                return;
            }
            for child in dag.children(completed) {
                let ready = dag.parents(child).iter().all(|p| {
                    exec.node(*p)
                        .map(|n| n.state == NodeState::Done)
                        .unwrap_or(false)
                });
                if !ready {
                    continue;
                }
                if let Some(node) = exec.node_mut(child) {
                    if node.state == NodeState::Pending && !node.claimed {
                        node.claimed = true;
                        to_spawn.push(child);
                    }
                }
            }
        }
        for child in to_spawn {
            self.spawn_node(dag.clone(), execution_id, child);
        }
    }

    // ── Helpers ─────────────────────────────────────────────────────

    /// Build the task inputs for a node from its incoming edges and
    /// unconnected port defaults. Also returns the referenced DataRefs
    /// for locality scoring.
    pub(crate) async fn collect_inputs(
        &self,
        dag: &Arc<WorkflowDag>,
        execution_id: Uuid,
        node_id: Uuid,
    ) -> Result<(Vec<TaskInput>, Vec<DataRef>), EngineError> {
        let mut inputs = Vec::new();
        let mut refs = Vec::new();

        {
            let executions = self.executions.read().await;
            let exec = executions
                .get(&execution_id)
                .ok_or(EngineError::UnknownExecution(execution_id))?;

            for (source, edge) in dag.incoming_edges(node_id) {
                let slot = exec
                    .node(source)
                    .and_then(|n| n.outputs.get(&edge.source_output))
                    .ok_or_else(|| EngineError::MissingOutput {
                        node_id: source,
                        name: edge.source_output.clone(),
                    })?
                    .clone();

                match slot.inline {
                    Some(value) => inputs.push(TaskInput::Inline {
                        name: edge.target_input.clone(),
                        value,
                        transform: edge.transform.clone(),
                    }),
                    None => {
                        let data_ref = self.registry.resolve(slot.data_uuid)?;
                        refs.push(data_ref.clone());
                        inputs.push(TaskInput::Ref {
                            name: edge.target_input.clone(),
                            data_ref,
                            transform: edge.transform.clone(),
                        });
                    }
                }
            }
        }

        // Unconnected ports fall back to their declared defaults.
        if let Some(spec) = dag.node(node_id) {
            for port in &spec.inputs {
                let connected = inputs.iter().any(|i| i.name() == port.name);
                if !connected {
                    if let Some(default) = &port.default {
                        inputs.push(TaskInput::Inline {
                            name: port.name.clone(),
                            value: default.clone(),
                            transform: None,
                        });
                    }
                }
            }
        }

        Ok((inputs, refs))
    }

    /// Read tokens for every referenced input the target does not hold.
    fn issue_tokens(&self, inputs: &[TaskInput], server: &str) -> Vec<weft_data::AccessToken> {
        let ttl = chrono::Duration::seconds(self.token_config.ttl_secs as i64);
        inputs
            .iter()
            .filter_map(|input| match input {
                TaskInput::Ref { data_ref, .. } if !data_ref.is_local_to(server) => Some(
                    self.tokens
                        .issue(data_ref.uuid, weft_data::Permissions::read_only(), ttl),
                ),
                _ => None,
            })
            .collect()
    }

    /// Append-then-apply for one node transition: the record is durable
    /// before the in-memory state machine moves.
    pub(crate) async fn log_transition(
        &self,
        execution_id: Uuid,
        node_id: Uuid,
        record: EventRecord,
        to: NodeState,
        after: impl FnOnce(&mut NodeExecution),
    ) -> Result<(), EngineError> {
        self.wal.append(record)?;
        let mut executions = self.executions.write().await;
        let exec = executions
            .get_mut(&execution_id)
            .ok_or(EngineError::UnknownExecution(execution_id))?;
        let node = exec
            .node_mut(node_id)
            .ok_or(EngineError::UnknownNode(node_id))?;
        node.transition(to)?;
        after(node);
        Ok(())
    }

    pub(crate) async fn cancel_token(&self, execution_id: Uuid) -> CancellationToken {
        let mut tokens = self.cancel_tokens.write().await;
        tokens
            .entry(execution_id)
            .or_insert_with(CancellationToken::new)
            .clone()
    }

    fn spawn_execution_watchdog(&self, execution_id: Uuid, timeout_ms: u64) {
        let engine = self.handle();
        tokio::spawn(async move {
            tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)).await;
            let still_running = engine
                .execution(execution_id)
                .await
                .map(|e| !e.status.is_terminal())
                .unwrap_or(false);
            if still_running {
                warn!(execution_id = %execution_id, timeout_ms, "Workflow timeout reached");
                if let Err(e) = engine
                    .cancel_execution(execution_id, Some("workflow timeout".to_string()))
                    .await
                {
                    error!(execution_id = %execution_id, error = %e, "Timeout cancellation failed");
                }
            }
        });
    }

    pub(crate) async fn quarantine_workflow(&self, workflow_id: Uuid) {
        self.quarantined.write().await.insert(workflow_id);
    }

    pub async fn is_quarantined(&self, workflow_id: Uuid) -> bool {
        self.quarantined.read().await.contains(&workflow_id)
    }

    pub(crate) async fn insert_execution(&self, record: ExecutionRecord) {
        self.executions
            .write()
            .await
            .insert(record.execution_id, record);
    }

    pub(crate) async fn insert_workflow(&self, dag: Arc<WorkflowDag>) {
        self.workflows.write().await.insert(dag.workflow_id(), dag);
    }

    pub(crate) async fn index_task(&self, task_id: Uuid, execution_id: Uuid, node_id: Uuid) {
        self.task_index
            .write()
            .await
            .insert(task_id, (execution_id, node_id));
    }

    pub(crate) async fn remember_affinity(&self, hint: &str, server: &str) {
        self.affinity
            .write()
            .await
            .insert(hint.to_string(), server.to_string());
    }

    pub(crate) async fn with_execution_mut<R>(
        &self,
        execution_id: Uuid,
        f: impl FnOnce(&mut ExecutionRecord) -> R,
    ) -> Option<R> {
        let mut executions = self.executions.write().await;
        executions.get_mut(&execution_id).map(f)
    }
}

/// What `account_failure` decided.
pub(crate) enum FailureVerdict {
    RetryScheduled,
    Terminal,
    CancelledMeanwhile,
}

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    Wal(#[from] WalError),

    #[error(transparent)]
    Data(#[from] DataError),

    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid transition for node {}: {:?} -> {:?}", .0.node_id, .0.from, .0.to)]
    InvalidTransition(InvalidTransition),

    #[error("Unknown workflow: {0}")]
    UnknownWorkflow(Uuid),

    #[error("Workflow has live executions: {0}")]
    WorkflowBusy(Uuid),

    #[error("Unknown execution: {0}")]
    UnknownExecution(Uuid),

    #[error("Unknown node: {0}")]
    UnknownNode(Uuid),

    #[error("Node {node_id} has no output named '{name}'")]
    MissingOutput { node_id: Uuid, name: String },

    #[error("Workflow {0} is quarantined pending operator intervention")]
    Quarantined(Uuid),
}

impl From<InvalidTransition> for EngineError {
    fn from(t: InvalidTransition) -> Self {
        EngineError::InvalidTransition(t)
    }
}

//! Crash recovery: fold the event log back into engine state, then
//! reconcile whatever was in flight when the process died.
//!
//! Replay applies records verbatim: no re-derivation, no new appends.
//! Reconciliation is the only part that generates new records, because
//! polling a server's task-status endpoint genuinely observes new
//! transitions that happened while the orchestrator was down.

use std::sync::Arc;

use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use weft_dag::{WorkflowDag, WorkflowSpec};
use weft_protocol::{RemoteTaskStatus, TaskOutcome};
use weft_wal::EventRecord;

use crate::engine::{EngineError, ExecutionEngine};
use crate::fleet::ServerInfo;
use crate::scheduler::jittered;
use crate::state::{ExecutionRecord, ExecutionStatus, NodeState};

/// What recovery found and did.
#[derive(Debug, Default, Serialize)]
pub struct RecoveryReport {
    pub records_replayed: u64,
    pub workflows: usize,
    pub executions: usize,
    /// Node drivers respawned for non-terminal work.
    pub nodes_resumed: usize,
    /// Running tasks reconciled against their server's status endpoint.
    pub tasks_reconciled: usize,
    /// Workflows refusing to resume until an operator intervenes.
    pub quarantined: Vec<Uuid>,
}

impl ExecutionEngine {
    /// Rebuild in-memory state from the log, then resume scheduling.
    /// Must run before the gateway starts serving.
    pub async fn recover(&self) -> Result<RecoveryReport, EngineError> {
        let mut report = RecoveryReport::default();

        let entries = self.wal.replay()?;
        report.records_replayed = entries.len() as u64;
        for entry in entries {
            self.apply_replayed(entry.record, &mut report).await;
        }

        report.workflows = self.workflows.read().await.len();
        report.executions = self.executions.read().await.len();

        self.resume_in_flight(&mut report).await;

        info!(
            records = report.records_replayed,
            workflows = report.workflows,
            executions = report.executions,
            resumed = report.nodes_resumed,
            reconciled = report.tasks_reconciled,
            quarantined = report.quarantined.len(),
            "Recovery complete"
        );
        Ok(report)
    }

    async fn apply_replayed(&self, record: EventRecord, report: &mut RecoveryReport) {
        match record {
            EventRecord::WorkflowDefined {
                workflow_id, spec, ..
            } => {
                let parsed = serde_json::from_value::<WorkflowSpec>(spec)
                    .map_err(|e| e.to_string())
                    .and_then(|s| WorkflowDag::validate(s).map_err(|e| e.to_string()));
                match parsed {
                    Ok(dag) => self.insert_workflow(Arc::new(dag)).await,
                    Err(e) => {
                        error!(
                            workflow_id = %workflow_id,
                            error = %e,
                            "Replayed workflow definition no longer validates"
                        );
                        self.quarantine(workflow_id, None, report).await;
                    }
                }
            }

            EventRecord::WorkflowRemoved { workflow_id, .. } => {
                self.workflows.write().await.remove(&workflow_id);
            }

            EventRecord::ExecutionStarted {
                workflow_id,
                execution_id,
                ..
            } => match self.workflow(workflow_id).await {
                Some(dag) => {
                    let record = ExecutionRecord::new(
                        execution_id,
                        workflow_id,
                        dag.name(),
                        dag.topo_order(),
                    );
                    self.insert_execution(record).await;
                }
                None => {
                    error!(
                        workflow_id = %workflow_id,
                        execution_id = %execution_id,
                        "Replayed execution references an unknown workflow"
                    );
                    self.insert_execution(ExecutionRecord::new(
                        execution_id,
                        workflow_id,
                        "unresolved",
                        &[],
                    ))
                    .await;
                    self.quarantine(workflow_id, Some(execution_id), report).await;
                }
            },

            EventRecord::ExecutionCompleted { execution_id, .. } => {
                self.with_execution_mut(execution_id, |exec| {
                    exec.status = ExecutionStatus::Completed;
                    exec.completed_at = Some(chrono::Utc::now());
                })
                .await;
            }

            EventRecord::ExecutionFailed { execution_id, .. } => {
                self.with_execution_mut(execution_id, |exec| {
                    exec.status = ExecutionStatus::Failed;
                    exec.completed_at = Some(chrono::Utc::now());
                })
                .await;
            }

            EventRecord::ExecutionCancelled { execution_id, .. } => {
                self.with_execution_mut(execution_id, |exec| {
                    exec.status = ExecutionStatus::Cancelled;
                    exec.completed_at = Some(chrono::Utc::now());
                })
                .await;
            }

            EventRecord::NodeScheduled {
                execution_id,
                node_id,
                server,
                ..
            } => {
                self.replay_node_transition(execution_id, node_id, NodeState::Scheduled, report, |node| {
                    node.assigned_server = Some(server);
                })
                .await;
            }

            EventRecord::NodeDispatched {
                execution_id,
                node_id,
                task_id,
                ..
            } => {
                let applied = self
                    .replay_node_transition(execution_id, node_id, NodeState::Running, report, |node| {
                        node.task_id = Some(task_id);
                    })
                    .await;
                if applied {
                    self.index_task(task_id, execution_id, node_id).await;
                }
            }

            EventRecord::NodeProgress {
                execution_id,
                node_id,
                progress,
                ..
            } => {
                self.with_execution_mut(execution_id, |exec| {
                    if let Some(node) = exec.node_mut(node_id) {
                        if node.state == NodeState::Running {
                            node.progress = progress.clamp(0.0, 1.0);
                        }
                    }
                })
                .await;
            }

            EventRecord::NodeCompleted {
                execution_id,
                node_id,
                outputs,
                ..
            } => {
                // Every referenced output must have been re-registered by
                // an earlier DataCreated record; anything else is a hole
                // in the log and poisons the workflow.
                let missing: Vec<Uuid> = outputs
                    .iter()
                    .filter(|o| !self.registry.contains(o.data_uuid))
                    .map(|o| o.data_uuid)
                    .collect();
                if !missing.is_empty() {
                    error!(
                        execution_id = %execution_id,
                        node_id = %node_id,
                        missing = ?missing,
                        "Replayed completion references unresolvable DataRefs"
                    );
                    self.quarantine_execution(execution_id, report).await;
                    return;
                }

                let applied = self
                    .replay_node_transition(execution_id, node_id, NodeState::Done, report, |node| {
                        node.progress = 1.0;
                        for output in &outputs {
                            node.outputs.insert(
                                output.name.clone(),
                                crate::state::OutputSlot {
                                    data_uuid: output.data_uuid,
                                    inline: output.inline.clone(),
                                },
                            );
                        }
                    })
                    .await;

                if applied {
                    // Rebuild session affinity from the completion.
                    let server = {
                        let executions = self.executions.read().await;
                        executions
                            .get(&execution_id)
                            .and_then(|e| e.node(node_id))
                            .and_then(|n| n.assigned_server.clone())
                    };
                    let workflow_id = {
                        let executions = self.executions.read().await;
                        executions.get(&execution_id).map(|e| e.workflow_id)
                    };
                    if let (Some(server), Some(workflow_id)) = (server, workflow_id) {
                        if let Some(dag) = self.workflow(workflow_id).await {
                            if let Some(hint) = dag.node(node_id).and_then(|n| n.session_hint()) {
                                self.remember_affinity(hint, &server).await;
                            }
                        }
                    }
                }
            }

            EventRecord::NodeFailed {
                execution_id,
                node_id,
                error,
                ..
            } => {
                self.replay_node_transition(execution_id, node_id, NodeState::Failed, report, |node| {
                    node.last_error = Some(error);
                })
                .await;
            }

            EventRecord::NodeRetrying {
                execution_id,
                node_id,
                retry_count,
                ..
            } => {
                self.replay_node_transition(execution_id, node_id, NodeState::Retrying, report, |node| {
                    node.retry_count = retry_count;
                })
                .await;
            }

            EventRecord::NodeCancelled {
                execution_id,
                node_id,
                ..
            } => {
                self.with_execution_mut(execution_id, |exec| {
                    if let Some(node) = exec.node_mut(node_id) {
                        if node.state.can_transition_to(NodeState::Cancelled) {
                            let _ = node.transition(NodeState::Cancelled);
                        }
                        node.claimed = true;
                    }
                })
                .await;
            }

            EventRecord::DataCreated { data_ref, .. } => {
                if let Err(e) = self.registry.register(data_ref.clone()) {
                    warn!(data_uuid = %data_ref.uuid, error = %e, "Replayed DataRef already present");
                }
            }

            EventRecord::DataTierChanged { data_uuid, to, .. } => {
                if self.registry.set_tier(data_uuid, to).is_err() {
                    error!(data_uuid = %data_uuid, "Replayed tier change references unknown DataRef");
                }
            }

            EventRecord::DataRetired { data_uuid, .. } => {
                if self.registry.retire(data_uuid).is_err() {
                    error!(data_uuid = %data_uuid, "Replayed retirement references unknown DataRef");
                }
            }

            EventRecord::ServerRegistered {
                address,
                capabilities,
                ..
            } => {
                let mut server = ServerInfo::new(&address);
                server.capabilities = capabilities;
                self.fleet.upsert(server);
            }

            EventRecord::ServerRemoved { address, .. } => {
                self.fleet.remove(&address);
            }
        }
    }

    /// Apply one replayed node transition; inconsistency quarantines the
    /// execution rather than guessing.
    async fn replay_node_transition(
        &self,
        execution_id: Uuid,
        node_id: Uuid,
        to: NodeState,
        report: &mut RecoveryReport,
        after: impl FnOnce(&mut crate::state::NodeExecution),
    ) -> bool {
        let outcome = self
            .with_execution_mut(execution_id, |exec| match exec.node_mut(node_id) {
                Some(node) => node.transition(to).map(|_| node).map(after).is_ok(),
                None => false,
            })
            .await;

        match outcome {
            Some(true) => true,
            _ => {
                error!(
                    execution_id = %execution_id,
                    node_id = %node_id,
                    to = %to,
                    "Replayed transition does not apply to recovered state"
                );
                self.quarantine_execution(execution_id, report).await;
                false
            }
        }
    }

    async fn quarantine_execution(&self, execution_id: Uuid, report: &mut RecoveryReport) {
        let workflow_id = self
            .with_execution_mut(execution_id, |exec| {
                exec.status = ExecutionStatus::Quarantined;
                exec.workflow_id
            })
            .await;
        if let Some(workflow_id) = workflow_id {
            self.quarantine(workflow_id, Some(execution_id), report).await;
        }
    }

    async fn quarantine(
        &self,
        workflow_id: Uuid,
        execution_id: Option<Uuid>,
        report: &mut RecoveryReport,
    ) {
        if let Some(execution_id) = execution_id {
            self.with_execution_mut(execution_id, |exec| {
                exec.status = ExecutionStatus::Quarantined;
            })
            .await;
        }
        self.quarantine_workflow(workflow_id).await;
        if !report.quarantined.contains(&workflow_id) {
            report.quarantined.push(workflow_id);
        }
    }

    /// Resume every non-terminal execution: respawn drivers for nodes
    /// that were pending or mid-retry, and reconcile dispatched tasks
    /// against their server's status endpoint.
    async fn resume_in_flight(&self, report: &mut RecoveryReport) {
        let executions: Vec<ExecutionRecord> = self
            .executions
            .read()
            .await
            .values()
            .filter(|e| e.status == ExecutionStatus::Running)
            .cloned()
            .collect();

        for exec in executions {
            let Some(dag) = self.workflow(exec.workflow_id).await else {
                error!(
                    execution_id = %exec.execution_id,
                    workflow_id = %exec.workflow_id,
                    "Live execution lost its workflow definition"
                );
                self.quarantine(exec.workflow_id, Some(exec.execution_id), report)
                    .await;
                continue;
            };

            for node in exec.nodes.values() {
                match node.state {
                    NodeState::Pending => {
                        let ready = dag.parents(node.node_id).iter().all(|p| {
                            exec.node(*p)
                                .map(|n| n.state == NodeState::Done)
                                .unwrap_or(false)
                        });
                        if ready {
                            self.claim_and_spawn(&dag, exec.execution_id, node.node_id).await;
                            report.nodes_resumed += 1;
                        }
                    }

                    NodeState::Retrying => {
                        self.claim_and_spawn(&dag, exec.execution_id, node.node_id).await;
                        report.nodes_resumed += 1;
                    }

                    NodeState::Failed => {
                        // Crashed between the failure and the retry
                        // decision; make the decision now.
                        let engine = self.handle();
                        let dag = dag.clone();
                        let (execution_id, node_id, attempt) =
                            (exec.execution_id, node.node_id, node.retry_count);
                        report.nodes_resumed += 1;
                        tokio::spawn(async move {
                            let retry = dag.execution().retry.clone();
                            if attempt < retry.max_retries {
                                let cancel = engine.cancel_token(execution_id).await;
                                let verdict = engine
                                    .resume_retry(&dag, execution_id, node_id, attempt, &retry, &cancel)
                                    .await;
                                if let Err(e) = verdict {
                                    error!(node_id = %node_id, error = %e, "Retry resumption failed");
                                }
                            } else if let Err(e) =
                                engine.fail_terminally(&dag, execution_id, node_id).await
                            {
                                error!(node_id = %node_id, error = %e, "Terminal failure resumption failed");
                            }
                        });
                    }

                    NodeState::Scheduled => {
                        // Dispatched (maybe) but never acknowledged; the
                        // documented behavior is to redispatch, charged
                        // against the node's retry budget.
                        let engine = self.handle();
                        let dag = dag.clone();
                        let (execution_id, node_id, attempt) =
                            (exec.execution_id, node.node_id, node.retry_count);
                        report.nodes_resumed += 1;
                        tokio::spawn(async move {
                            let cancel = engine.cancel_token(execution_id).await;
                            let retry = dag.execution().retry.clone();
                            match engine
                                .account_failure(
                                    &dag,
                                    execution_id,
                                    node_id,
                                    attempt,
                                    &retry,
                                    "restart before dispatch acknowledgement",
                                    &cancel,
                                )
                                .await
                            {
                                Ok(crate::engine::FailureVerdict::RetryScheduled) => {
                                    engine.spawn_node(dag.clone(), execution_id, node_id);
                                }
                                Ok(_) => {}
                                Err(e) => {
                                    error!(node_id = %node_id, error = %e, "Redispatch resumption failed")
                                }
                            }
                        });
                    }

                    NodeState::Running => {
                        if let (Some(server), Some(task_id)) =
                            (node.assigned_server.clone(), node.task_id)
                        {
                            report.tasks_reconciled += 1;
                            self.spawn_reconcile(
                                dag.clone(),
                                exec.execution_id,
                                node.node_id,
                                server,
                                task_id,
                            );
                        } else {
                            error!(
                                execution_id = %exec.execution_id,
                                node_id = %node.node_id,
                                "Running node recovered without a task id"
                            );
                            self.quarantine(exec.workflow_id, Some(exec.execution_id), report)
                                .await;
                        }
                    }

                    NodeState::Done | NodeState::Cancelled => {}
                }
            }
        }
    }

    async fn claim_and_spawn(&self, dag: &Arc<WorkflowDag>, execution_id: Uuid, node_id: Uuid) {
        self.with_execution_mut(execution_id, |exec| {
            if let Some(node) = exec.node_mut(node_id) {
                node.claimed = true;
            }
        })
        .await;
        self.spawn_node(dag.clone(), execution_id, node_id);
    }

    /// Failed with budget left: log the retry, wait out the backoff,
    /// then hand the node back to a fresh driver.
    async fn resume_retry(
        &self,
        dag: &Arc<WorkflowDag>,
        execution_id: Uuid,
        node_id: Uuid,
        attempt: u32,
        retry: &weft_core::config::RetryConfig,
        cancel: &tokio_util::sync::CancellationToken,
    ) -> Result<(), EngineError> {
        let delay = retry.delay_ms(attempt);
        self.log_transition(
            execution_id,
            node_id,
            EventRecord::NodeRetrying {
                execution_id,
                node_id,
                retry_count: attempt + 1,
                delay_ms: delay,
                timestamp: chrono::Utc::now(),
            },
            NodeState::Retrying,
            |_| {},
        )
        .await?;
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = tokio::time::sleep(jittered(delay)) => {}
        }
        self.spawn_node(dag.clone(), execution_id, node_id);
        Ok(())
    }

    /// Poll the owning server for a task we were waiting on when the
    /// process died, and apply whatever it says.
    fn spawn_reconcile(
        &self,
        dag: Arc<WorkflowDag>,
        execution_id: Uuid,
        node_id: Uuid,
        server: String,
        task_id: Uuid,
    ) {
        let engine = self.handle();
        tokio::spawn(async move {
            let view = engine.transport.poll_status(&server, task_id).await;
            info!(
                execution_id = %execution_id,
                node_id = %node_id,
                task_id = %task_id,
                server = %server,
                outcome = ?view.as_ref().map(|v| v.status),
                "Reconciled outstanding task"
            );

            let result = match view {
                Ok(view) => match view.status {
                    RemoteTaskStatus::Complete => {
                        let outcome = TaskOutcome::Complete {
                            outputs: view.outputs.unwrap_or_default(),
                            duration_ms: view.duration_ms.unwrap_or(0),
                        };
                        engine
                            .handle_outcome(&dag, execution_id, node_id, &server, outcome)
                            .await
                    }
                    RemoteTaskStatus::Failed => {
                        let outcome = TaskOutcome::Failed {
                            error: view
                                .error
                                .unwrap_or_else(|| "task failed while orchestrator was down".to_string()),
                            server_fault: false,
                        };
                        engine
                            .handle_outcome(&dag, execution_id, node_id, &server, outcome)
                            .await
                    }
                    RemoteTaskStatus::Cancelled => {
                        let outcome = TaskOutcome::Failed {
                            error: "task cancelled on server".to_string(),
                            server_fault: false,
                        };
                        engine
                            .handle_outcome(&dag, execution_id, node_id, &server, outcome)
                            .await
                    }
                    RemoteTaskStatus::Accepted | RemoteTaskStatus::Running => {
                        engine
                            .wait_for_reconciled(dag.clone(), execution_id, node_id, server.clone(), task_id)
                            .await;
                        Ok(())
                    }
                },
                Err(e) => {
                    let outcome = TaskOutcome::Failed {
                        error: format!("status poll failed: {}", e),
                        server_fault: true,
                    };
                    engine
                        .handle_outcome(&dag, execution_id, node_id, &server, outcome)
                        .await
                }
            };

            if let Err(e) = result {
                error!(node_id = %node_id, error = %e, "Reconciliation failed");
            }
        });
    }

    /// The task is still running remotely: re-register the continuation
    /// and wait for its callback under the configured timeout.
    async fn wait_for_reconciled(
        &self,
        dag: Arc<WorkflowDag>,
        execution_id: Uuid,
        node_id: Uuid,
        server: String,
        task_id: Uuid,
    ) {
        let cancel = self.cancel_token(execution_id).await;
        let rx = self.router.register(task_id).await;
        self.index_task(task_id, execution_id, node_id).await;

        let timeout =
            std::time::Duration::from_millis(dag.execution().callback_timeout_ms);
        let outcome = tokio::select! {
            _ = cancel.cancelled() => {
                self.router.abandon(task_id).await;
                self.task_index.write().await.remove(&task_id);
                return;
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
                        error: "no callback before the configured timeout".to_string(),
                        server_fault: true,
                    }
                }
            },
        };
        self.task_index.write().await.remove(&task_id);

        if let Err(e) = self
            .handle_outcome(&dag, execution_id, node_id, &server, outcome)
            .await
        {
            error!(node_id = %node_id, error = %e, "Reconciled callback handling failed");
        }
    }
}

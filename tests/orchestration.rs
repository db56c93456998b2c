//! End-to-end scheduling scenarios driven through a scripted transport.

mod common;

use std::sync::Arc;

use uuid::Uuid;

use common::*;
use weft_data::{DataRef, PayloadKind, Tier};
use weft_engine::{ExecutionStatus, NodeState};
use weft_protocol::{CallbackMessage, TaskOutput};
use weft_wal::{EventLog, EventRecord};

fn inline_out() -> Vec<TaskOutput> {
    vec![TaskOutput::Inline {
        name: "out".to_string(),
        value: serde_json::json!({"v": 1}),
    }]
}

/// Diamond: A completes, B fails twice then succeeds on the third
/// attempt, C succeeds immediately. D must be scheduled only after both
/// B and C are Done, verified against the event log ordering.
#[tokio::test]
async fn diamond_with_retries_schedules_join_last() {
    let wal = Arc::new(EventLog::in_memory().unwrap());
    let (transport, mut dispatches) = MockTransport::new();
    let engine = build_engine(wal, transport).await;

    let (spec, ids) = diamond_spec(3);
    let [_, id_b, _, _] = ids;
    let workflow_id = engine.define_workflow(spec).await.unwrap();
    let execution_id = engine.start_execution(workflow_id).await.unwrap();

    // Play the executor fleet.
    let executor = {
        let engine = engine.clone();
        tokio::spawn(async move {
            let mut b_failures = 0;
            while let Some(d) = dispatches.recv().await {
                wait_task_indexed(&engine, d.task_id).await;
                let message = if d.request.node_id == id_b && b_failures < 2 {
                    b_failures += 1;
                    CallbackMessage::failed(d.task_id, "transient executor error", false)
                } else {
                    CallbackMessage::complete(d.task_id, inline_out(), 5)
                };
                engine.handle_callback(message).await.unwrap();
            }
        })
    };

    let exec = wait_terminal(&engine, execution_id).await;
    executor.abort();

    assert_eq!(exec.status, ExecutionStatus::Completed);
    for id in ids {
        assert_eq!(exec.node(id).unwrap().state, NodeState::Done);
    }
    assert_eq!(exec.node(id_b).unwrap().retry_count, 2);

    // Log-order property: D's first scheduling sits after the
    // completions of both of its parents.
    let entries = engine.wal().replay().unwrap();
    let [_, _, id_c, id_d] = ids;
    let d_scheduled = entries
        .iter()
        .find(|e| {
            matches!(&e.record, EventRecord::NodeScheduled { node_id, .. } if *node_id == id_d)
        })
        .expect("d scheduled")
        .position;
    for parent in [id_b, id_c] {
        let parent_done = entries
            .iter()
            .find(|e| {
                matches!(&e.record, EventRecord::NodeCompleted { node_id, .. } if *node_id == parent)
            })
            .expect("parent completed")
            .position;
        assert!(
            parent_done < d_scheduled,
            "join node scheduled at {} before parent completed at {}",
            d_scheduled,
            parent_done
        );
    }
}

/// Chain where the first node burns its whole retry budget: the second
/// node must go straight to Cancelled without a single dispatch, and
/// the execution must report Failed.
#[tokio::test]
async fn exhausted_retries_cancel_dependents_without_dispatch() {
    let wal = Arc::new(EventLog::in_memory().unwrap());
    let (transport, mut dispatches) = MockTransport::new();
    let engine = build_engine(wal, transport).await;

    let (spec, id_a, id_b) = chain_spec(2);
    let workflow_id = engine.define_workflow(spec).await.unwrap();
    let execution_id = engine.start_execution(workflow_id).await.unwrap();

    let executor = {
        let engine = engine.clone();
        tokio::spawn(async move {
            while let Some(d) = dispatches.recv().await {
                wait_task_indexed(&engine, d.task_id).await;
                engine
                    .handle_callback(CallbackMessage::failed(d.task_id, "boom", false))
                    .await
                    .unwrap();
            }
        })
    };

    let exec = wait_terminal(&engine, execution_id).await;
    executor.abort();

    assert_eq!(exec.status, ExecutionStatus::Failed);
    assert_eq!(exec.node(id_a).unwrap().state, NodeState::Failed);
    assert_eq!(exec.node(id_a).unwrap().retry_count, 2);
    assert_eq!(exec.node(id_b).unwrap().state, NodeState::Cancelled);

    // The dependent was never even scheduled.
    let entries = engine.wal().replay().unwrap();
    assert!(!entries.iter().any(|e| matches!(
        &e.record,
        EventRecord::NodeScheduled { node_id, .. } if *node_id == id_b
    )));
}

/// Explicit cancellation: every non-terminal node flips to Cancelled,
/// the in-flight task gets a best-effort cancel, and nothing blocks on
/// the server acknowledging it.
#[tokio::test]
async fn cancel_execution_is_cooperative() {
    let wal = Arc::new(EventLog::in_memory().unwrap());
    let (transport, mut dispatches) = MockTransport::new();
    let engine = build_engine(wal, transport.clone()).await;

    let (spec, id_a, id_b) = chain_spec(1);
    let workflow_id = engine.define_workflow(spec).await.unwrap();
    let execution_id = engine.start_execution(workflow_id).await.unwrap();

    // First node is dispatched and left hanging.
    let d = next_dispatch(&mut dispatches).await;
    wait_task_indexed(&engine, d.task_id).await;

    engine
        .cancel_execution(execution_id, Some("operator request".to_string()))
        .await
        .unwrap();

    let exec = engine.execution(execution_id).await.unwrap();
    assert_eq!(exec.status, ExecutionStatus::Cancelled);
    assert_eq!(exec.node(id_a).unwrap().state, NodeState::Cancelled);
    assert_eq!(exec.node(id_b).unwrap().state, NodeState::Cancelled);

    // Best-effort cancel reaches the server without being awaited.
    for _ in 0..200 {
        if transport.cancelled.lock().unwrap().contains(&d.task_id) {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    }
    panic!("server never saw the cancel notification");
}

/// A late callback for a task that already timed out or was cancelled
/// is answered but changes nothing.
#[tokio::test]
async fn late_callback_is_ignored() {
    let wal = Arc::new(EventLog::in_memory().unwrap());
    let (transport, _dispatches) = MockTransport::new();
    let engine = build_engine(wal, transport).await;

    let known = engine
        .handle_callback(CallbackMessage::complete(Uuid::new_v4(), Vec::new(), 1))
        .await
        .unwrap();
    assert!(!known);
}

/// The external pressure hook logs every tier move before applying it,
/// and retirement gates the data-plane delete.
#[tokio::test]
async fn pressure_and_retirement_go_through_the_log() {
    let wal = Arc::new(EventLog::in_memory().unwrap());
    let (transport, _rx) = MockTransport::new();
    let engine = build_bare_engine(wal, transport);

    let data_ref = DataRef::new(
        "http://exec-a:9090",
        Uuid::new_v4(),
        2048,
        PayloadKind::Bytes,
    );
    let data_uuid = data_ref.uuid;
    engine.registry().register(data_ref).unwrap();

    let moved = engine.evict_under_pressure(4).await.unwrap();
    assert_eq!(moved, 1);
    assert_eq!(
        engine.registry().resolve(data_uuid).unwrap().tier,
        Tier::Disk
    );

    engine.retire_data(data_uuid).await.unwrap();
    engine.registry().remove(data_uuid).unwrap();

    let entries = engine.wal().replay().unwrap();
    assert!(entries.iter().any(|e| matches!(
        &e.record,
        EventRecord::DataTierChanged { data_uuid: id, to: Tier::Disk, .. } if *id == data_uuid
    )));
    assert!(entries.iter().any(|e| matches!(
        &e.record,
        EventRecord::DataRetired { data_uuid: id, .. } if *id == data_uuid
    )));
}

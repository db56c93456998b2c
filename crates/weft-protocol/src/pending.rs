use std::collections::HashMap;

use tokio::sync::{oneshot, Mutex};
use uuid::Uuid;

use crate::wire::TaskOutput;

/// Terminal result of a dispatched task, as resolved by its callback
/// (or synthesized on callback timeout by the engine).
#[derive(Debug)]
pub enum TaskOutcome {
    Complete {
        outputs: Vec<TaskOutput>,
        duration_ms: u64,
    },
    Failed {
        error: String,
        server_fault: bool,
    },
}

/// The pending-completion map.
///
/// A dispatch registers a continuation under its task id; the matching
/// inbound callback resolves it. Progress callbacks bypass this table;
/// only terminal outcomes consume the continuation.
pub struct CallbackRouter {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<TaskOutcome>>>,
}

impl CallbackRouter {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Register a continuation for a dispatched task.
    pub async fn register(&self, task_id: Uuid) -> oneshot::Receiver<TaskOutcome> {
        let (tx, rx) = oneshot::channel();
        self.pending.lock().await.insert(task_id, tx);
        rx
    }

    /// Resolve a pending task with its terminal outcome.
    /// Returns false if no continuation is waiting under this id.
    pub async fn resolve(&self, task_id: Uuid, outcome: TaskOutcome) -> bool {
        let entry = self.pending.lock().await.remove(&task_id);
        match entry {
            Some(tx) => {
                // Ignore send error (receiver dropped on timeout)
                let _ = tx.send(outcome);
                true
            }
            None => false,
        }
    }

    /// Drop a continuation without resolving it (timeout/cancel path).
    pub async fn abandon(&self, task_id: Uuid) {
        self.pending.lock().await.remove(&task_id);
    }

    /// Task ids still waiting for a callback.
    pub async fn pending_tasks(&self) -> Vec<Uuid> {
        self.pending.lock().await.keys().copied().collect()
    }
}

impl Default for CallbackRouter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn resolve_delivers_outcome() {
        let router = CallbackRouter::new();
        let task_id = Uuid::new_v4();

        let rx = router.register(task_id).await;
        assert!(
            router
                .resolve(
                    task_id,
                    TaskOutcome::Complete {
                        outputs: Vec::new(),
                        duration_ms: 17,
                    },
                )
                .await
        );

        match rx.await.unwrap() {
            TaskOutcome::Complete { duration_ms, .. } => assert_eq!(duration_ms, 17),
            other => panic!("expected Complete, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn resolve_unknown_task_is_false() {
        let router = CallbackRouter::new();
        assert!(
            !router
                .resolve(
                    Uuid::new_v4(),
                    TaskOutcome::Failed {
                        error: "late".to_string(),
                        server_fault: false,
                    },
                )
                .await
        );
    }

    #[tokio::test]
    async fn timeout_leaves_no_continuation_behind() {
        let router = CallbackRouter::new();
        let task_id = Uuid::new_v4();

        let rx = router.register(task_id).await;
        let waited =
            tokio::time::timeout(std::time::Duration::from_millis(10), rx).await;
        assert!(waited.is_err());

        router.abandon(task_id).await;
        assert!(router.pending_tasks().await.is_empty());
    }
}

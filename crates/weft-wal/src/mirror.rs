use std::sync::Arc;

use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::log::{EventLog, LogEntry, WalError};

/// Replication target for log records.
///
/// Mirrors strengthen durability beyond the local disk but are not part
/// of the recovery contract: a failed publish is logged and dropped,
/// never retried against the append path.
pub trait LogMirror: Send + Sync {
    fn publish<'a>(&'a self, entry: &'a LogEntry) -> BoxFuture<'a, Result<(), WalError>>;
}

/// Mirrors records to an external HTTP collector as JSON posts.
pub struct HttpMirror {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpMirror {
    pub fn new(endpoint: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.to_string(),
        }
    }
}

impl LogMirror for HttpMirror {
    fn publish<'a>(&'a self, entry: &'a LogEntry) -> BoxFuture<'a, Result<(), WalError>> {
        Box::pin(async move {
            let response = self
                .client
                .post(&self.endpoint)
                .json(entry)
                .send()
                .await
                .map_err(|e| WalError::Mirror(e.to_string()))?;

            if !response.status().is_success() {
                return Err(WalError::Mirror(format!(
                    "collector returned {}",
                    response.status()
                )));
            }
            Ok(())
        })
    }
}

/// Drain the log's live feed into a mirror until cancelled.
///
/// Runs detached from the append path so a slow collector can never
/// stall the orchestrator; if the feed overflows, the gap is logged and
/// mirroring continues from the current position.
pub fn spawn_mirror(
    log: &EventLog,
    mirror: Arc<dyn LogMirror>,
    cancel: CancellationToken,
) -> tokio::task::JoinHandle<()> {
    let mut rx = log.subscribe();
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    debug!("Mirror task stopped");
                    break;
                }
                received = rx.recv() => match received {
                    Ok(entry) => {
                        if let Err(e) = mirror.publish(&entry).await {
                            warn!(position = entry.position, error = %e, "Mirror publish failed");
                        }
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Mirror fell behind the log feed");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                }
            }
        }
    })
}

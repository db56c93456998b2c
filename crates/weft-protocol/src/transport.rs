use std::time::Duration;

use futures::future::BoxFuture;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use crate::wire::{DispatchAck, TaskRequest, TaskStatusView};

/// Outbound side of the task protocol.
///
/// Object-safe so the engine can be driven by an in-process fake in
/// tests; the production implementation is [`HttpTransport`].
pub trait TaskTransport: Send + Sync {
    /// `POST {server}/task` — returns the ack or a rejection.
    fn dispatch<'a>(
        &'a self,
        server: &'a str,
        request: TaskRequest,
    ) -> BoxFuture<'a, Result<DispatchAck, ProtocolError>>;

    /// `GET {server}/task/{id}` — reconciliation poll.
    fn poll_status<'a>(
        &'a self,
        server: &'a str,
        task_id: Uuid,
    ) -> BoxFuture<'a, Result<TaskStatusView, ProtocolError>>;

    /// `POST {server}/task/{id}/cancel` — best effort, fire and forget.
    fn cancel<'a>(
        &'a self,
        server: &'a str,
        task_id: Uuid,
    ) -> BoxFuture<'a, Result<(), ProtocolError>>;
}

/// reqwest-backed transport against executor servers.
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    pub fn new(request_timeout: Duration) -> Result<Self, ProtocolError> {
        let client = reqwest::Client::builder()
            .timeout(request_timeout)
            .build()
            .map_err(|e| ProtocolError::Http(e.to_string()))?;
        Ok(Self { client })
    }
}

impl TaskTransport for HttpTransport {
    fn dispatch<'a>(
        &'a self,
        server: &'a str,
        request: TaskRequest,
    ) -> BoxFuture<'a, Result<DispatchAck, ProtocolError>> {
        Box::pin(async move {
            let url = format!("{}/task", server.trim_end_matches('/'));
            debug!(server, node_id = %request.node_id, "Dispatching task");

            let response = self
                .client
                .post(&url)
                .json(&request)
                .send()
                .await
                .map_err(|e| ProtocolError::Http(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ProtocolError::Rejected {
                    status: status.as_u16(),
                    message,
                });
            }

            response
                .json::<DispatchAck>()
                .await
                .map_err(|e| ProtocolError::InvalidResponse(e.to_string()))
        })
    }

    fn poll_status<'a>(
        &'a self,
        server: &'a str,
        task_id: Uuid,
    ) -> BoxFuture<'a, Result<TaskStatusView, ProtocolError>> {
        Box::pin(async move {
            let url = format!("{}/task/{}", server.trim_end_matches('/'), task_id);
            let response = self
                .client
                .get(&url)
                .send()
                .await
                .map_err(|e| ProtocolError::Http(e.to_string()))?;

            let status = response.status();
            if !status.is_success() {
                let message = response.text().await.unwrap_or_default();
                return Err(ProtocolError::Rejected {
                    status: status.as_u16(),
                    message,
                });
            }

            response
                .json::<TaskStatusView>()
                .await
                .map_err(|e| ProtocolError::InvalidResponse(e.to_string()))
        })
    }

    fn cancel<'a>(
        &'a self,
        server: &'a str,
        task_id: Uuid,
    ) -> BoxFuture<'a, Result<(), ProtocolError>> {
        Box::pin(async move {
            let url = format!("{}/task/{}/cancel", server.trim_end_matches('/'), task_id);
            self.client
                .post(&url)
                .send()
                .await
                .map_err(|e| ProtocolError::Http(e.to_string()))?;
            Ok(())
        })
    }
}

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("Transport error: {0}")]
    Http(String),

    #[error("Dispatch rejected ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("Unexpected response body: {0}")]
    InvalidResponse(String),

    #[error("No callback before the configured timeout")]
    CallbackTimeout,
}

impl ProtocolError {
    /// Whether another dispatch attempt could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        match self {
            ProtocolError::Http(_) | ProtocolError::CallbackTimeout => true,
            ProtocolError::Rejected { status, .. } => *status >= 500 || *status == 429,
            ProtocolError::InvalidResponse(_) => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability() {
        assert!(ProtocolError::Http("connection refused".into()).is_retryable());
        assert!(ProtocolError::CallbackTimeout.is_retryable());
        assert!(ProtocolError::Rejected {
            status: 503,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProtocolError::Rejected {
            status: 400,
            message: String::new()
        }
        .is_retryable());
        assert!(!ProtocolError::InvalidResponse("garbage".into()).is_retryable());
    }
}

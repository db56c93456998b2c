//! The callback task protocol.
//!
//! Dispatching a node and hearing back about it are one logical
//! request/response pair split across two HTTP exchanges: the outbound
//! `POST /task` (acknowledged immediately) and the inbound callback the
//! executor sends to our gateway later. [`pending::CallbackRouter`] is
//! the continuation table that stitches the two halves together.

pub mod pending;
pub mod transport;
pub mod wire;

pub use pending::{CallbackRouter, TaskOutcome};
pub use transport::{HttpTransport, ProtocolError, TaskTransport};
pub use wire::{
    ApiError, ApiResponse, CallbackMessage, DispatchAck, RemoteTaskStatus, TaskInput, TaskOutput,
    TaskRequest, TaskStatusView,
};

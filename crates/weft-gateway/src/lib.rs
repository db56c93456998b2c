//! HTTP gateway: workflow management, execution control, the inbound
//! task-callback endpoint, data-plane hooks, and fleet membership.
//! Every JSON response is wrapped in the `{success, data, error}`
//! envelope from `weft-protocol`.

pub mod routes;
pub mod server;
pub mod state;

pub use server::GatewayServer;
pub use state::AppState;

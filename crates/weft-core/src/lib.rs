//! Shared foundation for the Weft orchestrator: configuration loading,
//! the broadcast event bus, and small cross-crate types.

pub mod config;
pub mod event;

pub use config::{AppConfig, GatewayConfig, RetryConfig, TokenConfig, WalConfig};
pub use event::EventBus;

//! Data-plane metadata for the Weft orchestrator.
//!
//! The orchestrator never moves payload bytes itself. It tracks every
//! artifact produced during execution as an immutable [`DataRef`] handle
//! (identity, location, size, type tag, storage tier) and authorizes
//! server-to-server transfers with short-lived signed [`AccessToken`]s.

pub mod registry;
pub mod token;

pub use registry::{DataError, DataRef, DataRegistry, PayloadKind, TensorDType, Tier};
pub use token::{AccessToken, Permissions, TokenError, TokenService};

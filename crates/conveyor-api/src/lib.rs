//! HTTP surface for Conveyor.
//!
//! Live build streams (WebSocket and plain text), webhook trigger
//! registration and health endpoints.

pub mod error;
pub mod routes;
pub mod state;
pub mod stream;
pub mod ws;

pub use routes::hooks::HookTrigger;
pub use state::AppState;

//! API routes.

pub mod health;
pub mod hooks;

use std::sync::Arc;

use axum::Router;
use axum::routing::get;

use crate::AppState;
use crate::stream::plain_stream_handler;
use crate::ws::ws_handler;
use hooks::HookTrigger;

/// Build the main router: live streams, webhook endpoints, health.
pub fn router(state: AppState, triggers: Vec<Arc<dyn HookTrigger>>) -> Router {
    Router::new()
        .route("/", get(plain_stream_handler))
        .route("/ws", get(ws_handler))
        .nest("/hooks", hooks::router(triggers))
        .merge(health::router())
        .with_state(state)
}

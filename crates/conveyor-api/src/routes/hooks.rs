//! Webhook endpoints: triggers turn provider notifications into
//! builds.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use axum::extract::State;
use axum::http::{HeaderMap, StatusCode};
use axum::routing::post;
use bytes::Bytes;
use tracing::{info, warn};

use crate::AppState;
use crate::error::ApiError;
use conveyor_core::Build;

/// A webhook trigger: inspects provider deliveries for one project and
/// decides whether they start a build. Payload parsing and signature
/// validation live entirely in implementations.
#[async_trait]
pub trait HookTrigger: Send + Sync {
    /// Route this trigger's deliveries arrive on, relative to
    /// `/hooks`, e.g. `/github`.
    fn endpoint(&self) -> &str;

    /// Inspect one delivery. `Ok(None)` means the delivery is not for
    /// this trigger; a returned build is handed to the queue.
    async fn process(
        &self,
        headers: &HeaderMap,
        body: &Bytes,
    ) -> conveyor_core::Result<Option<Arc<Build>>>;
}

/// Register one route per endpoint. All triggers sharing an endpoint
/// are grouped, and the aggregated list becomes that handler's
/// configuration.
pub fn router(triggers: Vec<Arc<dyn HookTrigger>>) -> Router<AppState> {
    let mut router = Router::new();
    for (endpoint, group) in group_by_endpoint(triggers) {
        info!(endpoint = %endpoint, triggers = group.len(), "registering webhook endpoint");
        router = router.route(
            &endpoint,
            post(move |State(state): State<AppState>, headers: HeaderMap, body: Bytes| {
                hook_handler(state, group.clone(), headers, body)
            }),
        );
    }
    router
}

fn group_by_endpoint(
    triggers: Vec<Arc<dyn HookTrigger>>,
) -> HashMap<String, Vec<Arc<dyn HookTrigger>>> {
    let mut by_endpoint: HashMap<String, Vec<Arc<dyn HookTrigger>>> = HashMap::new();
    for trigger in triggers {
        by_endpoint
            .entry(trigger.endpoint().to_string())
            .or_default()
            .push(trigger);
    }
    by_endpoint
}

async fn hook_handler(
    state: AppState,
    triggers: Vec<Arc<dyn HookTrigger>>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<StatusCode, ApiError> {
    for trigger in &triggers {
        if let Some(build) = trigger.process(&headers, &body).await? {
            info!(
                project = %build.project().name,
                hash = %build.commit_hash(),
                "webhook triggered build"
            );
            state.queue.add_build(&build);
            return Ok(StatusCode::OK);
        }
    }
    warn!("webhook delivery matched no trigger");
    Ok(StatusCode::OK)
}

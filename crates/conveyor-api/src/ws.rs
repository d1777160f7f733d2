//! Structured live update stream over WebSocket.
//!
//! `GET /ws?project=..&hash=..` subscribes to a build and forwards its
//! updates as JSON records. Two optional comma-separated allow-lists
//! narrow what is forwarded: `state_filter` gates job state changes,
//! `filter` gates the remaining per-job updates. Build-scoped updates
//! always pass.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::response::Response;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use tracing::{debug, info, warn};

use crate::AppState;
use conveyor_core::{Delivery, Update};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    project: Option<String>,
    hash: Option<String>,
    state_filter: Option<String>,
    filter: Option<String>,
}

/// Job-name allow-list parsed from a query parameter. An absent
/// parameter accepts everything.
#[derive(Debug, Clone)]
pub(crate) struct NameFilter(Option<Vec<String>>);

impl NameFilter {
    pub(crate) fn from_param(param: Option<&str>) -> Self {
        Self(param.map(|p| p.split(',').map(str::to_string).collect()))
    }

    pub(crate) fn accepts(&self, job_name: &str) -> bool {
        match &self.0 {
            None => true,
            Some(names) => names.iter().any(|n| n == job_name),
        }
    }
}

/// Decide whether one update is forwarded to this subscriber.
pub(crate) fn forward_update(
    update: &Update,
    state_filter: &NameFilter,
    filter: &NameFilter,
) -> bool {
    match update {
        // not interesting for stream subscribers
        Update::JobCreated { .. } => false,
        Update::JobState { job, .. } => state_filter.accepts(job),
        Update::StdOut { job, .. } => filter.accepts(job),
        Update::BuildState { .. } | Update::BuildSource { .. } => true,
    }
}

/// WebSocket upgrade for the structured update stream.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, params))
}

async fn handle_socket(mut socket: WebSocket, state: AppState, params: WsParams) {
    let build = params
        .project
        .as_deref()
        .zip(params.hash.as_deref())
        .and_then(|(project, hash)| state.resolve_build(project, hash));

    let Some(build) = build else {
        debug!("websocket subscriber for unknown build");
        let _ = socket.send(Message::Text("no such build\n".into())).await;
        return;
    };

    let state_filter = NameFilter::from_param(params.state_filter.as_deref());
    let filter = NameFilter::from_param(params.filter.as_deref());

    let (watcher, mut updates) = conveyor_core::ChannelWatcher::new();
    let watcher_id = build.watch(watcher);
    info!(hash = %build.commit_hash(), "websocket subscriber connected");

    let (mut sink, mut source) = socket.split();
    loop {
        tokio::select! {
            delivery = updates.recv() => match delivery {
                Some(Delivery::Update(update)) => {
                    if !forward_update(&update, &state_filter, &filter) {
                        continue;
                    }
                    match serde_json::to_string(&update) {
                        Ok(json) => {
                            if sink.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                        Err(err) => warn!(error = %err, "failed to encode update"),
                    }
                }
                // build completed: the stream ends here
                Some(Delivery::Closed) | None => break,
            },
            msg = source.next() => match msg {
                Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                // incoming client messages are ignored
                _ => {}
            },
        }
    }

    build.unwatch(watcher_id);
    info!(hash = %build.commit_hash(), "websocket subscriber disconnected");
    let _ = sink.close().await;
}

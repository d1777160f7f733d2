//! Plain-text job log stream.
//!
//! `GET /?project=..&hash=..&job=..` streams one job's raw output plus
//! a final colored state line as a chunked body, so output is visible
//! as it happens. Missing or unknown parameters produce a one-line
//! diagnostic body instead; no error status is used for these cases.

use std::convert::Infallible;
use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use futures::stream;
use serde::Deserialize;
use tracing::info;

use crate::AppState;
use conveyor_core::{ChannelWatcher, Delivery, Job, Update, WatcherId};

#[derive(Debug, Deserialize)]
pub struct StreamParams {
    project: Option<String>,
    hash: Option<String>,
    job: Option<String>,
}

pub async fn plain_stream_handler(
    Query(params): Query<StreamParams>,
    State(state): State<AppState>,
) -> Response {
    let Some(project_name) = params.project else {
        return diagnostic("no project given");
    };
    let Some(hash) = params.hash else {
        return diagnostic("no build hash given");
    };
    let Some(job_name) = params.job else {
        return diagnostic("no job given");
    };

    if state.project(&project_name).is_none() {
        return diagnostic("unknown project requested");
    }

    let Some(build) = state.resolve_build(&project_name, &hash) else {
        return diagnostic(&format!("no such build: project {project_name} [{hash}]"));
    };

    let Some(job) = build.job(&job_name) else {
        return diagnostic(&format!(
            "unknown job in project {project_name} [{hash}]: {job_name}"
        ));
    };

    let (watcher, updates) = ChannelWatcher::new();
    let guard = WatchGuard {
        job: job.clone(),
        id: job.watch(watcher),
    };
    info!(job = %job.name(), hash = %hash, "log stream subscriber connected");

    let body = Body::from_stream(stream::unfold(
        (updates, guard),
        |(mut updates, guard)| async move {
            loop {
                match updates.recv().await {
                    Some(Delivery::Update(update)) => {
                        if let Some(chunk) = render(&update) {
                            return Some((Ok::<_, Infallible>(chunk), (updates, guard)));
                        }
                    }
                    Some(Delivery::Closed) | None => return None,
                }
            }
        },
    ));

    ([(header::CONTENT_TYPE, "text/plain")], body).into_response()
}

fn diagnostic(line: &str) -> Response {
    ([(header::CONTENT_TYPE, "text/plain")], format!("{line}\n")).into_response()
}

/// Render one update as response bytes; `None` skips it.
fn render(update: &Update) -> Option<Vec<u8>> {
    match update {
        Update::StdOut { data, .. } => Some(data.as_bytes().to_vec()),
        Update::JobState { state, text, .. } => {
            if state.is_errored() {
                Some(format!("\x1b[31merror:\x1b[m {text}\n").into_bytes())
            } else if state.is_succeeded() {
                Some(format!("\x1b[32msuccess:\x1b[m {text}\n").into_bytes())
            } else if state.is_finished() {
                // finished but neither succeeded nor errored: a failure
                Some(format!("\x1b[31mfailed:\x1b[m {text}\n").into_bytes())
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Unregisters the watcher when the response body is dropped, whether
/// the stream ended normally or the client disconnected mid-stream.
struct WatchGuard {
    job: Arc<Job>,
    id: WatcherId,
}

impl Drop for WatchGuard {
    fn drop(&mut self) {
        self.job.unwatch(self.id);
    }
}

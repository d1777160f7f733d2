//! Build and job lifecycle updates.
//!
//! Every state change a build or job goes through is published as an
//! [`Update`] to the watchers registered on it. Updates are immutable
//! once published and arrive in publication order; the wire form is the
//! serde-tagged shape (`kind` discriminant plus the variant payload).

use serde::{Deserialize, Serialize};

/// Lifecycle state of a build or job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    /// Admitted but not yet dispatched.
    Waiting,
    Running,
    Success,
    /// Ran to completion but the work itself failed.
    Failure,
    /// Never ran to completion (overload, infrastructure problem, ...).
    Error,
    /// Cancelled while running.
    Aborted,
}

impl RunStatus {
    pub fn is_finished(&self) -> bool {
        matches!(
            self,
            RunStatus::Success | RunStatus::Failure | RunStatus::Error | RunStatus::Aborted
        )
    }

    pub fn is_succeeded(&self) -> bool {
        matches!(self, RunStatus::Success)
    }

    pub fn is_errored(&self) -> bool {
        matches!(self, RunStatus::Error)
    }
}

/// One lifecycle event published by a build or job.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Update {
    /// A job was attached to the build.
    JobCreated { job: String },
    /// A job changed state.
    JobState {
        job: String,
        state: RunStatus,
        text: String,
    },
    /// Raw output produced by a job, forwarded verbatim.
    StdOut { job: String, data: String },
    /// The build as a whole changed state. Never filtered on streams.
    BuildState { state: RunStatus, text: String },
    /// Where the build's sources come from. Never filtered on streams.
    BuildSource {
        clone_url: String,
        repo_url: Option<String>,
        author: Option<String>,
        branch: Option<String>,
    },
}

impl Update {
    /// The job this update is scoped to, if it is a per-job update.
    pub fn job_name(&self) -> Option<&str> {
        match self {
            Update::JobCreated { job }
            | Update::JobState { job, .. }
            | Update::StdOut { job, .. } => Some(job),
            Update::BuildState { .. } | Update::BuildSource { .. } => None,
        }
    }
}

/// Item delivered to a watcher: a live update, or the end-of-stream
/// marker after which no further deliveries happen for that entity.
#[derive(Debug, Clone)]
pub enum Delivery {
    Update(Update),
    Closed,
}

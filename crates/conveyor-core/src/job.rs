//! A single schedulable unit of work within a build.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use tokio::sync::Notify;
use tracing::debug;

use crate::build::Build;
use crate::runner::JobRunner;
use crate::update::{RunStatus, Update};
use crate::watcher::{WatchHub, Watcher, WatcherId};
use crate::{Error, ResourceId};

/// One unit of work belonging to a build.
///
/// A job publishes its lifecycle as [`Update`]s to its own watchers and
/// mirrors every update to the owning build, so watching the build
/// observes all of its jobs. Once finished it closes its hub and is
/// never admitted again.
pub struct Job {
    id: ResourceId,
    name: String,
    build: Weak<Build>,
    runner: Arc<dyn JobRunner>,
    hub: WatchHub,
    completed: AtomicBool,
}

impl Job {
    pub(crate) fn new(
        name: impl Into<String>,
        build: Weak<Build>,
        runner: Arc<dyn JobRunner>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id: ResourceId::new(),
            name: name.into(),
            build,
            runner,
            hub: WatchHub::new(),
            completed: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> ResourceId {
        self.id
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The owning build, unless it has already been dropped.
    pub fn build(&self) -> Option<Arc<Build>> {
        self.build.upgrade()
    }

    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    pub fn watch(&self, watcher: Arc<dyn Watcher>) -> WatcherId {
        self.hub.watch(watcher)
    }

    pub fn unwatch(&self, id: WatcherId) {
        self.hub.unwatch(id)
    }

    /// Publish an update to this job's watchers and mirror it to the
    /// owning build's watchers.
    pub fn publish(&self, update: Update) {
        self.hub.publish(update.clone());
        if let Some(build) = self.build() {
            build.publish(update);
        }
    }

    /// Publish a chunk of raw output. Called by the runner.
    pub fn stdout(&self, data: impl Into<String>) {
        self.publish(Update::StdOut {
            job: self.name.clone(),
            data: data.into(),
        });
    }

    fn set_state(&self, state: RunStatus, text: String) {
        self.publish(Update::JobState {
            job: self.name.clone(),
            state,
            text,
        });
    }

    /// Drive the job to completion, honoring `cancel`.
    ///
    /// Cancellation is cooperative: it takes effect at the runner's
    /// next suspension point and ends the job in the `aborted` state.
    pub async fn run(self: &Arc<Self>, cancel: &Notify) -> RunStatus {
        self.set_state(RunStatus::Running, "job started".to_string());

        let (status, text) = tokio::select! {
            res = self.runner.run(self) => match res {
                Ok(()) => (RunStatus::Success, "job completed".to_string()),
                Err(Error::ExecutionFailed(msg)) => (RunStatus::Failure, msg),
                Err(err) => (RunStatus::Error, err.to_string()),
            },
            _ = cancel.notified() => (RunStatus::Aborted, "job aborted".to_string()),
        };

        self.finish(status, text);
        status
    }

    /// Mark the job errored without ever running it. Used when the
    /// admission queue rejects it.
    pub fn fail(&self, text: impl Into<String>) {
        self.finish(RunStatus::Error, text.into());
    }

    fn finish(&self, status: RunStatus, text: String) {
        if self.completed.swap(true, Ordering::SeqCst) {
            debug!(job = %self.name, "job already finished");
            return;
        }
        self.set_state(status, text);
        self.hub.close();
        if let Some(build) = self.build() {
            build.note_job_finished(&self.name, status);
        }
    }
}

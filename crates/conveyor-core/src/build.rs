//! A build: one commit under test, owning a set of named jobs.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};

use chrono::{DateTime, Utc};
use url::Url;

use crate::job::Job;
use crate::project::Project;
use crate::runner::JobRunner;
use crate::update::{RunStatus, Update};
use crate::watcher::{WatchHub, Watcher, WatcherId};

/// The scheduler surface a build talks to: where it enqueues its jobs
/// and how it asks for their cancellation.
pub trait Scheduler {
    fn add_job(&self, job: &Arc<Job>);
    fn cancel_job(&self, job: &Arc<Job>);
}

/// One commit under test.
///
/// Jobs are attached by the trigger that created the build; each job
/// mirrors its updates here, so watching the build observes all of
/// them. When the last job reaches a terminal state the build publishes
/// a final [`Update::BuildState`], closes its hub and flips completed.
pub struct Build {
    project: Arc<Project>,
    commit_hash: String,
    clone_url: Url,
    created_at: DateTime<Utc>,
    jobs: Mutex<Vec<Arc<Job>>>,
    finished: Mutex<HashMap<String, RunStatus>>,
    completed: AtomicBool,
    hub: WatchHub,
}

impl Build {
    pub fn new(project: Arc<Project>, commit_hash: impl Into<String>, clone_url: Url) -> Arc<Self> {
        Arc::new(Self {
            project,
            commit_hash: commit_hash.into(),
            clone_url,
            created_at: Utc::now(),
            jobs: Mutex::new(Vec::new()),
            finished: Mutex::new(HashMap::new()),
            completed: AtomicBool::new(false),
            hub: WatchHub::new(),
        })
    }

    pub fn project(&self) -> &Arc<Project> {
        &self.project
    }

    pub fn commit_hash(&self) -> &str {
        &self.commit_hash
    }

    pub fn clone_url(&self) -> &Url {
        &self.clone_url
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn completed(&self) -> bool {
        self.completed.load(Ordering::SeqCst)
    }

    fn jobs_lock(&self) -> MutexGuard<'_, Vec<Arc<Job>>> {
        self.jobs.lock().expect("job list lock poisoned")
    }

    /// Attach a named job. Adding a name twice returns the existing
    /// job without publishing a second `JobCreated`.
    pub fn add_job(self: &Arc<Self>, name: impl Into<String>, runner: Arc<dyn JobRunner>) -> Arc<Job> {
        let name = name.into();
        let job = {
            let mut jobs = self.jobs_lock();
            if let Some(existing) = jobs.iter().find(|j| j.name() == name) {
                return existing.clone();
            }
            let job = Job::new(name.clone(), Arc::downgrade(self), runner);
            jobs.push(job.clone());
            job
        };
        self.hub.publish(Update::JobCreated { job: name });
        job
    }

    /// Look up a job by name.
    pub fn job(&self, name: &str) -> Option<Arc<Job>> {
        self.jobs_lock().iter().find(|j| j.name() == name).cloned()
    }

    /// All jobs, in the order they were attached.
    pub fn jobs(&self) -> Vec<Arc<Job>> {
        self.jobs_lock().clone()
    }

    /// Hand every job to the scheduler, in attachment order. Called by
    /// the queue when the build is first added.
    pub fn enqueue_jobs(&self, scheduler: &dyn Scheduler) {
        for job in self.jobs() {
            scheduler.add_job(&job);
        }
    }

    /// Ask the scheduler to cancel every incomplete job. Jobs still in
    /// the admission queue cannot be reached this way and stay queued.
    pub fn abort(&self, scheduler: &dyn Scheduler) {
        for job in self.jobs() {
            if !job.completed() {
                scheduler.cancel_job(&job);
            }
        }
    }

    pub fn watch(&self, watcher: Arc<dyn Watcher>) -> WatcherId {
        self.hub.watch(watcher)
    }

    pub fn unwatch(&self, id: WatcherId) {
        self.hub.unwatch(id)
    }

    /// Announce where this build's sources come from. Called by the
    /// trigger that created the build.
    pub fn publish_source(
        &self,
        repo_url: Option<String>,
        author: Option<String>,
        branch: Option<String>,
    ) {
        self.hub.publish(Update::BuildSource {
            clone_url: self.clone_url.to_string(),
            repo_url,
            author,
            branch,
        });
    }

    pub(crate) fn publish(&self, update: Update) {
        self.hub.publish(update);
    }

    pub(crate) fn note_job_finished(&self, name: &str, status: RunStatus) {
        let all_done = {
            let jobs = self.jobs_lock();
            let mut finished = self.finished.lock().expect("finished map lock poisoned");
            finished.insert(name.to_string(), status);
            finished.len() >= jobs.len()
        };
        if all_done {
            self.finish();
        }
    }

    fn finish(&self) {
        if self.completed.swap(true, Ordering::SeqCst) {
            return;
        }
        let (state, text) = {
            let finished = self.finished.lock().expect("finished map lock poisoned");
            overall_status(finished.values())
        };
        self.hub.publish(Update::BuildState {
            state,
            text: text.to_string(),
        });
        self.hub.close();
    }
}

fn overall_status<'a>(statuses: impl Iterator<Item = &'a RunStatus>) -> (RunStatus, &'static str) {
    let mut any_failed = false;
    let mut any_aborted = false;
    for status in statuses {
        match status {
            RunStatus::Error => return (RunStatus::Error, "some jobs errored"),
            RunStatus::Failure => any_failed = true,
            RunStatus::Aborted => any_aborted = true,
            _ => {}
        }
    }
    if any_failed {
        (RunStatus::Failure, "some jobs failed")
    } else if any_aborted {
        (RunStatus::Aborted, "build aborted")
    } else {
        (RunStatus::Success, "all jobs succeeded")
    }
}

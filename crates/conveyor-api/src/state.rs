//! Application state.

use std::sync::Arc;

use conveyor_config::Config;
use conveyor_core::{Build, Project};
use conveyor_scheduler::JobQueue;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub queue: Arc<JobQueue>,
    pub projects: Arc<Vec<Arc<Project>>>,
}

impl AppState {
    pub fn new(config: Arc<Config>, queue: Arc<JobQueue>) -> Self {
        let projects = config
            .projects
            .iter()
            .map(|p| Arc::new(Project::new(p.name.clone(), p.jobs.clone())))
            .collect();
        Self {
            config,
            queue,
            projects: Arc::new(projects),
        }
    }

    /// Look up a configured project by name.
    pub fn project(&self, name: &str) -> Option<&Arc<Project>> {
        self.projects.iter().find(|p| p.name == name)
    }

    /// Resolve a tracked build for a project/commit-hash pair.
    ///
    /// The queue tracks builds by hash alone; the project comparison
    /// only validates the request against the build that hash resolved
    /// to.
    pub fn resolve_build(&self, project: &str, hash: &str) -> Option<Arc<Build>> {
        let build = self.queue.find_build(hash)?;
        (build.project().name == project).then_some(build)
    }
}

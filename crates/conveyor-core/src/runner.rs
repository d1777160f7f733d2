//! The execution seam between the scheduler and job executors.

use async_trait::async_trait;

use crate::Result;
use crate::job::Job;

/// Executes the actual work of one job (container, VM, process, ...).
///
/// Output produced while running is published through [`Job::stdout`].
/// `Err(Error::ExecutionFailed)` marks the job failed; any other error
/// marks it errored. Runners must reach their next `.await` regularly:
/// cancellation is cooperative and only takes effect at a suspension
/// point.
#[async_trait]
pub trait JobRunner: Send + Sync {
    async fn run(&self, job: &Job) -> Result<()>;
}

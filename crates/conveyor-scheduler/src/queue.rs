//! The job queue: bounded admission, capped dispatch, cancellation.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::mpsc::error::{TryRecvError, TrySendError};
use tokio::sync::{Notify, mpsc, watch};
use tracing::{error, info, warn};

use conveyor_core::{Build, Job, ResourceId, RunStatus, Scheduler};

/// Outcome of [`JobQueue::cancel`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CancelReport {
    /// Jobs that ended through the cancellation itself.
    pub cancelled: usize,
    /// Jobs that were running when `cancel` was called.
    pub total: usize,
}

/// One running job: its cancel signal and the channel its final status
/// arrives on once the job settles.
#[derive(Clone)]
struct RunningJob {
    job: Arc<Job>,
    cancel: Arc<Notify>,
    settled: watch::Receiver<Option<RunStatus>>,
}

struct QueueState {
    /// Commit hash -> tracked build. A hash maps to at most one build;
    /// builds from different projects sharing a hash conflate.
    builds: HashMap<String, Arc<Build>>,
    /// Jobs currently executing.
    running: HashMap<ResourceId, RunningJob>,
    cancelled: bool,
}

/// Schedules jobs under a bounded admission queue and a concurrency
/// cap.
///
/// Admission is reject-on-full: a job submitted while the queue already
/// holds `capacity` entries is failed immediately and never scheduled.
/// Dispatch is sliding-window: after each admission the loop waits for
/// a completion whenever the cap is reached, so exactly one slot opens
/// per finished job.
pub struct JobQueue {
    job_tx: mpsc::Sender<Arc<Job>>,
    job_rx: tokio::sync::Mutex<mpsc::Receiver<Arc<Job>>>,
    slot_tx: mpsc::UnboundedSender<()>,
    slot_rx: tokio::sync::Mutex<mpsc::UnboundedReceiver<()>>,
    state: Mutex<QueueState>,
    max_running: usize,
}

impl JobQueue {
    /// `capacity` bounds the admission queue; `max_running` caps the
    /// number of concurrently executing jobs.
    pub fn new(capacity: usize, max_running: usize) -> Arc<Self> {
        let (job_tx, job_rx) = mpsc::channel(capacity.max(1));
        let (slot_tx, slot_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            job_tx,
            job_rx: tokio::sync::Mutex::new(job_rx),
            slot_tx,
            slot_rx: tokio::sync::Mutex::new(slot_rx),
            state: Mutex::new(QueueState {
                builds: HashMap::new(),
                running: HashMap::new(),
                cancelled: false,
            }),
            max_running: max_running.max(1),
        })
    }

    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().expect("queue state lock poisoned")
    }

    /// Track a build and let it enqueue its jobs. Adding a build whose
    /// commit hash is already tracked is a no-op.
    pub fn add_build(&self, build: &Arc<Build>) {
        {
            let mut state = self.state();
            if state.builds.contains_key(build.commit_hash()) {
                return;
            }
            state
                .builds
                .insert(build.commit_hash().to_string(), build.clone());
        }
        info!(hash = %build.commit_hash(), url = %build.clone_url(), "added build");
        build.enqueue_jobs(self);
    }

    /// Drop tracking for a finished build. Idempotent.
    pub fn remove_build(&self, build: &Build) {
        if self.state().builds.remove(build.commit_hash()).is_some() {
            info!(hash = %build.commit_hash(), "removed build");
        }
    }

    /// Cancel every incomplete job of the build with this commit hash.
    /// Unknown or already-completed builds are a no-op.
    pub fn abort_build(&self, build_id: &str) {
        let build = self.state().builds.get(build_id).cloned();
        match build {
            Some(build) if !build.completed() => build.abort(self),
            Some(_) => {}
            None => warn!(hash = %build_id, "abort requested for unknown build"),
        }
    }

    /// Whether a commit hash is currently being built.
    pub fn is_pending(&self, commit_hash: &str) -> bool {
        self.state().builds.contains_key(commit_hash)
    }

    /// Look up a tracked build by commit hash.
    pub fn find_build(&self, commit_hash: &str) -> Option<Arc<Build>> {
        self.state().builds.get(commit_hash).cloned()
    }

    /// Admit a job into the bounded queue. Completed jobs are never
    /// (re-)admitted; when the queue is full the job is failed on the
    /// spot instead of blocking the producer.
    pub fn add_job(&self, job: &Arc<Job>) {
        if job.completed() {
            return;
        }
        match self.job_tx.try_send(job.clone()) {
            Ok(()) => {}
            Err(TrySendError::Full(job)) => {
                warn!(job = %job.name(), "admission queue full, dropping job");
                job.fail("overloaded; job was dropped");
            }
            Err(TrySendError::Closed(job)) => {
                error!(job = %job.name(), "admission queue is gone");
            }
        }
    }

    /// Dispatch queued jobs until cancelled.
    ///
    /// Runs as the single scheduler task for the queue's lifetime.
    /// Cancellation stops further admission once the loop next checks
    /// the flag; the admission queue itself is not drained or closed,
    /// so jobs pushed while draining stay queued forever.
    pub async fn process_jobs(self: Arc<Self>) {
        let mut job_rx = self.job_rx.lock().await;
        let mut slot_rx = self.slot_rx.lock().await;

        while !self.is_cancelled() {
            let job = match job_rx.try_recv() {
                Ok(job) => job,
                Err(TryRecvError::Empty) => {
                    info!("waiting for job");
                    match job_rx.recv().await {
                        Some(job) => job,
                        None => break,
                    }
                }
                Err(TryRecvError::Disconnected) => break,
            };

            let (project, hash) = job
                .build()
                .map(|b| (b.project().name.clone(), b.commit_hash().to_string()))
                .unwrap_or_default();
            info!(project = %project, job = %job.name(), hash = %hash, "processing job");

            self.start_job(&job);

            if self.must_wait_for_slot() {
                warn!(limit = self.max_running, "run limit reached, waiting for a free slot");
                while self.must_wait_for_slot() {
                    if slot_rx.recv().await.is_none() {
                        break;
                    }
                }
            }
        }
    }

    /// A freed slot is signalled once per completion; stale signals
    /// from completions that happened while below the cap are absorbed
    /// by re-checking the running-set size.
    fn must_wait_for_slot(&self) -> bool {
        let state = self.state();
        !state.running.is_empty()
            && (state.running.len() >= self.max_running || state.cancelled)
    }

    fn start_job(self: &Arc<Self>, job: &Arc<Job>) {
        let cancel = Arc::new(Notify::new());
        let (settle_tx, settle_rx) = watch::channel(None);

        self.state().running.insert(
            job.id(),
            RunningJob {
                job: job.clone(),
                cancel: cancel.clone(),
                settled: settle_rx,
            },
        );

        let queue = self.clone();
        let job = job.clone();
        tokio::spawn(async move {
            let status = job.run(&cancel).await;
            queue.job_done(&job);
            if let Some(build) = job.build() {
                if build.completed() {
                    queue.remove_build(&build);
                }
            }
            let _ = settle_tx.send(Some(status));
            let _ = queue.slot_tx.send(());
        });
    }

    /// Completion hook: drop the job from the running set. A job that
    /// is not in the set means the hook ran twice; that is logged and
    /// swallowed so the dispatch loop keeps going.
    pub fn job_done(&self, job: &Job) {
        if self.state().running.remove(&job.id()).is_none() {
            error!(job = %job.name(), "finished job not in running set");
            return;
        }
        info!(job = %job.name(), "job finished");
    }

    /// Stop admission, cancel every running job and wait for all of
    /// them to settle. Outcomes are captured, never propagated.
    pub async fn cancel(&self) -> CancelReport {
        let targets: Vec<RunningJob> = {
            let mut state = self.state();
            state.cancelled = true;
            state.running.values().cloned().collect()
        };

        let total = targets.len();
        if total == 0 {
            return CancelReport { cancelled: 0, total: 0 };
        }

        info!(count = total, "cancelling running jobs");
        for entry in &targets {
            entry.cancel.notify_one();
        }

        let mut cancelled = 0;
        for mut entry in targets {
            match entry.settled.wait_for(|status| status.is_some()).await {
                Ok(status) => {
                    if *status == Some(RunStatus::Aborted) {
                        cancelled += 1;
                    }
                }
                Err(_) => {
                    error!(job = %entry.job.name(), "job settled without reporting a status");
                }
            }
        }

        info!(cancelled, total, "cancelled running jobs");
        CancelReport { cancelled, total }
    }

    /// Cancel one running job. Jobs still waiting in the admission
    /// queue are not reachable here and stay queued.
    pub fn cancel_job(&self, job: &Job) {
        match self.state().running.get(&job.id()) {
            Some(entry) => entry.cancel.notify_one(),
            None => warn!(job = %job.name(), "tried to cancel a job that is not running"),
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.state().cancelled
    }

    /// Number of currently executing jobs.
    pub fn running_count(&self) -> usize {
        self.state().running.len()
    }
}

impl Scheduler for JobQueue {
    fn add_job(&self, job: &Arc<Job>) {
        JobQueue::add_job(self, job);
    }

    fn cancel_job(&self, job: &Arc<Job>) {
        JobQueue::cancel_job(self, job);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use conveyor_core::{ChannelWatcher, Delivery, JobRunner, Project, Update};
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::time::timeout;
    use url::Url;

    const WAIT: Duration = Duration::from_secs(5);

    /// Runner that reports when it starts and does not finish until
    /// released.
    struct GatedRunner {
        started: Arc<AtomicBool>,
        started_signal: Arc<Notify>,
        release: Arc<Notify>,
    }

    impl GatedRunner {
        fn new() -> (Arc<Self>, Arc<AtomicBool>, Arc<Notify>, Arc<Notify>) {
            let started = Arc::new(AtomicBool::new(false));
            let started_signal = Arc::new(Notify::new());
            let release = Arc::new(Notify::new());
            let runner = Arc::new(Self {
                started: started.clone(),
                started_signal: started_signal.clone(),
                release: release.clone(),
            });
            (runner, started, started_signal, release)
        }
    }

    #[async_trait]
    impl JobRunner for GatedRunner {
        async fn run(&self, _job: &Job) -> conveyor_core::Result<()> {
            self.started.store(true, Ordering::SeqCst);
            self.started_signal.notify_one();
            self.release.notified().await;
            Ok(())
        }
    }

    /// Runner that counts invocations and tracks peak concurrency.
    struct CountingRunner {
        runs: Arc<AtomicUsize>,
        current: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        done_tx: mpsc::UnboundedSender<()>,
    }

    #[async_trait]
    impl JobRunner for CountingRunner {
        async fn run(&self, _job: &Job) -> conveyor_core::Result<()> {
            self.runs.fetch_add(1, Ordering::SeqCst);
            let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::task::yield_now().await;
            tokio::task::yield_now().await;
            self.current.fetch_sub(1, Ordering::SeqCst);
            let _ = self.done_tx.send(());
            Ok(())
        }
    }

    fn make_build(project: &str, hash: &str) -> Arc<Build> {
        Build::new(
            Arc::new(Project::new(project, Vec::new())),
            hash,
            Url::parse("https://example.com/demo.git").unwrap(),
        )
    }

    #[tokio::test]
    async fn test_backpressure_rejects_and_slot_opens_on_completion() {
        // capacity 2, one job running at a time
        let queue = JobQueue::new(2, 1);
        let build = make_build("demo", "abc123");

        let (r1, _s1, started1, release1) = GatedRunner::new();
        let (r2, s2, started2, _release2) = GatedRunner::new();
        let (r3, s3, _started3, _release3) = GatedRunner::new();
        let j1 = build.add_job("j1", r1);
        let j2 = build.add_job("j2", r2);
        let j3 = build.add_job("j3", r3);

        let (watcher, mut updates) = ChannelWatcher::new();
        j3.watch(watcher);

        queue.add_job(&j1);
        queue.add_job(&j2);
        // queue holds exactly `capacity` entries: rejected, never runs
        queue.add_job(&j3);

        assert!(j3.completed());
        match updates.try_recv().unwrap() {
            Delivery::Update(Update::JobState { state, text, .. }) => {
                assert_eq!(state, RunStatus::Error);
                assert_eq!(text, "overloaded; job was dropped");
            }
            other => panic!("unexpected delivery: {other:?}"),
        }
        assert!(matches!(updates.try_recv().unwrap(), Delivery::Closed));

        tokio::spawn(queue.clone().process_jobs());

        timeout(WAIT, started1.notified()).await.unwrap();
        assert!(!s2.load(Ordering::SeqCst), "j2 must wait for j1's slot");
        assert_eq!(queue.running_count(), 1);

        release1.notify_one();
        timeout(WAIT, started2.notified()).await.unwrap();
        assert!(s2.load(Ordering::SeqCst));
        assert!(!s3.load(Ordering::SeqCst), "a rejected job never runs");
    }

    #[tokio::test]
    async fn test_running_set_never_exceeds_cap() {
        let queue = JobQueue::new(8, 2);
        let build = make_build("demo", "abc123");

        let runs = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for i in 0..5 {
            let job = build.add_job(
                format!("job-{i}"),
                Arc::new(CountingRunner {
                    runs: runs.clone(),
                    current: current.clone(),
                    peak: peak.clone(),
                    done_tx: done_tx.clone(),
                }),
            );
            queue.add_job(&job);
        }

        tokio::spawn(queue.clone().process_jobs());

        for _ in 0..5 {
            timeout(WAIT, done_rx.recv()).await.unwrap().unwrap();
        }
        assert_eq!(runs.load(Ordering::SeqCst), 5);
        assert!(peak.load(Ordering::SeqCst) <= 2);
    }

    #[tokio::test]
    async fn test_add_build_is_idempotent() {
        let queue = JobQueue::new(8, 2);
        let build = make_build("demo", "abc123");

        let runs = Arc::new(AtomicUsize::new(0));
        let current = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));
        let (done_tx, mut done_rx) = mpsc::unbounded_channel();

        for name in ["compile", "test"] {
            build.add_job(
                name,
                Arc::new(CountingRunner {
                    runs: runs.clone(),
                    current: current.clone(),
                    peak: peak.clone(),
                    done_tx: done_tx.clone(),
                }),
            );
        }

        queue.add_build(&build);
        assert!(queue.is_pending("abc123"));
        queue.add_build(&build);

        tokio::spawn(queue.clone().process_jobs());

        for _ in 0..2 {
            timeout(WAIT, done_rx.recv()).await.unwrap().unwrap();
        }
        // the second add_build enqueued nothing
        assert_eq!(runs.load(Ordering::SeqCst), 2);

        // the completion path untracks the finished build
        timeout(WAIT, async {
            while queue.is_pending("abc123") {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert!(build.completed());
    }

    #[tokio::test]
    async fn test_cancel_settles_everything_and_reports_count() {
        let queue = JobQueue::new(8, 2);
        let build = make_build("demo", "abc123");

        let (r1, _, started1, _) = GatedRunner::new();
        let (r2, _, started2, _) = GatedRunner::new();
        let j1 = build.add_job("j1", r1);
        let j2 = build.add_job("j2", r2);
        queue.add_job(&j1);
        queue.add_job(&j2);

        tokio::spawn(queue.clone().process_jobs());
        timeout(WAIT, started1.notified()).await.unwrap();
        timeout(WAIT, started2.notified()).await.unwrap();

        let report = timeout(WAIT, queue.cancel()).await.unwrap();
        assert_eq!(report, CancelReport { cancelled: 2, total: 2 });
        assert!(queue.is_cancelled());
        assert!(j1.completed());
        assert!(j2.completed());
        assert_eq!(queue.running_count(), 0);
    }

    #[tokio::test]
    async fn test_cancel_with_nothing_running() {
        let queue = JobQueue::new(2, 1);
        let report = queue.cancel().await;
        assert_eq!(report, CancelReport { cancelled: 0, total: 0 });
    }

    #[tokio::test]
    async fn test_cancel_job_on_queued_job_is_a_noop() {
        // cap 1: j2 sits in the admission queue while j1 runs
        let queue = JobQueue::new(2, 1);
        let build = make_build("demo", "abc123");

        let (r1, _, started1, release1) = GatedRunner::new();
        let (r2, _, started2, release2) = GatedRunner::new();
        let j1 = build.add_job("j1", r1);
        let j2 = build.add_job("j2", r2);
        queue.add_job(&j1);
        queue.add_job(&j2);

        tokio::spawn(queue.clone().process_jobs());
        timeout(WAIT, started1.notified()).await.unwrap();

        // still queued, not running: nothing happens
        queue.cancel_job(&j2);
        assert!(!j2.completed());

        // it may still start later
        release1.notify_one();
        timeout(WAIT, started2.notified()).await.unwrap();
        release2.notify_one();
    }

    #[tokio::test]
    async fn test_abort_build_cancels_running_jobs() {
        let queue = JobQueue::new(8, 2);
        let build = make_build("demo", "abc123");

        let (r1, _, started1, _) = GatedRunner::new();
        let j1 = build.add_job("j1", r1);
        queue.add_build(&build);

        tokio::spawn(queue.clone().process_jobs());
        timeout(WAIT, started1.notified()).await.unwrap();

        queue.abort_build("abc123");
        timeout(WAIT, async {
            while !j1.completed() {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();

        // unknown hashes are a logged no-op
        queue.abort_build("ffffff");
    }

    #[tokio::test]
    async fn test_completed_job_is_never_readmitted() {
        let queue = JobQueue::new(2, 1);
        let build = make_build("demo", "abc123");
        let (r1, _, _, _) = GatedRunner::new();
        let j1 = build.add_job("j1", r1);

        j1.fail("already done");
        queue.add_job(&j1);
        queue.add_job(&j1);
        // the queue still has room for both slots: nothing was enqueued
        let (r2, _, _, _) = GatedRunner::new();
        let (r3, _, _, _) = GatedRunner::new();
        let j2 = build.add_job("j2", r2);
        let j3 = build.add_job("j3", r3);
        queue.add_job(&j2);
        queue.add_job(&j3);
        assert!(!j2.completed());
        assert!(!j3.completed());
    }

    #[tokio::test]
    async fn test_duplicate_completion_hook_is_swallowed() {
        let queue = JobQueue::new(2, 1);
        let build = make_build("demo", "abc123");
        let (r1, _, _, _) = GatedRunner::new();
        let j1 = build.add_job("j1", r1);

        // never admitted: the hook logs the inconsistency and returns
        queue.job_done(&j1);
        queue.job_done(&j1);
    }
}

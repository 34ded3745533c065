//! Tick loop and job lifecycle.
//!
//! The scheduler polls the store, runs due jobs one after another, and owns
//! every state transition of a job while it executes. Manual runs and
//! question answers run as tracked background tasks that share the loop's
//! cancellation token, so [`Scheduler::stop`] kills agent processes and
//! waits for all of them.

use crate::executor::{AgentRunner, ExecutorError, validate_mcp_servers};
use crate::models::{ExecuteResult, Job, JobRun, JobStatus, McpServer, RunStatus, truncate_output};
use crate::schedule::{format_timestamp, interval_duration, is_due};
use crate::store::{Store, StoreError};
use crate::transcript::detect_question;
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, error, info, warn};

/// Name of the change signal fired after every persisted job mutation.
pub const JOBS_UPDATED: &str = "jobs:updated";

pub const DEFAULT_TICK_INTERVAL: Duration = Duration::from_secs(60);

const CHANGE_CHANNEL_CAPACITY: usize = 64;

/// Payload-free `jobs:updated` signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct JobsChanged;

impl JobsChanged {
    pub fn name(&self) -> &'static str {
        JOBS_UPDATED
    }
}

/// Receives a call on every job status transition.
pub trait Notifier: Send + Sync {
    fn notify(&self, job_name: &str, status: JobStatus);
}

#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("job is already running")]
    AlreadyRunning,

    #[error("job is not waiting for an answer")]
    NotWaiting,

    #[error("scheduler is shutting down")]
    ShuttingDown,
}

pub struct SchedulerBuilder {
    store: Arc<dyn Store>,
    runner: Arc<dyn AgentRunner>,
    notifier: Option<Arc<dyn Notifier>>,
    tick_interval: Duration,
    parent: Option<CancellationToken>,
}

impl SchedulerBuilder {
    pub fn tick_interval(mut self, tick_interval: Duration) -> Self {
        self.tick_interval = tick_interval;
        self
    }

    pub fn notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    /// Cancel the scheduler whenever `parent` is cancelled.
    pub fn cancellation(mut self, parent: &CancellationToken) -> Self {
        self.parent = Some(parent.clone());
        self
    }

    pub fn build(self) -> Scheduler {
        let cancel = match &self.parent {
            Some(parent) => parent.child_token(),
            None => CancellationToken::new(),
        };
        let (changes, _) = broadcast::channel(CHANGE_CHANNEL_CAPACITY);
        Scheduler {
            inner: Arc::new(Inner {
                store: self.store,
                runner: self.runner,
                notifier: self.notifier,
                changes,
                tick_interval: self.tick_interval.max(Duration::from_millis(1)),
                cancel,
                tasks: TaskTracker::new(),
                claims: Mutex::new(HashSet::new()),
                started: AtomicBool::new(false),
            }),
        }
    }
}

struct Inner {
    store: Arc<dyn Store>,
    runner: Arc<dyn AgentRunner>,
    notifier: Option<Arc<dyn Notifier>>,
    changes: broadcast::Sender<JobsChanged>,
    tick_interval: Duration,
    cancel: CancellationToken,
    tasks: TaskTracker,
    /// Ids of jobs with an execution in progress in this process.
    claims: Mutex<HashSet<String>>,
    started: AtomicBool,
}

impl Inner {
    fn claims(&self) -> MutexGuard<'_, HashSet<String>> {
        self.claims
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Exclusive right to execute one job, released on drop.
struct JobClaim {
    inner: Arc<Inner>,
    job_id: String,
}

impl Drop for JobClaim {
    fn drop(&mut self) {
        self.inner.claims().remove(&self.job_id);
    }
}

/// Handle to the job scheduler. Cheap to clone.
#[derive(Clone)]
pub struct Scheduler {
    inner: Arc<Inner>,
}

impl Scheduler {
    pub fn builder(store: Arc<dyn Store>, runner: Arc<dyn AgentRunner>) -> SchedulerBuilder {
        SchedulerBuilder {
            store,
            runner,
            notifier: None,
            tick_interval: DEFAULT_TICK_INTERVAL,
            parent: None,
        }
    }

    /// Subscribe to `jobs:updated` signals.
    pub fn subscribe(&self) -> broadcast::Receiver<JobsChanged> {
        self.inner.changes.subscribe()
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.inner.cancel.clone()
    }

    /// Recover from a previous crash and start the tick loop.
    ///
    /// Jobs left `running` are failed first. Calling this twice is a no-op.
    pub async fn start(&self) {
        if self.inner.started.swap(true, Ordering::SeqCst) {
            warn!("Scheduler already started");
            return;
        }

        match self.inner.store.reset_stuck_running_jobs().await {
            Ok(0) => {}
            Ok(count) => {
                info!(count, "Reset stale running jobs from previous crash");
                self.emit();
            }
            Err(e) => error!(error = %e, "Failed to reset running jobs"),
        }

        let scheduler = self.clone();
        self.inner.tasks.spawn(async move { scheduler.run_loop().await });
        info!(
            tick_interval_secs = self.inner.tick_interval.as_secs_f64(),
            "Scheduler started"
        );
    }

    /// Cancel the loop and every execution, then wait for all of them.
    pub async fn stop(&self) {
        self.inner.cancel.cancel();
        self.join().await;
        info!("Scheduler stopped");
    }

    /// Wait for tracked work without cancelling it.
    ///
    /// Only returns once the loop is cancelled, so it is meant for handles
    /// that never called [`Scheduler::start`]. The tracker stays closed
    /// afterwards: later [`Scheduler::run_now`] and
    /// [`Scheduler::answer_question`] calls return
    /// [`SchedulerError::ShuttingDown`].
    pub async fn join(&self) {
        self.inner.tasks.close();
        self.inner.tasks.wait().await;
    }

    async fn run_loop(self) {
        self.tick().await;

        let period = self.inner.tick_interval;
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                _ = self.inner.cancel.cancelled() => break,
                _ = interval.tick() => self.tick().await,
            }
        }
        debug!("Scheduler loop exited");
    }

    /// Run every due job once, sequentially.
    pub async fn tick(&self) {
        let jobs = match self.inner.store.list_jobs().await {
            Ok(jobs) => jobs,
            Err(e) => {
                error!(error = %e, "Failed to load jobs");
                return;
            }
        };

        let now = Utc::now();
        for job in jobs {
            if self.inner.cancel.is_cancelled() {
                return;
            }
            if !is_due(&job, now) {
                continue;
            }
            let Some(claim) = self.try_claim(&job.id) else {
                debug!(job_id = %job.id, "Job is already executing, skipping");
                continue;
            };
            // A manual run may have finished since the listing was taken.
            let job = match self.inner.store.get_job(&job.id).await {
                Ok(current) if is_due(&current, now) => current,
                Ok(_) => continue,
                Err(e) => {
                    warn!(job_id = %job.id, error = %e, "Failed to reload due job");
                    continue;
                }
            };
            self.execute_job(job, now).await;
            drop(claim);
        }
    }

    /// Start a job immediately in the background.
    pub async fn run_now(&self, job_id: &str) -> Result<(), SchedulerError> {
        // Keeps `stop` waiting until the task below is spawned or abandoned.
        let _tracked = self.inner.tasks.token();
        self.ensure_accepting()?;
        let job = self.inner.store.get_job(job_id).await?;
        if job.status == JobStatus::Running {
            return Err(SchedulerError::AlreadyRunning);
        }
        let claim = self
            .try_claim(&job.id)
            .ok_or(SchedulerError::AlreadyRunning)?;
        self.ensure_accepting()?;

        info!(job_id = %job.id, job = %job.name, "Running job on demand");
        let scheduler = self.clone();
        self.inner.tasks.spawn(async move {
            if !scheduler.inner.cancel.is_cancelled() {
                scheduler.execute_job(job, Utc::now()).await;
            }
            drop(claim);
        });
        Ok(())
    }

    /// Resume a `waiting` job with the user's answer in the background.
    ///
    /// The job and its latest run are marked `running` before this returns.
    pub async fn answer_question(&self, job_id: &str, answer: &str) -> Result<(), SchedulerError> {
        let _tracked = self.inner.tasks.token();
        self.ensure_accepting()?;
        let mut job = self.inner.store.get_job(job_id).await?;
        if job.status != JobStatus::Waiting {
            return Err(SchedulerError::NotWaiting);
        }
        let claim = self
            .try_claim(&job.id)
            .ok_or(SchedulerError::AlreadyRunning)?;

        let run = match self.inner.store.get_latest_run(&job.id).await {
            Ok(run) => run,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Failed to load latest run");
                None
            }
        };
        let mcp_servers = match self.load_mcp_servers(&job.id).await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Invalid MCP configuration, failing job");
                self.finish_execution(job, run, Err(e)).await;
                return Ok(());
            }
        };
        self.ensure_accepting()?;

        job.status = JobStatus::Running;
        job.pending_question = None;
        self.inner.store.update_job(&job).await?;
        self.emit();
        self.notify(&job.name, JobStatus::Running);

        let run = run.map(|mut run| {
            run.status = RunStatus::Running;
            run.pending_question = None;
            run
        });
        if let Some(run) = &run
            && let Err(e) = self.inner.store.update_run(run).await
        {
            warn!(run_id = %run.id, error = %e, "Failed to update run");
        }
        self.emit();

        info!(job_id = %job.id, job = %job.name, "Resuming job with answer");
        let scheduler = self.clone();
        let answer = answer.to_string();
        self.inner.tasks.spawn(async move {
            let inner = &scheduler.inner;
            let result = if inner.cancel.is_cancelled() {
                Err(ExecutorError::Cancelled)
            } else {
                inner
                    .runner
                    .answer(&job, &mcp_servers, &answer, &inner.cancel)
                    .await
                    .map(|mut result| {
                        if let Some(previous) = run.as_ref().map(|run| run.output.as_str())
                            && !previous.is_empty()
                        {
                            result.transcript = format!("{previous}\n\n{}", result.transcript);
                        }
                        result
                    })
            };
            scheduler.finish_execution(job, run, result).await;
            drop(claim);
        });
        Ok(())
    }

    async fn execute_job(&self, mut job: Job, now: DateTime<Utc>) {
        let mcp_servers = match self.load_mcp_servers(&job.id).await {
            Ok(servers) => servers,
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Invalid MCP configuration, failing job");
                refresh_schedule(&mut job, now);
                self.finish_execution(job, None, Err(e)).await;
                return;
            }
        };

        job.status = JobStatus::Running;
        job.output.clear();
        job.pending_question = None;
        if let Err(e) = self.inner.store.update_job(&job).await {
            error!(job_id = %job.id, error = %e, "Failed to mark job running");
            return;
        }
        self.emit();
        self.notify(&job.name, JobStatus::Running);
        info!(job_id = %job.id, job = %job.name, "Job started");

        let run = match self
            .inner
            .store
            .create_run(&JobRun::started(&job.id, format_timestamp(now)))
            .await
        {
            Ok(run) => Some(run),
            Err(e) => {
                error!(job_id = %job.id, error = %e, "Failed to create run");
                None
            }
        };

        let result = self
            .inner
            .runner
            .execute(&job, &mcp_servers, &self.inner.cancel)
            .await;

        refresh_schedule(&mut job, now);
        self.finish_execution(job, run, result).await;
    }

    /// Fold an execution outcome into the job and its run, then signal.
    async fn finish_execution(
        &self,
        mut job: Job,
        run: Option<JobRun>,
        result: Result<ExecuteResult, ExecutorError>,
    ) {
        match result {
            Err(e) => {
                warn!(job_id = %job.id, error = %e, "Job failed");
                job.status = JobStatus::Failed;
                job.output = truncate_output(&e.to_string());
                job.pending_question = None;
            }
            Ok(result) => match detect_question(&result.raw_lines) {
                Some(question) => {
                    info!(job_id = %job.id, "Job is waiting for an answer");
                    job.status = JobStatus::Waiting;
                    job.output = truncate_output(&result.transcript);
                    job.pending_question = Some(question);
                }
                None => {
                    info!(job_id = %job.id, "Job completed");
                    job.status = JobStatus::Success;
                    job.output = truncate_output(&result.transcript);
                    job.pending_question = None;
                }
            },
        }

        if let Err(e) = self.inner.store.update_job(&job).await {
            error!(job_id = %job.id, error = %e, "Failed to update job after execution");
        }

        if let Some(mut run) = run {
            run.status = RunStatus::from_job(job.status).unwrap_or(RunStatus::Failed);
            run.output = job.output.clone();
            run.pending_question = job.pending_question.clone();
            if job.status != JobStatus::Waiting {
                run.ended_at = Some(format_timestamp(Utc::now()));
            }
            if let Err(e) = self.inner.store.update_run(&run).await {
                error!(run_id = %run.id, error = %e, "Failed to update run");
            }
            if let Err(e) = self.inner.store.prune_runs(&job.id).await {
                warn!(job_id = %job.id, error = %e, "Failed to prune runs");
            }
        }

        self.emit();
        self.notify(&job.name, job.status);
    }

    /// Servers attached to a job, validated.
    ///
    /// A stored definition the store cannot decode is a configuration error.
    /// Any other store failure runs the job without servers.
    async fn load_mcp_servers(&self, job_id: &str) -> Result<Vec<McpServer>, ExecutorError> {
        match self.inner.store.get_mcp_servers_for_job(job_id).await {
            Ok(servers) => {
                validate_mcp_servers(&servers)?;
                Ok(servers)
            }
            Err(StoreError::Invalid(message)) => Err(ExecutorError::McpConfig(message)),
            Err(e) => {
                warn!(job_id = %job_id, error = %e, "Failed to load MCP servers");
                Ok(Vec::new())
            }
        }
    }

    fn ensure_accepting(&self) -> Result<(), SchedulerError> {
        if self.inner.cancel.is_cancelled() || self.inner.tasks.is_closed() {
            return Err(SchedulerError::ShuttingDown);
        }
        Ok(())
    }

    fn try_claim(&self, job_id: &str) -> Option<JobClaim> {
        if !self.inner.claims().insert(job_id.to_string()) {
            return None;
        }
        Some(JobClaim {
            inner: Arc::clone(&self.inner),
            job_id: job_id.to_string(),
        })
    }

    fn emit(&self) {
        debug!(event = JOBS_UPDATED, "Jobs changed");
        // No subscribers is fine.
        let _ = self.inner.changes.send(JobsChanged);
    }

    fn notify(&self, job_name: &str, status: JobStatus) {
        let Some(notifier) = &self.inner.notifier else {
            return;
        };
        if catch_unwind(AssertUnwindSafe(|| notifier.notify(job_name, status))).is_err() {
            warn!(job = %job_name, status = %status, "Notifier panicked");
        }
    }
}

/// Set `last_run` to `now` and `next_run` one interval later.
fn refresh_schedule(job: &mut Job, now: DateTime<Utc>) {
    job.last_run = Some(format_timestamp(now));
    let interval = interval_duration(job.interval_value, &job.interval_unit);
    job.next_run = now.checked_add_signed(interval).map(format_timestamp);
}

#![allow(dead_code)]

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use cronpilot_engine::executor::{AgentRunner, ExecutorError};
use cronpilot_engine::models::{
    ExecuteResult, INTERRUPTED_OUTPUT, Job, JobRun, JobStatus, MAX_RUNS_PER_JOB, McpServer,
    truncate_output,
};
use cronpilot_engine::schedule::format_timestamp;
use cronpilot_engine::scheduler::Notifier;
use cronpilot_engine::store::{Store, StoreError};
use serde_json::json;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

pub fn past(minutes: i64) -> String {
    format_timestamp(Utc::now() - ChronoDuration::minutes(minutes))
}

pub fn future(minutes: i64) -> String {
    format_timestamp(Utc::now() + ChronoDuration::minutes(minutes))
}

pub fn job(id: &str, status: JobStatus) -> Job {
    Job {
        id: id.to_string(),
        name: format!("{id}-name"),
        prompt: format!("prompt for {id}"),
        start_date: "2026-01-01T00:00".to_string(),
        interval_value: 1,
        interval_unit: "minutes".to_string(),
        active: true,
        status,
        ..Default::default()
    }
}

/// A job whose last run is ten minutes old on a one minute interval.
pub fn due_job(id: &str) -> Job {
    Job {
        last_run: Some(past(10)),
        ..job(id, JobStatus::Success)
    }
}

/// A job that will not be due for another hour.
pub fn idle_job(id: &str, status: JobStatus) -> Job {
    Job {
        interval_unit: "hours".to_string(),
        last_run: Some(past(5)),
        ..job(id, status)
    }
}

pub fn text_line(text: &str) -> String {
    json!({"type": "assistant", "message": {"content": [{"type": "text", "text": text}]}}).to_string()
}

pub fn question_payload() -> serde_json::Value {
    json!({"questions": [{"question": "Which region?", "header": "Region", "options": [{"label": "eu"}, {"label": "us"}]}]})
}

pub fn question_line() -> String {
    json!({"type": "assistant", "message": {"content": [
        {"type": "tool_use", "id": "q1", "name": "AskUserQuestion", "input": question_payload()}
    ]}})
    .to_string()
}

pub fn success(transcript: &str) -> Result<ExecuteResult, String> {
    Ok(ExecuteResult {
        transcript: transcript.to_string(),
        raw_lines: vec![text_line(transcript)],
    })
}

pub fn asking(transcript: &str) -> Result<ExecuteResult, String> {
    Ok(ExecuteResult {
        transcript: transcript.to_string(),
        raw_lines: vec![text_line(transcript), question_line()],
    })
}

#[derive(Default)]
struct State {
    jobs: BTreeMap<String, Job>,
    runs: Vec<JobRun>,
    mcp: HashMap<String, Vec<McpServer>>,
    next_run_id: u64,
}

/// In-memory [`Store`] with the same semantics as the SQLite one.
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    fail_list: StdMutex<bool>,
    lookup_delay: StdMutex<Duration>,
    mcp_error: StdMutex<Option<String>>,
}

impl MemoryStore {
    pub async fn insert_job(&self, job: Job) {
        self.state.lock().await.jobs.insert(job.id.clone(), job);
    }

    pub async fn attach(&self, job_id: &str, servers: Vec<McpServer>) {
        self.state.lock().await.mcp.insert(job_id.to_string(), servers);
    }

    pub async fn job(&self, id: &str) -> Job {
        self.state.lock().await.jobs.get(id).cloned().unwrap()
    }

    pub async fn runs(&self, job_id: &str) -> Vec<JobRun> {
        self.state
            .lock()
            .await
            .runs
            .iter()
            .filter(|run| run.job_id == job_id)
            .cloned()
            .collect()
    }

    pub async fn insert_run(&self, run: JobRun) {
        self.state.lock().await.runs.push(run);
    }

    pub fn fail_listing(&self) {
        *self.fail_list.lock().unwrap() = true;
    }

    /// Delay every `get_job` call.
    pub fn slow_lookups(&self, delay: Duration) {
        *self.lookup_delay.lock().unwrap() = delay;
    }

    /// Report attached servers as undecodable rows.
    pub fn corrupt_mcp_servers(&self, message: &str) {
        *self.mcp_error.lock().unwrap() = Some(message.to_string());
    }
}

#[async_trait]
impl Store for MemoryStore {
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        if *self.fail_list.lock().unwrap() {
            return Err(StoreError::Backend("listing disabled".to_string()));
        }
        let mut jobs: Vec<Job> = self.state.lock().await.jobs.values().cloned().collect();
        jobs.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(jobs)
    }

    async fn get_job(&self, id: &str) -> Result<Job, StoreError> {
        let delay = *self.lookup_delay.lock().unwrap();
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        self.state
            .lock()
            .await
            .jobs
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::job_not_found(id))
    }

    async fn update_job(&self, job: &Job) -> Result<Job, StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .jobs
            .get_mut(&job.id)
            .ok_or_else(|| StoreError::job_not_found(&job.id))?;
        *slot = job.clone();
        Ok(job.clone())
    }

    async fn create_run(&self, run: &JobRun) -> Result<JobRun, StoreError> {
        let mut state = self.state.lock().await;
        let mut run = run.clone();
        if run.id.is_empty() {
            state.next_run_id += 1;
            run.id = format!("run-{}", state.next_run_id);
        }
        run.output = truncate_output(&run.output);
        state.runs.push(run.clone());
        Ok(run)
    }

    async fn update_run(&self, run: &JobRun) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let slot = state
            .runs
            .iter_mut()
            .find(|existing| existing.id == run.id)
            .ok_or_else(|| StoreError::run_not_found(&run.id))?;
        *slot = JobRun {
            output: truncate_output(&run.output),
            ..run.clone()
        };
        Ok(())
    }

    async fn get_latest_run(&self, job_id: &str) -> Result<Option<JobRun>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .runs
            .iter()
            .filter(|run| run.job_id == job_id)
            .max_by(|a, b| a.started_at.cmp(&b.started_at))
            .cloned())
    }

    async fn prune_runs(&self, job_id: &str) -> Result<(), StoreError> {
        let mut state = self.state.lock().await;
        let mut mine: Vec<(String, String)> = state
            .runs
            .iter()
            .filter(|run| run.job_id == job_id)
            .map(|run| (run.started_at.clone(), run.id.clone()))
            .collect();
        mine.sort_by(|a, b| b.cmp(a));
        let keep: Vec<String> = mine
            .into_iter()
            .take(MAX_RUNS_PER_JOB)
            .map(|(_, id)| id)
            .collect();
        state
            .runs
            .retain(|run| run.job_id != job_id || keep.contains(&run.id));
        Ok(())
    }

    async fn get_mcp_servers_for_job(&self, job_id: &str) -> Result<Vec<McpServer>, StoreError> {
        if let Some(message) = self.mcp_error.lock().unwrap().clone() {
            return Err(StoreError::Invalid(message));
        }
        Ok(self
            .state
            .lock()
            .await
            .mcp
            .get(job_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn reset_stuck_running_jobs(&self) -> Result<u64, StoreError> {
        let mut state = self.state.lock().await;
        let mut count = 0;
        for job in state.jobs.values_mut() {
            if job.status == JobStatus::Running {
                job.status = JobStatus::Failed;
                job.output = INTERRUPTED_OUTPUT.to_string();
                count += 1;
            }
        }
        Ok(count)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Execute { job_id: String, mcp_servers: usize },
    Answer { job_id: String, answer: String },
}

/// [`AgentRunner`] that replays scripted outcomes.
///
/// Each call pops the next outcome (default: success with "done") after an
/// optional delay that observes cancellation.
#[derive(Default)]
pub struct FakeRunner {
    outcomes: StdMutex<VecDeque<Result<ExecuteResult, String>>>,
    calls: StdMutex<Vec<Call>>,
    delay: Duration,
    pub started: tokio::sync::Notify,
}

impl FakeRunner {
    pub fn new(outcomes: Vec<Result<ExecuteResult, String>>) -> Self {
        Self {
            outcomes: StdMutex::new(outcomes.into()),
            ..Default::default()
        }
    }

    pub fn slow(delay: Duration) -> Self {
        Self {
            delay,
            ..Default::default()
        }
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    async fn respond(
        &self,
        call: Call,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResult, ExecutorError> {
        self.calls.lock().unwrap().push(call);
        self.started.notify_one();
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => return Err(ExecutorError::Cancelled),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        let outcome = self
            .outcomes
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| success("done"));
        outcome.map_err(ExecutorError::Agent)
    }
}

#[async_trait]
impl AgentRunner for FakeRunner {
    async fn execute(
        &self,
        job: &Job,
        mcp_servers: &[McpServer],
        cancel: &CancellationToken,
    ) -> Result<ExecuteResult, ExecutorError> {
        let call = Call::Execute {
            job_id: job.id.clone(),
            mcp_servers: mcp_servers.len(),
        };
        self.respond(call, cancel).await
    }

    async fn answer(
        &self,
        job: &Job,
        _mcp_servers: &[McpServer],
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResult, ExecutorError> {
        let call = Call::Answer {
            job_id: job.id.clone(),
            answer: answer.to_string(),
        };
        self.respond(call, cancel).await
    }
}

/// Records every notification.
#[derive(Default)]
pub struct RecordingNotifier {
    pub events: StdMutex<Vec<(String, JobStatus)>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, job_name: &str, status: JobStatus) {
        self.events
            .lock()
            .unwrap()
            .push((job_name.to_string(), status));
    }
}

pub struct PanickingNotifier;

impl Notifier for PanickingNotifier {
    fn notify(&self, _job_name: &str, _status: JobStatus) {
        panic!("notification backend exploded");
    }
}

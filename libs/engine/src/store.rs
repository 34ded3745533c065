//! Persistence boundary consumed by the scheduler.

use crate::models::{Job, JobRun, McpServer};
use async_trait::async_trait;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum StoreError {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("{0}")]
    Invalid(String),

    #[error("storage error: {0}")]
    Backend(String),
}

impl StoreError {
    pub fn job_not_found(id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: "job",
            id: id.into(),
        }
    }

    pub fn run_not_found(id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: "run",
            id: id.into(),
        }
    }

    pub fn mcp_server_not_found(id: impl Into<String>) -> Self {
        StoreError::NotFound {
            kind: "mcp server",
            id: id.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, StoreError::NotFound { .. })
    }
}

/// Job, run and MCP server access needed to drive executions.
///
/// Implementations serialize access internally; the scheduler calls these
/// from its tick loop and from background tasks concurrently.
#[async_trait]
pub trait Store: Send + Sync {
    /// All jobs, sorted by name.
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError>;

    async fn get_job(&self, id: &str) -> Result<Job, StoreError>;

    /// Overwrite an existing job. Fails with `NotFound` for unknown ids.
    async fn update_job(&self, job: &Job) -> Result<Job, StoreError>;

    /// Insert a run, assigning an id when empty. Output is truncated.
    async fn create_run(&self, run: &JobRun) -> Result<JobRun, StoreError>;

    async fn update_run(&self, run: &JobRun) -> Result<(), StoreError>;

    /// Most recent run of a job by start time, if any.
    async fn get_latest_run(&self, job_id: &str) -> Result<Option<JobRun>, StoreError>;

    /// Drop all but the newest runs of a job.
    async fn prune_runs(&self, job_id: &str) -> Result<(), StoreError>;

    /// MCP servers attached to a job, sorted by name.
    async fn get_mcp_servers_for_job(&self, job_id: &str) -> Result<Vec<McpServer>, StoreError>;

    /// Fail every job left `running` by a previous process. Returns the count.
    async fn reset_stuck_running_jobs(&self) -> Result<u64, StoreError>;
}

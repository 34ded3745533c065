//! Persistent entities shared by the scheduler, the orchestrator and the store.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Number of run records kept per job; older runs are pruned.
pub const MAX_RUNS_PER_JOB: usize = 10;
/// Upper bound on persisted run output, marker included.
pub const MAX_OUTPUT_BYTES: usize = 100 * 1024;
/// Appended to output that was cut at [`MAX_OUTPUT_BYTES`].
pub const TRUNCATED_MARKER: &str = "\n\n[truncated]";
/// Output written onto jobs that were still running when the process died.
pub const INTERRUPTED_OUTPUT: &str = "interrupted: app was restarted";

/// Lifecycle state of a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Waiting,
    Success,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Waiting => "waiting",
            JobStatus::Success => "success",
            JobStatus::Failed => "failed",
        }
    }

    /// Running and waiting jobs are owned by an in-flight execution path.
    pub fn is_in_flight(&self) -> bool {
        matches!(self, JobStatus::Running | JobStatus::Waiting)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "running" => Ok(JobStatus::Running),
            "waiting" => Ok(JobStatus::Waiting),
            "success" => Ok(JobStatus::Success),
            "failed" => Ok(JobStatus::Failed),
            other => Err(UnknownStatus(other.to_string())),
        }
    }
}

/// Status of a single run. Mirrors [`JobStatus`] without `pending`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RunStatus {
    Running,
    Waiting,
    Success,
    Failed,
}

impl RunStatus {
    pub fn as_str(&self) -> &'static str {
        JobStatus::from(*self).as_str()
    }

    /// `None` for `pending`, which runs never carry.
    pub fn from_job(status: JobStatus) -> Option<Self> {
        match status {
            JobStatus::Pending => None,
            JobStatus::Running => Some(RunStatus::Running),
            JobStatus::Waiting => Some(RunStatus::Waiting),
            JobStatus::Success => Some(RunStatus::Success),
            JobStatus::Failed => Some(RunStatus::Failed),
        }
    }
}

impl From<RunStatus> for JobStatus {
    fn from(status: RunStatus) -> Self {
        match status {
            RunStatus::Running => JobStatus::Running,
            RunStatus::Waiting => JobStatus::Waiting,
            RunStatus::Success => JobStatus::Success,
            RunStatus::Failed => JobStatus::Failed,
        }
    }
}

impl fmt::Display for RunStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for RunStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let status = s.parse::<JobStatus>()?;
        RunStatus::from_job(status).ok_or_else(|| UnknownStatus(s.to_string()))
    }
}

/// A recurring instruction for the agent.
///
/// `id` doubles as the agent's conversation key, so every run of a job
/// continues the same conversation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    pub name: String,
    pub prompt: String,
    /// RFC 3339 or a bare `YYYY-MM-DDTHH:MM` in local time.
    pub start_date: String,
    pub interval_value: i64,
    pub interval_unit: String,
    pub active: bool,
    pub status: JobStatus,
    pub output: String,
    /// RFC 3339, set after the first scheduled execution.
    pub last_run: Option<String>,
    pub next_run: Option<String>,
    /// Raw `AskUserQuestion` input while the job is `waiting`.
    pub pending_question: Option<String>,
}

/// One historical execution attempt of a [`Job`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct JobRun {
    pub id: String,
    pub job_id: String,
    pub started_at: String,
    pub ended_at: Option<String>,
    pub status: RunStatus,
    pub output: String,
    pub pending_question: Option<String>,
}

impl JobRun {
    /// A fresh `running` run; the store assigns the id when it is empty.
    pub fn started(job_id: &str, started_at: String) -> Self {
        Self {
            id: String::new(),
            job_id: job_id.to_string(),
            started_at,
            ended_at: None,
            status: RunStatus::Running,
            output: String::new(),
            pending_question: None,
        }
    }
}

/// Transport used to reach an MCP server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum McpServerKind {
    #[default]
    Http,
    Stdio,
}

impl McpServerKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            McpServerKind::Http => "http",
            McpServerKind::Stdio => "stdio",
        }
    }
}

impl fmt::Display for McpServerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for McpServerKind {
    type Err = InvalidMcpServer;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(McpServerKind::Http),
            "stdio" => Ok(McpServerKind::Stdio),
            other => Err(InvalidMcpServer::UnknownKind(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidMcpServer {
    #[error("name is required")]
    MissingName,
    #[error("name {0:?} may not contain whitespace or commas")]
    InvalidName(String),
    #[error("invalid type: {0} (must be http or stdio)")]
    UnknownKind(String),
    #[error("url is required for http type")]
    MissingUrl,
    #[error("command is required for stdio type")]
    MissingCommand,
}

/// A tool provider made available to a job's agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct McpServer {
    pub id: String,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: McpServerKind,
    pub url: String,
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

impl McpServer {
    pub fn validate(&self) -> Result<(), InvalidMcpServer> {
        if self.name.trim().is_empty() {
            return Err(InvalidMcpServer::MissingName);
        }
        if self
            .name
            .chars()
            .any(|c| c.is_whitespace() || c == ',')
        {
            return Err(InvalidMcpServer::InvalidName(self.name.clone()));
        }
        match self.kind {
            McpServerKind::Http if self.url.trim().is_empty() => Err(InvalidMcpServer::MissingUrl),
            McpServerKind::Stdio if self.command.trim().is_empty() => {
                Err(InvalidMcpServer::MissingCommand)
            }
            _ => Ok(()),
        }
    }

    /// Wildcard `--allowedTools` entry covering every tool of this server.
    pub fn tool_pattern(&self) -> String {
        format!("mcp__{}__*", self.name)
    }
}

/// Outcome of one successful agent invocation.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct ExecuteResult {
    pub transcript: String,
    pub raw_lines: Vec<String>,
}

/// Cap `output` at [`MAX_OUTPUT_BYTES`], appending [`TRUNCATED_MARKER`] when cut.
pub fn truncate_output(output: &str) -> String {
    if output.len() <= MAX_OUTPUT_BYTES {
        return output.to_string();
    }

    let mut cut = MAX_OUTPUT_BYTES - TRUNCATED_MARKER.len();
    while !output.is_char_boundary(cut) {
        cut -= 1;
    }
    let kept = output.get(..cut).unwrap_or_default();
    format!("{kept}{TRUNCATED_MARKER}")
}

//! Process orchestration for the agent CLI.
//!
//! One [`AgentCli`] invocation spawns the configured program in
//! non-interactive `stream-json` mode, reads its stdout line by line and
//! classifies the exit. Jobs continue a single conversation keyed by the job
//! id; the first run of a job falls back to a fresh conversation.

use crate::models::{ExecuteResult, InvalidMcpServer, Job, McpServer, McpServerKind};
use crate::transcript::{build_transcript, extract_error};
use async_trait::async_trait;
use chrono::Utc;
use serde::Serialize;
use std::collections::BTreeMap;
use std::io::Write as _;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use tempfile::NamedTempFile;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncReadExt, BufReader};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Built-in tools every invocation may use.
pub const DEFAULT_TOOLS: [&str; 6] = ["Bash", "Read", "Write", "Edit", "WebFetch", "WebSearch"];

/// Appended to the agent's system prompt on every invocation.
pub const DEFAULT_SYSTEM_PROMPT: &str = "You have access to WebSearch and WebFetch tools. Use them whenever the task requires current or real-time information such as weather, news, prices, or live data. Do not tell the user to check a website themselves - use your tools to fetch the information directly.";

/// Longest stdout line kept; longer lines are dropped.
pub const DEFAULT_MAX_LINE_BYTES: usize = 10 * 1024 * 1024;

/// Error text the agent CLI prints when `--resume` names an unknown session.
const MISSING_CONVERSATION: &str = "No conversation found";

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid MCP server {name:?}: {source}")]
    InvalidMcpServer {
        name: String,
        #[source]
        source: InvalidMcpServer,
    },

    #[error("building MCP config: {0}")]
    McpConfig(String),

    #[error("starting {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("reading {program} output: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },

    /// Message reported by the agent itself in its event stream.
    #[error("{0}")]
    Agent(String),

    #[error("{program}: {detail}")]
    ProcessFailed { program: String, detail: String },

    #[error("empty response from {0}")]
    EmptyResponse(String),

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutorError {
    /// The resume target does not exist yet.
    pub fn is_missing_conversation(&self) -> bool {
        self.to_string().contains(MISSING_CONVERSATION)
    }

    /// Raised before any process was started.
    pub fn is_config(&self) -> bool {
        matches!(
            self,
            ExecutorError::InvalidMcpServer { .. } | ExecutorError::McpConfig(_)
        )
    }
}

/// Runs jobs and answers through an agent.
///
/// The scheduler only depends on this trait so tests can script outcomes.
#[async_trait]
pub trait AgentRunner: Send + Sync {
    /// Run the job's prompt, continuing its conversation when one exists.
    async fn execute(
        &self,
        job: &Job,
        mcp_servers: &[McpServer],
        cancel: &CancellationToken,
    ) -> Result<ExecuteResult, ExecutorError>;

    /// Resume the job's conversation with the user's answer.
    async fn answer(
        &self,
        job: &Job,
        mcp_servers: &[McpServer],
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResult, ExecutorError>;
}

/// Check every server definition before anything is spawned.
pub fn validate_mcp_servers(servers: &[McpServer]) -> Result<(), ExecutorError> {
    for server in servers {
        server
            .validate()
            .map_err(|source| ExecutorError::InvalidMcpServer {
                name: server.name.clone(),
                source,
            })?;
    }
    Ok(())
}

/// Invocation settings for [`AgentCli`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentCliConfig {
    /// Program to run, looked up on `PATH` when not absolute.
    pub program: String,
    /// Arguments placed before everything else.
    pub extra_args: Vec<String>,
    pub default_tools: Vec<String>,
    /// Passed via `--append-system-prompt` unless empty.
    pub system_prompt: String,
    /// When set, raw output of each invocation is written here.
    pub debug_dir: Option<PathBuf>,
    pub max_line_bytes: usize,
}

impl Default for AgentCliConfig {
    fn default() -> Self {
        Self {
            program: "claude".to_string(),
            extra_args: Vec::new(),
            default_tools: DEFAULT_TOOLS.iter().map(|tool| tool.to_string()).collect(),
            system_prompt: DEFAULT_SYSTEM_PROMPT.to_string(),
            debug_dir: None,
            max_line_bytes: DEFAULT_MAX_LINE_BYTES,
        }
    }
}

/// [`AgentRunner`] backed by the agent command-line program.
#[derive(Debug, Clone, Default)]
pub struct AgentCli {
    config: AgentCliConfig,
}

#[async_trait]
impl AgentRunner for AgentCli {
    async fn execute(
        &self,
        job: &Job,
        mcp_servers: &[McpServer],
        cancel: &CancellationToken,
    ) -> Result<ExecuteResult, ExecutorError> {
        let mcp_config = McpConfigFile::create(mcp_servers)?;
        let mcp_path = mcp_config.as_ref().map(McpConfigFile::path);

        let args = self.build_args(&job.prompt, Some(&job.id), mcp_servers, mcp_path);
        match self.run(args, cancel).await {
            Err(e) if e.is_missing_conversation() => {
                info!(job_id = %job.id, "No prior conversation, starting a fresh one");
                let args = self.build_args(&job.prompt, None, mcp_servers, mcp_path);
                self.run(args, cancel).await
            }
            other => other,
        }
    }

    async fn answer(
        &self,
        job: &Job,
        mcp_servers: &[McpServer],
        answer: &str,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResult, ExecutorError> {
        let mcp_config = McpConfigFile::create(mcp_servers)?;
        let mcp_path = mcp_config.as_ref().map(McpConfigFile::path);

        let args = self.build_args(answer, Some(&job.id), mcp_servers, mcp_path);
        self.run(args, cancel).await
    }
}

impl AgentCli {
    pub fn new(config: AgentCliConfig) -> Self {
        Self { config }
    }

    pub fn config(&self) -> &AgentCliConfig {
        &self.config
    }

    /// Comma-joined `--allowedTools` value.
    pub fn allowed_tools(&self, mcp_servers: &[McpServer]) -> String {
        self.config
            .default_tools
            .iter()
            .cloned()
            .chain(mcp_servers.iter().map(McpServer::tool_pattern))
            .collect::<Vec<_>>()
            .join(",")
    }

    /// Full argument list for one invocation.
    pub fn build_args(
        &self,
        prompt: &str,
        resume: Option<&str>,
        mcp_servers: &[McpServer],
        mcp_config: Option<&Path>,
    ) -> Vec<String> {
        let mut args = self.config.extra_args.clone();
        args.extend(["-p".to_string(), prompt.to_string()]);
        if let Some(session) = resume {
            args.extend(["--resume".to_string(), session.to_string()]);
        }
        args.extend(
            [
                "--output-format",
                "stream-json",
                "--verbose",
                "--dangerously-skip-permissions",
            ]
            .map(String::from),
        );
        if !self.config.system_prompt.is_empty() {
            args.extend([
                "--append-system-prompt".to_string(),
                self.config.system_prompt.clone(),
            ]);
        }
        args.extend([
            "--allowedTools".to_string(),
            self.allowed_tools(mcp_servers),
        ]);
        if let Some(path) = mcp_config {
            args.extend([
                "--mcp-config".to_string(),
                path.to_string_lossy().into_owned(),
            ]);
        }
        args
    }

    async fn run(
        &self,
        args: Vec<String>,
        cancel: &CancellationToken,
    ) -> Result<ExecuteResult, ExecutorError> {
        let program = self.config.program.clone();
        if cancel.is_cancelled() {
            return Err(ExecutorError::Cancelled);
        }

        debug!(program = %program, args = args.len(), "Spawning agent");
        let mut child = Command::new(&program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ExecutorError::Spawn {
                program: program.clone(),
                source,
            })?;

        let io_error = |source: std::io::Error| ExecutorError::Io {
            program: program.clone(),
            source,
        };

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("stdout not captured")))?;
        let mut stderr = child
            .stderr
            .take()
            .ok_or_else(|| io_error(std::io::Error::other("stderr not captured")))?;

        let stderr_task = tokio::spawn(async move {
            let mut buf = Vec::new();
            let _ = stderr.read_to_end(&mut buf).await;
            String::from_utf8_lossy(&buf).into_owned()
        });

        let max_line_bytes = self.config.max_line_bytes;
        let outcome = tokio::select! {
            _ = cancel.cancelled() => None,
            result = async {
                let lines = read_lines(BufReader::new(stdout), max_line_bytes).await?;
                let status = child.wait().await?;
                Ok::<_, std::io::Error>((lines, status))
            } => Some(result),
        };

        let Some(result) = outcome else {
            warn!(program = %program, "Agent cancelled, killing process");
            if let Err(e) = child.kill().await {
                warn!(program = %program, error = %e, "Failed to kill agent process");
            }
            stderr_task.abort();
            return Err(ExecutorError::Cancelled);
        };
        let (lines, status) = result.map_err(io_error)?;
        let stderr = stderr_task.await.unwrap_or_default();

        self.dump_debug_lines(&lines).await;
        classify(&program, status, lines, &stderr)
    }

    async fn dump_debug_lines(&self, lines: &[String]) {
        let Some(dir) = self.config.debug_dir.as_ref() else {
            return;
        };
        if lines.is_empty() {
            return;
        }
        if let Err(e) = tokio::fs::create_dir_all(dir).await {
            warn!(dir = %dir.display(), error = %e, "Failed to create debug directory");
            return;
        }
        let path = dir.join(format!(
            "run-{}.jsonl",
            Utc::now().format("%Y%m%d-%H%M%S%.6f")
        ));
        let mut contents = lines.join("\n");
        contents.push('\n');
        match tokio::fs::write(&path, contents).await {
            Ok(()) => debug!(path = %path.display(), lines = lines.len(), "Wrote debug output"),
            Err(e) => warn!(path = %path.display(), error = %e, "Failed to write debug output"),
        }
    }
}

/// Turn a finished process into a result or the most informative error.
fn classify(
    program: &str,
    status: ExitStatus,
    lines: Vec<String>,
    stderr: &str,
) -> Result<ExecuteResult, ExecutorError> {
    if !status.success() {
        let message = extract_error(&lines);
        if !message.is_empty() {
            return Err(ExecutorError::Agent(message));
        }

        let mut parts = Vec::new();
        let stderr = stderr.trim();
        if !stderr.is_empty() {
            parts.push(stderr.to_string());
        }
        let stdout = lines.join("\n");
        let stdout = stdout.trim();
        if !stdout.is_empty() {
            parts.push(stdout.to_string());
        }
        if parts.is_empty() {
            parts.push(status.to_string());
        }
        return Err(ExecutorError::ProcessFailed {
            program: program.to_string(),
            detail: parts.join("\n"),
        });
    }

    let transcript = build_transcript(&lines);
    if !transcript.is_empty() {
        return Ok(ExecuteResult {
            transcript,
            raw_lines: lines,
        });
    }

    let raw = lines.join("\n");
    if raw.is_empty() {
        return Err(ExecutorError::EmptyResponse(program.to_string()));
    }
    Ok(ExecuteResult {
        transcript: raw,
        raw_lines: lines,
    })
}

/// Read newline-terminated lines, dropping any longer than `max_line_bytes`.
async fn read_lines<R>(mut reader: R, max_line_bytes: usize) -> std::io::Result<Vec<String>>
where
    R: AsyncBufRead + Unpin,
{
    let limit = u64::try_from(max_line_bytes).unwrap_or(u64::MAX).saturating_add(1);
    let mut lines = Vec::new();
    let mut buf = Vec::new();

    loop {
        buf.clear();
        let read = (&mut reader).take(limit).read_until(b'\n', &mut buf).await?;
        if read == 0 {
            break;
        }

        let terminated = buf.last() == Some(&b'\n');
        if !terminated && buf.len() > max_line_bytes {
            warn!(max_line_bytes, "Dropping oversized output line");
            skip_line(&mut reader).await?;
            continue;
        }

        if terminated {
            buf.pop();
            if buf.last() == Some(&b'\r') {
                buf.pop();
            }
        }
        lines.push(String::from_utf8_lossy(&buf).into_owned());
    }

    Ok(lines)
}

/// Consume input up to and including the next newline.
async fn skip_line<R>(reader: &mut R) -> std::io::Result<()>
where
    R: AsyncBufRead + Unpin,
{
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            return Ok(());
        }
        if let Some(pos) = available.iter().position(|b| *b == b'\n') {
            reader.consume(pos + 1);
            return Ok(());
        }
        let len = available.len();
        reader.consume(len);
    }
}

#[derive(Serialize)]
struct McpConfigDocument<'a> {
    #[serde(rename = "mcpServers")]
    mcp_servers: BTreeMap<&'a str, McpConfigEntry<'a>>,
}

#[derive(Serialize)]
struct McpConfigEntry<'a> {
    #[serde(rename = "type")]
    kind: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    url: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    command: Option<&'a str>,
    #[serde(skip_serializing_if = "<[String]>::is_empty")]
    args: &'a [String],
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    env: &'a BTreeMap<String, String>,
    #[serde(skip_serializing_if = "BTreeMap::is_empty")]
    headers: &'a BTreeMap<String, String>,
}

impl<'a> From<&'a McpServer> for McpConfigEntry<'a> {
    fn from(server: &'a McpServer) -> Self {
        let (url, command) = match server.kind {
            McpServerKind::Http => (Some(server.url.as_str()), None),
            McpServerKind::Stdio => (None, Some(server.command.as_str())),
        };
        Self {
            kind: server.kind.as_str(),
            url,
            command,
            args: &server.args,
            env: &server.env,
            headers: &server.headers,
        }
    }
}

/// Render the `--mcp-config` document for a set of servers.
pub fn mcp_config_json(servers: &[McpServer]) -> Result<String, ExecutorError> {
    let document = McpConfigDocument {
        mcp_servers: servers
            .iter()
            .map(|server| (server.name.as_str(), McpConfigEntry::from(server)))
            .collect(),
    };
    serde_json::to_string(&document).map_err(|e| ExecutorError::McpConfig(e.to_string()))
}

/// Temporary `--mcp-config` file, removed when dropped.
pub struct McpConfigFile {
    file: NamedTempFile,
}

impl McpConfigFile {
    /// `None` when there are no servers to configure.
    pub fn create(servers: &[McpServer]) -> Result<Option<Self>, ExecutorError> {
        if servers.is_empty() {
            return Ok(None);
        }
        validate_mcp_servers(servers)?;
        let json = mcp_config_json(servers)?;

        let mut file = tempfile::Builder::new()
            .prefix("agent-mcp-")
            .suffix(".json")
            .tempfile()
            .map_err(|e| ExecutorError::McpConfig(format!("creating temp file: {e}")))?;
        file.write_all(json.as_bytes())
            .and_then(|()| file.flush())
            .map_err(|e| ExecutorError::McpConfig(format!("writing temp file: {e}")))?;

        Ok(Some(Self { file }))
    }

    pub fn path(&self) -> &Path {
        self.file.path()
    }
}

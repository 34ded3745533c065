//! Job execution engine: due checks, agent CLI orchestration, transcript
//! rendering and the scheduler that ties them to a [`Store`].

pub mod executor;
pub mod models;
pub mod question;
pub mod schedule;
pub mod scheduler;
pub mod store;
pub mod stream;
pub mod transcript;

pub use executor::{AgentCli, AgentCliConfig, AgentRunner, ExecutorError};
pub use models::{
    ExecuteResult, InvalidMcpServer, Job, JobRun, JobStatus, McpServer, McpServerKind, RunStatus,
};
pub use schedule::{IntervalUnit, interval_duration, is_due, parse_schedule_time};
pub use scheduler::{JOBS_UPDATED, JobsChanged, Notifier, Scheduler, SchedulerError};
pub use store::{Store, StoreError};
pub use transcript::{build_transcript, detect_question, extract_error};

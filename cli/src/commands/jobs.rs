use anyhow::{Context, Result, bail};
use chrono::Local;
use clap::Subcommand;
use cronpilot_engine::executor::AgentCli;
use cronpilot_engine::models::{Job, JobStatus};
use cronpilot_engine::schedule::{LOCAL_DATETIME_FORMAT, parse_schedule_time};
use cronpilot_engine::scheduler::Scheduler;
use cronpilot_store::ScheduleDb;
use std::sync::Arc;
use tokio::signal;

use crate::commands::{open_db, resolve_job, resolve_mcp_server};
use crate::config::AppConfig;
use crate::notifier::ConsoleNotifier;
use crate::output::{print_job, print_jobs_table, print_runs_table};

#[derive(Subcommand, Debug, PartialEq)]
pub enum JobsCommands {
    /// List all jobs
    List,
    /// Show a job with its prompt, pending question and latest output
    Show {
        /// Job id or name
        job: String,
    },
    /// Create a job
    Add {
        /// Display name
        name: String,
        /// Instruction sent to the agent on every run
        #[arg(short, long)]
        prompt: String,
        /// Number of interval units between runs
        #[arg(short, long, default_value_t = 1)]
        every: i64,
        /// Interval unit: minutes, hours, days or weeks
        #[arg(short, long, default_value = "hours")]
        unit: String,
        /// First eligible run, RFC 3339 or local YYYY-MM-DDTHH:MM (default: now)
        #[arg(short, long)]
        start: Option<String>,
        /// Create the job disabled
        #[arg(long)]
        inactive: bool,
        /// MCP server (id or name) to attach; repeatable
        #[arg(long = "mcp", action = clap::ArgAction::Append)]
        mcp: Vec<String>,
    },
    /// Change fields of a job
    Edit {
        /// Job id or name
        job: String,
        #[arg(long)]
        name: Option<String>,
        #[arg(short, long)]
        prompt: Option<String>,
        #[arg(short, long)]
        every: Option<i64>,
        #[arg(short, long)]
        unit: Option<String>,
        #[arg(short, long)]
        start: Option<String>,
        /// Enable or disable scheduling
        #[arg(long)]
        active: Option<bool>,
    },
    /// Delete a job with its run history
    Rm {
        /// Job id or name
        job: String,
    },
    /// Show the most recent runs of a job
    Runs {
        /// Job id or name
        job: String,
    },
    /// Run a job now and wait for it to finish
    Run {
        /// Job id or name
        job: String,
    },
    /// Answer the question a waiting job asked, then wait for it to finish
    Answer {
        /// Job id or name
        job: String,
        /// Free-text answer passed to the agent
        answer: String,
    },
}

enum Trigger {
    RunNow,
    Answer(String),
}

impl JobsCommands {
    pub async fn run(self, config: &AppConfig) -> Result<()> {
        let db = Arc::new(open_db(config).await?);

        match self {
            JobsCommands::List => {
                print_jobs_table(&db.list_jobs().await?);
            }
            JobsCommands::Show { job } => {
                let job = resolve_job(&db, &job).await?;
                let servers = db.get_mcp_servers_for_job(&job.id).await?;
                print_job(&job, &servers);
            }
            JobsCommands::Add {
                name,
                prompt,
                every,
                unit,
                start,
                inactive,
                mcp,
            } => {
                let start_date = match start {
                    Some(start) => checked_start(start)?,
                    None => Local::now().format(LOCAL_DATETIME_FORMAT).to_string(),
                };
                let mut server_ids = Vec::with_capacity(mcp.len());
                for key in &mcp {
                    server_ids.push(resolve_mcp_server(&db, key).await?.id);
                }

                let job = db
                    .create_job(Job {
                        name,
                        prompt,
                        start_date,
                        interval_value: every,
                        interval_unit: unit,
                        active: !inactive,
                        status: JobStatus::Pending,
                        ..Default::default()
                    })
                    .await?;
                if !server_ids.is_empty() {
                    db.set_job_mcp_servers(&job.id, &server_ids).await?;
                }
                println!("Created job {} ({})", job.name, job.id);
            }
            JobsCommands::Edit {
                job,
                name,
                prompt,
                every,
                unit,
                start,
                active,
            } => {
                let mut job = resolve_job(&db, &job).await?;
                if let Some(name) = name {
                    job.name = name;
                }
                if let Some(prompt) = prompt {
                    job.prompt = prompt;
                }
                if let Some(every) = every {
                    job.interval_value = every;
                }
                if let Some(unit) = unit {
                    job.interval_unit = unit;
                }
                if let Some(start) = start {
                    job.start_date = checked_start(start)?;
                }
                if let Some(active) = active {
                    job.active = active;
                }
                let job = db.update_job(&job).await?;
                println!("Updated job {} ({})", job.name, job.id);
            }
            JobsCommands::Rm { job } => {
                let job = resolve_job(&db, &job).await?;
                db.delete_job(&job.id).await?;
                println!("Deleted job {} ({})", job.name, job.id);
            }
            JobsCommands::Runs { job } => {
                let job = resolve_job(&db, &job).await?;
                print_runs_table(&db.list_runs(&job.id).await?);
            }
            JobsCommands::Run { job } => {
                let job = resolve_job(&db, &job).await?;
                execute_and_wait(config, db, &job, Trigger::RunNow).await?;
            }
            JobsCommands::Answer { job, answer } => {
                let job = resolve_job(&db, &job).await?;
                if job.status != JobStatus::Waiting {
                    bail!("{} is {}, not waiting for an answer", job.name, job.status);
                }
                execute_and_wait(config, db, &job, Trigger::Answer(answer)).await?;
            }
        }
        Ok(())
    }
}

fn checked_start(start: String) -> Result<String> {
    parse_schedule_time(&start).with_context(|| {
        format!("invalid start {start:?}; use RFC 3339 or YYYY-MM-DDTHH:MM")
    })?;
    Ok(start)
}

/// Drive one execution in this process; Ctrl+C cancels the agent.
async fn execute_and_wait(
    config: &AppConfig,
    db: Arc<ScheduleDb>,
    job: &Job,
    trigger: Trigger,
) -> Result<()> {
    let runner = Arc::new(AgentCli::new(config.agent_cli_config()));
    let scheduler = Scheduler::builder(db.clone(), runner)
        .notifier(Arc::new(ConsoleNotifier))
        .build();

    match trigger {
        Trigger::RunNow => scheduler.run_now(&job.id).await?,
        Trigger::Answer(answer) => scheduler.answer_question(&job.id, &answer).await?,
    }

    let cancel = scheduler.cancellation_token();
    tokio::select! {
        _ = scheduler.join() => {}
        _ = signal::ctrl_c() => {
            println!("\x1b[33mCancelling {}...\x1b[0m", job.name);
            cancel.cancel();
            scheduler.join().await;
        }
    }

    let job = db.get_job(&job.id).await?;
    match job.status {
        JobStatus::Waiting => {
            println!();
            println!("\x1b[33m{} is waiting for an answer:\x1b[0m", job.name);
            println!("{}", job.pending_question.as_deref().unwrap_or_default());
            println!();
            println!("Reply with: cronpilot jobs answer {} <answer>", job.id);
        }
        JobStatus::Failed => {
            bail!("{} failed: {}", job.name, job.output);
        }
        _ => {
            println!();
            println!("{}", job.output);
        }
    }
    Ok(())
}

pub mod jobs;
pub mod mcp;
pub mod run;

use anyhow::{Context, Result, anyhow, bail};
use cronpilot_engine::models::{Job, McpServer};
use cronpilot_store::ScheduleDb;

use crate::config::AppConfig;

pub async fn open_db(config: &AppConfig) -> Result<ScheduleDb> {
    ScheduleDb::open(&config.service.db_path)
        .await
        .with_context(|| {
            format!(
                "failed to open database {}",
                config.service.db_path.display()
            )
        })
}

/// Look a job up by id, falling back to an exact name match.
pub async fn resolve_job(db: &ScheduleDb, key: &str) -> Result<Job> {
    match db.get_job(key).await {
        Ok(job) => return Ok(job),
        Err(e) if e.is_not_found() => {}
        Err(e) => return Err(e.into()),
    }

    let mut matches: Vec<Job> = db
        .list_jobs()
        .await?
        .into_iter()
        .filter(|job| job.name == key)
        .collect();
    match matches.len() {
        0 => Err(anyhow!("no job with id or name {key:?}")),
        1 => Ok(matches.remove(0)),
        n => bail!("{n} jobs are named {key:?}; use the id instead"),
    }
}

/// Look an MCP server up by id or name.
pub async fn resolve_mcp_server(db: &ScheduleDb, key: &str) -> Result<McpServer> {
    db.list_mcp_servers()
        .await?
        .into_iter()
        .find(|server| server.id == key || server.name == key)
        .ok_or_else(|| anyhow!("no MCP server with id or name {key:?}"))
}

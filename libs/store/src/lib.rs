//! SQLite persistence for jobs, runs and MCP servers, backed by libsql.

mod jobs;
mod mcp;
mod runs;

use async_trait::async_trait;
use cronpilot_engine::models::{Job, JobRun, McpServer};
use cronpilot_engine::store::{Store, StoreError};
use libsql::{Builder, Connection, Database};
use std::path::Path;
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

const SCHEMA_SQL: &str = r#"
CREATE TABLE IF NOT EXISTS jobs (
    id               TEXT PRIMARY KEY,
    name             TEXT NOT NULL,
    prompt           TEXT NOT NULL DEFAULT '',
    start_date       TEXT NOT NULL DEFAULT '',
    interval_value   INTEGER NOT NULL DEFAULT 0,
    interval_unit    TEXT NOT NULL DEFAULT 'hours',
    active           INTEGER NOT NULL DEFAULT 1,
    status           TEXT NOT NULL DEFAULT 'pending',
    output           TEXT NOT NULL DEFAULT '',
    last_run         TEXT NOT NULL DEFAULT '',
    next_run         TEXT NOT NULL DEFAULT '',
    pending_question TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS job_runs (
    id               TEXT PRIMARY KEY,
    job_id           TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    started_at       TEXT NOT NULL,
    ended_at         TEXT NOT NULL DEFAULT '',
    status           TEXT NOT NULL DEFAULT 'running',
    output           TEXT NOT NULL DEFAULT '',
    pending_question TEXT NOT NULL DEFAULT ''
);

CREATE INDEX IF NOT EXISTS idx_job_runs_job_id ON job_runs(job_id);

CREATE TABLE IF NOT EXISTS mcp_servers (
    id      TEXT PRIMARY KEY,
    name    TEXT NOT NULL UNIQUE,
    type    TEXT NOT NULL DEFAULT 'http',
    url     TEXT NOT NULL DEFAULT '',
    command TEXT NOT NULL DEFAULT '',
    args    TEXT NOT NULL DEFAULT '[]',
    env     TEXT NOT NULL DEFAULT '{}',
    headers TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS job_mcp_servers (
    job_id        TEXT NOT NULL REFERENCES jobs(id) ON DELETE CASCADE,
    mcp_server_id TEXT NOT NULL REFERENCES mcp_servers(id) ON DELETE CASCADE,
    PRIMARY KEY (job_id, mcp_server_id)
);
"#;

pub(crate) fn backend(e: libsql::Error) -> StoreError {
    StoreError::Backend(e.to_string())
}

/// Empty columns stand in for absent optional values.
pub(crate) fn optional(value: String) -> Option<String> {
    (!value.is_empty()).then_some(value)
}

pub(crate) fn column(value: &Option<String>) -> String {
    value.clone().unwrap_or_default()
}

/// Database handle. All statements go through one serialized connection.
pub struct ScheduleDb {
    _db: Database,
    conn: Mutex<Connection>,
}

impl ScheduleDb {
    /// Open or create the database file, creating parent directories.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                StoreError::Backend(format!("creating {}: {e}", parent.display()))
            })?;
        }
        let db = Builder::new_local(path).build().await.map_err(backend)?;
        let store = Self::init(db).await?;
        debug!(path = %path.display(), "Opened schedule database");
        Ok(store)
    }

    pub async fn open_in_memory() -> Result<Self, StoreError> {
        let db = Builder::new_local(":memory:")
            .build()
            .await
            .map_err(backend)?;
        Self::init(db).await
    }

    async fn init(db: Database) -> Result<Self, StoreError> {
        let conn = db.connect().map_err(backend)?;
        conn.execute_batch(
            "PRAGMA journal_mode = WAL; PRAGMA busy_timeout = 5000; PRAGMA foreign_keys = ON;",
        )
        .await
        .map_err(backend)?;
        conn.execute_batch(SCHEMA_SQL).await.map_err(backend)?;
        Ok(Self {
            _db: db,
            conn: Mutex::new(conn),
        })
    }

    pub(crate) async fn conn(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

#[async_trait]
impl Store for ScheduleDb {
    async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        ScheduleDb::list_jobs(self).await
    }

    async fn get_job(&self, id: &str) -> Result<Job, StoreError> {
        ScheduleDb::get_job(self, id).await
    }

    async fn update_job(&self, job: &Job) -> Result<Job, StoreError> {
        ScheduleDb::update_job(self, job).await
    }

    async fn create_run(&self, run: &JobRun) -> Result<JobRun, StoreError> {
        ScheduleDb::create_run(self, run).await
    }

    async fn update_run(&self, run: &JobRun) -> Result<(), StoreError> {
        ScheduleDb::update_run(self, run).await
    }

    async fn get_latest_run(&self, job_id: &str) -> Result<Option<JobRun>, StoreError> {
        ScheduleDb::get_latest_run(self, job_id).await
    }

    async fn prune_runs(&self, job_id: &str) -> Result<(), StoreError> {
        ScheduleDb::prune_runs(self, job_id).await
    }

    async fn get_mcp_servers_for_job(&self, job_id: &str) -> Result<Vec<McpServer>, StoreError> {
        ScheduleDb::get_mcp_servers_for_job(self, job_id).await
    }

    async fn reset_stuck_running_jobs(&self) -> Result<u64, StoreError> {
        ScheduleDb::reset_stuck_running_jobs(self).await
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;

    #[tokio::test]
    async fn open_creates_parent_directories_and_reopens() {
        let (dir, db) = temp_db().await;
        let created = db.create_job(job("persisted")).await.unwrap();
        drop(db);

        let reopened = ScheduleDb::open(dir.path().join("nested").join("schedule.db"))
            .await
            .unwrap();
        assert_eq!(reopened.get_job(&created.id).await.unwrap(), created);
    }

    #[tokio::test]
    async fn in_memory_database_works() {
        let db = ScheduleDb::open_in_memory().await.unwrap();
        assert!(db.list_jobs().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn usable_through_the_store_trait() {
        let (_dir, db) = temp_db().await;
        let created = db.create_job(job("trait")).await.unwrap();
        let store: &dyn Store = &db;
        assert_eq!(store.list_jobs().await.unwrap(), vec![created.clone()]);
        assert_eq!(store.get_latest_run(&created.id).await.unwrap(), None);
    }
}

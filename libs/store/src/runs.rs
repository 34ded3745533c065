use crate::{ScheduleDb, backend, column, optional};
use cronpilot_engine::models::{JobRun, MAX_RUNS_PER_JOB, RunStatus, truncate_output};
use cronpilot_engine::store::StoreError;
use libsql::{Row, params};
use uuid::Uuid;

const RUN_COLUMNS: &str = "id, job_id, started_at, ended_at, status, output, pending_question";

fn run_from_row(row: &Row) -> Result<JobRun, StoreError> {
    let status: String = row.get(4).map_err(backend)?;
    Ok(JobRun {
        id: row.get(0).map_err(backend)?,
        job_id: row.get(1).map_err(backend)?,
        started_at: row.get(2).map_err(backend)?,
        ended_at: optional(row.get(3).map_err(backend)?),
        status: status
            .parse::<RunStatus>()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        output: row.get(5).map_err(backend)?,
        pending_question: optional(row.get(6).map_err(backend)?),
    })
}

impl ScheduleDb {
    /// Insert a run, assigning an id when it has none.
    pub async fn create_run(&self, run: &JobRun) -> Result<JobRun, StoreError> {
        let mut run = JobRun {
            output: truncate_output(&run.output),
            ..run.clone()
        };
        if run.id.is_empty() {
            run.id = Uuid::new_v4().to_string();
        }

        let conn = self.conn().await;
        conn.execute(
            &format!("INSERT INTO job_runs ({RUN_COLUMNS}) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)"),
            params![
                run.id.as_str(),
                run.job_id.as_str(),
                run.started_at.as_str(),
                column(&run.ended_at),
                run.status.as_str(),
                run.output.as_str(),
                column(&run.pending_question),
            ],
        )
        .await
        .map_err(backend)?;
        Ok(run)
    }

    pub async fn update_run(&self, run: &JobRun) -> Result<(), StoreError> {
        let conn = self.conn().await;
        let affected = conn
            .execute(
                "UPDATE job_runs SET ended_at = ?2, status = ?3, output = ?4, \
                 pending_question = ?5 WHERE id = ?1",
                params![
                    run.id.as_str(),
                    column(&run.ended_at),
                    run.status.as_str(),
                    truncate_output(&run.output),
                    column(&run.pending_question),
                ],
            )
            .await
            .map_err(backend)?;
        if affected == 0 {
            return Err(StoreError::run_not_found(&run.id));
        }
        Ok(())
    }

    /// Most recent runs of a job, newest first.
    pub async fn list_runs(&self, job_id: &str) -> Result<Vec<JobRun>, StoreError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_id = ?1 \
                     ORDER BY started_at DESC, rowid DESC LIMIT {MAX_RUNS_PER_JOB}"
                ),
                params![job_id],
            )
            .await
            .map_err(backend)?;

        let mut runs = Vec::new();
        while let Some(row) = rows.next().await.map_err(backend)? {
            runs.push(run_from_row(&row)?);
        }
        Ok(runs)
    }

    pub async fn get_latest_run(&self, job_id: &str) -> Result<Option<JobRun>, StoreError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!(
                    "SELECT {RUN_COLUMNS} FROM job_runs WHERE job_id = ?1 \
                     ORDER BY started_at DESC, rowid DESC LIMIT 1"
                ),
                params![job_id],
            )
            .await
            .map_err(backend)?;

        match rows.next().await.map_err(backend)? {
            Some(row) => run_from_row(&row).map(Some),
            None => Ok(None),
        }
    }

    /// Drop all but the newest runs of a job.
    pub async fn prune_runs(&self, job_id: &str) -> Result<(), StoreError> {
        let conn = self.conn().await;
        conn.execute(
            &format!(
                "DELETE FROM job_runs WHERE job_id = ?1 AND id NOT IN (\
                 SELECT id FROM job_runs WHERE job_id = ?1 \
                 ORDER BY started_at DESC, rowid DESC LIMIT {MAX_RUNS_PER_JOB})"
            ),
            params![job_id],
        )
        .await
        .map_err(backend)?;
        Ok(())
    }

    pub async fn delete_runs_for_job(&self, job_id: &str) -> Result<u64, StoreError> {
        let conn = self.conn().await;
        conn.execute("DELETE FROM job_runs WHERE job_id = ?1", params![job_id])
            .await
            .map_err(backend)
    }
}

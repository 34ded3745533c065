use crate::{ScheduleDb, backend, column, optional};
use cronpilot_engine::models::{INTERRUPTED_OUTPUT, Job, JobStatus, truncate_output};
use cronpilot_engine::schedule::IntervalUnit;
use cronpilot_engine::store::StoreError;
use libsql::{Row, params};
use tracing::info;
use uuid::Uuid;

const JOB_COLUMNS: &str = "id, name, prompt, start_date, interval_value, interval_unit, active, \
     status, output, last_run, next_run, pending_question";

fn validate_job(job: &Job) -> Result<(), StoreError> {
    if job.name.trim().is_empty() {
        return Err(StoreError::Invalid("name is required".to_string()));
    }
    if job.interval_value <= 0 {
        return Err(StoreError::Invalid(
            "interval_value must be positive".to_string(),
        ));
    }
    job.interval_unit
        .parse::<IntervalUnit>()
        .map_err(StoreError::Invalid)?;
    Ok(())
}

fn job_from_row(row: &Row) -> Result<Job, StoreError> {
    let status: String = row.get(7).map_err(backend)?;
    Ok(Job {
        id: row.get(0).map_err(backend)?,
        name: row.get(1).map_err(backend)?,
        prompt: row.get(2).map_err(backend)?,
        start_date: row.get(3).map_err(backend)?,
        interval_value: row.get(4).map_err(backend)?,
        interval_unit: row.get(5).map_err(backend)?,
        active: row.get::<i64>(6).map_err(backend)? != 0,
        status: status
            .parse::<JobStatus>()
            .map_err(|e| StoreError::Backend(e.to_string()))?,
        output: row.get(8).map_err(backend)?,
        last_run: optional(row.get(9).map_err(backend)?),
        next_run: optional(row.get(10).map_err(backend)?),
        pending_question: optional(row.get(11).map_err(backend)?),
    })
}

impl ScheduleDb {
    pub async fn list_jobs(&self) -> Result<Vec<Job>, StoreError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs ORDER BY name, id"),
                (),
            )
            .await
            .map_err(backend)?;

        let mut jobs = Vec::new();
        while let Some(row) = rows.next().await.map_err(backend)? {
            jobs.push(job_from_row(&row)?);
        }
        Ok(jobs)
    }

    pub async fn get_job(&self, id: &str) -> Result<Job, StoreError> {
        let conn = self.conn().await;
        let mut rows = conn
            .query(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
            )
            .await
            .map_err(backend)?;

        match rows.next().await.map_err(backend)? {
            Some(row) => job_from_row(&row),
            None => Err(StoreError::job_not_found(id)),
        }
    }

    /// Insert a new job under a fresh id.
    pub async fn create_job(&self, job: Job) -> Result<Job, StoreError> {
        validate_job(&job)?;
        let job = Job {
            id: Uuid::new_v4().to_string(),
            output: truncate_output(&job.output),
            ..job
        };

        let conn = self.conn().await;
        conn.execute(
            &format!(
                "INSERT INTO jobs ({JOB_COLUMNS}) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)"
            ),
            params![
                job.id.as_str(),
                job.name.as_str(),
                job.prompt.as_str(),
                job.start_date.as_str(),
                job.interval_value,
                job.interval_unit.as_str(),
                i64::from(job.active),
                job.status.as_str(),
                job.output.as_str(),
                column(&job.last_run),
                column(&job.next_run),
                column(&job.pending_question),
            ],
        )
        .await
        .map_err(backend)?;
        Ok(job)
    }

    pub async fn update_job(&self, job: &Job) -> Result<Job, StoreError> {
        validate_job(job)?;
        let job = Job {
            output: truncate_output(&job.output),
            ..job.clone()
        };

        let conn = self.conn().await;
        let affected = conn
            .execute(
                "UPDATE jobs SET name = ?2, prompt = ?3, start_date = ?4, interval_value = ?5, \
                 interval_unit = ?6, active = ?7, status = ?8, output = ?9, last_run = ?10, \
                 next_run = ?11, pending_question = ?12 WHERE id = ?1",
                params![
                    job.id.as_str(),
                    job.name.as_str(),
                    job.prompt.as_str(),
                    job.start_date.as_str(),
                    job.interval_value,
                    job.interval_unit.as_str(),
                    i64::from(job.active),
                    job.status.as_str(),
                    job.output.as_str(),
                    column(&job.last_run),
                    column(&job.next_run),
                    column(&job.pending_question),
                ],
            )
            .await
            .map_err(backend)?;

        if affected == 0 {
            return Err(StoreError::job_not_found(&job.id));
        }
        Ok(job)
    }

    /// Delete a job; its runs and MCP attachments cascade.
    pub async fn delete_job(&self, id: &str) -> Result<(), StoreError> {
        let conn = self.conn().await;
        let affected = conn
            .execute("DELETE FROM jobs WHERE id = ?1", params![id])
            .await
            .map_err(backend)?;
        if affected == 0 {
            return Err(StoreError::job_not_found(id));
        }
        Ok(())
    }

    /// Mark jobs left `running` by a previous process as failed.
    pub async fn reset_stuck_running_jobs(&self) -> Result<u64, StoreError> {
        let conn = self.conn().await;
        let affected = conn
            .execute(
                "UPDATE jobs SET status = ?1, output = ?2 WHERE status = ?3",
                params![
                    JobStatus::Failed.as_str(),
                    INTERRUPTED_OUTPUT,
                    JobStatus::Running.as_str(),
                ],
            )
            .await
            .map_err(backend)?;
        if affected > 0 {
            info!(count = affected, "Reset interrupted jobs");
        }
        Ok(affected)
    }
}

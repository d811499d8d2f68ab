use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{info, instrument};

use super::{JOBS, Store, StoreError, json_column, to_json};
use crate::core::types::{Job, JobMeta, UnitStatus};
use crate::io::artifacts::{ArtifactLayout, Scope};
use crate::io::clock::now_rfc3339;

const JOB_COLUMNS: &str =
    "id, title, request, meta, status, created_at, started_at, finished_at, last_log_at, error";

impl Store {
    /// Insert a new queued job.
    #[instrument(skip_all, fields(title = %title))]
    pub fn create_job(&self, title: &str, request: &str, meta: &JobMeta) -> Result<Job, StoreError> {
        self.conn.execute(
            "INSERT INTO jobs (title, request, meta, status, created_at)
             VALUES (?1, ?2, ?3, 'queued', ?4)",
            params![title, request, to_json(meta)?, now_rfc3339()],
        )?;
        let id = self.conn.last_insert_rowid();
        info!(job_id = id, "created job");
        load_job(&self.conn, id)?.ok_or(StoreError::NotFound {
            kind: JOBS.kind,
            id,
        })
    }

    /// Atomically claim the lowest-id queued job.
    #[instrument(skip_all)]
    pub fn claim_next_job(&mut self) -> Result<Option<Job>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let now = now_rfc3339();
        let mut after = 0i64;
        let claimed = loop {
            let candidate: Option<i64> = tx
                .query_row(
                    "SELECT id FROM jobs WHERE status = 'queued' AND id > ?1 ORDER BY id ASC LIMIT 1",
                    [after],
                    |row| row.get(0),
                )
                .optional()?;
            let Some(id) = candidate else {
                break None;
            };
            let changed = tx.execute(
                "UPDATE jobs SET status = 'running', started_at = COALESCE(started_at, ?2), last_log_at = ?2
                 WHERE id = ?1 AND status = 'queued'",
                params![id, now],
            )?;
            if changed == 1 {
                break Some(id);
            }
            after = id;
        };
        let job = match claimed {
            Some(id) => load_job(&tx, id)?,
            None => None,
        };
        tx.commit()?;
        if let Some(job) = &job {
            info!(job_id = job.id, "claimed job");
        }
        Ok(job)
    }

    /// Move a job to `done` or `failed`.
    #[instrument(skip(self, error_text))]
    pub fn mark_job_status(
        &mut self,
        id: i64,
        status: UnitStatus,
        error_text: Option<&str>,
    ) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = JOBS.mark(&tx, id, status, error_text, None)?;
        tx.commit()?;
        if changed {
            info!(job_id = id, %status, "marked job");
        }
        Ok(())
    }

    pub fn get_job(&self, id: i64) -> Result<Option<Job>, StoreError> {
        load_job(&self.conn, id)
    }

    /// Most recent jobs first.
    pub fn list_jobs(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs ORDER BY id DESC LIMIT ?1"
        ))?;
        let jobs = stmt
            .query_map([i64::try_from(limit).unwrap_or(i64::MAX)], job_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(jobs)
    }

    /// Delete a job with its steps, subtasks, logs and reports.
    ///
    /// Returns `false` when the job does not exist.
    #[instrument(skip(self, layout))]
    pub fn delete_job(&mut self, id: i64, layout: &ArtifactLayout) -> Result<bool, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        if load_job(&tx, id)?.is_none() {
            return Ok(false);
        }
        let step_ids: Vec<i64> = {
            let mut stmt = tx.prepare("SELECT id FROM steps WHERE job_id = ?1")?;
            stmt.query_map([id], |row| row.get(0))?
                .collect::<Result<_, _>>()?
        };
        let subtask_ids: Vec<(i64, i64)> = {
            let mut stmt = tx.prepare("SELECT id, step_id FROM subtasks WHERE job_id = ?1")?;
            stmt.query_map([id], |row| Ok((row.get(0)?, row.get(1)?)))?
                .collect::<Result<_, _>>()?
        };
        tx.execute("DELETE FROM subtasks WHERE job_id = ?1", [id])?;
        tx.execute("DELETE FROM steps WHERE job_id = ?1", [id])?;
        tx.execute("DELETE FROM jobs WHERE id = ?1", [id])?;
        tx.commit()?;

        for (subtask_id, step_id) in subtask_ids {
            layout.remove_scope(Scope::Subtask {
                job_id: id,
                step_id,
                subtask_id,
            });
        }
        for step_id in &step_ids {
            layout.remove_scope(Scope::Step {
                job_id: id,
                step_id: *step_id,
            });
        }
        layout.remove_scope(Scope::Job(id));
        info!(job_id = id, steps = step_ids.len(), "deleted job");
        Ok(true)
    }
}

fn load_job(conn: &Connection, id: i64) -> Result<Option<Job>, StoreError> {
    let job = conn
        .query_row(
            &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
            [id],
            job_from_row,
        )
        .optional()?;
    Ok(job)
}

fn job_from_row(row: &Row<'_>) -> rusqlite::Result<Job> {
    Ok(Job {
        id: row.get("id")?,
        title: row.get("title")?,
        request: row.get("request")?,
        meta: json_column(row, "meta")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        last_log_at: row.get("last_log_at")?,
        error: row.get("error")?,
    })
}

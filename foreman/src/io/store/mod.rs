//! SQLite-backed work-item store and claim engine.
//!
//! Every status change runs inside a `BEGIN IMMEDIATE` transaction that reads
//! the current row and then updates it conditionally, so any number of worker
//! processes may poll the same database file.

mod error;
mod jobs;
mod schema;
mod units;

use std::fs;
use std::path::Path;
use std::time::Duration;

use rusqlite::types::{FromSql, FromSqlError, FromSqlResult, ToSqlOutput, Type, ValueRef};
use rusqlite::{Connection, OptionalExtension, Row, ToSql, Transaction, params};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

pub use error::{StoreError, UnitKind};

use super::clock::now_rfc3339;
use crate::core::types::UnitStatus;

const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(Debug)]
pub struct Store {
    conn: Connection,
}

impl Store {
    /// Open (creating if needed) the database at `path` and install the schema.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.busy_timeout(BUSY_TIMEOUT)?;
        conn.execute_batch("PRAGMA journal_mode = WAL;")?;
        Self::init(conn)
    }

    /// Private in-memory database, for tests and dry runs.
    pub fn open_in_memory() -> Result<Self, StoreError> {
        Self::init(Connection::open_in_memory()?)
    }

    fn init(conn: Connection) -> Result<Self, StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        conn.execute_batch(schema::SQL)?;
        debug!("store schema ready");
        Ok(Self { conn })
    }

    /// Refresh the job's last-activity timestamp.
    pub fn touch_job(&self, job_id: i64) -> Result<(), StoreError> {
        self.conn.execute(
            "UPDATE jobs SET last_log_at = ?2 WHERE id = ?1",
            params![job_id, now_rfc3339()],
        )?;
        Ok(())
    }
}

/// Static description of a unit table, so steps and subtasks share one
/// claim/mark implementation.
#[derive(Debug, Clone, Copy)]
struct UnitTable {
    kind: UnitKind,
    table: &'static str,
    /// Column referencing the parent unit, with the parent's table.
    parent: Option<(&'static str, &'static str)>,
    index_column: Option<&'static str>,
    has_report: bool,
}

const JOBS: UnitTable = UnitTable {
    kind: UnitKind::Job,
    table: "jobs",
    parent: None,
    index_column: None,
    has_report: false,
};

const STEPS: UnitTable = UnitTable {
    kind: UnitKind::Step,
    table: "steps",
    parent: Some(("job_id", "jobs")),
    index_column: Some("step_index"),
    has_report: true,
};

const SUBTASKS: UnitTable = UnitTable {
    kind: UnitKind::Subtask,
    table: "subtasks",
    parent: Some(("step_id", "steps")),
    index_column: Some("subtask_index"),
    has_report: true,
};

impl UnitTable {
    fn status_of(&self, tx: &Transaction<'_>, id: i64) -> Result<UnitStatus, StoreError> {
        tx.query_row(
            &format!("SELECT status FROM {} WHERE id = ?1", self.table),
            [id],
            |row| row.get(0),
        )
        .optional()?
        .ok_or(StoreError::NotFound {
            kind: self.kind,
            id,
        })
    }

    /// Claim the lowest-index queued child of `parent_id`.
    ///
    /// Returns `None` when nothing is queued or a sibling is still running.
    /// The parent moves from queued to running together with its first child.
    fn claim_next_child(
        &self,
        tx: &Transaction<'_>,
        parent_id: i64,
        now: &str,
    ) -> Result<Option<i64>, StoreError> {
        let (Some((parent_column, parent_table)), Some(index_column)) =
            (self.parent, self.index_column)
        else {
            return Ok(None);
        };
        let table = self.table;

        let busy: bool = tx.query_row(
            &format!(
                "SELECT EXISTS(SELECT 1 FROM {table} WHERE {parent_column} = ?1 AND status = 'running')"
            ),
            [parent_id],
            |row| row.get(0),
        )?;
        if busy {
            debug!(kind = %self.kind, parent_id, "sibling still running");
            return Ok(None);
        }

        let mut after = 0i64;
        loop {
            let candidate: Option<(i64, i64)> = tx
                .query_row(
                    &format!(
                        "SELECT id, {index_column} FROM {table}
                         WHERE {parent_column} = ?1 AND status = 'queued' AND {index_column} > ?2
                         ORDER BY {index_column} ASC LIMIT 1"
                    ),
                    params![parent_id, after],
                    |row| Ok((row.get(0)?, row.get(1)?)),
                )
                .optional()?;
            let Some((id, index)) = candidate else {
                return Ok(None);
            };
            let changed = tx.execute(
                &format!(
                    "UPDATE {table} SET status = 'running', started_at = COALESCE(started_at, ?2)
                     WHERE id = ?1 AND status = 'queued'"
                ),
                params![id, now],
            )?;
            if changed == 1 {
                tx.execute(
                    &format!(
                        "UPDATE {parent_table} SET status = 'running', started_at = COALESCE(started_at, ?2)
                         WHERE id = ?1 AND status = 'queued'"
                    ),
                    params![parent_id, now],
                )?;
                return Ok(Some(id));
            }
            after = index;
        }
    }

    /// Move a running unit to a terminal status.
    ///
    /// Marking twice with the same terminal status is a no-op; `finished_at`
    /// is only ever set once. Queued units must be claimed first.
    fn mark(
        &self,
        tx: &Transaction<'_>,
        id: i64,
        to: UnitStatus,
        error_text: Option<&str>,
        report_path: Option<&str>,
    ) -> Result<bool, StoreError> {
        let from = self.status_of(tx, id)?;
        let allowed = to.is_terminal() && (from == UnitStatus::Running || from == to);
        if !allowed {
            return Err(StoreError::InvalidTransition {
                kind: self.kind,
                id,
                from,
                to,
            });
        }
        if from == to {
            return Ok(false);
        }
        let report_clause = if self.has_report {
            ", report_path = COALESCE(?5, report_path)"
        } else {
            ""
        };
        let sql = format!(
            "UPDATE {} SET status = ?2, finished_at = COALESCE(finished_at, ?3), error = ?4{report_clause}
             WHERE id = ?1",
            self.table
        );
        if self.has_report {
            tx.execute(&sql, params![id, to, now_rfc3339(), error_text, report_path])?;
        } else {
            tx.execute(&sql, params![id, to, now_rfc3339(), error_text])?;
        }
        Ok(true)
    }

    /// Next free sequence index under `parent_id`.
    fn next_index(&self, tx: &Transaction<'_>, parent_id: i64) -> Result<u32, StoreError> {
        let (Some((parent_column, _)), Some(index_column)) = (self.parent, self.index_column)
        else {
            return Ok(1);
        };
        let max: Option<u32> = tx.query_row(
            &format!(
                "SELECT MAX({index_column}) FROM {} WHERE {parent_column} = ?1",
                self.table
            ),
            [parent_id],
            |row| row.get(0),
        )?;
        Ok(max.unwrap_or(0) + 1)
    }
}

impl ToSql for UnitStatus {
    fn to_sql(&self) -> rusqlite::Result<ToSqlOutput<'_>> {
        Ok(ToSqlOutput::from(self.as_str()))
    }
}

impl FromSql for UnitStatus {
    fn column_result(value: ValueRef<'_>) -> FromSqlResult<Self> {
        value
            .as_str()?
            .parse()
            .map_err(|err: String| FromSqlError::Other(err.into()))
    }
}

fn to_json<T: Serialize + ?Sized>(value: &T) -> Result<String, StoreError> {
    Ok(serde_json::to_string(value)?)
}

/// Decode a JSON text column inside a row mapper.
fn json_column<T: DeserializeOwned>(row: &Row<'_>, column: &str) -> rusqlite::Result<T> {
    let raw: String = row.get(column)?;
    serde_json::from_str(&raw).map_err(|err| {
        let index = row.as_ref().column_index(column).unwrap_or_default();
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(err))
    })
}

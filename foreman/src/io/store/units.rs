//! Steps and subtasks: bulk creation, ordered claims and status marks.

use rusqlite::{Connection, OptionalExtension, Row, TransactionBehavior, params};
use tracing::{debug, info, instrument};

use super::{JOBS, STEPS, SUBTASKS, Store, StoreError, json_column, to_json};
use crate::core::types::{Step, StepSpec, Subtask, SubtaskSpec, UnitStatus};
use crate::io::clock::now_rfc3339;

const STEP_COLUMNS: &str = "id, job_id, step_index, goal, acceptance_criteria, scope, constraints, \
     file_allowlist, command_allowlist, status, created_at, started_at, finished_at, report_path, error";

const SUBTASK_COLUMNS: &str = "id, job_id, step_id, subtask_index, title, instruction, \
     acceptance_criteria, scope, constraints, file_allowlist, command_allowlist, status, created_at, \
     started_at, finished_at, report_path, error";

impl Store {
    /// Bulk-insert queued steps with contiguous indices.
    ///
    /// Specs with a blank goal are skipped without consuming an index.
    #[instrument(skip(self, specs), fields(specs = specs.len()))]
    pub fn create_steps(&mut self, job_id: i64, specs: &[StepSpec]) -> Result<usize, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        JOBS.status_of(&tx, job_id)?;
        let mut index = STEPS.next_index(&tx, job_id)?;
        let now = now_rfc3339();
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO steps (job_id, step_index, goal, acceptance_criteria, scope, constraints,
                                    file_allowlist, command_allowlist, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, 'queued', ?9)",
            )?;
            for spec in specs.iter().filter_map(StepSpec::normalized) {
                stmt.execute(params![
                    job_id,
                    index,
                    spec.goal,
                    to_json(&spec.acceptance_criteria)?,
                    spec.scope,
                    to_json(&spec.constraints)?,
                    to_json(&spec.file_allowlist)?,
                    to_json(&spec.command_allowlist)?,
                    now,
                ])?;
                index += 1;
                inserted += 1;
            }
        }
        tx.commit()?;
        info!(job_id, inserted, "created steps");
        Ok(inserted)
    }

    /// Bulk-insert queued subtasks under `step_id` with contiguous indices.
    ///
    /// Specs with a blank title or instruction are skipped.
    #[instrument(skip(self, specs), fields(specs = specs.len()))]
    pub fn create_subtasks(
        &mut self,
        step_id: i64,
        specs: &[SubtaskSpec],
    ) -> Result<usize, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let job_id: i64 = tx
            .query_row("SELECT job_id FROM steps WHERE id = ?1", [step_id], |row| {
                row.get(0)
            })
            .optional()?
            .ok_or(StoreError::NotFound {
                kind: STEPS.kind,
                id: step_id,
            })?;
        let mut index = SUBTASKS.next_index(&tx, step_id)?;
        let now = now_rfc3339();
        let mut inserted = 0usize;
        {
            let mut stmt = tx.prepare(
                "INSERT INTO subtasks (job_id, step_id, subtask_index, title, instruction,
                                       acceptance_criteria, scope, constraints, file_allowlist,
                                       command_allowlist, status, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, 'queued', ?11)",
            )?;
            for spec in specs.iter().filter_map(SubtaskSpec::normalized) {
                stmt.execute(params![
                    job_id,
                    step_id,
                    index,
                    spec.title,
                    spec.instruction,
                    to_json(&spec.acceptance_criteria)?,
                    spec.scope,
                    to_json(&spec.constraints)?,
                    to_json(&spec.file_allowlist)?,
                    to_json(&spec.command_allowlist)?,
                    now,
                ])?;
                index += 1;
                inserted += 1;
            }
        }
        tx.commit()?;
        info!(step_id, inserted, "created subtasks");
        Ok(inserted)
    }

    /// Claim the lowest-index queued step of `job_id`.
    #[instrument(skip(self))]
    pub fn claim_next_step(&mut self, job_id: i64) -> Result<Option<Step>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claimed = STEPS.claim_next_child(&tx, job_id, &now_rfc3339())?;
        let step = match claimed {
            Some(id) => load_step(&tx, id)?,
            None => None,
        };
        tx.commit()?;
        match &step {
            Some(step) => info!(step_id = step.id, index = step.index, "claimed step"),
            None => debug!("no queued step"),
        }
        Ok(step)
    }

    /// Claim the lowest-index queued subtask of `step_id`.
    #[instrument(skip(self))]
    pub fn claim_next_subtask(&mut self, step_id: i64) -> Result<Option<Subtask>, StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let claimed = SUBTASKS.claim_next_child(&tx, step_id, &now_rfc3339())?;
        let subtask = match claimed {
            Some(id) => load_subtask(&tx, id)?,
            None => None,
        };
        tx.commit()?;
        match &subtask {
            Some(subtask) => info!(
                subtask_id = subtask.id,
                index = subtask.index,
                "claimed subtask"
            ),
            None => debug!("no queued subtask"),
        }
        Ok(subtask)
    }

    #[instrument(skip(self, error_text, report_path))]
    pub fn mark_step_status(
        &mut self,
        id: i64,
        status: UnitStatus,
        error_text: Option<&str>,
        report_path: Option<&str>,
    ) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = STEPS.mark(&tx, id, status, error_text, report_path)?;
        tx.commit()?;
        if changed {
            info!(step_id = id, %status, "marked step");
        }
        Ok(())
    }

    #[instrument(skip(self, error_text, report_path))]
    pub fn mark_subtask_status(
        &mut self,
        id: i64,
        status: UnitStatus,
        error_text: Option<&str>,
        report_path: Option<&str>,
    ) -> Result<(), StoreError> {
        let tx = self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?;
        let changed = SUBTASKS.mark(&tx, id, status, error_text, report_path)?;
        tx.commit()?;
        if changed {
            info!(subtask_id = id, %status, "marked subtask");
        }
        Ok(())
    }

    pub fn get_step(&self, id: i64) -> Result<Option<Step>, StoreError> {
        load_step(&self.conn, id)
    }

    pub fn get_subtask(&self, id: i64) -> Result<Option<Subtask>, StoreError> {
        load_subtask(&self.conn, id)
    }

    /// Steps of `job_id` in index order.
    pub fn list_steps(&self, job_id: i64) -> Result<Vec<Step>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {STEP_COLUMNS} FROM steps WHERE job_id = ?1 ORDER BY step_index ASC"
        ))?;
        let steps = stmt
            .query_map([job_id], step_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(steps)
    }

    /// Subtasks of `step_id` in index order.
    pub fn list_subtasks(&self, step_id: i64) -> Result<Vec<Subtask>, StoreError> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE step_id = ?1 ORDER BY subtask_index ASC"
        ))?;
        let subtasks = stmt
            .query_map([step_id], subtask_from_row)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(subtasks)
    }
}

fn load_step(conn: &Connection, id: i64) -> Result<Option<Step>, StoreError> {
    let step = conn
        .query_row(
            &format!("SELECT {STEP_COLUMNS} FROM steps WHERE id = ?1"),
            [id],
            step_from_row,
        )
        .optional()?;
    Ok(step)
}

fn load_subtask(conn: &Connection, id: i64) -> Result<Option<Subtask>, StoreError> {
    let subtask = conn
        .query_row(
            &format!("SELECT {SUBTASK_COLUMNS} FROM subtasks WHERE id = ?1"),
            [id],
            subtask_from_row,
        )
        .optional()?;
    Ok(subtask)
}

fn step_from_row(row: &Row<'_>) -> rusqlite::Result<Step> {
    Ok(Step {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        index: row.get("step_index")?,
        goal: row.get("goal")?,
        acceptance_criteria: json_column(row, "acceptance_criteria")?,
        scope: row.get("scope")?,
        constraints: json_column(row, "constraints")?,
        file_allowlist: json_column(row, "file_allowlist")?,
        command_allowlist: json_column(row, "command_allowlist")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        report_path: row.get("report_path")?,
        error: row.get("error")?,
    })
}

fn subtask_from_row(row: &Row<'_>) -> rusqlite::Result<Subtask> {
    Ok(Subtask {
        id: row.get("id")?,
        job_id: row.get("job_id")?,
        step_id: row.get("step_id")?,
        index: row.get("subtask_index")?,
        title: row.get("title")?,
        instruction: row.get("instruction")?,
        acceptance_criteria: json_column(row, "acceptance_criteria")?,
        scope: row.get("scope")?,
        constraints: json_column(row, "constraints")?,
        file_allowlist: json_column(row, "file_allowlist")?,
        command_allowlist: json_column(row, "command_allowlist")?,
        status: row.get("status")?,
        created_at: row.get("created_at")?,
        started_at: row.get("started_at")?,
        finished_at: row.get("finished_at")?,
        report_path: row.get("report_path")?,
        error: row.get("error")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::types::JobMeta;

    fn store_with_job() -> (Store, i64) {
        let store = Store::open_in_memory().expect("store");
        let job = store
            .create_job("job", "request", &JobMeta::default())
            .expect("job");
        (store, job.id)
    }

    #[test]
    fn blank_goals_do_not_consume_indices() {
        let (mut store, job_id) = store_with_job();
        let specs = [
            StepSpec::new(""),
            StepSpec::new("first"),
            StepSpec::new("   "),
            StepSpec::new("second"),
        ];
        assert_eq!(store.create_steps(job_id, &specs).expect("create"), 2);
        assert_eq!(
            store.create_steps(job_id, &[StepSpec::new("third")]).expect("more"),
            1
        );
        let indices: Vec<u32> = store
            .list_steps(job_id)
            .expect("list")
            .iter()
            .map(|step| step.index)
            .collect();
        assert_eq!(indices, vec![1, 2, 3]);
    }

    #[test]
    fn step_defaults_are_persisted() {
        let (mut store, job_id) = store_with_job();
        let spec = StepSpec {
            goal: "edit".to_string(),
            file_allowlist: vec!["src".to_string(), " src ".to_string()],
            ..StepSpec::default()
        };
        store.create_steps(job_id, &[spec]).expect("create");
        let step = &store.list_steps(job_id).expect("list")[0];
        assert_eq!(step.scope, "repo");
        assert_eq!(step.acceptance_criteria, vec!["Changes applied", "No errors"]);
        assert_eq!(step.file_allowlist, vec!["src"]);
    }

    #[test]
    fn create_steps_for_missing_job_fails() {
        let mut store = Store::open_in_memory().expect("store");
        assert!(matches!(
            store.create_steps(5, &[StepSpec::new("x")]),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn claiming_a_step_starts_the_job() {
        let (mut store, job_id) = store_with_job();
        store
            .create_steps(job_id, &[StepSpec::new("one")])
            .expect("create");
        store.claim_next_step(job_id).expect("claim").expect("step");
        let job = store.get_job(job_id).expect("get").expect("job");
        assert_eq!(job.status, UnitStatus::Running);
        assert!(job.started_at.is_some());
    }

    #[test]
    fn running_sibling_blocks_the_next_claim() {
        let (mut store, job_id) = store_with_job();
        store
            .create_steps(job_id, &[StepSpec::new("one"), StepSpec::new("two")])
            .expect("create");
        let first = store.claim_next_step(job_id).expect("claim").expect("step");
        assert!(store.claim_next_step(job_id).expect("claim").is_none());
        store
            .mark_step_status(first.id, UnitStatus::Done, None, Some("r.json"))
            .expect("mark");
        let second = store.claim_next_step(job_id).expect("claim").expect("step");
        assert_eq!(second.index, 2);
        let first = store.get_step(first.id).expect("get").expect("step");
        assert_eq!(first.report_path.as_deref(), Some("r.json"));
        assert!(first.finished_at.is_some());
    }

    #[test]
    fn queued_units_cannot_be_marked_before_a_claim() {
        let (mut store, job_id) = store_with_job();
        store
            .create_steps(job_id, &[StepSpec::new("one")])
            .expect("create");
        let step_id = store.list_steps(job_id).expect("list")[0].id;
        store
            .create_subtasks(step_id, &[SubtaskSpec::new("a", "do a")])
            .expect("create");
        let subtask_id = store.list_subtasks(step_id).expect("list")[0].id;

        let err = store
            .mark_step_status(step_id, UnitStatus::Done, None, None)
            .expect_err("queued step");
        assert!(matches!(
            err,
            StoreError::InvalidTransition {
                from: UnitStatus::Queued,
                to: UnitStatus::Done,
                ..
            }
        ));
        let err = store
            .mark_subtask_status(subtask_id, UnitStatus::Failed, Some("x"), None)
            .expect_err("queued subtask");
        assert!(matches!(err, StoreError::InvalidTransition { .. }));
        let step = store.get_step(step_id).expect("get").expect("step");
        assert_eq!(step.status, UnitStatus::Queued);
        assert!(step.finished_at.is_none());

        let claimed = store.claim_next_step(job_id).expect("claim").expect("step");
        store
            .mark_step_status(claimed.id, UnitStatus::Done, None, None)
            .expect("running step");
    }

    #[test]
    fn subtasks_follow_the_same_protocol() {
        let (mut store, job_id) = store_with_job();
        store
            .create_steps(job_id, &[StepSpec::new("one")])
            .expect("create");
        let step_id = store.list_steps(job_id).expect("list")[0].id;
        let specs = [
            SubtaskSpec::new("a", "do a"),
            SubtaskSpec::new("", "skipped"),
            SubtaskSpec::new("b", "do b"),
        ];
        assert_eq!(store.create_subtasks(step_id, &specs).expect("create"), 2);

        let a = store.claim_next_subtask(step_id).expect("claim").expect("a");
        assert_eq!((a.index, a.title.as_str(), a.job_id), (1, "a", job_id));
        let step = store.get_step(step_id).expect("get").expect("step");
        assert_eq!(step.status, UnitStatus::Running);

        store
            .mark_subtask_status(a.id, UnitStatus::Failed, Some("nope"), None)
            .expect("mark");
        let b = store.claim_next_subtask(step_id).expect("claim").expect("b");
        assert_eq!(b.index, 2);
        store
            .mark_subtask_status(b.id, UnitStatus::Done, None, None)
            .expect("mark");
        assert!(store.claim_next_subtask(step_id).expect("claim").is_none());
    }
}

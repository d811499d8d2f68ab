//! Deterministic on-disk addressing for logs and JSON artifacts.
//!
//! Logs live under `log_dir`, reports under `report_dir`:
//!
//! | Artifact | Path |
//! |---|---|
//! | job log | `job_{job}.log` |
//! | step log | `job_{job}_step_{step}.log` |
//! | subtask log | `job_{job}_step_{step}_task_{subtask}.log` |
//! | job report | `job_{job}.json` |
//! | job plan | `job_{job}_plan.json` |
//! | job architecture | `job_{job}_architecture.json` |
//! | step report | `job_{job}_step_{step}.json` |
//! | subtask report | `job_{job}_step_{step}_task_{subtask}.json` |

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::warn;

use super::clock::now_rfc3339;
use crate::core::report::Stamped;

/// Identity of a job, step or subtask, used to key logs and reports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Scope {
    Job(i64),
    Step {
        job_id: i64,
        step_id: i64,
    },
    Subtask {
        job_id: i64,
        step_id: i64,
        subtask_id: i64,
    },
}

impl Scope {
    pub fn job_id(self) -> i64 {
        match self {
            Scope::Job(job_id) | Scope::Step { job_id, .. } | Scope::Subtask { job_id, .. } => {
                job_id
            }
        }
    }

    pub fn step_id(self) -> Option<i64> {
        match self {
            Scope::Job(_) => None,
            Scope::Step { step_id, .. } | Scope::Subtask { step_id, .. } => Some(step_id),
        }
    }

    pub fn subtask_id(self) -> Option<i64> {
        match self {
            Scope::Subtask { subtask_id, .. } => Some(subtask_id),
            _ => None,
        }
    }

    /// This scope and every enclosing scope, outermost first.
    pub fn lineage(self) -> Vec<Scope> {
        match self {
            Scope::Job(_) => vec![self],
            Scope::Step { job_id, .. } => vec![Scope::Job(job_id), self],
            Scope::Subtask {
                job_id, step_id, ..
            } => vec![Scope::Job(job_id), Scope::Step { job_id, step_id }, self],
        }
    }

    fn stem(self) -> String {
        match self {
            Scope::Job(job_id) => format!("job_{job_id}"),
            Scope::Step { job_id, step_id } => format!("job_{job_id}_step_{step_id}"),
            Scope::Subtask {
                job_id,
                step_id,
                subtask_id,
            } => format!("job_{job_id}_step_{step_id}_task_{subtask_id}"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactLayout {
    pub log_dir: PathBuf,
    pub report_dir: PathBuf,
}

impl ArtifactLayout {
    pub fn new(log_dir: impl Into<PathBuf>, report_dir: impl Into<PathBuf>) -> Self {
        Self {
            log_dir: log_dir.into(),
            report_dir: report_dir.into(),
        }
    }

    pub fn log_path(&self, scope: Scope) -> PathBuf {
        self.log_dir.join(format!("{}.log", scope.stem()))
    }

    pub fn report_path(&self, scope: Scope) -> PathBuf {
        self.report_dir.join(format!("{}.json", scope.stem()))
    }

    pub fn plan_path(&self, job_id: i64) -> PathBuf {
        self.report_dir.join(format!("job_{job_id}_plan.json"))
    }

    pub fn architecture_path(&self, job_id: i64) -> PathBuf {
        self.report_dir
            .join(format!("job_{job_id}_architecture.json"))
    }

    pub fn ensure_dirs(&self) -> Result<()> {
        for dir in [&self.log_dir, &self.report_dir] {
            fs::create_dir_all(dir).with_context(|| format!("create {}", dir.display()))?;
        }
        Ok(())
    }

    /// Write `body` as the report for `scope`, stamped with ids and time.
    pub fn write_report<T: Serialize>(&self, scope: Scope, body: &T) -> Result<PathBuf> {
        let path = self.report_path(scope);
        let stamped = Stamped {
            job_id: scope.job_id(),
            step_id: scope.step_id(),
            subtask_id: scope.subtask_id(),
            generated_at: now_rfc3339(),
            body,
        };
        write_json(&path, &stamped)?;
        Ok(path)
    }

    pub fn write_plan<T: Serialize>(&self, job_id: i64, plan: &T) -> Result<PathBuf> {
        let path = self.plan_path(job_id);
        write_json(&path, &self.stamp(job_id, plan))?;
        Ok(path)
    }

    pub fn write_architecture<T: Serialize>(&self, job_id: i64, architecture: &T) -> Result<PathBuf> {
        let path = self.architecture_path(job_id);
        write_json(&path, &self.stamp(job_id, architecture))?;
        Ok(path)
    }

    /// Remove every log and report keyed by `scope`. Missing files are ignored.
    pub fn remove_scope(&self, scope: Scope) {
        remove_quietly(&self.log_path(scope));
        remove_quietly(&self.report_path(scope));
        if let Scope::Job(job_id) = scope {
            remove_quietly(&self.plan_path(job_id));
            remove_quietly(&self.architecture_path(job_id));
        }
    }

    fn stamp<'a, T>(&self, job_id: i64, body: &'a T) -> Stamped<&'a T> {
        Stamped {
            job_id,
            step_id: None,
            subtask_id: None,
            generated_at: now_rfc3339(),
            body,
        }
    }
}

/// Serialize `value` to pretty-printed JSON with trailing newline.
pub fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).with_context(|| format!("create {}", parent.display()))?;
    }
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    fs::write(path, buf).with_context(|| format!("write {}", path.display()))
}

/// Read a JSON artifact, returning `None` when it does not exist.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    let contents = match fs::read_to_string(path) {
        Ok(contents) => contents,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(err) => return Err(err).with_context(|| format!("read {}", path.display())),
    };
    let value =
        serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(Some(value))
}

fn remove_quietly(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(err) if err.kind() == io::ErrorKind::NotFound => {}
        Err(err) => warn!(path = %path.display(), err = %err, "failed to remove artifact"),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::report::{ReportStatus, WorkReport};
    use serde_json::Value;

    #[test]
    fn artifact_paths_are_stable() {
        let layout = ArtifactLayout::new("/var/logs", "/var/reports");
        let subtask = Scope::Subtask {
            job_id: 3,
            step_id: 7,
            subtask_id: 11,
        };
        assert_eq!(
            layout.log_path(Scope::Job(3)),
            PathBuf::from("/var/logs/job_3.log")
        );
        assert_eq!(
            layout.log_path(Scope::Step {
                job_id: 3,
                step_id: 7
            }),
            PathBuf::from("/var/logs/job_3_step_7.log")
        );
        assert_eq!(
            layout.log_path(subtask),
            PathBuf::from("/var/logs/job_3_step_7_task_11.log")
        );
        assert_eq!(
            layout.report_path(subtask),
            PathBuf::from("/var/reports/job_3_step_7_task_11.json")
        );
        assert_eq!(
            layout.plan_path(3),
            PathBuf::from("/var/reports/job_3_plan.json")
        );
        assert_eq!(
            layout.architecture_path(3),
            PathBuf::from("/var/reports/job_3_architecture.json")
        );
    }

    #[test]
    fn lineage_lists_enclosing_scopes() {
        let scope = Scope::Subtask {
            job_id: 1,
            step_id: 2,
            subtask_id: 3,
        };
        assert_eq!(
            scope.lineage(),
            vec![
                Scope::Job(1),
                Scope::Step {
                    job_id: 1,
                    step_id: 2
                },
                scope
            ]
        );
    }

    #[test]
    fn write_report_stamps_ids() {
        let temp = tempfile::tempdir().expect("tempdir");
        let layout = ArtifactLayout::new(temp.path().join("logs"), temp.path().join("reports"));
        let scope = Scope::Step {
            job_id: 5,
            step_id: 6,
        };
        let path = layout
            .write_report(scope, &WorkReport::new(ReportStatus::Success, "done"))
            .expect("write");
        let value: Value = read_json(&path).expect("read").expect("exists");
        assert_eq!(value["job_id"], 5);
        assert_eq!(value["step_id"], 6);
        assert_eq!(value["summary"], "done");
        assert!(value["generated_at"].as_str().is_some());
    }

    #[test]
    fn read_json_missing_is_none() {
        let temp = tempfile::tempdir().expect("tempdir");
        let value: Option<Value> = read_json(&temp.path().join("nope.json")).expect("read");
        assert!(value.is_none());
    }
}

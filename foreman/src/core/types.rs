//! Work-item data model shared by the store, the worker and the CLI.
//!
//! A [`Job`] owns an ordered list of [`Step`]s, and each step owns an ordered
//! list of [`Subtask`]s. All three share [`UnitStatus`].

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// Acceptance criteria used when a spec does not provide any.
pub const DEFAULT_ACCEPTANCE: [&str; 2] = ["Changes applied", "No errors"];
/// Scope label used when a spec does not provide one.
pub const DEFAULT_SCOPE: &str = "repo";

/// Lifecycle status of a job, step or subtask.
///
/// Units only move `queued -> running -> {done, failed}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UnitStatus {
    Queued,
    Running,
    Done,
    Failed,
}

impl UnitStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            UnitStatus::Queued => "queued",
            UnitStatus::Running => "running",
            UnitStatus::Done => "done",
            UnitStatus::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, UnitStatus::Done | UnitStatus::Failed)
    }
}

impl fmt::Display for UnitStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for UnitStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(UnitStatus::Queued),
            "running" => Ok(UnitStatus::Running),
            "done" => Ok(UnitStatus::Done),
            "failed" => Ok(UnitStatus::Failed),
            other => Err(format!("unknown status {other:?}")),
        }
    }
}

/// Free-form job metadata. Unknown keys are preserved.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct JobMeta {
    /// Repository name or relative path under the workspaces directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repo: Option<String>,
    /// Run the repository's tests after all steps succeed.
    #[serde(default)]
    pub run_tests: bool,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Job {
    pub id: i64,
    pub title: String,
    pub request: String,
    pub meta: JobMeta,
    pub status: UnitStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub last_log_at: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Step {
    pub id: i64,
    pub job_id: i64,
    pub index: u32,
    pub goal: String,
    pub acceptance_criteria: Vec<String>,
    pub scope: String,
    pub constraints: Vec<String>,
    pub file_allowlist: Vec<String>,
    pub command_allowlist: Vec<String>,
    pub status: UnitStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub report_path: Option<String>,
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Subtask {
    pub id: i64,
    pub job_id: i64,
    pub step_id: i64,
    pub index: u32,
    pub title: String,
    pub instruction: String,
    pub acceptance_criteria: Vec<String>,
    pub scope: String,
    pub constraints: Vec<String>,
    pub file_allowlist: Vec<String>,
    pub command_allowlist: Vec<String>,
    pub status: UnitStatus,
    pub created_at: String,
    pub started_at: Option<String>,
    pub finished_at: Option<String>,
    pub report_path: Option<String>,
    pub error: Option<String>,
}

/// Planner output for one step, before insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StepSpec {
    pub goal: String,
    pub acceptance_criteria: Vec<String>,
    pub scope: String,
    pub constraints: Vec<String>,
    pub file_allowlist: Vec<String>,
    pub command_allowlist: Vec<String>,
}

impl StepSpec {
    pub fn new(goal: impl Into<String>) -> Self {
        Self {
            goal: goal.into(),
            ..Self::default()
        }
    }

    /// Trim and fill defaults. Returns `None` when the goal is blank.
    pub fn normalized(&self) -> Option<StepSpec> {
        let goal = self.goal.trim();
        if goal.is_empty() {
            return None;
        }
        Some(StepSpec {
            goal: goal.to_string(),
            acceptance_criteria: acceptance_or_default(&self.acceptance_criteria),
            scope: scope_or_default(&self.scope),
            constraints: normalize_string_list(&self.constraints),
            file_allowlist: normalize_string_list(&self.file_allowlist),
            command_allowlist: normalize_string_list(&self.command_allowlist),
        })
    }
}

/// Decomposition output for one subtask, before insertion.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtaskSpec {
    pub title: String,
    pub instruction: String,
    pub acceptance_criteria: Vec<String>,
    pub scope: String,
    pub constraints: Vec<String>,
    pub file_allowlist: Vec<String>,
    pub command_allowlist: Vec<String>,
}

impl SubtaskSpec {
    pub fn new(title: impl Into<String>, instruction: impl Into<String>) -> Self {
        Self {
            title: title.into(),
            instruction: instruction.into(),
            ..Self::default()
        }
    }

    /// Single subtask covering the whole step, used when decomposition yields nothing.
    pub fn covering(step: &Step) -> Self {
        Self {
            title: "Implement step".to_string(),
            instruction: step.goal.clone(),
            acceptance_criteria: step.acceptance_criteria.clone(),
            scope: step.scope.clone(),
            constraints: step.constraints.clone(),
            file_allowlist: step.file_allowlist.clone(),
            command_allowlist: step.command_allowlist.clone(),
        }
    }

    /// Trim and fill defaults. Returns `None` when title or instruction is blank.
    pub fn normalized(&self) -> Option<SubtaskSpec> {
        let title = self.title.trim();
        let instruction = self.instruction.trim();
        if title.is_empty() || instruction.is_empty() {
            return None;
        }
        Some(SubtaskSpec {
            title: title.to_string(),
            instruction: instruction.to_string(),
            acceptance_criteria: acceptance_or_default(&self.acceptance_criteria),
            scope: scope_or_default(&self.scope),
            constraints: normalize_string_list(&self.constraints),
            file_allowlist: normalize_string_list(&self.file_allowlist),
            command_allowlist: normalize_string_list(&self.command_allowlist),
        })
    }
}

/// Trim entries, drop blanks and duplicates, keep first-seen order.
pub fn normalize_string_list<S: AsRef<str>>(items: &[S]) -> Vec<String> {
    let mut out: Vec<String> = Vec::with_capacity(items.len());
    for item in items {
        let trimmed = item.as_ref().trim();
        if trimmed.is_empty() || out.iter().any(|seen| seen == trimmed) {
            continue;
        }
        out.push(trimmed.to_string());
    }
    out
}

fn acceptance_or_default(criteria: &[String]) -> Vec<String> {
    let criteria = normalize_string_list(criteria);
    if criteria.is_empty() {
        return DEFAULT_ACCEPTANCE.iter().map(|c| c.to_string()).collect();
    }
    criteria
}

fn scope_or_default(scope: &str) -> String {
    let scope = scope.trim();
    if scope.is_empty() {
        DEFAULT_SCOPE.to_string()
    } else {
        scope.to_string()
    }
}

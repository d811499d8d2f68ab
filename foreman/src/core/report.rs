//! JSON report bodies written for subtasks, steps and jobs.

use serde::{Deserialize, Serialize};

use super::types::{Step, StepSpec, Subtask};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReportStatus {
    Success,
    Failed,
}

impl ReportStatus {
    pub fn is_success(self) -> bool {
        self == ReportStatus::Success
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckStatus {
    Pass,
    Fail,
    #[default]
    NotRun,
    /// Tests were requested but no test command is known for the repository.
    NotConfigured,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Checks {
    pub install: CheckStatus,
    pub lint: CheckStatus,
    pub test: CheckStatus,
    pub build: CheckStatus,
}

/// Fields shared by every report level.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkReport {
    pub status: ReportStatus,
    pub summary: String,
    #[serde(default)]
    pub changed_files: Vec<String>,
    #[serde(default)]
    pub commands_run: Vec<String>,
    #[serde(default)]
    pub checks: Checks,
    #[serde(default)]
    pub risks: Vec<String>,
}

impl WorkReport {
    pub fn new(status: ReportStatus, summary: impl Into<String>) -> Self {
        Self {
            status,
            summary: summary.into(),
            changed_files: Vec::new(),
            commands_run: Vec::new(),
            checks: Checks::default(),
            risks: Vec::new(),
        }
    }
}

/// One child unit as listed in its parent's report.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UnitOutcome {
    pub id: i64,
    pub index: u32,
    pub title: String,
    pub status: ReportStatus,
    pub summary: String,
}

/// What a unit was asked to do, repeated in its report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UnitBrief {
    pub acceptance_criteria: Vec<String>,
    pub scope: String,
    pub constraints: Vec<String>,
    pub file_allowlist: Vec<String>,
    pub command_allowlist: Vec<String>,
}

impl UnitBrief {
    pub fn of_step(step: &Step) -> Self {
        Self {
            acceptance_criteria: step.acceptance_criteria.clone(),
            scope: step.scope.clone(),
            constraints: step.constraints.clone(),
            file_allowlist: step.file_allowlist.clone(),
            command_allowlist: step.command_allowlist.clone(),
        }
    }

    pub fn of_subtask(subtask: &Subtask) -> Self {
        Self {
            acceptance_criteria: subtask.acceptance_criteria.clone(),
            scope: subtask.scope.clone(),
            constraints: subtask.constraints.clone(),
            file_allowlist: subtask.file_allowlist.clone(),
            command_allowlist: subtask.command_allowlist.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SubtaskReport {
    #[serde(flatten)]
    pub work: WorkReport,
    pub title: String,
    pub instruction: String,
    #[serde(flatten)]
    pub brief: UnitBrief,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepReport {
    #[serde(flatten)]
    pub work: WorkReport,
    pub goal: String,
    #[serde(flatten)]
    pub brief: UnitBrief,
    #[serde(default)]
    pub subtasks: Vec<UnitOutcome>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub created: bool,
    pub url: String,
    pub branch: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobReport {
    #[serde(flatten)]
    pub work: WorkReport,
    #[serde(default)]
    pub pr: PullRequest,
    #[serde(default)]
    pub steps: Vec<UnitOutcome>,
}

impl JobReport {
    /// Report written when processing aborts with an error.
    pub fn failure(summary: impl Into<String>) -> Self {
        Self {
            work: WorkReport::new(ReportStatus::Failed, summary),
            pr: PullRequest::default(),
            steps: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanArtifact {
    pub steps: Vec<StepSpec>,
}

/// Identity and timestamp added to every persisted report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stamped<T> {
    pub job_id: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub step_id: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subtask_id: Option<i64>,
    pub generated_at: String,
    #[serde(flatten)]
    pub body: T,
}

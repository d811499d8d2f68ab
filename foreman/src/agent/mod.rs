//! Agent abstraction for planning, decomposition and unit execution.
//!
//! The worker never talks to a language model directly. It hands requests to
//! an [`Agent`]; execution requests come with a [`ToolSession`] through which
//! every file and command operation must go.

mod command;

use std::path::Path;

use anyhow::Result;
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use command::CommandAgent;

use crate::core::report::{Checks, ReportStatus};
use crate::core::types::{Step, StepSpec, Subtask, SubtaskSpec};
use crate::io::gate::Gate;
use crate::session::ToolSession;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PlanRequest {
    pub job_id: i64,
    pub title: String,
    pub request: String,
    /// Top of the repository tree, as `list_files` would return it.
    pub repo_files: Vec<String>,
    pub run_tests: bool,
    pub test_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DecomposeRequest {
    pub job_id: i64,
    pub request: String,
    pub step: Step,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ExecuteRequest {
    pub job_id: i64,
    pub request: String,
    pub step: Step,
    /// The subtask with its effective allowlists.
    pub subtask: Subtask,
    pub run_tests: bool,
    pub test_command: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepairRequest {
    pub job_id: i64,
    pub request: String,
    pub test_command: String,
    pub attempt: u32,
    /// Tail of the failing test output.
    pub output: String,
}

/// Wire form of a request, tagged with `kind`.
#[derive(Debug, Clone, Copy, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum AgentRequest<'a> {
    Plan(&'a PlanRequest),
    Decompose(&'a DecomposeRequest),
    Execute(&'a ExecuteRequest),
    Repair(&'a RepairRequest),
}

impl AgentRequest<'_> {
    pub fn kind(&self) -> &'static str {
        match self {
            AgentRequest::Plan(_) => "plan",
            AgentRequest::Decompose(_) => "decompose",
            AgentRequest::Execute(_) => "execute",
            AgentRequest::Repair(_) => "repair",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(default)]
pub struct Plan {
    pub steps: Vec<StepSpec>,
    /// Free-form architecture notes, persisted as the job's architecture artifact.
    pub architecture: Option<Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct Decomposition {
    pub subtasks: Vec<SubtaskSpec>,
}

/// Final answer for an execute or repair request.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct UnitReply {
    pub status: ReportStatus,
    pub summary: String,
    pub risks: Vec<String>,
    pub checks: Checks,
}

impl Default for UnitReply {
    fn default() -> Self {
        Self {
            status: ReportStatus::Success,
            summary: String::new(),
            risks: Vec::new(),
            checks: Checks::default(),
        }
    }
}

impl UnitReply {
    pub fn success(summary: impl Into<String>) -> Self {
        Self {
            summary: summary.into(),
            ..Self::default()
        }
    }

    pub fn failed(summary: impl Into<String>) -> Self {
        Self {
            status: ReportStatus::Failed,
            summary: summary.into(),
            ..Self::default()
        }
    }
}

/// Backend that plans, decomposes and executes work.
///
/// Implementations check `gate` (or the session's gate) before every
/// round-trip and return [`Cancelled`](crate::io::gate::Cancelled) through the
/// error when it is closed.
pub trait Agent {
    /// Called once per job with the repository the job works in.
    fn attach(&mut self, _repo_root: &Path) {}

    fn plan(&mut self, request: &PlanRequest, gate: &dyn Gate) -> Result<Plan>;

    fn decompose(&mut self, request: &DecomposeRequest, gate: &dyn Gate) -> Result<Decomposition>;

    fn execute(&mut self, request: &ExecuteRequest, tools: &mut ToolSession<'_>) -> Result<UnitReply>;

    fn repair(&mut self, request: &RepairRequest, tools: &mut ToolSession<'_>) -> Result<UnitReply>;
}

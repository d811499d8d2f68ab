//! Test-only helpers: a scripted agent, a switchable gate and a temp home.

use std::collections::VecDeque;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::Result;

use crate::agent::{
    Agent, DecomposeRequest, Decomposition, ExecuteRequest, Plan, PlanRequest, RepairRequest,
    UnitReply,
};
use crate::core::types::{StepSpec, Subtask};
use crate::io::artifacts::ArtifactLayout;
use crate::io::config::{ForemanConfig, Home};
use crate::io::gate::Gate;
use crate::io::joblog::LogBook;
use crate::io::sandbox::{ToolCall, ToolResult};
use crate::io::store::Store;
use crate::session::ToolSession;
use crate::worker::{Worker, WorkerSettings};

/// Gate shared between a test and the worker it drives.
#[derive(Debug, Clone)]
pub struct SwitchGate(Arc<AtomicBool>);

impl SwitchGate {
    pub fn open() -> Self {
        Self(Arc::new(AtomicBool::new(true)))
    }

    pub fn set(&self, open: bool) {
        self.0.store(open, Ordering::SeqCst);
    }
}

impl Gate for SwitchGate {
    fn is_open(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

#[derive(Debug, Clone)]
pub enum Action {
    Call(ToolCall),
    CloseGate(SwitchGate),
}

/// What the agent does for one execute or repair request.
#[derive(Debug, Clone)]
pub struct Script {
    pub actions: Vec<Action>,
    pub reply: UnitReply,
}

impl Script {
    pub fn reply(reply: UnitReply) -> Self {
        Self {
            actions: Vec::new(),
            reply,
        }
    }

    pub fn call(mut self, call: ToolCall) -> Self {
        self.actions.push(Action::Call(call));
        self
    }

    pub fn close_gate(mut self, gate: &SwitchGate) -> Self {
        self.actions.push(Action::CloseGate(gate.clone()));
        self
    }
}

pub fn write_call(path: &str, content: &str) -> ToolCall {
    ToolCall::WriteFile {
        path: path.to_string(),
        content: content.to_string(),
    }
}

/// Agent answering from queues. Exhausted queues yield an empty plan, an
/// empty decomposition, or a successful reply with no summary.
#[derive(Debug, Default)]
pub struct ScriptedAgent {
    pub plans: VecDeque<Plan>,
    pub decompositions: VecDeque<Decomposition>,
    pub executions: VecDeque<Script>,
    pub repairs: VecDeque<Script>,
    /// Request kinds in the order they arrived.
    pub seen: Vec<&'static str>,
    /// Subtasks as handed to `execute`, with their effective allowlists.
    pub executed: Vec<Subtask>,
    pub tool_results: Vec<ToolResult>,
    pub repair_outputs: Vec<String>,
    pub attached: Option<PathBuf>,
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_plan(mut self, steps: Vec<StepSpec>) -> Self {
        self.plans.push_back(Plan {
            steps,
            architecture: None,
        });
        self
    }

    pub fn with_decomposition(mut self, decomposition: Decomposition) -> Self {
        self.decompositions.push_back(decomposition);
        self
    }

    pub fn with_execution(mut self, script: Script) -> Self {
        self.executions.push_back(script);
        self
    }

    pub fn with_repair(mut self, script: Script) -> Self {
        self.repairs.push_back(script);
        self
    }

    fn perform(&mut self, script: Script, tools: &mut ToolSession<'_>) -> Result<UnitReply> {
        for action in script.actions {
            match action {
                Action::Call(call) => {
                    let result = tools.call(&call)?;
                    self.tool_results.push(result);
                }
                Action::CloseGate(gate) => gate.set(false),
            }
        }
        tools.checkpoint()?;
        Ok(script.reply)
    }
}

impl Agent for ScriptedAgent {
    fn attach(&mut self, repo_root: &Path) {
        self.attached = Some(repo_root.to_path_buf());
    }

    fn plan(&mut self, _request: &PlanRequest, gate: &dyn Gate) -> Result<Plan> {
        gate.check()?;
        self.seen.push("plan");
        Ok(self.plans.pop_front().unwrap_or_default())
    }

    fn decompose(&mut self, _request: &DecomposeRequest, gate: &dyn Gate) -> Result<Decomposition> {
        gate.check()?;
        self.seen.push("decompose");
        Ok(self.decompositions.pop_front().unwrap_or_default())
    }

    fn execute(&mut self, request: &ExecuteRequest, tools: &mut ToolSession<'_>) -> Result<UnitReply> {
        self.seen.push("execute");
        self.executed.push(request.subtask.clone());
        let script = self
            .executions
            .pop_front()
            .unwrap_or_else(|| Script::reply(UnitReply::default()));
        self.perform(script, tools)
    }

    fn repair(&mut self, request: &RepairRequest, tools: &mut ToolSession<'_>) -> Result<UnitReply> {
        self.seen.push("repair");
        self.repair_outputs.push(request.output.clone());
        let script = self
            .repairs
            .pop_front()
            .unwrap_or_else(|| Script::reply(UnitReply::default()));
        self.perform(script, tools)
    }
}

/// Temporary foreman home with one repository under `workspaces/`.
pub struct TestEnv {
    pub temp: tempfile::TempDir,
    pub home: Home,
}

impl TestEnv {
    pub const REPO: &'static str = "demo";

    pub fn new() -> Self {
        Self::with_config(ForemanConfig::default())
    }

    pub fn with_config(mut config: ForemanConfig) -> Self {
        let temp = tempfile::tempdir().expect("tempdir");
        config.worker.poll_interval_ms = 10;
        let home = Home::new(temp.path(), config);
        fs::create_dir_all(home.workspaces_dir().join(Self::REPO)).expect("create repo");
        Self { temp, home }
    }

    pub fn repo(&self) -> PathBuf {
        self.home.workspaces_dir().join(Self::REPO)
    }

    pub fn layout(&self) -> ArtifactLayout {
        self.home.layout()
    }

    pub fn logs(&self) -> LogBook {
        LogBook::new(self.layout(), self.home.config.max_log_bytes)
    }

    pub fn store(&self) -> Store {
        Store::open(&self.home.database()).expect("open store")
    }

    pub fn settings(&self) -> WorkerSettings {
        WorkerSettings {
            worker_id: "test".to_string(),
            ..WorkerSettings::from_home(&self.home)
        }
    }

    pub fn worker<A: Agent>(&self, agent: A, gate: impl Gate + 'static) -> Worker<A> {
        Worker::new(
            self.store(),
            self.logs(),
            agent,
            Box::new(gate),
            self.settings(),
        )
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

//! Worker loop: claim a job, plan it, and execute its steps and subtasks.
//!
//! Every unit is obtained through a claim, so steps run in index order and
//! subtasks run in index order within their step. The first failing subtask
//! fails its step, and the first failing step fails the job. A closed gate
//! interrupts processing and leaves the claimed units `running`.

use std::path::PathBuf;
use std::process;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{info, instrument, warn};

use crate::agent::{Agent, DecomposeRequest, ExecuteRequest, PlanRequest, RepairRequest};
use crate::core::allowlist::{CommandAllowlist, PathAllowlist};
use crate::core::command_policy::CommandPolicy;
use crate::core::report::{
    CheckStatus, Checks, JobReport, PlanArtifact, PullRequest, ReportStatus, StepReport,
    SubtaskReport, UnitBrief, UnitOutcome, WorkReport,
};
use crate::core::types::{Job, Step, StepSpec, Subtask, SubtaskSpec, UnitStatus};
use crate::io::artifacts::Scope;
use crate::io::config::{Home, WORKER_ID_ENV};
use crate::io::gate::{Cancelled, Gate};
use crate::io::joblog::LogBook;
use crate::io::sandbox::{
    DEFAULT_LIST_DEPTH, DEFAULT_LIST_MAX_ENTRIES, Sandbox, SandboxLimits, ToolCall, ToolResult,
    list_tree,
};
use crate::io::store::{Store, StoreError};
use crate::io::workspace::{detect_test_command, resolve_repo_root};
use crate::session::{ToolSession, UnitLog};

/// Planner fallback when the agent proposes no usable step.
pub const FALLBACK_STEP_GOAL: &str = "Implement the request.";
const TEST_OUTPUT_TAIL_CHARS: usize = 4000;

#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub worker_id: String,
    pub workspaces_dir: PathBuf,
    pub poll_interval: Duration,
    pub max_fix_loops: u32,
    pub test_command: Option<String>,
    pub policy: CommandPolicy,
    pub limits: SandboxLimits,
}

impl WorkerSettings {
    pub fn from_home(home: &Home) -> Self {
        let config = &home.config;
        Self {
            worker_id: default_worker_id(),
            workspaces_dir: home.workspaces_dir(),
            poll_interval: Duration::from_millis(config.worker.poll_interval_ms),
            max_fix_loops: config.worker.max_fix_loops,
            test_command: config.worker.test_command.clone(),
            policy: config.command_policy(),
            limits: config.sandbox_limits(),
        }
    }
}

/// `FOREMAN_WORKER_ID`, or one derived from the process id.
pub fn default_worker_id() -> String {
    std::env::var(WORKER_ID_ENV)
        .ok()
        .map(|id| id.trim().to_string())
        .filter(|id| !id.is_empty())
        .unwrap_or_else(|| format!("pid-{}", process::id()))
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkOutcome {
    /// No queued job.
    Idle,
    /// The gate was closed before claiming.
    GateClosed,
    Processed { job_id: i64, status: UnitStatus },
    /// The gate closed mid-job; the job's claimed units stay `running`.
    Cancelled { job_id: i64 },
}

/// Why job processing stopped early.
enum Interrupt {
    Cancelled,
    Failed(anyhow::Error),
}

impl From<Cancelled> for Interrupt {
    fn from(_: Cancelled) -> Self {
        Interrupt::Cancelled
    }
}

impl From<StoreError> for Interrupt {
    fn from(err: StoreError) -> Self {
        Interrupt::Failed(err.into())
    }
}

impl From<anyhow::Error> for Interrupt {
    fn from(err: anyhow::Error) -> Self {
        if err.chain().any(|cause| cause.is::<Cancelled>()) {
            Interrupt::Cancelled
        } else {
            Interrupt::Failed(err)
        }
    }
}

/// Per-job state shared by its steps.
struct JobRun<'j> {
    job: &'j Job,
    sandbox: Sandbox,
    test_command: Option<String>,
}

/// Accumulated results of one unit and its children.
#[derive(Debug, Default)]
struct Activity {
    changed_files: Vec<String>,
    commands_run: Vec<String>,
    risks: Vec<String>,
    /// Last non-empty summary reported by the agent.
    last_summary: Option<String>,
}

impl Activity {
    fn absorb_files(&mut self, files: impl IntoIterator<Item = String>) {
        for file in files {
            if !self.changed_files.contains(&file) {
                self.changed_files.push(file);
            }
        }
    }

    fn absorb(&mut self, other: Activity) {
        self.absorb_files(other.changed_files);
        self.commands_run.extend(other.commands_run);
        self.risks.extend(other.risks);
        if other.last_summary.is_some() {
            self.last_summary = other.last_summary;
        }
    }

    fn risks_deduped(&self) -> Vec<String> {
        let mut risks: Vec<String> = Vec::new();
        for risk in &self.risks {
            if !risks.contains(risk) {
                risks.push(risk.clone());
            }
        }
        risks
    }
}

struct UnitResult {
    outcome: UnitOutcome,
    activity: Activity,
}

impl UnitResult {
    fn failed(&self) -> bool {
        !self.outcome.status.is_success()
    }
}

pub struct Worker<A: Agent> {
    store: Store,
    logs: LogBook,
    agent: A,
    gate: Box<dyn Gate>,
    settings: WorkerSettings,
}

impl<A: Agent> Worker<A> {
    pub fn new(
        store: Store,
        logs: LogBook,
        agent: A,
        gate: Box<dyn Gate>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            store,
            logs,
            agent,
            gate,
            settings,
        }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }

    pub fn agent(&self) -> &A {
        &self.agent
    }

    /// Claim and process at most one job.
    #[instrument(skip_all, fields(worker = %self.settings.worker_id))]
    pub fn run_once(&mut self) -> Result<WorkOutcome> {
        if self.gate.check().is_err() {
            return Ok(WorkOutcome::GateClosed);
        }
        let Some(job) = self.store.claim_next_job()? else {
            return Ok(WorkOutcome::Idle);
        };
        let scope = Scope::Job(job.id);
        self.log(scope, &format!("worker {} claimed job", self.settings.worker_id));
        info!(job_id = job.id, "processing job");

        match self.process_job(&job) {
            Ok(report) => {
                let status = if report.work.status.is_success() {
                    UnitStatus::Done
                } else {
                    UnitStatus::Failed
                };
                self.logs
                    .layout()
                    .write_report(scope, &report)
                    .context("write job report")?;
                let error_text = (status == UnitStatus::Failed).then_some(report.work.summary.as_str());
                self.store.mark_job_status(job.id, status, error_text)?;
                self.log(scope, &format!("worker: job {status}"));
                Ok(WorkOutcome::Processed {
                    job_id: job.id,
                    status,
                })
            }
            Err(Interrupt::Cancelled) => {
                self.log(scope, "worker: interrupted, gate closed");
                warn!(job_id = job.id, "job interrupted by gate");
                Ok(WorkOutcome::Cancelled { job_id: job.id })
            }
            Err(Interrupt::Failed(err)) => {
                let message = format!("{err:#}");
                self.log(scope, &format!("worker: job failed: {message}"));
                warn!(job_id = job.id, err = %message, "job failed");
                if let Err(report_err) = self
                    .logs
                    .layout()
                    .write_report(scope, &JobReport::failure(&message))
                {
                    warn!(job_id = job.id, err = %format!("{report_err:#}"), "failed to write failure report");
                }
                self.store
                    .mark_job_status(job.id, UnitStatus::Failed, Some(&message))?;
                Ok(WorkOutcome::Processed {
                    job_id: job.id,
                    status: UnitStatus::Failed,
                })
            }
        }
    }

    /// Repeat [`run_once`](Self::run_once), sleeping while idle.
    ///
    /// Returns when the gate is closed, or after the first processed job when
    /// `once` is set (or the first idle poll).
    pub fn run_loop(&mut self, once: bool) -> Result<WorkOutcome> {
        loop {
            let outcome = self.run_once()?;
            match outcome {
                WorkOutcome::Idle if !once => thread::sleep(self.settings.poll_interval),
                WorkOutcome::Processed { .. } if !once => {}
                other => return Ok(other),
            }
        }
    }

    fn log(&self, scope: Scope, message: &str) {
        UnitLog::new(&self.logs, &self.store, scope).line(message);
    }

    fn process_job(&mut self, job: &Job) -> Result<JobReport, Interrupt> {
        let scope = Scope::Job(job.id);
        let repo_root = resolve_repo_root(&self.settings.workspaces_dir, job.meta.repo.as_deref())
            .context("resolve repository")?;
        self.log(scope, &format!("worker: repo root {}", repo_root.display()));
        self.agent.attach(&repo_root);

        let test_command = if job.meta.run_tests {
            detect_test_command(&repo_root, self.settings.test_command.as_deref())
        } else {
            None
        };
        let run = JobRun {
            job,
            sandbox: Sandbox::new(
                repo_root,
                self.settings.policy.clone(),
                self.settings.limits.clone(),
            ),
            test_command,
        };

        if self.store.list_steps(job.id)?.is_empty() {
            self.plan_job(&run)?;
        }

        let mut activity = Activity::default();
        let mut outcomes: Vec<UnitOutcome> = Vec::new();
        let mut job_failed = false;
        loop {
            self.gate.check()?;
            let Some(step) = self.store.claim_next_step(job.id)? else {
                break;
            };
            let result = self.process_step(&run, &step)?;
            let failed = result.failed();
            outcomes.push(result.outcome);
            activity.absorb(result.activity);
            if failed {
                job_failed = true;
                break;
            }
        }

        let mut checks = Checks::default();
        let mut status = if job_failed {
            ReportStatus::Failed
        } else {
            ReportStatus::Success
        };
        if job.meta.run_tests && !job_failed {
            let (test, tests_activity) = self.run_tests(&run)?;
            checks.test = test;
            if test == CheckStatus::Fail {
                status = ReportStatus::Failed;
            }
            activity.absorb(tests_activity);
        }

        let step_count = self.store.list_steps(job.id)?.len();
        let summary = match (&activity.last_summary, status) {
            (Some(summary), _) => summary.clone(),
            (None, ReportStatus::Success) => format!("Completed {step_count} step(s)."),
            (None, ReportStatus::Failed) if job_failed => "Step failed.".to_string(),
            (None, ReportStatus::Failed) => "Tests failed.".to_string(),
        };

        Ok(JobReport {
            work: WorkReport {
                status,
                summary,
                risks: activity.risks_deduped(),
                changed_files: activity.changed_files,
                commands_run: activity.commands_run,
                checks,
            },
            pr: PullRequest::default(),
            steps: outcomes,
        })
    }

    fn plan_job(&mut self, run: &JobRun<'_>) -> Result<(), Interrupt> {
        let job = run.job;
        let scope = Scope::Job(job.id);
        self.log(scope, "orchestrator: generating plan");
        let root = run.sandbox.root();
        let repo_files =
            list_tree(root, root, DEFAULT_LIST_DEPTH, DEFAULT_LIST_MAX_ENTRIES).unwrap_or_default();
        let request = PlanRequest {
            job_id: job.id,
            title: job.title.clone(),
            request: job.request.clone(),
            repo_files,
            run_tests: job.meta.run_tests,
            test_command: run.test_command.clone(),
        };
        let plan = self.agent.plan(&request, &*self.gate)?;

        let layout = self.logs.layout();
        if let Some(architecture) = &plan.architecture {
            layout
                .write_architecture(job.id, architecture)
                .context("write architecture")?;
        }
        let mut steps: Vec<StepSpec> = plan.steps.iter().filter_map(StepSpec::normalized).collect();
        if steps.is_empty() {
            self.log(scope, "orchestrator: empty plan, using a single step");
            steps.push(fallback_step());
        }
        layout
            .write_plan(job.id, &PlanArtifact {
                steps: steps.clone(),
            })
            .context("write plan")?;
        let created = self.store.create_steps(job.id, &steps)?;
        self.log(scope, &format!("orchestrator: created {created} step(s)"));
        Ok(())
    }

    #[instrument(skip_all, fields(step_id = step.id, index = step.index))]
    fn process_step(&mut self, run: &JobRun<'_>, step: &Step) -> Result<UnitResult, Interrupt> {
        let job = run.job;
        let scope = Scope::Step {
            job_id: job.id,
            step_id: step.id,
        };
        self.log(
            scope,
            &format!("worker: step {} (id {}) - {}", step.index, step.id, step.goal),
        );

        if self.store.list_subtasks(step.id)?.is_empty() {
            self.log(scope, "dept-head: generating subtasks");
            let request = DecomposeRequest {
                job_id: job.id,
                request: job.request.clone(),
                step: step.clone(),
            };
            let decomposition = self.agent.decompose(&request, &*self.gate)?;
            let mut specs: Vec<SubtaskSpec> = decomposition
                .subtasks
                .iter()
                .filter_map(SubtaskSpec::normalized)
                .collect();
            if specs.is_empty() {
                specs.push(SubtaskSpec::covering(step));
            }
            let created = self.store.create_subtasks(step.id, &specs)?;
            self.log(scope, &format!("dept-head: created {created} subtask(s)"));
        }

        let mut activity = Activity::default();
        let mut outcomes: Vec<UnitOutcome> = Vec::new();
        let mut failed = false;
        loop {
            self.gate.check()?;
            let Some(subtask) = self.store.claim_next_subtask(step.id)? else {
                break;
            };
            let result = self.run_subtask(run, step, subtask)?;
            failed = result.failed();
            outcomes.push(result.outcome);
            activity.absorb(result.activity);
            if failed {
                break;
            }
        }

        let (status, summary) = if failed {
            (ReportStatus::Failed, "Subtask failed.")
        } else {
            (ReportStatus::Success, "Step completed.")
        };
        let report = StepReport {
            work: WorkReport {
                status,
                summary: summary.to_string(),
                changed_files: activity.changed_files.clone(),
                commands_run: activity.commands_run.clone(),
                checks: Checks::default(),
                risks: activity.risks_deduped(),
            },
            goal: step.goal.clone(),
            brief: UnitBrief::of_step(step),
            subtasks: outcomes,
        };
        let report_path = self
            .logs
            .layout()
            .write_report(scope, &report)
            .context("write step report")?;
        let unit_status = if failed { UnitStatus::Failed } else { UnitStatus::Done };
        self.store.mark_step_status(
            step.id,
            unit_status,
            failed.then_some(summary),
            Some(&report_path.to_string_lossy()),
        )?;
        self.log(
            scope,
            &format!(
                "worker: step {} changed files +{}",
                step.index,
                activity.changed_files.len()
            ),
        );

        Ok(UnitResult {
            outcome: UnitOutcome {
                id: step.id,
                index: step.index,
                title: step.goal.clone(),
                status,
                summary: summary.to_string(),
            },
            activity,
        })
    }

    #[instrument(skip_all, fields(subtask_id = subtask.id, index = subtask.index))]
    fn run_subtask(
        &mut self,
        run: &JobRun<'_>,
        step: &Step,
        subtask: Subtask,
    ) -> Result<UnitResult, Interrupt> {
        let job = run.job;
        let subtask = inherit_from_step(subtask, step);
        let scope = Scope::Subtask {
            job_id: job.id,
            step_id: step.id,
            subtask_id: subtask.id,
        };
        let log = UnitLog::new(&self.logs, &self.store, scope);
        log.line(&format!(
            "worker: subtask {} (id {}) - {}",
            subtask.index, subtask.id, subtask.title
        ));

        let request = ExecuteRequest {
            job_id: job.id,
            request: job.request.clone(),
            step: step.clone(),
            subtask: subtask.clone(),
            run_tests: job.meta.run_tests,
            test_command: run.test_command.clone(),
        };
        let mut session = ToolSession::new(
            &run.sandbox,
            &*self.gate,
            log,
            PathAllowlist::new(&subtask.file_allowlist),
            CommandAllowlist::new(&subtask.command_allowlist),
        );
        let reply = self.agent.execute(&request, &mut session)?;
        let (changed_files, commands_run) = session.into_activity();

        let summary = reply.summary.trim();
        let failed = !reply.status.is_success();
        let report_summary = match (summary.is_empty(), failed) {
            (false, _) => summary.to_string(),
            (true, false) => "Subtask completed.".to_string(),
            (true, true) => "Subtask failed.".to_string(),
        };
        let report = SubtaskReport {
            work: WorkReport {
                status: reply.status,
                summary: report_summary.clone(),
                changed_files: changed_files.clone(),
                commands_run: commands_run.clone(),
                checks: reply.checks.clone(),
                risks: reply.risks.clone(),
            },
            title: subtask.title.clone(),
            instruction: subtask.instruction.clone(),
            brief: UnitBrief::of_subtask(&subtask),
        };
        let report_path = self
            .logs
            .layout()
            .write_report(scope, &report)
            .context("write subtask report")?;
        let unit_status = if failed { UnitStatus::Failed } else { UnitStatus::Done };
        self.store.mark_subtask_status(
            subtask.id,
            unit_status,
            failed.then_some(report_summary.as_str()),
            Some(&report_path.to_string_lossy()),
        )?;
        self.log(
            scope,
            &format!(
                "worker: subtask {} changed files +{}",
                subtask.index,
                changed_files.len()
            ),
        );

        Ok(UnitResult {
            outcome: UnitOutcome {
                id: subtask.id,
                index: subtask.index,
                title: subtask.title.clone(),
                status: reply.status,
                summary: report_summary,
            },
            activity: Activity {
                changed_files,
                commands_run,
                risks: reply.risks,
                last_summary: (!summary.is_empty()).then(|| summary.to_string()),
            },
        })
    }

    /// Run the test command, asking the agent for repairs while it fails.
    fn run_tests(&mut self, run: &JobRun<'_>) -> Result<(CheckStatus, Activity), Interrupt> {
        let job = run.job;
        let scope = Scope::Job(job.id);
        let mut activity = Activity::default();
        let Some(test_command) = run.test_command.clone() else {
            self.log(scope, "tests: no test command detected");
            return Ok((CheckStatus::NotConfigured, activity));
        };

        let mut attempt = 0u32;
        loop {
            self.gate.check()?;
            self.log(scope, &format!("tests: running {test_command}"));
            let mut session = ToolSession::new(
                &run.sandbox,
                &*self.gate,
                UnitLog::new(&self.logs, &self.store, scope),
                PathAllowlist::default(),
                CommandAllowlist::default(),
            );
            let result = session.call(&ToolCall::RunCommand {
                command: test_command.clone(),
                cwd: None,
            })?;
            let (_, commands_run) = session.into_activity();
            activity.commands_run.extend(commands_run);

            let output = match result {
                ToolResult::Command(output) if output.succeeded() => {
                    self.log(scope, "tests: passed");
                    return Ok((CheckStatus::Pass, activity));
                }
                ToolResult::Command(output) => output,
                other => {
                    let error = other.error_message().unwrap_or_default();
                    self.log(scope, &format!("tests: error: {error}"));
                    activity.risks.push(format!("test command could not run: {error}"));
                    return Ok((CheckStatus::Fail, activity));
                }
            };
            self.log(scope, &format!("tests: failed (exit {})", output.exit_code));
            if attempt >= self.settings.max_fix_loops {
                self.log(scope, "tests: max fix loops reached");
                return Ok((CheckStatus::Fail, activity));
            }

            attempt += 1;
            self.log(scope, &format!("tests: fix loop {attempt}"));
            let request = RepairRequest {
                job_id: job.id,
                request: job.request.clone(),
                test_command: test_command.clone(),
                attempt,
                output: tail_chars(
                    format!("{}\n{}", output.stdout, output.stderr).trim(),
                    TEST_OUTPUT_TAIL_CHARS,
                ),
            };
            let mut session = ToolSession::new(
                &run.sandbox,
                &*self.gate,
                UnitLog::new(&self.logs, &self.store, scope),
                PathAllowlist::default(),
                CommandAllowlist::default(),
            );
            let reply = self.agent.repair(&request, &mut session)?;
            let (changed_files, commands_run) = session.into_activity();
            activity.absorb(Activity {
                changed_files,
                commands_run,
                risks: reply.risks,
                last_summary: None,
            });
        }
    }
}

fn fallback_step() -> StepSpec {
    StepSpec {
        goal: FALLBACK_STEP_GOAL.to_string(),
        acceptance_criteria: vec![
            "Requested changes are applied".to_string(),
            "No errors from tools".to_string(),
        ],
        ..StepSpec::default()
    }
}

/// Empty subtask lists and a blank scope fall back to the step's.
fn inherit_from_step(mut subtask: Subtask, step: &Step) -> Subtask {
    if subtask.file_allowlist.is_empty() {
        subtask.file_allowlist = step.file_allowlist.clone();
    }
    if subtask.command_allowlist.is_empty() {
        subtask.command_allowlist = step.command_allowlist.clone();
    }
    if subtask.constraints.is_empty() {
        subtask.constraints = step.constraints.clone();
    }
    if subtask.scope.trim().is_empty() {
        subtask.scope = step.scope.clone();
    }
    subtask
}

fn tail_chars(text: &str, max_chars: usize) -> String {
    let count = text.chars().count();
    if count <= max_chars {
        return text.to_string();
    }
    text.chars().skip(count - max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn step_with(files: &[&str], commands: &[&str]) -> Step {
        Step {
            id: 1,
            job_id: 1,
            index: 1,
            goal: "goal".to_string(),
            acceptance_criteria: Vec::new(),
            scope: "api".to_string(),
            constraints: vec!["keep it small".to_string()],
            file_allowlist: files.iter().map(|f| f.to_string()).collect(),
            command_allowlist: commands.iter().map(|c| c.to_string()).collect(),
            status: UnitStatus::Running,
            created_at: String::new(),
            started_at: None,
            finished_at: None,
            report_path: None,
            error: None,
        }
    }

    fn subtask_with(files: &[&str]) -> Subtask {
        Subtask {
            id: 2,
            job_id: 1,
            step_id: 1,
            index: 1,
            title: "t".to_string(),
            instruction: "i".to_string(),
            acceptance_criteria: Vec::new(),
            scope: String::new(),
            constraints: Vec::new(),
            file_allowlist: files.iter().map(|f| f.to_string()).collect(),
            command_allowlist: Vec::new(),
            status: UnitStatus::Running,
            created_at: String::new(),
            started_at: None,
            finished_at: None,
            report_path: None,
            error: None,
        }
    }

    #[test]
    fn subtask_inherits_empty_lists_from_step() {
        let step = step_with(&["src"], &["cargo"]);
        let subtask = inherit_from_step(subtask_with(&[]), &step);
        assert_eq!(subtask.file_allowlist, vec!["src"]);
        assert_eq!(subtask.command_allowlist, vec!["cargo"]);
        assert_eq!(subtask.constraints, vec!["keep it small"]);
        assert_eq!(subtask.scope, "api");
    }

    #[test]
    fn subtask_keeps_its_own_lists() {
        let step = step_with(&["src"], &[]);
        let subtask = inherit_from_step(subtask_with(&["docs"]), &step);
        assert_eq!(subtask.file_allowlist, vec!["docs"]);
    }

    #[test]
    fn cancellation_is_recognized_through_context() {
        let err = anyhow::Error::from(Cancelled).context("execute subtask");
        assert!(matches!(Interrupt::from(err), Interrupt::Cancelled));
        let err = anyhow::anyhow!("boom");
        assert!(matches!(Interrupt::from(err), Interrupt::Failed(_)));
    }

    #[test]
    fn tail_keeps_last_chars() {
        assert_eq!(tail_chars("abcdef", 3), "def");
        assert_eq!(tail_chars("ab", 3), "ab");
        assert_eq!(tail_chars("héllo", 4), "éllo");
    }
}

//! Worker end-to-end runs against a scripted agent.

use std::fs;

use foreman::agent::{Decomposition, UnitReply};
use foreman::core::types::{Job, JobMeta, StepSpec, SubtaskSpec, UnitStatus};
use foreman::io::artifacts::{Scope, read_json};
use foreman::io::config::ForemanConfig;
use foreman::io::gate::AlwaysOpen;
use foreman::test_support::{Script, ScriptedAgent, SwitchGate, TestEnv, write_call};
use foreman::worker::{FALLBACK_STEP_GOAL, WorkOutcome};
use serde_json::Value;

fn submit(env: &TestEnv, run_tests: bool) -> Job {
    let meta = JobMeta {
        repo: Some(TestEnv::REPO.to_string()),
        run_tests,
        ..JobMeta::default()
    };
    env.store()
        .create_job("Demo", "Add a greeting module", &meta)
        .expect("create job")
}

fn report(env: &TestEnv, scope: Scope) -> Value {
    read_json(&env.layout().report_path(scope))
        .expect("read report")
        .expect("report exists")
}

fn step(goal: &str, files: &[&str]) -> StepSpec {
    StepSpec {
        goal: goal.to_string(),
        file_allowlist: files.iter().map(|f| f.to_string()).collect(),
        ..StepSpec::default()
    }
}

#[test]
fn job_runs_steps_and_subtasks_in_order() {
    let env = TestEnv::new();
    let job = submit(&env, false);
    let agent = ScriptedAgent::new()
        .with_plan(vec![step("Create module", &["src"]), step("Document it", &["docs"])])
        .with_decomposition(Decomposition {
            subtasks: vec![SubtaskSpec::new("Write greet", "Add src/greet.rs")],
        })
        .with_execution(
            Script::reply(UnitReply::success("Added greet module"))
                .call(write_call("src/greet.rs", "pub fn hi() {}\n")),
        )
        .with_execution(
            Script::reply(UnitReply::success("Documented greet"))
                .call(write_call("docs/greet.md", "# greet\n")),
        );

    let mut worker = env.worker(agent, AlwaysOpen);
    let outcome = worker.run_once().expect("run once");
    assert_eq!(
        outcome,
        WorkOutcome::Processed {
            job_id: job.id,
            status: UnitStatus::Done,
        }
    );

    let store = worker.store();
    let steps = store.list_steps(job.id).expect("steps");
    assert_eq!(steps.len(), 2);
    assert!(steps.iter().all(|s| s.status == UnitStatus::Done));
    assert!(steps.iter().all(|s| s.report_path.is_some()));
    let second = store.list_subtasks(steps[1].id).expect("subtasks");
    assert_eq!(second.len(), 1, "empty decomposition falls back to one subtask");
    assert_eq!(second[0].instruction, "Document it");

    let agent = worker.agent();
    assert_eq!(
        agent.seen,
        vec!["plan", "decompose", "execute", "decompose", "execute"]
    );
    assert_eq!(agent.executed[0].file_allowlist, vec!["src"], "inherited from step");
    assert!(agent.attached.as_ref().is_some_and(|root| root.ends_with(TestEnv::REPO)));
    assert!(env.repo().join("src/greet.rs").exists());
    assert!(env.repo().join("docs/greet.md").exists());

    let job_report = report(&env, Scope::Job(job.id));
    assert_eq!(job_report["status"], "success");
    assert_eq!(job_report["summary"], "Documented greet");
    assert_eq!(
        job_report["changed_files"],
        serde_json::json!(["src/greet.rs", "docs/greet.md"])
    );
    assert_eq!(job_report["pr"]["created"], false);
    assert_eq!(job_report["steps"].as_array().map(Vec::len), Some(2));
    assert!(env.layout().plan_path(job.id).exists());

    let log = fs::read_to_string(env.layout().log_path(Scope::Job(job.id))).expect("job log");
    assert!(log.contains("worker test claimed job"));
    assert!(log.contains("orchestrator: created 2 step(s)"));
    assert!(log.contains(&format!("worker: step 1 (id {}) - Create module", steps[0].id)));
    assert!(log.contains("write_file: path=src/greet.rs"));
}

#[test]
fn first_failing_subtask_stops_the_job() {
    let env = TestEnv::new();
    let job = submit(&env, false);
    let agent = ScriptedAgent::new()
        .with_plan(vec![step("One", &[]), step("Two", &[])])
        .with_decomposition(Decomposition {
            subtasks: vec![
                SubtaskSpec::new("first", "do first"),
                SubtaskSpec::new("second", "do second"),
            ],
        })
        .with_execution(Script::reply(UnitReply::failed("could not compile")));

    let mut worker = env.worker(agent, AlwaysOpen);
    let outcome = worker.run_once().expect("run once");
    assert_eq!(
        outcome,
        WorkOutcome::Processed {
            job_id: job.id,
            status: UnitStatus::Failed,
        }
    );

    let store = worker.store();
    let steps = store.list_steps(job.id).expect("steps");
    assert_eq!(steps[0].status, UnitStatus::Failed);
    assert_eq!(steps[1].status, UnitStatus::Queued);
    let subtasks = store.list_subtasks(steps[0].id).expect("subtasks");
    assert_eq!(subtasks[0].status, UnitStatus::Failed);
    assert_eq!(subtasks[0].error.as_deref(), Some("could not compile"));
    assert_eq!(subtasks[1].status, UnitStatus::Queued);
    assert_eq!(worker.agent().executed.len(), 1);

    let job_row = store.get_job(job.id).expect("get").expect("job");
    assert_eq!(job_row.status, UnitStatus::Failed);
    let job_report = report(&env, Scope::Job(job.id));
    assert_eq!(job_report["status"], "failed");
    assert_eq!(job_report["summary"], "could not compile");
    let step_report = report(
        &env,
        Scope::Step {
            job_id: job.id,
            step_id: steps[0].id,
        },
    );
    assert_eq!(step_report["summary"], "Subtask failed.");
}

#[test]
fn closing_the_gate_leaves_units_running() {
    let env = TestEnv::new();
    let job = submit(&env, false);
    let gate = SwitchGate::open();
    let agent = ScriptedAgent::new()
        .with_plan(vec![step("Only", &[])])
        .with_execution(
            Script::reply(UnitReply::success("never reported"))
                .close_gate(&gate)
                .call(write_call("late.txt", "x")),
        );

    let mut worker = env.worker(agent, gate.clone());
    let outcome = worker.run_once().expect("run once");
    assert_eq!(outcome, WorkOutcome::Cancelled { job_id: job.id });
    assert!(!env.repo().join("late.txt").exists());

    let store = worker.store();
    let step = store.list_steps(job.id).expect("steps").remove(0);
    let subtask = store.list_subtasks(step.id).expect("subtasks").remove(0);
    assert_eq!(step.status, UnitStatus::Running);
    assert_eq!(subtask.status, UnitStatus::Running);
    assert_eq!(
        store.get_job(job.id).expect("get").expect("job").status,
        UnitStatus::Running
    );
    assert!(!env.layout().report_path(Scope::Job(job.id)).exists());

    // Claimed work is not handed out again.
    gate.set(true);
    assert_eq!(worker.run_once().expect("run once"), WorkOutcome::Idle);
    gate.set(false);
    assert_eq!(worker.run_loop(false).expect("loop"), WorkOutcome::GateClosed);
}

#[test]
fn empty_plan_falls_back_to_a_single_step() {
    let env = TestEnv::new();
    let job = submit(&env, false);
    let mut worker = env.worker(ScriptedAgent::new(), AlwaysOpen);
    worker.run_once().expect("run once");

    let steps = worker.store().list_steps(job.id).expect("steps");
    assert_eq!(steps.len(), 1);
    assert_eq!(steps[0].goal, FALLBACK_STEP_GOAL);
    let job_report = report(&env, Scope::Job(job.id));
    assert_eq!(job_report["summary"], "Completed 1 step(s).");
}

#[test]
fn unknown_repository_fails_the_job_with_a_report() {
    let env = TestEnv::new();
    let meta = JobMeta {
        repo: Some("missing".to_string()),
        ..JobMeta::default()
    };
    let job = env
        .store()
        .create_job("Lost", "anything", &meta)
        .expect("create job");
    let mut worker = env.worker(ScriptedAgent::new(), AlwaysOpen);
    assert_eq!(
        worker.run_once().expect("run once"),
        WorkOutcome::Processed {
            job_id: job.id,
            status: UnitStatus::Failed,
        }
    );
    let row = worker.store().get_job(job.id).expect("get").expect("job");
    let error = row.error.expect("error text");
    assert!(error.contains("repository not found"), "{error}");
    let job_report = report(&env, Scope::Job(job.id));
    assert_eq!(job_report["status"], "failed");
    assert_eq!(job_report["checks"]["test"], "not_run");
    assert!(worker.agent().seen.is_empty());
}

#[cfg(unix)]
#[test]
fn failing_tests_get_repair_rounds() {
    let mut config = ForemanConfig::default();
    config.worker.test_command = Some("ls fixed.txt".to_string());
    config.worker.max_fix_loops = 2;
    let env = TestEnv::with_config(config);
    let job = submit(&env, true);
    let agent = ScriptedAgent::new()
        .with_repair(Script::reply(UnitReply::success("still looking")))
        .with_repair(
            Script::reply(UnitReply::success("created file"))
                .call(write_call("fixed.txt", "ok\n")),
        );

    let mut worker = env.worker(agent, AlwaysOpen);
    let outcome = worker.run_once().expect("run once");
    assert_eq!(
        outcome,
        WorkOutcome::Processed {
            job_id: job.id,
            status: UnitStatus::Done,
        }
    );
    let agent = worker.agent();
    assert_eq!(agent.repair_outputs.len(), 2);
    assert!(agent.repair_outputs[0].contains("fixed.txt"));

    let job_report = report(&env, Scope::Job(job.id));
    assert_eq!(job_report["checks"]["test"], "pass");
    assert!(
        job_report["changed_files"]
            .as_array()
            .is_some_and(|files| files.iter().any(|f| f == "fixed.txt"))
    );
    let log = fs::read_to_string(env.layout().log_path(Scope::Job(job.id))).expect("log");
    assert!(log.contains("tests: fix loop 2"));
    assert!(log.contains("tests: passed"));
}

#[cfg(unix)]
#[test]
fn tests_failing_after_last_repair_fail_the_job() {
    let mut config = ForemanConfig::default();
    config.worker.test_command = Some("ls never.txt".to_string());
    config.worker.max_fix_loops = 0;
    let env = TestEnv::with_config(config);
    let job = submit(&env, true);

    let mut worker = env.worker(ScriptedAgent::new(), AlwaysOpen);
    let outcome = worker.run_once().expect("run once");
    assert_eq!(
        outcome,
        WorkOutcome::Processed {
            job_id: job.id,
            status: UnitStatus::Failed,
        }
    );
    assert!(!worker.agent().seen.contains(&"repair"));
    let job_report = report(&env, Scope::Job(job.id));
    assert_eq!(job_report["summary"], "Tests failed.");
    assert_eq!(job_report["checks"]["test"], "fail");
}

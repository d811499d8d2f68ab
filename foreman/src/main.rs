//! Foreman command-line interface.
//!
//! Jobs are submitted into the SQLite store under the home directory and
//! processed by `foreman work`, which drives the configured agent command.

use std::path::PathBuf;
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use clap::{Parser, Subcommand};
use serde::Serialize;
use serde_json::Value;

use foreman::agent::CommandAgent;
use foreman::core::allowlist::{CommandAllowlist, PathAllowlist};
use foreman::core::types::{Job, JobMeta, Step, Subtask};
use foreman::exit_codes;
use foreman::io::artifacts::Scope;
use foreman::io::config::{Home, write_config};
use foreman::io::gate::{AlwaysOpen, FileGate, Gate};
use foreman::io::joblog::LogBook;
use foreman::io::sandbox::{Sandbox, ToolCall};
use foreman::io::store::Store;
use foreman::io::workspace::resolve_repo_root;
use foreman::logging;
use foreman::worker::{WorkOutcome, Worker, WorkerSettings};

#[derive(Parser)]
#[command(
    name = "foreman",
    version,
    about = "Job/step/subtask work queue with sandboxed agent tools"
)]
struct Cli {
    /// Directory holding `foreman.toml`, the database, logs and reports.
    #[arg(long, global = true, default_value = ".")]
    home: PathBuf,
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Write `foreman.toml` and create the data directories.
    Init {
        /// Overwrite an existing config file.
        #[arg(short, long)]
        force: bool,
    },
    /// Queue a new job.
    Submit {
        /// Free-form request handed to the planner.
        request: String,
        #[arg(short, long, default_value = "")]
        title: String,
        /// Repository under the workspaces directory.
        #[arg(long)]
        repo: Option<String>,
        /// Run the repository's tests after all steps succeed.
        #[arg(long)]
        run_tests: bool,
        /// Extra metadata as a JSON object.
        #[arg(long)]
        meta: Option<String>,
    },
    /// Claim and process queued jobs.
    Work {
        /// Process at most one job, then exit.
        #[arg(long)]
        once: bool,
    },
    /// List recent jobs.
    List {
        #[arg(short = 'n', long, default_value_t = 20)]
        limit: usize,
    },
    /// Print a job with its steps and subtasks as JSON.
    Show { job_id: i64 },
    /// Print a job, step or subtask log from a byte offset.
    Tail {
        job_id: i64,
        #[arg(long)]
        step: Option<i64>,
        #[arg(long, requires = "step")]
        subtask: Option<i64>,
        #[arg(long, default_value_t = 0)]
        offset: u64,
        /// Keep reading until the job finishes.
        #[arg(short, long)]
        follow: bool,
    },
    /// Delete a job with its steps, subtasks, logs and reports.
    Delete { job_id: i64 },
    /// Open, close or inspect the worker gate.
    Gate {
        #[command(subcommand)]
        action: GateAction,
    },
    /// Dispatch one tool call against a repository.
    Tool {
        /// Tool name, e.g. `read_file`.
        name: String,
        /// Tool arguments as a JSON object.
        #[arg(default_value = "{}")]
        args: String,
        #[arg(long)]
        repo: Option<String>,
        /// Comma-separated file allowlist.
        #[arg(long, value_delimiter = ',')]
        files: Vec<String>,
        /// Comma-separated command allowlist.
        #[arg(long, value_delimiter = ',')]
        commands: Vec<String>,
    },
}

#[derive(Subcommand, Clone, Copy, PartialEq, Eq, Debug)]
enum GateAction {
    On,
    Off,
    Status,
}

fn main() {
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{:#}", err);
            std::process::exit(exit_codes::INVALID);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    logging::init();
    let home = Home::load(&cli.home)?;
    match cli.command {
        Command::Init { force } => cmd_init(&home, force),
        Command::Submit {
            request,
            title,
            repo,
            run_tests,
            meta,
        } => cmd_submit(&home, &title, &request, repo, run_tests, meta.as_deref()),
        Command::Work { once } => cmd_work(&home, once),
        Command::List { limit } => cmd_list(&home, limit),
        Command::Show { job_id } => cmd_show(&home, job_id),
        Command::Tail {
            job_id,
            step,
            subtask,
            offset,
            follow,
        } => cmd_tail(&home, job_id, step, subtask, offset, follow),
        Command::Delete { job_id } => cmd_delete(&home, job_id),
        Command::Gate { action } => cmd_gate(&home, action),
        Command::Tool {
            name,
            args,
            repo,
            files,
            commands,
        } => cmd_tool(&home, &name, &args, repo.as_deref(), &files, &commands),
    }
}

fn cmd_init(home: &Home, force: bool) -> Result<i32> {
    let config_path = home.config_path();
    if force || !config_path.exists() {
        write_config(&config_path, &home.config)?;
    }
    home.layout().ensure_dirs()?;
    let workspaces = home.workspaces_dir();
    std::fs::create_dir_all(&workspaces)
        .with_context(|| format!("create {}", workspaces.display()))?;
    Store::open(&home.database()).context("open database")?;
    if let Some(path) = home.gate_file()
        && !path.exists()
    {
        FileGate::new(path).set(true)?;
    }
    println!("{}", home.root().display());
    Ok(exit_codes::OK)
}

fn open_store(home: &Home) -> Result<Store> {
    let path = home.database();
    Store::open(&path).with_context(|| format!("open database {}", path.display()))
}

fn cmd_submit(
    home: &Home,
    title: &str,
    request: &str,
    repo: Option<String>,
    run_tests: bool,
    meta: Option<&str>,
) -> Result<i32> {
    if request.trim().is_empty() {
        bail!("request must not be empty");
    }
    let mut job_meta: JobMeta = match meta {
        Some(raw) => serde_json::from_str(raw).context("parse --meta as a JSON object")?,
        None => JobMeta::default(),
    };
    if repo.is_some() {
        job_meta.repo = repo;
    }
    job_meta.run_tests |= run_tests;
    let job = open_store(home)?.create_job(title, request, &job_meta)?;
    println!("{}", job.id);
    Ok(exit_codes::OK)
}

fn cmd_work(home: &Home, once: bool) -> Result<i32> {
    let config = &home.config;
    let agent = CommandAgent::new(
        config.agent.command.clone(),
        home.root(),
        Duration::from_secs(config.agent.timeout_secs),
    )
    .context("agent.command in foreman.toml")?;
    let gate: Box<dyn Gate> = match home.gate_file() {
        Some(path) => Box::new(FileGate::new(path)),
        None => Box::new(AlwaysOpen),
    };
    let logs = LogBook::new(home.layout(), config.max_log_bytes);
    let mut worker = Worker::new(
        open_store(home)?,
        logs,
        agent,
        gate,
        WorkerSettings::from_home(home),
    );
    let outcome = worker.run_loop(once)?;
    Ok(match outcome {
        WorkOutcome::Idle => {
            eprintln!("no queued job");
            exit_codes::IDLE
        }
        WorkOutcome::GateClosed => {
            eprintln!("gate closed");
            exit_codes::CANCELLED
        }
        WorkOutcome::Cancelled { job_id } => {
            eprintln!("job {job_id} interrupted: gate closed");
            exit_codes::CANCELLED
        }
        WorkOutcome::Processed { job_id, status } => {
            println!("{job_id} {status}");
            exit_codes::OK
        }
    })
}

fn cmd_list(home: &Home, limit: usize) -> Result<i32> {
    for job in open_store(home)?.list_jobs(limit)? {
        println!("{}\t{}\t{}\t{}", job.id, job.status, job.created_at, job.title);
    }
    Ok(exit_codes::OK)
}

#[derive(Serialize)]
struct StepView {
    #[serde(flatten)]
    step: Step,
    subtasks: Vec<Subtask>,
}

#[derive(Serialize)]
struct JobView {
    #[serde(flatten)]
    job: Job,
    steps: Vec<StepView>,
}

fn cmd_show(home: &Home, job_id: i64) -> Result<i32> {
    let store = open_store(home)?;
    let Some(job) = store.get_job(job_id)? else {
        bail!("job {job_id} not found");
    };
    let mut steps = Vec::new();
    for step in store.list_steps(job_id)? {
        let subtasks = store.list_subtasks(step.id)?;
        steps.push(StepView { step, subtasks });
    }
    let view = JobView { job, steps };
    println!(
        "{}",
        serde_json::to_string_pretty(&view).context("serialize job")?
    );
    Ok(exit_codes::OK)
}

fn cmd_tail(
    home: &Home,
    job_id: i64,
    step: Option<i64>,
    subtask: Option<i64>,
    mut offset: u64,
    follow: bool,
) -> Result<i32> {
    let scope = match (step, subtask) {
        (Some(step_id), Some(subtask_id)) => Scope::Subtask {
            job_id,
            step_id,
            subtask_id,
        },
        (Some(step_id), None) => Scope::Step { job_id, step_id },
        _ => Scope::Job(job_id),
    };
    let logs = LogBook::new(home.layout(), home.config.max_log_bytes);
    let store = open_store(home)?;
    let poll = Duration::from_millis(home.config.worker.poll_interval_ms);
    loop {
        let chunk = logs.read_chunk(scope, offset)?;
        print!("{}", chunk.content);
        offset = chunk.offset;
        if !follow {
            break;
        }
        let finished = store
            .get_job(job_id)?
            .is_none_or(|job| job.status.is_terminal());
        if finished && chunk.content.is_empty() {
            break;
        }
        if chunk.content.is_empty() {
            thread::sleep(poll);
        }
    }
    eprintln!("offset {offset}");
    Ok(exit_codes::OK)
}

fn cmd_delete(home: &Home, job_id: i64) -> Result<i32> {
    if !open_store(home)?.delete_job(job_id, &home.layout())? {
        bail!("job {job_id} not found");
    }
    Ok(exit_codes::OK)
}

fn cmd_gate(home: &Home, action: GateAction) -> Result<i32> {
    let Some(path) = home.gate_file() else {
        println!("disabled");
        return Ok(exit_codes::OK);
    };
    let gate = FileGate::new(path);
    match action {
        GateAction::On => gate.set(true)?,
        GateAction::Off => gate.set(false)?,
        GateAction::Status => {}
    }
    println!("{}", if gate.is_open() { "open" } else { "closed" });
    Ok(exit_codes::OK)
}

fn cmd_tool(
    home: &Home,
    name: &str,
    args: &str,
    repo: Option<&str>,
    files: &[String],
    commands: &[String],
) -> Result<i32> {
    let args: Value = serde_json::from_str(args).context("parse tool arguments")?;
    let call = ToolCall::parse(name, args)?;
    let root = resolve_repo_root(&home.workspaces_dir(), repo)?;
    let sandbox = Sandbox::new(
        root,
        home.config.command_policy(),
        home.config.sandbox_limits(),
    );
    let result = sandbox.dispatch(
        &call,
        &PathAllowlist::new(files),
        &CommandAllowlist::new(commands),
    );
    println!(
        "{}",
        serde_json::to_string_pretty(&result).context("serialize tool result")?
    );
    Ok(if result.is_error() {
        exit_codes::INVALID
    } else {
        exit_codes::OK
    })
}

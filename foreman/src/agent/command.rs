//! Agent backed by an external process speaking JSON lines.
//!
//! One process is spawned per request in the repository root. Foreman writes
//! the request object as the first stdin line. The process answers with any
//! number of `{"tool": name, "args": {...}}` lines, each answered by one
//! tool-result line on stdin, and ends with `{"result": {...}}`.

use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};
use wait_timeout::ChildExt;

use super::{
    Agent, AgentRequest, DecomposeRequest, Decomposition, ExecuteRequest, Plan, PlanRequest,
    RepairRequest, UnitReply,
};
use crate::core::budget::Deadline;
use crate::io::gate::Gate;
use crate::io::process::{Capture, capture_in_background, collect};
use crate::io::sandbox::{ToolCall, ToolResult};
use crate::session::ToolSession;

const STDERR_LIMIT_BYTES: usize = 64 * 1024;
const EXIT_GRACE: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct CommandAgent {
    argv: Vec<String>,
    workdir: PathBuf,
    timeout: Duration,
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum AgentLine {
    Result {
        result: Value,
    },
    Tool {
        tool: String,
        #[serde(default)]
        args: Value,
    },
}

impl CommandAgent {
    pub fn new(argv: Vec<String>, workdir: impl Into<PathBuf>, timeout: Duration) -> Result<Self> {
        if argv.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("agent.command is not configured");
        }
        Ok(Self {
            argv,
            workdir: workdir.into(),
            timeout,
        })
    }

    /// Run one request to completion, answering tool calls with `on_tool`.
    #[instrument(skip_all, fields(kind = request.kind()))]
    fn converse<T, F>(&self, request: AgentRequest<'_>, gate: &dyn Gate, mut on_tool: F) -> Result<T>
    where
        T: DeserializeOwned,
        F: FnMut(ToolCall) -> Result<ToolResult>,
    {
        gate.check()?;
        let deadline = Deadline::after(self.timeout);
        let mut process = AgentProcess::spawn(&self.argv, &self.workdir)?;
        let outcome = (|| -> Result<T> {
            process.send(&serde_json::to_value(request).context("serialize agent request")?)?;
            loop {
                gate.check()?;
                let line = process.next_line(deadline.remaining()?)?;
                match serde_json::from_str::<AgentLine>(&line) {
                    Ok(AgentLine::Result { result }) => {
                        return serde_json::from_value::<T>(result)
                            .context("agent result has an unexpected shape");
                    }
                    Ok(AgentLine::Tool { tool, args }) => {
                        let reply = match ToolCall::parse(&tool, args) {
                            Ok(call) => on_tool(call)?,
                            Err(err) => ToolResult::failed(err.to_string()),
                        };
                        process.send(&serde_json::to_value(&reply).context("serialize tool result")?)?;
                    }
                    Err(err) => {
                        debug!(err = %err, "ignoring non-protocol agent output");
                    }
                }
            }
        })();
        process.finish(outcome.is_ok());
        outcome
    }
}

impl Agent for CommandAgent {
    fn attach(&mut self, repo_root: &Path) {
        self.workdir = repo_root.to_path_buf();
    }

    fn plan(&mut self, request: &PlanRequest, gate: &dyn Gate) -> Result<Plan> {
        self.converse(AgentRequest::Plan(request), gate, |_| {
            Ok(ToolResult::failed("tools are not available while planning"))
        })
    }

    fn decompose(&mut self, request: &DecomposeRequest, gate: &dyn Gate) -> Result<Decomposition> {
        self.converse(AgentRequest::Decompose(request), gate, |_| {
            Ok(ToolResult::failed("tools are not available while decomposing"))
        })
    }

    fn execute(&mut self, request: &ExecuteRequest, tools: &mut ToolSession<'_>) -> Result<UnitReply> {
        let gate = tools.gate();
        self.converse(AgentRequest::Execute(request), gate, |call| {
            Ok(tools.call(&call)?)
        })
    }

    fn repair(&mut self, request: &RepairRequest, tools: &mut ToolSession<'_>) -> Result<UnitReply> {
        let gate = tools.gate();
        self.converse(AgentRequest::Repair(request), gate, |call| {
            Ok(tools.call(&call)?)
        })
    }
}

struct AgentProcess {
    child: Child,
    stdin: Option<ChildStdin>,
    lines: Receiver<std::io::Result<String>>,
    stderr: Option<thread::JoinHandle<Result<Capture>>>,
}

impl AgentProcess {
    fn spawn(argv: &[String], workdir: &Path) -> Result<Self> {
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| anyhow!("agent.command is not configured"))?;
        let mut child = Command::new(program)
            .args(args)
            .current_dir(workdir)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn agent {program}"))?;
        info!(program = %program, "started agent process");

        let stdin = child.stdin.take().ok_or_else(|| anyhow!("stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let (tx, lines) = mpsc::channel();
        thread::spawn(move || {
            for line in BufReader::new(stdout).lines() {
                if tx.send(line).is_err() {
                    break;
                }
            }
        });
        let stderr = capture_in_background(stderr, STDERR_LIMIT_BYTES);

        Ok(Self {
            child,
            stdin: Some(stdin),
            lines,
            stderr: Some(stderr),
        })
    }

    fn send(&mut self, value: &Value) -> Result<()> {
        let stdin = self
            .stdin
            .as_mut()
            .ok_or_else(|| anyhow!("agent stdin already closed"))?;
        let mut line = serde_json::to_string(value).context("encode agent message")?;
        line.push('\n');
        stdin
            .write_all(line.as_bytes())
            .and_then(|()| stdin.flush())
            .context("write to agent")
    }

    /// Next non-empty stdout line.
    fn next_line(&mut self, timeout: Duration) -> Result<String> {
        loop {
            match self.lines.recv_timeout(timeout) {
                Ok(Ok(line)) if line.trim().is_empty() => continue,
                Ok(Ok(line)) => return Ok(line),
                Ok(Err(err)) => return Err(err).context("read agent output"),
                Err(RecvTimeoutError::Timeout) => bail!("agent exceeded its time budget"),
                Err(RecvTimeoutError::Disconnected) => {
                    let stderr = self.stderr_tail();
                    bail!("agent exited without a result: {stderr}");
                }
            }
        }
    }

    fn stderr_tail(&mut self) -> String {
        // Give the process a moment to exit so its stderr pipe closes.
        let _ = self.child.wait_timeout(EXIT_GRACE);
        let Some(handle) = self.stderr.take() else {
            return String::new();
        };
        match collect(handle) {
            Ok(captured) => String::from_utf8_lossy(&captured.bytes).trim().to_string(),
            Err(err) => format!("{err:#}"),
        }
    }

    /// Close stdin and reap the child, killing it unless it finished cleanly.
    fn finish(mut self, clean: bool) {
        self.stdin.take();
        if clean {
            match self.child.wait_timeout(EXIT_GRACE) {
                Ok(Some(status)) => {
                    debug!(exit_code = ?status.code(), "agent process exited");
                    return;
                }
                Ok(None) => warn!("agent did not exit after its result, killing"),
                Err(err) => warn!(err = %err, "failed to wait for agent"),
            }
        }
        if let Err(err) = self.child.kill() {
            debug!(err = %err, "agent already exited");
        }
        let _ = self.child.wait();
    }
}

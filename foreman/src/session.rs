//! Per-unit tool session and log fan-out.
//!
//! A [`ToolSession`] binds the sandbox to one unit's effective allowlists,
//! checks the gate before every call, writes one log line per call and
//! accumulates the files changed and commands run for the unit's report.

use tracing::warn;

use crate::core::allowlist::{CommandAllowlist, PathAllowlist};
use crate::io::artifacts::Scope;
use crate::io::gate::{Cancelled, Gate};
use crate::io::joblog::LogBook;
use crate::io::sandbox::{Sandbox, ToolCall, ToolResult};
use crate::io::store::Store;

/// Writes a line to a unit's log and every enclosing log, and refreshes the
/// job's last activity time.
#[derive(Clone, Copy)]
pub struct UnitLog<'a> {
    book: &'a LogBook,
    store: &'a Store,
    scope: Scope,
}

impl<'a> UnitLog<'a> {
    pub fn new(book: &'a LogBook, store: &'a Store, scope: Scope) -> Self {
        Self { book, store, scope }
    }

    pub fn scope(&self) -> Scope {
        self.scope
    }

    /// Log failures are reported through tracing and never abort work.
    pub fn line(&self, message: &str) {
        if let Err(err) = self.book.append_all(self.scope, message) {
            warn!(scope = ?self.scope, err = %format!("{err:#}"), "failed to append log line");
        }
        if let Err(err) = self.store.touch_job(self.scope.job_id()) {
            warn!(job_id = self.scope.job_id(), err = %err, "failed to refresh last_log_at");
        }
    }
}

pub struct ToolSession<'a> {
    sandbox: &'a Sandbox,
    gate: &'a dyn Gate,
    log: UnitLog<'a>,
    files: PathAllowlist,
    commands: CommandAllowlist,
    changed_files: Vec<String>,
    commands_run: Vec<String>,
}

impl<'a> ToolSession<'a> {
    pub fn new(
        sandbox: &'a Sandbox,
        gate: &'a dyn Gate,
        log: UnitLog<'a>,
        files: PathAllowlist,
        commands: CommandAllowlist,
    ) -> Self {
        Self {
            sandbox,
            gate,
            log,
            files,
            commands,
            changed_files: Vec::new(),
            commands_run: Vec::new(),
        }
    }

    pub fn gate(&self) -> &'a dyn Gate {
        self.gate
    }

    pub fn log(&self) -> UnitLog<'a> {
        self.log
    }

    pub fn sandbox(&self) -> &'a Sandbox {
        self.sandbox
    }

    /// Fails with [`Cancelled`] when the gate is closed.
    pub fn checkpoint(&self) -> Result<(), Cancelled> {
        self.gate.check()
    }

    /// Run one tool call. Denials and failures come back as results.
    pub fn call(&mut self, call: &ToolCall) -> Result<ToolResult, Cancelled> {
        self.checkpoint()?;
        let result = self.sandbox.dispatch(call, &self.files, &self.commands);
        self.record(call, &result);
        Ok(result)
    }

    fn record(&mut self, call: &ToolCall, result: &ToolResult) {
        let name = call.name();
        if let Some(error) = result.error_message() {
            let line = match call {
                ToolCall::ListFiles { path, .. }
                | ToolCall::ReadFile { path, .. }
                | ToolCall::WriteFile { path, .. }
                | ToolCall::Mkdir { path } => format!("{name} error: {error} path={path}"),
                ToolCall::ApplyPatch { .. } => format!("{name} error: {error}"),
                ToolCall::RunCommand { command, .. } => {
                    format!("{name} error: {error} command={command}")
                }
            };
            self.log.line(&line);
            return;
        }

        let line = match (call, result) {
            (ToolCall::ListFiles { path, depth, .. }, ToolResult::Entries { entries }) => format!(
                "{name}: path={path} depth={} count={}",
                depth.unwrap_or(crate::io::sandbox::DEFAULT_LIST_DEPTH),
                entries.len()
            ),
            (ToolCall::ReadFile { path, .. }, ToolResult::File { content, .. }) => {
                format!("{name}: path={path} bytes={}", content.len())
            }
            (ToolCall::WriteFile { path, .. }, ToolResult::Written { bytes, .. }) => {
                self.note_changed(path);
                format!("{name}: path={path} bytes={bytes}")
            }
            (ToolCall::ApplyPatch { .. }, ToolResult::Patched { files, .. }) => {
                for file in files {
                    self.note_changed(file);
                }
                format!("{name}: files={}", files.join(", "))
            }
            (ToolCall::RunCommand { .. }, ToolResult::Command(output)) => {
                let mut entry = format!("{} (exit {})", output.command, output.exit_code);
                if output.timed_out {
                    entry.push_str(" timed out");
                }
                let line = format!("{name}: {entry}");
                self.commands_run.push(entry);
                line
            }
            (ToolCall::Mkdir { path }, _) => format!("{name}: path={path}"),
            _ => format!("{name}: done"),
        };
        self.log.line(&line);
    }

    fn note_changed(&mut self, path: &str) {
        if !self.changed_files.iter().any(|seen| seen == path) {
            self.changed_files.push(path.to_string());
        }
    }

    pub fn changed_files(&self) -> &[String] {
        &self.changed_files
    }

    pub fn commands_run(&self) -> &[String] {
        &self.commands_run
    }

    pub fn into_activity(self) -> (Vec<String>, Vec<String>) {
        (self.changed_files, self.commands_run)
    }
}

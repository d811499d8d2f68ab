//! Sandboxed file and command access to one repository.
//!
//! Every file operation is checked against the unit's [`PathAllowlist`] and
//! confined to the repository root with [`safe_path`]. Commands must pass the
//! unit's [`CommandAllowlist`] and the global [`CommandPolicy`], and run
//! without a shell.

mod disk;
mod listing;
mod tools;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tracing::{debug, instrument, warn};

pub use disk::DiskRepo;
pub use listing::{IGNORED_DIRS, list_tree};
pub use tools::{
    CommandResult, DEFAULT_LIST_DEPTH, DEFAULT_LIST_MAX_ENTRIES, Denial, ToolCall, ToolCallError,
    ToolResult,
};

use super::process::run_captured;
use crate::core::allowlist::{CommandAllowlist, PathAllowlist};
use crate::core::command_policy::{CommandDenied, CommandPolicy};
use crate::core::patch::{FsError, PatchError, RepoFs, apply_unified_diff, extract_patch_files};
use crate::core::safe_path::safe_path;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SandboxLimits {
    pub command_timeout: Duration,
    pub output_limit_bytes: usize,
    /// Default `read_file` cap when the call does not give one.
    pub read_max_bytes: usize,
}

impl Default for SandboxLimits {
    fn default() -> Self {
        Self {
            command_timeout: Duration::from_secs(600),
            output_limit_bytes: 200_000,
            read_max_bytes: 200_000,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Sandbox {
    repo: DiskRepo,
    policy: CommandPolicy,
    limits: SandboxLimits,
}

impl Sandbox {
    pub fn new(root: impl Into<PathBuf>, policy: CommandPolicy, limits: SandboxLimits) -> Self {
        let root: PathBuf = root.into();
        // An empty relative path resolves to the lexically normalized root.
        let root = safe_path(&root, "").unwrap_or(root);
        Self {
            repo: DiskRepo::new(root),
            policy,
            limits,
        }
    }

    pub fn root(&self) -> &Path {
        self.repo.root()
    }

    pub fn policy(&self) -> &CommandPolicy {
        &self.policy
    }

    pub fn limits(&self) -> &SandboxLimits {
        &self.limits
    }

    /// Execute `call` under the unit's allowlists.
    #[instrument(skip_all, fields(tool = call.name()))]
    pub fn dispatch(
        &self,
        call: &ToolCall,
        files: &PathAllowlist,
        commands: &CommandAllowlist,
    ) -> ToolResult {
        let result = match call {
            ToolCall::ListFiles {
                path,
                depth,
                max_entries,
            } => guard_path(files, path).unwrap_or_else(|| {
                self.list_files(
                    path,
                    depth.unwrap_or(DEFAULT_LIST_DEPTH),
                    max_entries.unwrap_or(DEFAULT_LIST_MAX_ENTRIES),
                )
            }),
            ToolCall::ReadFile { path, max_bytes } => guard_path(files, path).unwrap_or_else(|| {
                self.read_file(path, max_bytes.unwrap_or(self.limits.read_max_bytes))
            }),
            ToolCall::WriteFile { path, content } => {
                guard_path(files, path).unwrap_or_else(|| self.write_file(path, content))
            }
            ToolCall::Mkdir { path } => {
                guard_path(files, path).unwrap_or_else(|| self.mkdir(path))
            }
            ToolCall::ApplyPatch { patch } => self.apply_patch(patch, files),
            ToolCall::RunCommand { command, cwd } => {
                self.run_command(command, cwd.as_deref(), commands)
            }
        };
        if let Some(error) = result.error_message() {
            debug!(%error, "tool call refused or failed");
        }
        result
    }

    fn list_files(&self, path: &str, depth: usize, max_entries: usize) -> ToolResult {
        let start = match self.repo.resolve(path) {
            Ok(start) => start,
            Err(err) => return fs_failure(err.into()),
        };
        match list_tree(self.root(), &start, depth, max_entries) {
            Ok(entries) => ToolResult::Entries { entries },
            Err(err) => ToolResult::failed(format!("failed to list files: {err}")),
        }
    }

    fn read_file(&self, path: &str, max_bytes: usize) -> ToolResult {
        let target = match safe_path(self.root(), path) {
            Ok(target) => target,
            Err(err) => return denied(err.into()),
        };
        if !target.is_file() {
            return ToolResult::failed("file not found");
        }
        match fs::read(&target) {
            Ok(mut bytes) => {
                bytes.truncate(max_bytes);
                ToolResult::File {
                    path: path.to_string(),
                    content: String::from_utf8_lossy(&bytes).into_owned(),
                }
            }
            Err(err) => ToolResult::failed(format!("failed to read file: {err}")),
        }
    }

    fn write_file(&self, path: &str, content: &str) -> ToolResult {
        match self.repo.write(path, content) {
            Ok(()) => ToolResult::Written {
                path: path.to_string(),
                bytes: content.len(),
            },
            Err(err) => fs_failure(err.into()),
        }
    }

    fn mkdir(&self, path: &str) -> ToolResult {
        let target = match safe_path(self.root(), path) {
            Ok(target) => target,
            Err(err) => return denied(err.into()),
        };
        match fs::create_dir_all(&target) {
            Ok(()) => ToolResult::Created {
                path: path.to_string(),
                created: true,
            },
            Err(err) => ToolResult::failed(format!("failed to create directory: {err}")),
        }
    }

    fn apply_patch(&self, patch: &str, files: &PathAllowlist) -> ToolResult {
        let targets = match extract_patch_files(patch) {
            Ok(targets) => targets,
            Err(err) => return fs_failure(err),
        };
        if targets.is_empty() {
            return ToolResult::failed(PatchError::NoFiles.to_string());
        }
        if let Some(blocked) = targets.iter().find(|target| !files.allows(target)) {
            return denied(Denial::PathNotAllowed(blocked.clone()));
        }
        match apply_unified_diff(&self.repo, patch) {
            Ok(changed) => ToolResult::Patched {
                applied: true,
                files: changed,
            },
            Err(err) => fs_failure(err),
        }
    }

    fn run_command(
        &self,
        command: &str,
        cwd: Option<&str>,
        commands: &CommandAllowlist,
    ) -> ToolResult {
        if !commands.allows(command) {
            return denied(CommandDenied::UnitAllowlist.into());
        }
        let argv = match self.policy.check(command) {
            Ok(argv) => argv,
            Err(denial) => return denied(denial.into()),
        };
        let workdir = match safe_path(self.root(), cwd.unwrap_or_default()) {
            Ok(workdir) => workdir,
            Err(err) => return denied(err.into()),
        };
        match run_captured(
            &argv,
            &workdir,
            self.limits.command_timeout,
            self.limits.output_limit_bytes,
        ) {
            Ok(output) => ToolResult::Command(CommandResult {
                command: command.trim().to_string(),
                exit_code: output.exit_code(),
                stdout: output.stdout_text(),
                stderr: output.stderr_text(),
                timed_out: output.timed_out,
            }),
            Err(err) => {
                warn!(err = %format!("{err:#}"), "failed to start command");
                ToolResult::failed(format!("failed to start command: {err:#}"))
            }
        }
    }
}

fn guard_path(files: &PathAllowlist, path: &str) -> Option<ToolResult> {
    (!files.allows(path)).then(|| denied(Denial::PathNotAllowed(path.to_string())))
}

fn denied(error: Denial) -> ToolResult {
    ToolResult::Denied { error }
}

/// Path escapes are denials; everything else the patch engine reports is a failure.
fn fs_failure(err: PatchError) -> ToolResult {
    match err {
        PatchError::Fs(FsError::Path(path)) => denied(path.into()),
        other => ToolResult::failed(other.to_string()),
    }
}

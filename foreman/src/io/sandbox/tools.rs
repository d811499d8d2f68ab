//! Tool call and result types exchanged with execution routines.

use serde::{Deserialize, Serialize, Serializer};
use serde_json::{Map, Value, json};
use thiserror::Error;

use crate::core::command_policy::CommandDenied;
use crate::core::safe_path::PathError;

pub const DEFAULT_LIST_DEPTH: usize = 2;
pub const DEFAULT_LIST_MAX_ENTRIES: usize = 200;

/// One sandboxed operation, as named on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "tool", content = "args", rename_all = "snake_case")]
pub enum ToolCall {
    ListFiles {
        #[serde(default = "default_list_path")]
        path: String,
        #[serde(default)]
        depth: Option<usize>,
        #[serde(default)]
        max_entries: Option<usize>,
    },
    ReadFile {
        path: String,
        #[serde(default)]
        max_bytes: Option<usize>,
    },
    WriteFile {
        path: String,
        #[serde(default)]
        content: String,
    },
    Mkdir {
        path: String,
    },
    ApplyPatch {
        patch: String,
    },
    RunCommand {
        command: String,
        #[serde(default)]
        cwd: Option<String>,
    },
}

fn default_list_path() -> String {
    ".".to_string()
}

#[derive(Debug, Error)]
pub enum ToolCallError {
    #[error("unknown tool: {0}")]
    Unknown(String),
    #[error("invalid arguments for {tool}: {source}")]
    InvalidArgs {
        tool: String,
        #[source]
        source: serde_json::Error,
    },
}

impl ToolCall {
    pub const NAMES: [&'static str; 6] = [
        "list_files",
        "read_file",
        "write_file",
        "mkdir",
        "apply_patch",
        "run_command",
    ];

    /// Build a call from a tool name and its JSON arguments.
    pub fn parse(name: &str, args: Value) -> Result<Self, ToolCallError> {
        if !Self::NAMES.contains(&name) {
            return Err(ToolCallError::Unknown(name.to_string()));
        }
        let args = match args {
            Value::Null => Value::Object(Map::new()),
            other => other,
        };
        serde_json::from_value(json!({ "tool": name, "args": args })).map_err(|source| {
            ToolCallError::InvalidArgs {
                tool: name.to_string(),
                source,
            }
        })
    }

    pub fn name(&self) -> &'static str {
        match self {
            ToolCall::ListFiles { .. } => "list_files",
            ToolCall::ReadFile { .. } => "read_file",
            ToolCall::WriteFile { .. } => "write_file",
            ToolCall::Mkdir { .. } => "mkdir",
            ToolCall::ApplyPatch { .. } => "apply_patch",
            ToolCall::RunCommand { .. } => "run_command",
        }
    }
}

/// Sandbox refusal. Serialized as its message.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Denial {
    #[error("path not allowed by file allowlist: {0}")]
    PathNotAllowed(String),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Command(#[from] CommandDenied),
}

impl Serialize for Denial {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.collect_str(self)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandResult {
    pub command: String,
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

impl CommandResult {
    pub fn succeeded(&self) -> bool {
        self.exit_code == 0 && !self.timed_out
    }
}

/// Outcome of one tool call. Denials and failures are values, not errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum ToolResult {
    Entries { entries: Vec<String> },
    File { path: String, content: String },
    Written { path: String, bytes: usize },
    Created { path: String, created: bool },
    Patched { applied: bool, files: Vec<String> },
    Command(CommandResult),
    Denied { error: Denial },
    Failed { error: String },
}

impl ToolResult {
    pub fn failed(error: impl Into<String>) -> Self {
        ToolResult::Failed {
            error: error.into(),
        }
    }

    pub fn is_error(&self) -> bool {
        matches!(self, ToolResult::Denied { .. } | ToolResult::Failed { .. })
    }

    pub fn error_message(&self) -> Option<String> {
        match self {
            ToolResult::Denied { error } => Some(error.to_string()),
            ToolResult::Failed { error } => Some(error.clone()),
            _ => None,
        }
    }
}

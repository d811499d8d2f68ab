//! Global command policy applied to every `run_command` call.
//!
//! This is independent of the per-unit [`CommandAllowlist`](super::allowlist::CommandAllowlist):
//! a command must pass both.

use thiserror::Error;

use super::allowlist::first_token;

/// Programs allowed when no override is configured.
pub const DEFAULT_ALLOWED_COMMANDS: &[&str] = &[
    "ls", "rg", "cat", "sed", "head", "tail", "wc", "stat", "php", "composer", "npm", "pnpm",
    "yarn", "pytest", "python", "python3", "pip", "pip3", "make", "cargo",
];

const FORBIDDEN_CHARS: [char; 6] = [';', '&', '|', '`', '<', '>'];

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandDenied {
    #[error("command is empty")]
    Empty,
    #[error("command contains forbidden characters")]
    ForbiddenCharacters,
    #[error("command not allowed: {0}")]
    NotAllowed(String),
    #[error("command not allowed by command allowlist")]
    UnitAllowlist,
    #[error("command has unbalanced quotes")]
    Unparsable,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandPolicy {
    allowed: Vec<String>,
}

impl Default for CommandPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_ALLOWED_COMMANDS)
    }
}

impl CommandPolicy {
    pub fn new<S: AsRef<str>>(allowed: &[S]) -> Self {
        let allowed = allowed
            .iter()
            .map(|entry| entry.as_ref().trim().to_string())
            .filter(|entry| !entry.is_empty())
            .collect();
        Self { allowed }
    }

    /// Parse a comma-separated override such as `ls,cat,cargo`.
    pub fn from_csv(csv: &str) -> Self {
        let entries: Vec<&str> = csv.split(',').collect();
        Self::new(&entries)
    }

    pub fn allowed(&self) -> &[String] {
        &self.allowed
    }

    /// Validate `command` and split it into argv for direct execution.
    pub fn check(&self, command: &str) -> Result<Vec<String>, CommandDenied> {
        let command = command.trim();
        if command.is_empty() {
            return Err(CommandDenied::Empty);
        }
        if command.contains(FORBIDDEN_CHARS) {
            return Err(CommandDenied::ForbiddenCharacters);
        }
        let program = first_token(command).ok_or(CommandDenied::Empty)?;
        if program.contains(['/', '\\']) || program.starts_with('.') {
            return Err(CommandDenied::NotAllowed(program.to_string()));
        }
        if !self.allowed.iter().any(|allowed| allowed == program) {
            return Err(CommandDenied::NotAllowed(program.to_string()));
        }
        let argv = shlex::split(command).ok_or(CommandDenied::Unparsable)?;
        if argv.is_empty() {
            return Err(CommandDenied::Empty);
        }
        Ok(argv)
    }
}

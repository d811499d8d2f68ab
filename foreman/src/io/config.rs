//! Foreman configuration stored as `foreman.toml` in the home directory.

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use super::artifacts::ArtifactLayout;
use super::sandbox::SandboxLimits;
use crate::core::command_policy::{CommandPolicy, DEFAULT_ALLOWED_COMMANDS};

pub const CONFIG_FILE: &str = "foreman.toml";
/// Comma-separated override for `sandbox.allowed_commands`.
pub const ALLOWED_CMDS_ENV: &str = "FOREMAN_ALLOWED_CMDS";
pub const WORKER_ID_ENV: &str = "FOREMAN_WORKER_ID";

/// Foreman configuration (TOML).
///
/// Relative paths are resolved against the directory holding the config file.
/// Missing fields take their defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ForemanConfig {
    pub data_dir: PathBuf,
    pub log_dir: PathBuf,
    pub report_dir: PathBuf,
    /// Parent directory of the repositories jobs operate on.
    pub workspaces_dir: PathBuf,
    pub database: PathBuf,
    /// Logs are trimmed to their newest bytes beyond this size.
    pub max_log_bytes: u64,
    pub worker: WorkerConfig,
    pub sandbox: SandboxConfig,
    pub agent: AgentConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct WorkerConfig {
    /// Sleep between polls when no job is queued.
    pub poll_interval_ms: u64,
    /// Repair rounds after a failing test run.
    pub max_fix_loops: u32,
    /// Gate file; empty disables the gate.
    pub gate_file: PathBuf,
    /// Overrides the detected test command.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_command: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct SandboxConfig {
    pub allowed_commands: Vec<String>,
    pub command_timeout_secs: u64,
    pub output_limit_bytes: usize,
    pub read_max_bytes: usize,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Agent program and arguments (e.g. `["my-agent", "--json"]`).
    pub command: Vec<String>,
    pub timeout_secs: u64,
}

impl Default for ForemanConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("data"),
            log_dir: PathBuf::from("logs"),
            report_dir: PathBuf::from("reports"),
            workspaces_dir: PathBuf::from("workspaces"),
            database: PathBuf::from("data/foreman.sqlite"),
            max_log_bytes: 1024 * 1024,
            worker: WorkerConfig::default(),
            sandbox: SandboxConfig::default(),
            agent: AgentConfig {
                command: Vec::new(),
                timeout_secs: 30 * 60,
            },
        }
    }
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 700,
            max_fix_loops: 2,
            gate_file: PathBuf::from("check.txt"),
            test_command: None,
        }
    }
}

impl Default for SandboxConfig {
    fn default() -> Self {
        Self {
            allowed_commands: DEFAULT_ALLOWED_COMMANDS
                .iter()
                .map(|command| command.to_string())
                .collect(),
            command_timeout_secs: 600,
            output_limit_bytes: 200_000,
            read_max_bytes: 200_000,
        }
    }
}

impl ForemanConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_log_bytes == 0 {
            return Err(anyhow!("max_log_bytes must be > 0"));
        }
        if self.worker.poll_interval_ms == 0 {
            return Err(anyhow!("worker.poll_interval_ms must be > 0"));
        }
        if self.sandbox.command_timeout_secs == 0 {
            return Err(anyhow!("sandbox.command_timeout_secs must be > 0"));
        }
        if self.sandbox.output_limit_bytes == 0 {
            return Err(anyhow!("sandbox.output_limit_bytes must be > 0"));
        }
        if self.sandbox.read_max_bytes == 0 {
            return Err(anyhow!("sandbox.read_max_bytes must be > 0"));
        }
        if self.agent.timeout_secs == 0 {
            return Err(anyhow!("agent.timeout_secs must be > 0"));
        }
        if self
            .agent
            .command
            .first()
            .is_some_and(|program| program.trim().is_empty())
        {
            return Err(anyhow!("agent.command must start with a program name"));
        }
        if let Some(command) = &self.worker.test_command
            && command.trim().is_empty()
        {
            return Err(anyhow!("worker.test_command must not be blank"));
        }
        Ok(())
    }

    /// Global command policy, honoring [`ALLOWED_CMDS_ENV`].
    pub fn command_policy(&self) -> CommandPolicy {
        match env::var(ALLOWED_CMDS_ENV) {
            Ok(csv) if !csv.trim().is_empty() => CommandPolicy::from_csv(&csv),
            _ => CommandPolicy::new(&self.sandbox.allowed_commands),
        }
    }

    pub fn sandbox_limits(&self) -> SandboxLimits {
        SandboxLimits {
            command_timeout: Duration::from_secs(self.sandbox.command_timeout_secs),
            output_limit_bytes: self.sandbox.output_limit_bytes,
            read_max_bytes: self.sandbox.read_max_bytes,
        }
    }
}

/// Config plus the home directory its relative paths resolve against.
#[derive(Debug, Clone)]
pub struct Home {
    root: PathBuf,
    pub config: ForemanConfig,
}

impl Home {
    /// Load `foreman.toml` from `root` (defaults when missing).
    pub fn load(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        let config = load_config(&root.join(CONFIG_FILE))?;
        Ok(Self { root, config })
    }

    pub fn new(root: impl Into<PathBuf>, config: ForemanConfig) -> Self {
        Self {
            root: root.into(),
            config,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, path: &Path) -> PathBuf {
        if path.is_absolute() {
            path.to_path_buf()
        } else {
            self.root.join(path)
        }
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.join(CONFIG_FILE)
    }

    pub fn database(&self) -> PathBuf {
        self.resolve(&self.config.database)
    }

    pub fn workspaces_dir(&self) -> PathBuf {
        self.resolve(&self.config.workspaces_dir)
    }

    pub fn layout(&self) -> ArtifactLayout {
        ArtifactLayout::new(
            self.resolve(&self.config.log_dir),
            self.resolve(&self.config.report_dir),
        )
    }

    /// Gate file path, or `None` when the gate is disabled.
    pub fn gate_file(&self) -> Option<PathBuf> {
        let gate = &self.config.worker.gate_file;
        (!gate.as_os_str().is_empty()).then(|| self.resolve(gate))
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `ForemanConfig::default()`.
pub fn load_config(path: &Path) -> Result<ForemanConfig> {
    if !path.exists() {
        let cfg = ForemanConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: ForemanConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &ForemanConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

//! Cooperative cancellation gate.
//!
//! Workers check the gate before every claim and before every round-trip to
//! the agent. A closed gate yields [`Cancelled`], which callers propagate
//! without marking the current unit failed.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::debug;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("gate closed: work cancelled")]
pub struct Cancelled;

pub trait Gate {
    fn is_open(&self) -> bool;

    fn check(&self) -> Result<(), Cancelled> {
        if self.is_open() { Ok(()) } else { Err(Cancelled) }
    }
}

/// Gate that never closes.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl Gate for AlwaysOpen {
    fn is_open(&self) -> bool {
        true
    }
}

/// Gate backed by a file whose trimmed, case-insensitive content must be `true`.
///
/// A missing or unreadable file counts as closed.
#[derive(Debug, Clone)]
pub struct FileGate {
    path: PathBuf,
}

impl FileGate {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write the gate file so that it reads as open or closed.
    pub fn set(&self, open: bool) -> Result<()> {
        if let Some(parent) = self.path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)
                .with_context(|| format!("create {}", parent.display()))?;
        }
        let content = if open { "true\n" } else { "false\n" };
        fs::write(&self.path, content)
            .with_context(|| format!("write gate {}", self.path.display()))
    }
}

impl Gate for FileGate {
    fn is_open(&self) -> bool {
        match fs::read_to_string(&self.path) {
            Ok(content) => content.trim().eq_ignore_ascii_case("true"),
            Err(err) => {
                if err.kind() != io::ErrorKind::NotFound {
                    debug!(path = %self.path.display(), err = %err, "gate unreadable");
                }
                false
            }
        }
    }
}

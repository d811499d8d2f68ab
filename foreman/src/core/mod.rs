//! Deterministic, pure logic shared by the store, sandbox and worker.
//!
//! Core modules must be free of I/O side effects. The patch engine reaches the
//! filesystem only through the [`patch::RepoFs`] trait.

pub mod allowlist;
pub mod budget;
pub mod command_policy;
pub mod patch;
pub mod report;
pub mod safe_path;
pub mod types;

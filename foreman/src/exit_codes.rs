//! Stable exit codes for foreman CLI commands.

/// Command succeeded, or `work --once` processed a job.
pub const OK: i32 = 0;
/// Invalid configuration, arguments or state, or any other error.
pub const INVALID: i32 = 1;
/// `work --once` found no queued job.
pub const IDLE: i32 = 2;
/// The gate was closed, before claiming or while a job was running.
pub const CANCELLED: i32 = 3;

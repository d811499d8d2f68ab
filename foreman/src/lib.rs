//! Job, step and subtask work queue for repository agents.
//!
//! A job is planned into ordered steps, each step is decomposed into ordered
//! subtasks, and every subtask is executed by an agent through a sandbox that
//! confines file access and commands to the unit's allowlists.
//!
//! - **[`core`]**: Pure logic (data model, allowlists, patch engine, reports).
//! - **[`io`]**: Store, logs, artifacts, sandbox and process execution.
//!
//! [`worker`] ties them together; [`agent`] is the seam to the planner and
//! executor backend.

pub mod agent;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod session;
#[cfg(any(test, feature = "test-support"))]
pub mod test_support;
pub mod worker;

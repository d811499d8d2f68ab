//! Side-effecting parts of the queue: database, filesystem, processes.

pub mod artifacts;
pub mod clock;
pub mod config;
pub mod gate;
pub mod joblog;
pub mod process;
pub mod sandbox;
pub mod store;
pub mod workspace;

//! Wall-clock budget for one agent conversation.

use std::time::{Duration, Instant};

use anyhow::{Result, bail};

/// A fixed point in time after which a conversation is abandoned.
#[derive(Debug, Clone, Copy)]
pub struct Deadline {
    at: Instant,
}

impl Deadline {
    pub fn after(budget: Duration) -> Self {
        Self {
            at: Instant::now() + budget,
        }
    }

    /// Time left before the deadline, or an error once it has passed.
    pub fn remaining(&self) -> Result<Duration> {
        match self.at.checked_duration_since(Instant::now()) {
            Some(left) if !left.is_zero() => Ok(left),
            _ => bail!("agent exceeded its time budget"),
        }
    }
}

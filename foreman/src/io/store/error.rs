use std::fmt;

use thiserror::Error;

use crate::core::types::UnitStatus;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnitKind {
    Job,
    Step,
    Subtask,
}

impl fmt::Display for UnitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            UnitKind::Job => "job",
            UnitKind::Step => "step",
            UnitKind::Subtask => "subtask",
        })
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("sqlite: {0}")]
    Sql(#[from] rusqlite::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{kind} {id} not found")]
    NotFound { kind: UnitKind, id: i64 },
    #[error("cannot mark {kind} {id} {to}: it is {from}")]
    InvalidTransition {
        kind: UnitKind,
        id: i64,
        from: UnitStatus,
        to: UnitStatus,
    },
}

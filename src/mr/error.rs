use std::fmt;

use thiserror::Error;

use super::task::Phase;

pub type Result<T> = std::result::Result<T, Error>;

/// One task that did not reach a successful terminal state.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFailure {
    pub phase: Phase,
    pub task_id: usize,
    pub cause: String,
}

impl fmt::Display for TaskFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} task#{}: {}", self.phase, self.task_id, self.cause)
    }
}

#[derive(Error, Debug)]
pub enum Error {
    #[error("resource unavailable: {resource}: {reason}")]
    ResourceUnavailable { resource: String, reason: String },

    #[error("malformed record in {artifact} (line {line}): {reason}")]
    MalformedRecord {
        artifact: String,
        line: u64,
        reason: String,
    },

    #[error("intermediate store already exists at {0}")]
    StoreInitConflict(String),

    #[error("grouping query failed: {0}")]
    StoreQueryFailure(String),

    #[error("{0}")]
    TaskFailure(TaskFailure),

    #[error("{phase} phase failed in {} task(s): {}", .failures.len(), join_failures(.failures))]
    PhaseFailed {
        phase: Phase,
        failures: Vec<TaskFailure>,
    },

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),
}

impl Error {
    pub fn unavailable<R: fmt::Display, E: fmt::Display>(resource: R, reason: E) -> Self {
        Error::ResourceUnavailable {
            resource: resource.to_string(),
            reason: reason.to_string(),
        }
    }

    /// Task ids named by a phase failure, empty for every other variant.
    pub fn failed_task_ids(&self) -> Vec<usize> {
        match self {
            Error::PhaseFailed { failures, .. } => failures.iter().map(|f| f.task_id).collect(),
            Error::TaskFailure(failure) => vec![failure.task_id],
            _ => vec![],
        }
    }
}

fn join_failures(failures: &[TaskFailure]) -> String {
    failures
        .iter()
        .map(|f| format!("task#{} ({})", f.task_id, f.cause))
        .collect::<Vec<_>>()
        .join(", ")
}

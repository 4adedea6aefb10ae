use std::fmt;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::storage::Storage;

use super::artifact;
use super::{EngineConfig, Error, InputUnit, MRApp, MapInput, Params, ReduceGroup, Result, TaskFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
    Map,
    Reduce,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Map => write!(f, "map"),
            Phase::Reduce => write!(f, "reduce"),
        }
    }
}

/// Namespace for the transient names of one run: map artifacts and
/// appender blobs. Unique among runs on the same machine.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunId(String);

impl RunId {
    pub fn next() -> Self {
        static SEQ: AtomicU64 = AtomicU64::new(0);
        RunId(format!("{}-{}", std::process::id(), SEQ.fetch_add(1, Ordering::Relaxed)))
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Phase {
    /// Map artifacts are transient and live in the staging directory under
    /// the run's namespace; reduce artifacts are the final output.
    pub fn artifact_path(self, config: &EngineConfig, run: &RunId, task_id: usize) -> PathBuf {
        match self {
            Phase::Map => config.staging_dir.join(format!("part-tmp-{}-{}.csv", run, task_id)),
            Phase::Reduce => config.output_dir.join(format!("part-{}-final.csv", task_id)),
        }
    }
}

#[derive(Debug, Clone)]
pub enum TaskInput {
    Map(InputUnit),
    Reduce(ReduceGroup),
}

impl TaskInput {
    pub fn phase(&self) -> Phase {
        match self {
            TaskInput::Map(_) => Phase::Map,
            TaskInput::Reduce(_) => Phase::Reduce,
        }
    }
}

#[derive(Debug, Clone)]
pub struct Task {
    pub id: usize,
    pub input: TaskInput,
    pub output: PathBuf,
}

impl Task {
    pub fn new(id: usize, input: TaskInput, config: &EngineConfig, run: &RunId) -> Self {
        let output = input.phase().artifact_path(config, run, id);
        Task { id, input, output }
    }

    pub fn phase(&self) -> Phase {
        self.input.phase()
    }
}

/// Run the user function for `task` and persist its output, returning the
/// artifact path.
pub async fn run(
    app: Arc<dyn MRApp>,
    storage: Arc<dyn Storage>,
    task: Task,
    params: Arc<Params>,
) -> Result<PathBuf> {
    let phase = task.phase();
    let task_id = task.id;
    log::debug!("Starting {} task#{}", phase, task_id);

    let results = match task.input {
        TaskInput::Map(unit) => app.map(MapInput::new(unit, storage), params).await,
        TaskInput::Reduce(group) => app.reduce(group.key, group.values, params).await,
    }
    .map_err(|e| {
        Error::TaskFailure(TaskFailure {
            phase,
            task_id,
            cause: format!("{:#}", e),
        })
    })?;

    artifact::write_artifact(&task.output, &results).await?;
    log::debug!("Finished {} task#{}: {} records", phase, task_id, results.len());
    Ok(task.output)
}

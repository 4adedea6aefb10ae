use std::any::Any;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::io::ErrorKind;
use std::panic::AssertUnwindSafe;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::FutureExt as _;
use tokio::sync::{Semaphore, mpsc};

use crate::storage::Storage;

use super::artifact;
use super::batcher;
use super::store::{CsvStore, IntermediateStore};
use super::task::{self, RunId, Task, TaskInput};
use super::{EngineConfig, Error, InputMode, InputUnit, MRApp, Params, Phase, Result, TaskFailure};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EngineState {
    Idle,
    Setup,
    Mapping,
    Loading,
    Shuffling,
    Reducing,
    Cleanup,
}

impl fmt::Display for EngineState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunReport {
    pub map_tasks: usize,
    pub groups: usize,
    /// Final artifacts, indexed by reduce task id.
    pub outputs: Vec<PathBuf>,
}

/// Drives one map → shuffle → reduce run at a time.
///
/// Each phase runs on a pool of at most `max_workers` concurrent tasks and
/// ends with a barrier: the next step starts only once every task of the
/// phase has reported success or failure.
pub struct Engine<S: IntermediateStore = CsvStore> {
    config: EngineConfig,
    app: Arc<dyn MRApp>,
    storage: Arc<dyn Storage>,
    params: Arc<Params>,
    store: S,
    state: EngineState,
    store_open: bool,
    run: RunId,
    map_artifacts: Vec<PathBuf>,
    transient_blobs: Vec<String>,
}

impl Engine<CsvStore> {
    pub fn new(config: EngineConfig, app: Arc<dyn MRApp>, storage: Arc<dyn Storage>) -> Self {
        let store = CsvStore::new(config.store_location.clone(), config.on_conflict);
        Self::with_store(config, app, storage, store)
    }
}

impl<S: IntermediateStore> Engine<S> {
    pub fn with_store(config: EngineConfig, app: Arc<dyn MRApp>, storage: Arc<dyn Storage>, store: S) -> Self {
        Engine {
            config,
            app,
            storage,
            params: Arc::default(),
            store,
            state: EngineState::Idle,
            store_open: false,
            run: RunId::next(),
            map_artifacts: vec![],
            transient_blobs: vec![],
        }
    }

    pub fn with_params(mut self, params: Params) -> Self {
        self.params = Arc::new(params);
        self
    }

    pub fn state(&self) -> EngineState {
        self.state
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Run the whole pipeline over `inputs`. Transient state is cleaned up
    /// whether or not the run succeeds; final outputs are kept.
    pub async fn execute(&mut self, inputs: Vec<String>) -> Result<RunReport> {
        if self.state != EngineState::Idle {
            return Err(Error::StoreInitConflict(format!(
                "engine left in {} state by an interrupted run, call cleanup first",
                self.state
            )));
        }

        log::info!("Starting map-reduce over {} inputs ({:?} mode)", inputs.len(), self.config.input_mode);
        let result = self.run_pipeline(inputs).await;
        if let Err(e) = &result {
            log::warn!("Run failed in {} state: {}", self.state, e);
        }

        match (result, self.cleanup().await) {
            (Ok(report), Ok(())) => {
                log::info!("MapReduce completed: {} outputs", report.outputs.len());
                Ok(report)
            }
            (Ok(_), Err(e)) => Err(e),
            (Err(e), Err(cleanup_err)) => {
                log::warn!("Cleanup after failed run also failed: {}", cleanup_err);
                Err(e)
            }
            (Err(e), Ok(())) => Err(e),
        }
    }

    async fn run_pipeline(&mut self, inputs: Vec<String>) -> Result<RunReport> {
        self.run = RunId::next();
        log::debug!("Run {} started", self.run);
        self.transition(EngineState::Setup);
        self.setup().await?;
        let units = self.prepare_inputs(inputs).await?;

        self.transition(EngineState::Mapping);
        let map_tasks: Vec<Task> = units
            .into_iter()
            .enumerate()
            .map(|(id, unit)| Task::new(id, TaskInput::Map(unit), &self.config, &self.run))
            .collect();
        self.map_artifacts = map_tasks.iter().map(|t| t.output.clone()).collect();
        let map_count = map_tasks.len();
        let artifacts = self.run_phase(map_tasks).await?;

        self.transition(EngineState::Loading);
        for path in &artifacts {
            let records = artifact::read_artifact(path).await?;
            self.store.append(records).await?;
        }

        self.transition(EngineState::Shuffling);
        let groups = self.store.group_by_key().await?;
        let group_count = groups.len();
        log::info!("Shuffled {} map outputs into {} key groups", artifacts.len(), group_count);

        self.transition(EngineState::Reducing);
        let reduce_tasks = groups
            .into_iter()
            .enumerate()
            .map(|(id, group)| Task::new(id, TaskInput::Reduce(group), &self.config, &self.run))
            .collect();
        let outputs = self.run_phase(reduce_tasks).await?;

        Ok(RunReport {
            map_tasks: map_count,
            groups: group_count,
            outputs,
        })
    }

    async fn setup(&mut self) -> Result<()> {
        self.config.validate()?;
        self.store.open().await?;
        self.store_open = true;
        for dir in [&self.config.staging_dir, &self.config.output_dir] {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::unavailable(dir.display(), e))?;
        }
        Ok(())
    }

    async fn prepare_inputs(&mut self, inputs: Vec<String>) -> Result<Vec<InputUnit>> {
        if self.config.input_mode == InputMode::Single {
            return Ok(inputs.into_iter().map(InputUnit::Item).collect());
        }

        let batches = batcher::plan(self.storage.as_ref(), &inputs, self.config.chunk_size).await?;
        log::info!(
            "Grouped {} inputs into {} batches of at most {} bytes",
            inputs.len(),
            batches.len(),
            self.config.chunk_size
        );
        if self.config.input_mode == InputMode::Batch {
            return Ok(batches.into_iter().map(|b| InputUnit::Items(b.items)).collect());
        }

        let mut units = Vec::with_capacity(batches.len());
        for (idx, batch) in batches.into_iter().enumerate() {
            let blobs = self.storage.read_many(&batch.items).await?;
            let mut joined = Vec::with_capacity(batch.size as usize + batch.items.len());
            for (i, id) in batch.items.iter().enumerate() {
                if i > 0 {
                    joined.push(b' ');
                }
                let data = blobs
                    .get(id)
                    .ok_or_else(|| Error::unavailable(id, "missing from batch read"))?;
                joined.extend_from_slice(data);
            }
            let blob_id = format!("tmp_{}_{}", self.run, idx);
            self.storage.write(&blob_id, &joined).await?;
            self.transient_blobs.push(blob_id.clone());
            units.push(InputUnit::Item(blob_id));
        }
        Ok(units)
    }

    async fn run_phase(&self, tasks: Vec<Task>) -> Result<Vec<PathBuf>> {
        let Some(phase) = tasks.first().map(Task::phase) else {
            return Ok(vec![]);
        };
        let total = tasks.len();
        log::info!("Running {} {} tasks, {} at a time", total, phase, self.config.max_workers);

        let (report_tx, mut report_rx) = mpsc::unbounded_channel::<(usize, Result<PathBuf>)>();
        let workers = Arc::new(Semaphore::new(self.config.max_workers));
        let mut pending: BTreeSet<usize> = tasks.iter().map(|t| t.id).collect();

        for task in tasks {
            let permit = workers
                .clone()
                .acquire_owned()
                .await
                .map_err(|e| Error::unavailable("worker pool", e))?;
            let report_tx = report_tx.clone();
            let app = self.app.clone();
            let storage = self.storage.clone();
            let params = self.params.clone();
            tokio::spawn(async move {
                let task_id = task.id;
                let result = AssertUnwindSafe(task::run(app, storage, task, params))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        Err(Error::TaskFailure(TaskFailure {
                            phase,
                            task_id,
                            cause: panic_message(panic),
                        }))
                    });
                drop(permit);
                let _ = report_tx.send((task_id, result));
            });
        }
        drop(report_tx);

        let mut outputs = BTreeMap::new();
        let mut failures = vec![];
        while let Some((task_id, result)) = report_rx.recv().await {
            pending.remove(&task_id);
            match result {
                Ok(path) => {
                    outputs.insert(task_id, path);
                }
                Err(e) => {
                    log::warn!("{} task#{} failed: {}", phase, task_id, e);
                    failures.push(into_failure(phase, task_id, e));
                }
            }
        }
        // the channel only closes once every sender is gone
        for task_id in pending {
            failures.push(TaskFailure {
                phase,
                task_id,
                cause: "terminated without reporting".to_string(),
            });
        }

        if !failures.is_empty() {
            failures.sort_by_key(|f| f.task_id);
            return Err(Error::PhaseFailed { phase, failures });
        }
        log::info!("All {} {} tasks completed", total, phase);
        Ok(outputs.into_values().collect())
    }

    /// Remove the store, the run's map artifacts and transient blobs. Final
    /// outputs stay. Safe to call repeatedly.
    pub async fn cleanup(&mut self) -> Result<()> {
        self.transition(EngineState::Cleanup);
        let mut first_err = None;

        if self.store_open {
            match self.store.close().await {
                Ok(()) => self.store_open = false,
                Err(e) => {
                    log::warn!("Failed to close intermediate store: {}", e);
                    first_err.get_or_insert(e);
                }
            }
        }

        for path in std::mem::take(&mut self.map_artifacts) {
            for p in [artifact::partial_path(&path), path] {
                if let Err(e) = remove_if_exists(&p).await {
                    log::warn!("Failed to remove {}: {}", p.display(), e);
                    first_err.get_or_insert(e);
                }
            }
        }
        // only succeeds when nothing else lives there
        let _ = tokio::fs::remove_dir(&self.config.staging_dir).await;

        for id in std::mem::take(&mut self.transient_blobs) {
            if let Err(e) = self.storage.delete(std::slice::from_ref(&id)).await {
                log::warn!("Failed to delete transient blob {}: {}", id, e);
            }
        }

        self.transition(EngineState::Idle);
        first_err.map_or(Ok(()), Err)
    }

    fn transition(&mut self, next: EngineState) {
        log::debug!("Engine {} -> {}", self.state, next);
        self.state = next;
    }
}

fn into_failure(phase: Phase, task_id: usize, err: Error) -> TaskFailure {
    match err {
        Error::TaskFailure(failure) => failure,
        other => TaskFailure {
            phase,
            task_id,
            cause: other.to_string(),
        },
    }
}

fn panic_message(panic: Box<dyn Any + Send>) -> String {
    if let Some(msg) = panic.downcast_ref::<&str>() {
        format!("panicked: {}", msg)
    } else if let Some(msg) = panic.downcast_ref::<String>() {
        format!("panicked: {}", msg)
    } else {
        "panicked".to_string()
    }
}

async fn remove_if_exists(path: &Path) -> Result<()> {
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(Error::unavailable(path.display(), e)),
    }
}

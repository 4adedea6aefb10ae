use std::collections::BTreeMap;
use std::pin::Pin;
use std::sync::Arc;

use crate::storage::Storage;

pub mod artifact;
pub mod batcher;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;
pub mod task;

pub use config::{EngineConfig, InputMode, OnConflict};
pub use engine::{Engine, EngineState, RunReport};
pub use error::{Error, Result, TaskFailure};
pub use task::{Phase, RunId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyValue {
    pub key: String,
    pub value: String,
}

impl KeyValue {
    pub fn new<K: Into<String>, V: Into<String>>(key: K, value: V) -> Self {
        KeyValue { key: key.into(), value: value.into() }
    }
}

/// All values sharing one key, in the order they reached the store.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReduceGroup {
    pub key: String,
    pub values: Vec<String>,
}

pub type Params = BTreeMap<String, String>;

/// What a single map task works on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InputUnit {
    Item(String),
    /// Several blobs mapped together by one task, in batch order.
    Items(Vec<String>),
}

impl InputUnit {
    pub fn ids(&self) -> &[String] {
        match self {
            InputUnit::Item(id) => std::slice::from_ref(id),
            InputUnit::Items(ids) => ids,
        }
    }
}

/// Input handed to `MRApp::map`: the unit plus a way to resolve it.
#[derive(Clone)]
pub struct MapInput {
    unit: InputUnit,
    storage: Arc<dyn Storage>,
}

impl MapInput {
    pub fn new(unit: InputUnit, storage: Arc<dyn Storage>) -> Self {
        MapInput { unit, storage }
    }

    pub fn unit(&self) -> &InputUnit {
        &self.unit
    }

    /// Contents of every blob in the unit, as `(id, text)` in unit order.
    pub async fn contents(&self) -> Result<Vec<(String, String)>> {
        let ids = self.unit.ids();
        let mut blobs = self.storage.read_many(ids).await?;
        let mut out = Vec::with_capacity(ids.len());
        for id in ids {
            let data = blobs
                .remove(id)
                .ok_or_else(|| Error::unavailable(id, "missing from batch read"))?;
            out.push((id.clone(), String::from_utf8_lossy(&data).into_owned()));
        }
        Ok(out)
    }
}

pub type AppFuture<T> = Pin<Box<dyn Future<Output = anyhow::Result<T>> + Send + 'static>>;

pub trait MRApp: Send + Sync {
    fn map(&self, input: MapInput, params: Arc<Params>) -> AppFuture<Vec<KeyValue>>;
    fn reduce(&self, key: String, values: Vec<String>, params: Arc<Params>) -> AppFuture<Vec<KeyValue>>;
}

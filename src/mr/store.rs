//! The shuffle: records from every map task are loaded into a store, then
//! read back grouped by key.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use tokio::io::AsyncWriteExt as _;

use super::{Error, KeyValue, OnConflict, ReduceGroup, Result};

/// Loaded by one writer, then queried by one reader; no internal locking.
#[async_trait]
pub trait IntermediateStore: Send {
    /// Start a fresh, empty store. Fails with `StoreInitConflict` if one is
    /// already present and the conflict policy is `Fail`.
    async fn open(&mut self) -> Result<()>;

    /// Add records. Calls commute with each other.
    async fn append(&mut self, records: Vec<KeyValue>) -> Result<()>;

    /// One group per distinct key, ascending by key.
    async fn group_by_key(&mut self) -> Result<Vec<ReduceGroup>>;

    /// Release everything. Safe to call on a closed or never-opened store.
    async fn close(&mut self) -> Result<()>;
}

fn into_groups(grouped: BTreeMap<String, Vec<String>>) -> Vec<ReduceGroup> {
    grouped
        .into_iter()
        .map(|(key, values)| ReduceGroup { key, values })
        .collect()
}

/// Sorted in-process multimap.
#[derive(Debug, Default)]
pub struct MemStore {
    on_conflict: OnConflict,
    records: Option<BTreeMap<String, Vec<String>>>,
}

impl MemStore {
    pub fn new(on_conflict: OnConflict) -> Self {
        MemStore { on_conflict, records: None }
    }

    pub fn is_open(&self) -> bool {
        self.records.is_some()
    }
}

#[async_trait]
impl IntermediateStore for MemStore {
    async fn open(&mut self) -> Result<()> {
        if self.records.is_some() && self.on_conflict == OnConflict::Fail {
            return Err(Error::StoreInitConflict("in-memory store".to_string()));
        }
        self.records = Some(BTreeMap::new());
        Ok(())
    }

    async fn append(&mut self, records: Vec<KeyValue>) -> Result<()> {
        let grouped = self
            .records
            .as_mut()
            .ok_or_else(|| Error::unavailable("in-memory store", "not open"))?;
        for kv in records {
            grouped.entry(kv.key).or_default().push(kv.value);
        }
        Ok(())
    }

    async fn group_by_key(&mut self) -> Result<Vec<ReduceGroup>> {
        let grouped = self
            .records
            .as_ref()
            .ok_or_else(|| Error::StoreQueryFailure("in-memory store is not open".to_string()))?;
        Ok(into_groups(grouped.clone()))
    }

    async fn close(&mut self) -> Result<()> {
        self.records = None;
        Ok(())
    }
}

const TABLE: &str = "temp_results.csv";

/// Staging table kept as a CSV file inside a directory that doubles as the
/// store's lock: two stores cannot share a location.
#[derive(Debug)]
pub struct CsvStore {
    location: PathBuf,
    on_conflict: OnConflict,
}

impl CsvStore {
    pub fn new<P: Into<PathBuf>>(location: P, on_conflict: OnConflict) -> Self {
        CsvStore { location: location.into(), on_conflict }
    }

    pub fn location(&self) -> &Path {
        &self.location
    }

    fn table(&self) -> PathBuf {
        self.location.join(TABLE)
    }

    async fn create_table(&self) -> Result<()> {
        let table = self.table();
        tokio::fs::write(&table, "key,value\n")
            .await
            .map_err(|e| Error::unavailable(table.display(), e))
    }
}

#[async_trait]
impl IntermediateStore for CsvStore {
    async fn open(&mut self) -> Result<()> {
        if let Some(parent) = self.location.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| Error::unavailable(parent.display(), e))?;
            }
        }
        match tokio::fs::create_dir(&self.location).await {
            Ok(()) => {}
            Err(e) if e.kind() == ErrorKind::AlreadyExists => match self.on_conflict {
                OnConflict::Fail => {
                    return Err(Error::StoreInitConflict(self.location.display().to_string()));
                }
                OnConflict::Reset => {
                    log::warn!("Resetting stale store at {}", self.location.display());
                    tokio::fs::remove_dir_all(&self.location)
                        .await
                        .map_err(|e| Error::unavailable(self.location.display(), e))?;
                    tokio::fs::create_dir(&self.location)
                        .await
                        .map_err(|e| Error::unavailable(self.location.display(), e))?;
                }
            },
            Err(e) => return Err(Error::unavailable(self.location.display(), e)),
        }
        self.create_table().await
    }

    async fn append(&mut self, records: Vec<KeyValue>) -> Result<()> {
        let table = self.table();
        let mut writer = csv::Writer::from_writer(vec![]);
        for kv in &records {
            writer
                .write_record([&kv.key, &kv.value])
                .map_err(|e| Error::unavailable(table.display(), e))?;
        }
        let rows = writer
            .into_inner()
            .map_err(|e| Error::unavailable(table.display(), e.error()))?;

        let mut file = tokio::fs::OpenOptions::new()
            .append(true)
            .open(&table)
            .await
            .map_err(|e| Error::unavailable(table.display(), e))?;
        file.write_all(&rows)
            .await
            .map_err(|e| Error::unavailable(table.display(), e))?;
        file.flush().await.map_err(|e| Error::unavailable(table.display(), e))
    }

    async fn group_by_key(&mut self) -> Result<Vec<ReduceGroup>> {
        let table = self.table();
        let data = tokio::fs::read(&table)
            .await
            .map_err(|e| Error::StoreQueryFailure(format!("{}: {}", table.display(), e)))?;

        let mut reader = csv::ReaderBuilder::new().has_headers(true).from_reader(data.as_slice());
        let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
        for record in reader.records() {
            let record = record.map_err(|e| Error::StoreQueryFailure(format!("{}: {}", table.display(), e)))?;
            if record.len() != 2 {
                return Err(Error::StoreQueryFailure(format!(
                    "{}: row with {} columns",
                    table.display(),
                    record.len()
                )));
            }
            grouped.entry(record[0].to_string()).or_default().push(record[1].to_string());
        }
        Ok(into_groups(grouped))
    }

    async fn close(&mut self) -> Result<()> {
        match tokio::fs::remove_dir_all(&self.location).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::unavailable(self.location.display(), e)),
        }
    }
}

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use super::{Metadata, Storage};
use crate::mr::{Error, Result};

/// In-process blob storage, cheap to clone and share between tasks.
#[derive(Clone, Default)]
pub struct MemStorage {
    blobs: Arc<Mutex<BTreeMap<String, Vec<u8>>>>,
}

impl MemStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a storage holding `inputs`, in order, under ids `file_0`, `file_1`, ...
    pub fn with_inputs<I, S>(inputs: I) -> (Self, Vec<String>)
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let storage = Self::new();
        let mut ids = vec![];
        {
            let mut blobs = storage.lock();
            for (i, data) in inputs.into_iter().enumerate() {
                let id = format!("file_{}", i);
                blobs.insert(id.clone(), data.as_ref().as_bytes().to_vec());
                ids.push(id);
            }
        }
        (storage, ids)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.lock().contains_key(id)
    }

    pub fn ids(&self) -> Vec<String> {
        self.lock().keys().cloned().collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Vec<u8>>> {
        // a poisoned map is still structurally valid
        self.blobs.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl Storage for MemStorage {
    async fn read(&self, id: &str) -> Result<Vec<u8>> {
        self.lock()
            .get(id)
            .cloned()
            .ok_or_else(|| Error::unavailable(id, "no such blob"))
    }

    async fn read_metadata(&self, id: &str) -> Result<Metadata> {
        let size = self
            .lock()
            .get(id)
            .map(|b| b.len() as u64)
            .ok_or_else(|| Error::unavailable(id, "no such blob"))?;
        Ok(Metadata {
            filename: id.to_string(),
            size,
        })
    }

    async fn write(&self, id: &str, data: &[u8]) -> Result<()> {
        self.lock().insert(id.to_string(), data.to_vec());
        Ok(())
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        let mut blobs = self.lock();
        for id in ids {
            if blobs.remove(id).is_none() {
                return Err(Error::unavailable(id, "no such blob"));
            }
        }
        Ok(())
    }
}

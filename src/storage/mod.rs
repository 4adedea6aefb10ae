//! Key-addressed blob storage consumed by the engine and by map functions.

mod fs;
mod memory;

use std::collections::BTreeMap;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::mr::Result;

pub use fs::FsStorage;
pub use memory::MemStorage;

/// Descriptor stored next to every blob.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Metadata {
    pub filename: String,
    pub size: u64,
}

#[async_trait]
pub trait Storage: Send + Sync {
    async fn read(&self, id: &str) -> Result<Vec<u8>>;

    async fn read_many(&self, ids: &[String]) -> Result<BTreeMap<String, Vec<u8>>> {
        let mut out = BTreeMap::new();
        for id in ids {
            out.insert(id.clone(), self.read(id).await?);
        }
        Ok(out)
    }

    async fn read_metadata(&self, id: &str) -> Result<Metadata>;

    async fn write(&self, id: &str, data: &[u8]) -> Result<()>;

    async fn delete(&self, ids: &[String]) -> Result<()>;
}

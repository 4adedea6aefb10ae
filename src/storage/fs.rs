use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use async_trait::async_trait;

use super::{Metadata, Storage};
use crate::mr::{Error, Result};

/// Blobs under `<root>/files/<id>_data.txt`, descriptors under
/// `<root>/metadata/<id>_meta.json`.
#[derive(Debug, Clone)]
pub struct FsStorage {
    root: PathBuf,
}

impl FsStorage {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        FsStorage { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn data_file_name(id: &str) -> String {
        format!("{}_data.txt", id)
    }

    fn data_path(&self, id: &str) -> PathBuf {
        self.root.join("files").join(Self::data_file_name(id))
    }

    fn meta_path(&self, id: &str) -> PathBuf {
        self.root.join("metadata").join(format!("{}_meta.json", id))
    }
}

#[async_trait]
impl Storage for FsStorage {
    async fn read(&self, id: &str) -> Result<Vec<u8>> {
        let path = self.data_path(id);
        tokio::fs::read(&path)
            .await
            .map_err(|e| Error::unavailable(path.display(), e))
    }

    async fn read_metadata(&self, id: &str) -> Result<Metadata> {
        let path = self.meta_path(id);
        let raw = tokio::fs::read(&path)
            .await
            .map_err(|e| Error::unavailable(path.display(), e))?;
        serde_json::from_slice(&raw).map_err(|e| Error::unavailable(path.display(), e))
    }

    async fn write(&self, id: &str, data: &[u8]) -> Result<()> {
        let path = self.data_path(id);
        let meta_path = self.meta_path(id);
        for dir in [path.parent(), meta_path.parent()].into_iter().flatten() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|e| Error::unavailable(dir.display(), e))?;
        }
        tokio::fs::write(&path, data)
            .await
            .map_err(|e| Error::unavailable(path.display(), e))?;

        let meta = Metadata {
            filename: Self::data_file_name(id),
            size: data.len() as u64,
        };
        let raw = serde_json::to_vec(&meta).map_err(|e| Error::unavailable(meta_path.display(), e))?;
        tokio::fs::write(&meta_path, raw)
            .await
            .map_err(|e| Error::unavailable(meta_path.display(), e))
    }

    async fn delete(&self, ids: &[String]) -> Result<()> {
        for id in ids {
            let path = self.data_path(id);
            tokio::fs::remove_file(&path)
                .await
                .map_err(|e| Error::unavailable(path.display(), e))?;
            let meta_path = self.meta_path(id);
            match tokio::fs::remove_file(&meta_path).await {
                Ok(()) => {}
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(Error::unavailable(meta_path.display(), e)),
            }
        }
        Ok(())
    }
}

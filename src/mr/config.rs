use std::path::{Path, PathBuf};

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use super::{Error, Result};

/// How input identifiers become map tasks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum InputMode {
    /// One map task per identifier.
    #[default]
    Single,
    /// One map task per size-bounded batch of identifiers.
    Batch,
    /// Each batch is concatenated into a transient blob, one map task per blob.
    Appender,
}

/// What `Setup` does when the store location is already taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "snake_case")]
pub enum OnConflict {
    #[default]
    Fail,
    Reset,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Upper bound, in bytes, on the accumulated size of a batch.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: u64,
    #[serde(default)]
    pub input_mode: InputMode,
    #[serde(default = "default_store_location")]
    pub store_location: PathBuf,
    #[serde(default = "default_staging_dir")]
    pub staging_dir: PathBuf,
    #[serde(default = "default_output_dir")]
    pub output_dir: PathBuf,
    #[serde(default)]
    pub on_conflict: OnConflict,
    /// Concurrent tasks per phase.
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
}

pub const DEFAULT_CHUNK_SIZE: u64 = 300 * 1000;

fn default_chunk_size() -> u64 {
    DEFAULT_CHUNK_SIZE
}

fn default_store_location() -> PathBuf {
    PathBuf::from("mr.store")
}

fn default_staging_dir() -> PathBuf {
    PathBuf::from("mapreducetemp")
}

fn default_output_dir() -> PathBuf {
    PathBuf::from("output")
}

fn default_max_workers() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

impl Default for EngineConfig {
    fn default() -> Self {
        EngineConfig {
            chunk_size: default_chunk_size(),
            input_mode: InputMode::default(),
            store_location: default_store_location(),
            staging_dir: default_staging_dir(),
            output_dir: default_output_dir(),
            on_conflict: OnConflict::default(),
            max_workers: default_max_workers(),
        }
    }
}

impl EngineConfig {
    /// Default settings with every path placed under `root`.
    pub fn rooted<P: AsRef<Path>>(root: P) -> Self {
        let root = root.as_ref();
        EngineConfig {
            store_location: root.join(default_store_location()),
            staging_dir: root.join(default_staging_dir()),
            output_dir: root.join(default_output_dir()),
            ..Self::default()
        }
    }

    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path).map_err(|e| Error::unavailable(path.display(), e))?;
        let config: EngineConfig =
            serde_json::from_str(&contents).map_err(|e| Error::InvalidConfig(format!("{}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.chunk_size == 0 {
            return Err(Error::InvalidConfig("chunk_size must be positive".to_string()));
        }
        if self.max_workers == 0 {
            return Err(Error::InvalidConfig("max_workers must be positive".to_string()));
        }
        if self.staging_dir == self.output_dir {
            return Err(Error::InvalidConfig(
                "staging_dir and output_dir must differ".to_string(),
            ));
        }
        // the store directory is removed wholesale at cleanup
        for (name, dir) in [("staging_dir", &self.staging_dir), ("output_dir", &self.output_dir)] {
            if dir.starts_with(&self.store_location) {
                return Err(Error::InvalidConfig(format!(
                    "{} {} lies inside store_location {}",
                    name,
                    dir.display(),
                    self.store_location.display()
                )));
            }
        }
        Ok(())
    }
}

//! Two-column `key,value` CSV files written by tasks.

use std::collections::BTreeMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};

use super::{Error, KeyValue, Result};

pub const HEADER: [&str; 2] = ["key", "value"];

/// Sibling path a task writes to before renaming into place.
pub fn partial_path(path: &Path) -> PathBuf {
    let mut name = OsString::from(path.as_os_str());
    name.push(".tmp");
    PathBuf::from(name)
}

/// Readers see either the previous state or the complete file, never a prefix.
pub async fn write_artifact(path: &Path, records: &[KeyValue]) -> Result<()> {
    let mut writer = csv::Writer::from_writer(vec![]);
    writer
        .write_record(HEADER)
        .map_err(|e| Error::unavailable(path.display(), e))?;
    for kv in records {
        writer
            .write_record([&kv.key, &kv.value])
            .map_err(|e| Error::unavailable(path.display(), e))?;
    }
    let data = writer
        .into_inner()
        .map_err(|e| Error::unavailable(path.display(), e.error()))?;

    // a concurrent run's cleanup may have removed a shared, empty staging dir
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(|e| Error::unavailable(parent.display(), e))?;
    }
    let partial = partial_path(path);
    tokio::fs::write(&partial, data)
        .await
        .map_err(|e| Error::unavailable(partial.display(), e))?;
    tokio::fs::rename(&partial, path)
        .await
        .map_err(|e| Error::unavailable(path.display(), e))
}

pub async fn read_artifact(path: &Path) -> Result<Vec<KeyValue>> {
    let data = tokio::fs::read(path)
        .await
        .map_err(|e| Error::unavailable(path.display(), e))?;
    parse(path, &data)
}

fn malformed<E: ToString>(path: &Path, line: u64, reason: E) -> Error {
    Error::MalformedRecord {
        artifact: path.display().to_string(),
        line,
        reason: reason.to_string(),
    }
}

fn parse(path: &Path, data: &[u8]) -> Result<Vec<KeyValue>> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .flexible(true)
        .from_reader(data);

    let headers = reader.headers().map_err(|e| malformed(path, 1, e))?;
    if headers.len() != 2 || &headers[0] != HEADER[0] || &headers[1] != HEADER[1] {
        return Err(malformed(path, 1, format!("expected header key,value, got {:?}", headers)));
    }

    let mut out = vec![];
    for record in reader.records() {
        let record = record.map_err(|e| {
            let line = e.position().map(|p| p.line()).unwrap_or(0);
            malformed(path, line, e)
        })?;
        if record.len() != 2 {
            let line = record.position().map(|p| p.line()).unwrap_or(0);
            return Err(malformed(path, line, format!("expected 2 fields, got {}", record.len())));
        }
        out.push(KeyValue::new(&record[0], &record[1]));
    }
    Ok(out)
}

/// Merge final artifacts into one map; later files win on duplicate keys.
pub async fn collect_outputs<P: AsRef<Path>>(paths: &[P]) -> Result<BTreeMap<String, String>> {
    let mut out = BTreeMap::new();
    for path in paths {
        for kv in read_artifact(path.as_ref()).await? {
            out.insert(kv.key, kv.value);
        }
    }
    Ok(out)
}

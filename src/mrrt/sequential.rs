//! Single-threaded reference run: no store, no artifacts, no concurrency.

use std::sync::Arc;

use crate::mr::{InputUnit, KeyValue, MRApp, MapInput, Params};
use crate::storage::Storage;

pub async fn run(
    app: &dyn MRApp,
    storage: Arc<dyn Storage>,
    inputs: Vec<String>,
    params: Arc<Params>,
) -> Result<Vec<KeyValue>, anyhow::Error> {
    let mut intermediate = vec![];
    for id in inputs {
        let input = MapInput::new(InputUnit::Item(id), storage.clone());
        intermediate.extend(app.map(input, params.clone()).await?);
    }

    intermediate.sort_by(|a, b| a.key.cmp(&b.key));

    let mut out = vec![];
    for group in intermediate.chunk_by(|a, b| a.key == b.key) {
        let key = group[0].key.clone();
        let values = group.iter().map(|kv| kv.value.clone()).collect();
        out.extend(app.reduce(key, values, params.clone()).await?);
    }
    Ok(out)
}

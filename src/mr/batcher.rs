//! Size-bounded grouping of input blobs ahead of the map phase.

use crate::storage::Storage;

use super::Result;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    pub items: Vec<String>,
    pub size: u64,
}

/// Greedy left-to-right fill: a batch is closed as soon as the next item
/// would push it past `threshold`. Batches never exceed `threshold` unless
/// they hold a single item that is larger on its own.
pub fn partition<F>(items: &[String], mut size_of: F, threshold: u64) -> Vec<Batch>
where
    F: FnMut(&str) -> u64,
{
    fill(items.iter().map(|item| (item, size_of(item))), threshold)
}

fn fill<'a, I>(sized: I, threshold: u64) -> Vec<Batch>
where
    I: IntoIterator<Item = (&'a String, u64)>,
{
    let mut batches = vec![];
    let mut current = Batch { items: vec![], size: 0 };

    for (item, size) in sized {
        let grown = current.size.saturating_add(size);
        if !current.items.is_empty() && grown > threshold {
            batches.push(std::mem::replace(&mut current, Batch { items: vec![], size: 0 }));
        }
        current.size = current.size.saturating_add(size);
        current.items.push(item.clone());
    }

    if !current.items.is_empty() {
        batches.push(current);
    }
    batches
}

/// Resolve item sizes from storage metadata, then `partition`.
pub async fn plan(storage: &dyn Storage, items: &[String], threshold: u64) -> Result<Vec<Batch>> {
    let mut sizes = Vec::with_capacity(items.len());
    for item in items {
        sizes.push(storage.read_metadata(item).await?.size);
    }
    Ok(fill(items.iter().zip(sizes), threshold))
}

//! Size-bounded batching of changed paths.

use crate::manifest::Manifest;

/// Default batch ceiling: 2 MiB of file content.
pub const DEFAULT_BATCH_CEILING: u64 = 2 * 1024 * 1024;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Batch {
    pub paths: Vec<String>,
    pub total_bytes: u64,
}

/// Group `paths` greedily, in order, so no batch exceeds `ceiling` bytes.
///
/// A file larger than the ceiling gets a batch to itself. Paths the manifest
/// does not know are dropped.
pub fn plan_batches(paths: &[String], manifest: &Manifest, ceiling: u64) -> Vec<Batch> {
    let mut batches = Vec::new();
    let mut current = Batch::default();

    for path in paths {
        let Some(record) = manifest.get(path) else {
            continue;
        };

        if !current.paths.is_empty() && current.total_bytes.saturating_add(record.size) > ceiling {
            batches.push(std::mem::take(&mut current));
        }

        current.paths.push(path.clone());
        current.total_bytes = current.total_bytes.saturating_add(record.size);
    }

    if !current.paths.is_empty() {
        batches.push(current);
    }

    batches
}

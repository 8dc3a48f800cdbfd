//! Nearest-ancestor lookup of replication targets.

use crate::config::{DatasetConfig, ReplicationTarget};
use std::collections::BTreeMap;

/// Replication coordinates inherited by a dataset.
#[derive(Debug, Clone)]
pub struct ResolvedTarget<'a> {
    /// Closest configured ancestor (possibly the dataset itself).
    pub ancestor: &'a DatasetConfig,
    pub target: &'a ReplicationTarget,
    /// Path between the ancestor and the queried dataset, empty on exact match.
    pub suffix: String,
    /// `target_dataset` joined with `suffix`.
    pub remote_dataset: String,
}

/// Walk `dataset` up towards its pool and return the first ancestor that
/// declares replication. `None` means the dataset is replication-exempt.
pub fn resolve<'a>(
    dataset: &str,
    datasets: &'a BTreeMap<String, DatasetConfig>,
) -> Option<ResolvedTarget<'a>> {
    let dataset = dataset.trim_end_matches('/');
    let mut candidate = dataset;

    loop {
        if let Some(config) = datasets.get(candidate) {
            if let Some(target) = &config.replication {
                let suffix = dataset[candidate.len()..].trim_start_matches('/').to_string();
                let remote_dataset = join_dataset(&target.target_dataset, &suffix);
                return Some(ResolvedTarget {
                    ancestor: config,
                    target,
                    suffix,
                    remote_dataset,
                });
            }
        }
        match candidate.rfind('/') {
            Some(idx) => candidate = &candidate[..idx],
            None => break,
        }
    }

    None
}

/// Join two dataset path fragments with exactly one separator.
pub fn join_dataset(base: &str, suffix: &str) -> String {
    let base = base.trim_end_matches('/');
    let suffix = suffix.trim_start_matches('/');
    if suffix.is_empty() {
        base.to_string()
    } else if base.is_empty() {
        suffix.to_string()
    } else {
        format!("{base}/{suffix}")
    }
}

/// True when one dataset contains the other (or they are the same).
pub fn datasets_overlap(a: &str, b: &str) -> bool {
    let a = a.trim_end_matches('/');
    let b = b.trim_end_matches('/');
    a == b || is_descendant(a, b) || is_descendant(b, a)
}

fn is_descendant(child: &str, parent: &str) -> bool {
    child.len() > parent.len()
        && child.starts_with(parent)
        && child.as_bytes()[parent.len()] == b'/'
}

/// Configured datasets whose replication target resolves, in path order.
pub fn replicated_datasets(datasets: &BTreeMap<String, DatasetConfig>) -> Vec<&str> {
    datasets
        .keys()
        .filter(|path| resolve(path, datasets).is_some())
        .map(String::as_str)
        .collect()
}

//! Turns `zfs` and `zpool` scripted (`-H -p`) output into core types.

use chrono::{DateTime, Utc};
use warden_core::provider::{Hold, PoolStatus, SnapshotInfo};

/// Columns requested by [`parse_snapshots`].
pub(crate) const SNAPSHOT_COLUMNS: &str = "name,guid,creation";

/// Split `-H` output into tab-separated columns, skipping blank lines.
fn columns(output: &str) -> impl Iterator<Item = Vec<&str>> {
    output
        .lines()
        .map(str::trim_end)
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            if line.contains('\t') {
                line.split('\t').map(str::trim).collect()
            } else {
                line.split_whitespace().collect()
            }
        })
}

fn epoch(raw: &str) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(raw.trim().parse::<i64>().ok()?, 0)
}

/// `zfs list -H -p -t snapshot -o name,guid,creation`, oldest first.
pub(crate) fn parse_snapshots(output: &str) -> Vec<SnapshotInfo> {
    let mut snapshots: Vec<SnapshotInfo> = columns(output)
        .filter_map(|cols| match cols.as_slice() {
            [name, guid, creation, ..] if name.contains('@') => Some(SnapshotInfo {
                name: name.to_string(),
                guid: guid.to_string(),
                created: epoch(creation)?,
            }),
            _ => None,
        })
        .collect();
    snapshots.sort_by(|a, b| a.created.cmp(&b.created));
    snapshots
}

/// `zfs holds -H -p <snapshots>`: snapshot, tag, creation time.
pub(crate) fn parse_holds(output: &str) -> Vec<Hold> {
    columns(output)
        .filter_map(|cols| match cols.as_slice() {
            [snapshot, tag, created, ..] => Some(Hold {
                tag: tag.to_string(),
                snapshot: snapshot.to_string(),
                created_at: epoch(created)?,
            }),
            _ => None,
        })
        .collect()
}

/// `zpool list -H -o name,health`.
pub(crate) fn parse_pools(output: &str) -> Vec<PoolStatus> {
    columns(output)
        .filter_map(|cols| match cols.as_slice() {
            [name, health, ..] if !name.is_empty() => Some(PoolStatus {
                name: name.to_string(),
                health: health.to_string(),
            }),
            _ => None,
        })
        .collect()
}

/// True when CLI diagnostics say the dataset is absent.
pub(crate) fn is_missing_dataset(diagnostic: &str) -> bool {
    let lower = diagnostic.to_ascii_lowercase();
    lower.contains("dataset does not exist") || lower.contains("no such pool")
}

//! Garbage collection of snapshot holds left behind by backup jobs.

use crate::config::WardenConfig;
use crate::error::WardenResult;
use crate::metrics::{self, MetricFamily, TextfileWriter};
use crate::provider::{BackupRegistry, Hold, ZfsProvider};
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::sync::Arc;

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HoldReport {
    pub released: Vec<Hold>,
    /// Stale holds left in place because a backup job is running.
    pub deferred: Vec<Hold>,
    /// Holds matching the tag prefix that remain after the run.
    pub active: usize,
    pub backup_running: bool,
}

pub struct HoldManager<Z: ZfsProvider, B: BackupRegistry> {
    config: Arc<WardenConfig>,
    zfs: Z,
    registry: B,
}

impl<Z: ZfsProvider, B: BackupRegistry> HoldManager<Z, B> {
    pub fn new(config: Arc<WardenConfig>, zfs: Z, registry: B) -> Self {
        Self {
            config,
            zfs,
            registry,
        }
    }

    /// Release convention-tagged holds older than the threshold, but only
    /// while no backup job is running. Holds younger than the threshold are
    /// never touched.
    pub fn release_stale_holds(&self, now: DateTime<Utc>) -> WardenResult<HoldReport> {
        let holds = self.tagged_holds()?;
        let max_age = self.config.hold_max_age();
        let (stale, fresh): (Vec<Hold>, Vec<Hold>) =
            holds.into_iter().partition(|hold| hold.age(now) >= max_age);

        let mut report = HoldReport {
            active: fresh.len(),
            ..HoldReport::default()
        };

        if !stale.is_empty() {
            report.backup_running = match self.registry.running_jobs() {
                Ok(jobs) if jobs.is_empty() => false,
                Ok(jobs) => {
                    let names: Vec<_> = jobs.iter().map(|j| j.name.as_str()).collect();
                    info!(
                        "deferring {} stale holds, backup running: {}",
                        stale.len(),
                        names.join(", ")
                    );
                    true
                }
                Err(err) => {
                    warn!("backup registry query failed, deferring hold release: {err}");
                    true
                }
            };
        }

        for hold in stale {
            if report.backup_running {
                report.deferred.push(hold);
                continue;
            }
            match self.zfs.release_hold(&hold) {
                Ok(()) => {
                    info!("released stale hold {} on {}", hold.tag, hold.snapshot);
                    report.released.push(hold);
                }
                Err(err) => {
                    warn!("release of {} on {} failed: {err}", hold.tag, hold.snapshot);
                    report.deferred.push(hold);
                }
            }
        }
        report.active += report.deferred.len();

        self.write_metrics(&report)?;
        Ok(report)
    }

    fn tagged_holds(&self) -> WardenResult<Vec<Hold>> {
        let prefix = &self.config.holds.tag_prefix;
        let mut snapshots = Vec::new();
        for root in self.roots() {
            snapshots.extend(
                self.zfs
                    .list_snapshots_recursive(root)?
                    .into_iter()
                    .map(|snap| snap.name),
            );
        }
        if snapshots.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self
            .zfs
            .holds(&snapshots)?
            .into_iter()
            .filter(|hold| hold.tag.starts_with(prefix.as_str()))
            .collect())
    }

    /// Configured datasets with no configured ancestor.
    fn roots(&self) -> Vec<&str> {
        let paths: Vec<&str> = self.config.datasets.keys().map(String::as_str).collect();
        paths
            .iter()
            .copied()
            .filter(|path| {
                !paths.iter().any(|other| {
                    other != path
                        && path.len() > other.len()
                        && path.starts_with(other)
                        && path.as_bytes()[other.len()] == b'/'
                })
            })
            .collect()
    }

    fn write_metrics(&self, report: &HoldReport) -> WardenResult<()> {
        let writer = TextfileWriter::new(&self.config.metrics.textfile_dir);
        writer.write(
            "zfs-holds-released",
            &MetricFamily::gauge(
                metrics::HOLDS_RELEASED,
                "Stale snapshot holds released by the last GC run",
            )
            .sample(&[], report.released.len() as f64),
        )?;
        writer.write(
            "zfs-holds-active",
            &MetricFamily::gauge(
                metrics::HOLDS_ACTIVE,
                "Backup holds remaining after the last GC run",
            )
            .sample(&[], report.active as f64),
        )?;
        Ok(())
    }
}

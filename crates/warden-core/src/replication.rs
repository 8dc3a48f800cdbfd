//! One replication job per dataset: lock, conflict check, trust check,
//! incremental send, status metrics.

use crate::config::{ReplicationTarget, WardenConfig};
use crate::error::{WardenError, WardenResult};
use crate::lock;
use crate::metrics::{self, file_slug, MetricFamily, TextfileWriter};
use crate::notify::{Event, EventKind, Notifier};
use crate::provider::{
    BackupRegistry, ReplicationTransport, SnapshotInfo, TransferPlan, ZfsProvider,
};
use crate::resolver::{datasets_overlap, replicated_datasets, resolve};
use crate::trust::KnownHosts;
use chrono::{DateTime, Utc};
use log::{debug, error, info, warn};
use std::collections::BTreeSet;
use std::sync::Arc;

/// Expand an option string into command-line flags. Tokens starting with
/// `-` pass through; bare tokens are split into one flag per letter.
pub fn parse_flags(options: &str) -> Vec<String> {
    let mut flags = Vec::new();
    for token in options.split_whitespace() {
        if token.starts_with('-') {
            flags.push(token.to_string());
        } else {
            flags.extend(token.chars().map(|ch| format!("-{ch}")));
        }
    }
    flags
}

/// Newest local snapshot whose GUID also exists remotely.
pub fn latest_common<'a>(
    local: &'a [SnapshotInfo],
    remote: &[SnapshotInfo],
) -> Option<&'a SnapshotInfo> {
    let remote_guids: BTreeSet<&str> = remote.iter().map(|s| s.guid.as_str()).collect();
    local
        .iter()
        .rev()
        .find(|snap| remote_guids.contains(snap.guid.as_str()))
}

/// Work out the transfer that brings `destination` up to the newest local
/// snapshot. `None` means the target already has it.
pub fn plan_transfer(
    local: &[SnapshotInfo],
    remote: &[SnapshotInfo],
    destination: &str,
    target: &ReplicationTarget,
) -> WardenResult<Option<TransferPlan>> {
    let newest = local.last().ok_or_else(|| {
        WardenError::NoSnapshot(local_dataset_hint(local, destination))
    })?;
    if remote.iter().any(|snap| snap.guid == newest.guid) {
        return Ok(None);
    }
    let base = latest_common(local, remote);
    if base.is_none() && !remote.is_empty() {
        warn!(
            "{destination} has {} snapshots but none in common with {}; sending full stream",
            remote.len(),
            newest.dataset()
        );
    }
    Ok(Some(TransferPlan {
        source_snapshot: newest.name.clone(),
        incremental_from: base.map(|snap| snap.name.clone()),
        destination: destination.to_string(),
        send_flags: parse_flags(&target.send_options),
        recv_flags: parse_flags(&target.recv_options),
    }))
}

fn local_dataset_hint(local: &[SnapshotInfo], destination: &str) -> String {
    local
        .first()
        .map(|snap| snap.dataset().to_string())
        .unwrap_or_else(|| destination.to_string())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Pending,
    Running,
    Succeeded,
    Failed,
}

/// A single execution for one dataset.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationJob {
    pub dataset: String,
    pub remote_dataset: String,
    pub target_host: String,
    state: JobState,
}

impl ReplicationJob {
    pub fn new(dataset: &str, remote_dataset: &str, target_host: &str) -> Self {
        Self {
            dataset: dataset.to_string(),
            remote_dataset: remote_dataset.to_string(),
            target_host: target_host.to_string(),
            state: JobState::Pending,
        }
    }

    pub fn state(&self) -> JobState {
        self.state
    }

    fn start(&mut self) {
        if self.state == JobState::Pending {
            self.state = JobState::Running;
        }
    }

    fn finish(&mut self, succeeded: bool) {
        if matches!(self.state, JobState::Pending | JobState::Running) {
            self.state = if succeeded {
                JobState::Succeeded
            } else {
                JobState::Failed
            };
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReplicationOutcome {
    /// No ancestor declares a target; nothing to do.
    Unconfigured,
    UpToDate { job: ReplicationJob, snapshot: String },
    Transferred { job: ReplicationJob, plan: TransferPlan },
}

/// Label set and file stems shared by one job's metric families.
struct JobMetrics<'a> {
    writer: TextfileWriter,
    stem: String,
    dataset: &'a str,
    unit: String,
    target: &'a ReplicationTarget,
}

impl<'a> JobMetrics<'a> {
    fn new(config: &WardenConfig, dataset: &'a str, target: &'a ReplicationTarget) -> Self {
        let slug = file_slug(dataset);
        let prefix = &config.replication.unit_prefix;
        Self {
            writer: TextfileWriter::new(&config.metrics.textfile_dir),
            stem: format!("{prefix}-{slug}"),
            dataset,
            unit: format!("{prefix}-{slug}.service"),
            target,
        }
    }

    fn info(&self) -> WardenResult<()> {
        let family = MetricFamily::gauge(metrics::REPLICATION_INFO, "Static replication job info")
            .sample(
                &[
                    ("dataset", self.dataset),
                    ("unit", self.unit.as_str()),
                    ("target_host", self.target.target_host.as_str()),
                    (
                        "target_name",
                        self.target.target_name.as_deref().unwrap_or(""),
                    ),
                    (
                        "target_location",
                        self.target.target_location.as_deref().unwrap_or(""),
                    ),
                ],
                1.0,
            );
        self.writer.write(&format!("{}-info", self.stem), &family)?;
        Ok(())
    }

    fn status(&self, value: f64) -> WardenResult<()> {
        let family = MetricFamily::gauge(
            metrics::REPLICATION_STATUS,
            "Replication status (0=fail, 1=success, 2=running)",
        )
        .sample(
            &[
                ("dataset", self.dataset),
                ("target_host", self.target.target_host.as_str()),
                ("unit", self.unit.as_str()),
            ],
            value,
        );
        self.writer.write(&format!("{}-status", self.stem), &family)?;
        Ok(())
    }

    fn last_success(&self, at: DateTime<Utc>) -> WardenResult<()> {
        let family = MetricFamily::gauge(
            metrics::REPLICATION_LAST_SUCCESS,
            "Unix time of the last successful replication",
        )
        .sample(
            &[
                ("dataset", self.dataset),
                ("target_host", self.target.target_host.as_str()),
                ("unit", self.unit.as_str()),
            ],
            at.timestamp() as f64,
        );
        self.writer
            .write(&format!("{}-last-success", self.stem), &family)?;
        Ok(())
    }

    /// A metric write never decides the job outcome.
    fn soft(&self, written: WardenResult<()>, what: &str) {
        if let Err(err) = written {
            warn!("{}: failed to write {what} metric: {err}", self.dataset);
        }
    }
}

pub struct ReplicationEngine<Z, T, B>
where
    Z: ZfsProvider,
    T: ReplicationTransport,
    B: BackupRegistry,
{
    config: Arc<WardenConfig>,
    zfs: Z,
    transport: T,
    registry: B,
    notifier: Arc<dyn Notifier>,
}

impl<Z, T, B> ReplicationEngine<Z, T, B>
where
    Z: ZfsProvider,
    T: ReplicationTransport,
    B: BackupRegistry,
{
    pub fn new(
        config: Arc<WardenConfig>,
        zfs: Z,
        transport: T,
        registry: B,
        notifier: Arc<dyn Notifier>,
    ) -> Self {
        Self {
            config,
            zfs,
            transport,
            registry,
            notifier,
        }
    }

    /// Replicate every configured dataset that resolves a target, one
    /// after another.
    pub fn replicate_all(
        &self,
        now: DateTime<Utc>,
    ) -> Vec<(String, WardenResult<ReplicationOutcome>)> {
        replicated_datasets(&self.config.datasets)
            .into_iter()
            .map(|dataset| (dataset.to_string(), self.replicate(dataset, now)))
            .collect()
    }

    /// Run one job. `Busy` and `BackupConflict` return before any metric
    /// is written.
    pub fn replicate(&self, dataset: &str, now: DateTime<Utc>) -> WardenResult<ReplicationOutcome> {
        let Some(resolved) = resolve(dataset, &self.config.datasets) else {
            debug!("{dataset}: no replication target configured");
            return Ok(ReplicationOutcome::Unconfigured);
        };

        let _guard = match lock::try_acquire(&self.config.replication.lock_path) {
            Ok(guard) => guard,
            Err(err) => {
                info!("{dataset}: skipping, {err}");
                return Err(err);
            }
        };

        self.check_backup_conflict(dataset)?;

        let target = resolved.target;
        let gauges = JobMetrics::new(&self.config, dataset, target);
        gauges.soft(gauges.info(), "info");

        let mut job = ReplicationJob::new(dataset, &resolved.remote_dataset, &target.target_host);
        let result = self.run_job(&mut job, target, &gauges);
        job.finish(result.is_ok());

        match result {
            Ok(plan) => {
                gauges.soft(gauges.status(metrics::STATUS_SUCCEEDED), "status");
                gauges.soft(gauges.last_success(now), "last-success");
                match plan {
                    Some(plan) => {
                        info!(
                            "{dataset}: replicated {} to {}:{}",
                            plan.source_snapshot, job.target_host, job.remote_dataset
                        );
                        Ok(ReplicationOutcome::Transferred { job, plan })
                    }
                    None => {
                        let snapshot = self
                            .zfs
                            .list_snapshots(dataset)?
                            .last()
                            .map(|snap| snap.name.clone())
                            .unwrap_or_default();
                        info!("{dataset}: {} is up to date", job.remote_dataset);
                        Ok(ReplicationOutcome::UpToDate { job, snapshot })
                    }
                }
            }
            Err(err) => {
                error!("{dataset}: replication to {} failed: {err}", job.target_host);
                gauges.soft(gauges.status(metrics::STATUS_FAILED), "status");
                self.notifier.notify(&Event::new(
                    EventKind::ReplicationFailed,
                    dataset,
                    err.to_string(),
                ));
                Err(err)
            }
        }
    }

    fn run_job(
        &self,
        job: &mut ReplicationJob,
        target: &ReplicationTarget,
        gauges: &JobMetrics<'_>,
    ) -> WardenResult<Option<TransferPlan>> {
        let pin = KnownHosts::load(&self.config.ssh.known_hosts_path)?.ensure_pinned(target)?;
        debug!("{}: {} pinned as {pin}", job.dataset, target.target_host);

        job.start();
        gauges.soft(gauges.status(metrics::STATUS_RUNNING), "status");

        let local = self.zfs.list_snapshots(&job.dataset)?;
        let remote = self
            .transport
            .remote_snapshots(target, &job.remote_dataset)?;
        let Some(plan) = plan_transfer(&local, &remote, &job.remote_dataset, target)? else {
            return Ok(None);
        };
        debug!(
            "{}: sending {} (base {:?})",
            job.dataset, plan.source_snapshot, plan.incremental_from
        );
        self.transport.send(target, &plan)?;
        Ok(Some(plan))
    }

    /// A running backup job that scans the dataset, an ancestor, or a
    /// descendant blocks the send. An unanswerable query blocks it too.
    fn check_backup_conflict(&self, dataset: &str) -> WardenResult<()> {
        let running = match self.registry.running_jobs() {
            Ok(running) => running,
            Err(err) => {
                warn!("{dataset}: backup registry query failed, skipping: {err}");
                return Err(WardenError::BackupConflict {
                    dataset: dataset.to_string(),
                    jobs: vec!["<registry unavailable>".to_string()],
                });
            }
        };
        let jobs: Vec<String> = running
            .iter()
            .filter(|job| job.datasets.iter().any(|ds| datasets_overlap(ds, dataset)))
            .map(|job| job.name.clone())
            .collect();
        if jobs.is_empty() {
            Ok(())
        } else {
            info!("{dataset}: skipping, backup running: {}", jobs.join(", "));
            Err(WardenError::BackupConflict {
                dataset: dataset.to_string(),
                jobs,
            })
        }
    }
}

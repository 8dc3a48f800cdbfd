//! Periodic pool health, target reachability and replication lag probes.
//!
//! Each probe writes its own textfile and never fails the others.

use crate::config::{ReplicationTarget, WardenConfig};
use crate::error::WardenResult;
use crate::metrics::{self, MetricFamily, TextfileWriter};
use crate::notify::{Event, EventKind, Notifier};
use crate::provider::{PoolStatus, ReplicationTransport, ZfsProvider};
use crate::resolver::replicated_datasets;
use chrono::{DateTime, Utc};
use log::{info, warn};
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};

/// Result of one reachability check.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TargetProbe {
    pub host: String,
    pub reachable: bool,
    pub error: Option<String>,
}

/// Age of the newest snapshot a dataset's target has received.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LagSample {
    pub dataset: String,
    pub seconds: i64,
}

/// Everything one health run observed. A probe that failed as a whole
/// leaves its section empty and adds a line to `errors`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HealthReport {
    pub pools: Vec<PoolStatus>,
    pub targets: Vec<TargetProbe>,
    pub lag: Vec<LagSample>,
    pub errors: Vec<String>,
}

impl HealthReport {
    /// True when every listed pool reports a healthy state.
    pub fn pools_healthy(&self) -> bool {
        self.pools.iter().all(PoolStatus::is_healthy)
    }
}

/// Pool health, target reachability and replication lag checks.
pub struct HealthProbe<Z: ZfsProvider, T: ReplicationTransport> {
    config: Arc<WardenConfig>,
    zfs: Z,
    transport: T,
    notifier: Arc<dyn Notifier>,
    /// Last observed health per pool, to alert once per transition.
    pool_state: Mutex<BTreeMap<String, bool>>,
}

impl<Z: ZfsProvider, T: ReplicationTransport> HealthProbe<Z, T> {
    pub fn new(config: Arc<WardenConfig>, zfs: Z, transport: T, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            zfs,
            transport,
            notifier,
            pool_state: Mutex::new(BTreeMap::new()),
        }
    }

    fn writer(&self) -> TextfileWriter {
        TextfileWriter::new(&self.config.metrics.textfile_dir)
    }

    /// Run all three probes.
    pub fn run(&self, now: DateTime<Utc>) -> HealthReport {
        let mut report = HealthReport::default();
        match self.check_pools() {
            Ok(pools) => report.pools = pools,
            Err(err) => {
                warn!("pool health probe failed: {err}");
                report.errors.push(format!("pools: {err}"));
            }
        }
        match self.probe_targets() {
            Ok(targets) => report.targets = targets,
            Err(err) => report.errors.push(format!("targets: {err}")),
        }
        match self.replication_lag(now) {
            Ok(lag) => report.lag = lag,
            Err(err) => {
                warn!("replication lag probe failed: {err}");
                report.errors.push(format!("lag: {err}"));
            }
        }
        report
    }

    /// Report every pool's health and alert on state changes. A pool seen
    /// for the first time alerts only when it is unhealthy.
    pub fn check_pools(&self) -> WardenResult<Vec<PoolStatus>> {
        let pools = self.zfs.pools()?;

        let mut family = MetricFamily::gauge(
            metrics::POOL_HEALTHY,
            "1 when the pool reports ONLINE",
        );
        {
            let mut state = self.pool_state.lock().unwrap_or_else(|p| p.into_inner());
            for pool in &pools {
                let healthy = pool.is_healthy();
                family.push(
                    &[("pool", pool.name.as_str()), ("health", pool.health.as_str())],
                    if healthy { 1.0 } else { 0.0 },
                );
                let previous = state.insert(pool.name.clone(), healthy);
                let kind = match (previous, healthy) {
                    (None, false) | (Some(true), false) => Some(EventKind::PoolDegraded),
                    (Some(false), true) => Some(EventKind::PoolRecovered),
                    _ => None,
                };
                if let Some(kind) = kind {
                    self.notifier.notify(&Event::new(
                        kind,
                        pool.name.clone(),
                        format!("pool health is {}", pool.health),
                    ));
                }
            }
        }
        self.writer().write("zfs-pool-health", &family)?;
        Ok(pools)
    }

    /// One authenticated round trip per distinct target host.
    pub fn probe_targets(&self) -> WardenResult<Vec<TargetProbe>> {
        let mut targets: BTreeMap<&str, &ReplicationTarget> = BTreeMap::new();
        for dataset in self.config.datasets.values() {
            if let Some(target) = &dataset.replication {
                targets.entry(target.target_host.as_str()).or_insert(target);
            }
        }

        let mut family = MetricFamily::gauge(
            metrics::TARGET_REACHABLE,
            "1 when the replication target answered the last probe",
        );
        let mut probes = Vec::new();
        for (host, target) in targets {
            let probe = match self.transport.probe(target) {
                Ok(()) => TargetProbe {
                    host: host.to_string(),
                    reachable: true,
                    error: None,
                },
                Err(err) => {
                    info!("target {host} unreachable: {err}");
                    TargetProbe {
                        host: host.to_string(),
                        reachable: false,
                        error: Some(err.to_string()),
                    }
                }
            };
            family.push(
                &[("target_host", host)],
                if probe.reachable { 1.0 } else { 0.0 },
            );
            probes.push(probe);
        }
        self.writer().write("syncoid-target-reachable", &family)?;
        Ok(probes)
    }

    /// Seconds since each replicated dataset's newest local snapshot.
    ///
    /// This is measured on the source only. It does not observe the
    /// target, so a target that silently stops receiving while local
    /// snapshots keep being taken still reports a small lag. The
    /// `syncoid_replication_status` and last-success families carry the
    /// receive-side signal.
    pub fn replication_lag(&self, now: DateTime<Utc>) -> WardenResult<Vec<LagSample>> {
        let mut family = MetricFamily::gauge(
            metrics::REPLICATION_LAG,
            "Seconds since the newest local snapshot of a replicated dataset",
        );
        let mut samples = Vec::new();
        for dataset in replicated_datasets(&self.config.datasets) {
            let newest = match self.zfs.list_snapshots(dataset) {
                Ok(snapshots) => snapshots.last().map(|snap| snap.created),
                Err(err) => {
                    warn!("{dataset}: cannot list snapshots for lag: {err}");
                    continue;
                }
            };
            let Some(created) = newest else {
                continue;
            };
            let seconds = now.signed_duration_since(created).num_seconds().max(0);
            family.push(&[("dataset", dataset)], seconds as f64);
            samples.push(LagSample {
                dataset: dataset.to_string(),
                seconds,
            });
        }
        self.writer().write("zfs-replication-lag", &family)?;
        Ok(samples)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::read_textfile_dir;
    use crate::testing::{
        add_dataset, at, config_in, dataset_config, target, MockTransport, MockZfs,
        RecordingNotifier,
    };
    use tempfile::tempdir;

    fn pool(name: &str, health: &str) -> PoolStatus {
        PoolStatus {
            name: name.into(),
            health: health.into(),
        }
    }

    fn probe(
        cfg: WardenConfig,
        zfs: &MockZfs,
        transport: &MockTransport,
        notifier: &RecordingNotifier,
    ) -> HealthProbe<MockZfs, MockTransport> {
        HealthProbe::new(
            Arc::new(cfg),
            zfs.clone(),
            transport.clone(),
            Arc::new(notifier.clone()),
        )
    }

    #[test]
    fn pool_alerts_fire_once_per_transition() {
        let dir = tempdir().unwrap();
        let zfs = MockZfs::default();
        zfs.state.lock().unwrap().pools = vec![pool("tank", "ONLINE"), pool("rpool", "ONLINE")];
        let notifier = RecordingNotifier::default();
        let probe = probe(config_in(dir.path()), &zfs, &MockTransport::default(), &notifier);

        probe.check_pools().unwrap();
        assert!(notifier.events().is_empty());

        zfs.state.lock().unwrap().pools = vec![pool("tank", "DEGRADED"), pool("rpool", "ONLINE")];
        probe.check_pools().unwrap();
        probe.check_pools().unwrap();
        let events = notifier.events();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].kind, EventKind::PoolDegraded);
        assert_eq!(events[0].subject, "tank");

        zfs.state.lock().unwrap().pools = vec![pool("tank", "ONLINE"), pool("rpool", "ONLINE")];
        probe.check_pools().unwrap();
        assert_eq!(notifier.events()[1].kind, EventKind::PoolRecovered);

        let samples = read_textfile_dir(&dir.path().join("textfile")).unwrap();
        let tank = samples
            .iter()
            .find(|s| s.name == metrics::POOL_HEALTHY && s.labels["pool"] == "tank")
            .unwrap();
        assert_eq!(tank.value, 1.0);
    }

    #[test]
    fn unhealthy_pool_on_first_sight_alerts() {
        let dir = tempdir().unwrap();
        let zfs = MockZfs::default();
        zfs.state.lock().unwrap().pools = vec![pool("tank", "FAULTED")];
        let notifier = RecordingNotifier::default();
        let probe = probe(config_in(dir.path()), &zfs, &MockTransport::default(), &notifier);

        let pools = probe.check_pools().unwrap();
        assert!(!HealthReport {
            pools,
            ..HealthReport::default()
        }
        .pools_healthy());
        assert_eq!(notifier.events()[0].kind, EventKind::PoolDegraded);
    }

    #[test]
    fn each_target_host_is_probed_once() {
        let dir = tempdir().unwrap();
        let mut cfg = config_in(dir.path());
        for (path, host) in [("tank/a", "nas1"), ("tank/b", "nas1"), ("tank/c", "offsite")] {
            let mut ds = dataset_config(path);
            ds.replication = Some(target(host, "backup"));
            add_dataset(&mut cfg, ds);
        }
        let transport = MockTransport::default();
        transport
            .state
            .lock()
            .unwrap()
            .unreachable
            .insert("offsite".into());
        let probe = probe(cfg, &MockZfs::default(), &transport, &RecordingNotifier::default());

        let probes = probe.probe_targets().unwrap();
        assert_eq!(probes.len(), 2);
        let offsite = probes.iter().find(|p| p.host == "offsite").unwrap();
        assert!(!offsite.reachable);

        let samples: Vec<_> = read_textfile_dir(&dir.path().join("textfile"))
            .unwrap()
            .into_iter()
            .filter(|s| s.name == metrics::TARGET_REACHABLE)
            .collect();
        assert_eq!(samples.len(), 2);
    }

    #[test]
    fn lag_is_time_since_newest_local_snapshot() {
        let dir = tempdir().unwrap();
        let mut cfg = config_in(dir.path());
        let mut a = dataset_config("tank/a");
        a.replication = Some(target("nas1", "backup/a"));
        add_dataset(&mut cfg, a);
        add_dataset(&mut cfg, dataset_config("rpool/local-only"));

        let zfs = MockZfs::default();
        zfs.add_snapshot("tank/a@s1", at(2026, 10, 14, 10, 0));
        zfs.add_snapshot("tank/a@s2", at(2026, 10, 14, 11, 0));
        zfs.add_snapshot("rpool/local-only@s1", at(2026, 10, 1, 0, 0));
        let probe = probe(cfg, &zfs, &MockTransport::default(), &RecordingNotifier::default());

        let lag = probe.replication_lag(at(2026, 10, 14, 11, 30)).unwrap();
        assert_eq!(
            lag,
            vec![LagSample {
                dataset: "tank/a".into(),
                seconds: 1800,
            }]
        );
    }

    #[test]
    fn failing_pool_probe_does_not_block_others() {
        let dir = tempdir().unwrap();
        let zfs = MockZfs::default();
        zfs.fail("pools", "");
        let probe = probe(
            config_in(dir.path()),
            &zfs,
            &MockTransport::default(),
            &RecordingNotifier::default(),
        );
        let report = probe.run(at(2026, 10, 14, 0, 0));
        assert_eq!(report.errors.len(), 1);
        assert!(report.errors[0].starts_with("pools:"));
    }
}

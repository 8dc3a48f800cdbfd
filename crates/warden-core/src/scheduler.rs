//! Periodic snapshot creation and retention pruning.

use crate::config::{DatasetConfig, RetentionCounts, WardenConfig};
use crate::error::{WardenError, WardenResult};
use crate::notify::{Event, EventKind, Notifier};
use crate::provider::{HookPhase, HookRunner, SnapshotInfo, ZfsProvider};
use chrono::{DateTime, NaiveDateTime, Utc};
use log::{info, warn};
use regex::Regex;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::{Arc, OnceLock};

const AUTOSNAP_TIME_FORMAT: &str = "%Y-%m-%d_%H:%M:%S";

/// Calendar period a snapshot covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Granularity {
    Hourly,
    Daily,
    Weekly,
    Monthly,
    Yearly,
}

impl Granularity {
    /// Finest first.
    pub const ALL: [Granularity; 5] = [
        Granularity::Hourly,
        Granularity::Daily,
        Granularity::Weekly,
        Granularity::Monthly,
        Granularity::Yearly,
    ];

    /// Label used in snapshot names.
    pub fn as_str(&self) -> &'static str {
        match self {
            Granularity::Hourly => "hourly",
            Granularity::Daily => "daily",
            Granularity::Weekly => "weekly",
            Granularity::Monthly => "monthly",
            Granularity::Yearly => "yearly",
        }
    }

    /// Inverse of [`Granularity::as_str`].
    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|g| g.as_str() == raw)
    }

    /// How many snapshots of this granularity the policy keeps.
    pub fn keep(&self, counts: &RetentionCounts) -> u32 {
        match self {
            Granularity::Hourly => counts.hourly,
            Granularity::Daily => counts.daily,
            Granularity::Weekly => counts.weekly,
            Granularity::Monthly => counts.monthly,
            Granularity::Yearly => counts.yearly,
        }
    }

    /// Calendar bucket `at` falls into; one snapshot is taken per bucket.
    pub fn bucket(&self, at: DateTime<Utc>) -> String {
        let format = match self {
            Granularity::Hourly => "%Y-%m-%d %H",
            Granularity::Daily => "%Y-%m-%d",
            Granularity::Weekly => "%G-W%V",
            Granularity::Monthly => "%Y-%m",
            Granularity::Yearly => "%Y",
        };
        at.format(format).to_string()
    }
}

/// A snapshot created by the scheduler, recovered from its name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Autosnap {
    pub taken: DateTime<Utc>,
    pub granularity: Granularity,
}

/// Short snapshot name for `granularity` taken at `at`, e.g.
/// `autosnap_2026-10-14_02:00:00_hourly`.
pub fn autosnap_name(at: DateTime<Utc>, granularity: Granularity) -> String {
    format!(
        "autosnap_{}_{}",
        at.format(AUTOSNAP_TIME_FORMAT),
        granularity.as_str()
    )
}

fn autosnap_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"^autosnap_(\d{4}-\d{2}-\d{2}_\d{2}:\d{2}:\d{2})_([a-z]+)$").ok()
        })
        .as_ref()
}

/// Parse the short (post-`@`) name of a scheduler snapshot.
pub fn parse_autosnap(short_name: &str) -> Option<Autosnap> {
    let captures = autosnap_pattern()?.captures(short_name)?;
    let taken = NaiveDateTime::parse_from_str(&captures[1], AUTOSNAP_TIME_FORMAT).ok()?;
    let granularity = Granularity::parse(&captures[2])?;
    Some(Autosnap {
        taken: taken.and_utc(),
        granularity,
    })
}

/// Granularities with a non-zero count whose current bucket has no snapshot yet.
pub fn due_granularities(
    existing: &[SnapshotInfo],
    counts: &RetentionCounts,
    now: DateTime<Utc>,
) -> Vec<Granularity> {
    let mut newest: BTreeMap<Granularity, DateTime<Utc>> = BTreeMap::new();
    for snap in existing {
        if let Some(auto) = parse_autosnap(snap.short_name()) {
            let entry = newest.entry(auto.granularity).or_insert(auto.taken);
            if auto.taken > *entry {
                *entry = auto.taken;
            }
        }
    }

    Granularity::ALL
        .into_iter()
        .filter(|g| g.keep(counts) > 0)
        .filter(|g| match newest.get(g) {
            Some(taken) => g.bucket(*taken) != g.bucket(now),
            None => true,
        })
        .collect()
}

/// Autosnap snapshots beyond the per-granularity keep count, oldest last.
pub fn prune_candidates(existing: &[SnapshotInfo], counts: &RetentionCounts) -> Vec<String> {
    let mut by_granularity: BTreeMap<Granularity, Vec<(DateTime<Utc>, &str)>> = BTreeMap::new();
    for snap in existing {
        if let Some(auto) = parse_autosnap(snap.short_name()) {
            by_granularity
                .entry(auto.granularity)
                .or_default()
                .push((auto.taken, snap.name.as_str()));
        }
    }

    let mut candidates = Vec::new();
    for (granularity, mut snaps) in by_granularity {
        snaps.sort_by(|a, b| b.0.cmp(&a.0));
        let keep = granularity.keep(counts) as usize;
        candidates.extend(snaps.into_iter().skip(keep).map(|(_, name)| name.to_string()));
    }
    candidates
}

/// What happened to one dataset during a tick.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DatasetOutcome {
    pub dataset: String,
    pub created: Vec<String>,
    pub pruned: Vec<String>,
    /// Prune candidates kept because a hold protects them.
    pub retained_held: Vec<String>,
    pub error: Option<String>,
}

/// Outcomes of one scheduler tick, in dataset order.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SnapshotRunReport {
    pub outcomes: Vec<DatasetOutcome>,
}

impl SnapshotRunReport {
    /// Datasets whose run recorded an error.
    pub fn failures(&self) -> usize {
        self.outcomes.iter().filter(|o| o.error.is_some()).count()
    }
}

/// Takes due snapshots and prunes expired ones.
pub struct SnapshotScheduler<Z: ZfsProvider, H: HookRunner> {
    config: Arc<WardenConfig>,
    zfs: Z,
    hooks: H,
    notifier: Arc<dyn Notifier>,
}

impl<Z: ZfsProvider, H: HookRunner> SnapshotScheduler<Z, H> {
    pub fn new(config: Arc<WardenConfig>, zfs: Z, hooks: H, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            zfs,
            hooks,
            notifier,
        }
    }

    /// Snapshot and prune every configured dataset. A failure on one
    /// dataset never stops the others.
    pub fn tick(&self, now: DateTime<Utc>) -> SnapshotRunReport {
        let mut report = SnapshotRunReport::default();
        for dataset in self.config.datasets.values() {
            if !dataset.autosnap && !dataset.autoprune {
                continue;
            }
            report.outcomes.push(self.run_dataset(dataset, now));
        }
        report
    }

    /// Hooks, due snapshots and pruning for a single dataset.
    pub fn run_dataset(&self, dataset: &DatasetConfig, now: DateTime<Utc>) -> DatasetOutcome {
        let mut outcome = DatasetOutcome {
            dataset: dataset.path.clone(),
            ..DatasetOutcome::default()
        };

        if dataset.autosnap {
            let result = self
                .zfs
                .list_snapshots(&dataset.path)
                .and_then(|existing| {
                    let due = due_granularities(&existing, &dataset.effective_retention, now);
                    self.take_snapshots(dataset, &due, now, &mut outcome)
                });
            if let Err(err) = result {
                self.report_failure(dataset, &err, &mut outcome);
                return outcome;
            }
        }

        if dataset.autoprune {
            if let Err(err) = self.prune(dataset, &mut outcome) {
                warn!("[{}] prune failed: {err}", dataset.path);
                outcome.error.get_or_insert_with(|| err.to_string());
            }
        }

        outcome
    }

    fn take_snapshots(
        &self,
        dataset: &DatasetConfig,
        due: &[Granularity],
        now: DateTime<Utc>,
        outcome: &mut DatasetOutcome,
    ) -> WardenResult<()> {
        if due.is_empty() {
            return Ok(());
        }

        // Refuse to pause anything whose resume hook cannot run.
        if let Some(hook) = &dataset.pre_hook {
            ensure_executable(hook, HookPhase::Pre)?;
        }
        if let Some(hook) = &dataset.post_hook {
            ensure_executable(hook, HookPhase::Post)?;
        }

        if let Some(hook) = &dataset.pre_hook {
            self.hooks.run_hook(hook, HookPhase::Pre, &dataset.path)?;
        }

        let mut created = Ok(());
        for granularity in due {
            let name = autosnap_name(now, *granularity);
            match self
                .zfs
                .create_snapshot(&dataset.path, &name, dataset.recursive)
            {
                Ok(()) => {
                    info!("[{}] created snapshot {name}", dataset.path);
                    outcome.created.push(format!("{}@{name}", dataset.path));
                }
                Err(err) => {
                    created = Err(err);
                    break;
                }
            }
        }

        let post = match &dataset.post_hook {
            Some(hook) => self.hooks.run_hook(hook, HookPhase::Post, &dataset.path),
            None => Ok(()),
        };

        created.and(post)
    }

    fn prune(&self, dataset: &DatasetConfig, outcome: &mut DatasetOutcome) -> WardenResult<()> {
        let existing = self.zfs.list_snapshots(&dataset.path)?;
        let candidates = prune_candidates(&existing, &dataset.effective_retention);
        if candidates.is_empty() {
            return Ok(());
        }

        let held = self.held_short_names(dataset, &candidates)?;
        for snapshot in candidates {
            let short = snapshot.split_once('@').map(|(_, s)| s).unwrap_or("");
            if held.contains(short) {
                info!("[{}] keeping held snapshot {snapshot}", dataset.path);
                outcome.retained_held.push(snapshot);
                continue;
            }
            self.zfs.destroy_snapshot(&snapshot, dataset.recursive)?;
            info!("[{}] pruned snapshot {snapshot}", dataset.path);
            outcome.pruned.push(snapshot);
        }
        Ok(())
    }

    /// Short names of candidates with a hold anywhere in the destroy scope.
    fn held_short_names(
        &self,
        dataset: &DatasetConfig,
        candidates: &[String],
    ) -> WardenResult<BTreeSet<String>> {
        let scope: Vec<String> = if dataset.recursive {
            let wanted: BTreeSet<&str> = candidates
                .iter()
                .filter_map(|c| c.split_once('@').map(|(_, s)| s))
                .collect();
            self.zfs
                .list_snapshots_recursive(&dataset.path)?
                .into_iter()
                .filter(|snap| wanted.contains(snap.short_name()))
                .map(|snap| snap.name)
                .collect()
        } else {
            candidates.to_vec()
        };

        Ok(self
            .zfs
            .holds(&scope)?
            .into_iter()
            .filter_map(|hold| {
                hold.snapshot
                    .split_once('@')
                    .map(|(_, short)| short.to_string())
            })
            .collect())
    }

    fn report_failure(&self, dataset: &DatasetConfig, err: &WardenError, outcome: &mut DatasetOutcome) {
        warn!("[{}] snapshot run aborted: {err}", dataset.path);
        let kind = match err {
            WardenError::Hook { .. } => EventKind::HookFailed,
            _ => EventKind::SnapshotFailed,
        };
        self.notifier
            .notify(&Event::new(kind, dataset.path.clone(), err.to_string()));
        outcome.error = Some(err.to_string());
    }
}

fn ensure_executable(hook: &Path, phase: HookPhase) -> WardenResult<()> {
    let executable = fs::metadata(hook)
        .map(|meta| meta.is_file() && meta.permissions().mode() & 0o111 != 0)
        .unwrap_or(false);
    if executable {
        Ok(())
    } else {
        Err(WardenError::Hook {
            hook: hook.to_path_buf(),
            phase: phase.as_str().to_string(),
            reason: "hook is missing or not executable".to_string(),
        })
    }
}

//! In-memory providers shared by the unit tests.

use crate::config::{
    BackupJob, DatasetConfig, RetentionCounts, ReplicationTarget, WardenConfig,
};
use crate::error::{WardenError, WardenResult};
use crate::notify::{Event, Notifier};
use crate::provider::{
    ArchiveRequest, BackupRegistry, Hold, HookPhase, HookRunner, PoolStatus, ReplicationTransport,
    SnapshotInfo, SystemOps, TransferPlan, ZfsProvider,
};
use chrono::{DateTime, TimeZone, Utc};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Condvar, Mutex};

pub fn at(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(y, mo, d, h, mi, 0).unwrap()
}

pub fn target(host: &str, remote: &str) -> ReplicationTarget {
    ReplicationTarget {
        target_host: host.to_string(),
        target_user: "zfs-replication".into(),
        target_dataset: remote.to_string(),
        send_options: String::new(),
        recv_options: String::new(),
        host_key: Some(format!("ssh-ed25519 AAAAC3Nza{host}")),
        port: 22,
        target_name: None,
        target_location: None,
    }
}

pub fn dataset_config(path: &str) -> DatasetConfig {
    DatasetConfig {
        path: path.to_string(),
        retention: None,
        recursive: false,
        autosnap: true,
        autoprune: true,
        pre_hook: None,
        post_hook: None,
        replication: None,
        effective_retention: RetentionCounts::default(),
    }
}

/// Config rooted in `dir` so lock, metrics and known_hosts stay in the fixture.
pub fn config_in(dir: &Path) -> WardenConfig {
    let mut cfg: WardenConfig = toml::from_str("").unwrap();
    cfg.replication.lock_path = dir.join("run/replication.lock");
    cfg.metrics.textfile_dir = dir.join("textfile");
    cfg.ssh.known_hosts_path = dir.join("known_hosts");
    cfg
}

pub fn add_dataset(cfg: &mut WardenConfig, dataset: DatasetConfig) {
    cfg.datasets.insert(dataset.path.clone(), dataset);
}

#[derive(Debug, Default)]
pub struct ZfsState {
    pub clock: Option<DateTime<Utc>>,
    pub datasets: BTreeSet<String>,
    pub snapshots: Vec<SnapshotInfo>,
    pub holds: Vec<Hold>,
    pub properties: BTreeMap<String, BTreeMap<String, String>>,
    pub mounted: BTreeSet<String>,
    pub pools: Vec<PoolStatus>,
    /// Operations (`op:subject`) that fail when invoked.
    pub failing: BTreeSet<String>,
    /// Mutating calls in order, `op:subject`.
    pub calls: Vec<String>,
    next_guid: u64,
}

#[derive(Clone, Default)]
pub struct MockZfs {
    pub state: Arc<Mutex<ZfsState>>,
}

impl MockZfs {
    pub fn with_datasets(datasets: &[&str]) -> Self {
        let mock = Self::default();
        {
            let mut state = mock.state.lock().unwrap();
            state.datasets = datasets.iter().map(|d| d.to_string()).collect();
        }
        mock
    }

    pub fn set_clock(&self, now: DateTime<Utc>) {
        self.state.lock().unwrap().clock = Some(now);
    }

    pub fn fail(&self, op: &str, subject: &str) {
        self.state
            .lock()
            .unwrap()
            .failing
            .insert(format!("{op}:{subject}"));
    }

    pub fn add_snapshot(&self, name: &str, created: DateTime<Utc>) -> String {
        let mut state = self.state.lock().unwrap();
        state.next_guid += 1;
        let guid = format!("{}", 1000 + state.next_guid);
        state.snapshots.push(SnapshotInfo {
            name: name.to_string(),
            guid: guid.clone(),
            created,
        });
        state.snapshots.sort_by_key(|s| s.created);
        guid
    }

    pub fn add_hold(&self, tag: &str, snapshot: &str, created_at: DateTime<Utc>) {
        self.state.lock().unwrap().holds.push(Hold {
            tag: tag.to_string(),
            snapshot: snapshot.to_string(),
            created_at,
        });
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.state
            .lock()
            .unwrap()
            .snapshots
            .iter()
            .map(|s| s.name.clone())
            .collect()
    }

    pub fn calls(&self) -> Vec<String> {
        self.state.lock().unwrap().calls.clone()
    }

    fn record(&self, op: &str, subject: &str) -> WardenResult<()> {
        let mut state = self.state.lock().unwrap();
        let key = format!("{op}:{subject}");
        if state.failing.contains(&key) {
            return Err(WardenError::Provider(format!("{op} failed for {subject}")));
        }
        state.calls.push(key);
        Ok(())
    }
}

fn descends(child: &str, parent: &str) -> bool {
    child == parent || child.starts_with(&format!("{parent}/"))
}

impl ZfsProvider for MockZfs {
    fn dataset_exists(&self, dataset: &str) -> WardenResult<bool> {
        Ok(self.state.lock().unwrap().datasets.contains(dataset))
    }

    fn list_snapshots(&self, dataset: &str) -> WardenResult<Vec<SnapshotInfo>> {
        let state = self.state.lock().unwrap();
        if state.failing.contains(&format!("list_snapshots:{dataset}")) {
            return Err(WardenError::Provider("list failed".into()));
        }
        Ok(state
            .snapshots
            .iter()
            .filter(|s| s.dataset() == dataset)
            .cloned()
            .collect())
    }

    fn list_snapshots_recursive(&self, root: &str) -> WardenResult<Vec<SnapshotInfo>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .snapshots
            .iter()
            .filter(|s| descends(s.dataset(), root))
            .cloned()
            .collect())
    }

    fn create_snapshot(&self, dataset: &str, name: &str, recursive: bool) -> WardenResult<()> {
        self.record("create_snapshot", dataset)?;
        let created = self.state.lock().unwrap().clock.unwrap_or_else(Utc::now);
        let targets: Vec<String> = {
            let state = self.state.lock().unwrap();
            if recursive {
                state
                    .datasets
                    .iter()
                    .filter(|d| descends(d, dataset))
                    .cloned()
                    .collect()
            } else {
                vec![dataset.to_string()]
            }
        };
        for ds in targets {
            self.add_snapshot(&format!("{ds}@{name}"), created);
        }
        Ok(())
    }

    fn destroy_snapshot(&self, snapshot: &str, recursive: bool) -> WardenResult<()> {
        self.record("destroy_snapshot", snapshot)?;
        let mut state = self.state.lock().unwrap();
        if state.holds.iter().any(|h| h.snapshot == snapshot) {
            return Err(WardenError::Provider(format!("{snapshot}: dataset is busy")));
        }
        let (dataset, short) = snapshot.split_once('@').unwrap_or((snapshot, ""));
        state.snapshots.retain(|s| {
            if recursive {
                !(descends(s.dataset(), dataset) && s.short_name() == short)
            } else {
                s.name != snapshot
            }
        });
        Ok(())
    }

    fn holds(&self, snapshots: &[String]) -> WardenResult<Vec<Hold>> {
        let state = self.state.lock().unwrap();
        Ok(state
            .holds
            .iter()
            .filter(|h| snapshots.contains(&h.snapshot))
            .cloned()
            .collect())
    }

    fn release_hold(&self, hold: &Hold) -> WardenResult<()> {
        self.record("release_hold", &format!("{}@{}", hold.tag, hold.snapshot))?;
        let mut state = self.state.lock().unwrap();
        state
            .holds
            .retain(|h| !(h.tag == hold.tag && h.snapshot == hold.snapshot));
        Ok(())
    }

    fn create_dataset(
        &self,
        dataset: &str,
        properties: &BTreeMap<String, String>,
    ) -> WardenResult<()> {
        self.record("create_dataset", dataset)?;
        let mut state = self.state.lock().unwrap();
        state.datasets.insert(dataset.to_string());
        state
            .properties
            .entry(dataset.to_string())
            .or_default()
            .extend(properties.clone());
        Ok(())
    }

    fn set_properties(
        &self,
        dataset: &str,
        properties: &BTreeMap<String, String>,
    ) -> WardenResult<()> {
        self.record("set_properties", dataset)?;
        self.state
            .lock()
            .unwrap()
            .properties
            .entry(dataset.to_string())
            .or_default()
            .extend(properties.clone());
        Ok(())
    }

    fn mount(&self, dataset: &str) -> WardenResult<()> {
        self.record("mount", dataset)?;
        self.state.lock().unwrap().mounted.insert(dataset.to_string());
        Ok(())
    }

    fn clone_snapshot(&self, snapshot: &str, target: &str) -> WardenResult<()> {
        self.record("clone", &format!("{snapshot}->{target}"))?;
        self.state.lock().unwrap().datasets.insert(target.to_string());
        Ok(())
    }

    fn promote(&self, dataset: &str) -> WardenResult<()> {
        self.record("promote", dataset)
    }

    fn rollback(&self, snapshot: &str) -> WardenResult<()> {
        self.record("rollback", snapshot)
    }

    fn pools(&self) -> WardenResult<Vec<PoolStatus>> {
        let state = self.state.lock().unwrap();
        if state.failing.contains("pools:") {
            return Err(WardenError::Provider("zpool list failed".into()));
        }
        Ok(state.pools.clone())
    }
}

/// Rendezvous that parks a transfer until the test releases it.
#[derive(Debug, Clone, Default)]
pub struct SendGate {
    inner: Arc<(Mutex<GateState>, Condvar)>,
}

#[derive(Debug, Default)]
struct GateState {
    entered: bool,
    released: bool,
}

impl SendGate {
    /// Block until a transfer is parked at the gate.
    pub fn wait_entered(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap();
        while !state.entered {
            state = cvar.wait(state).unwrap();
        }
    }

    pub fn release(&self) {
        let (lock, cvar) = &*self.inner;
        lock.lock().unwrap().released = true;
        cvar.notify_all();
    }

    fn pass(&self) {
        let (lock, cvar) = &*self.inner;
        let mut state = lock.lock().unwrap();
        state.entered = true;
        cvar.notify_all();
        while !state.released {
            state = cvar.wait(state).unwrap();
        }
    }
}

#[derive(Debug, Default)]
pub struct TransportState {
    pub unreachable: BTreeSet<String>,
    pub remote: BTreeMap<String, Vec<SnapshotInfo>>,
    pub sent: Vec<TransferPlan>,
    pub pulled: Vec<TransferPlan>,
    pub fail_send: Option<String>,
    pub fail_pull: Option<String>,
    /// Directory populated by a successful pull, to mimic the mounted replica.
    pub pull_populates: Option<PathBuf>,
    /// Parks `send` and `pull` until released.
    pub gate: Option<SendGate>,
}

#[derive(Clone, Default)]
pub struct MockTransport {
    pub state: Arc<Mutex<TransportState>>,
}

impl MockTransport {
    pub fn set_remote(&self, dataset: &str, snapshots: Vec<SnapshotInfo>) {
        self.state
            .lock()
            .unwrap()
            .remote
            .insert(dataset.to_string(), snapshots);
    }

    pub fn sent(&self) -> Vec<TransferPlan> {
        self.state.lock().unwrap().sent.clone()
    }

    pub fn pulled(&self) -> Vec<TransferPlan> {
        self.state.lock().unwrap().pulled.clone()
    }

    pub fn gate(&self) -> SendGate {
        let gate = SendGate::default();
        self.state.lock().unwrap().gate = Some(gate.clone());
        gate
    }

    fn wait_at_gate(&self) {
        let gate = self.state.lock().unwrap().gate.clone();
        if let Some(gate) = gate {
            gate.pass();
        }
    }
}

impl ReplicationTransport for MockTransport {
    fn probe(&self, target: &ReplicationTarget) -> WardenResult<()> {
        if self
            .state
            .lock()
            .unwrap()
            .unreachable
            .contains(&target.target_host)
        {
            return Err(WardenError::Unreachable {
                host: target.target_host.clone(),
                reason: "connection timed out".into(),
            });
        }
        Ok(())
    }

    fn remote_snapshots(
        &self,
        target: &ReplicationTarget,
        dataset: &str,
    ) -> WardenResult<Vec<SnapshotInfo>> {
        self.probe(target)?;
        Ok(self
            .state
            .lock()
            .unwrap()
            .remote
            .get(dataset)
            .cloned()
            .unwrap_or_default())
    }

    fn send(&self, _target: &ReplicationTarget, plan: &TransferPlan) -> WardenResult<()> {
        self.wait_at_gate();
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.fail_send {
            return Err(WardenError::Provider(reason.clone()));
        }
        state.sent.push(plan.clone());
        Ok(())
    }

    fn pull(&self, _target: &ReplicationTarget, plan: &TransferPlan) -> WardenResult<()> {
        self.wait_at_gate();
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.fail_pull {
            return Err(WardenError::Provider(reason.clone()));
        }
        state.pulled.push(plan.clone());
        if let Some(dir) = &state.pull_populates {
            fs::create_dir_all(dir).unwrap();
            fs::write(dir.join("replica.db"), b"replica").unwrap();
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct RegistryState {
    pub running: Vec<BackupJob>,
    pub query_fails: bool,
    pub restore_fails: Option<String>,
    pub restored: Vec<ArchiveRequest>,
    pub queries: usize,
}

#[derive(Clone, Default)]
pub struct MockRegistry {
    pub state: Arc<Mutex<RegistryState>>,
}

impl MockRegistry {
    pub fn running(jobs: Vec<BackupJob>) -> Self {
        let registry = Self::default();
        registry.state.lock().unwrap().running = jobs;
        registry
    }

    pub fn failing_query() -> Self {
        let registry = Self::default();
        registry.state.lock().unwrap().query_fails = true;
        registry
    }

    pub fn restored(&self) -> Vec<ArchiveRequest> {
        self.state.lock().unwrap().restored.clone()
    }
}

pub fn backup_job(name: &str, datasets: &[&str]) -> BackupJob {
    BackupJob {
        name: name.to_string(),
        unit: format!("restic-backups-{name}.service"),
        datasets: datasets.iter().map(|d| d.to_string()).collect(),
    }
}

impl BackupRegistry for MockRegistry {
    fn running_jobs(&self) -> WardenResult<Vec<BackupJob>> {
        let mut state = self.state.lock().unwrap();
        state.queries += 1;
        if state.query_fails {
            return Err(WardenError::Provider("systemctl unavailable".into()));
        }
        Ok(state.running.clone())
    }

    fn restore_archive(&self, request: &ArchiveRequest) -> WardenResult<()> {
        let mut state = self.state.lock().unwrap();
        if let Some(reason) = &state.restore_fails {
            return Err(WardenError::Provider(reason.clone()));
        }
        state.restored.push(request.clone());
        fs::create_dir_all(&request.data_dir)?;
        fs::write(request.data_dir.join("archive.db"), b"archive")?;
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockHooks {
    pub runs: Arc<Mutex<Vec<(PathBuf, HookPhase, String)>>>,
    pub failing: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl MockHooks {
    pub fn fail(&self, hook: &Path) {
        self.failing.lock().unwrap().insert(hook.to_path_buf());
    }

    pub fn runs(&self) -> Vec<(PathBuf, HookPhase, String)> {
        self.runs.lock().unwrap().clone()
    }
}

impl HookRunner for MockHooks {
    fn run_hook(&self, hook: &Path, phase: HookPhase, dataset: &str) -> WardenResult<()> {
        self.runs
            .lock()
            .unwrap()
            .push((hook.to_path_buf(), phase, dataset.to_string()));
        if self.failing.lock().unwrap().contains(hook) {
            return Err(WardenError::Hook {
                hook: hook.to_path_buf(),
                phase: phase.as_str().to_string(),
                reason: "exit status 1".into(),
            });
        }
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct MockSystem {
    pub chowns: Arc<Mutex<Vec<(PathBuf, String, String)>>>,
}

impl SystemOps for MockSystem {
    fn chown_recursive(&self, path: &Path, owner: &str, group: &str) -> WardenResult<()> {
        self.chowns
            .lock()
            .unwrap()
            .push((path.to_path_buf(), owner.to_string(), group.to_string()));
        Ok(())
    }
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    pub events: Arc<Mutex<Vec<Event>>>,
}

impl RecordingNotifier {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }
}

impl Notifier for RecordingNotifier {
    fn notify(&self, event: &Event) {
        self.events.lock().unwrap().push(event.clone());
    }
}

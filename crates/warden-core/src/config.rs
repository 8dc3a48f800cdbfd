use crate::error::{WardenError, WardenResult};
use crate::trust::parse_host_key;
use log::warn;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// On-disk encoding of a configuration file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ConfigFormat {
    #[default]
    Toml,
    Yaml,
}

impl ConfigFormat {
    fn from_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("toml") => ConfigFormat::Toml,
            _ => ConfigFormat::Yaml,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
pub struct ZfsCfg {
    #[serde(default)]
    pub zfs_path: Option<String>,

    #[serde(default)]
    pub zpool_path: Option<String>,

    #[serde(default = "default_zfs_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_zfs_timeout_secs() -> u64 {
    30
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct SshCfg {
    #[serde(default)]
    pub ssh_path: Option<String>,

    #[serde(default)]
    pub identity_file: Option<PathBuf>,

    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,

    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    #[serde(default = "default_server_alive_interval_secs")]
    pub server_alive_interval_secs: u64,

    #[serde(default = "default_server_alive_count_max")]
    pub server_alive_count_max: u32,

    #[serde(default = "default_remote_zfs_command")]
    pub remote_zfs_command: String,
}

fn default_known_hosts_path() -> PathBuf {
    PathBuf::from("/var/lib/zfs-warden/known_hosts")
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_server_alive_interval_secs() -> u64 {
    15
}

fn default_server_alive_count_max() -> u32 {
    3
}

fn default_remote_zfs_command() -> String {
    "zfs".to_string()
}

impl Default for SshCfg {
    fn default() -> Self {
        Self {
            ssh_path: None,
            identity_file: None,
            known_hosts_path: default_known_hosts_path(),
            connect_timeout_secs: default_connect_timeout_secs(),
            server_alive_interval_secs: default_server_alive_interval_secs(),
            server_alive_count_max: default_server_alive_count_max(),
            remote_zfs_command: default_remote_zfs_command(),
        }
    }
}

/// How replication pipelines are fenced off from interactive workloads.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum ConfinementMode {
    None,
    Nice,
    SystemdScope,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct Confinement {
    #[serde(default = "default_confinement_mode")]
    pub mode: ConfinementMode,

    #[serde(default = "default_cpu_quota")]
    pub cpu_quota: String,

    #[serde(default = "default_memory_max")]
    pub memory_max: String,

    #[serde(default = "default_nice")]
    pub nice: i32,

    #[serde(default = "default_io_class")]
    pub io_class: String,
}

fn default_confinement_mode() -> ConfinementMode {
    ConfinementMode::SystemdScope
}

fn default_cpu_quota() -> String {
    "50%".to_string()
}

fn default_memory_max() -> String {
    "1G".to_string()
}

fn default_nice() -> i32 {
    10
}

fn default_io_class() -> String {
    "idle".to_string()
}

impl Default for Confinement {
    fn default() -> Self {
        Self {
            mode: default_confinement_mode(),
            cpu_quota: default_cpu_quota(),
            memory_max: default_memory_max(),
            nice: default_nice(),
            io_class: default_io_class(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ReplicationCfg {
    #[serde(default = "default_lock_path")]
    pub lock_path: PathBuf,

    #[serde(default = "default_replication_timeout_secs")]
    pub timeout_secs: u64,

    #[serde(default = "default_probe_timeout_secs")]
    pub probe_timeout_secs: u64,

    #[serde(default = "default_unit_prefix")]
    pub unit_prefix: String,

    #[serde(default)]
    pub confinement: Confinement,
}

fn default_lock_path() -> PathBuf {
    PathBuf::from("/run/zfs-warden/replication.lock")
}

fn default_replication_timeout_secs() -> u64 {
    45 * 60
}

fn default_probe_timeout_secs() -> u64 {
    10
}

fn default_unit_prefix() -> String {
    "syncoid".to_string()
}

impl Default for ReplicationCfg {
    fn default() -> Self {
        Self {
            lock_path: default_lock_path(),
            timeout_secs: default_replication_timeout_secs(),
            probe_timeout_secs: default_probe_timeout_secs(),
            unit_prefix: default_unit_prefix(),
            confinement: Confinement::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct HoldsCfg {
    #[serde(default = "default_tag_prefix")]
    pub tag_prefix: String,

    #[serde(default = "default_max_age_hours")]
    pub max_age_hours: u64,
}

fn default_tag_prefix() -> String {
    "restic-".to_string()
}

fn default_max_age_hours() -> u64 {
    24
}

/// Ten years; anything longer never releases a hold in practice.
pub const MAX_HOLD_AGE_HOURS: u64 = 24 * 365 * 10;

impl Default for HoldsCfg {
    fn default() -> Self {
        Self {
            tag_prefix: default_tag_prefix(),
            max_age_hours: default_max_age_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ScheduleCfg {
    #[serde(default = "default_snapshot_interval_secs")]
    pub snapshot_interval_secs: u64,

    #[serde(default = "default_hold_gc_interval_secs")]
    pub hold_gc_interval_secs: u64,

    #[serde(default = "default_replication_interval_secs")]
    pub replication_interval_secs: u64,

    #[serde(default = "default_health_interval_secs")]
    pub health_interval_secs: u64,
}

fn default_snapshot_interval_secs() -> u64 {
    900
}

fn default_hold_gc_interval_secs() -> u64 {
    3600
}

fn default_replication_interval_secs() -> u64 {
    3600
}

fn default_health_interval_secs() -> u64 {
    300
}

impl Default for ScheduleCfg {
    fn default() -> Self {
        Self {
            snapshot_interval_secs: default_snapshot_interval_secs(),
            hold_gc_interval_secs: default_hold_gc_interval_secs(),
            replication_interval_secs: default_replication_interval_secs(),
            health_interval_secs: default_health_interval_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct MetricsCfg {
    #[serde(default = "default_textfile_dir")]
    pub textfile_dir: PathBuf,

    #[serde(default = "default_stale_threshold_hours")]
    pub stale_threshold_hours: u64,
}

fn default_textfile_dir() -> PathBuf {
    PathBuf::from("/var/lib/node_exporter/textfile_collector")
}

fn default_stale_threshold_hours() -> u64 {
    2
}

impl Default for MetricsCfg {
    fn default() -> Self {
        Self {
            textfile_dir: default_textfile_dir(),
            stale_threshold_hours: default_stale_threshold_hours(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct NotifyCfg {
    #[serde(default)]
    pub command: Option<PathBuf>,

    #[serde(default = "default_notify_timeout_secs")]
    pub timeout_secs: u64,
}

fn default_notify_timeout_secs() -> u64 {
    30
}

impl Default for NotifyCfg {
    fn default() -> Self {
        Self {
            command: None,
            timeout_secs: default_notify_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct BackupCfg {
    #[serde(default)]
    pub restic_path: Option<String>,

    #[serde(default)]
    pub systemctl_path: Option<String>,

    #[serde(default = "default_query_timeout_secs")]
    pub query_timeout_secs: u64,

    #[serde(default = "default_restore_timeout_secs")]
    pub restore_timeout_secs: u64,
}

fn default_query_timeout_secs() -> u64 {
    10
}

fn default_restore_timeout_secs() -> u64 {
    3600
}

impl Default for BackupCfg {
    fn default() -> Self {
        Self {
            restic_path: None,
            systemctl_path: None,
            query_timeout_secs: default_query_timeout_secs(),
            restore_timeout_secs: default_restore_timeout_secs(),
        }
    }
}

/// Number of snapshots kept per granularity.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct RetentionCounts {
    #[serde(default)]
    pub hourly: u32,

    #[serde(default)]
    pub daily: u32,

    #[serde(default)]
    pub weekly: u32,

    #[serde(default)]
    pub monthly: u32,

    #[serde(default)]
    pub yearly: u32,
}

/// Retention is either a reference into `templates` or an inline table.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(untagged)]
pub enum RetentionRef {
    Template(String),
    Inline(RetentionCounts),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ReplicationTarget {
    pub target_host: String,

    #[serde(default = "default_target_user")]
    pub target_user: String,

    pub target_dataset: String,

    #[serde(default)]
    pub send_options: String,

    #[serde(default)]
    pub recv_options: String,

    /// Pinned public key, `<type> <base64>`. Required.
    #[serde(default)]
    pub host_key: Option<String>,

    #[serde(default = "default_ssh_port")]
    pub port: u16,

    #[serde(default)]
    pub target_name: Option<String>,

    #[serde(default)]
    pub target_location: Option<String>,
}

fn default_target_user() -> String {
    "zfs-replication".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl ReplicationTarget {
    pub fn destination(&self) -> String {
        format!("{}@{}", self.target_user, self.target_host)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct DatasetConfig {
    /// Filled from the map key at load time.
    #[serde(skip)]
    pub path: String,

    #[serde(default)]
    pub retention: Option<RetentionRef>,

    #[serde(default)]
    pub recursive: bool,

    #[serde(default = "default_true")]
    pub autosnap: bool,

    #[serde(default = "default_true")]
    pub autoprune: bool,

    #[serde(default)]
    pub pre_hook: Option<PathBuf>,

    #[serde(default)]
    pub post_hook: Option<PathBuf>,

    #[serde(default)]
    pub replication: Option<ReplicationTarget>,

    /// Counts after template resolution.
    #[serde(skip)]
    pub effective_retention: RetentionCounts,
}

fn default_true() -> bool {
    true
}

/// Restore strategies available to the preseed orchestrator.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema,
)]
#[serde(rename_all = "kebab-case")]
pub enum RestoreMethod {
    Replica,
    LocalSnapshot,
    Archive,
}

impl RestoreMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            RestoreMethod::Replica => "replica",
            RestoreMethod::LocalSnapshot => "local-snapshot",
            RestoreMethod::Archive => "archive",
        }
    }
}

impl std::fmt::Display for RestoreMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct ArchiveSource {
    pub repository: String,

    #[serde(default)]
    pub password_file: Option<PathBuf>,

    #[serde(default)]
    pub env_file: Option<PathBuf>,

    #[serde(default = "default_archive_snapshot")]
    pub snapshot: String,

    #[serde(default)]
    pub tags: Vec<String>,

    #[serde(default)]
    pub host: Option<String>,
}

fn default_archive_snapshot() -> String {
    "latest".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ServiceConfig {
    /// Filled from the map key at load time.
    #[serde(skip)]
    pub name: String,

    pub dataset: String,

    pub data_dir: PathBuf,

    pub owner: String,

    pub group: String,

    #[serde(default = "default_mode")]
    pub mode: String,

    #[serde(default = "default_restore_methods")]
    pub restore_methods: Vec<RestoreMethod>,

    #[serde(default)]
    pub local_snapshot_source: Option<String>,

    #[serde(default)]
    pub archive: Option<ArchiveSource>,

    /// Steady-state properties applied when a restore creates the dataset.
    #[serde(default)]
    pub properties: BTreeMap<String, String>,

    #[serde(default)]
    pub ready_file: Option<PathBuf>,
}

fn default_mode() -> String {
    "0750".to_string()
}

fn default_restore_methods() -> Vec<RestoreMethod> {
    vec![
        RestoreMethod::Replica,
        RestoreMethod::LocalSnapshot,
        RestoreMethod::Archive,
    ]
}

impl ServiceConfig {
    pub fn mode_bits(&self) -> WardenResult<u32> {
        parse_mode(&self.mode).ok_or_else(|| {
            WardenError::InvalidConfig(format!(
                "services.{}.mode `{}` is not an octal mode",
                self.name, self.mode
            ))
        })
    }
}

fn parse_mode(raw: &str) -> Option<u32> {
    let digits = raw.trim().trim_start_matches("0o");
    if digits.is_empty() {
        return None;
    }
    u32::from_str_radix(digits, 8)
        .ok()
        .filter(|bits| *bits <= 0o7777)
}

/// An externally owned backup job and the datasets it reads.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct BackupJob {
    #[serde(skip)]
    pub name: String,

    pub unit: String,

    #[serde(default)]
    pub datasets: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WardenConfig {
    #[serde(default)]
    pub zfs: ZfsCfg,

    #[serde(default)]
    pub ssh: SshCfg,

    #[serde(default)]
    pub replication: ReplicationCfg,

    #[serde(default)]
    pub holds: HoldsCfg,

    #[serde(default)]
    pub schedule: ScheduleCfg,

    #[serde(default)]
    pub metrics: MetricsCfg,

    #[serde(default)]
    pub notify: NotifyCfg,

    #[serde(default)]
    pub backup: BackupCfg,

    #[serde(default)]
    pub templates: BTreeMap<String, RetentionCounts>,

    #[serde(default)]
    pub datasets: BTreeMap<String, DatasetConfig>,

    #[serde(default)]
    pub backup_jobs: BTreeMap<String, BackupJob>,

    #[serde(default)]
    pub services: BTreeMap<String, ServiceConfig>,

    #[serde(skip)]
    pub path: PathBuf,
}

impl WardenConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> WardenResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut cfg = Self::parse(&contents, ConfigFormat::from_path(path))?;
        cfg.path = path.to_path_buf();
        Ok(cfg)
    }

    /// Parse, default, and validate a configuration document.
    pub fn parse(contents: &str, format: ConfigFormat) -> WardenResult<Self> {
        let mut cfg = match format {
            ConfigFormat::Toml => toml::from_str::<Self>(contents)?,
            ConfigFormat::Yaml => serde_yaml::from_str::<Self>(contents)?,
        };
        cfg.finalize();

        let issues = cfg.validate();
        if !issues.is_empty() {
            return Err(WardenError::ConfigIssues(issues));
        }
        for warning in cfg.warnings() {
            warn!("config: {warning}");
        }
        Ok(cfg)
    }

    /// Copy map keys into their structs and resolve retention templates.
    pub fn finalize(&mut self) {
        let templates = self.templates.clone();
        for (path, dataset) in self.datasets.iter_mut() {
            dataset.path = path.clone();
            dataset.effective_retention = match &dataset.retention {
                Some(RetentionRef::Template(name)) => {
                    templates.get(name).copied().unwrap_or_default()
                }
                Some(RetentionRef::Inline(counts)) => *counts,
                None => RetentionCounts::default(),
            };
        }
        for (name, job) in self.backup_jobs.iter_mut() {
            job.name = name.clone();
        }
        for (name, service) in self.services.iter_mut() {
            service.name = name.clone();
        }
    }

    /// Collect every fatal configuration problem.
    pub fn validate(&self) -> Vec<String> {
        let mut issues = Vec::new();

        if self.replication.timeout_secs == 0 {
            issues.push("replication.timeout_secs must be greater than zero".to_string());
        }
        if self.replication.timeout_secs >= self.schedule.replication_interval_secs {
            issues.push(format!(
                "replication.timeout_secs ({}) must be shorter than schedule.replication_interval_secs ({})",
                self.replication.timeout_secs, self.schedule.replication_interval_secs
            ));
        }
        for (name, value) in [
            ("snapshot_interval_secs", self.schedule.snapshot_interval_secs),
            ("hold_gc_interval_secs", self.schedule.hold_gc_interval_secs),
            ("replication_interval_secs", self.schedule.replication_interval_secs),
            ("health_interval_secs", self.schedule.health_interval_secs),
        ] {
            if value == 0 {
                issues.push(format!("schedule.{name} must be greater than zero"));
            }
        }
        if self.holds.tag_prefix.is_empty() {
            issues.push("holds.tag_prefix must not be empty".to_string());
        }
        if self.holds.max_age_hours > MAX_HOLD_AGE_HOURS {
            issues.push(format!(
                "holds.max_age_hours ({}) must be at most {MAX_HOLD_AGE_HOURS}",
                self.holds.max_age_hours
            ));
        }

        for (path, dataset) in &self.datasets {
            // an empty segment covers leading, trailing and doubled slashes
            if path.split('/').any(str::is_empty) || path.contains('@') {
                issues.push(format!("datasets.\"{path}\" is not a valid dataset name"));
            }
            if let Some(RetentionRef::Template(name)) = &dataset.retention {
                if !self.templates.contains_key(name) {
                    issues.push(format!(
                        "datasets.\"{path}\" references unknown retention template `{name}`"
                    ));
                }
            }
            if let Some(target) = &dataset.replication {
                if target.target_host.trim().is_empty() {
                    issues.push(format!("datasets.\"{path}\".replication.target_host is empty"));
                }
                if target.target_dataset.trim().is_empty() {
                    issues.push(format!(
                        "datasets.\"{path}\".replication.target_dataset is empty"
                    ));
                }
                match &target.host_key {
                    None => issues.push(format!(
                        "datasets.\"{path}\".replication.host_key is required to pin {}",
                        target.target_host
                    )),
                    Some(key) if parse_host_key(key).is_none() => issues.push(format!(
                        "datasets.\"{path}\".replication.host_key is not `<type> <base64>`"
                    )),
                    Some(_) => {}
                }
            }
        }

        for (name, service) in &self.services {
            if service.restore_methods.is_empty() {
                issues.push(format!("services.{name}.restore_methods must not be empty"));
            }
            let unique: BTreeSet<_> = service.restore_methods.iter().collect();
            if unique.len() != service.restore_methods.len() {
                issues.push(format!("services.{name}.restore_methods lists a method twice"));
            }
            if service.restore_methods.contains(&RestoreMethod::Archive)
                && service.archive.is_none()
            {
                issues.push(format!(
                    "services.{name} uses the archive method but has no archive table"
                ));
            }
            if parse_mode(&service.mode).is_none() {
                issues.push(format!(
                    "services.{name}.mode `{}` is not an octal mode",
                    service.mode
                ));
            }
            if !service.data_dir.is_absolute() {
                issues.push(format!("services.{name}.data_dir must be an absolute path"));
            }
            if service.dataset.trim().is_empty() {
                issues.push(format!("services.{name}.dataset is empty"));
            }
        }

        issues
    }

    /// Non-fatal findings worth surfacing at startup.
    pub fn warnings(&self) -> Vec<String> {
        let mut warnings = Vec::new();
        for (path, dataset) in &self.datasets {
            if dataset.pre_hook.is_some() && dataset.post_hook.is_none() {
                warnings.push(format!(
                    "datasets.\"{path}\" declares pre_hook without post_hook; external state may stay paused"
                ));
            }
        }
        let tag_stem = self.holds.tag_prefix.trim_end_matches('-');
        for (name, job) in &self.backup_jobs {
            if !tag_stem.is_empty() && !job.unit.contains(tag_stem) {
                warnings.push(format!(
                    "backup_jobs.{name} unit `{}` does not look like a `{}` job; its holds may be ignored",
                    job.unit, self.holds.tag_prefix
                ));
            }
            for dataset in &job.datasets {
                if !self.datasets.contains_key(dataset.trim_end_matches('/')) {
                    warnings.push(format!(
                        "backup_jobs.{name} reads {dataset}, which has no datasets entry"
                    ));
                }
            }
        }
        warnings
    }

    pub fn dataset(&self, path: &str) -> WardenResult<&DatasetConfig> {
        self.datasets
            .get(path.trim_end_matches('/'))
            .ok_or_else(|| WardenError::DatasetNotConfigured(path.to_string()))
    }

    pub fn service(&self, name: &str) -> WardenResult<&ServiceConfig> {
        self.services
            .get(name)
            .ok_or_else(|| WardenError::ServiceNotConfigured(name.to_string()))
    }

    pub fn zfs_timeout(&self) -> Duration {
        Duration::from_secs(self.zfs.timeout_secs)
    }

    pub fn zfs_binary_path(&self) -> Option<PathBuf> {
        self.zfs.zfs_path.as_ref().map(PathBuf::from)
    }

    pub fn zpool_binary_path(&self) -> Option<PathBuf> {
        self.zfs.zpool_path.as_ref().map(PathBuf::from)
    }

    pub fn replication_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.timeout_secs)
    }

    pub fn probe_timeout(&self) -> Duration {
        Duration::from_secs(self.replication.probe_timeout_secs)
    }

    /// Saturates instead of overflowing for unvalidated values.
    pub fn hold_max_age(&self) -> chrono::Duration {
        i64::try_from(self.holds.max_age_hours)
            .ok()
            .and_then(chrono::Duration::try_hours)
            .unwrap_or(chrono::Duration::MAX)
    }
}

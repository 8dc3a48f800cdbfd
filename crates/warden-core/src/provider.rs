//! Traits at the seams between orchestration logic and the host system.
//!
//! Every component in this crate talks to ZFS, SSH, the backup subsystem and
//! hook scripts through these traits, so the orchestration can be exercised
//! without touching real pools.

use crate::config::{ArchiveSource, BackupJob, ReplicationTarget};
use crate::error::WardenResult;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// One snapshot as reported by `zfs list -t snapshot`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfo {
    /// Full name, `dataset@snapshot`.
    pub name: String,
    pub guid: String,
    pub created: DateTime<Utc>,
}

impl SnapshotInfo {
    pub fn dataset(&self) -> &str {
        self.name.split_once('@').map(|(ds, _)| ds).unwrap_or(&self.name)
    }

    pub fn short_name(&self) -> &str {
        self.name.split_once('@').map(|(_, snap)| snap).unwrap_or("")
    }
}

/// A user hold on a snapshot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hold {
    pub tag: String,
    pub snapshot: String,
    pub created_at: DateTime<Utc>,
}

impl Hold {
    pub fn age(&self, now: DateTime<Utc>) -> chrono::Duration {
        now.signed_duration_since(self.created_at)
    }
}

/// Pool name and its reported health column.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PoolStatus {
    pub name: String,
    pub health: String,
}

impl PoolStatus {
    pub fn is_healthy(&self) -> bool {
        self.health.eq_ignore_ascii_case("online")
    }
}

/// Abstraction over the `zfs`/`zpool` command surface.
///
/// Snapshot listings are ordered oldest first. Implementations must pass
/// dataset names through verbatim.
pub trait ZfsProvider {
    fn dataset_exists(&self, dataset: &str) -> WardenResult<bool>;

    /// Snapshots taken directly on `dataset` (not its children).
    fn list_snapshots(&self, dataset: &str) -> WardenResult<Vec<SnapshotInfo>>;

    /// Snapshots on `root` and every descendant.
    fn list_snapshots_recursive(&self, root: &str) -> WardenResult<Vec<SnapshotInfo>>;

    fn create_snapshot(&self, dataset: &str, name: &str, recursive: bool) -> WardenResult<()>;

    fn destroy_snapshot(&self, snapshot: &str, recursive: bool) -> WardenResult<()>;

    /// User holds present on the listed snapshots.
    fn holds(&self, snapshots: &[String]) -> WardenResult<Vec<Hold>>;

    fn release_hold(&self, hold: &Hold) -> WardenResult<()>;

    fn create_dataset(&self, dataset: &str, properties: &BTreeMap<String, String>)
        -> WardenResult<()>;

    fn set_properties(&self, dataset: &str, properties: &BTreeMap<String, String>)
        -> WardenResult<()>;

    /// Mount `dataset`; an already mounted dataset is not an error.
    fn mount(&self, dataset: &str) -> WardenResult<()>;

    fn clone_snapshot(&self, snapshot: &str, target: &str) -> WardenResult<()>;

    fn promote(&self, dataset: &str) -> WardenResult<()>;

    fn rollback(&self, snapshot: &str) -> WardenResult<()>;

    fn pools(&self) -> WardenResult<Vec<PoolStatus>>;
}

/// One `zfs send | zfs receive` transfer, in either direction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    /// Full name of the snapshot being sent.
    pub source_snapshot: String,
    /// Full name of the incremental base, if any.
    pub incremental_from: Option<String>,
    /// Dataset receiving the stream.
    pub destination: String,
    pub send_flags: Vec<String>,
    pub recv_flags: Vec<String>,
}

/// Moves snapshot streams to and from a replication target.
pub trait ReplicationTransport {
    /// Cheap authenticated round trip to the target host.
    fn probe(&self, target: &ReplicationTarget) -> WardenResult<()>;

    /// Snapshots of `dataset` on the target; empty when it does not exist.
    fn remote_snapshots(
        &self,
        target: &ReplicationTarget,
        dataset: &str,
    ) -> WardenResult<Vec<SnapshotInfo>>;

    /// Local send, remote receive.
    fn send(&self, target: &ReplicationTarget, plan: &TransferPlan) -> WardenResult<()>;

    /// Remote send, local receive.
    fn pull(&self, target: &ReplicationTarget, plan: &TransferPlan) -> WardenResult<()>;
}

/// Parameters for restoring a service directory from the backup repository.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveRequest {
    pub source: ArchiveSource,
    pub data_dir: PathBuf,
}

/// Read-only view of the external backup subsystem.
pub trait BackupRegistry {
    /// Backup jobs currently reported as running.
    fn running_jobs(&self) -> WardenResult<Vec<BackupJob>>;

    fn restore_archive(&self, request: &ArchiveRequest) -> WardenResult<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPhase {
    Pre,
    Post,
}

impl HookPhase {
    pub fn as_str(&self) -> &'static str {
        match self {
            HookPhase::Pre => "pre",
            HookPhase::Post => "post",
        }
    }
}

/// Executes snapshot hook scripts.
pub trait HookRunner {
    fn run_hook(&self, hook: &Path, phase: HookPhase, dataset: &str) -> WardenResult<()>;
}

/// Host operations the preseed orchestrator needs outside of ZFS.
pub trait SystemOps {
    fn chown_recursive(&self, path: &Path, owner: &str, group: &str) -> WardenResult<()>;
}

pub mod config;
pub mod error;
pub mod health;
pub mod holds;
pub mod lock;
pub mod logging;
pub mod metrics;
pub mod notify;
pub mod preseed;
pub mod provider;
pub mod replication;
pub mod resolver;
pub mod scheduler;
pub mod status;
pub mod trust;

#[cfg(test)]
mod testing;

pub use config::{
    BackupJob, DatasetConfig, ReplicationTarget, RestoreMethod, ServiceConfig, WardenConfig,
};
pub use error::{WardenError, WardenResult};
pub use health::{HealthProbe, HealthReport};
pub use holds::{HoldManager, HoldReport};
pub use notify::{Event, EventKind, LogNotifier, Notifier};
pub use preseed::{PreseedOrchestrator, RestoreReport, RestoreState};
pub use provider::{
    BackupRegistry, HookPhase, HookRunner, ReplicationTransport, SnapshotInfo, SystemOps,
    ZfsProvider,
};
pub use replication::{ReplicationEngine, ReplicationOutcome};
pub use resolver::{resolve, ResolvedTarget};
pub use scheduler::{SnapshotRunReport, SnapshotScheduler};
pub use status::{StatusFilter, StatusReport};

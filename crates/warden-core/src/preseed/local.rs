use super::{RestoreContext, RestoreEffect, RestoreStrategy, StrategyResult};
use crate::config::RestoreMethod;
use crate::error::{WardenError, WardenResult};
use crate::provider::ZfsProvider;
use std::collections::BTreeMap;

/// Bring back a snapshot that survived on this host: roll the service
/// dataset back to its newest snapshot, or clone and promote one from
/// `local_snapshot_source`.
pub struct LocalSnapshotRestore<Z> {
    zfs: Z,
}

impl<Z> LocalSnapshotRestore<Z> {
    pub fn new(zfs: Z) -> Self {
        Self { zfs }
    }
}

impl<Z: ZfsProvider + Send + Sync> RestoreStrategy for LocalSnapshotRestore<Z> {
    fn method(&self) -> RestoreMethod {
        RestoreMethod::LocalSnapshot
    }

    fn execute(&self, ctx: &RestoreContext<'_>) -> WardenResult<StrategyResult> {
        let service = ctx.service;
        let source = service
            .local_snapshot_source
            .as_deref()
            .unwrap_or(&service.dataset);

        if !self.zfs.dataset_exists(source)? {
            return Ok(StrategyResult::NotApplicable(format!(
                "{source} does not exist on this host"
            )));
        }
        let snapshots = self.zfs.list_snapshots(source)?;
        let Some(newest) = snapshots.last() else {
            return Ok(StrategyResult::NotApplicable(format!(
                "{source} has no snapshots"
            )));
        };

        let created_dataset = if source == service.dataset {
            self.zfs.rollback(&newest.name)?;
            false
        } else {
            if self.zfs.dataset_exists(&service.dataset)? {
                return Err(WardenError::Provider(format!(
                    "cannot clone {} onto existing dataset {}",
                    newest.name, service.dataset
                )));
            }
            self.zfs.clone_snapshot(&newest.name, &service.dataset)?;
            self.zfs.promote(&service.dataset)?;
            true
        };

        let mountpoint = BTreeMap::from([(
            "mountpoint".to_string(),
            service.data_dir.display().to_string(),
        )]);
        self.zfs.set_properties(&service.dataset, &mountpoint)?;
        self.zfs.mount(&service.dataset)?;

        let detail = if created_dataset {
            format!("cloned {} into {}", newest.name, service.dataset)
        } else {
            format!("rolled back to {}", newest.name)
        };
        Ok(StrategyResult::Restored(RestoreEffect {
            created_dataset,
            detail,
        }))
    }
}

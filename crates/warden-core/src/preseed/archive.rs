use super::{RestoreContext, RestoreEffect, RestoreStrategy, StrategyResult};
use crate::config::RestoreMethod;
use crate::error::WardenResult;
use crate::provider::{ArchiveRequest, BackupRegistry, ZfsProvider};
use std::collections::BTreeMap;

/// Restore the data directory from the backup repository.
pub struct ArchiveRestore<Z, B> {
    zfs: Z,
    registry: B,
}

impl<Z, B> ArchiveRestore<Z, B> {
    pub fn new(zfs: Z, registry: B) -> Self {
        Self { zfs, registry }
    }
}

impl<Z, B> RestoreStrategy for ArchiveRestore<Z, B>
where
    Z: ZfsProvider + Send + Sync,
    B: BackupRegistry + Send + Sync,
{
    fn method(&self) -> RestoreMethod {
        RestoreMethod::Archive
    }

    fn execute(&self, ctx: &RestoreContext<'_>) -> WardenResult<StrategyResult> {
        let service = ctx.service;
        let Some(source) = &service.archive else {
            return Ok(StrategyResult::NotApplicable(
                "no archive repository configured".to_string(),
            ));
        };

        let existed = self.zfs.dataset_exists(&service.dataset)?;
        if existed {
            self.zfs.mount(&service.dataset)?;
        } else {
            let props = BTreeMap::from([(
                "mountpoint".to_string(),
                service.data_dir.display().to_string(),
            )]);
            self.zfs.create_dataset(&service.dataset, &props)?;
        }

        self.registry.restore_archive(&ArchiveRequest {
            source: source.clone(),
            data_dir: service.data_dir.clone(),
        })?;

        Ok(StrategyResult::Restored(RestoreEffect {
            created_dataset: !existed,
            detail: format!("restored {} from {}", source.snapshot, source.repository),
        }))
    }
}

use super::{RestoreContext, RestoreEffect, RestoreStrategy, StrategyResult};
use crate::config::RestoreMethod;
use crate::error::WardenResult;
use crate::lock;
use crate::provider::{ReplicationTransport, TransferPlan, ZfsProvider};
use crate::replication::parse_flags;
use crate::resolver::resolve;
use crate::trust::KnownHosts;
use log::debug;
use std::collections::BTreeMap;

/// Pull the newest snapshot back from the replication target.
pub struct ReplicaRestore<Z, T> {
    zfs: Z,
    transport: T,
}

impl<Z, T> ReplicaRestore<Z, T> {
    pub fn new(zfs: Z, transport: T) -> Self {
        Self { zfs, transport }
    }
}

impl<Z, T> RestoreStrategy for ReplicaRestore<Z, T>
where
    Z: ZfsProvider + Send + Sync,
    T: ReplicationTransport + Send + Sync,
{
    fn method(&self) -> RestoreMethod {
        RestoreMethod::Replica
    }

    fn execute(&self, ctx: &RestoreContext<'_>) -> WardenResult<StrategyResult> {
        let service = ctx.service;
        let Some(resolved) = resolve(&service.dataset, &ctx.config.datasets) else {
            return Ok(StrategyResult::NotApplicable(format!(
                "no replication target resolves for {}",
                service.dataset
            )));
        };
        let target = resolved.target;
        let pin = KnownHosts::load(&ctx.config.ssh.known_hosts_path)?.ensure_pinned(target)?;
        debug!("[{}] {} pinned as {pin}", service.name, target.target_host);
        // a receive into the dataset must not overlap a scheduled send of it
        let _guard = lock::try_acquire(&ctx.config.replication.lock_path)?;

        let remote = self
            .transport
            .remote_snapshots(target, &resolved.remote_dataset)?;
        let Some(newest) = remote.last() else {
            return Ok(StrategyResult::NotApplicable(format!(
                "{} has no snapshots of {}",
                target.target_host, resolved.remote_dataset
            )));
        };

        let existed = self.zfs.dataset_exists(&service.dataset)?;
        let mut recv_flags = vec!["-u".to_string()];
        if existed {
            recv_flags.push("-F".to_string());
        }
        let plan = TransferPlan {
            source_snapshot: newest.name.clone(),
            incremental_from: None,
            destination: service.dataset.clone(),
            send_flags: parse_flags(&target.send_options),
            recv_flags,
        };
        self.transport.pull(target, &plan)?;

        let mountpoint = BTreeMap::from([(
            "mountpoint".to_string(),
            service.data_dir.display().to_string(),
        )]);
        self.zfs.set_properties(&service.dataset, &mountpoint)?;
        self.zfs.mount(&service.dataset)?;

        Ok(StrategyResult::Restored(RestoreEffect {
            created_dataset: !existed,
            detail: format!("received {} from {}", newest.name, target.target_host),
        }))
    }
}

//! Boot-time restore of a service's data directory.
//!
//! The orchestrator walks the service's configured restore methods in order
//! and stops at the first one that succeeds. Methods never run in parallel:
//! a later method only starts once the earlier one has failed or declared
//! itself not applicable. Once a method succeeds the data directory is
//! brought to the expected owner, group and mode, and the `ready_file`
//! startup gate is written.

mod archive;
mod local;
mod replica;

pub use archive::ArchiveRestore;
pub use local::LocalSnapshotRestore;
pub use replica::ReplicaRestore;

use crate::config::{RestoreMethod, ServiceConfig, WardenConfig};
use crate::error::{WardenError, WardenResult};
use crate::notify::{Event, EventKind, Notifier};
use crate::provider::{BackupRegistry, ReplicationTransport, SystemOps, ZfsProvider};
use log::{error, info, warn};
use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::sync::Arc;

/// Everything a strategy needs to know about the service being restored.
pub struct RestoreContext<'a> {
    pub config: &'a WardenConfig,
    pub service: &'a ServiceConfig,
}

/// What a successful strategy did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreEffect {
    /// The strategy created the dataset rather than reusing one.
    pub created_dataset: bool,
    pub detail: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StrategyResult {
    Restored(RestoreEffect),
    /// The method has nothing to restore from; the reason is recorded.
    NotApplicable(String),
}

/// One restore method.
pub trait RestoreStrategy: Send + Sync {
    fn method(&self) -> RestoreMethod;

    fn execute(&self, ctx: &RestoreContext<'_>) -> WardenResult<StrategyResult>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AttemptOutcome {
    Success(String),
    Failure(String),
    Skipped(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreAttempt {
    pub method: RestoreMethod,
    /// Position in the configured method list, starting at zero.
    pub order: usize,
    pub outcome: AttemptOutcome,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreState {
    NotStarted,
    Attempting(RestoreMethod),
    Succeeded(RestoreMethod),
    /// The data directory already held data; no method ran.
    AlreadyPopulated,
    AllFailed,
}

impl RestoreState {
    pub fn is_ready(&self) -> bool {
        matches!(
            self,
            RestoreState::Succeeded(_) | RestoreState::AlreadyPopulated
        )
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RestoreReport {
    pub service: String,
    pub state: RestoreState,
    pub attempts: Vec<RestoreAttempt>,
}

impl RestoreReport {
    /// Turn exhaustion into the startup-gate error.
    pub fn into_result(self) -> WardenResult<Self> {
        if self.state == RestoreState::AllFailed {
            return Err(WardenError::RestoreExhausted {
                service: self.service,
                attempts: self.attempts.len(),
            });
        }
        Ok(self)
    }
}

pub struct PreseedOrchestrator<Z: ZfsProvider, S: SystemOps> {
    config: Arc<WardenConfig>,
    zfs: Z,
    system: S,
    notifier: Arc<dyn Notifier>,
    strategies: BTreeMap<RestoreMethod, Box<dyn RestoreStrategy>>,
}

impl<Z: ZfsProvider, S: SystemOps> PreseedOrchestrator<Z, S> {
    pub fn new(config: Arc<WardenConfig>, zfs: Z, system: S, notifier: Arc<dyn Notifier>) -> Self {
        Self {
            config,
            zfs,
            system,
            notifier,
            strategies: BTreeMap::new(),
        }
    }

    /// Orchestrator with the replica, local snapshot and archive methods.
    pub fn with_standard_strategies<T, B>(
        config: Arc<WardenConfig>,
        zfs: Z,
        transport: T,
        registry: B,
        system: S,
        notifier: Arc<dyn Notifier>,
    ) -> Self
    where
        Z: Clone + Send + Sync + 'static,
        T: ReplicationTransport + Send + Sync + 'static,
        B: BackupRegistry + Send + Sync + 'static,
    {
        Self::new(config, zfs.clone(), system, notifier)
            .register(Box::new(ReplicaRestore::new(zfs.clone(), transport)))
            .register(Box::new(LocalSnapshotRestore::new(zfs.clone())))
            .register(Box::new(ArchiveRestore::new(zfs, registry)))
    }

    pub fn register(mut self, strategy: Box<dyn RestoreStrategy>) -> Self {
        self.strategies.insert(strategy.method(), strategy);
        self
    }

    pub fn restore(&self, service_name: &str) -> WardenResult<RestoreReport> {
        let service = self.config.service(service_name)?;
        let mut report = RestoreReport {
            service: service.name.clone(),
            state: RestoreState::NotStarted,
            attempts: Vec::new(),
        };

        if directory_populated(&service.data_dir)? {
            info!(
                "[{}] {} already holds data, nothing to restore",
                service.name,
                service.data_dir.display()
            );
            report.state = RestoreState::AlreadyPopulated;
            self.write_ready_file(service, &report)?;
            return Ok(report);
        }

        let ctx = RestoreContext {
            config: &self.config,
            service,
        };

        for (order, method) in service.restore_methods.iter().copied().enumerate() {
            report.state = RestoreState::Attempting(method);
            let Some(strategy) = self.strategies.get(&method) else {
                warn!("[{}] no strategy registered for {method}", service.name);
                report.attempts.push(RestoreAttempt {
                    method,
                    order,
                    outcome: AttemptOutcome::Skipped("no strategy registered".to_string()),
                });
                continue;
            };

            info!("[{}] attempting restore via {method}", service.name);
            match strategy.execute(&ctx) {
                Ok(StrategyResult::Restored(effect)) => {
                    info!("[{}] {method} succeeded: {}", service.name, effect.detail);
                    report.attempts.push(RestoreAttempt {
                        method,
                        order,
                        outcome: AttemptOutcome::Success(effect.detail.clone()),
                    });
                    self.finalize(service, &effect)?;
                    report.state = RestoreState::Succeeded(method);
                    self.write_ready_file(service, &report)?;
                    return Ok(report);
                }
                Ok(StrategyResult::NotApplicable(reason)) => {
                    info!("[{}] {method} skipped: {reason}", service.name);
                    report.attempts.push(RestoreAttempt {
                        method,
                        order,
                        outcome: AttemptOutcome::Skipped(reason),
                    });
                }
                Err(err) => {
                    warn!("[{}] {method} failed: {err}", service.name);
                    report.attempts.push(RestoreAttempt {
                        method,
                        order,
                        outcome: AttemptOutcome::Failure(err.to_string()),
                    });
                }
            }
        }

        report.state = RestoreState::AllFailed;
        error!(
            "[{}] every restore method failed ({} attempts)",
            service.name,
            report.attempts.len()
        );
        if let Some(ready) = &service.ready_file {
            if let Err(err) = remove_if_present(ready) {
                warn!(
                    "[{}] failed to remove ready file {}: {err}",
                    service.name,
                    ready.display()
                );
            }
        }
        self.notifier.notify(&Event::new(
            EventKind::RestoreExhausted,
            service.name.clone(),
            summarize(&report.attempts),
        ));
        Ok(report)
    }

    /// Apply steady-state properties to fresh datasets, then fix ownership
    /// and mode of the data directory.
    fn finalize(&self, service: &ServiceConfig, effect: &RestoreEffect) -> WardenResult<()> {
        if effect.created_dataset && !service.properties.is_empty() {
            self.zfs
                .set_properties(&service.dataset, &service.properties)?;
        }
        fs::create_dir_all(&service.data_dir)?;
        self.system
            .chown_recursive(&service.data_dir, &service.owner, &service.group)?;
        fs::set_permissions(
            &service.data_dir,
            fs::Permissions::from_mode(service.mode_bits()?),
        )?;
        Ok(())
    }

    fn write_ready_file(&self, service: &ServiceConfig, report: &RestoreReport) -> WardenResult<()> {
        let Some(ready) = &service.ready_file else {
            return Ok(());
        };
        if let Some(parent) = ready.parent() {
            fs::create_dir_all(parent)?;
        }
        let detail = match report.state {
            RestoreState::Succeeded(method) => method.as_str(),
            _ => "already-populated",
        };
        fs::write(ready, format!("{detail}\n"))?;
        Ok(())
    }
}

fn directory_populated(dir: &Path) -> WardenResult<bool> {
    match fs::read_dir(dir) {
        Ok(mut entries) => Ok(entries.next().is_some()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(false),
        Err(err) => Err(err.into()),
    }
}

fn remove_if_present(path: &Path) -> WardenResult<()> {
    match fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(err) if err.kind() == ErrorKind::NotFound => Ok(()),
        Err(err) => Err(err.into()),
    }
}

fn summarize(attempts: &[RestoreAttempt]) -> String {
    attempts
        .iter()
        .map(|attempt| match &attempt.outcome {
            AttemptOutcome::Success(detail) => format!("{}: ok ({detail})", attempt.method),
            AttemptOutcome::Failure(reason) => format!("{}: failed ({reason})", attempt.method),
            AttemptOutcome::Skipped(reason) => format!("{}: skipped ({reason})", attempt.method),
        })
        .collect::<Vec<_>>()
        .join("; ")
}

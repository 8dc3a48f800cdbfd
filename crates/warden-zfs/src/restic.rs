//! Backup registry backed by systemd units and the restic CLI.

use crate::command::CommandRunner;
use crate::system::resolve_binary;
use log::{debug, info};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use warden_core::config::{BackupJob, WardenConfig};
use warden_core::error::{WardenError, WardenResult};
use warden_core::provider::{ArchiveRequest, BackupRegistry};

pub const DEFAULT_SYSTEMCTL_PATHS: &[&str] = &["/usr/bin/systemctl", "/bin/systemctl"];
pub const DEFAULT_RESTIC_PATHS: &[&str] = &[
    "/usr/bin/restic",
    "/usr/local/bin/restic",
    "/run/current-system/sw/bin/restic",
];

/// Unit states that mean the job is still touching its datasets.
const BUSY_STATES: &[&str] = &["active", "activating", "deactivating", "reloading"];

#[derive(Debug, Clone)]
pub struct SystemdBackupRegistry {
    jobs: Vec<BackupJob>,
    systemctl: CommandRunner,
    restic: Option<PathBuf>,
    restore_timeout: Duration,
}

impl SystemdBackupRegistry {
    /// restic is resolved lazily, so hosts without archives need not have it.
    pub fn from_config(config: &WardenConfig) -> WardenResult<Self> {
        let systemctl = resolve_binary(
            config.backup.systemctl_path.as_ref().map(PathBuf::from),
            DEFAULT_SYSTEMCTL_PATHS,
            "systemctl",
        )?;
        let restic = resolve_binary(
            config.backup.restic_path.as_ref().map(PathBuf::from),
            DEFAULT_RESTIC_PATHS,
            "restic",
        )
        .ok();
        Ok(Self {
            jobs: config.backup_jobs.values().cloned().collect(),
            systemctl: CommandRunner::new(
                systemctl,
                Duration::from_secs(config.backup.query_timeout_secs),
            ),
            restic,
            restore_timeout: Duration::from_secs(config.backup.restore_timeout_secs),
        })
    }

    fn restic(&self) -> WardenResult<&Path> {
        self.restic.as_deref().ok_or_else(|| {
            WardenError::InvalidConfig(format!(
                "restic binary not found; set backup.restic_path (tried {DEFAULT_RESTIC_PATHS:?})"
            ))
        })
    }
}

/// Parse a systemd-style environment file: `KEY=value` lines, optional
/// `export ` prefix, optional surrounding quotes, `#` comments.
pub fn parse_env_file(contents: &str) -> Vec<(String, String)> {
    contents
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .filter_map(|line| {
            let line = line.strip_prefix("export ").unwrap_or(line);
            let (key, value) = line.split_once('=')?;
            let key = key.trim();
            if key.is_empty() {
                return None;
            }
            let value = value.trim();
            let value = value
                .strip_prefix('"')
                .and_then(|v| v.strip_suffix('"'))
                .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
                .unwrap_or(value);
            Some((key.to_string(), value.to_string()))
        })
        .collect()
}

fn restore_args(request: &ArchiveRequest) -> Vec<String> {
    let source = &request.source;
    let mut args = vec!["-r".to_string(), source.repository.clone()];
    if let Some(password_file) = &source.password_file {
        args.push("--password-file".to_string());
        args.push(password_file.display().to_string());
    }
    args.push("restore".to_string());
    args.push(source.snapshot.clone());
    args.push("--target".to_string());
    args.push("/".to_string());
    args.push("--include".to_string());
    args.push(request.data_dir.display().to_string());
    for tag in &source.tags {
        args.push("--tag".to_string());
        args.push(tag.clone());
    }
    if let Some(host) = &source.host {
        args.push("--host".to_string());
        args.push(host.clone());
    }
    args
}

impl BackupRegistry for SystemdBackupRegistry {
    fn running_jobs(&self) -> WardenResult<Vec<BackupJob>> {
        if self.jobs.is_empty() {
            return Ok(Vec::new());
        }
        let mut args = vec!["is-active".to_string()];
        args.extend(self.jobs.iter().map(|job| job.unit.clone()));
        // is-active exits non-zero whenever any unit is inactive; the
        // per-unit states on stdout are what matter.
        let out = self.systemctl.run(&args, None)?;
        let states: Vec<&str> = out.stdout.lines().map(str::trim).collect();
        if states.len() != self.jobs.len() {
            return Err(WardenError::Provider(format!(
                "systemctl is-active returned {} states for {} units: {}",
                states.len(),
                self.jobs.len(),
                out.diagnostic()
            )));
        }
        let running: Vec<BackupJob> = self
            .jobs
            .iter()
            .zip(states)
            .filter(|(_, state)| BUSY_STATES.contains(state))
            .map(|(job, _)| job.clone())
            .collect();
        debug!("{} of {} backup jobs running", running.len(), self.jobs.len());
        Ok(running)
    }

    fn restore_archive(&self, request: &ArchiveRequest) -> WardenResult<()> {
        let mut runner = CommandRunner::new(self.restic()?.to_path_buf(), self.restore_timeout);
        if let Some(env_file) = &request.source.env_file {
            for (key, value) in parse_env_file(&fs::read_to_string(env_file)?) {
                runner = runner.with_env(key, value);
            }
        }
        runner.run_checked(&restore_args(request))?;
        info!(
            "restored {} from {} into {}",
            request.source.snapshot,
            request.source.repository,
            request.data_dir.display()
        );
        Ok(())
    }
}

//! `ZfsProvider` backed by the host's `zfs` and `zpool` binaries.

use crate::command::{discover, CommandRunner, Output};
use crate::parse::{is_missing_dataset, parse_holds, parse_pools, parse_snapshots, SNAPSHOT_COLUMNS};
use log::info;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::time::Duration;
use warden_core::config::WardenConfig;
use warden_core::error::{WardenError, WardenResult};
use warden_core::provider::{Hold, PoolStatus, SnapshotInfo, ZfsProvider};

/// Where `zfs` is looked for when the configuration does not name it.
pub const DEFAULT_ZFS_PATHS: &[&str] = &[
    "/sbin/zfs",
    "/usr/sbin/zfs",
    "/usr/local/sbin/zfs",
    "/bin/zfs",
];

pub const DEFAULT_ZPOOL_PATHS: &[&str] = &[
    "/sbin/zpool",
    "/usr/sbin/zpool",
    "/usr/local/sbin/zpool",
    "/bin/zpool",
];

/// Snapshot names per `zfs holds` call, keeping argv well under ARG_MAX.
pub const HOLDS_BATCH: usize = 256;

#[derive(Debug, Clone)]
pub struct SystemZfsProvider {
    zfs_runner: CommandRunner,
    zpool_runner: CommandRunner,
}

impl SystemZfsProvider {
    pub fn from_config(config: &WardenConfig) -> WardenResult<Self> {
        let timeout = config.zfs_timeout();
        let zfs = resolve_binary(config.zfs_binary_path(), DEFAULT_ZFS_PATHS, "zfs")?;
        let zpool = resolve_binary(config.zpool_binary_path(), DEFAULT_ZPOOL_PATHS, "zpool")?;
        Ok(Self::with_paths(zfs, zpool, timeout))
    }

    pub fn with_paths(zfs_path: PathBuf, zpool_path: PathBuf, timeout: Duration) -> Self {
        Self {
            zfs_runner: CommandRunner::new(zfs_path, timeout),
            zpool_runner: CommandRunner::new(zpool_path, timeout),
        }
    }

    fn run_checked_zfs(&self, args: &[String]) -> WardenResult<Output> {
        self.zfs_runner.run_checked(args)
    }

    fn snapshot_listing(&self, dataset: &str, recursive: bool) -> WardenResult<Vec<SnapshotInfo>> {
        let mut args = strings(&[
            "list", "-H", "-p", "-t", "snapshot", "-o", SNAPSHOT_COLUMNS, "-s", "creation",
        ]);
        if recursive {
            args.push("-r".into());
        } else {
            args.extend(strings(&["-d", "1"]));
        }
        args.push(dataset.to_string());

        let out = self.zfs_runner.run(&args, None)?;
        if !out.success() {
            if is_missing_dataset(out.diagnostic()) {
                return Ok(Vec::new());
            }
            return Err(cli_error("zfs", &args, &out));
        }
        let snapshots = parse_snapshots(&out.stdout);
        if recursive {
            return Ok(snapshots);
        }
        Ok(snapshots
            .into_iter()
            .filter(|snap| snap.dataset() == dataset)
            .collect())
    }
}

/// Explicit path when configured and present, otherwise the first default
/// location that exists.
pub(crate) fn resolve_binary(
    configured: Option<PathBuf>,
    defaults: &[&str],
    name: &str,
) -> WardenResult<PathBuf> {
    match configured {
        Some(path) if path.exists() => Ok(path),
        Some(path) => Err(WardenError::InvalidConfig(format!(
            "{name} binary not found at {}",
            path.display()
        ))),
        None => discover(defaults).ok_or_else(|| {
            WardenError::InvalidConfig(format!(
                "unable to locate {name} binary; tried {defaults:?}"
            ))
        }),
    }
}

pub(crate) fn strings(args: &[&str]) -> Vec<String> {
    args.iter().map(|arg| arg.to_string()).collect()
}

fn property_args(properties: &BTreeMap<String, String>, flag: Option<&str>) -> Vec<String> {
    let mut args = Vec::new();
    for (key, value) in properties {
        if let Some(flag) = flag {
            args.push(flag.to_string());
        }
        args.push(format!("{key}={value}"));
    }
    args
}

fn cli_error(binary: &str, args: &[String], out: &Output) -> WardenError {
    let diagnostic = out.diagnostic();
    WardenError::Provider(format!(
        "{binary} {} exited with code {}: {}",
        args.join(" "),
        out.status,
        if diagnostic.is_empty() {
            "no additional output"
        } else {
            diagnostic
        }
    ))
}

impl ZfsProvider for SystemZfsProvider {
    fn dataset_exists(&self, dataset: &str) -> WardenResult<bool> {
        let args = strings(&["list", "-H", "-o", "name", dataset]);
        let out = self.zfs_runner.run(&args, None)?;
        if out.success() {
            return Ok(true);
        }
        if is_missing_dataset(out.diagnostic()) {
            return Ok(false);
        }
        Err(cli_error("zfs", &args, &out))
    }

    fn list_snapshots(&self, dataset: &str) -> WardenResult<Vec<SnapshotInfo>> {
        self.snapshot_listing(dataset, false)
    }

    fn list_snapshots_recursive(&self, root: &str) -> WardenResult<Vec<SnapshotInfo>> {
        self.snapshot_listing(root, true)
    }

    fn create_snapshot(&self, dataset: &str, name: &str, recursive: bool) -> WardenResult<()> {
        let mut args = vec!["snapshot".to_string()];
        if recursive {
            args.push("-r".into());
        }
        args.push(format!("{dataset}@{name}"));
        self.run_checked_zfs(&args)?;
        Ok(())
    }

    fn destroy_snapshot(&self, snapshot: &str, recursive: bool) -> WardenResult<()> {
        if !snapshot.contains('@') {
            return Err(WardenError::Provider(format!(
                "refusing to destroy `{snapshot}`: not a snapshot name"
            )));
        }
        let mut args = vec!["destroy".to_string()];
        if recursive {
            args.push("-r".into());
        }
        args.push(snapshot.to_string());
        self.run_checked_zfs(&args)?;
        Ok(())
    }

    fn holds(&self, snapshots: &[String]) -> WardenResult<Vec<Hold>> {
        if snapshots.is_empty() {
            return Ok(Vec::new());
        }
        let mut holds = Vec::new();
        for batch in snapshots.chunks(HOLDS_BATCH) {
            let mut args = strings(&["holds", "-H", "-p"]);
            args.extend(batch.iter().cloned());
            let out = self.run_checked_zfs(&args)?;
            holds.extend(parse_holds(&out.stdout));
        }
        Ok(holds)
    }

    fn release_hold(&self, hold: &Hold) -> WardenResult<()> {
        let args = strings(&["release", &hold.tag, &hold.snapshot]);
        self.run_checked_zfs(&args)?;
        info!("released hold {} on {}", hold.tag, hold.snapshot);
        Ok(())
    }

    fn create_dataset(
        &self,
        dataset: &str,
        properties: &BTreeMap<String, String>,
    ) -> WardenResult<()> {
        let mut args = strings(&["create", "-p"]);
        args.extend(property_args(properties, Some("-o")));
        args.push(dataset.to_string());
        self.run_checked_zfs(&args)?;
        Ok(())
    }

    fn set_properties(
        &self,
        dataset: &str,
        properties: &BTreeMap<String, String>,
    ) -> WardenResult<()> {
        if properties.is_empty() {
            return Ok(());
        }
        let mut args = vec!["set".to_string()];
        args.extend(property_args(properties, None));
        args.push(dataset.to_string());
        self.run_checked_zfs(&args)?;
        Ok(())
    }

    fn mount(&self, dataset: &str) -> WardenResult<()> {
        let args = strings(&["mount", dataset]);
        let out = self.zfs_runner.run(&args, None)?;
        if out.success() || out.diagnostic().contains("already mounted") {
            return Ok(());
        }
        Err(cli_error("zfs", &args, &out))
    }

    fn clone_snapshot(&self, snapshot: &str, target: &str) -> WardenResult<()> {
        self.run_checked_zfs(&strings(&["clone", snapshot, target]))?;
        Ok(())
    }

    fn promote(&self, dataset: &str) -> WardenResult<()> {
        self.run_checked_zfs(&strings(&["promote", dataset]))?;
        Ok(())
    }

    fn rollback(&self, snapshot: &str) -> WardenResult<()> {
        self.run_checked_zfs(&strings(&["rollback", "-r", snapshot]))?;
        Ok(())
    }

    fn pools(&self) -> WardenResult<Vec<PoolStatus>> {
        let out = self
            .zpool_runner
            .run_checked(&["list", "-H", "-o", "name,health"])?;
        Ok(parse_pools(&out.stdout))
    }
}

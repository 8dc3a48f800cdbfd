//! zfs-warden command-line interface: one-shot runs, the preseed gate, and reporting.

use anyhow::{bail, Context, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use log::{info, warn};
use schemars::schema_for;
use serde_json::to_string_pretty;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use warden_core::{
    health::HealthReport,
    logging,
    metrics::read_textfile_dir,
    preseed::{AttemptOutcome, RestoreReport},
    resolve,
    scheduler::DatasetOutcome,
    status::{build_report, render_table},
    trust::{pinned_fingerprints, render_known_hosts},
    HealthProbe, HoldManager, PreseedOrchestrator, ReplicationEngine, ReplicationOutcome,
    SnapshotScheduler, StatusFilter, WardenConfig, WardenError,
};
use warden_zfs::{
    notifier_from_config, SshTransport, SystemHost, SystemZfsProvider, SystemdBackupRegistry,
};

const DEFAULT_CONFIG: &str = "/etc/zfs-warden.toml";

#[derive(Parser, Debug)]
#[command(
    name = "warden",
    version,
    about = "Snapshot, replication and restore coordination for ZFS hosts."
)]
struct Cli {
    /// Path to the zfs-warden configuration file.
    #[arg(short, long, default_value = DEFAULT_CONFIG)]
    config: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Take due snapshots and prune expired ones.
    Snapshot {
        /// Only this configured dataset; defaults to every dataset.
        dataset: Option<String>,
    },

    /// Release replication holds older than the configured maximum age.
    ReleaseHolds,

    /// Replicate one dataset, or every replicated dataset with --all.
    Replicate {
        dataset: Option<String>,

        #[arg(long, conflicts_with = "dataset")]
        all: bool,
    },

    /// Restore a service's data directory before the service starts.
    Preseed {
        /// Service name from the `services` table.
        service: String,
    },

    /// Show which replication target a dataset resolves to.
    Resolve { dataset: String },

    /// Probe pools, replication targets and replication lag.
    Health,

    /// Summarise replication jobs from the metrics textfile directory.
    Status {
        /// Case-insensitive dataset filter.
        #[arg(long)]
        dataset: Option<String>,

        /// Case-insensitive target host filter.
        #[arg(long)]
        target: Option<String>,

        #[arg(long)]
        json: bool,
    },

    /// Validate a configuration file or emit the config schema.
    Validate {
        /// Path to the configuration file to validate.
        #[arg(short = 'f', long, default_value = DEFAULT_CONFIG)]
        file: PathBuf,

        /// Output the JSON schema instead of validating a file.
        #[arg(long)]
        schema: bool,
    },

    /// Render a known_hosts file from the configured host key pins.
    PinHosts {
        /// Write to this file instead of stdout.
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
}

fn main() {
    if let Err(err) = run() {
        eprintln!("error: {err:#}");
        std::process::exit(1);
    }
}

fn run() -> Result<()> {
    logging::init("info");
    let cli = Cli::parse();
    let config_path = cli.config;

    match cli.command {
        Commands::Validate { file, schema } => {
            if schema {
                let schema = schema_for!(WardenConfig);
                println!("{}", to_string_pretty(&schema)?);
                return Ok(());
            }
            match WardenConfig::load(&file) {
                Ok(cfg) => {
                    println!(
                        "Configuration valid ({} datasets, {} services).",
                        cfg.datasets.len(),
                        cfg.services.len()
                    );
                }
                Err(WardenError::ConfigIssues(issues)) => {
                    eprintln!("Configuration validation failed:");
                    for issue in issues {
                        eprintln!("  - {issue}");
                    }
                    std::process::exit(1);
                }
                Err(err) => {
                    return Err(err)
                        .with_context(|| format!("failed to load configuration from {}", file.display()))
                }
            }
        }
        Commands::Resolve { dataset } => {
            let config = load_config(&config_path)?;
            match resolve(&dataset, &config.datasets) {
                Some(resolved) => {
                    let target = resolved.target;
                    println!("{dataset} replicates via {}", resolved.ancestor.path);
                    println!("  target:  {}", target.destination());
                    println!("  remote:  {}", resolved.remote_dataset);
                    if !resolved.suffix.is_empty() {
                        println!("  suffix:  {}", resolved.suffix);
                    }
                }
                None => println!("{dataset} has no replication target"),
            }
        }
        Commands::PinHosts { output } => {
            let config = load_config(&config_path)?;
            let rendered = render_known_hosts(&config);
            for (host, fp) in pinned_fingerprints(&config) {
                info!("pinning {host} {fp}");
            }
            match output {
                Some(path) => {
                    fs::write(&path, rendered)
                        .with_context(|| format!("write {}", path.display()))?;
                    println!("Wrote pinned host keys to {}", path.display());
                }
                None => print!("{rendered}"),
            }
        }
        Commands::Status {
            dataset,
            target,
            json,
        } => {
            let config = load_config(&config_path)?;
            let dir = &config.metrics.textfile_dir;
            let samples = read_textfile_dir(dir)
                .with_context(|| format!("read metrics from {}", dir.display()))?;
            let now = Utc::now();
            let report = build_report(
                &samples,
                &StatusFilter { dataset, target },
                now,
                config.metrics.stale_threshold_hours,
            );
            if json {
                println!("{}", to_string_pretty(&report)?);
            } else {
                print!("{}", render_table(&report, now));
            }
        }
        Commands::Snapshot { dataset } => {
            let config = Arc::new(load_config(&config_path)?);
            let zfs = SystemZfsProvider::from_config(&config)?;
            let scheduler = SnapshotScheduler::new(
                config.clone(),
                zfs,
                SystemHost::from_config(&config),
                notifier_from_config(&config),
            );
            let now = Utc::now();
            let outcomes = match dataset {
                Some(ds) => vec![scheduler.run_dataset(config.dataset(&ds)?, now)],
                None => scheduler.tick(now).outcomes,
            };
            let failed = outcomes.iter().filter(|o| o.error.is_some()).count();
            for outcome in &outcomes {
                print_snapshot_outcome(outcome);
            }
            if failed > 0 {
                bail!("{failed} dataset(s) failed");
            }
        }
        Commands::ReleaseHolds => {
            let config = Arc::new(load_config(&config_path)?);
            let zfs = SystemZfsProvider::from_config(&config)?;
            let registry = SystemdBackupRegistry::from_config(&config)?;
            let report = HoldManager::new(config, zfs, registry).release_stale_holds(Utc::now())?;
            for hold in &report.released {
                println!("released {} on {}", hold.tag, hold.snapshot);
            }
            for hold in &report.deferred {
                println!("deferred {} on {} (backup running)", hold.tag, hold.snapshot);
            }
            println!(
                "{} released, {} deferred, {} still active",
                report.released.len(),
                report.deferred.len(),
                report.active
            );
        }
        Commands::Replicate { dataset, all } => {
            let config = Arc::new(load_config(&config_path)?);
            let engine = ReplicationEngine::new(
                config.clone(),
                SystemZfsProvider::from_config(&config)?,
                SshTransport::from_config(&config)?,
                SystemdBackupRegistry::from_config(&config)?,
                notifier_from_config(&config),
            );
            let now = Utc::now();
            let results = match (dataset, all) {
                (Some(ds), _) => {
                    let result = engine.replicate(&ds, now);
                    vec![(ds, result)]
                }
                (None, true) => engine.replicate_all(now),
                (None, false) => bail!("pass a dataset or --all"),
            };
            let mut failed = 0;
            for (ds, result) in results {
                match result {
                    Ok(ReplicationOutcome::Unconfigured) => {
                        println!("{ds}: no replication target configured")
                    }
                    Ok(ReplicationOutcome::UpToDate { job, snapshot }) => println!(
                        "{ds}: {}:{} already at {snapshot}",
                        job.target_host, job.remote_dataset
                    ),
                    Ok(ReplicationOutcome::Transferred { job, plan }) => {
                        let mode = match &plan.incremental_from {
                            Some(base) => format!("incremental from {base}"),
                            None => "full".to_string(),
                        };
                        println!(
                            "{ds}: sent {} to {}:{} ({mode})",
                            plan.source_snapshot, job.target_host, job.remote_dataset
                        );
                    }
                    Err(err) if err.is_transient() => warn!("{ds}: skipped: {err}"),
                    Err(err) => {
                        failed += 1;
                        eprintln!("{ds}: {err}");
                    }
                }
            }
            if failed > 0 {
                bail!("{failed} replication job(s) failed");
            }
        }
        Commands::Preseed { service } => {
            let config = Arc::new(load_config(&config_path)?);
            let orchestrator = PreseedOrchestrator::with_standard_strategies(
                config.clone(),
                SystemZfsProvider::from_config(&config)?,
                SshTransport::from_config(&config)?,
                SystemdBackupRegistry::from_config(&config)?,
                SystemHost::from_config(&config),
                notifier_from_config(&config),
            );
            let report = orchestrator.restore(&service)?;
            print_restore_report(&report);
            report.into_result()?;
        }
        Commands::Health => {
            let config = Arc::new(load_config(&config_path)?);
            let probe = HealthProbe::new(
                config.clone(),
                SystemZfsProvider::from_config(&config)?,
                SshTransport::from_config(&config)?,
                notifier_from_config(&config),
            );
            let report = probe.run(Utc::now());
            print_health_report(&report);
            if !report.pools_healthy() || !report.errors.is_empty() {
                bail!("health check reported problems");
            }
        }
    }

    Ok(())
}

fn load_config(path: &Path) -> Result<WardenConfig> {
    WardenConfig::load(path)
        .with_context(|| format!("failed to load configuration from {}", path.display()))
}

fn print_snapshot_outcome(outcome: &DatasetOutcome) {
    if let Some(err) = &outcome.error {
        println!("{}: FAILED {err}", outcome.dataset);
        return;
    }
    println!(
        "{}: {} created, {} pruned",
        outcome.dataset,
        outcome.created.len(),
        outcome.pruned.len()
    );
    for name in &outcome.created {
        println!("  + {name}");
    }
    for name in &outcome.pruned {
        println!("  - {name}");
    }
    for name in &outcome.retained_held {
        println!("  ~ {name} (held)");
    }
}

fn print_restore_report(report: &RestoreReport) {
    println!("{}: {:?}", report.service, report.state);
    for attempt in &report.attempts {
        let (tag, detail) = match &attempt.outcome {
            AttemptOutcome::Success(detail) => ("OK", detail),
            AttemptOutcome::Failure(detail) => ("ERR", detail),
            AttemptOutcome::Skipped(detail) => ("SKIP", detail),
        };
        println!(
            "  {}. [{tag}] {}: {detail}",
            attempt.order + 1,
            attempt.method.as_str()
        );
    }
}

fn print_health_report(report: &HealthReport) {
    println!("{:<24} {}", "POOL", "HEALTH");
    for pool in &report.pools {
        println!("{:<24} {}", pool.name, pool.health);
    }
    if !report.targets.is_empty() {
        println!();
        println!("{:<32} {}", "TARGET", "REACHABLE");
        for target in &report.targets {
            match &target.error {
                Some(err) => println!("{:<32} no ({err})", target.host),
                None => println!("{:<32} yes", target.host),
            }
        }
    }
    if !report.lag.is_empty() {
        println!();
        println!("{:<40} {}", "DATASET", "LAG (s)");
        for sample in &report.lag {
            println!("{:<40} {}", sample.dataset, sample.seconds);
        }
    }
    for err in &report.errors {
        eprintln!("  - {err}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn replicate_takes_a_dataset_or_all() {
        let cli = Cli::try_parse_from(["warden", "replicate", "--all"]).unwrap();
        assert!(matches!(
            cli.command,
            Commands::Replicate {
                dataset: None,
                all: true
            }
        ));
        assert!(Cli::try_parse_from(["warden", "replicate", "tank/app", "--all"]).is_err());
    }

    #[test]
    fn status_filters_parse() {
        let cli = Cli::try_parse_from([
            "warden", "-c", "/tmp/w.toml", "status", "--dataset", "tank", "--json",
        ])
        .unwrap();
        assert_eq!(cli.config, PathBuf::from("/tmp/w.toml"));
        match cli.command {
            Commands::Status {
                dataset,
                target,
                json,
            } => {
                assert_eq!(dataset.as_deref(), Some("tank"));
                assert!(target.is_none());
                assert!(json);
            }
            other => panic!("unexpected command {other:?}"),
        }
    }
}

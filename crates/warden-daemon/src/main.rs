use anyhow::{Context, Result};
use chrono::Utc;
use log::{error, info, warn};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::io::AsyncWriteExt;
use tokio::{
    net::TcpListener,
    select, signal,
    sync::watch,
    task,
    time::{interval, Duration, MissedTickBehavior},
};
use warden_core::{
    config::WardenConfig, logging, HealthProbe, HoldManager, ReplicationEngine, ReplicationOutcome,
    SnapshotScheduler,
};
use warden_zfs::{
    notifier_from_config, SshTransport, SystemHost, SystemZfsProvider, SystemdBackupRegistry,
};

const DEFAULT_CONFIG: &str = "/etc/zfs-warden.toml";
const DEFAULT_HEALTH_ADDR: &str = "127.0.0.1:8788";

#[tokio::main(flavor = "multi_thread")]
async fn main() {
    if let Err(err) = run().await {
        error!("daemon exit: {err:?}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    logging::init("info");
    let config_path =
        std::env::var("WARDEN_CONFIG").unwrap_or_else(|_| DEFAULT_CONFIG.to_string());
    let config = Arc::new(
        WardenConfig::load(&config_path).with_context(|| format!("load config {config_path}"))?,
    );

    info!("zfs-warden daemon booting (config: {config_path})");

    let zfs = SystemZfsProvider::from_config(&config).context("initialise zfs provider")?;
    let transport = SshTransport::from_config(&config).context("initialise ssh transport")?;
    let registry =
        SystemdBackupRegistry::from_config(&config).context("initialise backup registry")?;
    let host = SystemHost::from_config(&config);
    let notifier = notifier_from_config(&config);

    let scheduler = Arc::new(SnapshotScheduler::new(
        config.clone(),
        zfs.clone(),
        host,
        notifier.clone(),
    ));
    let holds = Arc::new(HoldManager::new(
        config.clone(),
        zfs.clone(),
        registry.clone(),
    ));
    let replication = Arc::new(ReplicationEngine::new(
        config.clone(),
        zfs.clone(),
        transport.clone(),
        registry,
        notifier.clone(),
    ));
    let health = Arc::new(HealthProbe::new(config.clone(), zfs, transport, notifier));

    // true once the last probe saw every pool healthy
    let (health_tx, health_rx) = watch::channel(false);
    let health_tx = Arc::new(health_tx);
    let schedule = &config.schedule;

    let snapshot_handle = tokio::spawn(every(
        "snapshot",
        Duration::from_secs(schedule.snapshot_interval_secs),
        move || {
            let report = scheduler.tick(Utc::now());
            let created: usize = report.outcomes.iter().map(|o| o.created.len()).sum();
            let pruned: usize = report.outcomes.iter().map(|o| o.pruned.len()).sum();
            info!(
                "snapshot tick: {} datasets, {created} created, {pruned} pruned, {} failed",
                report.outcomes.len(),
                report.failures()
            );
        },
    ));

    let holds_handle = tokio::spawn(every(
        "hold-gc",
        Duration::from_secs(schedule.hold_gc_interval_secs),
        move || match holds.release_stale_holds(Utc::now()) {
            Ok(report) => info!(
                "hold gc: {} released, {} deferred, {} active",
                report.released.len(),
                report.deferred.len(),
                report.active
            ),
            Err(err) => warn!("hold gc failed: {err}"),
        },
    ));

    let replication_handle = tokio::spawn(every(
        "replication",
        Duration::from_secs(schedule.replication_interval_secs),
        move || {
            for (dataset, result) in replication.replicate_all(Utc::now()) {
                match result {
                    Ok(ReplicationOutcome::Transferred { plan, .. }) => {
                        info!("{dataset}: replicated {}", plan.source_snapshot)
                    }
                    Ok(ReplicationOutcome::UpToDate { snapshot, .. }) => {
                        info!("{dataset}: up to date at {snapshot}")
                    }
                    Ok(ReplicationOutcome::Unconfigured) => {}
                    Err(err) if err.is_transient() => info!("{dataset}: skipped: {err}"),
                    Err(err) => warn!("{dataset}: replication failed: {err}"),
                }
            }
        },
    ));

    let probe_handle = tokio::spawn(every(
        "health",
        Duration::from_secs(schedule.health_interval_secs),
        move || {
            let report = health.run(Utc::now());
            let pools_probed = !report.errors.iter().any(|e| e.starts_with("pools:"));
            let _ = health_tx.send(pools_probed && report.pools_healthy());
            for err in &report.errors {
                warn!("health probe: {err}");
            }
        },
    ));

    let server_handle = tokio::spawn(health_server(health_rx));

    select! {
        res = snapshot_handle => res??,
        res = holds_handle => res??,
        res = replication_handle => res??,
        res = probe_handle => res??,
        res = server_handle => res??,
        _ = signal::ctrl_c() => {
            info!("received shutdown signal");
        }
    }

    Ok(())
}

/// Run `work` on the blocking pool once per `period`. A tick that overruns
/// swallows the ticks it missed.
async fn every<F>(name: &'static str, period: Duration, work: F) -> Result<()>
where
    F: Fn() + Send + Sync + 'static,
{
    let work = Arc::new(work);
    let mut ticker = interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
    loop {
        ticker.tick().await;
        let job = work.clone();
        if let Err(err) = task::spawn_blocking(move || job()).await {
            error!("{name} tick aborted: {err}");
        }
    }
}

fn health_response(healthy: bool) -> String {
    let (status, body) = if healthy {
        ("200 OK", "OK")
    } else {
        ("503 Service Unavailable", "DEGRADED")
    };
    format!(
        "HTTP/1.1 {status}\r\ncontent-type: text/plain\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{body}",
        body.len()
    )
}

async fn health_server(status_rx: watch::Receiver<bool>) -> Result<()> {
    let addr: SocketAddr = std::env::var("WARDEN_HEALTH_ADDR")
        .unwrap_or_else(|_| DEFAULT_HEALTH_ADDR.to_string())
        .parse()
        .context("parse WARDEN_HEALTH_ADDR")?;

    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind health endpoint {addr}"))?;
    info!("health endpoint listening on http://{addr}");

    loop {
        let (mut stream, peer) = listener.accept().await?;
        let healthy = *status_rx.borrow();
        if let Err(err) = stream.write_all(health_response(healthy).as_bytes()).await {
            warn!("failed to respond to {peer}: {err}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn health_response_reflects_pool_state() {
        let ok = health_response(true);
        assert!(ok.starts_with("HTTP/1.1 200 OK"));
        assert!(ok.ends_with("\r\n\r\nOK"));

        let degraded = health_response(false);
        assert!(degraded.starts_with("HTTP/1.1 503"));
        assert!(degraded.contains("content-length: 8"));
        assert!(degraded.ends_with("DEGRADED"));
    }
}

#![cfg(unix)]

mod common;

use common::{config, read, test_lock, write_script, EnvGuard, STATE_ENV};
use std::path::PathBuf;
use std::time::Duration;
use tempfile::tempdir;
use warden_core::config::ArchiveSource;
use warden_core::error::WardenError;
use warden_core::notify::{Event, EventKind, Notifier};
use warden_core::provider::{ArchiveRequest, BackupRegistry, HookPhase, HookRunner};
use warden_zfs::{CommandNotifier, SystemHost, SystemdBackupRegistry};

const FAKE_SYSTEMCTL: &str = r#"#!/bin/sh
shift
for unit in "$@"; do
  case "$unit" in
  *media*) echo activating ;;
  *) echo inactive ;;
  esac
done
exit 3
"#;

const FAKE_RESTIC: &str = r#"#!/bin/sh
echo "$*" > "$FAKE_STATE/restic.args"
echo "$RESTIC_PASSWORD" > "$FAKE_STATE/restic.env"
"#;

const JOBS: &str = r#"
[backup_jobs.media]
unit = "restic-backups-media.service"
datasets = ["tank/media"]

[backup_jobs.services]
unit = "restic-backups-services.service"
datasets = ["tank/services"]
"#;

fn host() -> SystemHost {
    SystemHost::new(
        Duration::from_secs(5),
        PathBuf::from("chown"),
        Duration::from_secs(5),
    )
}

#[test]
fn hooks_receive_dataset_and_phase() {
    let _guard = test_lock();
    let dir = tempdir().unwrap();
    let _state = EnvGuard::set(STATE_ENV, dir.path().display().to_string());
    let hook = write_script(
        dir.path(),
        "pause-db",
        "#!/bin/sh\necho \"$WARDEN_HOOK_PHASE $WARDEN_DATASET\" >> \"$FAKE_STATE/hook.log\"\n",
    );

    host().run_hook(&hook, HookPhase::Pre, "tank/db").unwrap();
    host().run_hook(&hook, HookPhase::Post, "tank/db").unwrap();
    assert_eq!(read(dir.path(), "hook.log"), "pre tank/db\npost tank/db\n");
}

#[test]
fn failing_hook_reports_phase_and_status() {
    let _guard = test_lock();
    let dir = tempdir().unwrap();
    let hook = write_script(dir.path(), "broken", "#!/bin/sh\necho nope >&2\nexit 3\n");
    let err = host().run_hook(&hook, HookPhase::Pre, "tank/db").unwrap_err();
    match err {
        WardenError::Hook { phase, reason, .. } => {
            assert_eq!(phase, "pre");
            assert!(reason.contains("exit status 3"), "{reason}");
            assert!(reason.contains("nope"));
        }
        other => panic!("expected hook error, got {other:?}"),
    }
}

#[test]
fn command_notifier_passes_event_in_environment() {
    let _guard = test_lock();
    let dir = tempdir().unwrap();
    let _state = EnvGuard::set(STATE_ENV, dir.path().display().to_string());
    let command = write_script(
        dir.path(),
        "notify",
        "#!/bin/sh\necho \"$WARDEN_EVENT|$WARDEN_SUBJECT|$WARDEN_MESSAGE\" > \"$FAKE_STATE/event\"\n",
    );
    let notifier = CommandNotifier::new(command, Duration::from_secs(5));
    notifier.notify(&Event::new(
        EventKind::PoolDegraded,
        "tank",
        "pool health is DEGRADED",
    ));
    assert_eq!(
        read(dir.path(), "event"),
        "pool-degraded|tank|pool health is DEGRADED\n"
    );

    // a failing command only logs
    let broken = write_script(dir.path(), "broken", "#!/bin/sh\nexit 1\n");
    CommandNotifier::new(broken, Duration::from_secs(5))
        .notify(&Event::new(EventKind::SnapshotFailed, "tank/a", "boom"));
    CommandNotifier::new(dir.path().join("missing"), Duration::from_secs(5))
        .notify(&Event::new(EventKind::SnapshotFailed, "tank/a", "boom"));
}

#[test]
fn registry_reports_activating_units_as_running() {
    let _guard = test_lock();
    let dir = tempdir().unwrap();
    write_script(dir.path(), "systemctl", FAKE_SYSTEMCTL);
    let registry = SystemdBackupRegistry::from_config(&config(dir.path(), JOBS)).unwrap();

    let running = registry.running_jobs().unwrap();
    assert_eq!(running.len(), 1);
    assert_eq!(running[0].name, "media");
    assert_eq!(running[0].datasets, vec!["tank/media"]);
}

#[test]
fn archive_restore_loads_env_file() {
    let _guard = test_lock();
    let dir = tempdir().unwrap();
    let _state = EnvGuard::set(STATE_ENV, dir.path().display().to_string());
    write_script(dir.path(), "systemctl", FAKE_SYSTEMCTL);
    write_script(dir.path(), "restic", FAKE_RESTIC);
    let env_file = dir.path().join("restic.envfile");
    std::fs::write(&env_file, "RESTIC_PASSWORD=\"hunter2\"\n").unwrap();

    let registry = SystemdBackupRegistry::from_config(&config(dir.path(), JOBS)).unwrap();
    registry
        .restore_archive(&ArchiveRequest {
            source: ArchiveSource {
                repository: "/mnt/restic".into(),
                password_file: None,
                env_file: Some(env_file),
                snapshot: "latest".into(),
                tags: vec![],
                host: None,
            },
            data_dir: PathBuf::from("/var/lib/sonarr"),
        })
        .unwrap();

    assert_eq!(
        read(dir.path(), "restic.args").trim(),
        "-r /mnt/restic restore latest --target / --include /var/lib/sonarr"
    );
    assert_eq!(read(dir.path(), "restic.env").trim(), "hunter2");
}

#![cfg(unix)]

mod common;

use common::{config, read, test_lock, write_script, EnvGuard, STATE_ENV};
use std::collections::BTreeMap;
use std::fs;
use tempfile::{tempdir, TempDir};
use warden_core::error::WardenError;
use warden_core::provider::{Hold, ZfsProvider};
use warden_zfs::{SystemZfsProvider, HOLDS_BATCH};

const FAKE_ZFS: &str = r#"#!/bin/sh
for last; do :; done
echo "$*" >> "$FAKE_STATE/zfs.log"
case "$1" in
list)
  if [ "$3" = "-p" ]; then
    cat "$FAKE_STATE/snapshots"
    exit 0
  fi
  if grep -qx "$last" "$FAKE_STATE/datasets"; then
    echo "$last"
    exit 0
  fi
  echo "cannot open '$last': dataset does not exist" >&2
  exit 1
  ;;
holds)
  shift 3
  printf '%s\n' "$@" > "$FAKE_STATE/wanted"
  awk -F'\t' 'NR == FNR { want[$1] = 1; next } ($1 in want)' "$FAKE_STATE/wanted" "$FAKE_STATE/holds"
  ;;
mount)
  echo "cannot mount '$last': filesystem already mounted" >&2
  exit 1
  ;;
destroy)
  echo "cannot destroy snapshot $last: dataset is busy" >&2
  exit 1
  ;;
esac
exit 0
"#;

const FAKE_ZPOOL: &str = r#"#!/bin/sh
printf 'tank\tONLINE\nbackup\tDEGRADED\n'
"#;

struct Fixture {
    dir: TempDir,
    provider: SystemZfsProvider,
    _state: EnvGuard,
}

fn fixture() -> Fixture {
    let dir = tempdir().unwrap();
    write_script(dir.path(), "zfs", FAKE_ZFS);
    write_script(dir.path(), "zpool", FAKE_ZPOOL);
    fs::write(dir.path().join("datasets"), "tank/a\ntank/a/child\n").unwrap();
    fs::write(
        dir.path().join("snapshots"),
        "tank/a@s1\t101\t1760300000\ntank/a/child@s1\t102\t1760300100\ntank/a@s2\t103\t1760400000\n",
    )
    .unwrap();
    fs::write(dir.path().join("holds"), "tank/a@s1\trestic-42\t1760300500\n").unwrap();
    let state = EnvGuard::set(STATE_ENV, dir.path().display().to_string());
    let provider = SystemZfsProvider::from_config(&config(dir.path(), "")).unwrap();
    Fixture {
        dir,
        provider,
        _state: state,
    }
}

#[test]
fn snapshot_listing_separates_direct_and_recursive() {
    let _guard = test_lock();
    let fx = fixture();

    let direct = fx.provider.list_snapshots("tank/a").unwrap();
    let names: Vec<_> = direct.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["tank/a@s1", "tank/a@s2"]);
    assert_eq!(direct[1].guid, "103");

    let recursive = fx.provider.list_snapshots_recursive("tank/a").unwrap();
    assert_eq!(recursive.len(), 3);

    let log = read(fx.dir.path(), "zfs.log");
    assert!(log.contains("list -H -p -t snapshot -o name,guid,creation -s creation -d 1 tank/a"));
    assert!(log.contains("-s creation -r tank/a"));
}

#[test]
fn dataset_existence_uses_cli_diagnostics() {
    let _guard = test_lock();
    let fx = fixture();
    assert!(fx.provider.dataset_exists("tank/a").unwrap());
    assert!(!fx.provider.dataset_exists("tank/missing").unwrap());
}

#[test]
fn holds_are_parsed_and_released() {
    let _guard = test_lock();
    let fx = fixture();

    let holds = fx.provider.holds(&["tank/a@s1".to_string()]).unwrap();
    assert_eq!(
        holds,
        vec![Hold {
            tag: "restic-42".into(),
            snapshot: "tank/a@s1".into(),
            created_at: chrono::DateTime::from_timestamp(1760300500, 0).unwrap(),
        }]
    );
    assert!(fx.provider.holds(&[]).unwrap().is_empty());

    fx.provider.release_hold(&holds[0]).unwrap();
    assert!(read(fx.dir.path(), "zfs.log").contains("release restic-42 tank/a@s1"));
}

#[test]
fn hold_queries_are_split_into_batches() {
    let _guard = test_lock();
    let fx = fixture();

    let mut snapshots: Vec<String> = (0..HOLDS_BATCH * 2)
        .map(|i| format!("tank/a@filler{i}"))
        .collect();
    snapshots.push("tank/a@s1".to_string());
    let holds = fx.provider.holds(&snapshots).unwrap();
    assert_eq!(holds.len(), 1);
    assert_eq!(holds[0].snapshot, "tank/a@s1");

    let log = read(fx.dir.path(), "zfs.log");
    let calls: Vec<_> = log.lines().filter(|l| l.starts_with("holds -H -p ")).collect();
    assert_eq!(calls.len(), 3);
    assert!(calls[2].ends_with(" tank/a@s1"));
    assert!(calls.iter().all(|c| c.split(' ').count() <= HOLDS_BATCH + 3));
}

#[test]
fn mount_tolerates_already_mounted_but_destroy_errors_surface() {
    let _guard = test_lock();
    let fx = fixture();
    fx.provider.mount("tank/a").unwrap();

    let err = fx.provider.destroy_snapshot("tank/a@s1", false).unwrap_err();
    match err {
        WardenError::Provider(msg) => assert!(msg.contains("dataset is busy"), "{msg}"),
        other => panic!("expected provider error, got {other:?}"),
    }
    assert!(fx.provider.destroy_snapshot("tank/a", false).is_err());
}

#[test]
fn dataset_creation_passes_properties() {
    let _guard = test_lock();
    let fx = fixture();
    let props = BTreeMap::from([("mountpoint".to_string(), "/srv/app".to_string())]);
    fx.provider.create_dataset("tank/app", &props).unwrap();
    fx.provider.create_snapshot("tank/app", "autosnap_x", true).unwrap();

    let log = read(fx.dir.path(), "zfs.log");
    assert!(log.contains("create -p -o mountpoint=/srv/app tank/app"));
    assert!(log.contains("snapshot -r tank/app@autosnap_x"));
}

#[test]
fn pools_report_health() {
    let _guard = test_lock();
    let fx = fixture();
    let pools = fx.provider.pools().unwrap();
    assert_eq!(pools.len(), 2);
    assert!(pools[0].is_healthy());
    assert_eq!(pools[1].health, "DEGRADED");
}

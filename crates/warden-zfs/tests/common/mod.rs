#![allow(dead_code)]

use std::env;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, OnceLock};
use warden_core::config::{ConfigFormat, ReplicationTarget, WardenConfig};

/// Fake scripts read their state directory from this variable.
pub const STATE_ENV: &str = "FAKE_STATE";

pub struct EnvGuard {
    key: &'static str,
    prev: Option<String>,
}

impl EnvGuard {
    pub fn set(key: &'static str, value: impl AsRef<str>) -> Self {
        let prev = env::var(key).ok();
        env::set_var(key, value.as_ref());
        Self { key, prev }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        if let Some(prev) = &self.prev {
            env::set_var(self.key, prev);
        } else {
            env::remove_var(self.key);
        }
    }
}

/// Serialises tests that touch the process environment.
pub fn test_lock() -> MutexGuard<'static, ()> {
    static LOCK: OnceLock<Mutex<()>> = OnceLock::new();
    LOCK.get_or_init(|| Mutex::new(()))
        .lock()
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, body).unwrap();
    let mut perms = fs::metadata(&path).unwrap().permissions();
    perms.set_mode(0o755);
    fs::set_permissions(&path, perms).unwrap();
    path
}

pub fn read(dir: &Path, name: &str) -> String {
    fs::read_to_string(dir.join(name)).unwrap_or_default()
}

/// A configuration whose binaries all live in `dir`.
pub fn config(dir: &Path, extra: &str) -> WardenConfig {
    let d = dir.display();
    let doc = format!(
        r#"
[zfs]
zfs_path = "{d}/zfs"
zpool_path = "{d}/zpool"
timeout_secs = 5

[ssh]
ssh_path = "{d}/ssh"
known_hosts_path = "{d}/known_hosts"

[replication]
probe_timeout_secs = 1

[replication.confinement]
mode = "none"

[backup]
systemctl_path = "{d}/systemctl"
restic_path = "{d}/restic"

{extra}
"#
    );
    WardenConfig::parse(&doc, ConfigFormat::Toml).unwrap()
}

pub fn target(host: &str, dataset: &str) -> ReplicationTarget {
    ReplicationTarget {
        target_host: host.into(),
        target_user: "zfs-replication".into(),
        target_dataset: dataset.into(),
        send_options: String::new(),
        recv_options: String::new(),
        host_key: Some("ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIFake".into()),
        port: 22,
        target_name: None,
        target_location: None,
    }
}

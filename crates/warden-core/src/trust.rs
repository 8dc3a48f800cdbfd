//! Pinned SSH host keys and the `known_hosts` store replication trusts.

use crate::config::{ReplicationTarget, WardenConfig};
use crate::error::{WardenError, WardenResult};
use sha2::{Digest, Sha256};
use std::collections::BTreeSet;
use std::fs;
use std::io::ErrorKind;
use std::path::Path;

/// A public key split into its algorithm and base64 blob.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub struct HostKey {
    pub algorithm: String,
    pub blob: String,
}

/// Split `<type> <base64> [comment]` into a `HostKey`.
pub fn parse_host_key(raw: &str) -> Option<HostKey> {
    let mut parts = raw.split_whitespace();
    let algorithm = parts.next()?;
    let blob = parts.next()?;
    let known_algorithm = algorithm.starts_with("ssh-")
        || algorithm.starts_with("ecdsa-")
        || algorithm.starts_with("sk-");
    let base64 = blob
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || b == b'+' || b == b'/' || b == b'=');
    if !known_algorithm || !base64 {
        return None;
    }
    Some(HostKey {
        algorithm: algorithm.to_string(),
        blob: blob.to_string(),
    })
}

/// Short digest of a pin, for logs and diagnostics.
pub fn fingerprint(key: &HostKey) -> String {
    let digest = Sha256::digest(key.blob.as_bytes());
    format!("{}:{}", key.algorithm, &hex::encode(digest)[..16])
}

/// The host pattern OpenSSH writes for `host` on `port`.
pub fn host_pattern(host: &str, port: u16) -> String {
    if port == 22 {
        host.to_string()
    } else {
        format!("[{host}]:{port}")
    }
}

#[derive(Debug, Clone)]
struct KnownHostEntry {
    hosts: Vec<String>,
    key: HostKey,
}

/// In-memory view of a `known_hosts` file.
#[derive(Debug, Clone, Default)]
pub struct KnownHosts {
    entries: Vec<KnownHostEntry>,
}

impl KnownHosts {
    /// Read the store; a missing file is an empty store.
    pub fn load(path: &Path) -> WardenResult<Self> {
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == ErrorKind::NotFound => String::new(),
            Err(err) => return Err(err.into()),
        };
        Ok(Self {
            entries: contents.lines().filter_map(parse_entry).collect(),
        })
    }

    /// True when an entry for `host`/`port` carries exactly `key`.
    pub fn contains(&self, host: &str, port: u16, key: &HostKey) -> bool {
        let pattern = host_pattern(host, port);
        self.entries
            .iter()
            .any(|entry| entry.key == *key && entry.hosts.iter().any(|h| *h == pattern))
    }

    /// Fail with `UntrustedHost` unless the target's pin is present.
    /// Returns the fingerprint of the matched pin.
    pub fn ensure_pinned(&self, target: &ReplicationTarget) -> WardenResult<String> {
        match target.host_key.as_deref().and_then(parse_host_key) {
            Some(key) if self.contains(&target.target_host, target.port, &key) => {
                Ok(fingerprint(&key))
            }
            _ => Err(WardenError::UntrustedHost {
                host: target.target_host.clone(),
            }),
        }
    }
}

fn parse_entry(line: &str) -> Option<KnownHostEntry> {
    let line = line.trim();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }
    let mut parts = line.split_whitespace();
    let mut hosts_field = parts.next()?;
    if hosts_field.starts_with('@') {
        // markers such as @revoked never establish trust
        return None;
    }
    if hosts_field.starts_with("|1|") {
        return None;
    }
    let algorithm = parts.next()?;
    let blob = parts.next()?;
    let key = parse_host_key(&format!("{algorithm} {blob}"))?;
    hosts_field = hosts_field.trim_end_matches(',');
    Some(KnownHostEntry {
        hosts: hosts_field.split(',').map(str::to_string).collect(),
        key,
    })
}

/// Host pattern and fingerprint of every configured pin, deduplicated.
pub fn pinned_fingerprints(config: &WardenConfig) -> Vec<(String, String)> {
    let pins: BTreeSet<(String, String)> = config
        .datasets
        .values()
        .filter_map(|dataset| dataset.replication.as_ref())
        .filter_map(|target| {
            let key = target.host_key.as_deref().and_then(parse_host_key)?;
            Some((
                host_pattern(&target.target_host, target.port),
                fingerprint(&key),
            ))
        })
        .collect();
    pins.into_iter().collect()
}

/// Render a `known_hosts` document holding every configured pin.
pub fn render_known_hosts(config: &WardenConfig) -> String {
    let mut lines = BTreeSet::new();
    for dataset in config.datasets.values() {
        let Some(target) = &dataset.replication else {
            continue;
        };
        if let Some(key) = target.host_key.as_deref().and_then(parse_host_key) {
            lines.insert(format!(
                "{} {} {}",
                host_pattern(&target.target_host, target.port),
                key.algorithm,
                key.blob
            ));
        }
    }
    let mut out = String::new();
    for line in lines {
        out.push_str(&line);
        out.push('\n');
    }
    out
}

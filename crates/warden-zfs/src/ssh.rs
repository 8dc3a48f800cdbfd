//! SSH transport for snapshot streams. Host keys are checked strictly
//! against the warden's own known_hosts file; nothing is ever learned on
//! first use.

use crate::command::{run_pipeline, CommandRunner, Output, PipelineOutput};
use crate::parse::{is_missing_dataset, parse_snapshots, SNAPSHOT_COLUMNS};
use crate::system::{resolve_binary, strings, DEFAULT_ZFS_PATHS};
use log::{debug, info};
use std::path::{Path, PathBuf};
use std::process::Command;
use std::time::Duration;
use warden_core::config::{Confinement, ConfinementMode, ReplicationTarget, SshCfg, WardenConfig};
use warden_core::error::{WardenError, WardenResult};
use warden_core::provider::{ReplicationTransport, SnapshotInfo, TransferPlan};

pub const DEFAULT_SSH_PATHS: &[&str] = &["/usr/bin/ssh", "/bin/ssh", "/usr/local/bin/ssh"];

/// ssh exits 255 when the connection itself failed.
const SSH_CONNECTION_FAILED: i32 = 255;

#[derive(Debug, Clone)]
pub struct SshTransport {
    ssh: PathBuf,
    zfs: PathBuf,
    ssh_cfg: SshCfg,
    confinement: Confinement,
    transfer_timeout: Duration,
    probe_timeout: Duration,
    list_timeout: Duration,
}

impl SshTransport {
    pub fn from_config(config: &WardenConfig) -> WardenResult<Self> {
        let ssh = resolve_binary(
            config.ssh.ssh_path.as_ref().map(PathBuf::from),
            DEFAULT_SSH_PATHS,
            "ssh",
        )?;
        let zfs = resolve_binary(config.zfs_binary_path(), DEFAULT_ZFS_PATHS, "zfs")?;
        Ok(Self {
            ssh,
            zfs,
            ssh_cfg: config.ssh.clone(),
            confinement: config.replication.confinement.clone(),
            transfer_timeout: config.replication_timeout(),
            probe_timeout: config.probe_timeout(),
            list_timeout: config.zfs_timeout()
                + Duration::from_secs(config.ssh.connect_timeout_secs),
        })
    }

    /// Options and destination for every connection to `target`.
    pub fn ssh_args(&self, target: &ReplicationTarget) -> Vec<String> {
        let cfg = &self.ssh_cfg;
        let mut args = Vec::new();
        for option in [
            "BatchMode=yes".to_string(),
            "StrictHostKeyChecking=yes".to_string(),
            format!("UserKnownHostsFile={}", cfg.known_hosts_path.display()),
            "GlobalKnownHostsFile=/dev/null".to_string(),
            format!("ConnectTimeout={}", cfg.connect_timeout_secs),
            format!("ServerAliveInterval={}", cfg.server_alive_interval_secs),
            format!("ServerAliveCountMax={}", cfg.server_alive_count_max),
        ] {
            args.push("-o".to_string());
            args.push(option);
        }
        args.push("-p".to_string());
        args.push(target.port.to_string());
        if let Some(identity) = &cfg.identity_file {
            args.push("-i".to_string());
            args.push(identity.display().to_string());
        }
        args.push(target.destination());
        args
    }

    /// The remote zfs invocation as one shell string.
    pub fn remote_command(&self, args: &[String]) -> String {
        let mut command = self.ssh_cfg.remote_zfs_command.clone();
        for arg in args {
            command.push(' ');
            command.push_str(&shell_quote(arg));
        }
        command
    }

    fn ssh_command(&self, target: &ReplicationTarget, remote: String) -> Command {
        let mut command = Command::new(&self.ssh);
        command.args(self.ssh_args(target));
        command.arg(remote);
        command
    }

    /// Wrap a local program in the configured resource confinement.
    pub fn confined_command(&self, program: &Path, args: &[String]) -> Command {
        let c = &self.confinement;
        let niced = |command: &mut Command| {
            command.arg("-n").arg(c.nice.to_string());
            command.arg("ionice").arg("-c").arg(&c.io_class);
            command.arg(program);
            command.args(args);
        };
        match c.mode {
            ConfinementMode::None => {
                let mut command = Command::new(program);
                command.args(args);
                command
            }
            ConfinementMode::Nice => {
                let mut command = Command::new("nice");
                niced(&mut command);
                command
            }
            ConfinementMode::SystemdScope => {
                let mut command = Command::new("systemd-run");
                command.args(["--scope", "--quiet", "--collect"]);
                command.arg("-p").arg(format!("CPUQuota={}", c.cpu_quota));
                command.arg("-p").arg(format!("MemoryMax={}", c.memory_max));
                command.args(["--", "nice"]);
                niced(&mut command);
                command
            }
        }
    }

    fn check_remote(
        &self,
        target: &ReplicationTarget,
        out: &Output,
        what: &str,
    ) -> WardenResult<()> {
        if out.success() {
            return Ok(());
        }
        if out.status == SSH_CONNECTION_FAILED {
            return Err(WardenError::Unreachable {
                host: target.target_host.clone(),
                reason: out.diagnostic().to_string(),
            });
        }
        Err(WardenError::Provider(format!(
            "{what} on {} exited with code {}: {}",
            target.target_host,
            out.status,
            out.diagnostic()
        )))
    }
}

/// POSIX single-quote escaping; plain words pass through unchanged.
pub fn shell_quote(arg: &str) -> String {
    let plain = !arg.is_empty()
        && arg
            .chars()
            .all(|ch| ch.is_ascii_alphanumeric() || "@%+=:,./_-".contains(ch));
    if plain {
        arg.to_string()
    } else {
        format!("'{}'", arg.replace('\'', r"'\''"))
    }
}

fn send_args(plan: &TransferPlan) -> Vec<String> {
    let mut args = vec!["send".to_string()];
    args.extend(plan.send_flags.iter().cloned());
    if let Some(base) = &plan.incremental_from {
        args.push("-I".to_string());
        args.push(base.clone());
    }
    args.push(plan.source_snapshot.clone());
    args
}

fn receive_args(plan: &TransferPlan) -> Vec<String> {
    let mut args = vec!["receive".to_string()];
    args.extend(plan.recv_flags.iter().cloned());
    args.push(plan.destination.clone());
    args
}

fn check_local(out: &Output, what: &str) -> WardenResult<()> {
    if out.success() {
        return Ok(());
    }
    Err(WardenError::Provider(format!(
        "local {what} exited with code {}: {}",
        out.status,
        out.diagnostic()
    )))
}

impl ReplicationTransport for SshTransport {
    fn probe(&self, target: &ReplicationTarget) -> WardenResult<()> {
        let mut args = self.ssh_args(target);
        args.push("true".to_string());
        let out = CommandRunner::new(self.ssh.clone(), self.probe_timeout).run(&args, None)?;
        self.check_remote(target, &out, "probe")?;
        debug!("target {} answered probe", target.target_host);
        Ok(())
    }

    fn remote_snapshots(
        &self,
        target: &ReplicationTarget,
        dataset: &str,
    ) -> WardenResult<Vec<SnapshotInfo>> {
        let mut remote = strings(&[
            "list", "-H", "-p", "-t", "snapshot", "-o", SNAPSHOT_COLUMNS, "-s", "creation", "-d",
            "1",
        ]);
        remote.push(dataset.to_string());
        let mut args = self.ssh_args(target);
        args.push(self.remote_command(&remote));

        let out = CommandRunner::new(self.ssh.clone(), self.list_timeout).run(&args, None)?;
        if !out.success() && out.status != SSH_CONNECTION_FAILED && is_missing_dataset(out.diagnostic())
        {
            return Ok(Vec::new());
        }
        self.check_remote(target, &out, "snapshot listing")?;
        Ok(parse_snapshots(&out.stdout)
            .into_iter()
            .filter(|snap| snap.dataset() == dataset)
            .collect())
    }

    fn send(&self, target: &ReplicationTarget, plan: &TransferPlan) -> WardenResult<()> {
        let producer = self.confined_command(&self.zfs, &send_args(plan));
        let consumer = self.ssh_command(target, self.remote_command(&receive_args(plan)));
        let PipelineOutput { producer, consumer } =
            run_pipeline(producer, consumer, self.transfer_timeout)?;
        self.check_remote(target, &consumer, "zfs receive")?;
        check_local(&producer, "zfs send")?;
        info!(
            "sent {} to {}:{}",
            plan.source_snapshot, target.target_host, plan.destination
        );
        Ok(())
    }

    fn pull(&self, target: &ReplicationTarget, plan: &TransferPlan) -> WardenResult<()> {
        let producer = self.ssh_command(target, self.remote_command(&send_args(plan)));
        let consumer = self.confined_command(&self.zfs, &receive_args(plan));
        let PipelineOutput { producer, consumer } =
            run_pipeline(producer, consumer, self.transfer_timeout)?;
        self.check_remote(target, &producer, "zfs send")?;
        check_local(&consumer, "zfs receive")?;
        info!(
            "received {} from {} into {}",
            plan.source_snapshot, target.target_host, plan.destination
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::OsStr;

    fn transport(mode: ConfinementMode) -> SshTransport {
        SshTransport {
            ssh: PathBuf::from("/usr/bin/ssh"),
            zfs: PathBuf::from("/sbin/zfs"),
            ssh_cfg: SshCfg {
                identity_file: Some(PathBuf::from("/var/lib/zfs-warden/id_ed25519")),
                ..SshCfg::default()
            },
            confinement: Confinement {
                mode,
                ..Confinement::default()
            },
            transfer_timeout: Duration::from_secs(60),
            probe_timeout: Duration::from_secs(5),
            list_timeout: Duration::from_secs(5),
        }
    }

    fn target() -> ReplicationTarget {
        ReplicationTarget {
            target_host: "nas1".into(),
            target_user: "zfs-replication".into(),
            target_dataset: "backup/services".into(),
            send_options: String::new(),
            recv_options: String::new(),
            host_key: None,
            port: 2222,
            target_name: None,
            target_location: None,
        }
    }

    fn argv(command: &Command) -> Vec<String> {
        std::iter::once(command.get_program())
            .chain(command.get_args())
            .map(|arg: &OsStr| arg.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn quoting_only_wraps_unsafe_words() {
        assert_eq!(shell_quote("tank/services@autosnap_x"), "tank/services@autosnap_x");
        assert_eq!(shell_quote("my data"), "'my data'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
        assert_eq!(shell_quote(""), "''");
    }

    #[test]
    fn ssh_args_pin_host_keys() {
        let args = transport(ConfinementMode::None).ssh_args(&target());
        let joined = args.join(" ");
        assert!(joined.contains("-o BatchMode=yes"));
        assert!(joined.contains("-o StrictHostKeyChecking=yes"));
        assert!(joined.contains("UserKnownHostsFile=/var/lib/zfs-warden/known_hosts"));
        assert!(joined.contains("-p 2222"));
        assert!(joined.contains("-i /var/lib/zfs-warden/id_ed25519"));
        assert_eq!(args.last().unwrap(), "zfs-replication@nas1");
    }

    #[test]
    fn remote_command_quotes_arguments() {
        let t = transport(ConfinementMode::None);
        let cmd = t.remote_command(&strings(&["receive", "-u", "backup/my data"]));
        assert_eq!(cmd, "zfs receive -u 'backup/my data'");
    }

    #[test]
    fn incremental_send_uses_intermediate_flag() {
        let plan = TransferPlan {
            source_snapshot: "tank/a@s3".into(),
            incremental_from: Some("tank/a@s1".into()),
            destination: "backup/a".into(),
            send_flags: vec!["-w".into()],
            recv_flags: vec!["-u".into()],
        };
        assert_eq!(send_args(&plan), vec!["send", "-w", "-I", "tank/a@s1", "tank/a@s3"]);
        assert_eq!(receive_args(&plan), vec!["receive", "-u", "backup/a"]);
    }

    #[test]
    fn confinement_modes_wrap_the_program() {
        let args = strings(&["send", "tank/a@s1"]);
        let plain = argv(&transport(ConfinementMode::None).confined_command(Path::new("/sbin/zfs"), &args));
        assert_eq!(plain, vec!["/sbin/zfs", "send", "tank/a@s1"]);

        let nice = argv(&transport(ConfinementMode::Nice).confined_command(Path::new("/sbin/zfs"), &args));
        assert_eq!(
            nice,
            vec!["nice", "-n", "10", "ionice", "-c", "idle", "/sbin/zfs", "send", "tank/a@s1"]
        );

        let scope = argv(
            &transport(ConfinementMode::SystemdScope).confined_command(Path::new("/sbin/zfs"), &args),
        );
        assert_eq!(scope[0], "systemd-run");
        assert!(scope.contains(&"CPUQuota=50%".to_string()));
        assert!(scope.contains(&"MemoryMax=1G".to_string()));
        let sep = scope.iter().position(|arg| arg == "--").unwrap();
        assert_eq!(scope[sep + 1], "nice");
        assert_eq!(scope.last().unwrap(), "tank/a@s1");
    }
}

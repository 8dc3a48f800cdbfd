//! System-backed implementations of the warden-core traits: the host's
//! `zfs`/`zpool` binaries, SSH transfers, systemd and restic, hook scripts
//! and the notification command.

mod command;
mod host;
mod parse;
mod restic;
mod ssh;
mod system;

pub use command::{run_pipeline, CommandRunner, Output, PipelineOutput};
pub use host::{notifier_from_config, CommandNotifier, SystemHost};
pub use restic::{parse_env_file, SystemdBackupRegistry};
pub use ssh::{shell_quote, SshTransport, DEFAULT_SSH_PATHS};
pub use system::{SystemZfsProvider, DEFAULT_ZFS_PATHS, DEFAULT_ZPOOL_PATHS, HOLDS_BATCH};

//! Hook scripts, ownership fixes and the external notification command.

use crate::command::CommandRunner;
use log::{info, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use warden_core::config::WardenConfig;
use warden_core::error::{WardenError, WardenResult};
use warden_core::notify::{Event, LogNotifier, Notifier};
use warden_core::provider::{HookPhase, HookRunner, SystemOps};

pub const DATASET_ENV: &str = "WARDEN_DATASET";
pub const HOOK_PHASE_ENV: &str = "WARDEN_HOOK_PHASE";
pub const EVENT_ENV: &str = "WARDEN_EVENT";
pub const SUBJECT_ENV: &str = "WARDEN_SUBJECT";
pub const MESSAGE_ENV: &str = "WARDEN_MESSAGE";

/// Runs hooks and `chown` on the local host.
#[derive(Debug, Clone)]
pub struct SystemHost {
    hook_timeout: Duration,
    chown: PathBuf,
    chown_timeout: Duration,
}

impl SystemHost {
    pub fn from_config(config: &WardenConfig) -> Self {
        Self::new(config.zfs_timeout(), PathBuf::from("chown"), config.zfs_timeout())
    }

    pub fn new(hook_timeout: Duration, chown: PathBuf, chown_timeout: Duration) -> Self {
        Self {
            hook_timeout,
            chown,
            chown_timeout,
        }
    }
}

impl HookRunner for SystemHost {
    fn run_hook(&self, hook: &Path, phase: HookPhase, dataset: &str) -> WardenResult<()> {
        let hook_error = |reason: String| WardenError::Hook {
            hook: hook.to_path_buf(),
            phase: phase.as_str().to_string(),
            reason,
        };
        let runner = CommandRunner::new(hook.to_path_buf(), self.hook_timeout)
            .with_env(DATASET_ENV, dataset)
            .with_env(HOOK_PHASE_ENV, phase.as_str());
        let no_args: [&str; 0] = [];
        let out = match runner.run(&no_args, None) {
            Ok(out) => out,
            Err(WardenError::Timeout { after, .. }) => {
                return Err(hook_error(format!("timed out after {after:?}")))
            }
            Err(err) => return Err(hook_error(err.to_string())),
        };
        if !out.success() {
            return Err(hook_error(format!(
                "exit status {}: {}",
                out.status,
                out.diagnostic()
            )));
        }
        info!("{} hook {} completed for {dataset}", phase.as_str(), hook.display());
        Ok(())
    }
}

impl SystemOps for SystemHost {
    fn chown_recursive(&self, path: &Path, owner: &str, group: &str) -> WardenResult<()> {
        let owner_spec = format!("{owner}:{group}");
        let path_arg = path.display().to_string();
        CommandRunner::new(self.chown.clone(), self.chown_timeout)
            .run_checked(&["-R", owner_spec.as_str(), path_arg.as_str()])?;
        Ok(())
    }
}

/// Hands each event to an executable through the environment. Failures are
/// logged and never reach the caller.
#[derive(Debug, Clone)]
pub struct CommandNotifier {
    command: PathBuf,
    timeout: Duration,
}

impl CommandNotifier {
    pub fn new(command: PathBuf, timeout: Duration) -> Self {
        Self { command, timeout }
    }
}

impl Notifier for CommandNotifier {
    fn notify(&self, event: &Event) {
        LogNotifier.notify(event);
        let runner = CommandRunner::new(self.command.clone(), self.timeout)
            .with_env(EVENT_ENV, event.kind.as_str())
            .with_env(SUBJECT_ENV, event.subject.as_str())
            .with_env(MESSAGE_ENV, event.message.as_str());
        let no_args: [&str; 0] = [];
        match runner.run(&no_args, None) {
            Ok(out) if out.success() => {}
            Ok(out) => warn!(
                "notify command {} exited with code {}: {}",
                self.command.display(),
                out.status,
                out.diagnostic()
            ),
            Err(err) => warn!("notify command {} failed: {err}", self.command.display()),
        }
    }
}

/// The configured command notifier, or log-only delivery.
pub fn notifier_from_config(config: &WardenConfig) -> Arc<dyn Notifier> {
    match &config.notify.command {
        Some(command) => Arc::new(CommandNotifier::new(
            command.clone(),
            Duration::from_secs(config.notify.timeout_secs),
        )),
        None => Arc::new(LogNotifier),
    }
}

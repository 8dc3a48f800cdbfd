use std::path::PathBuf;
use std::time::Duration;
use thiserror::Error;

/// Result alias for core operations.
pub type WardenResult<T> = Result<T, WardenError>;

#[derive(Error, Debug)]
pub enum WardenError {
    #[error("[WD1000] io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("[WD1001] toml config parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("[WD1002] yaml config parse error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("[WD1003] json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("[WD1100] configuration error: {0}")]
    InvalidConfig(String),

    #[error("[WD1101] configuration rejected: {}", .0.join("; "))]
    ConfigIssues(Vec<String>),

    #[error("[WD1200] dataset `{0}` is not declared in configuration")]
    DatasetNotConfigured(String),

    #[error("[WD1201] service `{0}` is not declared in configuration")]
    ServiceNotConfigured(String),

    #[error("[WD2000] provider error: {0}")]
    Provider(String),

    #[error("[WD2001] {command} timed out after {after:?}")]
    Timeout { command: String, after: Duration },

    #[error("[WD3000] replication lock {} is held by another job", .lock.display())]
    Busy { lock: PathBuf },

    #[error("[WD3001] host key for `{host}` is not pinned in the trusted host store")]
    UntrustedHost { host: String },

    #[error("[WD3002] dataset `{dataset}` is in use by running backup jobs: {}", .jobs.join(", "))]
    BackupConflict { dataset: String, jobs: Vec<String> },

    #[error("[WD3003] target `{host}` is unreachable: {reason}")]
    Unreachable { host: String, reason: String },

    #[error("[WD4000] {phase} hook {} failed: {reason}", .hook.display())]
    Hook {
        hook: PathBuf,
        phase: String,
        reason: String,
    },

    #[error("[WD4001] no snapshot available for `{0}`")]
    NoSnapshot(String),

    #[error("[WD5000] every restore method failed for service `{service}` after {attempts} attempts")]
    RestoreExhausted { service: String, attempts: usize },
}

impl WardenError {
    pub fn code(&self) -> &'static str {
        match self {
            WardenError::Io(_) => "WD1000",
            WardenError::Toml(_) => "WD1001",
            WardenError::Yaml(_) => "WD1002",
            WardenError::Json(_) => "WD1003",
            WardenError::InvalidConfig(_) => "WD1100",
            WardenError::ConfigIssues(_) => "WD1101",
            WardenError::DatasetNotConfigured(_) => "WD1200",
            WardenError::ServiceNotConfigured(_) => "WD1201",
            WardenError::Provider(_) => "WD2000",
            WardenError::Timeout { .. } => "WD2001",
            WardenError::Busy { .. } => "WD3000",
            WardenError::UntrustedHost { .. } => "WD3001",
            WardenError::BackupConflict { .. } => "WD3002",
            WardenError::Unreachable { .. } => "WD3003",
            WardenError::Hook { .. } => "WD4000",
            WardenError::NoSnapshot(_) => "WD4001",
            WardenError::RestoreExhausted { .. } => "WD5000",
        }
    }

    /// Errors that clear up on their own; the next scheduled tick is the retry.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            WardenError::Timeout { .. }
                | WardenError::Busy { .. }
                | WardenError::BackupConflict { .. }
                | WardenError::Unreachable { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_follow_taxonomy() {
        let busy = WardenError::Busy {
            lock: PathBuf::from("/run/zfs-warden/replication.lock"),
        };
        assert_eq!(busy.code(), "WD3000");
        assert!(busy.is_transient());

        let hook = WardenError::Hook {
            hook: PathBuf::from("/usr/bin/pause-db"),
            phase: "pre".into(),
            reason: "exit 1".into(),
        };
        assert_eq!(hook.code(), "WD4000");
        assert!(!hook.is_transient());
    }

    #[test]
    fn config_issues_render_every_entry() {
        let err = WardenError::ConfigIssues(vec!["a".into(), "b".into()]);
        assert!(err.to_string().contains("a; b"));
    }
}

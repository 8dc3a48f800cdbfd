//! Events handed to the external notification system.

use log::{error, info, warn};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    SnapshotFailed,
    HookFailed,
    PoolDegraded,
    PoolRecovered,
    ReplicationFailed,
    RestoreExhausted,
}

impl EventKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::SnapshotFailed => "snapshot-failed",
            EventKind::HookFailed => "hook-failed",
            EventKind::PoolDegraded => "pool-degraded",
            EventKind::PoolRecovered => "pool-recovered",
            EventKind::ReplicationFailed => "replication-failed",
            EventKind::RestoreExhausted => "restore-exhausted",
        }
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A single notification: what happened, to which dataset/pool/service.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Event {
    pub kind: EventKind,
    pub subject: String,
    pub message: String,
}

impl Event {
    pub fn new(kind: EventKind, subject: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind,
            subject: subject.into(),
            message: message.into(),
        }
    }
}

/// Sink for events. Delivery failures stay inside the notifier.
pub trait Notifier: Send + Sync {
    fn notify(&self, event: &Event);
}

/// Notifier that only writes to the log.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogNotifier;

impl Notifier for LogNotifier {
    fn notify(&self, event: &Event) {
        match event.kind {
            EventKind::PoolRecovered => {
                info!("[{}] {}: {}", event.kind, event.subject, event.message)
            }
            EventKind::RestoreExhausted => {
                error!("[{}] {}: {}", event.kind, event.subject, event.message)
            }
            _ => warn!("[{}] {}: {}", event.kind, event.subject, event.message),
        }
    }
}

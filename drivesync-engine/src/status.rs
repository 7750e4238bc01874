use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::sync::conflict::ConflictCase;

/// Severity of a status update, mirrored to the embedding UI.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    Info,
    Success,
    Warning,
    Error,
}

/// Counters reported at the end of a reconciliation pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncStats {
    pub downloaded: usize,
    pub uploaded: usize,
    pub skipped: usize,
    pub conflicts: usize,
    pub folders: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Progress {
    pub processed: usize,
    pub total: usize,
    pub phase: String,
}

/// A single push-only message toward the UI. Fire and forget: nothing in the
/// engine ever waits on the receiving side.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusUpdate {
    pub message: String,
    pub severity: Severity,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<SyncStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<Progress>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub conflict: Option<ConflictCase>,
}

impl StatusUpdate {
    pub fn new(message: impl Into<String>, severity: Severity) -> Self {
        Self {
            message: message.into(),
            severity,
            stats: None,
            progress: None,
            current_path: None,
            conflict: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.current_path = Some(path.into());
        self
    }

    pub fn with_stats(mut self, stats: SyncStats) -> Self {
        self.stats = Some(stats);
        self
    }
}

#[derive(Clone)]
pub struct StatusSink {
    tx: Option<mpsc::UnboundedSender<StatusUpdate>>,
}

impl StatusSink {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<StatusUpdate>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    /// A sink with no receiver; every send is dropped.
    pub fn disconnected() -> Self {
        Self { tx: None }
    }

    pub fn send(&self, update: StatusUpdate) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(update);
        }
    }

    pub fn info(&self, message: impl Into<String>) {
        self.send(StatusUpdate::new(message, Severity::Info));
    }

    pub fn success(&self, message: impl Into<String>) {
        self.send(StatusUpdate::new(message, Severity::Success));
    }

    pub fn warning(&self, message: impl Into<String>) {
        self.send(StatusUpdate::new(message, Severity::Warning));
    }

    pub fn error(&self, message: impl Into<String>) {
        self.send(StatusUpdate::new(message, Severity::Error));
    }

    pub fn progress(&self, processed: usize, total: usize, phase: &str, current_path: &str) {
        let mut update = StatusUpdate::new("", Severity::Info).with_path(current_path);
        update.progress = Some(Progress {
            processed,
            total,
            phase: phase.to_string(),
        });
        self.send(update);
    }

    pub fn conflict(&self, case: ConflictCase) {
        let mut update = StatusUpdate::new(
            format!("Conflict detected: {}", case.path),
            Severity::Warning,
        )
        .with_path(case.path.clone());
        update.conflict = Some(case);
        self.send(update);
    }
}

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

use super::probe::FileProbe;
use super::state_store::TrackedFile;

/// Untracked local and remote copies whose timestamps are within this window
/// are treated as the same revision written through different clocks.
pub const ADOPTION_WINDOW_SECS: i64 = 5;

pub const DEFAULT_ASK_SNOOZE: Duration = Duration::from_secs(300);

#[derive(Debug, Error)]
pub enum AskError {
    #[error("a conflict decision for {0} is already pending")]
    AskInFlight(String),
    #[error("conflict decision channel closed for {0}")]
    Cancelled(String),
}

/// How a detected conflict is resolved. Mutually exclusive, set by the
/// embedding application.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ConflictPolicy {
    LocalWins,
    RemoteWins,
    #[default]
    KeepBoth,
    Ask,
}

impl ConflictPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictPolicy::LocalWins => "local-wins",
            ConflictPolicy::RemoteWins => "remote-wins",
            ConflictPolicy::KeepBoth => "keep-both",
            ConflictPolicy::Ask => "ask",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "local-wins" => Some(ConflictPolicy::LocalWins),
            "remote-wins" => Some(ConflictPolicy::RemoteWins),
            "keep-both" => Some(ConflictPolicy::KeepBoth),
            "ask" => Some(ConflictPolicy::Ask),
            _ => None,
        }
    }
}

/// Decision delivered on the external channel for an `ask` conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AskDecision {
    Local,
    Remote,
    Both,
    Skip,
}

/// Snapshot handed to the decision channel and the status sink when a
/// conflict is found. Ephemeral; never persisted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConflictCase {
    pub path: String,
    pub local_modified: i64,
    pub remote_modified: i64,
    pub local_size: u64,
    pub remote_size: u64,
}

/// Relationship of a tracked path's two replicas to its last synchronized
/// revision.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Divergence {
    /// Neither side moved past the tracked revision.
    Unchanged,
    /// Only the local content changed; local wins.
    LocalNewer,
    /// Only the remote content changed; remote wins.
    RemoteNewer,
    /// Timestamps moved but content matches the tracked revision on both
    /// sides; only the tracked metadata needs re-stamping.
    ClockSkewOnly,
    /// Both contents diverged from the tracked revision.
    Conflict,
}

/// Classifies a tracked path against fresh local and remote observations.
///
/// A conflict requires both sides changed since the tracked revision AND
/// both checksums to differ from the tracked checksum. A checksum equal to
/// the tracked one neutralizes that side regardless of its timestamp, which
/// is what keeps clock skew from producing false conflicts.
pub fn classify(
    tracked: &TrackedFile,
    local: &FileProbe,
    remote_modified: i64,
    remote_checksum: Option<&str>,
) -> Divergence {
    let local_moved = local.modified > tracked.modified;
    let remote_moved = remote_modified > tracked.modified;
    let local_differs = local.checksum != tracked.checksum;
    // An absent remote checksum cannot prove sameness; count it as changed.
    let remote_differs = remote_checksum.map(|c| c != tracked.checksum).unwrap_or(true);

    match (local_moved, remote_moved) {
        (false, false) => Divergence::Unchanged,
        (true, false) => {
            if local_differs {
                Divergence::LocalNewer
            } else {
                Divergence::ClockSkewOnly
            }
        }
        (false, true) => {
            if remote_differs {
                Divergence::RemoteNewer
            } else {
                Divergence::ClockSkewOnly
            }
        }
        (true, true) => match (local_differs, remote_differs) {
            (true, true) => Divergence::Conflict,
            (true, false) => Divergence::LocalNewer,
            (false, true) => Divergence::RemoteNewer,
            (false, false) => Divergence::ClockSkewOnly,
        },
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UntrackedOutcome {
    /// Same content (or close enough timestamps): record the pairing without
    /// transferring anything.
    Adopt,
    Conflict,
}

/// Classifies a local file that exists but was never synchronized against a
/// remote counterpart at the same path.
pub fn classify_untracked(
    local: &FileProbe,
    remote_modified: i64,
    remote_checksum: Option<&str>,
) -> UntrackedOutcome {
    if remote_checksum.is_some_and(|c| c == local.checksum) {
        return UntrackedOutcome::Adopt;
    }
    if (local.modified - remote_modified).abs() <= ADOPTION_WINDOW_SECS {
        return UntrackedOutcome::Adopt;
    }
    UntrackedOutcome::Conflict
}

/// Builds the rename target for a keep-both resolution: the conflict marker
/// and a timestamp go before the extension.
pub fn conflict_path(path: &str, stamp: i64) -> String {
    let (dir, name) = match path.rsplit_once('/') {
        Some((dir, name)) => (format!("{dir}/"), name),
        None => (String::new(), path),
    };

    if let Some((stem, ext)) = name.rsplit_once('.')
        && !stem.is_empty()
    {
        return format!("{dir}{stem} (conflict {stamp}).{ext}");
    }

    format!("{dir}{name} (conflict {stamp})")
}

/// Pending `ask` decisions, one per path. A second ask for a path already in
/// flight is rejected rather than silently replacing the first waiter.
pub struct PendingDecisions {
    pending: Mutex<HashMap<String, oneshot::Sender<AskDecision>>>,
    snoozed: Mutex<HashMap<String, i64>>,
    snooze_secs: i64,
}

impl PendingDecisions {
    pub fn new(snooze: Duration) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            snoozed: Mutex::new(HashMap::new()),
            snooze_secs: snooze.as_secs() as i64,
        }
    }

    /// Suspends until the external channel delivers a decision for `path`.
    /// A `Skip` decision snoozes further asks for the path.
    pub async fn ask(&self, path: &str, now: i64) -> Result<AskDecision, AskError> {
        let rx = {
            let mut pending = self.pending.lock().expect("pending decisions lock");
            if pending.contains_key(path) {
                return Err(AskError::AskInFlight(path.to_string()));
            }
            let (tx, rx) = oneshot::channel();
            pending.insert(path.to_string(), tx);
            rx
        };

        let decision = rx
            .await
            .map_err(|_| AskError::Cancelled(path.to_string()))?;
        if decision == AskDecision::Skip {
            self.note_skip(path, now);
        }
        Ok(decision)
    }

    /// Delivers a decision from the external channel. Returns `false` when
    /// nothing was pending for the path.
    pub fn resolve(&self, path: &str, decision: AskDecision) -> bool {
        let sender = {
            let mut pending = self.pending.lock().expect("pending decisions lock");
            pending.remove(path)
        };
        match sender {
            Some(tx) => tx.send(decision).is_ok(),
            None => false,
        }
    }

    pub fn is_snoozed(&self, path: &str, now: i64) -> bool {
        let mut snoozed = self.snoozed.lock().expect("snooze lock");
        match snoozed.get(path) {
            Some(&until) if until > now => true,
            Some(_) => {
                snoozed.remove(path);
                false
            }
            None => false,
        }
    }

    pub fn note_skip(&self, path: &str, now: i64) {
        self.snoozed
            .lock()
            .expect("snooze lock")
            .insert(path.to_string(), now + self.snooze_secs);
    }

    pub fn pending_paths(&self) -> Vec<String> {
        let pending = self.pending.lock().expect("pending decisions lock");
        let mut paths: Vec<String> = pending.keys().cloned().collect();
        paths.sort();
        paths
    }

    /// Drops every pending waiter; their `ask` calls resolve to `Cancelled`.
    pub fn clear(&self) {
        self.pending.lock().expect("pending decisions lock").clear();
        self.snoozed.lock().expect("snooze lock").clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracked(checksum: &str, modified: i64) -> TrackedFile {
        TrackedFile {
            remote_id: "r1".into(),
            modified,
            size: 1,
            checksum: checksum.into(),
        }
    }

    fn local(checksum: &str, modified: i64) -> FileProbe {
        FileProbe {
            modified,
            size: 1,
            checksum: checksum.into(),
        }
    }

    #[test]
    fn unchanged_when_neither_side_moved() {
        let t = tracked("c", 100);
        assert_eq!(
            classify(&t, &local("c", 100), 100, Some("c")),
            Divergence::Unchanged
        );
    }

    #[test]
    fn conflict_requires_both_checksums_to_differ() {
        let t = tracked("c", 100);
        assert_eq!(
            classify(&t, &local("l", 200), 300, Some("r")),
            Divergence::Conflict
        );
    }

    #[test]
    fn changed_side_wins_when_only_one_checksum_differs() {
        let t = tracked("c", 100);
        // Remote timestamp moved but content is still the tracked revision.
        assert_eq!(
            classify(&t, &local("l", 200), 300, Some("c")),
            Divergence::LocalNewer
        );
        assert_eq!(
            classify(&t, &local("c", 200), 300, Some("r")),
            Divergence::RemoteNewer
        );
    }

    #[test]
    fn clock_only_change_is_not_a_conflict() {
        let t = tracked("c", 100);
        assert_eq!(
            classify(&t, &local("c", 200), 300, Some("c")),
            Divergence::ClockSkewOnly
        );
    }

    #[test]
    fn remote_newer_when_local_untouched() {
        let t = tracked("c", 100);
        assert_eq!(
            classify(&t, &local("c", 100), 300, Some("r")),
            Divergence::RemoteNewer
        );
    }

    #[test]
    fn missing_remote_checksum_counts_as_changed() {
        let t = tracked("c", 100);
        assert_eq!(
            classify(&t, &local("l", 200), 300, None),
            Divergence::Conflict
        );
    }

    #[test]
    fn untracked_with_matching_checksum_is_adopted() {
        assert_eq!(
            classify_untracked(&local("same", 1000), 5000, Some("same")),
            UntrackedOutcome::Adopt
        );
    }

    #[test]
    fn untracked_within_window_is_adopted() {
        assert_eq!(
            classify_untracked(&local("a", 1000), 1004, Some("b")),
            UntrackedOutcome::Adopt
        );
        assert_eq!(
            classify_untracked(&local("a", 1004), 1000, Some("b")),
            UntrackedOutcome::Adopt
        );
    }

    #[test]
    fn untracked_beyond_window_is_a_conflict() {
        assert_eq!(
            classify_untracked(&local("a", 1000), 1006, Some("b")),
            UntrackedOutcome::Conflict
        );
    }

    #[test]
    fn conflict_path_inserts_marker_before_extension() {
        assert_eq!(
            conflict_path("Docs/A.txt", 42),
            "Docs/A (conflict 42).txt"
        );
        assert_eq!(conflict_path("Makefile", 42), "Makefile (conflict 42)");
        assert_eq!(
            conflict_path(".hidden", 42),
            ".hidden (conflict 42)"
        );
    }

    #[test]
    fn policy_round_trips_through_parse() {
        for policy in [
            ConflictPolicy::LocalWins,
            ConflictPolicy::RemoteWins,
            ConflictPolicy::KeepBoth,
            ConflictPolicy::Ask,
        ] {
            assert_eq!(ConflictPolicy::parse(policy.as_str()), Some(policy));
        }
        assert_eq!(ConflictPolicy::parse("coin-flip"), None);
        assert_eq!(ConflictPolicy::default(), ConflictPolicy::KeepBoth);
    }

    #[tokio::test]
    async fn ask_resolves_with_delivered_decision() {
        let decisions = std::sync::Arc::new(PendingDecisions::new(DEFAULT_ASK_SNOOZE));
        let waiter = std::sync::Arc::clone(&decisions);
        let handle =
            tokio::spawn(async move { waiter.ask("Docs/A.txt", 1000).await });

        // Wait for the ask to register before resolving.
        loop {
            if !decisions.pending_paths().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        assert_eq!(decisions.pending_paths(), vec!["Docs/A.txt".to_string()]);
        assert!(decisions.resolve("Docs/A.txt", AskDecision::Remote));

        assert_eq!(handle.await.unwrap().unwrap(), AskDecision::Remote);
        assert!(decisions.pending_paths().is_empty());
    }

    #[tokio::test]
    async fn second_simultaneous_ask_is_rejected() {
        let decisions = std::sync::Arc::new(PendingDecisions::new(DEFAULT_ASK_SNOOZE));
        let waiter = std::sync::Arc::clone(&decisions);
        let handle =
            tokio::spawn(async move { waiter.ask("Docs/A.txt", 1000).await });
        loop {
            if !decisions.pending_paths().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }

        let second = decisions.ask("Docs/A.txt", 1000).await;
        assert!(matches!(second, Err(AskError::AskInFlight(_))));

        decisions.resolve("Docs/A.txt", AskDecision::Skip);
        assert_eq!(handle.await.unwrap().unwrap(), AskDecision::Skip);
    }

    #[tokio::test]
    async fn skip_snoozes_the_path() {
        let decisions = std::sync::Arc::new(PendingDecisions::new(Duration::from_secs(60)));
        let waiter = std::sync::Arc::clone(&decisions);
        let handle =
            tokio::spawn(async move { waiter.ask("Docs/A.txt", 1000).await });
        loop {
            if !decisions.pending_paths().is_empty() {
                break;
            }
            tokio::task::yield_now().await;
        }
        decisions.resolve("Docs/A.txt", AskDecision::Skip);
        handle.await.unwrap().unwrap();

        assert!(decisions.is_snoozed("Docs/A.txt", 1030));
        assert!(!decisions.is_snoozed("Docs/A.txt", 1061));
        assert!(!decisions.is_snoozed("Docs/Other.txt", 1030));
    }

    #[test]
    fn resolve_without_pending_ask_reports_false() {
        let decisions = PendingDecisions::new(DEFAULT_ASK_SNOOZE);
        assert!(!decisions.resolve("Docs/A.txt", AskDecision::Local));
    }
}

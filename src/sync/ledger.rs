//! In-memory ledger of not-yet-durable read-state changes.
//!
//! The ledger is the authoritative answer to "what should this article
//! look like right now": a diff value if one is pending, the persisted
//! baseline otherwise. Mutations are atomic with respect to readers, and
//! two watch channels announce changes — one per coordinator pipeline —
//! so consumers can debounce bursts instead of reacting to every toggle.
use std::collections::HashMap;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use tokio::sync::watch;

/// Identity of an article as supplied by storage. Flat ids only — the
/// ledger never holds an object graph.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ArticleRef {
    pub article_id: i64,
    pub feed_id: i64,
    pub group_id: Option<i64>,
}

/// A pending desired-state assertion for one article.
///
/// A diff encodes an end-state, not a delta, so applying it twice is
/// harmless. Serialized into the per-account disk cache.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diff {
    pub article_id: i64,
    pub feed_id: i64,
    pub group_id: Option<i64>,
    pub is_unread: bool,
}

impl Diff {
    pub fn article(&self) -> ArticleRef {
        ArticleRef {
            article_id: self.article_id,
            feed_id: self.feed_id,
            group_id: self.group_id,
        }
    }
}

/// What `upsert` did with the requested change.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpsertOutcome {
    /// New diff created; state now differs from the persisted baseline
    Queued,
    /// Existing diff flipped to a new desired value
    Replaced,
    /// Desired value equals the baseline; the pending diff was removed
    Reverted,
    /// Already at the desired value, nothing recorded
    Unchanged,
}

impl UpsertOutcome {
    /// Whether the change still owes a push to a remote service.
    pub fn needs_remote_push(self) -> bool {
        matches!(self, Self::Queued | Self::Replaced)
    }
}

struct LedgerState {
    /// At most one diff per article id
    diffs: HashMap<i64, Diff>,
    /// Subset still owed to the remote provider (value copies survive a
    /// local drain)
    pending_remote: HashMap<i64, Diff>,
    /// Last value confirmed pushed per article; suppresses re-pushes
    synced: HashMap<i64, bool>,
}

/// The ledger plus its two change-notification channels.
pub struct DiffLedger {
    state: Mutex<LedgerState>,
    local_tx: watch::Sender<u64>,
    remote_tx: watch::Sender<u64>,
}

impl Default for DiffLedger {
    fn default() -> Self {
        Self::new()
    }
}

impl DiffLedger {
    pub fn new() -> Self {
        let (local_tx, _) = watch::channel(0);
        let (remote_tx, _) = watch::channel(0);
        Self {
            state: Mutex::new(LedgerState {
                diffs: HashMap::new(),
                pending_remote: HashMap::new(),
                synced: HashMap::new(),
            }),
            local_tx,
            remote_tx,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, LedgerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Record a desired read-state for an article.
    ///
    /// `desired` of `None` toggles: the negation of whatever the user
    /// currently sees (pending diff value, or `baseline_unread`).
    /// A desired value equal to the baseline cancels any pending diff
    /// out entirely — the ledger never holds an entry that asserts what
    /// storage already says.
    pub fn upsert(
        &self,
        article: ArticleRef,
        desired: Option<bool>,
        baseline_unread: bool,
    ) -> UpsertOutcome {
        let mut state = self.lock();
        let existing = state.diffs.get(&article.article_id).copied();
        let desired = desired.unwrap_or_else(|| match existing {
            Some(diff) => !diff.is_unread,
            None => !baseline_unread,
        });

        let outcome = match existing {
            None if desired == baseline_unread => UpsertOutcome::Unchanged,
            None => {
                state.diffs.insert(
                    article.article_id,
                    Diff {
                        article_id: article.article_id,
                        feed_id: article.feed_id,
                        group_id: article.group_id,
                        is_unread: desired,
                    },
                );
                UpsertOutcome::Queued
            }
            Some(_) if desired == baseline_unread => {
                state.diffs.remove(&article.article_id);
                if state.pending_remote.remove(&article.article_id).is_some() {
                    bump(&self.remote_tx);
                }
                UpsertOutcome::Reverted
            }
            Some(diff) if diff.is_unread == desired => UpsertOutcome::Unchanged,
            Some(mut diff) => {
                diff.is_unread = desired;
                state.diffs.insert(article.article_id, diff);
                UpsertOutcome::Replaced
            }
        };
        drop(state);

        if outcome != UpsertOutcome::Unchanged {
            bump(&self.local_tx);
        }
        outcome
    }

    /// The value the UI must render: pending diff value if present, else
    /// the persisted baseline.
    pub fn current_value(&self, article_id: i64, baseline_unread: bool) -> bool {
        self.lock()
            .diffs
            .get(&article_id)
            .map_or(baseline_unread, |d| d.is_unread)
    }

    /// Read-only copy of all pending diffs.
    pub fn snapshot(&self) -> Vec<Diff> {
        self.lock().diffs.values().copied().collect()
    }

    pub fn len(&self) -> usize {
        self.lock().diffs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().diffs.is_empty()
    }

    /// Queue the article's diff for a remote push, unless the last
    /// confirmed push already asserted the same value.
    ///
    /// Returns whether anything was queued.
    pub fn mark_pending_remote(&self, article_id: i64) -> bool {
        let mut state = self.lock();
        let Some(diff) = state.diffs.get(&article_id).copied() else {
            return false;
        };
        if state.synced.get(&article_id) == Some(&diff.is_unread) {
            tracing::debug!(article_id, "skipping remote queue, value already synced");
            return false;
        }
        state.pending_remote.insert(article_id, diff);
        drop(state);
        bump(&self.remote_tx);
        true
    }

    /// Read-only copy of the diffs still owed to the remote service.
    pub fn pending_remote_snapshot(&self) -> Vec<Diff> {
        self.lock().pending_remote.values().copied().collect()
    }

    /// Note a successful remote push of `is_unread` for the article:
    /// leaves the pending set and becomes the synced record.
    pub fn record_synced(&self, article_id: i64, is_unread: bool) {
        let mut state = self.lock();
        state.pending_remote.remove(&article_id);
        state.synced.insert(article_id, is_unread);
    }

    /// Destructively take every pending diff, leaving the ledger empty.
    /// The pending-remote set is untouched; it has its own lifecycle.
    pub fn drain(&self) -> Vec<Diff> {
        let mut state = self.lock();
        state.diffs.drain().map(|(_, d)| d).collect()
    }

    /// Reinsert diffs replayed from the disk cache, last-write-wins per
    /// article id, and wake the local-commit pipeline.
    pub fn restore(&self, diffs: Vec<Diff>) {
        if diffs.is_empty() {
            return;
        }
        let mut state = self.lock();
        for diff in diffs {
            state.diffs.insert(diff.article_id, diff);
        }
        drop(state);
        bump(&self.local_tx);
    }

    /// Forget everything: diffs, pending-remote set, synced records.
    /// Used on account switch after the flush attempt.
    pub fn clear(&self) {
        let mut state = self.lock();
        state.diffs.clear();
        state.pending_remote.clear();
        state.synced.clear();
    }

    /// Change stream for the local-commit pipeline.
    pub fn local_rx(&self) -> watch::Receiver<u64> {
        self.local_tx.subscribe()
    }

    /// Change stream for the remote-sync pipeline.
    pub fn remote_rx(&self) -> watch::Receiver<u64> {
        self.remote_tx.subscribe()
    }
}

fn bump(tx: &watch::Sender<u64>) {
    tx.send_modify(|generation| *generation = generation.wrapping_add(1));
}

// ============================================================================
// Tests
// ============================================================================

//! The two debounced pipelines between the ledger and the world.
//!
//! Local commit: ledger -> storage, draining the ledger in bulk once a
//! burst of changes goes quiet. Remote sync: pending-remote set ->
//! provider, partitioned into one push per asserted value. The pipelines
//! share a quiet period but run independently; a slow provider never
//! delays the local commit.
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinHandle;

use super::cache::DiffCache;
use super::ledger::{ArticleRef, DiffLedger, UpsertOutcome};
use crate::account::{Account, AccountContext};
use crate::error::SyncError;
use crate::provider::ProviderSyncPort;
use crate::storage::Database;

pub struct SyncCoordinator {
    db: Database,
    ledger: Arc<DiffLedger>,
    cache: Arc<DiffCache>,
    provider: Arc<dyn ProviderSyncPort>,
    accounts: Arc<AccountContext>,
    quiet_period: Duration,
    pipelines: Vec<JoinHandle<()>>,
}

impl SyncCoordinator {
    pub fn new(
        db: Database,
        ledger: Arc<DiffLedger>,
        cache: Arc<DiffCache>,
        provider: Arc<dyn ProviderSyncPort>,
        accounts: Arc<AccountContext>,
        quiet_period: Duration,
    ) -> Self {
        Self {
            db,
            ledger,
            cache,
            provider,
            accounts,
            quiet_period,
            pipelines: Vec::new(),
        }
    }

    pub fn ledger(&self) -> &Arc<DiffLedger> {
        &self.ledger
    }

    pub fn db(&self) -> &Database {
        &self.db
    }

    /// Replay the active account's disk snapshot into the ledger and
    /// spawn the pipelines. Replayed diffs were never confirmed durable,
    /// so they re-enter both pipelines.
    pub fn start(&mut self) {
        self.replay_cache();

        let ledger = Arc::clone(&self.ledger);
        let db = self.db.clone();
        let cache = Arc::clone(&self.cache);
        let accounts = Arc::clone(&self.accounts);
        let quiet = self.quiet_period;
        self.pipelines.push(tokio::spawn(async move {
            run_local_pipeline(ledger, db, cache, accounts, quiet).await;
        }));

        if self.accounts.active().kind.is_remote_syncing() {
            let ledger = Arc::clone(&self.ledger);
            let provider = Arc::clone(&self.provider);
            let quiet = self.quiet_period;
            self.pipelines.push(tokio::spawn(async move {
                run_remote_pipeline(ledger, provider, quiet).await;
            }));
        }
    }

    fn replay_cache(&self) {
        let account = self.accounts.active();
        let diffs = self.cache.read_snapshot(&account.id);
        if diffs.is_empty() {
            return;
        }
        tracing::info!(
            account = %account.id,
            count = diffs.len(),
            "replaying cached changes from previous run"
        );
        let ids: Vec<i64> = diffs.iter().map(|d| d.article_id).collect();
        self.ledger.restore(diffs);
        if account.kind.is_remote_syncing() {
            for id in ids {
                self.ledger.mark_pending_remote(id);
            }
        }
    }

    /// Record a read-state change for an article.
    ///
    /// `desired` of `None` toggles the displayed value. An article with
    /// no stored baseline is ignored; there is nothing coherent to
    /// assert about a row that does not exist yet.
    pub async fn queue_change(
        &self,
        article: ArticleRef,
        desired: Option<bool>,
    ) -> Result<UpsertOutcome, SyncError> {
        let account = self.accounts.active();
        let baseline = self
            .db
            .read_state_baseline(&account.id, article.article_id)
            .await
            .map_err(SyncError::storage)?;
        let Some(baseline) = baseline else {
            tracing::warn!(
                article_id = article.article_id,
                "ignoring change for unknown article"
            );
            return Ok(UpsertOutcome::Unchanged);
        };

        let outcome = self.ledger.upsert(article, desired, baseline);
        if outcome.needs_remote_push() && account.kind.is_remote_syncing() {
            self.ledger.mark_pending_remote(article.article_id);
        }
        Ok(outcome)
    }

    /// The read-state the UI must render for an article: pending ledger
    /// value if one exists, stored baseline otherwise.
    pub async fn displayed_unread(&self, article_id: i64) -> Result<Option<bool>, SyncError> {
        let account = self.accounts.active();
        let baseline = self
            .db
            .read_state_baseline(&account.id, article_id)
            .await
            .map_err(SyncError::storage)?;
        Ok(baseline.map(|b| self.ledger.current_value(article_id, b)))
    }

    /// Swap the active account: stop the pipelines, flush the outgoing
    /// account's pending changes to its disk snapshot, clear the ledger,
    /// then start fresh with the new account's provider and snapshot.
    ///
    /// Unsynced remote pushes for the old account are abandoned by
    /// design; its local changes survive in the snapshot and replay on
    /// the next switch back.
    pub fn switch_account(&mut self, new_account: Account, provider: Arc<dyn ProviderSyncPort>) {
        self.stop();

        let outgoing = self.accounts.active();
        let pending = self.ledger.snapshot();
        if pending.is_empty() {
            self.cache.clear(&outgoing.id);
        } else {
            self.cache.write_snapshot(&outgoing.id, &pending);
        }
        self.ledger.clear();

        let outgoing = self.accounts.switch(new_account);
        tracing::info!(from = %outgoing.id, to = %self.accounts.active().id, "switched account");
        self.provider = provider;
        self.start();
    }

    /// Persist pending changes and stop the pipelines. The snapshot
    /// replays on the next start.
    pub fn shutdown(&mut self) {
        self.stop();
        let account = self.accounts.active();
        let pending = self.ledger.snapshot();
        if pending.is_empty() {
            self.cache.clear(&account.id);
        } else {
            tracing::info!(
                account = %account.id,
                count = pending.len(),
                "persisting pending changes for next run"
            );
            self.cache.write_snapshot(&account.id, &pending);
        }
    }

    fn stop(&mut self) {
        for handle in self.pipelines.drain(..) {
            handle.abort();
        }
    }
}

impl Drop for SyncCoordinator {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Pipelines
// ============================================================================

async fn run_local_pipeline(
    ledger: Arc<DiffLedger>,
    db: Database,
    cache: Arc<DiffCache>,
    accounts: Arc<AccountContext>,
    quiet: Duration,
) {
    let mut rx = ledger.local_rx();
    // Catch anything queued before the pipeline spawned
    rx.mark_changed();
    loop {
        if rx.changed().await.is_err() {
            break;
        }
        wait_quiet(&mut rx, quiet).await;
        let account = accounts.active();
        commit_local(&ledger, &db, &cache, &account.id).await;
    }
}

async fn run_remote_pipeline(
    ledger: Arc<DiffLedger>,
    provider: Arc<dyn ProviderSyncPort>,
    quiet: Duration,
) {
    let mut rx = ledger.remote_rx();
    rx.mark_changed();
    loop {
        if rx.changed().await.is_err() {
            break;
        }
        wait_quiet(&mut rx, quiet).await;
        push_pending(&ledger, provider.as_ref()).await;
    }
}

/// Absorb a burst: keep resetting the timer until a full quiet period
/// passes with no new generation.
async fn wait_quiet(rx: &mut watch::Receiver<u64>, quiet: Duration) {
    loop {
        match tokio::time::timeout(quiet, rx.changed()).await {
            // Another change landed inside the window; start over
            Ok(Ok(())) => continue,
            // Sender dropped; stop waiting and let the caller drain
            Ok(Err(_)) => return,
            // Quiet period elapsed
            Err(_) => return,
        }
    }
}

/// Drain the ledger into storage, with the disk snapshot as the
/// durability backstop around the destructive drain.
async fn commit_local(ledger: &DiffLedger, db: &Database, cache: &DiffCache, account_id: &str) {
    // Snapshot to disk first: if the process dies mid-commit, the diffs
    // replay on the next run. Replaying an already-applied diff is
    // harmless.
    let snapshot = ledger.snapshot();
    if snapshot.is_empty() {
        // A burst that cancelled itself out still invalidates any stale
        // snapshot on disk
        cache.clear(account_id);
        return;
    }
    cache.write_snapshot(account_id, &snapshot);

    let drained = ledger.drain();
    match db.apply_read_states(account_id, &drained).await {
        Ok(changed) => {
            tracing::debug!(
                account = account_id,
                drained = drained.len(),
                changed,
                "committed read-state batch"
            );
            // Changes queued during the write stay snapshotted for the
            // round they will trigger
            let remaining = ledger.snapshot();
            if remaining.is_empty() {
                cache.clear(account_id);
            } else {
                cache.write_snapshot(account_id, &remaining);
            }
        }
        Err(e) => {
            tracing::warn!(
                account = account_id,
                error = %e,
                count = drained.len(),
                "storage commit failed, requeueing batch"
            );
            // Back into the ledger; the restore wakes this pipeline for
            // another pass after the quiet period
            ledger.restore(drained);
        }
    }
}

/// Push the pending-remote set, one call per asserted value. A failed
/// push leaves its partition in the set; the next ledger change
/// triggers another attempt.
async fn push_pending(ledger: &DiffLedger, provider: &dyn ProviderSyncPort) {
    let pending = ledger.pending_remote_snapshot();
    if pending.is_empty() {
        return;
    }

    for target_unread in [false, true] {
        let ids: Vec<i64> = pending
            .iter()
            .filter(|d| d.is_unread == target_unread)
            .map(|d| d.article_id)
            .collect();
        if ids.is_empty() {
            continue;
        }

        match provider.push_read_state(&ids, target_unread).await {
            Ok(accepted) => {
                tracing::debug!(
                    pushed = ids.len(),
                    accepted = accepted.len(),
                    is_unread = target_unread,
                    "pushed read-state batch"
                );
                for id in accepted {
                    ledger.record_synced(id, target_unread);
                }
            }
            Err(e) => {
                tracing::warn!(
                    error = %e,
                    count = ids.len(),
                    is_unread = target_unread,
                    "remote push failed, leaving batch pending"
                );
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

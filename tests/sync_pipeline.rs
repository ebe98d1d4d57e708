//! Integration tests for the change pipelines: ledger -> storage and
//! ledger -> provider, end to end through the coordinator.
//!
//! Each test creates its own in-memory SQLite database and tempdir for
//! isolation, with a short quiet period so the debounce windows run in
//! real time.

use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use tidings::account::{Account, AccountContext, AccountKind};
use tidings::error::SyncError;
use tidings::provider::{ItemBatch, ProviderSyncPort, RemoteItem, SubscriptionTree};
use tidings::storage::Database;
use tidings::sync::{ArticleRef, DiffCache, DiffLedger, SyncCoordinator};

const QUIET: Duration = Duration::from_millis(30);

// ============================================================================
// Recording Provider
// ============================================================================

/// Records every read-state push; optionally fails them all.
#[derive(Default)]
struct RecordingProvider {
    pushes: Mutex<Vec<(Vec<i64>, bool)>>,
    fail_pushes: bool,
}

impl RecordingProvider {
    fn failing() -> Self {
        Self {
            fail_pushes: true,
            ..Self::default()
        }
    }

    fn recorded(&self) -> Vec<(Vec<i64>, bool)> {
        let mut pushes = self.pushes.lock().unwrap().clone();
        for (ids, _) in &mut pushes {
            ids.sort_unstable();
        }
        pushes
    }
}

#[async_trait]
impl ProviderSyncPort for RecordingProvider {
    async fn validate_credentials(&self) -> Result<bool, SyncError> {
        Ok(true)
    }

    async fn fetch_subscription_tree(&self) -> Result<SubscriptionTree, SyncError> {
        Ok(SubscriptionTree::default())
    }

    async fn fetch_items_since(&self, _cursor: Option<&str>) -> Result<ItemBatch, SyncError> {
        Ok(ItemBatch::default())
    }

    async fn push_read_state(&self, ids: &[i64], is_unread: bool) -> Result<Vec<i64>, SyncError> {
        if self.fail_pushes {
            return Err(SyncError::Timeout(Duration::from_secs(10)));
        }
        self.pushes.lock().unwrap().push((ids.to_vec(), is_unread));
        Ok(ids.to_vec())
    }

    async fn push_starred_state(&self, ids: &[i64], _: bool) -> Result<Vec<i64>, SyncError> {
        Ok(ids.to_vec())
    }
}

// ============================================================================
// Fixtures
// ============================================================================

fn item(id: i64, is_unread: bool) -> RemoteItem {
    RemoteItem {
        id,
        feed_id: 10,
        title: format!("Article {id}"),
        url: None,
        summary: None,
        published: Some(1_700_000_000 + id),
        is_unread,
        is_starred: false,
    }
}

fn article(id: i64) -> ArticleRef {
    ArticleRef {
        article_id: id,
        feed_id: 10,
        group_id: None,
    }
}

async fn seeded_db(items: &[RemoteItem]) -> Database {
    let db = Database::open(":memory:").await.unwrap();
    db.upsert_items("home", items, &HashSet::new()).await.unwrap();
    db
}

fn coordinator(
    db: Database,
    provider: Arc<RecordingProvider>,
    dir: &std::path::Path,
) -> SyncCoordinator {
    SyncCoordinator::new(
        db,
        Arc::new(DiffLedger::new()),
        Arc::new(DiffCache::new(dir.to_path_buf())),
        provider,
        Arc::new(AccountContext::new(Account {
            id: "home".to_string(),
            name: "Home".to_string(),
            kind: AccountKind::Fever,
        })),
        QUIET,
    )
}

async fn settle() {
    tokio::time::sleep(QUIET * 6).await;
}

// ============================================================================
// Remote Pipeline
// ============================================================================

#[tokio::test]
async fn test_push_partitions_by_asserted_value() {
    let db = seeded_db(&[item(1, true), item(2, true), item(3, false)]).await;
    let provider = Arc::new(RecordingProvider::default());
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(db.clone(), Arc::clone(&provider), dir.path());
    coordinator.start();

    // Two reads and one unread in a single burst
    coordinator.queue_change(article(1), Some(false)).await.unwrap();
    coordinator.queue_change(article(2), Some(false)).await.unwrap();
    coordinator.queue_change(article(3), Some(true)).await.unwrap();

    settle().await;

    // One call per value, not one per article
    let pushes = provider.recorded();
    assert_eq!(pushes.len(), 2);
    assert!(pushes.contains(&(vec![1, 2], false)));
    assert!(pushes.contains(&(vec![3], true)));

    // Confirmed pushes leave the pending set; storage committed too
    assert!(coordinator.ledger().pending_remote_snapshot().is_empty());
    assert!(coordinator.ledger().is_empty());
    assert_eq!(db.unread_count("home").await.unwrap(), 1);
}

#[tokio::test]
async fn test_burst_collapses_to_single_push() {
    let db = seeded_db(&[item(1, true)]).await;
    let provider = Arc::new(RecordingProvider::default());
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(db, Arc::clone(&provider), dir.path());
    coordinator.start();

    // Rapid toggling inside the quiet window: read, unread, read
    coordinator.queue_change(article(1), None).await.unwrap();
    coordinator.queue_change(article(1), None).await.unwrap();
    coordinator.queue_change(article(1), None).await.unwrap();

    settle().await;

    // Only the final state went out
    let pushes = provider.recorded();
    assert_eq!(pushes.len(), 1);
    assert_eq!(pushes[0], (vec![1], false));
}

#[tokio::test]
async fn test_failed_push_leaves_batch_pending() {
    let db = seeded_db(&[item(1, true), item(2, true)]).await;
    let provider = Arc::new(RecordingProvider::failing());
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(db.clone(), Arc::clone(&provider), dir.path());
    coordinator.start();

    coordinator.queue_change(article(1), Some(false)).await.unwrap();
    coordinator.queue_change(article(2), Some(false)).await.unwrap();

    settle().await;

    // Local commit is independent of the remote failure
    assert_eq!(db.unread_count("home").await.unwrap(), 0);

    // The batch stays owed to the service for a later attempt
    let pending = coordinator.ledger().pending_remote_snapshot();
    assert_eq!(pending.len(), 2);
    assert!(pending.iter().all(|d| !d.is_unread));
}

#[tokio::test]
async fn test_confirmed_value_is_not_repushed() {
    let db = seeded_db(&[item(1, true)]).await;
    let provider = Arc::new(RecordingProvider::default());
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(db.clone(), Arc::clone(&provider), dir.path());
    coordinator.start();

    coordinator.queue_change(article(1), Some(false)).await.unwrap();
    settle().await;
    assert_eq!(provider.recorded().len(), 1);

    // Asserting the now-committed baseline again queues nothing
    coordinator.queue_change(article(1), Some(false)).await.unwrap();
    settle().await;
    assert_eq!(provider.recorded().len(), 1);
}

// ============================================================================
// Local Pipeline
// ============================================================================

#[tokio::test]
async fn test_local_account_never_touches_provider() {
    let db = seeded_db(&[item(1, true)]).await;
    let provider = Arc::new(RecordingProvider::default());
    let dir = tempfile::tempdir().unwrap();

    let mut coordinator = SyncCoordinator::new(
        db.clone(),
        Arc::new(DiffLedger::new()),
        Arc::new(DiffCache::new(dir.path().to_path_buf())),
        Arc::clone(&provider) as Arc<dyn ProviderSyncPort>,
        Arc::new(AccountContext::new(Account {
            id: "home".to_string(),
            name: "Home".to_string(),
            kind: AccountKind::Local,
        })),
        QUIET,
    );
    coordinator.start();

    coordinator.queue_change(article(1), Some(false)).await.unwrap();
    settle().await;

    assert_eq!(db.unread_count("home").await.unwrap(), 0);
    assert!(provider.recorded().is_empty());
    assert!(coordinator.ledger().pending_remote_snapshot().is_empty());
}

#[tokio::test]
async fn test_changes_during_commit_survive_for_next_round() {
    let db = seeded_db(&[item(1, true), item(2, true)]).await;
    let provider = Arc::new(RecordingProvider::default());
    let dir = tempfile::tempdir().unwrap();
    let mut coordinator = coordinator(db.clone(), Arc::clone(&provider), dir.path());
    coordinator.start();

    coordinator.queue_change(article(1), Some(false)).await.unwrap();
    settle().await;

    // A second, separate burst triggers its own commit
    coordinator.queue_change(article(2), Some(false)).await.unwrap();
    settle().await;

    assert_eq!(db.unread_count("home").await.unwrap(), 0);
    assert!(coordinator.ledger().is_empty());
}

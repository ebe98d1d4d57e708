//! Pull-side refresh: subscription tree and item batches into storage.
use std::collections::HashSet;

use super::ledger::DiffLedger;
use crate::error::SyncError;
use crate::provider::ProviderSyncPort;
use crate::storage::Database;

/// Upper bound on batches per refresh; a provider that never stops
/// paginating gets cut off rather than looping forever.
const MAX_PAGES: u32 = 50;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RefreshSummary {
    pub feeds: usize,
    pub new_items: usize,
    pub updated_items: usize,
}

/// Fetch the account's subscription tree and item stream and mirror
/// both into storage.
///
/// Articles with a pending local change keep their local read-state;
/// the provider's word is not authoritative for a value the user
/// changed after our last push. The cursor advances after every
/// persisted batch, so an interrupted refresh resumes where it stopped.
pub async fn refresh_account(
    db: &Database,
    provider: &dyn ProviderSyncPort,
    ledger: &DiffLedger,
    account_id: &str,
) -> Result<RefreshSummary, SyncError> {
    let tree = provider.fetch_subscription_tree().await?;
    db.apply_subscription_tree(account_id, &tree)
        .await
        .map_err(SyncError::storage)?;

    let mut summary = RefreshSummary {
        feeds: tree.feed_count(),
        ..RefreshSummary::default()
    };

    let mut cursor = db.sync_cursor(account_id).await.map_err(SyncError::storage)?;
    for page in 0.. {
        if page >= MAX_PAGES {
            tracing::warn!(
                account = account_id,
                pages = MAX_PAGES,
                "refresh page cap reached, stopping early"
            );
            break;
        }

        let batch = provider.fetch_items_since(cursor.as_deref()).await?;
        if batch.items.is_empty() {
            break;
        }

        let protected: HashSet<i64> = ledger.snapshot().iter().map(|d| d.article_id).collect();
        let stats = db
            .upsert_items(account_id, &batch.items, &protected)
            .await
            .map_err(SyncError::storage)?;
        summary.new_items += stats.inserted;
        summary.updated_items += stats.updated;

        match batch.next_cursor {
            // A cursor that stops moving means the stream is done
            Some(next) if cursor.as_deref() != Some(next.as_str()) => {
                db.set_sync_cursor(account_id, Some(&next))
                    .await
                    .map_err(SyncError::storage)?;
                cursor = Some(next);
            }
            _ => break,
        }
    }

    tracing::info!(
        account = account_id,
        feeds = summary.feeds,
        new_items = summary.new_items,
        updated_items = summary.updated_items,
        "refresh complete"
    );
    Ok(summary)
}

// ============================================================================
// Tests
// ============================================================================

use std::collections::HashSet;

use anyhow::Result;
use sqlx::QueryBuilder;

use super::db::Database;
use super::types::{ArticleRecord, UpsertStats};
use crate::provider::RemoteItem;
use crate::sync::ledger::Diff;

/// Hard cap for list queries.
const MAX_ARTICLES: i64 = 2000;

/// Keeps IN-list updates well under SQLite's 999 parameter limit.
const BATCH_SIZE: usize = 500;

impl Database {
    // ========================================================================
    // Item Upserts
    // ========================================================================

    /// Upsert a refresh batch for an account.
    ///
    /// New rows take the provider's state wholesale. Existing rows get
    /// their metadata refreshed; the provider's read/star state is
    /// applied too, except for ids in `preserve_state` where a local
    /// change is still pending and must not be clobbered. `fetched_at`
    /// keeps the first-seen timestamp on existing rows.
    pub async fn upsert_items(
        &self,
        account_id: &str,
        items: &[RemoteItem],
        preserve_state: &HashSet<i64>,
    ) -> Result<UpsertStats> {
        if items.is_empty() {
            return Ok(UpsertStats::default());
        }

        let now = chrono::Utc::now().timestamp();
        let mut tx = self.pool.begin().await?;
        let mut stats = UpsertStats::default();

        for item in items {
            let inserted = sqlx::query(
                r#"
                INSERT OR IGNORE INTO articles
                    (account_id, id, feed_id, title, url, summary, published,
                     is_unread, is_starred, fetched_at)
                VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
            )
            .bind(account_id)
            .bind(item.id)
            .bind(item.feed_id)
            .bind(&item.title)
            .bind(&item.url)
            .bind(&item.summary)
            .bind(item.published)
            .bind(item.is_unread)
            .bind(item.is_starred)
            .bind(now)
            .execute(&mut *tx)
            .await?
            .rows_affected();

            if inserted > 0 {
                stats.inserted += 1;
                continue;
            }

            if preserve_state.contains(&item.id) {
                sqlx::query(
                    r#"
                    UPDATE articles
                    SET feed_id = ?, title = ?, url = ?, summary = ?, published = ?
                    WHERE account_id = ? AND id = ?
                "#,
                )
                .bind(item.feed_id)
                .bind(&item.title)
                .bind(&item.url)
                .bind(&item.summary)
                .bind(item.published)
                .bind(account_id)
                .bind(item.id)
                .execute(&mut *tx)
                .await?;
            } else {
                sqlx::query(
                    r#"
                    UPDATE articles
                    SET feed_id = ?, title = ?, url = ?, summary = ?, published = ?,
                        is_unread = ?, is_starred = ?
                    WHERE account_id = ? AND id = ?
                "#,
                )
                .bind(item.feed_id)
                .bind(&item.title)
                .bind(&item.url)
                .bind(&item.summary)
                .bind(item.published)
                .bind(item.is_unread)
                .bind(item.is_starred)
                .bind(account_id)
                .bind(item.id)
                .execute(&mut *tx)
                .await?;
            }
            stats.updated += 1;
        }

        tx.commit().await?;
        Ok(stats)
    }

    // ========================================================================
    // Read-state Commits
    // ========================================================================

    /// Apply a drained batch of pending diffs in bulk, returning the
    /// number of rows actually changed. Idempotent: rows already at the
    /// asserted value are filtered out by the `is_unread != ?` guard.
    pub async fn apply_read_states(&self, account_id: &str, diffs: &[Diff]) -> Result<u64> {
        if diffs.is_empty() {
            return Ok(0);
        }

        let mut tx = self.pool.begin().await?;
        let mut changed = 0;

        // One IN-list update per asserted value
        for target_unread in [true, false] {
            let ids: Vec<i64> = diffs
                .iter()
                .filter(|d| d.is_unread == target_unread)
                .map(|d| d.article_id)
                .collect();

            for chunk in ids.chunks(BATCH_SIZE) {
                let mut builder: QueryBuilder<sqlx::Sqlite> =
                    QueryBuilder::new("UPDATE articles SET is_unread = ");
                builder.push_bind(target_unread);
                builder.push(" WHERE account_id = ");
                builder.push_bind(account_id);
                builder.push(" AND is_unread != ");
                builder.push_bind(target_unread);
                builder.push(" AND id IN (");
                let mut separated = builder.separated(", ");
                for id in chunk {
                    separated.push_bind(*id);
                }
                separated.push_unseparated(")");

                changed += builder.build().execute(&mut *tx).await?.rows_affected();
            }
        }

        tx.commit().await?;
        Ok(changed)
    }

    /// The persisted read-state for one article, if it exists.
    pub async fn read_state_baseline(
        &self,
        account_id: &str,
        article_id: i64,
    ) -> Result<Option<bool>> {
        let row: Option<(bool,)> =
            sqlx::query_as("SELECT is_unread FROM articles WHERE account_id = ? AND id = ?")
                .bind(account_id)
                .bind(article_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.map(|(is_unread,)| is_unread))
    }

    /// Set the starred flag, returning whether the row changed.
    pub async fn set_starred(
        &self,
        account_id: &str,
        article_id: i64,
        is_starred: bool,
    ) -> Result<bool> {
        let result = sqlx::query(
            "UPDATE articles SET is_starred = ? WHERE account_id = ? AND id = ? AND is_starred != ?",
        )
        .bind(is_starred)
        .bind(account_id)
        .bind(article_id)
        .bind(is_starred)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    // ========================================================================
    // Queries
    // ========================================================================

    pub async fn find_article(
        &self,
        account_id: &str,
        article_id: i64,
    ) -> Result<Option<ArticleRecord>> {
        let row = sqlx::query_as::<_, ArticleRecord>(
            r#"
            SELECT id, feed_id, title, url, summary, published,
                   is_unread, is_starred, fetched_at
            FROM articles
            WHERE account_id = ? AND id = ?
        "#,
        )
        .bind(account_id)
        .bind(article_id)
        .fetch_optional(&self.pool)
        .await?;
        Ok(row)
    }

    pub async fn articles_for_feed(
        &self,
        account_id: &str,
        feed_id: i64,
        limit: Option<i64>,
    ) -> Result<Vec<ArticleRecord>> {
        let limit = limit.unwrap_or(500).min(MAX_ARTICLES);
        let articles = sqlx::query_as::<_, ArticleRecord>(
            r#"
            SELECT id, feed_id, title, url, summary, published,
                   is_unread, is_starred, fetched_at
            FROM articles
            WHERE account_id = ? AND feed_id = ?
            ORDER BY published DESC, fetched_at DESC
            LIMIT ?
        "#,
        )
        .bind(account_id)
        .bind(feed_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;
        Ok(articles)
    }

    pub async fn unread_count(&self, account_id: &str) -> Result<i64> {
        let row: (i64,) = sqlx::query_as(
            "SELECT COUNT(*) FROM articles WHERE account_id = ? AND is_unread = 1",
        )
        .bind(account_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0)
    }
}

// ============================================================================
// Tests
// ============================================================================

use anyhow::Result;
use sqlx::QueryBuilder;

use super::db::Database;
use super::types::FeedSummary;
use crate::provider::SubscriptionTree;

type FeedRow = (i64, String, String, Option<String>, Option<String>, i64);

impl Database {
    // ========================================================================
    // Subscription Mirror
    // ========================================================================

    /// Mirror a provider's subscription tree into storage.
    ///
    /// Groups and feeds present in the tree are upserted; feeds the
    /// provider no longer lists are removed along with their articles.
    /// All of it commits in one transaction so a failed refresh never
    /// leaves half a tree behind.
    pub async fn apply_subscription_tree(
        &self,
        account_id: &str,
        tree: &SubscriptionTree,
    ) -> Result<()> {
        let mut tx = self.pool.begin().await?;
        let mut kept_feed_ids: Vec<i64> = Vec::new();

        for group in &tree.groups {
            sqlx::query(
                r#"
                INSERT INTO groups (account_id, title)
                VALUES (?, ?)
                ON CONFLICT(account_id, title) DO NOTHING
            "#,
            )
            .bind(account_id)
            .bind(&group.title)
            .execute(&mut *tx)
            .await?;

            let (group_id,): (i64,) =
                sqlx::query_as("SELECT id FROM groups WHERE account_id = ? AND title = ?")
                    .bind(account_id)
                    .bind(&group.title)
                    .fetch_one(&mut *tx)
                    .await?;

            for feed in &group.feeds {
                sqlx::query(
                    r#"
                    INSERT INTO feeds (account_id, id, group_id, title, url, site_url)
                    VALUES (?, ?, ?, ?, ?, ?)
                    ON CONFLICT(account_id, id) DO UPDATE SET
                        group_id = excluded.group_id,
                        title = excluded.title,
                        url = excluded.url,
                        site_url = excluded.site_url
                "#,
                )
                .bind(account_id)
                .bind(feed.id)
                .bind(group_id)
                .bind(&feed.title)
                .bind(&feed.url)
                .bind(&feed.site_url)
                .execute(&mut *tx)
                .await?;
                kept_feed_ids.push(feed.id);
            }
        }

        // Unsubscribed feeds disappear, articles included
        let removed = if kept_feed_ids.is_empty() {
            sqlx::query("DELETE FROM feeds WHERE account_id = ?")
                .bind(account_id)
                .execute(&mut *tx)
                .await?
                .rows_affected()
        } else {
            let mut builder: QueryBuilder<sqlx::Sqlite> =
                QueryBuilder::new("DELETE FROM feeds WHERE account_id = ");
            builder.push_bind(account_id);
            builder.push(" AND id NOT IN (");
            let mut separated = builder.separated(", ");
            for id in &kept_feed_ids {
                separated.push_bind(*id);
            }
            separated.push_unseparated(")");
            builder.build().execute(&mut *tx).await?.rows_affected()
        };

        sqlx::query(
            r#"
            DELETE FROM articles
            WHERE account_id = ?
              AND feed_id NOT IN (SELECT id FROM feeds WHERE account_id = ?)
        "#,
        )
        .bind(account_id)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        // Groups emptied by the delete go too
        sqlx::query(
            r#"
            DELETE FROM groups
            WHERE account_id = ?
              AND id NOT IN (SELECT group_id FROM feeds
                             WHERE account_id = ? AND group_id IS NOT NULL)
        "#,
        )
        .bind(account_id)
        .bind(account_id)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;

        if removed > 0 {
            tracing::debug!(account = account_id, removed, "pruned unsubscribed feeds");
        }
        Ok(())
    }

    /// All feeds for the account with group labels and unread tallies.
    pub async fn feeds_with_unread_counts(&self, account_id: &str) -> Result<Vec<FeedSummary>> {
        let rows: Vec<FeedRow> = sqlx::query_as(
            r#"
            SELECT
                f.id, f.title, f.url, f.site_url, g.title,
                COUNT(CASE WHEN a.is_unread = 1 THEN 1 END) as unread_count
            FROM feeds f
            LEFT JOIN groups g ON f.group_id = g.id
            LEFT JOIN articles a ON a.account_id = f.account_id AND a.feed_id = f.id
            WHERE f.account_id = ?
            GROUP BY f.id
            ORDER BY g.title, f.title
        "#,
        )
        .bind(account_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(rows
            .into_iter()
            .map(
                |(id, title, url, site_url, group_title, unread_count)| FeedSummary {
                    id,
                    title,
                    url,
                    site_url,
                    group_title,
                    unread_count,
                },
            )
            .collect())
    }

    // ========================================================================
    // Sync Cursor
    // ========================================================================

    pub async fn sync_cursor(&self, account_id: &str) -> Result<Option<String>> {
        let row: Option<(Option<String>,)> =
            sqlx::query_as("SELECT cursor FROM sync_state WHERE account_id = ?")
                .bind(account_id)
                .fetch_optional(&self.pool)
                .await?;
        Ok(row.and_then(|(cursor,)| cursor))
    }

    pub async fn set_sync_cursor(&self, account_id: &str, cursor: Option<&str>) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_state (account_id, cursor)
            VALUES (?, ?)
            ON CONFLICT(account_id) DO UPDATE SET cursor = excluded.cursor
        "#,
        )
        .bind(account_id)
        .bind(cursor)
        .execute(&self.pool)
        .await?;
        Ok(())
    }
}

// ============================================================================
// Tests
// ============================================================================

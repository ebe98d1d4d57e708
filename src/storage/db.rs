use std::str::FromStr;
use std::time::Duration;

use anyhow::Result;
use sqlx::{
    sqlite::{SqliteConnectOptions, SqlitePoolOptions},
    SqlitePool,
};

// ============================================================================
// Database
// ============================================================================

#[derive(Clone)]
pub struct Database {
    pub(crate) pool: SqlitePool,
}

impl Database {
    /// Open a database connection and run migrations.
    pub async fn open(path: &str) -> Result<Self> {
        let url = format!("sqlite:{}?mode=rwc", path);

        // busy_timeout: wait out transient lock contention between the
        // commit pipeline and refresh instead of surfacing SQLITE_BUSY.
        // pragma() on the options so every pooled connection inherits it.
        let options = SqliteConnectOptions::from_str(&url)?.pragma("busy_timeout", "5000");
        // SQLite is single-writer; 5 connections covers the commit
        // pipeline plus refresh plus read queries.
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .acquire_timeout(Duration::from_secs(10))
            .connect_with(options)
            .await?;

        let db = Self { pool };
        db.migrate().await?;
        Ok(db)
    }

    /// Run schema migrations inside a single transaction.
    ///
    /// Everything uses `IF NOT EXISTS`, so re-running on an existing
    /// database is a no-op.
    async fn migrate(&self) -> Result<()> {
        // Per-connection setting, must stay outside the transaction
        sqlx::query("PRAGMA foreign_keys = ON")
            .execute(&self.pool)
            .await?;

        let mut tx = self.pool.begin().await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS groups (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                account_id TEXT NOT NULL,
                title TEXT NOT NULL,
                UNIQUE(account_id, title)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // Feed ids come from the provider, so the primary key is
        // per-account composite rather than an autoincrement rowid.
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS feeds (
                account_id TEXT NOT NULL,
                id INTEGER NOT NULL,
                group_id INTEGER REFERENCES groups(id) ON DELETE SET NULL,
                title TEXT NOT NULL,
                url TEXT NOT NULL,
                site_url TEXT,
                PRIMARY KEY(account_id, id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS articles (
                account_id TEXT NOT NULL,
                id INTEGER NOT NULL,
                feed_id INTEGER NOT NULL,
                title TEXT NOT NULL,
                url TEXT,
                summary TEXT,
                published INTEGER,
                is_unread INTEGER NOT NULL DEFAULT 1,
                is_starred INTEGER NOT NULL DEFAULT 0,
                fetched_at INTEGER NOT NULL,
                PRIMARY KEY(account_id, id)
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        // One cursor row per account, advanced after each refresh
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS sync_state (
                account_id TEXT PRIMARY KEY,
                cursor TEXT
            )
        "#,
        )
        .execute(&mut *tx)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_feed ON articles(account_id, feed_id)")
            .execute(&mut *tx)
            .await?;
        sqlx::query("CREATE INDEX IF NOT EXISTS idx_articles_unread ON articles(is_unread)")
            .execute(&mut *tx)
            .await?;
        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_articles_published ON articles(published DESC)",
        )
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(())
    }
}

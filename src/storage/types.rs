use sqlx::FromRow;

/// One stored article, as the UI and CLI read it.
#[derive(Debug, Clone, FromRow)]
pub struct ArticleRecord {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub url: Option<String>,
    pub summary: Option<String>,
    pub published: Option<i64>,
    pub is_unread: bool,
    pub is_starred: bool,
    pub fetched_at: i64,
}

/// A feed with its group label and unread tally.
#[derive(Debug, Clone)]
pub struct FeedSummary {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub site_url: Option<String>,
    pub group_title: Option<String>,
    pub unread_count: i64,
}

/// What one item-upsert pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct UpsertStats {
    pub inserted: usize,
    pub updated: usize,
}

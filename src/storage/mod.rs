mod articles;
mod db;
mod feeds;
mod types;

pub use db::Database;
pub use types::{ArticleRecord, FeedSummary, UpsertStats};

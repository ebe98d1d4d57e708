pub mod cache;
pub mod coordinator;
pub mod ledger;
pub mod refresh;
pub mod retry;

pub use cache::DiffCache;
pub use coordinator::SyncCoordinator;
pub use ledger::{ArticleRef, Diff, DiffLedger, UpsertOutcome};
pub use refresh::{refresh_account, RefreshSummary};
pub use retry::{RetryExecutor, RetryOutcome, RetryPolicy};

//! Feed-reader sync core: an in-memory ledger of read-state changes,
//! two debounced pipelines committing them to local storage and a
//! remote service, and pluggable provider adapters.

pub mod account;
pub mod config;
pub mod error;
pub mod provider;
pub mod storage;
pub mod sync;

pub use account::{Account, AccountContext, AccountKind};
pub use config::Config;
pub use error::SyncError;
pub use storage::Database;
pub use sync::{DiffCache, DiffLedger, SyncCoordinator};

//! Provider sync port: the contract every account adapter implements.
//!
//! The coordinator and refresh flow are written once against
//! [`ProviderSyncPort`] and stay agnostic to the active protocol; the
//! adapters own their protocol quirks, their session credentials, and
//! their use of the retry executor.
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use secrecy::SecretString;

use crate::account::AccountKind;
use crate::config::AccountConfig;
use crate::error::SyncError;
use crate::sync::retry::RetryPolicy;

pub mod fever;
pub mod greader;
pub mod local;

pub use fever::FeverClient;
pub use greader::GReaderClient;
pub use local::LocalProvider;

// ============================================================================
// Wire-agnostic Types
// ============================================================================

/// Read-only group/feed snapshot from a provider's discovery call.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SubscriptionTree {
    pub groups: Vec<GroupNode>,
}

impl SubscriptionTree {
    pub fn feed_count(&self) -> usize {
        self.groups.iter().map(|g| g.feeds.len()).sum()
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupNode {
    pub title: String,
    pub feeds: Vec<FeedNode>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FeedNode {
    pub id: i64,
    pub title: String,
    pub url: String,
    pub site_url: Option<String>,
}

/// One article as delivered by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteItem {
    pub id: i64,
    pub feed_id: i64,
    pub title: String,
    pub url: Option<String>,
    pub summary: Option<String>,
    pub published: Option<i64>,
    pub is_unread: bool,
    pub is_starred: bool,
}

/// A page of items plus the opaque position to resume from.
///
/// `next_cursor` of `None` means the batch is the end of the stream;
/// callers persist the cursor between refreshes.
#[derive(Debug, Clone, Default)]
pub struct ItemBatch {
    pub items: Vec<RemoteItem>,
    pub next_cursor: Option<String>,
}

// ============================================================================
// The Port
// ============================================================================

/// Operations every sync adapter provides.
///
/// Push operations return the subset of ids the service accepted.
/// Remote adapters manage their own session credential: on an
/// unauthorized signal they invalidate it and transparently repeat the
/// single call once with a fresh one before surfacing failure — layered
/// underneath the retry executor's generic attempts, not a substitute
/// for them.
#[async_trait]
pub trait ProviderSyncPort: Send + Sync {
    /// Credential probe used by account setup. `Ok(false)` means the
    /// service answered and said no.
    async fn validate_credentials(&self) -> Result<bool, SyncError>;

    async fn fetch_subscription_tree(&self) -> Result<SubscriptionTree, SyncError>;

    /// Fetch items newer than `cursor`; `None` starts from the beginning.
    async fn fetch_items_since(&self, cursor: Option<&str>) -> Result<ItemBatch, SyncError>;

    async fn push_read_state(&self, ids: &[i64], is_unread: bool) -> Result<Vec<i64>, SyncError>;

    async fn push_starred_state(&self, ids: &[i64], is_starred: bool)
        -> Result<Vec<i64>, SyncError>;
}

// ============================================================================
// Factory
// ============================================================================

/// Build the adapter for a configured account.
pub fn provider_for(
    account: &AccountConfig,
    client: reqwest::Client,
    retry: RetryPolicy,
) -> Result<Arc<dyn ProviderSyncPort>> {
    match account.kind {
        AccountKind::Local => Ok(Arc::new(LocalProvider::new())),
        AccountKind::Fever => {
            let (endpoint, username, password) = remote_credentials(account)?;
            let fever = FeverClient::new(&endpoint, username, password, client, retry)
                .with_context(|| format!("invalid fever endpoint for account '{}'", account.id))?;
            Ok(Arc::new(fever))
        }
        AccountKind::GoogleReader => {
            let (endpoint, username, password) = remote_credentials(account)?;
            Ok(Arc::new(GReaderClient::new(
                &endpoint, username, password, client, retry,
            )))
        }
    }
}

fn remote_credentials(account: &AccountConfig) -> Result<(String, String, SecretString)> {
    let endpoint = match &account.endpoint {
        Some(e) => e.clone(),
        None => bail!("account '{}' needs an endpoint", account.id),
    };
    let username = match &account.username {
        Some(u) => u.clone(),
        None => bail!("account '{}' needs a username", account.id),
    };
    let password = match &account.password {
        Some(p) => p.clone(),
        None => bail!("account '{}' needs a password", account.id),
    };
    Ok((endpoint, username, password))
}

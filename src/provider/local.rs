//! The no-op adapter for on-device accounts.
//!
//! Local accounts have no remote counterpart: pushes report full
//! success immediately and fetches return nothing, so the coordinator
//! can treat every account uniformly.
use async_trait::async_trait;

use super::{ItemBatch, ProviderSyncPort, SubscriptionTree};
use crate::error::SyncError;

#[derive(Debug, Default)]
pub struct LocalProvider;

impl LocalProvider {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl ProviderSyncPort for LocalProvider {
    async fn validate_credentials(&self) -> Result<bool, SyncError> {
        Ok(true)
    }

    async fn fetch_subscription_tree(&self) -> Result<SubscriptionTree, SyncError> {
        Ok(SubscriptionTree::default())
    }

    async fn fetch_items_since(&self, _cursor: Option<&str>) -> Result<ItemBatch, SyncError> {
        Ok(ItemBatch::default())
    }

    async fn push_read_state(&self, ids: &[i64], _is_unread: bool) -> Result<Vec<i64>, SyncError> {
        Ok(ids.to_vec())
    }

    async fn push_starred_state(
        &self,
        ids: &[i64],
        _is_starred: bool,
    ) -> Result<Vec<i64>, SyncError> {
        Ok(ids.to_vec())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_local_pushes_accept_everything() {
        let provider = LocalProvider::new();
        assert_eq!(
            provider.push_read_state(&[1, 2, 3], false).await.unwrap(),
            vec![1, 2, 3]
        );
        assert_eq!(
            provider.push_starred_state(&[4], true).await.unwrap(),
            vec![4]
        );
        assert!(provider.validate_credentials().await.unwrap());
        assert!(provider
            .fetch_subscription_tree()
            .await
            .unwrap()
            .groups
            .is_empty());
        assert!(provider.fetch_items_since(None).await.unwrap().items.is_empty());
    }
}

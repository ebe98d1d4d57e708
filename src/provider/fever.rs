//! Fever-style sync adapter.
//!
//! The protocol is a single endpoint taking `?api&<verb>` query strings
//! with the API key in a form-encoded POST body. Every response carries
//! an `auth` flag; `auth: 0` means the key was rejected. The key is
//! derived from the configured credentials, cached, and re-derived once
//! on rejection before the failure surfaces — credentials rotated in a
//! keychain look exactly like an expired session from here.
use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};
use url::Url;

use super::{
    FeedNode, GroupNode, ItemBatch, ProviderSyncPort, RemoteItem, SubscriptionTree,
};
use crate::error::SyncError;
use crate::sync::retry::{RetryExecutor, RetryPolicy};

pub struct FeverClient {
    client: reqwest::Client,
    endpoint: Url,
    username: String,
    password: SecretString,
    api_key: Mutex<Option<String>>,
    retry: RetryExecutor,
}

// ============================================================================
// Wire Payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct GroupsPayload {
    #[serde(default)]
    groups: Vec<WireGroup>,
    #[serde(default)]
    feeds_groups: Vec<WireFeedsGroup>,
}

#[derive(Debug, Deserialize)]
struct WireGroup {
    id: i64,
    title: String,
}

#[derive(Debug, Deserialize)]
struct WireFeedsGroup {
    group_id: i64,
    /// Comma-joined feed ids, e.g. `"1,5,12"`
    feed_ids: String,
}

#[derive(Debug, Deserialize)]
struct FeedsPayload {
    #[serde(default)]
    feeds: Vec<WireFeed>,
}

#[derive(Debug, Deserialize)]
struct WireFeed {
    id: i64,
    title: String,
    url: String,
    #[serde(default)]
    site_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ItemsPayload {
    #[serde(default)]
    items: Vec<WireItem>,
}

#[derive(Debug, Deserialize)]
struct WireItem {
    id: i64,
    feed_id: i64,
    #[serde(default)]
    title: String,
    #[serde(default)]
    url: Option<String>,
    #[serde(default)]
    html: Option<String>,
    /// 0/1 flags, the Fever way
    #[serde(default)]
    is_read: u8,
    #[serde(default)]
    is_saved: u8,
    #[serde(default)]
    created_on_time: Option<i64>,
}

// ============================================================================
// Client
// ============================================================================

impl FeverClient {
    pub fn new(
        endpoint: &str,
        username: String,
        password: SecretString,
        client: reqwest::Client,
        retry: RetryPolicy,
    ) -> Result<Self, url::ParseError> {
        Ok(Self {
            client,
            endpoint: Url::parse(endpoint)?,
            username,
            password,
            api_key: Mutex::new(None),
            retry: RetryExecutor::new(retry),
        })
    }

    /// Key derived from `user:password`. Cached until the service
    /// rejects it.
    fn current_key(&self) -> String {
        let mut guard = self.api_key.lock().unwrap_or_else(|e| e.into_inner());
        guard
            .get_or_insert_with(|| {
                let mut hasher = Sha256::new();
                hasher.update(self.username.as_bytes());
                hasher.update(b":");
                hasher.update(self.password.expose_secret().as_bytes());
                format!("{:x}", hasher.finalize())
            })
            .clone()
    }

    fn invalidate_key(&self) {
        *self.api_key.lock().unwrap_or_else(|e| e.into_inner()) = None;
    }

    /// One API call with the one-shot re-key on rejection.
    async fn call(&self, action: &str) -> Result<Value, SyncError> {
        match self.call_once(action).await {
            Err(SyncError::Unauthorized) => {
                tracing::debug!(action, "fever rejected api key, re-deriving and retrying once");
                self.invalidate_key();
                self.call_once(action).await
            }
            other => other,
        }
    }

    async fn call_once(&self, action: &str) -> Result<Value, SyncError> {
        let mut url = self.endpoint.clone();
        let query = if action.is_empty() {
            "api".to_string()
        } else {
            format!("api&{action}")
        };
        url.set_query(Some(&query));

        let form = [("api_key", self.current_key())];
        let response = self.client.post(url).form(&form).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::Unauthorized);
        }
        let response = response.error_for_status()?;

        let body: Value = response
            .json()
            .await
            .map_err(|e| SyncError::Protocol(format!("invalid json: {e}")))?;

        match body.get("auth").and_then(Value::as_i64) {
            Some(1) => Ok(body),
            Some(_) => Err(SyncError::Unauthorized),
            None => Err(SyncError::Protocol("response missing auth flag".into())),
        }
    }

    async fn tree_once(&self) -> Result<SubscriptionTree, SyncError> {
        let groups: GroupsPayload = decode(self.call("groups").await?)?;
        let feeds: FeedsPayload = decode(self.call("feeds").await?)?;

        let mut tree = SubscriptionTree::default();
        let mut placed = std::collections::HashSet::new();

        for group in groups.groups {
            let ids: Vec<i64> = groups
                .feeds_groups
                .iter()
                .filter(|fg| fg.group_id == group.id)
                .flat_map(|fg| fg.feed_ids.split(','))
                .filter_map(|id| id.trim().parse().ok())
                .collect();

            let group_feeds: Vec<FeedNode> = feeds
                .feeds
                .iter()
                .filter(|f| ids.contains(&f.id))
                .map(to_feed_node)
                .collect();
            placed.extend(group_feeds.iter().map(|f| f.id));

            tree.groups.push(GroupNode {
                title: group.title,
                feeds: group_feeds,
            });
        }

        // Feeds the server never grouped
        let orphans: Vec<FeedNode> = feeds
            .feeds
            .iter()
            .filter(|f| !placed.contains(&f.id))
            .map(to_feed_node)
            .collect();
        if !orphans.is_empty() {
            tree.groups.push(GroupNode {
                title: "Ungrouped".to_string(),
                feeds: orphans,
            });
        }

        Ok(tree)
    }

    async fn items_once(&self, cursor: Option<&str>) -> Result<ItemBatch, SyncError> {
        let action = match cursor {
            Some(since_id) => format!("items&since_id={since_id}"),
            None => "items".to_string(),
        };
        let payload: ItemsPayload = decode(self.call(&action).await?)?;

        let next_cursor = payload
            .items
            .iter()
            .map(|i| i.id)
            .max()
            .map(|max| max.to_string());

        let items = payload
            .items
            .into_iter()
            .map(|item| RemoteItem {
                id: item.id,
                feed_id: item.feed_id,
                title: item.title,
                url: item.url,
                summary: item.html,
                published: item.created_on_time,
                is_unread: item.is_read == 0,
                is_starred: item.is_saved != 0,
            })
            .collect();

        Ok(ItemBatch { items, next_cursor })
    }

    async fn mark_once(&self, as_state: &str, joined_ids: &str) -> Result<(), SyncError> {
        self.call(&format!("mark=item&as={as_state}&id={joined_ids}"))
            .await
            .map(|_| ())
    }
}

fn to_feed_node(feed: &WireFeed) -> FeedNode {
    FeedNode {
        id: feed.id,
        title: feed.title.clone(),
        url: feed.url.clone(),
        site_url: feed.site_url.clone(),
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: Value) -> Result<T, SyncError> {
    serde_json::from_value(body).map_err(|e| SyncError::Protocol(format!("unexpected shape: {e}")))
}

fn join_ids(ids: &[i64]) -> String {
    ids.iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(",")
}

// ============================================================================
// Port Implementation
// ============================================================================

#[async_trait]
impl ProviderSyncPort for FeverClient {
    async fn validate_credentials(&self) -> Result<bool, SyncError> {
        let probe = self
            .retry
            .run_with(|| self.call(""), SyncError::is_retryable, log_retry)
            .await
            .into_result();
        match probe {
            Ok(_) => Ok(true),
            Err(SyncError::Unauthorized) => Ok(false),
            Err(e) => Err(e),
        }
    }

    async fn fetch_subscription_tree(&self) -> Result<SubscriptionTree, SyncError> {
        self.retry
            .run_with(|| self.tree_once(), SyncError::is_retryable, log_retry)
            .await
            .into_result()
    }

    async fn fetch_items_since(&self, cursor: Option<&str>) -> Result<ItemBatch, SyncError> {
        self.retry
            .run_with(|| self.items_once(cursor), SyncError::is_retryable, log_retry)
            .await
            .into_result()
    }

    async fn push_read_state(&self, ids: &[i64], is_unread: bool) -> Result<Vec<i64>, SyncError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = join_ids(ids);
        let as_state = if is_unread { "unread" } else { "read" };
        self.retry
            .run_with(
                || self.mark_once(as_state, &joined),
                SyncError::is_retryable,
                log_retry,
            )
            .await
            .into_result()?;
        Ok(ids.to_vec())
    }

    async fn push_starred_state(
        &self,
        ids: &[i64],
        is_starred: bool,
    ) -> Result<Vec<i64>, SyncError> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let joined = join_ids(ids);
        let as_state = if is_starred { "saved" } else { "unsaved" };
        self.retry
            .run_with(
                || self.mark_once(as_state, &joined),
                SyncError::is_retryable,
                log_retry,
            )
            .await
            .into_result()?;
        Ok(ids.to_vec())
    }
}

fn log_retry(attempt: u32, error: &SyncError) {
    tracing::debug!(provider = "fever", attempt, error = %error, "retrying after transient failure");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> FeverClient {
        FeverClient::new(
            &format!("{}/fever", server.uri()),
            "reader".to_string(),
            SecretString::from("hunter2"),
            reqwest::Client::new(),
            RetryPolicy {
                attempts: 1,
                ..RetryPolicy::default()
            },
        )
        .unwrap()
    }

    fn authed(body: serde_json::Value) -> ResponseTemplate {
        let mut merged = serde_json::json!({"api_version": 3, "auth": 1});
        if let (Some(m), Some(b)) = (merged.as_object_mut(), body.as_object()) {
            for (k, v) in b {
                m.insert(k.clone(), v.clone());
            }
        }
        ResponseTemplate::new(200).set_body_json(merged)
    }

    #[tokio::test]
    async fn test_subscription_tree_joins_groups_and_feeds() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fever"))
            .and(query_param("groups", ""))
            .respond_with(authed(serde_json::json!({
                "groups": [{"id": 1, "title": "News"}],
                "feeds_groups": [{"group_id": 1, "feed_ids": "10,11"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/fever"))
            .and(query_param("feeds", ""))
            .respond_with(authed(serde_json::json!({
                "feeds": [
                    {"id": 10, "title": "Ten", "url": "https://ten.example/feed"},
                    {"id": 11, "title": "Eleven", "url": "https://eleven.example/feed"},
                    {"id": 12, "title": "Stray", "url": "https://stray.example/feed"}
                ]
            })))
            .mount(&server)
            .await;

        let tree = client_for(&server).fetch_subscription_tree().await.unwrap();

        assert_eq!(tree.groups.len(), 2);
        assert_eq!(tree.groups[0].title, "News");
        assert_eq!(tree.groups[0].feeds.len(), 2);
        assert_eq!(tree.groups[1].title, "Ungrouped");
        assert_eq!(tree.groups[1].feeds[0].id, 12);
        assert_eq!(tree.feed_count(), 3);
    }

    #[tokio::test]
    async fn test_items_map_flags_and_advance_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fever"))
            .and(query_param("items", ""))
            .and(query_param("since_id", "40"))
            .respond_with(authed(serde_json::json!({
                "items": [
                    {"id": 41, "feed_id": 10, "title": "A", "is_read": 0, "is_saved": 1,
                     "created_on_time": 1700000000},
                    {"id": 43, "feed_id": 10, "title": "B", "is_read": 1, "is_saved": 0}
                ]
            })))
            .mount(&server)
            .await;

        let batch = client_for(&server)
            .fetch_items_since(Some("40"))
            .await
            .unwrap();

        assert_eq!(batch.items.len(), 2);
        assert!(batch.items[0].is_unread);
        assert!(batch.items[0].is_starred);
        assert!(!batch.items[1].is_unread);
        assert_eq!(batch.next_cursor.as_deref(), Some("43"));
    }

    #[tokio::test]
    async fn test_mark_read_posts_batch_with_api_key() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fever"))
            .and(query_param("as", "read"))
            .and(query_param("id", "1,3"))
            .and(body_string_contains("api_key="))
            .respond_with(authed(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let accepted = client_for(&server)
            .push_read_state(&[1, 3], false)
            .await
            .unwrap();
        assert_eq!(accepted, vec![1, 3]);
    }

    #[tokio::test]
    async fn test_mark_starred_uses_saved_verb() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fever"))
            .and(query_param("as", "saved"))
            .respond_with(authed(serde_json::json!({})))
            .expect(1)
            .mount(&server)
            .await;

        let accepted = client_for(&server)
            .push_starred_state(&[7], true)
            .await
            .unwrap();
        assert_eq!(accepted, vec![7]);
    }

    #[tokio::test]
    async fn test_rejected_key_retried_once_then_surfaces() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fever"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({
                    "api_version": 3, "auth": 0
                })),
            )
            .expect(2) // original call + one re-keyed repeat
            .mount(&server)
            .await;

        let valid = client_for(&server).validate_credentials().await.unwrap();
        assert!(!valid);
    }

    #[tokio::test]
    async fn test_malformed_response_is_protocol_error() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/fever"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>nope</html>"))
            .expect(1) // not retried
            .mount(&server)
            .await;

        let err = client_for(&server)
            .fetch_items_since(None)
            .await
            .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[tokio::test]
    async fn test_empty_push_skips_network() {
        let server = MockServer::start().await;
        // No mocks mounted: any request would 404 into an error
        let accepted = client_for(&server).push_read_state(&[], true).await.unwrap();
        assert!(accepted.is_empty());
    }
}

//! GoogleReader-style sync adapter.
//!
//! Auth is ClientLogin: one POST exchanging username/password for a
//! token sent as `Authorization: GoogleLogin auth=...` on every other
//! request. Tokens expire server-side at the service's whim, so a 401
//! invalidates the cached token and transparently repeats the single
//! call once with a fresh login before surfacing failure.
//!
//! The protocol's ids are strings (`feed/<url>`,
//! `tag:google.com,2005:reader/item/<16 hex digits>`); this module owns
//! the mapping onto the numeric ids the rest of the crate speaks.
use std::sync::Mutex;

use async_trait::async_trait;
use secrecy::{ExposeSecret, SecretString};
use serde::Deserialize;
use sha2::{Digest, Sha256};

use super::{
    FeedNode, GroupNode, ItemBatch, ProviderSyncPort, RemoteItem, SubscriptionTree,
};
use crate::error::SyncError;
use crate::sync::retry::{RetryExecutor, RetryPolicy};

const STATE_READ: &str = "user/-/state/com.google/read";
const STATE_STARRED: &str = "user/-/state/com.google/starred";
const STREAM_READING_LIST: &str = "user/-/state/com.google/reading-list";
const PAGE_SIZE: u32 = 100;

pub struct GReaderClient {
    client: reqwest::Client,
    /// Service root without a trailing slash
    endpoint: String,
    username: String,
    password: SecretString,
    auth_token: Mutex<Option<String>>,
    retry: RetryExecutor,
}

// ============================================================================
// Wire Payloads
// ============================================================================

#[derive(Debug, Deserialize)]
struct SubscriptionsPayload {
    #[serde(default)]
    subscriptions: Vec<WireSubscription>,
}

#[derive(Debug, Deserialize)]
struct WireSubscription {
    /// `feed/<url>`
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    categories: Vec<WireCategory>,
    #[serde(default, rename = "htmlUrl")]
    html_url: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCategory {
    #[serde(default)]
    label: String,
}

#[derive(Debug, Deserialize)]
struct StreamPayload {
    #[serde(default)]
    items: Vec<WireStreamItem>,
    #[serde(default)]
    continuation: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireStreamItem {
    id: String,
    #[serde(default)]
    title: String,
    #[serde(default)]
    published: Option<i64>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(default)]
    alternate: Vec<WireLink>,
    #[serde(default)]
    summary: Option<WireContent>,
    #[serde(default)]
    origin: Option<WireOrigin>,
}

#[derive(Debug, Deserialize)]
struct WireLink {
    #[serde(default)]
    href: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    content: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireOrigin {
    #[serde(default, rename = "streamId")]
    stream_id: Option<String>,
}

// ============================================================================
// Id Mapping
// ============================================================================

/// Deterministic numeric id for a string stream id. Non-negative so it
/// never collides with SQLite rowid conventions.
fn stable_id(stream_id: &str) -> i64 {
    let digest = Sha256::digest(stream_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (i64::from_be_bytes(bytes)) & i64::MAX
}

/// Parse an item id, long form (`tag:...item/<hex>`) or short decimal.
fn parse_item_id(raw: &str) -> Option<i64> {
    if let Some(hex) = raw.rsplit('/').next().filter(|_| raw.starts_with("tag:")) {
        return u64::from_str_radix(hex, 16).ok().map(|v| v as i64);
    }
    raw.parse().ok()
}

/// The long-form id the service expects back on edit-tag.
fn long_item_id(id: i64) -> String {
    format!("tag:google.com,2005:reader/item/{:016x}", id as u64)
}

// ============================================================================
// Client
// ============================================================================

impl GReaderClient {
    pub fn new(
        endpoint: &str,
        username: String,
        password: SecretString,
        client: reqwest::Client,
        retry: RetryPolicy,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            username,
            password,
            auth_token: Mutex::new(None),
            retry: RetryExecutor::new(retry),
        }
    }

    fn cached_token(&self) -> Option<String> {
        self.auth_token
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    fn store_token(&self, token: Option<String>) {
        *self.auth_token.lock().unwrap_or_else(|e| e.into_inner()) = token;
    }

    /// ClientLogin exchange. The response is `key=value` lines; only the
    /// `Auth` line matters.
    async fn login(&self) -> Result<String, SyncError> {
        let url = format!("{}/accounts/ClientLogin", self.endpoint);
        let form = [
            ("Email", self.username.as_str()),
            ("Passwd", self.password.expose_secret()),
        ];
        let response = self.client.post(url).form(&form).send().await?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::Unauthorized);
        }
        let body = response.error_for_status()?.text().await?;

        body.lines()
            .find_map(|line| line.strip_prefix("Auth="))
            .map(|token| token.trim().to_string())
            .ok_or_else(|| SyncError::Protocol("ClientLogin response missing Auth line".into()))
    }

    async fn token(&self) -> Result<String, SyncError> {
        if let Some(token) = self.cached_token() {
            return Ok(token);
        }
        let token = self.login().await?;
        self.store_token(Some(token.clone()));
        Ok(token)
    }

    /// One authenticated request with the one-shot relogin on a rejected
    /// or expired token.
    async fn request(
        &self,
        path: &str,
        query: &[(&str, &str)],
        form: Option<&[(&str, String)]>,
    ) -> Result<String, SyncError> {
        match self.request_once(path, query, form).await {
            Err(SyncError::Unauthorized) => {
                tracing::debug!(path, "token rejected, logging in again and retrying once");
                self.store_token(None);
                self.request_once(path, query, form).await
            }
            other => other,
        }
    }

    async fn request_once(
        &self,
        path: &str,
        query: &[(&str, &str)],
        form: Option<&[(&str, String)]>,
    ) -> Result<String, SyncError> {
        let token = self.token().await?;
        let url = format!("{}/reader/api/0/{}", self.endpoint, path);

        let mut request = match form {
            Some(fields) => self.client.post(url).form(fields),
            None => self.client.get(url),
        };
        request = request
            .header("Authorization", format!("GoogleLogin auth={token}"))
            .query(query);

        let response = request.send().await?;
        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(SyncError::Unauthorized);
        }
        Ok(response.error_for_status()?.text().await?)
    }

    async fn tree_once(&self) -> Result<SubscriptionTree, SyncError> {
        let body = self
            .request("subscription/list", &[("output", "json")], None)
            .await?;
        let payload: SubscriptionsPayload = decode(&body)?;

        // Group feeds by their first category label; feeds the service
        // never labelled fall into a catch-all at the end.
        let mut tree = SubscriptionTree::default();
        let mut orphans = Vec::new();

        for sub in payload.subscriptions {
            let feed = FeedNode {
                id: stable_id(&sub.id),
                title: sub.title,
                url: sub.id.strip_prefix("feed/").unwrap_or(&sub.id).to_string(),
                site_url: sub.html_url,
            };
            match sub.categories.first().filter(|c| !c.label.is_empty()) {
                Some(category) => {
                    match tree.groups.iter_mut().find(|g| g.title == category.label) {
                        Some(group) => group.feeds.push(feed),
                        None => tree.groups.push(GroupNode {
                            title: category.label.clone(),
                            feeds: vec![feed],
                        }),
                    }
                }
                None => orphans.push(feed),
            }
        }

        if !orphans.is_empty() {
            tree.groups.push(GroupNode {
                title: "Ungrouped".to_string(),
                feeds: orphans,
            });
        }
        Ok(tree)
    }

    async fn items_once(&self, cursor: Option<&str>) -> Result<ItemBatch, SyncError> {
        let page_size = PAGE_SIZE.to_string();
        let mut query: Vec<(&str, &str)> = vec![("output", "json"), ("n", &page_size)];
        if let Some(continuation) = cursor {
            query.push(("c", continuation));
        }

        let path = format!("stream/contents/{STREAM_READING_LIST}");
        let body = self.request(&path, &query, None).await?;
        let payload: StreamPayload = decode(&body)?;

        let items = payload
            .items
            .into_iter()
            .filter_map(|item| {
                let Some(id) = parse_item_id(&item.id) else {
                    tracing::warn!(raw_id = %item.id, "skipping item with unparseable id");
                    return None;
                };
                let feed_id = item
                    .origin
                    .as_ref()
                    .and_then(|o| o.stream_id.as_deref())
                    .map(stable_id)
                    .unwrap_or(0);
                Some(RemoteItem {
                    id,
                    feed_id,
                    title: item.title,
                    url: item.alternate.into_iter().find_map(|l| l.href),
                    summary: item.summary.and_then(|s| s.content),
                    published: item.published,
                    is_unread: !item.categories.iter().any(|c| c.ends_with("state/com.google/read")),
                    is_starred: item
                        .categories
                        .iter()
                        .any(|c| c.ends_with("state/com.google/starred")),
                })
            })
            .collect();

        Ok(ItemBatch {
            items,
            next_cursor: payload.continuation,
        })
    }

    /// Add or remove one state tag on a batch of items.
    async fn edit_tag_once(&self, ids: &[i64], state: &str, add: bool) -> Result<(), SyncError> {
        let mut form: Vec<(&str, String)> = ids.iter().map(|id| ("i", long_item_id(*id))).collect();
        form.push((if add { "a" } else { "r" }, state.to_string()));

        self.request("edit-tag", &[], Some(&form)).await.map(|_| ())
    }
}

fn decode<T: serde::de::DeserializeOwned>(body: &str) -> Result<T, SyncError> {
    serde_json::from_str(body).map_err(|e| SyncError::Protocol(format!("unexpected shape: {e}")))
}

// ============================================================================
// Port Implementation
// ============================================================================

#[async_trait]
impl ProviderSyncPort for GReaderClient {
    async fn validate_credentials(&self) -> Result<bool, SyncError> {
        let probe = self
            .retry
            .run_with(|| self.login(), SyncError::is_retryable, log_retry)
            .await
            .into_result();
        match probe {
            Ok(token) => {
                self.store_token(Some(token));
                Ok(true)
            }
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
        // Unread means removing the read tag, not adding one
        self.retry
            .run_with(
                || self.edit_tag_once(ids, STATE_READ, !is_unread),
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
        self.retry
            .run_with(
                || self.edit_tag_once(ids, STATE_STARRED, is_starred),
                SyncError::is_retryable,
                log_retry,
            )
            .await
            .into_result()?;
        Ok(ids.to_vec())
    }
}

fn log_retry(attempt: u32, error: &SyncError) {
    tracing::debug!(provider = "greader", attempt, error = %error, "retrying after transient failure");
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_string_contains, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn client_for(server: &MockServer) -> GReaderClient {
        GReaderClient::new(
            &server.uri(),
            "reader@example.com".to_string(),
            SecretString::from("hunter2"),
            reqwest::Client::new(),
            RetryPolicy {
                attempts: 1,
                ..RetryPolicy::default()
            },
        )
    }

    async fn mount_login(server: &MockServer, token: &str) {
        Mock::given(method("POST"))
            .and(path("/accounts/ClientLogin"))
            .and(body_string_contains("Email="))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_string(format!("SID=x\nLSID=y\nAuth={token}\n")),
            )
            .mount(server)
            .await;
    }

    #[test]
    fn test_item_id_round_trip() {
        let raw = "tag:google.com,2005:reader/item/00000000000000ab";
        assert_eq!(parse_item_id(raw), Some(0xab));
        assert_eq!(long_item_id(0xab), raw);
        // Short decimal form
        assert_eq!(parse_item_id("171"), Some(171));
        assert_eq!(parse_item_id("not-an-id"), None);
    }

    #[test]
    fn test_stable_id_is_deterministic_and_non_negative() {
        let a = stable_id("feed/https://ten.example/feed");
        assert_eq!(a, stable_id("feed/https://ten.example/feed"));
        assert!(a >= 0);
        assert_ne!(a, stable_id("feed/https://eleven.example/feed"));
    }

    #[tokio::test]
    async fn test_subscriptions_group_by_label() {
        let server = MockServer::start().await;
        mount_login(&server, "tok1").await;
        Mock::given(method("GET"))
            .and(path("/reader/api/0/subscription/list"))
            .and(header("Authorization", "GoogleLogin auth=tok1"))
            .and(query_param("output", "json"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "subscriptions": [
                    {"id": "feed/https://ten.example/feed", "title": "Ten",
                     "categories": [{"id": "user/-/label/News", "label": "News"}]},
                    {"id": "feed/https://eleven.example/feed", "title": "Eleven",
                     "categories": [{"id": "user/-/label/News", "label": "News"}]},
                    {"id": "feed/https://stray.example/feed", "title": "Stray",
                     "categories": []}
                ]
            })))
            .mount(&server)
            .await;

        let tree = client_for(&server).fetch_subscription_tree().await.unwrap();

        assert_eq!(tree.groups.len(), 2);
        assert_eq!(tree.groups[0].title, "News");
        assert_eq!(tree.groups[0].feeds.len(), 2);
        assert_eq!(tree.groups[0].feeds[0].url, "https://ten.example/feed");
        assert_eq!(tree.groups[1].title, "Ungrouped");
        assert_eq!(tree.feed_count(), 3);
    }

    #[tokio::test]
    async fn test_stream_items_map_states_and_continuation() {
        let server = MockServer::start().await;
        mount_login(&server, "tok1").await;
        Mock::given(method("GET"))
            .and(path(
                "/reader/api/0/stream/contents/user/-/state/com.google/reading-list",
            ))
            .and(query_param("c", "page2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "items": [
                    {"id": "tag:google.com,2005:reader/item/00000000000000ab",
                     "title": "A",
                     "published": 1700000000,
                     "categories": ["user/-/state/com.google/starred"],
                     "alternate": [{"href": "https://ten.example/a"}],
                     "summary": {"content": "<p>body</p>"},
                     "origin": {"streamId": "feed/https://ten.example/feed"}},
                    {"id": "tag:google.com,2005:reader/item/00000000000000ac",
                     "title": "B",
                     "categories": ["user/-/state/com.google/read"]}
                ],
                "continuation": "page3"
            })))
            .mount(&server)
            .await;

        let batch = client_for(&server)
            .fetch_items_since(Some("page2"))
            .await
            .unwrap();

        assert_eq!(batch.items.len(), 2);
        assert_eq!(batch.items[0].id, 0xab);
        assert!(batch.items[0].is_unread);
        assert!(batch.items[0].is_starred);
        assert_eq!(
            batch.items[0].feed_id,
            stable_id("feed/https://ten.example/feed")
        );
        assert!(!batch.items[1].is_unread);
        assert_eq!(batch.next_cursor.as_deref(), Some("page3"));
    }

    #[tokio::test]
    async fn test_mark_read_adds_read_tag_for_each_id() {
        let server = MockServer::start().await;
        mount_login(&server, "tok1").await;
        Mock::given(method("POST"))
            .and(path("/reader/api/0/edit-tag"))
            .and(body_string_contains("a=user%2F-%2Fstate%2Fcom.google%2Fread"))
            .and(body_string_contains("00000000000000ab"))
            .and(body_string_contains("00000000000000ac"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        let accepted = client_for(&server)
            .push_read_state(&[0xab, 0xac], false)
            .await
            .unwrap();
        assert_eq!(accepted, vec![0xab, 0xac]);
    }

    #[tokio::test]
    async fn test_mark_unread_removes_read_tag() {
        let server = MockServer::start().await;
        mount_login(&server, "tok1").await;
        Mock::given(method("POST"))
            .and(path("/reader/api/0/edit-tag"))
            .and(body_string_contains("r=user%2F-%2Fstate%2Fcom.google%2Fread"))
            .respond_with(ResponseTemplate::new(200).set_body_string("OK"))
            .expect(1)
            .mount(&server)
            .await;

        client_for(&server).push_read_state(&[1], true).await.unwrap();
    }

    #[tokio::test]
    async fn test_expired_token_triggers_single_relogin() {
        let server = MockServer::start().await;
        mount_login(&server, "tok1").await;

        // First list call is rejected; the retried call must succeed
        Mock::given(method("GET"))
            .and(path("/reader/api/0/subscription/list"))
            .respond_with(ResponseTemplate::new(401))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/reader/api/0/subscription/list"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"subscriptions": []})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let tree = client_for(&server).fetch_subscription_tree().await.unwrap();
        assert_eq!(tree.feed_count(), 0);
    }

    #[tokio::test]
    async fn test_bad_credentials_validate_false() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/accounts/ClientLogin"))
            .respond_with(ResponseTemplate::new(403).set_body_string("Error=BadAuthentication"))
            .mount(&server)
            .await;

        assert!(!client_for(&server).validate_credentials().await.unwrap());
    }
}

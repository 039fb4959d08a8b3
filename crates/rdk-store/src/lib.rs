//! Key/value store abstraction backing all persisted reviewdeck entities.
//!
//! Three value shapes: hash-of-records, append-only list-of-records, and
//! scalar blobs. Values cross this boundary as JSON strings; typed
//! encode/decode happens exactly once, in the repository layer above.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use indexmap::IndexMap;
use serde::Deserialize;
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{info, warn};

pub const CRATE_NAME: &str = "rdk-store";

/// Serialized payload ceiling for a single list append. Larger batches are
/// split so no one request exceeds the backend's payload limit.
pub const MAX_APPEND_BYTES: usize = 800 * 1024;

/// Default page size for paged list reads.
pub const LIST_PAGE_SIZE: usize = 500;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store backend error: {0}")]
    Backend(#[source] anyhow::Error),
    #[error("http status {status} from store backend")]
    HttpStatus { status: u16 },
    #[error("codec error: {0}")]
    Codec(#[from] serde_json::Error),
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        StoreError::Backend(err.into())
    }
}

/// Raw kv contract. Hash fields enumerate in insertion order on the memory
/// backend; the REST backend follows whatever order the server returns.
/// `list_range` uses inclusive start/stop indexes, `-1` meaning last element.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>, StoreError>;
    async fn hash_get_all(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError>;
    async fn hash_set(&self, hash: &str, field: &str, value: String) -> Result<(), StoreError>;
    async fn hash_delete(&self, hash: &str, field: &str) -> Result<(), StoreError>;
    async fn list_append(&self, key: &str, items: Vec<String>) -> Result<(), StoreError>;
    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError>;
    async fn list_len(&self, key: &str) -> Result<usize, StoreError>;
    async fn scalar_get(&self, key: &str) -> Result<Option<String>, StoreError>;
    async fn scalar_set(&self, key: &str, value: String) -> Result<(), StoreError>;
    async fn delete(&self, key: &str) -> Result<(), StoreError>;
}

/// Append `items` to a list in chunks, keeping each request's serialized
/// payload under `max_bytes`. An oversized single item still goes out alone.
pub async fn append_chunked(
    store: &dyn KvStore,
    key: &str,
    items: Vec<String>,
    max_bytes: usize,
) -> Result<(), StoreError> {
    let mut chunk: Vec<String> = Vec::new();
    let mut chunk_bytes = 0usize;
    for item in items {
        if !chunk.is_empty() && chunk_bytes + item.len() > max_bytes {
            store.list_append(key, std::mem::take(&mut chunk)).await?;
            chunk_bytes = 0;
        }
        chunk_bytes += item.len();
        chunk.push(item);
    }
    if !chunk.is_empty() {
        store.list_append(key, chunk).await?;
    }
    Ok(())
}

/// Lazy, restartable paged reader over an append-only list. Bounds the
/// per-request payload instead of reading the whole list in one go.
pub struct ListPager<'a> {
    store: &'a dyn KvStore,
    key: String,
    page_size: usize,
    offset: usize,
}

impl<'a> ListPager<'a> {
    pub fn new(store: &'a dyn KvStore, key: impl Into<String>, page_size: usize) -> Self {
        Self {
            store,
            key: key.into(),
            page_size: page_size.max(1),
            offset: 0,
        }
    }

    /// Next page of raw items, or `None` once the list is exhausted.
    pub async fn next_page(&mut self) -> Result<Option<Vec<String>>, StoreError> {
        let start = self.offset as i64;
        let stop = (self.offset + self.page_size - 1) as i64;
        let items = self.store.list_range(&self.key, start, stop).await?;
        if items.is_empty() {
            return Ok(None);
        }
        self.offset += items.len();
        Ok(Some(items))
    }
}

#[derive(Default)]
struct MemoryInner {
    hashes: HashMap<String, IndexMap<String, String>>,
    lists: HashMap<String, Vec<String>>,
    scalars: HashMap<String, String>,
}

/// In-memory fallback store, used whenever no durable backend is configured.
#[derive(Default)]
pub struct MemoryKvStore {
    inner: Mutex<MemoryInner>,
}

impl MemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }
}

fn range_bounds(len: usize, start: i64, stop: i64) -> Option<(usize, usize)> {
    if len == 0 {
        return None;
    }
    let resolve = |idx: i64| -> i64 {
        if idx < 0 {
            len as i64 + idx
        } else {
            idx
        }
    };
    let start = resolve(start).max(0);
    let stop = resolve(stop).min(len as i64 - 1);
    if start > stop {
        return None;
    }
    Some((start as usize, stop as usize))
}

#[async_trait]
impl KvStore for MemoryKvStore {
    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.hashes.get(hash).and_then(|h| h.get(field)).cloned())
    }

    async fn hash_get_all(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner
            .hashes
            .get(hash)
            .map(|h| h.iter().map(|(k, v)| (k.clone(), v.clone())).collect())
            .unwrap_or_default())
    }

    async fn hash_set(&self, hash: &str, field: &str, value: String) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .hashes
            .entry(hash.to_string())
            .or_default()
            .insert(field.to_string(), value);
        Ok(())
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        if let Some(h) = inner.hashes.get_mut(hash) {
            h.shift_remove(field);
        }
        Ok(())
    }

    async fn list_append(&self, key: &str, mut items: Vec<String>) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner
            .lists
            .entry(key.to_string())
            .or_default()
            .append(&mut items);
        Ok(())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let inner = self.inner.lock().await;
        let Some(list) = inner.lists.get(key) else {
            return Ok(Vec::new());
        };
        let Some((start, stop)) = range_bounds(list.len(), start, stop) else {
            return Ok(Vec::new());
        };
        Ok(list[start..=stop].to_vec())
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.lists.get(key).map(Vec::len).unwrap_or(0))
    }

    async fn scalar_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let inner = self.inner.lock().await;
        Ok(inner.scalars.get(key).cloned())
    }

    async fn scalar_set(&self, key: &str, value: String) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.scalars.insert(key.to_string(), value);
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let mut inner = self.inner.lock().await;
        inner.hashes.remove(key);
        inner.lists.remove(key);
        inner.scalars.remove(key);
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct RestReply {
    #[serde(default)]
    result: Option<JsonValue>,
    #[serde(default)]
    error: Option<String>,
}

/// Durable store speaking the Upstash-style Redis REST protocol: one command
/// per POST, JSON array body, bearer-token auth.
pub struct RestKvStore {
    http: reqwest::Client,
    base_url: String,
    token: String,
}

impl RestKvStore {
    pub fn new(base_url: impl Into<String>, token: impl Into<String>) -> Result<Self, StoreError> {
        let http = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(Duration::from_secs(20))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token: token.into(),
        })
    }

    async fn command(&self, cmd: &[&str]) -> Result<JsonValue, StoreError> {
        let resp = self
            .http
            .post(&self.base_url)
            .bearer_auth(&self.token)
            .json(&cmd)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(StoreError::HttpStatus {
                status: status.as_u16(),
            });
        }
        let reply: RestReply = resp.json().await?;
        if let Some(error) = reply.error {
            return Err(StoreError::Backend(anyhow::anyhow!(error)));
        }
        Ok(reply.result.unwrap_or(JsonValue::Null))
    }
}

fn reply_string(value: JsonValue) -> Option<String> {
    match value {
        JsonValue::String(s) => Some(s),
        JsonValue::Null => None,
        other => Some(other.to_string()),
    }
}

fn reply_string_array(value: JsonValue) -> Vec<String> {
    match value {
        JsonValue::Array(items) => items.into_iter().filter_map(reply_string).collect(),
        _ => Vec::new(),
    }
}

#[async_trait]
impl KvStore for RestKvStore {
    async fn hash_get(&self, hash: &str, field: &str) -> Result<Option<String>, StoreError> {
        Ok(reply_string(self.command(&["HGET", hash, field]).await?))
    }

    async fn hash_get_all(&self, hash: &str) -> Result<Vec<(String, String)>, StoreError> {
        // HGETALL replies with a flat [field, value, field, value, ...] array.
        let flat = reply_string_array(self.command(&["HGETALL", hash]).await?);
        Ok(flat
            .chunks_exact(2)
            .map(|pair| (pair[0].clone(), pair[1].clone()))
            .collect())
    }

    async fn hash_set(&self, hash: &str, field: &str, value: String) -> Result<(), StoreError> {
        self.command(&["HSET", hash, field, &value]).await?;
        Ok(())
    }

    async fn hash_delete(&self, hash: &str, field: &str) -> Result<(), StoreError> {
        self.command(&["HDEL", hash, field]).await?;
        Ok(())
    }

    async fn list_append(&self, key: &str, items: Vec<String>) -> Result<(), StoreError> {
        if items.is_empty() {
            return Ok(());
        }
        let mut cmd: Vec<&str> = Vec::with_capacity(items.len() + 2);
        cmd.push("RPUSH");
        cmd.push(key);
        cmd.extend(items.iter().map(String::as_str));
        self.command(&cmd).await?;
        Ok(())
    }

    async fn list_range(&self, key: &str, start: i64, stop: i64) -> Result<Vec<String>, StoreError> {
        let start = start.to_string();
        let stop = stop.to_string();
        Ok(reply_string_array(
            self.command(&["LRANGE", key, &start, &stop]).await?,
        ))
    }

    async fn list_len(&self, key: &str) -> Result<usize, StoreError> {
        let reply = self.command(&["LLEN", key]).await?;
        Ok(reply.as_u64().unwrap_or(0) as usize)
    }

    async fn scalar_get(&self, key: &str) -> Result<Option<String>, StoreError> {
        Ok(reply_string(self.command(&["GET", key]).await?))
    }

    async fn scalar_set(&self, key: &str, value: String) -> Result<(), StoreError> {
        self.command(&["SET", key, &value]).await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        self.command(&["DEL", key]).await?;
        Ok(())
    }
}

/// Pick the store backend once at startup. Both connection variables present
/// selects the durable REST store; anything else silently falls back to the
/// in-memory store.
pub fn open_store_from_env() -> Arc<dyn KvStore> {
    let url = std::env::var("UPSTASH_REDIS_REST_URL").ok();
    let token = std::env::var("UPSTASH_REDIS_REST_TOKEN").ok();
    match (url, token) {
        (Some(url), Some(token)) if !url.is_empty() && !token.is_empty() => {
            match RestKvStore::new(url, token) {
                Ok(store) => {
                    info!("using REST kv store backend");
                    Arc::new(store)
                }
                Err(err) => {
                    warn!(error = %err, "failed to build REST kv store; falling back to memory");
                    Arc::new(MemoryKvStore::new())
                }
            }
        }
        _ => {
            info!("no kv backend configured; using in-memory store");
            Arc::new(MemoryKvStore::new())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn hash_round_trip_preserves_insertion_order() {
        let store = MemoryKvStore::new();
        store.hash_set("apps", "b", "2".into()).await.expect("set");
        store.hash_set("apps", "a", "1".into()).await.expect("set");
        store.hash_set("apps", "c", "3".into()).await.expect("set");

        let all = store.hash_get_all("apps").await.expect("get all");
        let fields: Vec<&str> = all.iter().map(|(k, _)| k.as_str()).collect();
        assert_eq!(fields, vec!["b", "a", "c"]);
        assert_eq!(
            store.hash_get("apps", "a").await.expect("get"),
            Some("1".to_string())
        );
    }

    #[tokio::test]
    async fn hash_delete_removes_only_that_field() {
        let store = MemoryKvStore::new();
        store.hash_set("apps", "a", "1".into()).await.expect("set");
        store.hash_set("apps", "b", "2".into()).await.expect("set");
        store.hash_delete("apps", "a").await.expect("delete");
        assert_eq!(store.hash_get("apps", "a").await.expect("get"), None);
        assert_eq!(store.hash_get_all("apps").await.expect("get all").len(), 1);
    }

    #[tokio::test]
    async fn list_range_supports_negative_stop() {
        let store = MemoryKvStore::new();
        store
            .list_append("l", vec!["x".into(), "y".into(), "z".into()])
            .await
            .expect("append");
        let all = store.list_range("l", 0, -1).await.expect("range");
        assert_eq!(all, vec!["x", "y", "z"]);
        let tail = store.list_range("l", 1, -1).await.expect("range");
        assert_eq!(tail, vec!["y", "z"]);
        let none = store.list_range("l", 5, 9).await.expect("range");
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn pager_walks_list_in_pages_and_terminates() {
        let store = MemoryKvStore::new();
        let items: Vec<String> = (0..7).map(|i| i.to_string()).collect();
        store.list_append("l", items).await.expect("append");

        let mut pager = ListPager::new(&store, "l", 3);
        let mut collected = Vec::new();
        let mut pages = 0;
        while let Some(page) = pager.next_page().await.expect("page") {
            pages += 1;
            collected.extend(page);
        }
        assert_eq!(pages, 3);
        assert_eq!(collected.len(), 7);
        assert_eq!(collected[6], "6");
    }

    #[tokio::test]
    async fn append_chunked_splits_by_payload_size() {
        let store = MemoryKvStore::new();
        let items: Vec<String> = (0..10).map(|_| "x".repeat(100)).collect();
        // 5 items fit per 512-byte chunk.
        append_chunked(&store, "l", items, 512).await.expect("append");
        assert_eq!(store.list_len("l").await.expect("len"), 10);
    }

    #[tokio::test]
    async fn delete_cascades_across_shapes() {
        let store = MemoryKvStore::new();
        store.list_append("reviews:1", vec!["r".into()]).await.expect("append");
        store.scalar_set("rating_history:1", "[]".into()).await.expect("set");
        store.delete("reviews:1").await.expect("delete");
        store.delete("rating_history:1").await.expect("delete");
        assert_eq!(store.list_len("reviews:1").await.expect("len"), 0);
        assert_eq!(store.scalar_get("rating_history:1").await.expect("get"), None);
    }
}

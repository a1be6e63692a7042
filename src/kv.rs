//! Key-value store contract and its HTTP REST implementation.
//!
//! Grounded on the teacher's `reqwest`-based `FacilitatorClient`
//! (`crates/x402-axum/src/facilitator_client.rs`): a cheap-to-clone client wrapping a
//! shared connection pool, bearer-token auth via a fixed `HeaderMap`, and one
//! `thiserror` variant per failure mode. Spec §3/§6 describe the KV store as a remote
//! key-value service reachable over the network (the gateway never embeds a database),
//! so the HTTP surface here targets a Redis-REST-compatible backend (e.g. Upstash).

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("failed to build KV store URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("KV store request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("KV store returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("failed to deserialize KV store response: {0}")]
    Deserialization(#[source] reqwest::Error),
}

/// The operations every stateful component (`store::NonceStore`,
/// `store::IdempotencyStore`, `store::CreditStore`) is built on top of (spec §4.5).
#[async_trait]
pub trait KvStore: Send + Sync {
    /// Sets `key` to `value` only if it does not already exist, returning `true` if
    /// the set happened. Used for nonce-claim and idempotency-claim compare-and-set.
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError>;

    /// Unconditionally sets `key` to `value` with the given TTL.
    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError>;

    async fn get(&self, key: &str) -> Result<Option<String>, KvError>;

    async fn delete(&self, key: &str) -> Result<(), KvError>;

    /// Atomically increments `key` unless it is already at `cap`, refreshing its TTL,
    /// and returns the new value, or `None` if the cap was already reached. Must be a
    /// single server-side atomic operation — a separate get then set lets two
    /// concurrent callers both observe `current < cap` and both increment, pushing
    /// the counter past the cap (spec I3, §4.5).
    async fn incr_capped(&self, key: &str, cap: i64, ttl: Duration) -> Result<Option<i64>, KvError>;

    /// Atomically decrements `key` unless it is already at zero, refreshing its TTL,
    /// and returns the new value, or `None` if there was nothing to spend. Same
    /// atomicity requirement as `incr_capped`, for the symmetric race (spec I3, §4.5).
    async fn decr_if_positive(&self, key: &str, ttl: Duration) -> Result<Option<i64>, KvError>;
}

/// REST client for a Redis-REST-compatible KV service, grounded on the shape of the
/// teacher's `FacilitatorClient`.
#[derive(Clone)]
pub struct HttpKvStore {
    base_url: Url,
    client: reqwest::Client,
}

impl HttpKvStore {
    pub fn try_new(base_url: &str, bearer_token: &str) -> Result<Self, KvError> {
        let base_url = Url::parse(base_url)?;
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::try_from(format!("Bearer {bearer_token}"))
            .map_err(|_| KvError::HttpStatus {
                status: 0,
                body: "invalid bearer token header value".to_string(),
            })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(5))
            .build()
            .map_err(KvError::Http)?;
        Ok(Self { base_url, client })
    }

    fn command_url(&self) -> Url {
        self.base_url.clone()
    }

    async fn send_command(&self, parts: &[&str]) -> Result<serde_json::Value, KvError> {
        let response = self
            .client
            .post(self.command_url())
            .json(parts)
            .send()
            .await
            .map_err(KvError::Http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(KvError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<serde_json::Value>()
            .await
            .map_err(KvError::Deserialization)
    }
}

#[async_trait]
impl KvStore for HttpKvStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let seconds = ttl.as_secs().to_string();
        let result = self
            .send_command(&["SET", key, value, "NX", "EX", &seconds])
            .await?;
        Ok(!result["result"].is_null())
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let seconds = ttl.as_secs().to_string();
        self.send_command(&["SET", key, value, "EX", &seconds]).await?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let result = self.send_command(&["GET", key]).await?;
        Ok(result["result"].as_str().map(str::to_string))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        self.send_command(&["DEL", key]).await?;
        Ok(())
    }

    async fn incr_capped(&self, key: &str, cap: i64, ttl: Duration) -> Result<Option<i64>, KvError> {
        let cap_str = cap.to_string();
        let seconds = ttl.as_secs().to_string();
        let result = self
            .send_command(&["EVAL", INCR_CAPPED_SCRIPT, "1", key, &cap_str, &seconds])
            .await?;
        let value = result["result"].as_i64().ok_or_else(|| KvError::HttpStatus {
            status: 0,
            body: "EVAL response missing integer result".to_string(),
        })?;
        Ok(if value < 0 { None } else { Some(value) })
    }

    async fn decr_if_positive(&self, key: &str, ttl: Duration) -> Result<Option<i64>, KvError> {
        let seconds = ttl.as_secs().to_string();
        let result = self
            .send_command(&["EVAL", DECR_IF_POSITIVE_SCRIPT, "1", key, &seconds])
            .await?;
        let value = result["result"].as_i64().ok_or_else(|| KvError::HttpStatus {
            status: 0,
            body: "EVAL response missing integer result".to_string(),
        })?;
        Ok(if value < 0 { None } else { Some(value) })
    }
}

/// `KEYS[1]` is the counter key, `ARGV[1]` the cap, `ARGV[2]` the TTL in seconds.
/// Returns `-1` as a sentinel for "already at cap" since that is not a valid counter
/// value, letting the caller tell it apart from a real increment.
const INCR_CAPPED_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current >= tonumber(ARGV[1]) then
  return -1
end
local updated = redis.call('INCR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[2])
return updated
"#;

/// `KEYS[1]` is the counter key, `ARGV[1]` the TTL in seconds. Returns `-1` when the
/// counter was already at or below zero.
const DECR_IF_POSITIVE_SCRIPT: &str = r#"
local current = tonumber(redis.call('GET', KEYS[1]) or '0')
if current <= 0 then
  return -1
end
local updated = redis.call('DECR', KEYS[1])
redis.call('EXPIRE', KEYS[1], ARGV[1])
return updated
"#;

struct Entry {
    value: String,
    expires_at: std::time::Instant,
}

/// In-memory `KvStore` test double, standing in for `HttpKvStore` in unit and
/// integration tests (no real example in the pack ships a Redis mock, so this
/// follows the same "trait + struct-backed fake" pattern the teacher uses for
/// `ProviderCache` tests in `src/provider_cache.rs`).
#[derive(Default)]
pub struct InMemoryKvStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn is_live(entry: &Entry) -> bool {
        entry.expires_at > std::time::Instant::now()
    }
}

#[async_trait]
impl KvStore for InMemoryKvStore {
    async fn set_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<bool, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        if let Some(existing) = entries.get(key) {
            if Self::is_live(existing) {
                return Ok(false);
            }
        }
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        Ok(true)
    }

    async fn set(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        entries.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<String>, KvError> {
        let entries = self.entries.lock().expect("kv mutex poisoned");
        Ok(entries
            .get(key)
            .filter(|e| Self::is_live(e))
            .map(|e| e.value.clone()))
    }

    async fn delete(&self, key: &str) -> Result<(), KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        entries.remove(key);
        Ok(())
    }

    async fn incr_capped(&self, key: &str, cap: i64, ttl: Duration) -> Result<Option<i64>, KvError> {
        // The whole check-then-write happens under one mutex guard, with no `.await`
        // in between, so this is atomic with respect to every other store call.
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        let current: i64 = entries
            .get(key)
            .filter(|e| Self::is_live(e))
            .and_then(|e| e.value.parse().ok())
            .unwrap_or(0);
        if current >= cap {
            return Ok(None);
        }
        let updated = current + 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: updated.to_string(),
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        Ok(Some(updated))
    }

    async fn decr_if_positive(&self, key: &str, ttl: Duration) -> Result<Option<i64>, KvError> {
        let mut entries = self.entries.lock().expect("kv mutex poisoned");
        let current: i64 = entries
            .get(key)
            .filter(|e| Self::is_live(e))
            .and_then(|e| e.value.parse().ok())
            .unwrap_or(0);
        if current <= 0 {
            return Ok(None);
        }
        let updated = current - 1;
        entries.insert(
            key.to_string(),
            Entry {
                value: updated.to_string(),
                expires_at: std::time::Instant::now() + ttl,
            },
        );
        Ok(Some(updated))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_if_absent_only_claims_once() {
        let kv = InMemoryKvStore::new();
        assert!(kv.set_if_absent("n:1", "pending", Duration::from_secs(60)).await.unwrap());
        assert!(!kv.set_if_absent("n:1", "pending", Duration::from_secs(60)).await.unwrap());
    }

    #[tokio::test]
    async fn incr_capped_stops_at_cap() {
        let kv = InMemoryKvStore::new();
        let ttl = Duration::from_secs(86_400);
        assert_eq!(kv.incr_capped("credits:alice", 2, ttl).await.unwrap(), Some(1));
        assert_eq!(kv.incr_capped("credits:alice", 2, ttl).await.unwrap(), Some(2));
        assert_eq!(kv.incr_capped("credits:alice", 2, ttl).await.unwrap(), None);
    }

    #[tokio::test]
    async fn decr_if_positive_never_goes_negative() {
        let kv = InMemoryKvStore::new();
        let ttl = Duration::from_secs(86_400);
        kv.incr_capped("credits:bob", 1, ttl).await.unwrap();
        assert_eq!(kv.decr_if_positive("credits:bob", ttl).await.unwrap(), Some(0));
        assert_eq!(kv.decr_if_positive("credits:bob", ttl).await.unwrap(), None);
    }

    #[tokio::test]
    async fn expired_entries_are_not_returned() {
        let kv = InMemoryKvStore::new();
        kv.set("k", "v", Duration::from_millis(1)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(kv.get("k").await.unwrap(), None);
    }
}

//! Write-once result cache
//!
//! The coordinator only needs two operations from the backing store: a read
//! and an atomic "set if absent" with an expiry. [`MemoryCache`] keeps entries
//! in-process; [`RedisRestCache`] talks to a Redis-compatible REST endpoint.

use crate::{CacheKey, ScreenshotError};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::sync::Mutex;
use std::time::Duration;
use tokio::time::Instant;
use tracing::debug;

/// Value stored for a cached capture.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct CachedResult {
    /// Public URL of the stored artifact
    pub url: String,
    /// TTL the entry was written with, in seconds
    pub ttl_secs: u64,
    pub stored_at: DateTime<Utc>,
}

impl CachedResult {
    pub fn new(url: impl Into<String>, ttl: Duration) -> Self {
        Self {
            url: url.into(),
            ttl_secs: ttl.as_secs(),
            stored_at: Utc::now(),
        }
    }
}

#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ResultCache: Send + Sync {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, ScreenshotError>;

    /// Store `value` unless an unexpired entry already exists for `key`.
    ///
    /// Returns `true` when this call wrote the entry. An existing entry is
    /// neither overwritten nor has its expiry extended.
    async fn set_if_absent(
        &self,
        key: &CacheKey,
        value: &CachedResult,
        ttl: Duration,
    ) -> Result<bool, ScreenshotError>;
}

struct MemoryEntry {
    value: CachedResult,
    expires_at: Instant,
}

/// Minimum time between full expiry sweeps of a [`MemoryCache`].
const SWEEP_PERIOD: Duration = Duration::from_secs(60);

/// In-process cache. Expired entries are dropped when read, and writes sweep
/// the whole map at most once per [`SWEEP_PERIOD`].
pub struct MemoryCache {
    entries: DashMap<String, MemoryEntry>,
    next_sweep: Mutex<Instant>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            next_sweep: Mutex::new(Instant::now() + SWEEP_PERIOD),
        }
    }

    /// Remove every expired entry and return how many were dropped.
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, e| e.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Purged {} expired cache entries", removed);
        }
        removed
    }

    fn maybe_sweep(&self, now: Instant) {
        let due = match self.next_sweep.lock() {
            Ok(mut next) if now >= *next => {
                *next = now + SWEEP_PERIOD;
                true
            }
            _ => false,
        };
        if due {
            self.purge_expired();
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for MemoryCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl ResultCache for MemoryCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, ScreenshotError> {
        if let Some(entry) = self.entries.get(key.as_str()) {
            if entry.expires_at > Instant::now() {
                return Ok(Some(entry.value.clone()));
            }
            drop(entry);
            self.entries
                .remove_if(key.as_str(), |_, e| e.expires_at <= Instant::now());
        }
        Ok(None)
    }

    async fn set_if_absent(
        &self,
        key: &CacheKey,
        value: &CachedResult,
        ttl: Duration,
    ) -> Result<bool, ScreenshotError> {
        let now = Instant::now();
        self.maybe_sweep(now);

        let fresh = MemoryEntry {
            value: value.clone(),
            expires_at: now + ttl,
        };

        match self.entries.entry(key.to_string()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().expires_at > now {
                    return Ok(false);
                }
                occupied.insert(fresh);
                Ok(true)
            }
            Entry::Vacant(vacant) => {
                vacant.insert(fresh);
                Ok(true)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct RestReply {
    #[serde(default)]
    result: serde_json::Value,
    error: Option<String>,
}

/// Cache backed by a Redis REST API (commands posted as JSON arrays).
pub struct RedisRestCache {
    client: reqwest::Client,
    endpoint: String,
    token: String,
}

impl RedisRestCache {
    pub fn new(endpoint: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            endpoint: endpoint.into(),
            token: token.into(),
        }
    }

    async fn command(&self, args: serde_json::Value) -> Result<serde_json::Value, ScreenshotError> {
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.token)
            .json(&args)
            .send()
            .await
            .map_err(|e| ScreenshotError::CacheStore(e.to_string()))?;

        let status = response.status();
        let reply: RestReply = response.json().await.map_err(|e| {
            ScreenshotError::CacheStore(format!("unreadable reply (HTTP {status}): {e}"))
        })?;

        if let Some(error) = reply.error {
            return Err(ScreenshotError::CacheStore(error));
        }
        if !status.is_success() {
            return Err(ScreenshotError::CacheStore(format!("HTTP {status}")));
        }
        Ok(reply.result)
    }
}

#[async_trait]
impl ResultCache for RedisRestCache {
    async fn get(&self, key: &CacheKey) -> Result<Option<CachedResult>, ScreenshotError> {
        let result = self
            .command(serde_json::json!(["GET", key.as_str()]))
            .await?;

        match result {
            serde_json::Value::Null => Ok(None),
            serde_json::Value::String(raw) => serde_json::from_str(&raw)
                .map(Some)
                .map_err(|e| ScreenshotError::CacheStore(format!("corrupt entry for {key}: {e}"))),
            other => Err(ScreenshotError::CacheStore(format!(
                "unexpected GET reply: {other}"
            ))),
        }
    }

    async fn set_if_absent(
        &self,
        key: &CacheKey,
        value: &CachedResult,
        ttl: Duration,
    ) -> Result<bool, ScreenshotError> {
        let payload = serde_json::to_string(value)?;
        let ttl_secs = ttl.as_secs().max(1);
        let result = self
            .command(serde_json::json!([
                "SET",
                key.as_str(),
                payload,
                "EX",
                ttl_secs,
                "NX"
            ]))
            .await?;

        let written = result.as_str() == Some("OK");
        debug!("SET NX {} -> {}", key, written);
        Ok(written)
    }
}

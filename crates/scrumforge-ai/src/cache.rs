//! Provider response caching layer
//!
//! Caches completed, non-streaming responses in memory to avoid redundant
//! provider calls. Keys are a SHA-256 over a canonical serialization of the
//! fields that determine the provider's output. Expired entries are treated
//! as misses on read and physically removed by a periodic sweep.
//!
//! Concurrent identical requests may both miss and both reach the provider;
//! there is no in-flight de-duplication.

use std::sync::{Arc, Weak};
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info};

use crate::models::{ChatMessage, CompletionRequest, CompletionResponse, ResponseFormat};

/// Default time-to-live for cached responses
pub const DEFAULT_CACHE_TTL: Duration = Duration::from_secs(5 * 60);

/// Shortest interval between background sweeps
const MIN_SWEEP_INTERVAL: Duration = Duration::from_millis(100);

/// A stored response with its insertion time
#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub response: CompletionResponse,
    pub created_at: Instant,
    pub ttl: Duration,
}

impl CacheEntry {
    pub fn is_fresh(&self, now: Instant) -> bool {
        now.saturating_duration_since(self.created_at) < self.ttl
    }
}

/// Fields that make up a cache key, in fixed order
#[derive(Serialize)]
struct CacheKeyFields<'a> {
    messages: &'a [ChatMessage],
    model: &'a str,
    max_tokens: Option<usize>,
    temperature: Option<f32>,
    response_format: Option<ResponseFormat>,
}

/// In-memory TTL cache of completion responses
pub struct ResponseCache {
    entries: DashMap<String, CacheEntry>,
    ttl: Duration,
}

impl ResponseCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            entries: DashMap::new(),
            ttl,
        }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    /// Build the cache key for a request served by `model`.
    ///
    /// Returns `None` for streaming requests, which are never cached.
    pub fn key_for(request: &CompletionRequest, model: &str) -> Option<String> {
        if request.stream {
            return None;
        }

        let fields = CacheKeyFields {
            messages: &request.messages,
            model,
            max_tokens: request.max_tokens,
            temperature: request.temperature,
            response_format: request.response_format,
        };
        // serializing borrowed strings and plain numbers cannot fail
        let canonical = serde_json::to_vec(&fields).unwrap_or_default();

        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        Some(format!("completion_{:x}", hasher.finalize()))
    }

    /// Look up a fresh entry. Hits are returned with `cached = true`.
    pub fn get(&self, key: &str) -> Option<CompletionResponse> {
        let entry = self.entries.get(key)?;
        if entry.is_fresh(Instant::now()) {
            debug!(key, "Response cache hit");
            Some(entry.response.as_cached())
        } else {
            debug!(key, "Response cache entry expired");
            None
        }
    }

    /// Store a response, stamping it with the current time
    pub fn set(&self, key: impl Into<String>, response: CompletionResponse) {
        let key = key.into();
        debug!(key = %key, "Caching response");
        self.entries.insert(
            key,
            CacheEntry {
                response,
                created_at: Instant::now(),
                ttl: self.ttl,
            },
        );
    }

    /// Remove one entry; returns whether it existed
    pub fn invalidate(&self, key: &str) -> bool {
        self.entries.remove(key).is_some()
    }

    pub fn clear(&self) {
        self.entries.clear();
    }

    /// Drop every entry whose age has reached its TTL
    pub fn sweep_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.is_fresh(now));
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            info!(removed, "Swept expired cache entries");
        }
        removed
    }

    /// Number of stored entries, including expired ones not yet swept
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Start the periodic sweep on the current tokio runtime. The sweep runs
    /// every TTL (at least every 100ms) and stops when the handle or the
    /// cache is dropped.
    pub fn spawn_sweeper(self: &Arc<Self>) -> CacheSweeper {
        let cache: Weak<Self> = Arc::downgrade(self);
        let period = self.ttl.max(MIN_SWEEP_INTERVAL);
        let first_sweep = Instant::now() + period;
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval_at(first_sweep, period);
            loop {
                interval.tick().await;
                match cache.upgrade() {
                    Some(cache) => {
                        cache.sweep_expired();
                    }
                    None => break,
                }
            }
        });
        CacheSweeper { handle }
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_TTL)
    }
}

/// Handle to the background sweep task; aborts it on drop
pub struct CacheSweeper {
    handle: JoinHandle<()>,
}

impl CacheSweeper {
    pub fn is_running(&self) -> bool {
        !self.handle.is_finished()
    }
}

impl Drop for CacheSweeper {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

//! Result Cache
//!
//! Every producer checks its own entry before doing work and writes a fresh result back
//! with a per-source TTL. Values are a versioned JSON envelope around a typed list; a
//! payload that does not decode is `CacheCorrupt`, counted as a miss and overwritten by the
//! recomputed value.
//!
//! Two backends implement `CacheStore`: Redis through a `ConnectionManager`, and an
//! in-process `DashMap` used when Redis is disabled and in tests.

use async_trait::async_trait;
use dashmap::DashMap;
use redis::{aio::ConnectionManager, AsyncCommands, Client};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, info, instrument, warn};

use super::filters::{Source, SourceOutcome};
use crate::config::{CacheConfig, CacheTtls};
use crate::error::{Error, Result};

/// Version tag written into every envelope
pub const CACHE_SCHEMA_VERSION: u32 = 1;

/// Deterministic key for one cached list.
///
/// Renders as `recs:{source}:{profile}:{k}`, `recs:hybrid:{profile}[:r={region}]:{k}`,
/// `popular:global:{k}` or `popular:r={region}:{k}`. `%` and `:` inside a profile or region
/// are percent-escaped so distinct keys never render alike.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    pub source: Source,
    pub profile_id: Option<String>,
    pub region: Option<String>,
    pub top_k: usize,
}

impl CacheKey {
    /// Key for a per-profile producer
    pub fn for_profile(source: Source, profile_id: &str, top_k: usize) -> Self {
        Self {
            source,
            profile_id: Some(profile_id.to_string()),
            region: None,
            top_k,
        }
    }

    pub fn popularity(region: Option<&str>, top_k: usize) -> Self {
        Self {
            source: Source::Popularity,
            profile_id: None,
            region: region.map(str::to_string),
            top_k,
        }
    }

    pub fn hybrid(profile_id: &str, region: Option<&str>, top_k: usize) -> Self {
        Self {
            source: Source::Hybrid,
            profile_id: Some(profile_id.to_string()),
            region: region.map(str::to_string),
            top_k,
        }
    }
}

fn escape_segment(raw: &str) -> Cow<'_, str> {
    if raw.contains(|c| c == '%' || c == ':') {
        Cow::Owned(raw.replace('%', "%25").replace(':', "%3A"))
    } else {
        Cow::Borrowed(raw)
    }
}

impl fmt::Display for CacheKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.source == Source::Popularity {
            return match &self.region {
                Some(region) => write!(f, "popular:r={}:{}", escape_segment(region), self.top_k),
                None => write!(f, "popular:global:{}", self.top_k),
            };
        }

        write!(f, "recs:{}", self.source)?;
        if let Some(profile) = &self.profile_id {
            write!(f, ":{}", escape_segment(profile))?;
        }
        if let Some(region) = &self.region {
            write!(f, ":r={}", escape_segment(region))?;
        }
        write!(f, ":{}", self.top_k)
    }
}

impl CacheTtls {
    pub fn for_source(&self, source: Source) -> Duration {
        match source {
            Source::Neural => self.neural,
            Source::CoOccurrence => self.co_occurrence,
            Source::Genre => self.genre,
            Source::Popularity => self.popularity,
            Source::Hybrid => self.hybrid,
        }
    }
}

/// String key/value store with expiry
#[async_trait]
pub trait CacheStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    /// Replace the value and reset its expiry
    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()>;
}

// ============================================================================
// Redis backend
// ============================================================================

/// Redis cache over a multiplexed, auto-reconnecting connection
#[derive(Clone)]
pub struct RedisCache {
    manager: ConnectionManager,
    op_timeout: Duration,
}

impl RedisCache {
    #[instrument(skip(config))]
    pub async fn connect(config: &CacheConfig) -> Result<Self> {
        info!("Initializing Redis cache connection");

        let client = Client::open(config.redis_url.as_str())?;
        let manager = ConnectionManager::new(client).await?;

        let mut conn = manager.clone();
        redis_op(config.op_timeout, "PING", async {
            redis::cmd("PING").query_async::<_, String>(&mut conn).await
        })
        .await?;

        info!("Redis cache initialized successfully");
        Ok(Self {
            manager,
            op_timeout: config.op_timeout,
        })
    }
}

async fn redis_op<T, F>(timeout: Duration, operation: &'static str, fut: F) -> Result<T>
where
    F: Future<Output = redis::RedisResult<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result.map_err(Error::from),
        Err(_) => Err(Error::cache(format!(
            "{} timed out after {}ms",
            operation,
            timeout.as_millis()
        ))),
    }
}

#[async_trait]
impl CacheStore for RedisCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let mut conn = self.manager.clone();
        let value: Option<String> = redis_op(self.op_timeout, "GET", conn.get(key)).await?;
        Ok(value)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        let mut conn = self.manager.clone();
        // Redis expiry has whole-second resolution
        let seconds = ttl.as_secs().max(1);
        redis_op(
            self.op_timeout,
            "SETEX",
            conn.set_ex::<_, _, ()>(key, value, seconds),
        )
        .await
    }
}

// ============================================================================
// In-process backend
// ============================================================================

/// Writes between sweeps of expired entries
pub const MEMORY_SWEEP_INTERVAL: usize = 256;

struct MemoryEntry {
    value: String,
    expires_at: Instant,
}

/// In-process cache. Expired entries are dropped when read and swept every
/// `MEMORY_SWEEP_INTERVAL` writes.
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<String, MemoryEntry>,
    writes: AtomicUsize,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored entries, expired ones included until the next sweep
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Drop every expired entry, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());
        if removed > 0 {
            debug!("Swept {} expired in-process cache entries", removed);
        }
        removed
    }
}

#[async_trait]
impl CacheStore for MemoryCache {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let now = Instant::now();
        if let Some(entry) = self.entries.get(key) {
            if entry.expires_at > now {
                return Ok(Some(entry.value.clone()));
            }
        }
        self.entries.remove_if(key, |_, entry| entry.expires_at <= now);
        Ok(None)
    }

    async fn set_ex(&self, key: &str, value: String, ttl: Duration) -> Result<()> {
        self.entries.insert(
            key.to_string(),
            MemoryEntry {
                value,
                expires_at: Instant::now() + ttl,
            },
        );
        if (self.writes.fetch_add(1, Ordering::Relaxed) + 1) % MEMORY_SWEEP_INTERVAL == 0 {
            self.purge_expired();
        }
        Ok(())
    }
}

// ============================================================================
// Typed result cache
// ============================================================================

#[derive(Serialize)]
struct EnvelopeRef<'a, T> {
    schema: u32,
    items: &'a [T],
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
struct Envelope<T> {
    schema: u32,
    items: Vec<T>,
}

/// Serialize a ranked list into the cache envelope
pub fn encode<T: Serialize>(items: &[T]) -> Result<String> {
    Ok(serde_json::to_string(&EnvelopeRef {
        schema: CACHE_SCHEMA_VERSION,
        items,
    })?)
}

/// Parse a cache envelope; anything malformed is `CacheCorrupt`
pub fn decode<T: DeserializeOwned>(key: &str, raw: &str) -> Result<Vec<T>> {
    let envelope: Envelope<T> = serde_json::from_str(raw).map_err(|e| Error::CacheCorrupt {
        key: key.to_string(),
        message: e.to_string(),
    })?;
    if envelope.schema != CACHE_SCHEMA_VERSION {
        return Err(Error::CacheCorrupt {
            key: key.to_string(),
            message: format!("unsupported schema version {}", envelope.schema),
        });
    }
    Ok(envelope.items)
}

fn record_lookup(source: Source, result: &'static str) {
    metrics::counter!(
        "streamrec_cache_requests_total",
        "source" => source.as_str(),
        "result" => result
    )
    .increment(1);
}

/// Typed, per-source cache shared by every producer
pub struct ResultCache {
    store: Arc<dyn CacheStore>,
    ttls: CacheTtls,
    in_flight: DashMap<String, Arc<Mutex<()>>>,
}

impl ResultCache {
    pub fn new(store: Arc<dyn CacheStore>, ttls: CacheTtls) -> Self {
        Self {
            store,
            ttls,
            in_flight: DashMap::new(),
        }
    }

    /// Cache over a fresh in-process store
    pub fn in_memory(ttls: CacheTtls) -> Self {
        Self::new(Arc::new(MemoryCache::new()), ttls)
    }

    pub fn ttls(&self) -> &CacheTtls {
        &self.ttls
    }

    /// Typed read that surfaces store and decode failures
    pub async fn read<T: DeserializeOwned>(&self, key: &CacheKey) -> Result<Option<Vec<T>>> {
        let key = key.to_string();
        match self.store.get(&key).await? {
            Some(raw) => decode(&key, &raw).map(Some),
            None => Ok(None),
        }
    }

    /// Typed read where every failure is a miss
    pub async fn get<T: DeserializeOwned>(&self, key: &CacheKey) -> Option<Vec<T>> {
        match self.read(key).await {
            Ok(Some(items)) => {
                debug!("Cache hit: {}", key);
                record_lookup(key.source, "hit");
                Some(items)
            }
            Ok(None) => {
                debug!("Cache miss: {}", key);
                record_lookup(key.source, "miss");
                None
            }
            Err(e @ Error::CacheCorrupt { .. }) => {
                warn!("Discarding cache entry: {}", e);
                record_lookup(key.source, "corrupt");
                None
            }
            Err(e) => {
                warn!("Cache read failed for {}: {}", key, e);
                record_lookup(key.source, "error");
                None
            }
        }
    }

    /// Write a list under the source's TTL
    pub async fn put<T: Serialize + Sync>(&self, key: &CacheKey, items: &[T]) -> Result<()> {
        let value = encode(items)?;
        self.store
            .set_ex(&key.to_string(), value, self.ttls.for_source(key.source))
            .await
    }

    /// Return the cached list or await `compute`, writing back only ranked results.
    ///
    /// Concurrent callers for the same key queue behind one computation and then read
    /// its result from the cache.
    pub async fn get_or_compute<T, Fut>(&self, key: &CacheKey, compute: Fut) -> SourceOutcome<T>
    where
        T: Serialize + DeserializeOwned + Sync,
        Fut: Future<Output = SourceOutcome<T>>,
    {
        if let Some(items) = self.get(key).await {
            return SourceOutcome::Ranked(items);
        }

        let rendered = key.to_string();
        let lock = self
            .in_flight
            .entry(rendered.clone())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone();

        let outcome = {
            let _guard = lock.lock().await;
            match self.read::<T>(key).await {
                Ok(Some(items)) => {
                    record_lookup(key.source, "hit");
                    SourceOutcome::Ranked(items)
                }
                _ => {
                    let outcome = compute.await;
                    if let SourceOutcome::Ranked(items) = &outcome {
                        if let Err(e) = self.put(key, items).await {
                            warn!("Cache write failed for {}: {}", key, e);
                        }
                    }
                    outcome
                }
            }
        };

        drop(lock);
        self.in_flight
            .remove_if(&rendered, |_, lock| Arc::strong_count(lock) == 1);
        outcome
    }
}

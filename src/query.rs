//! Cached query execution.
//!
//! DESIGN
//! ======
//! A `QueryRequest` carries the cache key, the async fetch closure, and the
//! two caller flags (`enabled`, `require_auth`). The policy folds those flags
//! into a single `enabled` bit and hands `QueryOptions` to a
//! `QueryExecutor`. Executors must never call the fetch closure when
//! `enabled` is false, and must report such a query as `Idle`.
//!
//! `QueryClient` is the in-process executor: successful results are cached
//! per key, fresh entries short-circuit the fetch, and failures are retried
//! with exponential backoff. The cache belongs to one principal at a time;
//! options tagged with a different user id empty it before anything is read.
//! An optional re-check closure is consulted before every retry and before a
//! result is stored, so a query that lost its enablement mid-flight stops.
//!
//! TRADE-OFFS
//! ==========
//! Cached values are type-erased (`dyn Any`) so one client serves every call
//! site. A key read back as a different type than it was stored under is
//! treated as a cache miss rather than an error.

#[cfg(test)]
#[path = "query_test.rs"]
mod query_test;

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use futures::FutureExt;
use futures::future::BoxFuture;
use serde::Serialize;
use tracing::{debug, warn};

pub const DEFAULT_STALE_SECS: u64 = 30;
pub const DEFAULT_RETRY: u32 = 3;
pub const DEFAULT_RETRY_DELAY_MS: u64 = 1000;
const MAX_RETRY_DELAY: Duration = Duration::from_secs(30);

// =============================================================================
// ERROR TYPE
// =============================================================================

/// Failure reported by a query's fetch closure.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("fetch failed: {0}")]
    Fetch(String),
}

// =============================================================================
// KEYS
// =============================================================================

/// Hierarchical cache key, e.g. `["quests", "active"]`.
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize)]
pub struct QueryKey(Vec<String>);

impl QueryKey {
    #[must_use]
    pub fn new<I, S>(segments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(segments.into_iter().map(Into::into).collect())
    }

    /// Key derived from an API path: `/api/quests/7` becomes `["api", "quests", "7"]`.
    #[must_use]
    pub fn from_path(path: &str) -> Self {
        Self::new(path.split('/').filter(|segment| !segment.is_empty()))
    }

    #[must_use]
    pub fn segments(&self) -> &[String] {
        &self.0
    }

    /// True when `prefix` matches the leading segments of this key.
    #[must_use]
    pub fn starts_with(&self, prefix: &QueryKey) -> bool {
        self.0.starts_with(&prefix.0)
    }
}

impl fmt::Display for QueryKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0.join("/"))
    }
}

// =============================================================================
// REQUESTS
// =============================================================================

/// Shared async fetch closure. Called once per attempt.
pub type QueryFn<T> = Arc<dyn Fn() -> BoxFuture<'static, Result<T, QueryError>> + Send + Sync>;

/// Live re-evaluation of a query's enablement.
pub type EnabledCheck = Arc<dyn Fn() -> bool + Send + Sync>;

/// A data fetch as described by a call site, before gating.
pub struct QueryRequest<T> {
    pub key: QueryKey,
    pub query_fn: QueryFn<T>,
    /// Caller's own precondition. Defaults to true.
    pub enabled: bool,
    /// Whether the endpoint needs a signed-in user. Defaults to true.
    pub require_auth: bool,
    pub recheck: Option<EnabledCheck>,
}

impl<T: Send + 'static> QueryRequest<T> {
    pub fn new<F, Fut>(key: QueryKey, query_fn: F) -> Self
    where
        F: Fn() -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<T, QueryError>> + Send + 'static,
    {
        let query_fn: QueryFn<T> = Arc::new(move || query_fn().boxed());
        Self { key, query_fn, enabled: true, require_auth: true, recheck: None }
    }
}

impl<T> QueryRequest<T> {
    #[must_use]
    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    #[must_use]
    pub fn with_require_auth(mut self, require_auth: bool) -> Self {
        self.require_auth = require_auth;
        self
    }

    /// Attach a closure the executor calls to confirm the query is still
    /// allowed between attempts.
    #[must_use]
    pub fn with_recheck<F>(mut self, recheck: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.recheck = Some(Arc::new(recheck));
        self
    }

    /// Mark the request as targeting a public endpoint.
    #[must_use]
    pub fn public(self) -> Self {
        self.with_require_auth(false)
    }

    /// Replace the caller flags with the computed enablement. Key, fetch
    /// closure, and re-check pass through untouched.
    #[must_use]
    pub fn into_options(self, enabled: bool) -> QueryOptions<T> {
        QueryOptions { key: self.key, query_fn: self.query_fn, enabled, recheck: self.recheck, principal: None }
    }
}

/// What an executor receives: the request with its flags already folded.
pub struct QueryOptions<T> {
    pub key: QueryKey,
    pub query_fn: QueryFn<T>,
    pub enabled: bool,
    pub recheck: Option<EnabledCheck>,
    /// User id the query runs on behalf of; `None` for anonymous.
    pub principal: Option<String>,
}

impl<T> QueryOptions<T> {
    #[must_use]
    pub fn for_principal(mut self, principal: Option<String>) -> Self {
        self.principal = principal;
        self
    }

    /// False once the re-check says the query is no longer allowed.
    #[must_use]
    pub fn still_enabled(&self) -> bool {
        self.recheck.as_ref().map_or(true, |check| check())
    }
}

// =============================================================================
// RESULTS
// =============================================================================

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueryStatus {
    /// Not fetched because the query was disabled.
    Idle,
    Success,
    Error,
}

#[derive(Clone, Debug, PartialEq)]
pub struct QueryResult<T> {
    pub data: Option<T>,
    pub error: Option<QueryError>,
    pub status: QueryStatus,
}

impl<T> QueryResult<T> {
    #[must_use]
    pub fn idle(data: Option<T>) -> Self {
        Self { data, error: None, status: QueryStatus::Idle }
    }

    #[must_use]
    pub fn success(data: T) -> Self {
        Self { data: Some(data), error: None, status: QueryStatus::Success }
    }

    /// A failed fetch. `data` keeps whatever was cached before the failure.
    #[must_use]
    pub fn failure(error: QueryError, data: Option<T>) -> Self {
        Self { data, error: Some(error), status: QueryStatus::Error }
    }

    #[must_use]
    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }
}

// =============================================================================
// EXECUTOR
// =============================================================================

/// Cached-fetch primitive the policy dispatches to.
#[async_trait::async_trait]
pub trait QueryExecutor: Send + Sync {
    /// Run the query if `options.enabled`; otherwise return `Idle` without
    /// touching `options.query_fn`.
    async fn execute<T>(&self, options: QueryOptions<T>) -> QueryResult<T>
    where
        T: Clone + Send + Sync + 'static;
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct QueryConfig {
    /// How long a cached result is served without refetching.
    pub stale_time: Duration,
    /// Extra attempts after the first failure.
    pub retry: u32,
    /// Base delay before the first retry; doubles per attempt.
    pub retry_delay: Duration,
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_secs(DEFAULT_STALE_SECS),
            retry: DEFAULT_RETRY,
            retry_delay: Duration::from_millis(DEFAULT_RETRY_DELAY_MS),
        }
    }
}

struct CacheEntry {
    data: Box<dyn Any + Send + Sync>,
    fetched_at: Instant,
}

#[derive(Default)]
struct CacheState {
    /// Principal whose data the entries belong to.
    owner: Option<String>,
    entries: HashMap<QueryKey, CacheEntry>,
}

/// In-process `QueryExecutor` with a keyed result cache.
pub struct QueryClient {
    cache: Mutex<CacheState>,
    config: QueryConfig,
}

impl QueryClient {
    #[must_use]
    pub fn new(config: QueryConfig) -> Self {
        Self { cache: Mutex::new(CacheState::default()), config }
    }

    #[must_use]
    pub fn config(&self) -> QueryConfig {
        self.config
    }

    fn lock(&self) -> MutexGuard<'_, CacheState> {
        self.cache.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn cached<T: Clone + 'static>(&self, key: &QueryKey) -> Option<(T, Instant)> {
        let cache = self.lock();
        let entry = cache.entries.get(key)?;
        let data = entry.data.as_ref().downcast_ref::<T>()?.clone();
        Some((data, entry.fetched_at))
    }

    /// Cached data for `key`, regardless of staleness.
    #[must_use]
    pub fn get_query_data<T: Clone + 'static>(&self, key: &QueryKey) -> Option<T> {
        self.cached(key).map(|(data, _)| data)
    }

    /// Seed or overwrite the cache entry for `key`.
    pub fn set_query_data<T: Send + Sync + 'static>(&self, key: QueryKey, data: T) {
        self.lock().entries.insert(key, CacheEntry { data: Box::new(data), fetched_at: Instant::now() });
    }

    /// Store a fetched result only if the cache still belongs to `principal`.
    fn store_for<T: Send + Sync + 'static>(&self, principal: Option<&str>, key: QueryKey, data: T) -> bool {
        let mut cache = self.lock();
        if cache.owner.as_deref() != principal {
            return false;
        }
        cache.entries.insert(key, CacheEntry { data: Box::new(data), fetched_at: Instant::now() });
        true
    }

    /// Hand the cache to `principal`. Entries cached for anyone else are
    /// dropped. Returns true when the owner changed.
    pub fn bind_principal(&self, principal: Option<&str>) -> bool {
        let mut cache = self.lock();
        if cache.owner.as_deref() == principal {
            return false;
        }
        let dropped = cache.entries.len();
        cache.entries.clear();
        cache.owner = principal.map(str::to_owned);
        debug!(dropped, "query cache rebound to new principal");
        true
    }

    /// Drop every entry whose key starts with `prefix`. Returns how many were removed.
    pub fn invalidate(&self, prefix: &QueryKey) -> usize {
        let mut cache = self.lock();
        let before = cache.entries.len();
        cache.entries.retain(|key, _| !key.starts_with(prefix));
        let removed = before - cache.entries.len();
        debug!(%prefix, removed, "invalidated queries");
        removed
    }

    pub fn clear(&self) {
        self.lock().entries.clear();
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.lock().entries.is_empty()
    }

    fn retry_backoff(&self, attempt: u32) -> Duration {
        let factor = 1_u32 << attempt.saturating_sub(1).min(16);
        self.config.retry_delay.saturating_mul(factor).min(MAX_RETRY_DELAY)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new(QueryConfig::default())
    }
}

#[async_trait::async_trait]
impl QueryExecutor for QueryClient {
    async fn execute<T>(&self, options: QueryOptions<T>) -> QueryResult<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        let principal = options.principal.as_deref();
        self.bind_principal(principal);
        let key = &options.key;
        let cached = self.cached::<T>(key);

        if !options.enabled {
            debug!(%key, "query disabled; not fetching");
            return QueryResult::idle(cached.map(|(data, _)| data));
        }

        if let Some((data, fetched_at)) = &cached {
            if fetched_at.elapsed() < self.config.stale_time {
                debug!(%key, "serving cached query");
                return QueryResult::success(data.clone());
            }
        }

        let mut attempt = 0_u32;
        loop {
            match (options.query_fn)().await {
                Ok(data) => {
                    if !options.still_enabled() {
                        debug!(%key, "query disabled mid-flight; dropping result");
                        return QueryResult::idle(None);
                    }
                    if !self.store_for(principal, key.clone(), data.clone()) {
                        debug!(%key, "cache changed principal mid-flight; result not cached");
                    }
                    return QueryResult::success(data);
                }
                Err(err) if attempt < self.config.retry => {
                    attempt += 1;
                    warn!(%key, attempt, error = %err, "query failed; retrying");
                    let delay = self.retry_backoff(attempt);
                    if !delay.is_zero() {
                        tokio::time::sleep(delay).await;
                    }
                    if !options.still_enabled() {
                        debug!(%key, attempt, "query disabled during backoff; not retrying");
                        return QueryResult::idle(None);
                    }
                }
                Err(err) => {
                    warn!(%key, error = %err, "query failed");
                    return QueryResult::failure(err, cached.map(|(data, _)| data));
                }
            }
        }
    }
}

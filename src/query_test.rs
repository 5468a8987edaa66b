use super::*;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};

fn quiet_config() -> QueryConfig {
    QueryConfig { stale_time: Duration::from_secs(60), retry: 0, retry_delay: Duration::ZERO }
}

/// Request whose fetch closure counts invocations and returns `value`.
fn counting_request(key: &str, value: u32, calls: &Arc<AtomicUsize>) -> QueryRequest<u32> {
    let calls = Arc::clone(calls);
    QueryRequest::new(QueryKey::from_path(key), move || {
        let calls = Arc::clone(&calls);
        async move {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(value)
        }
    })
}

/// Request that fails `failures` times before succeeding with `value`.
fn flaky_request(failures: usize, value: u32, calls: &Arc<AtomicUsize>) -> QueryRequest<u32> {
    let calls = Arc::clone(calls);
    QueryRequest::new(QueryKey::new(["flaky"]), move || {
        let calls = Arc::clone(&calls);
        async move {
            let n = calls.fetch_add(1, Ordering::SeqCst);
            if n < failures { Err(QueryError::Fetch(format!("attempt {n} failed"))) } else { Ok(value) }
        }
    })
}

// =============================================================================
// QueryKey
// =============================================================================

#[test]
fn key_from_path_drops_empty_segments() {
    let key = QueryKey::from_path("/api//quests/7/");
    assert_eq!(key.segments(), ["api", "quests", "7"]);
}

#[test]
fn key_display_joins_segments() {
    assert_eq!(QueryKey::new(["friends", "pending"]).to_string(), "friends/pending");
}

#[test]
fn key_prefix_matching() {
    let key = QueryKey::new(["groups", "g1", "members"]);
    assert!(key.starts_with(&QueryKey::new(["groups"])));
    assert!(key.starts_with(&QueryKey::new(["groups", "g1"])));
    assert!(!key.starts_with(&QueryKey::new(["groups", "g2"])));
    assert!(key.starts_with(&QueryKey::new(Vec::<String>::new())));
}

// =============================================================================
// QueryRequest
// =============================================================================

#[test]
fn request_defaults_to_enabled_and_auth_required() {
    let calls = Arc::new(AtomicUsize::new(0));
    let request = counting_request("quests", 1, &calls);
    assert!(request.enabled);
    assert!(request.require_auth);
}

#[test]
fn public_clears_require_auth() {
    let calls = Arc::new(AtomicUsize::new(0));
    let request = counting_request("leaderboard", 1, &calls).public();
    assert!(!request.require_auth);
    assert!(request.enabled);
}

#[test]
fn into_options_keeps_key() {
    let calls = Arc::new(AtomicUsize::new(0));
    let options = counting_request("/api/quests", 1, &calls).with_enabled(false).into_options(true);
    assert!(options.enabled);
    assert_eq!(options.key, QueryKey::new(["api", "quests"]));
}

// =============================================================================
// QueryClient
// =============================================================================

#[tokio::test]
async fn disabled_query_never_fetches_and_is_idle() {
    let client = QueryClient::new(quiet_config());
    let calls = Arc::new(AtomicUsize::new(0));

    let result = client.execute(counting_request("quests", 5, &calls).into_options(false)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert_eq!(result.status, QueryStatus::Idle);
    assert!(result.data.is_none());
    assert!(result.error.is_none());
}

#[tokio::test]
async fn disabled_query_exposes_previously_cached_data() {
    let client = QueryClient::new(quiet_config());
    client.set_query_data(QueryKey::new(["quests"]), 9_u32);
    let calls = Arc::new(AtomicUsize::new(0));

    let result = client.execute(counting_request("quests", 5, &calls).into_options(false)).await;

    assert_eq!(calls.load(Ordering::SeqCst), 0);
    assert!(result.is_idle());
    assert_eq!(result.data, Some(9));
}

#[tokio::test]
async fn enabled_query_fetches_and_caches() {
    let client = QueryClient::new(quiet_config());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = client.execute(counting_request("quests", 5, &calls).into_options(true)).await;
    let second = client.execute(counting_request("quests", 6, &calls).into_options(true)).await;

    assert_eq!(first, QueryResult::success(5));
    assert_eq!(second, QueryResult::success(5), "fresh entry must be served from cache");
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert_eq!(client.get_query_data::<u32>(&QueryKey::new(["quests"])), Some(5));
}

#[tokio::test]
async fn zero_stale_time_always_refetches() {
    let client = QueryClient::new(QueryConfig { stale_time: Duration::ZERO, ..quiet_config() });
    let calls = Arc::new(AtomicUsize::new(0));

    client.execute(counting_request("quests", 5, &calls).into_options(true)).await;
    let second = client.execute(counting_request("quests", 6, &calls).into_options(true)).await;

    assert_eq!(second.data, Some(6));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn failures_are_retried_until_success() {
    let client = QueryClient::new(QueryConfig { retry: 2, ..quiet_config() });
    let calls = Arc::new(AtomicUsize::new(0));

    let result = client.execute(flaky_request(2, 7, &calls).into_options(true)).await;

    assert_eq!(result, QueryResult::success(7));
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausted_retries_report_error() {
    let client = QueryClient::new(QueryConfig { retry: 1, ..quiet_config() });
    let calls = Arc::new(AtomicUsize::new(0));

    let result = client.execute(flaky_request(5, 7, &calls).into_options(true)).await;

    assert_eq!(result.status, QueryStatus::Error);
    assert_eq!(result.error, Some(QueryError::Fetch("attempt 1 failed".to_owned())));
    assert!(result.data.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

#[tokio::test]
async fn error_keeps_stale_cached_data() {
    let client = QueryClient::new(QueryConfig { stale_time: Duration::ZERO, ..quiet_config() });
    client.set_query_data(QueryKey::new(["flaky"]), 3_u32);
    let calls = Arc::new(AtomicUsize::new(0));

    let result = client.execute(flaky_request(1, 7, &calls).into_options(true)).await;

    assert_eq!(result.status, QueryStatus::Error);
    assert_eq!(result.data, Some(3));
}

#[test]
fn type_mismatch_reads_as_miss() {
    let client = QueryClient::new(quiet_config());
    client.set_query_data(QueryKey::new(["profile"]), "alice".to_owned());
    assert_eq!(client.get_query_data::<u32>(&QueryKey::new(["profile"])), None);
    assert_eq!(client.get_query_data::<String>(&QueryKey::new(["profile"])).as_deref(), Some("alice"));
}

#[test]
fn invalidate_removes_matching_prefix_only() {
    let client = QueryClient::new(quiet_config());
    client.set_query_data(QueryKey::new(["groups", "g1"]), 1_u32);
    client.set_query_data(QueryKey::new(["groups", "g2"]), 2_u32);
    client.set_query_data(QueryKey::new(["friends"]), 3_u32);

    assert_eq!(client.invalidate(&QueryKey::new(["groups"])), 2);
    assert_eq!(client.len(), 1);
    assert_eq!(client.get_query_data::<u32>(&QueryKey::new(["friends"])), Some(3));

    client.clear();
    assert!(client.is_empty());
}

#[test]
fn retry_backoff_doubles_and_caps() {
    let client = QueryClient::new(QueryConfig { retry_delay: Duration::from_millis(100), ..quiet_config() });
    assert_eq!(client.retry_backoff(1), Duration::from_millis(100));
    assert_eq!(client.retry_backoff(2), Duration::from_millis(200));
    assert_eq!(client.retry_backoff(3), Duration::from_millis(400));
    assert_eq!(client.retry_backoff(20), MAX_RETRY_DELAY);
}

#[test]
fn default_config_matches_constants() {
    let config = QueryConfig::default();
    assert_eq!(config.stale_time, Duration::from_secs(DEFAULT_STALE_SECS));
    assert_eq!(config.retry, DEFAULT_RETRY);
    assert_eq!(config.retry_delay, Duration::from_millis(DEFAULT_RETRY_DELAY_MS));
}

// =============================================================================
// principal binding
// =============================================================================

#[test]
fn rebinding_principal_drops_entries() {
    let client = QueryClient::new(quiet_config());
    assert!(client.bind_principal(Some("u1")));
    client.set_query_data(QueryKey::new(["quests"]), 1_u32);

    assert!(!client.bind_principal(Some("u1")));
    assert_eq!(client.len(), 1);

    assert!(client.bind_principal(Some("u2")));
    assert!(client.is_empty());
}

#[test]
fn results_for_previous_principal_are_not_stored() {
    let client = QueryClient::new(quiet_config());
    client.bind_principal(Some("u1"));
    client.bind_principal(None);

    assert!(!client.store_for(Some("u1"), QueryKey::new(["quests"]), 1_u32));
    assert!(client.is_empty());
    assert!(client.store_for(None, QueryKey::new(["quests"]), 2_u32));
    assert_eq!(client.get_query_data::<u32>(&QueryKey::new(["quests"])), Some(2));
}

#[tokio::test]
async fn cache_is_not_served_to_another_principal() {
    let client = QueryClient::new(quiet_config());
    let calls = Arc::new(AtomicUsize::new(0));

    let first = client
        .execute(counting_request("/api/quests", 1, &calls).into_options(true).for_principal(Some("u1".to_owned())))
        .await;
    let second = client
        .execute(counting_request("/api/quests", 2, &calls).into_options(true).for_principal(Some("u2".to_owned())))
        .await;

    assert_eq!(first, QueryResult::success(1));
    assert_eq!(second, QueryResult::success(2));
    assert_eq!(calls.load(Ordering::SeqCst), 2);
}

// =============================================================================
// recheck
// =============================================================================

#[tokio::test]
async fn disabling_during_backoff_stops_retries() {
    let client = QueryClient::new(QueryConfig { retry: 3, retry_delay: Duration::from_millis(5), ..quiet_config() });
    let calls = Arc::new(AtomicUsize::new(0));
    let live = Arc::new(AtomicBool::new(true));
    let flag = Arc::clone(&live);
    let counted = Arc::clone(&calls);
    let request = QueryRequest::<u32>::new(QueryKey::new(["flaky"]), move || {
        let counted = Arc::clone(&counted);
        let flag = Arc::clone(&flag);
        async move {
            counted.fetch_add(1, Ordering::SeqCst);
            flag.store(false, Ordering::SeqCst);
            Err(QueryError::Fetch("unavailable".to_owned()))
        }
    });
    let check = Arc::clone(&live);
    let request = request.with_recheck(move || check.load(Ordering::SeqCst));

    let result = client.execute(request.into_options(true)).await;

    assert!(result.is_idle());
    assert!(result.error.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn result_is_dropped_when_disabled_mid_flight() {
    let client = QueryClient::new(quiet_config());
    let calls = Arc::new(AtomicUsize::new(0));
    let request = counting_request("/api/quests", 9, &calls).with_recheck(|| false);

    let result = client.execute(request.into_options(true)).await;

    assert!(result.is_idle());
    assert!(result.data.is_none());
    assert_eq!(calls.load(Ordering::SeqCst), 1);
    assert!(client.is_empty());
}

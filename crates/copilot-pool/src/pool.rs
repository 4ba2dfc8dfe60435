//! Pool state and rotation-aware credential selection
//!
//! The pool owns every piece of shared mutable state in the gateway. Each
//! slot splits that state by access pattern: backoff bookkeeping lives
//! under a plain `std::sync::Mutex` that is only ever held for a few loads
//! and stores, never across an await; the cached access token lives under
//! a per-slot `tokio::sync::Mutex` that IS held across the exchange, so
//! concurrent requests on the same credential trigger one refresh, not
//! several. The shared rotation index is an atomic kept inside `[0, size)`.
//!
//! Selection never blocks on I/O — it is a bounded circular scan starting
//! at the current index, touching only the backoff locks. An in-flight
//! token exchange on one credential, however slow, cannot stall selection,
//! status snapshots, or requests using the other credentials.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex as SyncMutex;
use std::time::{Duration, Instant};

use common::Secret;
use copilot_auth::EXPIRY_SAFETY_MARGIN_SECS;
use serde::Serialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::backoff::{Backoff, BackoffPolicy};
use crate::error::{Error, Result};

/// Cached access token for one credential.
#[derive(Debug, Default)]
struct TokenCache {
    access_token: Option<String>,
    /// Absolute expiry of the cached token, unix seconds
    expires_at: Option<u64>,
}

struct Slot {
    refresh: Secret<String>,
    backoff: SyncMutex<Backoff>,
    token: Mutex<TokenCache>,
}

/// A selected credential, identified by its stable pool index.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selected {
    pub index: usize,
}

/// Read-only snapshot of one credential for the status endpoint.
#[derive(Debug, Clone, Serialize)]
pub struct CredentialStatus {
    pub index: usize,
    pub is_current: bool,
    pub is_rate_limited: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limited_remaining_secs: Option<u64>,
    pub consecutive_failures: u32,
}

/// Snapshot of the whole pool.
#[derive(Debug, Serialize)]
pub struct PoolStatus {
    pub current_index: usize,
    pub total_credentials: usize,
    pub credentials: Vec<CredentialStatus>,
}

/// Result of a manual cycle operation.
#[derive(Debug, Serialize)]
pub struct CycleReport {
    pub previous_index: usize,
    pub current_index: usize,
    pub total_credentials: usize,
    pub current_credential: CredentialStatus,
}

/// Credential pool with round-robin rotation and per-credential backoff.
pub struct CredentialPool {
    slots: Vec<Slot>,
    current: AtomicUsize,
    policy: BackoffPolicy,
    token_url: String,
    client: reqwest::Client,
    exchange_timeout: Duration,
}

impl CredentialPool {
    /// Create a pool from the configured credential list, in order.
    ///
    /// An empty list is a startup invariant violation, not a runtime
    /// condition, and is rejected here. `exchange_timeout` bounds every
    /// token exchange the pool performs.
    pub fn new(
        credentials: Vec<Secret<String>>,
        policy: BackoffPolicy,
        token_url: String,
        client: reqwest::Client,
        exchange_timeout: Duration,
    ) -> Result<Self> {
        if credentials.is_empty() {
            return Err(Error::Empty);
        }
        let slots = credentials
            .into_iter()
            .map(|refresh| Slot {
                refresh,
                backoff: SyncMutex::new(Backoff::default()),
                token: Mutex::new(TokenCache::default()),
            })
            .collect::<Vec<_>>();
        info!(credentials = slots.len(), "credential pool initialized");
        Ok(Self {
            slots,
            current: AtomicUsize::new(0),
            policy,
            token_url,
            client,
            exchange_timeout,
        })
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Lock one slot's backoff state. Poisoning cannot leave the state
    /// half-written (every mutation is a single `record` or `clear`), so
    /// a poisoned lock is recovered rather than propagated.
    fn backoff(&self, index: usize) -> std::sync::MutexGuard<'_, Backoff> {
        self.slots[index]
            .backoff
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    /// Select the next eligible credential.
    ///
    /// Returns the credential at the current index when it is not under
    /// backoff; otherwise scans forward circularly, wrapping at most once.
    /// Expired backoff windows are cleared here, lazily. The shared index
    /// is not moved by selection — only `advance()` moves it.
    pub fn select(&self) -> Result<Selected> {
        self.select_skipping(&HashSet::new())
    }

    /// Like `select()`, but also skips the indices in `exclude` so a single
    /// inbound request never uses the same credential twice.
    pub fn select_skipping(&self, exclude: &HashSet<usize>) -> Result<Selected> {
        let n = self.slots.len();
        let start = self.current.load(Ordering::Relaxed) % n;
        let now = Instant::now();

        for offset in 0..n {
            let idx = (start + offset) % n;
            if exclude.contains(&idx) {
                continue;
            }
            let mut backoff = self.backoff(idx);
            if backoff.clear_if_expired(now) {
                info!(credential = idx, "backoff expired, credential eligible again");
            }
            if !backoff.is_limited(now) {
                debug!(credential = idx, "credential selected");
                return Ok(Selected { index: idx });
            }
        }

        let retry_after = self.earliest_deadline(now);
        warn!(
            retry_after_secs = retry_after.map(|d| d.as_secs()),
            "all credentials rate limited or excluded"
        );
        Err(Error::Exhausted { retry_after })
    }

    /// Atomically move the shared index to `(current + 1) mod size`.
    ///
    /// A compare-exchange loop rather than `fetch_add` keeps the stored
    /// value inside `[0, size)` at all times.
    pub fn advance(&self) -> usize {
        let n = self.slots.len();
        let mut cur = self.current.load(Ordering::Relaxed);
        loop {
            let next = (cur + 1) % n;
            match self
                .current
                .compare_exchange_weak(cur, next, Ordering::Relaxed, Ordering::Relaxed)
            {
                Ok(_) => return next,
                Err(actual) => cur = actual,
            }
        }
    }

    /// Record an upstream rate-limit on `index` and advance the rotation.
    ///
    /// The backoff window starts at the floor, doubles while the credential
    /// is still limited, and caps at the ceiling. Advancing immediately
    /// means subsequent selections skip this credential without having to
    /// rediscover the 429.
    pub fn mark_rate_limited(&self, index: usize) {
        if self.slots.get(index).is_none() {
            warn!(credential = index, "rate-limit report for unknown credential");
            return;
        }
        let now = Instant::now();
        {
            let mut backoff = self.backoff(index);
            backoff.record(&self.policy, now);
            warn!(
                credential = index,
                backoff_secs = backoff.remaining(now).map(|d| d.as_secs()),
                consecutive_failures = backoff.consecutive_failures(),
                "credential rate limited, backing off"
            );
        }
        metrics::counter!("pool_rate_limited_total", "credential" => index.to_string())
            .increment(1);
        self.advance();
    }

    /// Return the cached access token for `index`, exchanging the refresh
    /// credential when the cache is empty or within the expiry safety
    /// margin. The slot's token lock is held across the exchange so
    /// concurrent requests on the same credential trigger one refresh, not
    /// several — selection and status never touch this lock.
    pub async fn ensure_access_token(&self, index: usize) -> Result<String> {
        let slot = self
            .slots
            .get(index)
            .ok_or(Error::UnknownCredential(index))?;
        let mut cache = slot.token.lock().await;

        let now = unix_now();
        if let (Some(token), Some(expires_at)) = (&cache.access_token, cache.expires_at) {
            if expires_at > now + EXPIRY_SAFETY_MARGIN_SECS {
                debug!(credential = index, "using cached access token");
                return Ok(token.clone());
            }
            debug!(credential = index, "cached access token expiring, refreshing");
        }

        let response = copilot_auth::fetch_access_token(
            &self.client,
            &self.token_url,
            slot.refresh.expose(),
            self.exchange_timeout,
        )
        .await?;
        info!(
            credential = index,
            expires_at = response.expires_at,
            chat_enabled = response.chat_enabled,
            "access token exchanged"
        );
        cache.access_token = Some(response.token.clone());
        cache.expires_at = Some(response.expires_at);
        Ok(response.token)
    }

    /// Manual rotation: advance unconditionally, regardless of the current
    /// credential's eligibility, and report where the pointer landed.
    pub fn cycle(&self) -> CycleReport {
        let previous_index = self.current.load(Ordering::Relaxed);
        let current_index = self.advance();
        info!(previous_index, current_index, "manual credential cycle");
        let current_credential = self.credential_status(current_index, current_index);
        CycleReport {
            previous_index,
            current_index,
            total_credentials: self.slots.len(),
            current_credential,
        }
    }

    /// Read-only snapshot of every credential. Does not mutate backoff
    /// state — expiry still clears lazily at selection time.
    pub fn status(&self) -> PoolStatus {
        let current_index = self.current.load(Ordering::Relaxed);
        let credentials = (0..self.slots.len())
            .map(|idx| self.credential_status(idx, current_index))
            .collect();
        PoolStatus {
            current_index,
            total_credentials: self.slots.len(),
            credentials,
        }
    }

    fn credential_status(&self, index: usize, current_index: usize) -> CredentialStatus {
        let now = Instant::now();
        let backoff = self.backoff(index);
        let limited = backoff.is_limited(now);
        CredentialStatus {
            index,
            is_current: index == current_index,
            is_rate_limited: limited,
            rate_limited_remaining_secs: if limited {
                backoff.remaining(now).map(|d| d.as_secs())
            } else {
                None
            },
            consecutive_failures: backoff.consecutive_failures(),
        }
    }

    /// Earliest backoff deadline across the pool, as a delta from `now`.
    fn earliest_deadline(&self, now: Instant) -> Option<Duration> {
        let mut earliest: Option<Instant> = None;
        for idx in 0..self.slots.len() {
            if let Some(until) = self.backoff(idx).until() {
                earliest = Some(earliest.map_or(until, |e| e.min(until)));
            }
        }
        earliest.map(|u| u.saturating_duration_since(now))
    }

    /// Seed a cached access token directly, bypassing the exchange.
    #[cfg(test)]
    pub async fn seed_token(&self, index: usize, token: &str, expires_at: u64) {
        let mut cache = self.slots[index].token.lock().await;
        cache.access_token = Some(token.to_string());
        cache.expires_at = Some(expires_at);
    }
}

/// Current unix time in seconds.
fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn secrets(n: usize) -> Vec<Secret<String>> {
        (0..n).map(|i| Secret::new(format!("rt_{i}"))).collect()
    }

    fn pool_with_endpoint(n: usize, policy: BackoffPolicy, token_url: String) -> CredentialPool {
        CredentialPool::new(
            secrets(n),
            policy,
            token_url,
            reqwest::Client::new(),
            Duration::from_millis(200),
        )
        .unwrap()
    }

    /// Pool whose token endpoint is unreachable — exchanges always fail.
    fn test_pool(n: usize, policy: BackoffPolicy) -> CredentialPool {
        pool_with_endpoint(n, policy, "http://127.0.0.1:1/token".into())
    }

    fn short_policy() -> BackoffPolicy {
        BackoffPolicy {
            floor: Duration::from_millis(40),
            ceiling: Duration::from_millis(320),
        }
    }

    /// Endpoint that accepts connections and then never sends a byte.
    async fn hung_token_server() -> String {
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let url = format!("http://{}/token", listener.local_addr().unwrap());
        tokio::spawn(async move {
            let mut held = Vec::new();
            loop {
                let (socket, _) = listener.accept().await.unwrap();
                held.push(socket);
            }
        });
        url
    }

    /// Unix timestamp far in the future (year 2100).
    fn future_expiry() -> u64 {
        4_102_444_800
    }

    #[test]
    fn empty_pool_is_a_startup_error() {
        let result = CredentialPool::new(
            vec![],
            BackoffPolicy::default(),
            "http://127.0.0.1:1/token".into(),
            reqwest::Client::new(),
            Duration::from_millis(200),
        );
        assert!(matches!(result, Err(Error::Empty)));
    }

    #[test]
    fn advance_n_times_returns_to_start() {
        for n in 1..=5 {
            let pool = test_pool(n, BackoffPolicy::default());
            let start = pool.current.load(Ordering::Relaxed);
            for _ in 0..n {
                pool.advance();
            }
            assert_eq!(pool.current.load(Ordering::Relaxed), start, "pool size {n}");
        }
    }

    #[test]
    fn advance_stays_within_bounds() {
        let pool = test_pool(3, BackoffPolicy::default());
        for _ in 0..10 {
            let idx = pool.advance();
            assert!(idx < 3);
        }
    }

    #[test]
    fn select_prefers_current_credential() {
        let pool = test_pool(3, BackoffPolicy::default());
        assert_eq!(pool.select().unwrap().index, 0);
        pool.advance();
        assert_eq!(pool.select().unwrap().index, 1);
        // selection itself does not move the pointer
        assert_eq!(pool.select().unwrap().index, 1);
    }

    #[test]
    fn select_skips_rate_limited_credentials() {
        let pool = test_pool(3, BackoffPolicy::default());
        pool.mark_rate_limited(0);
        // index advanced to 1 by the mark
        assert_eq!(pool.select().unwrap().index, 1);
        pool.mark_rate_limited(1);
        assert_eq!(pool.select().unwrap().index, 2);
    }

    #[test]
    fn select_wraps_around_the_pool() {
        let pool = test_pool(3, BackoffPolicy::default());
        pool.advance();
        pool.advance(); // current = 2
        pool.mark_rate_limited(2); // current wraps to 0
        assert_eq!(pool.select().unwrap().index, 0);
    }

    #[test]
    fn select_skipping_honors_exclusions() {
        let pool = test_pool(3, BackoffPolicy::default());
        let mut tried = HashSet::new();
        tried.insert(0);
        assert_eq!(pool.select_skipping(&tried).unwrap().index, 1);
        tried.insert(1);
        assert_eq!(pool.select_skipping(&tried).unwrap().index, 2);
        tried.insert(2);
        assert!(matches!(
            pool.select_skipping(&tried),
            Err(Error::Exhausted { retry_after: None })
        ));
    }

    #[test]
    fn exhausted_carries_earliest_deadline() {
        let pool = test_pool(3, short_policy());
        // credential 1 gets a doubled window, 0 and 2 the floor
        pool.mark_rate_limited(1);
        pool.mark_rate_limited(1);
        pool.mark_rate_limited(0);
        pool.mark_rate_limited(2);

        match pool.select() {
            Err(Error::Exhausted {
                retry_after: Some(delta),
            }) => {
                // earliest deadline is a floor-sized window, not the doubled one
                assert!(delta <= short_policy().floor, "retry_after {delta:?}");
            }
            other => panic!("expected Exhausted with deadline, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn single_credential_pool_exhausts_and_recovers() {
        let pool = test_pool(1, short_policy());
        pool.mark_rate_limited(0);
        assert!(matches!(
            pool.select(),
            Err(Error::Exhausted { retry_after: Some(_) })
        ));

        tokio::time::sleep(short_policy().floor + Duration::from_millis(10)).await;
        // lazy recovery at selection time
        assert_eq!(pool.select().unwrap().index, 0);
        let status = pool.status();
        assert!(!status.credentials[0].is_rate_limited);
        assert_eq!(status.credentials[0].consecutive_failures, 0);
    }

    #[test]
    fn mark_rate_limited_advances_shared_index() {
        let pool = test_pool(3, BackoffPolicy::default());
        pool.mark_rate_limited(0);

        let status = pool.status();
        assert_eq!(status.current_index, 1);
        assert!(status.credentials[0].is_rate_limited);
        assert!(!status.credentials[1].is_rate_limited);
        // floor window: remaining should be close to two minutes
        let remaining = status.credentials[0]
            .rate_limited_remaining_secs
            .unwrap();
        assert!((115..=120).contains(&remaining), "remaining {remaining}");
    }

    #[test]
    fn repeated_marks_double_and_never_shrink_the_window() {
        let pool = test_pool(2, BackoffPolicy::default());
        pool.mark_rate_limited(0);
        let first = pool.status().credentials[0]
            .rate_limited_remaining_secs
            .unwrap();
        pool.mark_rate_limited(0);
        let second = pool.status().credentials[0]
            .rate_limited_remaining_secs
            .unwrap();
        assert!(second > first, "window must grow: {first} -> {second}");
        assert!((230..=240).contains(&second), "doubled window, got {second}");
    }

    #[test]
    fn status_reports_current_flag_per_credential() {
        let pool = test_pool(3, BackoffPolicy::default());
        pool.advance();
        let status = pool.status();
        assert_eq!(status.total_credentials, 3);
        let current_flags: Vec<bool> =
            status.credentials.iter().map(|c| c.is_current).collect();
        assert_eq!(current_flags, vec![false, true, false]);
    }

    #[test]
    fn status_serializes_to_json() {
        let pool = test_pool(2, BackoffPolicy::default());
        pool.mark_rate_limited(0);
        let json = serde_json::to_value(pool.status()).unwrap();
        assert_eq!(json["current_index"], 1);
        assert_eq!(json["total_credentials"], 2);
        assert_eq!(json["credentials"][0]["is_rate_limited"], true);
        assert_eq!(json["credentials"][1]["is_rate_limited"], false);
    }

    #[test]
    fn cycle_reports_previous_and_current() {
        let pool = test_pool(3, BackoffPolicy::default());
        let report = pool.cycle();
        assert_eq!(report.previous_index, 0);
        assert_eq!(report.current_index, 1);
        assert_eq!(report.total_credentials, 3);
        assert!(report.current_credential.is_current);

        // cycling past the end wraps
        pool.cycle();
        let report = pool.cycle();
        assert_eq!(report.current_index, 0);
    }

    #[test]
    fn cycle_ignores_eligibility() {
        let pool = test_pool(2, BackoffPolicy::default());
        pool.mark_rate_limited(1); // current is now 0
        let report = pool.cycle();
        // manual cycle lands on the rate-limited credential anyway
        assert_eq!(report.current_index, 1);
        assert!(report.current_credential.is_rate_limited);
    }

    #[tokio::test]
    async fn ensure_access_token_returns_cached_token() {
        let pool = test_pool(1, BackoffPolicy::default());
        pool.seed_token(0, "at_cached", future_expiry()).await;
        // endpoint is unreachable, so a cache miss would error
        let token = pool.ensure_access_token(0).await.unwrap();
        assert_eq!(token, "at_cached");
    }

    #[tokio::test]
    async fn ensure_access_token_refreshes_inside_safety_margin() {
        let pool = test_pool(1, BackoffPolicy::default());
        // expires one second from now — inside the 300s margin
        pool.seed_token(0, "at_stale", unix_now() + 1).await;
        let result = pool.ensure_access_token(0).await;
        assert!(
            matches!(result, Err(Error::TokenExchange(_))),
            "stale token must trigger an exchange, got {result:?}"
        );
    }

    #[tokio::test]
    async fn ensure_access_token_unknown_index_errors() {
        let pool = test_pool(1, BackoffPolicy::default());
        assert!(matches!(
            pool.ensure_access_token(7).await,
            Err(Error::UnknownCredential(7))
        ));
    }

    #[tokio::test]
    async fn hung_exchange_fails_within_the_timeout() {
        let url = hung_token_server().await;
        let pool = pool_with_endpoint(1, BackoffPolicy::default(), url);
        let started = Instant::now();
        let result = pool.ensure_access_token(0).await;
        assert!(
            matches!(result, Err(Error::TokenExchange(_))),
            "got: {result:?}"
        );
        assert!(
            started.elapsed() < Duration::from_secs(2),
            "attempt must fail within the exchange bound, took {:?}",
            started.elapsed()
        );
    }

    #[tokio::test]
    async fn selection_and_status_proceed_during_inflight_exchange() {
        let url = hung_token_server().await;
        let pool = std::sync::Arc::new(CredentialPool::new(
            secrets(2),
            BackoffPolicy::default(),
            url,
            reqwest::Client::new(),
            Duration::from_secs(30),
        )
        .unwrap());

        // park an exchange on credential 0; it stays in flight for the
        // whole test
        let exchanging = pool.clone();
        let handle = tokio::spawn(async move { exchanging.ensure_access_token(0).await });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(!handle.is_finished(), "exchange should still be in flight");

        // selection, status, and rate-limit marks must not wait on it
        assert_eq!(pool.select().unwrap().index, 0);
        let mut tried = HashSet::new();
        tried.insert(0);
        assert_eq!(pool.select_skipping(&tried).unwrap().index, 1);
        assert_eq!(pool.status().total_credentials, 2);
        pool.mark_rate_limited(0);
        assert_eq!(pool.select().unwrap().index, 1);

        handle.abort();
    }

    #[tokio::test]
    async fn concurrent_marks_are_safe() {
        let pool = std::sync::Arc::new(test_pool(3, BackoffPolicy::default()));
        let mut handles = Vec::new();
        for _ in 0..8 {
            let pool = pool.clone();
            handles.push(tokio::spawn(async move {
                pool.mark_rate_limited(0);
            }));
        }
        for h in handles {
            h.await.unwrap();
        }
        let status = pool.status();
        assert!(status.credentials[0].is_rate_limited);
        assert_eq!(status.credentials[0].consecutive_failures, 8);
        assert!(status.current_index < 3);
    }
}

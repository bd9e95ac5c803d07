//! Pool state machine over the configured session cookies
//!
//! The canonical cookie list is fixed at construction. Per-cookie status
//! lives in a single `RwLock`ed map shared by all in-flight requests; every
//! mutation touches one key in one step, so concurrent marks on different
//! cookies never lose updates.
//!
//! Rate-limit expiry is lazy: a `RateLimited` cookie whose lock has passed
//! goes back to `Available` the next time a candidate list is built.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use common::Secret;
use rand::seq::SliceRandom;
use tokio::sync::RwLock;
use tracing::{debug, info, warn};

use crate::candidates::CandidateList;

/// Characters of the cookie tail shown in logs.
const FINGERPRINT_CHARS: usize = 6;

/// Runtime status of a pool cookie.
///
/// Transitions:
/// - Available → RateLimited (upstream rate-limit rejection)
/// - Available / RateLimited → Evicted (billing exhaustion)
/// - RateLimited → Available (lock expired, on next candidate build)
/// - Evicted is final for the lifetime of the pool
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CookieStatus {
    Available,
    RateLimited { until: Instant },
    Evicted,
}

/// One configured session cookie.
///
/// The session key is the part before the first `=`, or the whole value
/// when there is none. It is what the upstream accepts as a bearer token.
#[derive(Debug, Clone)]
pub struct Cookie {
    index: usize,
    session_key: Secret<String>,
    fingerprint: String,
}

impl Cookie {
    fn new(index: usize, raw: &str) -> Self {
        let raw = Secret::new(raw.to_string());
        let session_key = match raw.expose().split_once('=') {
            Some((key, _)) => key.to_string(),
            None => raw.expose().clone(),
        };
        Self {
            index,
            fingerprint: raw.fingerprint(FINGERPRINT_CHARS),
            session_key: Secret::new(session_key),
        }
    }

    /// Position in the configured list; stable identity within the pool.
    pub fn index(&self) -> usize {
        self.index
    }

    pub fn session_key(&self) -> &str {
        self.session_key.expose()
    }

    /// Log-safe identifier.
    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

/// Pool of session cookies with independent rate-limit and eviction state.
pub struct CookiePool {
    cookies: Vec<Cookie>,
    statuses: RwLock<HashMap<usize, CookieStatus>>,
}

impl CookiePool {
    /// Build a pool from the configured cookie strings.
    ///
    /// Blank entries are dropped and duplicates collapse onto their first
    /// occurrence. All cookies start `Available`.
    pub fn new<I, S>(raw_cookies: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        let mut seen: Vec<String> = Vec::new();
        let mut cookies = Vec::new();
        for raw in raw_cookies {
            let raw = raw.as_ref().trim();
            if raw.is_empty() || seen.iter().any(|s| s == raw) {
                continue;
            }
            cookies.push(Cookie::new(cookies.len(), raw));
            seen.push(raw.to_string());
        }
        let statuses = cookies
            .iter()
            .map(|c| (c.index, CookieStatus::Available))
            .collect();
        info!(cookies = cookies.len(), "cookie pool initialized");
        Self {
            cookies,
            statuses: RwLock::new(statuses),
        }
    }

    pub fn len(&self) -> usize {
        self.cookies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.cookies.is_empty()
    }

    /// Snapshot of the cookies usable right now, in random order.
    ///
    /// Expired rate limits are cleared as a side effect. The whole scan runs
    /// under one write lock, so a concurrent mark is either fully visible or
    /// not at all.
    pub async fn candidates(&self) -> CandidateList {
        let mut items = {
            let mut statuses = self.statuses.write().await;
            let now = Instant::now();
            let mut items = Vec::with_capacity(self.cookies.len());
            for cookie in &self.cookies {
                let status = statuses
                    .entry(cookie.index)
                    .or_insert(CookieStatus::Available);
                match status {
                    CookieStatus::Available => items.push(cookie.clone()),
                    CookieStatus::RateLimited { until } if now >= *until => {
                        info!(cookie = cookie.fingerprint(), "rate limit expired, cookie available again");
                        *status = CookieStatus::Available;
                        metrics::counter!("pool_transitions_total", "action" => "recovered").increment(1);
                        items.push(cookie.clone());
                    }
                    CookieStatus::RateLimited { .. } | CookieStatus::Evicted => {}
                }
            }
            items
        };
        items.shuffle(&mut rand::rng());
        debug!(candidates = items.len(), total = self.cookies.len(), "candidate list built");
        CandidateList::new(items)
    }

    /// Lock a cookie out of selection until `now + lock`.
    ///
    /// Overwrites any earlier expiry (last writer wins). An evicted cookie
    /// stays evicted.
    pub async fn mark_rate_limited(&self, cookie: &Cookie, lock: Duration) {
        let mut statuses = self.statuses.write().await;
        let status = statuses
            .entry(cookie.index)
            .or_insert(CookieStatus::Available);
        if *status == CookieStatus::Evicted {
            debug!(cookie = cookie.fingerprint(), "ignoring rate limit for evicted cookie");
            return;
        }
        *status = CookieStatus::RateLimited {
            until: Instant::now() + lock,
        };
        info!(
            cookie = cookie.fingerprint(),
            lock_secs = lock.as_secs(),
            "cookie rate limited"
        );
        metrics::counter!("pool_transitions_total", "action" => "rate_limited").increment(1);
    }

    /// Remove a cookie from all future candidate lists.
    pub async fn evict(&self, cookie: &Cookie) {
        let previous = self
            .statuses
            .write()
            .await
            .insert(cookie.index, CookieStatus::Evicted);
        if previous != Some(CookieStatus::Evicted) {
            warn!(cookie = cookie.fingerprint(), "cookie evicted");
            metrics::counter!("pool_transitions_total", "action" => "evicted").increment(1);
        }
    }

    /// Current status of a cookie, without applying lazy expiry.
    #[cfg(test)]
    pub(crate) async fn status(&self, cookie: &Cookie) -> CookieStatus {
        self.statuses
            .read()
            .await
            .get(&cookie.index)
            .cloned()
            .unwrap_or(CookieStatus::Available)
    }

    /// Pool health summary for the health endpoint.
    ///
    /// All available → healthy, some available → degraded, none → unhealthy.
    /// Rate limits that have already expired count as available.
    pub async fn health(&self) -> serde_json::Value {
        let statuses = self.statuses.read().await;
        let now = Instant::now();

        let mut cookies = Vec::with_capacity(self.cookies.len());
        let mut available = 0usize;
        let mut rate_limited = 0usize;
        let mut evicted = 0usize;

        for cookie in &self.cookies {
            match statuses.get(&cookie.index) {
                Some(CookieStatus::Available) | None => {
                    available += 1;
                    cookies.push(serde_json::json!({
                        "id": cookie.fingerprint(),
                        "status": "available"
                    }));
                }
                Some(CookieStatus::RateLimited { until }) if now >= *until => {
                    available += 1;
                    cookies.push(serde_json::json!({
                        "id": cookie.fingerprint(),
                        "status": "available"
                    }));
                }
                Some(CookieStatus::RateLimited { until }) => {
                    rate_limited += 1;
                    cookies.push(serde_json::json!({
                        "id": cookie.fingerprint(),
                        "status": "rate_limited",
                        "lock_remaining_secs": (*until - now).as_secs()
                    }));
                }
                Some(CookieStatus::Evicted) => {
                    evicted += 1;
                    cookies.push(serde_json::json!({
                        "id": cookie.fingerprint(),
                        "status": "evicted"
                    }));
                }
            }
        }

        let total = self.cookies.len();
        let pool_status = if available == total && total > 0 {
            "healthy"
        } else if available > 0 {
            "degraded"
        } else {
            "unhealthy"
        };

        serde_json::json!({
            "status": pool_status,
            "cookies_total": total,
            "cookies_available": available,
            "cookies_rate_limited": rate_limited,
            "cookies_evicted": evicted,
            "cookies": cookies
        })
    }
}

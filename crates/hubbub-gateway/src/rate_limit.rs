//! Sliding-window rate limiting.
//!
//! One generic limiter, two profiles: gateway traffic (120 events / 60 s per
//! user) and pre-auth magic-link issuance (5 requests / 15 min per client
//! address, exposed as an axum middleware returning a structured 429). The
//! window is a true sliding window: timestamps older than the window are
//! evicted on every check, and a periodic sweep drops keys with no live
//! timestamps so idle users cost no memory.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use axum::Json;
use axum::extract::{ConnectInfo, Request, State};
use axum::http::{HeaderName, HeaderValue, StatusCode, header};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::counter;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::time::Instant;

use crate::metrics::RATE_LIMITED_TOTAL;

/// Per-response limit header.
pub const HEADER_LIMIT: HeaderName = HeaderName::from_static("x-ratelimit-limit");
/// Per-response remaining-budget header.
pub const HEADER_REMAINING: HeaderName = HeaderName::from_static("x-ratelimit-remaining");

/// A limiter profile: how many events per trailing window.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimiterConfig {
    /// Events admitted per window.
    pub limit: u32,
    /// Trailing window length in milliseconds.
    pub window_ms: u64,
}

impl RateLimiterConfig {
    /// Gateway traffic: 120 events per 60 s, keyed by user id.
    #[must_use]
    pub fn gateway() -> Self {
        Self {
            limit: 120,
            window_ms: 60_000,
        }
    }

    /// Pre-auth magic-link issuance: 5 requests per 15 min, keyed by client
    /// address (it runs before any user identity exists).
    #[must_use]
    pub fn magic_link() -> Self {
        Self {
            limit: 5,
            window_ms: 900_000,
        }
    }

    /// The trailing window as a duration.
    #[must_use]
    pub const fn window(&self) -> Duration {
        Duration::from_millis(self.window_ms)
    }
}

/// Outcome of one admission check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    /// Whether the event was admitted.
    pub allowed: bool,
    /// The profile's limit.
    pub limit: u32,
    /// Budget left in the window after this check.
    pub remaining: u32,
    /// If rejected: when the oldest timestamp leaves the window.
    pub retry_after: Option<Duration>,
}

/// Sliding-window counter over an arbitrary key.
pub struct SlidingWindow<K> {
    config: RateLimiterConfig,
    entries: Mutex<HashMap<K, VecDeque<Instant>>>,
}

impl<K: Eq + Hash> SlidingWindow<K> {
    /// Create a limiter with the given profile.
    #[must_use]
    pub fn new(config: RateLimiterConfig) -> Self {
        Self {
            config,
            entries: Mutex::new(HashMap::new()),
        }
    }

    /// Check and record an event for `key` at the current time.
    pub fn check(&self, key: K) -> Decision {
        self.check_at(key, Instant::now())
    }

    /// Deterministic variant of [`check`](Self::check) with an explicit
    /// clock reading.
    pub fn check_at(&self, key: K, now: Instant) -> Decision {
        let window = self.config.window();
        let limit = self.config.limit;
        let mut entries = self.entries.lock();
        let stamps = entries.entry(key).or_default();
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) >= window {
                let _ = stamps.pop_front();
            } else {
                break;
            }
        }
        if (stamps.len() as u32) < limit {
            stamps.push_back(now);
            Decision {
                allowed: true,
                limit,
                remaining: limit - stamps.len() as u32,
                retry_after: None,
            }
        } else {
            counter!(RATE_LIMITED_TOTAL).increment(1);
            let retry_after = stamps
                .front()
                .map(|oldest| window.checked_sub(now.duration_since(*oldest)).unwrap_or_default());
            Decision {
                allowed: false,
                limit,
                remaining: 0,
                retry_after,
            }
        }
    }

    /// Drop keys with no timestamps left inside the window.
    pub fn sweep(&self) {
        self.sweep_at(Instant::now());
    }

    /// Deterministic variant of [`sweep`](Self::sweep).
    pub fn sweep_at(&self, now: Instant) {
        let window = self.config.window();
        self.entries.lock().retain(|_, stamps| {
            while let Some(front) = stamps.front() {
                if now.duration_since(*front) >= window {
                    let _ = stamps.pop_front();
                } else {
                    break;
                }
            }
            !stamps.is_empty()
        });
    }

    /// Number of keys currently tracked.
    #[must_use]
    pub fn tracked_keys(&self) -> usize {
        self.entries.lock().len()
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Pre-auth REST guard
// ─────────────────────────────────────────────────────────────────────────────

/// Axum middleware limiting a pre-auth route by client address.
///
/// Admitted requests pass through with limit/remaining headers attached;
/// rejected ones get a structured 429 with retry-after metadata without ever
/// reaching the inner handler.
pub async fn preauth_rate_limit(
    State(limiter): State<Arc<SlidingWindow<IpAddr>>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
    next: Next,
) -> Response {
    let decision = limiter.check(addr.ip());
    if decision.allowed {
        let mut response = next.run(request).await;
        annotate(response.headers_mut(), &decision);
        response
    } else {
        rejected_response(&decision)
    }
}

fn annotate(headers: &mut axum::http::HeaderMap, decision: &Decision) {
    let _ = headers.insert(HEADER_LIMIT, HeaderValue::from(decision.limit));
    let _ = headers.insert(HEADER_REMAINING, HeaderValue::from(decision.remaining));
}

fn rejected_response(decision: &Decision) -> Response {
    let retry_after = decision.retry_after.unwrap_or_default();
    let retry_after_secs = retry_after.as_millis().div_ceil(1000) as u64;
    let body = Json(json!({
        "error": "rate_limited",
        "message": "too many requests",
        "retryAfterMs": retry_after.as_millis() as u64,
    }));
    let mut response = (StatusCode::TOO_MANY_REQUESTS, body).into_response();
    annotate(response.headers_mut(), decision);
    let _ = response
        .headers_mut()
        .insert(header::RETRY_AFTER, HeaderValue::from(retry_after_secs));
    response
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

//! Per-host politeness delays shared by page fetches and artifact downloads.
//!
//! Vendor sites are crawled from a single process, so requests to one host
//! are spaced by a minimum delay while requests to different hosts proceed
//! independently. A server-mandated `Retry-After` pushes the next allowed
//! request time for that host forward.
//!
//! ```
//! use std::time::Duration;
//! use harvester_core::RateLimiter;
//!
//! # async fn example() {
//! let limiter = RateLimiter::new(Duration::from_millis(500));
//! limiter.acquire("https://acme.example/support").await; // immediate
//! limiter.acquire("https://acme.example/m1.pdf").await; // waits ~500ms
//! limiter.acquire("https://other.example/").await; // immediate
//! # }
//! ```

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::{debug, instrument, warn};

/// Maximum honoured Retry-After value.
const MAX_RETRY_AFTER: Duration = Duration::from_secs(3600);

/// Per-host request spacing.
///
/// Shared behind `Arc` between the traversal engine and the ingestion
/// workers of a run. The `DashMap` entry is cloned out before awaiting so no
/// shard lock is held across a sleep.
#[derive(Debug)]
pub struct RateLimiter {
    delay: Duration,
    hosts: DashMap<String, Arc<Mutex<HostSlot>>>,
}

#[derive(Debug, Default)]
struct HostSlot {
    /// Earliest instant the next request to this host may start.
    next_allowed: Option<Instant>,
}

impl RateLimiter {
    /// Creates a limiter spacing same-host requests by `delay`.
    #[must_use]
    pub fn new(delay: Duration) -> Self {
        Self {
            delay,
            hosts: DashMap::new(),
        }
    }

    /// Creates a limiter that never waits (except for Retry-After).
    #[must_use]
    pub fn disabled() -> Self {
        Self::new(Duration::ZERO)
    }

    /// Returns the configured same-host delay.
    #[must_use]
    pub fn delay(&self) -> Duration {
        self.delay
    }

    fn slot(&self, host: &str) -> Arc<Mutex<HostSlot>> {
        self.hosts
            .entry(host.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(HostSlot::default())))
            .clone()
    }

    /// Waits until a request to `url`'s host is allowed, then reserves the slot.
    #[instrument(level = "debug", skip(self), fields(host))]
    pub async fn acquire(&self, url: &str) {
        let host = extract_host(url);
        tracing::Span::current().record("host", host.as_str());

        let slot = self.slot(&host);
        let mut guard = slot.lock().await;

        if let Some(next_allowed) = guard.next_allowed {
            let now = Instant::now();
            if next_allowed > now {
                let wait = next_allowed - now;
                debug!(host = %host, wait_ms = wait.as_millis(), "politeness delay");
                tokio::time::sleep(wait).await;
            }
        }

        guard.next_allowed = Some(Instant::now() + self.delay);
    }

    /// Defers the next request to `url`'s host by a server-mandated delay.
    pub async fn record_retry_after(&self, url: &str, delay: Duration) {
        let host = extract_host(url);
        let slot = self.slot(&host);
        let mut guard = slot.lock().await;
        let candidate = Instant::now() + delay;
        if guard.next_allowed.is_none_or(|current| candidate > current) {
            guard.next_allowed = Some(candidate);
        }
        debug!(host = %host, delay_ms = delay.as_millis(), "recorded server rate limit");
    }
}

/// Returns the lowercase host of `url`, or `"unknown"` when it has none.
#[must_use]
pub fn extract_host(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_lowercase))
        .unwrap_or_else(|| "unknown".to_string())
}

/// Parses a Retry-After header (integer seconds or HTTP-date).
///
/// Values above one hour are capped; dates in the past yield zero.
#[must_use]
pub fn parse_retry_after(header_value: &str) -> Option<Duration> {
    let header_value = header_value.trim();

    if let Ok(seconds) = header_value.parse::<i64>() {
        let seconds = u64::try_from(seconds).ok()?;
        let duration = Duration::from_secs(seconds);
        if duration > MAX_RETRY_AFTER {
            warn!(seconds, "Retry-After exceeds one hour, capping");
            return Some(MAX_RETRY_AFTER);
        }
        return Some(duration);
    }

    let when = httpdate::parse_http_date(header_value).ok()?;
    Some(
        when.duration_since(std::time::SystemTime::now())
            .map_or(Duration::ZERO, |d| d.min(MAX_RETRY_AFTER)),
    )
}

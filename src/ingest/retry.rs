//! Backoff policy for artifact downloads.
//!
//! A failed download is classified into a [`FailureType`], and the
//! [`RetryPolicy`] turns that plus the attempt number into a
//! [`RetryDecision`].
//!
//! ```
//! use harvester_core::ingest::{DownloadError, RetryDecision, RetryPolicy, classify_error};
//!
//! let policy = RetryPolicy::default();
//! let error = DownloadError::http_status("https://acme.example/m1.pdf", 503, None);
//! match policy.should_retry(classify_error(&error), 1) {
//!     RetryDecision::Retry { delay, attempt } => println!("attempt {attempt} in {delay:?}"),
//!     RetryDecision::DoNotRetry { reason } => println!("giving up: {reason}"),
//! }
//! ```

use std::time::Duration;

use rand::Rng;
use tracing::{debug, instrument};

use super::DownloadError;

/// Default attempt cap, counting the first attempt.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

const DEFAULT_BASE_DELAY: Duration = Duration::from_secs(1);
const DEFAULT_MAX_DELAY: Duration = Duration::from_secs(32);
const DEFAULT_BACKOFF_MULTIPLIER: f32 = 2.0;

/// Upper bound on jitter; smaller base delays get proportionally less.
const MAX_JITTER: Duration = Duration::from_millis(500);

/// How a failed download should be treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureType {
    /// Timeouts, dropped connections, 5xx responses.
    Transient,
    /// 404, 410, malformed URLs, oversized bodies. Retrying cannot help.
    Permanent,
    /// The vendor refused the crawler (401, 403, 451).
    Blocked,
    /// HTTP 429. Retried, honouring `Retry-After` when present.
    RateLimited,
}

/// Outcome of [`RetryPolicy::should_retry`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryDecision {
    /// Try again after `delay`.
    Retry {
        /// Backoff before the next attempt.
        delay: Duration,
        /// Number of the upcoming attempt (the first retry is attempt 2).
        attempt: u32,
    },
    /// Give up.
    DoNotRetry {
        /// Why no further attempt is made.
        reason: String,
    },
}

/// Exponential backoff with jitter and an attempt cap.
///
/// `delay(n) = min(base * multiplier^(n-1), max) + jitter` for the retry
/// after failed attempt `n`. Defaults: 3 attempts, 1s base, 32s cap,
/// doubling.
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_attempts: u32,
    base_delay: Duration,
    max_delay: Duration,
    backoff_multiplier: f32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            base_delay: DEFAULT_BASE_DELAY,
            max_delay: DEFAULT_MAX_DELAY,
            backoff_multiplier: DEFAULT_BACKOFF_MULTIPLIER,
        }
    }
}

impl RetryPolicy {
    /// Creates a policy; `max_attempts` is clamped to at least 1.
    #[must_use]
    pub fn new(
        max_attempts: u32,
        base_delay: Duration,
        max_delay: Duration,
        backoff_multiplier: f32,
    ) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
            backoff_multiplier,
        }
    }

    /// Default backoff with a custom attempt cap.
    #[must_use]
    pub fn with_max_attempts(max_attempts: u32) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            ..Self::default()
        }
    }

    /// Attempt cap, counting the first attempt.
    #[must_use]
    pub fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    /// Decides whether attempt number `attempt` (1-indexed) should be followed
    /// by another.
    #[instrument(level = "debug", skip(self), fields(max_attempts = self.max_attempts))]
    pub fn should_retry(&self, failure_type: FailureType, attempt: u32) -> RetryDecision {
        match failure_type {
            FailureType::Permanent => {
                return RetryDecision::DoNotRetry {
                    reason: "permanent failure".to_string(),
                };
            }
            FailureType::Blocked => {
                return RetryDecision::DoNotRetry {
                    reason: "vendor refused the request".to_string(),
                };
            }
            FailureType::Transient | FailureType::RateLimited => {}
        }

        if attempt >= self.max_attempts {
            debug!(attempt, "attempt cap reached");
            return RetryDecision::DoNotRetry {
                reason: format!("max attempts ({}) exhausted", self.max_attempts),
            };
        }

        let delay = self.backoff(attempt);
        debug!(attempt, delay_ms = delay.as_millis(), "scheduling retry");
        RetryDecision::Retry {
            delay,
            attempt: attempt + 1,
        }
    }

    #[allow(
        clippy::cast_possible_truncation,
        clippy::cast_sign_loss,
        clippy::cast_precision_loss
    )]
    fn backoff(&self, attempt: u32) -> Duration {
        let exponent = i32::try_from(attempt.saturating_sub(1)).unwrap_or(i32::MAX);
        let raw_ms =
            self.base_delay.as_millis() as f64 * f64::from(self.backoff_multiplier).powi(exponent);
        let capped_ms = raw_ms.min(self.max_delay.as_millis() as f64);
        Duration::from_millis(capped_ms as u64) + self.jitter()
    }

    fn jitter(&self) -> Duration {
        let cap = MAX_JITTER.min(self.base_delay / 2);
        let cap_ms = u64::try_from(cap.as_millis()).unwrap_or(u64::MAX);
        if cap_ms == 0 {
            return Duration::ZERO;
        }
        Duration::from_millis(rand::thread_rng().gen_range(0..=cap_ms))
    }
}

/// Classifies a download error for [`RetryPolicy::should_retry`].
///
/// | Error | Type |
/// |-------|------|
/// | 408, 5xx | Transient |
/// | 429 | RateLimited |
/// | 401, 403, 451 | Blocked |
/// | other 4xx | Permanent |
/// | timeout | Transient |
/// | network, except TLS | Transient |
/// | TLS, invalid URL, too large | Permanent |
#[must_use]
pub fn classify_error(error: &DownloadError) -> FailureType {
    match error {
        DownloadError::HttpStatus { status, .. } => classify_http_status(*status),
        DownloadError::Timeout { .. } => FailureType::Transient,
        DownloadError::Network { source, .. } => {
            if is_tls_error(source) {
                FailureType::Permanent
            } else {
                FailureType::Transient
            }
        }
        DownloadError::InvalidUrl { .. } | DownloadError::TooLarge { .. } => {
            FailureType::Permanent
        }
    }
}

#[allow(clippy::match_same_arms)]
fn classify_http_status(status: u16) -> FailureType {
    match status {
        401 | 403 | 451 => FailureType::Blocked,
        408 => FailureType::Transient,
        429 => FailureType::RateLimited,
        400..=499 => FailureType::Permanent,
        500..=599 => FailureType::Transient,
        _ => FailureType::Permanent,
    }
}

fn is_tls_error(error: &reqwest::Error) -> bool {
    let text = error.to_string().to_lowercase();
    ["certificate", "tls", "ssl", "handshake"]
        .iter()
        .any(|needle| text.contains(needle))
}

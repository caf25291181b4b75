// =============================================================================
// Circuit Breaker — per-endpoint failure tracking with exponential backoff
// =============================================================================
//
// After `threshold` consecutive failures the breaker opens and the endpoint
// is skipped for a cool-down that doubles with each further failure, capped
// at `max_backoff`. Any success closes the breaker immediately.
//
// Counters are atomics so any task may consult the breaker lock-free.
// =============================================================================

use std::sync::atomic::{AtomicI64, AtomicU32, Ordering};

use tracing::{debug, warn};

/// Consecutive failures before the breaker opens.
const DEFAULT_THRESHOLD: u32 = 3;
/// First cool-down once open, in seconds.
const DEFAULT_BASE_BACKOFF_SECS: i64 = 5;
/// Cool-down ceiling, in seconds.
const DEFAULT_MAX_BACKOFF_SECS: i64 = 300;

pub struct CircuitBreaker {
    name: &'static str,
    consecutive_failures: AtomicU32,
    /// Unix time until which the breaker stays open; 0 = closed.
    open_until: AtomicI64,
    threshold: u32,
    base_backoff_secs: i64,
    max_backoff_secs: i64,
}

impl CircuitBreaker {
    pub fn new(name: &'static str) -> Self {
        Self::with_limits(
            name,
            DEFAULT_THRESHOLD,
            DEFAULT_BASE_BACKOFF_SECS,
            DEFAULT_MAX_BACKOFF_SECS,
        )
    }

    pub fn with_limits(
        name: &'static str,
        threshold: u32,
        base_backoff_secs: i64,
        max_backoff_secs: i64,
    ) -> Self {
        Self {
            name,
            consecutive_failures: AtomicU32::new(0),
            open_until: AtomicI64::new(0),
            threshold,
            base_backoff_secs,
            max_backoff_secs,
        }
    }

    /// `true` if a call may be attempted at `now_unix`.
    pub fn allows(&self, now_unix: i64) -> bool {
        let until = self.open_until.load(Ordering::Relaxed);
        if until == 0 || now_unix >= until {
            return true;
        }
        debug!(
            endpoint = self.name,
            reopen_in_secs = until - now_unix,
            "call skipped — circuit open"
        );
        false
    }

    /// Record a successful call; closes the breaker.
    pub fn record_success(&self) {
        let prev = self.consecutive_failures.swap(0, Ordering::Relaxed);
        if prev >= self.threshold {
            debug!(endpoint = self.name, "circuit closed after success");
        }
        self.open_until.store(0, Ordering::Relaxed);
    }

    /// Record a transient failure at `now_unix`. Once the consecutive-failure
    /// count reaches the threshold, the breaker opens with a backoff that
    /// doubles per additional failure, capped at `max_backoff_secs`.
    pub fn record_failure(&self, now_unix: i64) {
        let failures = self.consecutive_failures.fetch_add(1, Ordering::Relaxed) + 1;
        if failures < self.threshold {
            return;
        }

        let exponent = (failures - self.threshold).min(16);
        let backoff = self
            .base_backoff_secs
            .saturating_mul(1_i64 << exponent)
            .min(self.max_backoff_secs);

        self.open_until.store(now_unix + backoff, Ordering::Relaxed);
        warn!(
            endpoint = self.name,
            consecutive_failures = failures,
            backoff_secs = backoff,
            "circuit opened"
        );
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CircuitBreaker")
            .field("name", &self.name)
            .field(
                "consecutive_failures",
                &self.consecutive_failures.load(Ordering::Relaxed),
            )
            .field("open_until", &self.open_until.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Rate-Limit Tracker — monitors futures API usage to avoid 429s
// =============================================================================
//
// The futures API enforces multiple rate limits:
//   - Request weight: 2400 per minute (we hard-cap ourselves at 2000).
//   - Order rate:     300 per 10 seconds.
//
// The tracker reads the `X-MBX-USED-WEIGHT-1M` response header after every
// request and keeps atomic counters that any task may query lock-free. When
// the hard cap is crossed the circuit opens; monitor loops check
// `circuit_open()` and skip their cycle rather than pile on requests.
// =============================================================================

use serde::{Deserialize, Serialize};
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};
use tracing::{debug, warn};

/// Hard ceiling at which we refuse to send additional requests.
const WEIGHT_HARD_LIMIT: u32 = 2000;
/// Soft warning threshold.
const WEIGHT_WARN_THRESHOLD: u32 = 1600;
/// Weight below which an open circuit closes again.
const WEIGHT_RECOVERY_THRESHOLD: u32 = 1200;

/// Maximum orders per 10-second window.
const ORDER_10S_LIMIT: u32 = 300;

/// Thread-safe rate-limit tracker backed by atomic counters.
pub struct RateLimitTracker {
    used_weight_1m: AtomicU32,
    order_count_10s: AtomicU32,
    circuit_open: AtomicBool,
}

/// Immutable snapshot of the current rate-limit state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitSnapshot {
    pub used_weight_1m: u32,
    pub order_count_10s: u32,
    pub circuit_open: bool,
}

impl RateLimitTracker {
    /// Create a new tracker with all counters at zero.
    pub fn new() -> Self {
        Self {
            used_weight_1m: AtomicU32::new(0),
            order_count_10s: AtomicU32::new(0),
            circuit_open: AtomicBool::new(false),
        }
    }

    // -------------------------------------------------------------------------
    // Header-based updates
    // -------------------------------------------------------------------------

    /// Update internal counters from the HTTP response headers.
    pub fn update_from_headers(&self, headers: &reqwest::header::HeaderMap) {
        if let Some(val) = headers.get("X-MBX-USED-WEIGHT-1M") {
            if let Ok(s) = val.to_str() {
                if let Ok(w) = s.parse::<u32>() {
                    let prev = self.used_weight_1m.swap(w, Ordering::Relaxed);
                    if w >= WEIGHT_HARD_LIMIT {
                        if !self.circuit_open.swap(true, Ordering::Relaxed) {
                            warn!(
                                used_weight = w,
                                hard_limit = WEIGHT_HARD_LIMIT,
                                "rate-limit circuit OPENED"
                            );
                        }
                    } else if w <= WEIGHT_RECOVERY_THRESHOLD
                        && self.circuit_open.swap(false, Ordering::Relaxed)
                    {
                        warn!(used_weight = w, "rate-limit circuit closed");
                    } else if w >= WEIGHT_WARN_THRESHOLD && prev < WEIGHT_WARN_THRESHOLD {
                        warn!(
                            used_weight = w,
                            hard_limit = WEIGHT_HARD_LIMIT,
                            "rate-limit weight crossed warning threshold"
                        );
                    }
                    debug!(used_weight_1m = w, "rate-limit weight updated from header");
                }
            }
        }

        if let Some(val) = headers.get("X-MBX-ORDER-COUNT-10S") {
            if let Ok(s) = val.to_str() {
                if let Ok(c) = s.parse::<u32>() {
                    self.order_count_10s.store(c, Ordering::Relaxed);
                }
            }
        }
    }

    // -------------------------------------------------------------------------
    // Pre-flight checks
    // -------------------------------------------------------------------------

    /// When true, non-critical loops should skip their current cycle.
    pub fn circuit_open(&self) -> bool {
        self.circuit_open.load(Ordering::Relaxed)
    }

    /// Return `true` if we can afford to spend `weight` more request weight.
    pub fn can_send_request(&self, weight: u32) -> bool {
        let current = self.used_weight_1m.load(Ordering::Relaxed);
        let allowed = current + weight <= WEIGHT_HARD_LIMIT;
        if !allowed {
            warn!(
                current_weight = current,
                requested_weight = weight,
                hard_limit = WEIGHT_HARD_LIMIT,
                "request blocked — would exceed rate-limit"
            );
        }
        allowed
    }

    /// Return `true` if we can place another order within the 10 s window.
    pub fn can_place_order(&self) -> bool {
        let count_10s = self.order_count_10s.load(Ordering::Relaxed);
        if count_10s >= ORDER_10S_LIMIT {
            warn!(
                count_10s,
                limit = ORDER_10S_LIMIT,
                "order blocked — 10 s order limit reached"
            );
            return false;
        }
        true
    }

    /// Manually increment the order counter (before the exchange responds
    /// with updated headers).
    pub fn record_order_sent(&self) {
        self.order_count_10s.fetch_add(1, Ordering::Relaxed);
    }

    // -------------------------------------------------------------------------
    // Snapshot
    // -------------------------------------------------------------------------

    /// Produce a serialisable snapshot of the current counters.
    pub fn snapshot(&self) -> RateLimitSnapshot {
        RateLimitSnapshot {
            used_weight_1m: self.used_weight_1m.load(Ordering::Relaxed),
            order_count_10s: self.order_count_10s.load(Ordering::Relaxed),
            circuit_open: self.circuit_open(),
        }
    }
}

impl Default for RateLimitTracker {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for RateLimitTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimitTracker")
            .field(
                "used_weight_1m",
                &self.used_weight_1m.load(Ordering::Relaxed),
            )
            .field(
                "order_count_10s",
                &self.order_count_10s.load(Ordering::Relaxed),
            )
            .field("circuit_open", &self.circuit_open())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::{HeaderMap, HeaderValue};

    fn headers_with_weight(w: u32) -> HeaderMap {
        let mut h = HeaderMap::new();
        h.insert(
            "X-MBX-USED-WEIGHT-1M",
            HeaderValue::from_str(&w.to_string()).unwrap(),
        );
        h
    }

    #[test]
    fn circuit_opens_at_hard_limit_and_recovers() {
        let t = RateLimitTracker::new();
        assert!(!t.circuit_open());

        t.update_from_headers(&headers_with_weight(2000));
        assert!(t.circuit_open());

        // Still above recovery — stays open.
        t.update_from_headers(&headers_with_weight(1500));
        assert!(t.circuit_open());

        t.update_from_headers(&headers_with_weight(1000));
        assert!(!t.circuit_open());
    }

    #[test]
    fn request_budget_enforced() {
        let t = RateLimitTracker::new();
        t.update_from_headers(&headers_with_weight(1990));
        assert!(t.can_send_request(10));
        assert!(!t.can_send_request(11));
    }

    #[test]
    fn order_window_enforced() {
        let t = RateLimitTracker::new();
        assert!(t.can_place_order());
        for _ in 0..ORDER_10S_LIMIT {
            t.record_order_sent();
        }
        assert!(!t.can_place_order());
    }
}

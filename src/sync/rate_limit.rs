//! Client-side request budget with server correction.
//!
//! The limiter tracks a per-window budget plus a minimum spacing between
//! requests. Server rate-limit headers overwrite the local estimate
//! whenever they are present.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;

use crate::clock::Clock;
use crate::config::RateLimitConfig;
use crate::state::SyncState;

/// Persisted limiter bookkeeping. All timestamps are epoch milliseconds.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitState {
    pub remaining: u32,
    pub window_reset_at: i64,
    pub last_request_at: i64,
    /// Total reservations ever made. Informational.
    pub request_count: u64,
}

/// Rate-limit values reported by the server alongside a response.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RateLimitHint {
    pub remaining: Option<u32>,
    /// Epoch milliseconds at which the server's window resets.
    pub reset_at: Option<i64>,
}

impl RateLimitHint {
    pub fn is_empty(&self) -> bool {
        self.remaining.is_none() && self.reset_at.is_none()
    }
}

enum Gate {
    Reserved(i64),
    Wait(i64),
}

pub struct RateLimiter {
    state: Arc<SyncState>,
    clock: Arc<dyn Clock>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(state: Arc<SyncState>, clock: Arc<dyn Clock>, config: RateLimitConfig) -> Self {
        Self {
            state,
            clock,
            config,
        }
    }

    fn window_ms(&self) -> i64 {
        i64::try_from(self.config.window_secs.saturating_mul(1000))
            .unwrap_or(i64::MAX)
            .max(1)
    }

    fn min_interval_ms(&self) -> i64 {
        i64::try_from(self.config.min_interval_ms).unwrap_or(i64::MAX)
    }

    /// Refill the budget once the window has passed.
    ///
    /// The reset time advances by whole windows so it always lands in the
    /// future; an idle gap never grants two budgets back to back.
    fn roll_window(&self, st: &mut RateLimitState, now: i64) {
        if now < st.window_reset_at {
            return;
        }
        let window = self.window_ms();
        st.window_reset_at = if st.window_reset_at <= 0 {
            now.saturating_add(window)
        } else {
            let periods = (now - st.window_reset_at) / window + 1;
            st.window_reset_at
                .saturating_add(periods.saturating_mul(window))
        };
        // A zero budget would never refill; treat it as one request per window.
        st.remaining = self.config.requests_per_window.max(1);
    }

    /// Wait until one more request may be issued, then reserve it.
    ///
    /// The slot is claimed before sleeping, so callers that interleave at
    /// await points each get their own properly spaced slot.
    pub async fn acquire(&self) {
        loop {
            let gate = {
                let mut st = self.state.rate_limit.lock().await;
                let now = self.clock.now_ms();
                self.roll_window(&mut st, now);

                if st.remaining == 0 {
                    let margin = i64::try_from(self.config.reset_margin_ms).unwrap_or(0);
                    Gate::Wait(st.window_reset_at.saturating_sub(now).saturating_add(margin))
                } else {
                    let slot = st
                        .last_request_at
                        .saturating_add(self.min_interval_ms())
                        .max(now);
                    if slot >= st.window_reset_at {
                        // The spaced slot falls in the next window; let it roll first.
                        Gate::Wait(slot - now)
                    } else {
                        st.remaining -= 1;
                        st.last_request_at = slot;
                        st.request_count = st.request_count.saturating_add(1);
                        Gate::Reserved(slot - now)
                    }
                }
            };

            match gate {
                Gate::Reserved(wait) => {
                    if wait > 0 {
                        tracing::trace!(wait_ms = wait, "Spacing request");
                        self.clock.sleep(to_duration(wait)).await;
                    }
                    return;
                }
                Gate::Wait(wait) => {
                    tracing::debug!(wait_ms = wait, "Request budget exhausted, waiting for window reset");
                    self.clock.sleep(to_duration(wait.max(1))).await;
                }
            }
        }
    }

    /// Apply server-reported values. Server truth always wins.
    pub async fn observe(&self, hint: RateLimitHint) {
        if hint.is_empty() {
            return;
        }
        let mut st = self.state.rate_limit.lock().await;
        if let Some(remaining) = hint.remaining {
            st.remaining = remaining;
        }
        if let Some(reset_at) = hint.reset_at {
            st.window_reset_at = reset_at;
        }
        tracing::trace!(
            remaining = st.remaining,
            reset_at = st.window_reset_at,
            "Rate limit corrected from server"
        );
    }

    /// Requests still available in the current window.
    pub async fn remaining(&self) -> u32 {
        let mut st = self.state.rate_limit.lock().await;
        self.roll_window(&mut st, self.clock.now_ms());
        st.remaining
    }

    pub async fn snapshot(&self) -> RateLimitState {
        self.state.rate_limit.lock().await.clone()
    }
}

fn to_duration(ms: i64) -> Duration {
    Duration::from_millis(u64::try_from(ms).unwrap_or(0))
}

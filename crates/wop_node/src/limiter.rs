//! Replay protection and per-peer rate limiting.
//!
//! The replay guard remembers recent nonces with their arrival times inside
//! a ±5-minute window. The rate limiter keeps two sliding windows (60 s and
//! 3 600 s) per `(sender, action)` and bans the pair once either window is
//! breached.

use std::collections::{HashMap, VecDeque};

use chrono::Utc;
use parking_lot::Mutex;
use tracing::debug;

/// Accepted timestamp skew and nonce retention window.
pub const REPLAY_WINDOW_MS: i64 = 5 * 60 * 1000;
/// Above this many retained nonces, entries older than the window are swept.
const REPLAY_HIGH_WATER: usize = 10_000;

const MINUTE_MS: i64 = 60 * 1000;
const HOUR_MS: i64 = 3_600 * 1000;

#[derive(Default)]
pub struct ReplayGuard {
    seen: Mutex<HashMap<String, i64>>,
}

impl ReplayGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// Accept each `(nonce, ts)` at most once while the timestamp is within
    /// the window. Returns false for stale, future-dated, or repeated nonces.
    pub fn check(&self, nonce: &str, ts: i64) -> bool {
        self.check_at(nonce, ts, Utc::now().timestamp_millis())
    }

    fn check_at(&self, nonce: &str, ts: i64, now: i64) -> bool {
        if (now - ts).abs() > REPLAY_WINDOW_MS {
            return false;
        }
        let mut seen = self.seen.lock();
        if seen.contains_key(nonce) {
            return false;
        }
        if seen.len() >= REPLAY_HIGH_WATER {
            seen.retain(|_, arrived| now - *arrived <= REPLAY_WINDOW_MS);
        }
        seen.insert(nonce.to_string(), now);
        true
    }
}

#[derive(Debug, Clone, Copy)]
pub struct ActionLimits {
    pub per_minute: usize,
    pub per_hour: usize,
    pub ban_ms: i64,
}

/// Defaults per action; unknown actions fall through to the `inject` row.
pub fn limits_for(action: &str) -> ActionLimits {
    match action {
        "claim" => ActionLimits { per_minute: 5, per_hour: 20, ban_ms: HOUR_MS },
        "invalid" => ActionLimits { per_minute: 3, per_hour: 10, ban_ms: 2 * HOUR_MS },
        _ => ActionLimits { per_minute: 10, per_hour: 100, ban_ms: HOUR_MS },
    }
}

#[derive(Default)]
struct PeerWindow {
    minute: VecDeque<i64>,
    hour: VecDeque<i64>,
    banned_until: Option<i64>,
}

#[derive(Default)]
pub struct RateLimiter {
    windows: Mutex<HashMap<(String, String), PeerWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record one attempt. Returns false while banned or when this attempt
    /// breaches a window (which also starts the ban).
    pub fn check(&self, sender: &str, action: &str) -> bool {
        self.check_at(sender, action, Utc::now().timestamp_millis())
    }

    fn check_at(&self, sender: &str, action: &str, now: i64) -> bool {
        let limits = limits_for(action);
        let mut windows = self.windows.lock();
        let window = windows
            .entry((sender.to_string(), action.to_string()))
            .or_default();

        if let Some(until) = window.banned_until {
            if now < until {
                return false;
            }
            window.banned_until = None;
        }

        while window.minute.front().is_some_and(|t| now - t >= MINUTE_MS) {
            window.minute.pop_front();
        }
        while window.hour.front().is_some_and(|t| now - t >= HOUR_MS) {
            window.hour.pop_front();
        }

        if window.minute.len() >= limits.per_minute || window.hour.len() >= limits.per_hour {
            window.banned_until = Some(now + limits.ban_ms);
            debug!(sender, action, "rate limit breached, peer banned");
            return false;
        }

        window.minute.push_back(now);
        window.hour.push_back(now);
        true
    }
}

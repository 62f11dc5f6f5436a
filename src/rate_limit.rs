//! Per-identity message rate limiting
//!
//! Each network identity may send `message_limit` messages. The send that
//! reaches the limit starts a cooldown; until it has passed every further send
//! is rejected with the time left. Once the cooldown has passed the window is
//! discarded and the next send opens a fresh one.
//!
//! A window that never reaches the limit expires `cooldown` after it opened.
//!
//! Windows live in a [`KeyValueStore`] under `chat-limit-<identity>` so they
//! survive restarts. The read-modify-write is not atomic across processes
//! sharing one store: concurrent writers are last-write-wins.

use crate::storage::KeyValueStore;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

pub const DEFAULT_MESSAGE_LIMIT: u32 = 10;
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(60 * 60);

const KEY_PREFIX: &str = "chat-limit-";

// =============================================================================
// Configuration
// =============================================================================

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Messages allowed per window
    pub message_limit: u32,
    /// Lockout once the limit is reached
    pub cooldown: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            message_limit: DEFAULT_MESSAGE_LIMIT,
            cooldown: DEFAULT_COOLDOWN,
        }
    }
}

impl RateLimitConfig {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_message_limit(mut self, limit: u32) -> Self {
        self.message_limit = limit;
        self
    }

    #[must_use]
    pub fn with_cooldown(mut self, cooldown: Duration) -> Self {
        self.cooldown = cooldown;
        self
    }

    fn cooldown_ms(&self) -> i64 {
        i64::try_from(self.cooldown.as_millis()).unwrap_or(i64::MAX)
    }
}

// =============================================================================
// State
// =============================================================================

/// Persisted counter for one identity. Timestamps are unix milliseconds.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateWindow {
    pub count: u32,
    #[serde(rename = "timestamp")]
    pub window_start: i64,
    /// Only meaningful once `count` has reached the limit.
    #[serde(rename = "cooldownEnd")]
    pub cooldown_until: i64,
}

impl RateWindow {
    fn open(now: i64) -> Self {
        Self {
            count: 0,
            window_start: now,
            cooldown_until: now,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { count: u32, remaining: u32 },
    Rejected { retry_after: Duration },
}

impl RateDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, RateDecision::Allowed { .. })
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RateStatus {
    Open { remaining: u32 },
    Saturated { retry_after: Duration },
}

/// Formats a cooldown as `m:ss`.
pub fn format_cooldown(remaining: Duration) -> String {
    let total = remaining.as_secs();
    format!("{}:{:02}", total / 60, total % 60)
}

// =============================================================================
// Limiter
// =============================================================================

pub struct RateLimiter {
    store: Arc<dyn KeyValueStore>,
    identity: String,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        identity: impl Into<String>,
        config: RateLimitConfig,
    ) -> Self {
        Self {
            store,
            identity: identity.into(),
            config,
        }
    }

    pub fn identity(&self) -> &str {
        &self.identity
    }

    pub fn config(&self) -> &RateLimitConfig {
        &self.config
    }

    pub fn storage_key(&self) -> String {
        format!("{KEY_PREFIX}{}", self.identity)
    }

    /// Decides whether a message may be sent at `now` and, if so, counts it.
    pub fn check_and_record(&self, now: i64) -> RateDecision {
        let limit = self.config.message_limit;
        let mut window = self.active_window(now).unwrap_or_else(|| RateWindow::open(now));

        if window.count >= limit {
            let retry_after = millis_until(window.cooldown_until, now);
            info!(
                identity = %self.identity,
                retry_after_ms = retry_after.as_millis() as u64,
                "message limit reached"
            );
            return RateDecision::Rejected { retry_after };
        }

        window.count += 1;
        if window.count >= limit {
            window.cooldown_until = now.saturating_add(self.config.cooldown_ms());
        }
        self.persist(&window);

        debug!(identity = %self.identity, count = window.count, "message counted");
        RateDecision::Allowed {
            count: window.count,
            remaining: limit - window.count,
        }
    }

    /// Current standing without counting a message. Expired windows are
    /// removed from storage as a side effect.
    pub fn status(&self, now: i64) -> RateStatus {
        let window = match self.load() {
            Some(window) if self.is_expired(&window, now) => {
                self.clear();
                None
            }
            other => other,
        };

        match window {
            Some(window) if window.count >= self.config.message_limit => RateStatus::Saturated {
                retry_after: millis_until(window.cooldown_until, now),
            },
            Some(window) => RateStatus::Open {
                remaining: self.config.message_limit - window.count,
            },
            None => RateStatus::Open {
                remaining: self.config.message_limit,
            },
        }
    }

    /// Forgets the stored window for this identity.
    pub fn clear(&self) {
        if let Err(err) = self.store.remove(&self.storage_key()) {
            warn!(%err, "failed to clear rate window");
        }
    }

    fn is_expired(&self, window: &RateWindow, now: i64) -> bool {
        if window.count >= self.config.message_limit {
            now >= window.cooldown_until
        } else {
            now.saturating_sub(window.window_start) >= self.config.cooldown_ms()
        }
    }

    fn active_window(&self, now: i64) -> Option<RateWindow> {
        self.load().filter(|window| !self.is_expired(window, now))
    }

    // storage failures fail open: the send is treated as the first in a new window
    fn load(&self) -> Option<RateWindow> {
        match self.store.get(&self.storage_key()) {
            Ok(Some(raw)) => match serde_json::from_str(&raw) {
                Ok(window) => Some(window),
                Err(err) => {
                    warn!(%err, "discarding unreadable rate window");
                    None
                }
            },
            Ok(None) => None,
            Err(err) => {
                warn!(%err, "rate window storage unavailable");
                None
            }
        }
    }

    fn persist(&self, window: &RateWindow) {
        let result = serde_json::to_string(window)
            .map_err(|err| err.to_string())
            .and_then(|raw| {
                self.store
                    .set(&self.storage_key(), &raw)
                    .map_err(|err| err.to_string())
            });
        if let Err(err) = result {
            warn!(%err, "failed to persist rate window");
        }
    }
}

fn millis_until(deadline: i64, now: i64) -> Duration {
    Duration::from_millis(deadline.saturating_sub(now).max(0) as u64)
}

//! Fixed-window request counting per caller key.

use dashmap::DashMap;
use std::time::{Duration, Instant};

/// Counting window for one caller
#[derive(Clone, Copy, Debug)]
struct ClientWindow {
    count: u32,
    reset_at: Instant,
}

/// Result of an admission check
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Decision {
    pub admitted: bool,
    /// Operations left in the current window (0 when rejected)
    pub remaining: u32,
    /// Time until the window resets (zero when admitted)
    pub retry_after: Duration,
}

/// Per-caller rate governor.
///
/// Keys are independent. The map is sharded, so an admission check only
/// locks the shard holding its own key, and only for the update of that one
/// entry. Windows that have elapsed linger until [`RateGovernor::evict_expired`]
/// runs.
#[derive(Debug)]
pub struct RateGovernor {
    limit: u32,
    window: Duration,
    windows: DashMap<String, ClientWindow>,
}

impl RateGovernor {
    /// `limit` is clamped to at least one operation per window.
    pub fn new(limit: u32, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            windows: DashMap::new(),
        }
    }

    /// Rate governor allowing `per_minute` operations per caller per minute
    pub fn per_minute(per_minute: u32) -> Self {
        Self::new(per_minute, Duration::from_secs(60))
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn allow(&self, key: &str) -> Decision {
        self.allow_at(key, Instant::now())
    }

    /// Admission check against an explicit clock reading.
    pub fn allow_at(&self, key: &str, now: Instant) -> Decision {
        let mut entry = self
            .windows
            .entry(key.to_string())
            .or_insert(ClientWindow {
                count: 0,
                reset_at: now,
            });
        let window = entry.value_mut();

        if now >= window.reset_at {
            window.count = 1;
            window.reset_at = now + self.window;
            return Decision {
                admitted: true,
                remaining: self.limit - 1,
                retry_after: Duration::ZERO,
            };
        }

        if window.count < self.limit {
            window.count += 1;
            return Decision {
                admitted: true,
                remaining: self.limit - window.count,
                retry_after: Duration::ZERO,
            };
        }

        Decision {
            admitted: false,
            remaining: 0,
            retry_after: window.reset_at.saturating_duration_since(now),
        }
    }

    /// Drop every window that has elapsed by `now`. Returns how many went.
    pub fn evict_expired(&self, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows.retain(|_, w| w.reset_at > now);
        before.saturating_sub(self.windows.len())
    }

    /// Number of tracked callers
    pub fn len(&self) -> usize {
        self.windows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.windows.is_empty()
    }
}

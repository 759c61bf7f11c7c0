//! Dual-control admission limiter: sliding window plus burst gate
//!
//! The sliding window bounds sustained throughput per key; the burst gate
//! stops short bursts (rapid repeated taps) from exhausting quota meant for
//! background refreshes. Window entries are pruned lazily on each check
//! rather than via a timer, avoiding background wake-ups on mobile.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

use crate::config::RateLimitConfig;

/// Per-key admission state, created lazily and never persisted
#[derive(Debug, Default)]
struct RateWindow {
    /// Admission times within the trailing window, oldest first
    timestamps: VecDeque<Instant>,
    burst_count: u32,
    /// Set when the burst counter reaches the limit; cleared after cooldown
    burst_window_start: Option<Instant>,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    windows: HashMap<String, RateWindow>,
    /// While the feed is disconnected, admission is suspended entirely;
    /// callers fall back to queueing
    paused: bool,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
            paused: false,
        }
    }

    /// Whether a request for `key` would be admitted right now
    ///
    /// Never errors; denied callers decide themselves whether to queue or
    /// drop.
    pub fn try_admit(&mut self, key: &str) -> bool {
        self.try_admit_at(key, Instant::now())
    }

    /// Record that an admitted request for `key` was actually issued
    pub fn record_admission(&mut self, key: &str) {
        self.record_admission_at(key, Instant::now());
    }

    /// Time until the next request for `key` could be admitted
    pub fn time_until_reset(&mut self, key: &str) -> Duration {
        self.time_until_reset_at(key, Instant::now())
    }

    /// Suspend or resume admission, driven by connection state
    pub fn set_paused(&mut self, paused: bool) {
        self.paused = paused;
    }

    fn try_admit_at(&mut self, key: &str, now: Instant) -> bool {
        if self.paused {
            return false;
        }
        let window = Duration::from_secs(self.config.window_secs);
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        let entry = self.windows.entry(key.to_string()).or_default();

        prune(entry, now, window);

        if entry.timestamps.len() as u32 >= self.config.max_requests {
            return false;
        }

        if entry.burst_count >= self.config.burst_limit {
            match entry.burst_window_start {
                Some(reached_at) if now.duration_since(reached_at) < cooldown => return false,
                _ => {
                    // Cooldown elapsed since the burst limit was reached
                    entry.burst_count = 0;
                    entry.burst_window_start = None;
                }
            }
        }

        true
    }

    fn record_admission_at(&mut self, key: &str, now: Instant) {
        let entry = self.windows.entry(key.to_string()).or_default();
        entry.timestamps.push_back(now);
        entry.burst_count += 1;
        if entry.burst_count >= self.config.burst_limit && entry.burst_window_start.is_none() {
            entry.burst_window_start = Some(now);
        }
    }

    fn time_until_reset_at(&mut self, key: &str, now: Instant) -> Duration {
        let window = Duration::from_secs(self.config.window_secs);
        let cooldown = Duration::from_secs(self.config.cooldown_secs);
        let Some(entry) = self.windows.get_mut(key) else {
            return Duration::ZERO;
        };

        prune(entry, now, window);

        let mut wait = Duration::ZERO;
        if entry.timestamps.len() as u32 >= self.config.max_requests {
            if let Some(&oldest) = entry.timestamps.front() {
                wait = wait.max(window.saturating_sub(now.duration_since(oldest)));
            }
        }
        if entry.burst_count >= self.config.burst_limit {
            if let Some(reached_at) = entry.burst_window_start {
                wait = wait.max(cooldown.saturating_sub(now.duration_since(reached_at)));
            }
        }
        wait
    }
}

fn prune(entry: &mut RateWindow, now: Instant, window: Duration) {
    while let Some(&oldest) = entry.timestamps.front() {
        if now.duration_since(oldest) >= window {
            entry.timestamps.pop_front();
        } else {
            break;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(max_requests: u32, window_secs: u64, burst_limit: u32, cooldown_secs: u64) -> RateLimiter {
        RateLimiter::new(RateLimitConfig {
            max_requests,
            window_secs,
            burst_limit,
            cooldown_secs,
        })
    }

    #[test]
    fn sliding_window_admits_up_to_limit() {
        // burst limit high enough to stay out of the way
        let mut limiter = limiter(5, 60, 100, 10);
        let start = Instant::now();

        for i in 0..5 {
            let at = start + Duration::from_secs(i);
            assert!(limiter.try_admit_at("search", at), "admission {i} denied");
            limiter.record_admission_at("search", at);
        }

        // 6th within the same window is denied
        assert!(!limiter.try_admit_at("search", start + Duration::from_secs(10)));

        // 60s after the first admission, quota frees up again
        assert!(limiter.try_admit_at("search", start + Duration::from_secs(60)));
    }

    #[test]
    fn burst_gate_closes_until_cooldown() {
        let mut limiter = limiter(100, 60, 3, 10);
        let start = Instant::now();

        for i in 0..3 {
            let at = start + Duration::from_millis(i * 100);
            assert!(limiter.try_admit_at("trade", at));
            limiter.record_admission_at("trade", at);
        }

        // burst limit reached: denied until cooldown elapses
        assert!(!limiter.try_admit_at("trade", start + Duration::from_secs(1)));
        assert!(!limiter.try_admit_at("trade", start + Duration::from_secs(9)));

        // cooldown counted from the moment the limit was reached
        let reached_at = start + Duration::from_millis(200);
        assert!(limiter.try_admit_at("trade", reached_at + Duration::from_secs(10)));
    }

    #[test]
    fn keys_are_independent() {
        let mut limiter = limiter(1, 60, 100, 10);
        let now = Instant::now();

        assert!(limiter.try_admit_at("a", now));
        limiter.record_admission_at("a", now);
        assert!(!limiter.try_admit_at("a", now));
        assert!(limiter.try_admit_at("b", now));
    }

    #[test]
    fn time_until_reset_reports_window_wait() {
        let mut limiter = limiter(2, 60, 100, 10);
        let start = Instant::now();

        limiter.record_admission_at("k", start);
        limiter.record_admission_at("k", start + Duration::from_secs(5));

        let wait = limiter.time_until_reset_at("k", start + Duration::from_secs(20));
        assert_eq!(wait, Duration::from_secs(40));

        // after the oldest entry ages out there is nothing to wait for
        let wait = limiter.time_until_reset_at("k", start + Duration::from_secs(61));
        assert_eq!(wait, Duration::ZERO);
    }

    #[test]
    fn paused_limiter_denies_everything() {
        let mut limiter = limiter(100, 60, 100, 10);
        limiter.set_paused(true);
        assert!(!limiter.try_admit("k"));
        limiter.set_paused(false);
        assert!(limiter.try_admit("k"));
    }
}

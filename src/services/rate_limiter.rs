//! Per-channel, per-recipient admission control.
//!
//! Fixed window counters keyed by `(channel, key)`. Rules are per channel and
//! can be replaced at runtime. All entry mutations happen under one mutex so
//! concurrent `allow` calls for the same key are serialized.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;

use crate::db::models::Channel;
use crate::error::{AppError, AppResult};

/// Window limit for one channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct RateLimitRule {
    pub max_requests: u32,
    #[serde(with = "duration_secs")]
    pub window_size: Duration,
    /// Extra requests admitted during the first quarter of a window when
    /// burst is enabled.
    pub burst_limit: u32,
}

impl RateLimitRule {
    pub fn per_minute(max_requests: u32, burst_limit: u32) -> Self {
        Self {
            max_requests,
            window_size: Duration::from_secs(60),
            burst_limit,
        }
    }

    /// Defaults tuned to each provider's published limits.
    pub fn default_for(channel: Channel) -> Self {
        match channel {
            Channel::Telegram => Self::per_minute(30, 5),
            Channel::Email => Self::per_minute(10, 3),
            Channel::Slack => Self::per_minute(50, 10),
            Channel::Webhook => Self::per_minute(100, 20),
        }
    }

    /// Used for channels whose rule was removed.
    pub fn fallback() -> Self {
        Self::per_minute(10, 0)
    }

    fn validate(&self) -> AppResult<()> {
        if self.max_requests == 0 {
            return Err(AppError::InvalidRateLimitRule(
                "max requests must be greater than zero".into(),
            ));
        }
        if self.window_size.is_zero() {
            return Err(AppError::InvalidRateLimitRule(
                "window size must be greater than zero".into(),
            ));
        }
        Ok(())
    }

    fn window(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.window_size).unwrap_or(chrono::TimeDelta::MAX)
    }
}

#[derive(Debug, Clone)]
struct RateLimitEntry {
    count: u32,
    window_start: DateTime<Utc>,
    last_request: DateTime<Utc>,
}

impl RateLimitEntry {
    fn expired(&self, rule: &RateLimitRule, now: DateTime<Utc>) -> bool {
        self.window_start
            .checked_add_signed(rule.window())
            .map_or(false, |end| now > end)
    }
}

/// Snapshot reported by [`RateLimiter::get_stats`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RateLimitStats {
    pub channel: Channel,
    pub max_requests: u32,
    #[serde(with = "duration_secs")]
    pub window_size: Duration,
    pub burst_limit: u32,
    pub active_entries: usize,
}

pub struct RateLimiter {
    rules: RwLock<HashMap<Channel, RateLimitRule>>,
    entries: Mutex<HashMap<(Channel, String), RateLimitEntry>>,
    burst_enabled: bool,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

impl RateLimiter {
    /// Limiter preloaded with the per-channel default rules, burst disabled.
    pub fn new() -> Self {
        let rules = Channel::ALL
            .iter()
            .map(|c| (*c, RateLimitRule::default_for(*c)))
            .collect();
        Self {
            rules: RwLock::new(rules),
            entries: Mutex::new(HashMap::new()),
            burst_enabled: false,
        }
    }

    pub fn with_burst(mut self, enabled: bool) -> Self {
        self.burst_enabled = enabled;
        self
    }

    pub fn allow(&self, key: &str, channel: Channel) -> bool {
        self.allow_at(key, channel, Utc::now())
    }

    pub fn allow_at(&self, key: &str, channel: Channel, now: DateTime<Utc>) -> bool {
        let rule = self.get_rule(channel);
        let mut entries = self.entries.lock();
        let entry = entries
            .entry((channel, key.to_string()))
            .or_insert_with(|| RateLimitEntry {
                count: 0,
                window_start: now,
                last_request: now,
            });

        if entry.expired(&rule, now) {
            entry.count = 0;
            entry.window_start = now;
        }

        if entry.count < self.limit_for(&rule, entry.window_start, now) {
            entry.count += 1;
            entry.last_request = now;
            true
        } else {
            tracing::debug!("Rate limit hit for {}:{} ({} in window)", channel, key, entry.count);
            false
        }
    }

    pub fn get_remaining_requests(&self, key: &str, channel: Channel) -> u32 {
        self.get_remaining_requests_at(key, channel, Utc::now())
    }

    pub fn get_remaining_requests_at(&self, key: &str, channel: Channel, now: DateTime<Utc>) -> u32 {
        let rule = self.get_rule(channel);
        let entries = self.entries.lock();
        match entries.get(&(channel, key.to_string())) {
            Some(entry) if !entry.expired(&rule, now) => self
                .limit_for(&rule, entry.window_start, now)
                .saturating_sub(entry.count),
            _ => rule.max_requests,
        }
    }

    /// When the current window for `key` ends. Without an entry this is one
    /// full window from now.
    pub fn get_reset_time(&self, key: &str, channel: Channel) -> DateTime<Utc> {
        let rule = self.get_rule(channel);
        let now = Utc::now();
        let entries = self.entries.lock();
        let start = entries
            .get(&(channel, key.to_string()))
            .map_or(now, |entry| entry.window_start);
        start
            .checked_add_signed(rule.window())
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn set_rule(&self, channel: Channel, rule: RateLimitRule) -> AppResult<()> {
        rule.validate()?;
        self.rules.write().insert(channel, rule);
        tracing::info!(
            "Rate limit for {} set to {} per {:?} (burst {})",
            channel,
            rule.max_requests,
            rule.window_size,
            rule.burst_limit
        );
        Ok(())
    }

    pub fn get_rule(&self, channel: Channel) -> RateLimitRule {
        self.rules
            .read()
            .get(&channel)
            .copied()
            .unwrap_or_else(RateLimitRule::fallback)
    }

    pub fn remove_rule(&self, channel: Channel) {
        self.rules.write().remove(&channel);
    }

    /// Forget the counter for one key.
    pub fn reset(&self, key: &str, channel: Channel) {
        self.entries.lock().remove(&(channel, key.to_string()));
    }

    pub fn get_stats(&self, channel: Channel) -> RateLimitStats {
        let rule = self.get_rule(channel);
        let active_entries = self
            .entries
            .lock()
            .keys()
            .filter(|(c, _)| *c == channel)
            .count();
        RateLimitStats {
            channel,
            max_requests: rule.max_requests,
            window_size: rule.window_size,
            burst_limit: rule.burst_limit,
            active_entries,
        }
    }

    /// Drop entries whose window has elapsed. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        self.purge_expired_at(Utc::now())
    }

    pub fn purge_expired_at(&self, now: DateTime<Utc>) -> usize {
        let rules = self.rules.read().clone();
        let mut entries = self.entries.lock();
        let before = entries.len();
        entries.retain(|(channel, _), entry| {
            let rule = rules
                .get(channel)
                .copied()
                .unwrap_or_else(RateLimitRule::fallback);
            !entry.expired(&rule, now)
        });
        before - entries.len()
    }

    fn limit_for(&self, rule: &RateLimitRule, window_start: DateTime<Utc>, now: DateTime<Utc>) -> u32 {
        if self.burst_enabled && rule.burst_limit > 0 && now - window_start < rule.window() / 4 {
            rule.max_requests + rule.burst_limit
        } else {
            rule.max_requests
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::Serializer;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }
}

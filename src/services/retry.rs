//! Retry policy: backoff computation and retry eligibility per channel.

use std::collections::HashMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use uuid::Uuid;

use crate::db::models::{Channel, RetryConfigurationRow};
use crate::error::{AppError, AppResult};
use crate::services::channels::ChannelError;

const MAX_RETRY_ATTEMPTS_LIMIT: i32 = 10;

/// Error texts that mark a failure as permanent.
const NON_RETRYABLE_PHRASES: [&str; 6] = [
    "invalid recipient",
    "invalid message",
    "invalid chat id",
    "forbidden",
    "unauthorized",
    "not found",
];

/// Fallback classification for errors that carry only text.
pub fn is_retryable_error_text(text: &str) -> bool {
    let lower = text.to_lowercase();
    !NON_RETRYABLE_PHRASES.iter().any(|p| lower.contains(p))
}

/// Tunable values of a retry policy, validated as a unit.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RetrySettings {
    pub max_retry_attempts: i32,
    pub initial_retry_delay: Duration,
    pub max_retry_delay: Duration,
    pub retry_delay_multiplier: f64,
    /// Total time a notification may keep retrying. Zero means unbounded.
    pub retry_timeout: Duration,
    pub enable_exponential_backoff: bool,
    pub enable_dead_letter_queue: bool,
}

impl RetrySettings {
    fn validate(&self) -> AppResult<()> {
        if !(0..=MAX_RETRY_ATTEMPTS_LIMIT).contains(&self.max_retry_attempts) {
            return Err(AppError::InvalidRetryConfiguration(
                "max retry attempts must be between 0 and 10".into(),
            ));
        }
        if self.max_retry_delay < self.initial_retry_delay {
            return Err(AppError::InvalidRetryConfiguration(
                "max retry delay must be greater than or equal to initial delay".into(),
            ));
        }
        if !self.retry_delay_multiplier.is_finite() || self.retry_delay_multiplier < 1.0 {
            return Err(AppError::InvalidRetryConfiguration(
                "retry delay multiplier must be at least 1.0".into(),
            ));
        }
        Ok(())
    }

    fn exponential(max_attempts: i32, initial: Duration, max: Duration, multiplier: f64) -> Self {
        Self {
            max_retry_attempts: max_attempts,
            initial_retry_delay: initial,
            max_retry_delay: max,
            retry_delay_multiplier: multiplier,
            retry_timeout: Duration::ZERO,
            enable_exponential_backoff: true,
            enable_dead_letter_queue: true,
        }
    }
}

/// Retry policy for the whole installation (`channel == None`) or one channel.
#[derive(Debug, Clone, Serialize)]
pub struct RetryConfiguration {
    id: String,
    channel: Option<Channel>,
    settings: RetrySettings,
    is_active: bool,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl RetryConfiguration {
    pub fn new(channel: Option<Channel>, settings: RetrySettings) -> AppResult<Self> {
        settings.validate()?;
        let now = Utc::now();
        Ok(Self {
            id: Uuid::new_v4().to_string(),
            channel,
            settings,
            is_active: true,
            created_at: now,
            updated_at: now,
        })
    }

    /// Installation default: 3 attempts, 30s doubling up to 5m, 30m window.
    pub fn installation_default() -> Self {
        let settings = RetrySettings {
            retry_timeout: Duration::from_secs(30 * 60),
            ..RetrySettings::exponential(
                3,
                Duration::from_secs(30),
                Duration::from_secs(5 * 60),
                2.0,
            )
        };
        Self::from_valid(None, settings)
    }

    pub fn default_for_channel(channel: Channel) -> Self {
        let settings = match channel {
            Channel::Telegram | Channel::Slack => RetrySettings::exponential(
                3,
                Duration::from_secs(30),
                Duration::from_secs(5 * 60),
                2.0,
            ),
            Channel::Email => RetrySettings::exponential(
                5,
                Duration::from_secs(60),
                Duration::from_secs(10 * 60),
                1.5,
            ),
            Channel::Webhook => RetrySettings::exponential(
                3,
                Duration::from_secs(15),
                Duration::from_secs(2 * 60),
                2.0,
            ),
        };
        Self::from_valid(Some(channel), settings)
    }

    fn from_valid(channel: Option<Channel>, settings: RetrySettings) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4().to_string(),
            channel,
            settings,
            is_active: true,
            created_at: now,
            updated_at: now,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn channel(&self) -> Option<Channel> {
        self.channel
    }

    pub fn settings(&self) -> &RetrySettings {
        &self.settings
    }

    pub fn max_retry_attempts(&self) -> i32 {
        self.settings.max_retry_attempts
    }

    pub fn initial_retry_delay(&self) -> Duration {
        self.settings.initial_retry_delay
    }

    pub fn max_retry_delay(&self) -> Duration {
        self.settings.max_retry_delay
    }

    pub fn retry_delay_multiplier(&self) -> f64 {
        self.settings.retry_delay_multiplier
    }

    pub fn retry_timeout(&self) -> Duration {
        self.settings.retry_timeout
    }

    pub fn enable_exponential_backoff(&self) -> bool {
        self.settings.enable_exponential_backoff
    }

    pub fn enable_dead_letter_queue(&self) -> bool {
        self.settings.enable_dead_letter_queue
    }

    pub fn is_active(&self) -> bool {
        self.is_active
    }

    pub fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    pub fn updated_at(&self) -> DateTime<Utc> {
        self.updated_at
    }

    /// Delay before retry number `attempt` (1-based; 0 is treated as 1).
    pub fn calculate_retry_delay(&self, attempt: i32) -> Duration {
        let s = &self.settings;
        if !s.enable_exponential_backoff {
            return s.initial_retry_delay;
        }

        let exponent = attempt.max(1) - 1;
        let nanos = s.initial_retry_delay.as_nanos() as f64 * s.retry_delay_multiplier.powi(exponent);
        if !nanos.is_finite() || nanos >= s.max_retry_delay.as_nanos() as f64 {
            return s.max_retry_delay;
        }
        Duration::from_nanos(nanos as u64)
    }

    pub fn should_retry(&self, attempt_count: i32, last_error: &ChannelError) -> bool {
        if !self.is_active || attempt_count >= self.settings.max_retry_attempts {
            return false;
        }
        last_error.is_retryable()
    }

    /// Whether a notification first enqueued at `first_enqueued_at` may still
    /// be retried at `now`.
    pub fn retry_window_open(&self, first_enqueued_at: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        let timeout = self.settings.retry_timeout;
        if timeout.is_zero() {
            return true;
        }
        match chrono::Duration::from_std(timeout) {
            Ok(window) => now < first_enqueued_at + window,
            Err(_) => true,
        }
    }

    pub fn update_configuration(&mut self, settings: RetrySettings) -> AppResult<()> {
        settings.validate()?;
        self.settings = settings;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn activate(&mut self) -> AppResult<()> {
        if self.is_active {
            return Err(AppError::RetryConfigurationAlreadyActive);
        }
        self.is_active = true;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn deactivate(&mut self) -> AppResult<()> {
        if !self.is_active {
            return Err(AppError::RetryConfigurationAlreadyInactive);
        }
        self.is_active = false;
        self.updated_at = Utc::now();
        Ok(())
    }

    pub fn to_row(&self) -> RetryConfigurationRow {
        let s = &self.settings;
        RetryConfigurationRow {
            id: self.id.clone(),
            channel: self.channel.map(String::from),
            max_retry_attempts: s.max_retry_attempts,
            initial_retry_delay_ms: duration_to_ms(s.initial_retry_delay),
            max_retry_delay_ms: duration_to_ms(s.max_retry_delay),
            retry_delay_multiplier: s.retry_delay_multiplier,
            retry_timeout_ms: duration_to_ms(s.retry_timeout),
            enable_exponential_backoff: s.enable_exponential_backoff,
            enable_dead_letter_queue: s.enable_dead_letter_queue,
            is_active: self.is_active,
            created_at: self.created_at,
            updated_at: self.updated_at,
        }
    }
}

fn duration_to_ms(d: Duration) -> i64 {
    i64::try_from(d.as_millis()).unwrap_or(i64::MAX)
}

fn ms_to_duration(ms: i64, what: &str) -> AppResult<Duration> {
    u64::try_from(ms)
        .map(Duration::from_millis)
        .map_err(|_| AppError::InvalidRetryConfiguration(format!("{} cannot be negative", what)))
}

impl TryFrom<RetryConfigurationRow> for RetryConfiguration {
    type Error = AppError;

    fn try_from(row: RetryConfigurationRow) -> AppResult<Self> {
        let channel = row
            .channel
            .as_deref()
            .map(Channel::try_from)
            .transpose()
            .map_err(AppError::InvalidRetryConfiguration)?;

        let settings = RetrySettings {
            max_retry_attempts: row.max_retry_attempts,
            initial_retry_delay: ms_to_duration(row.initial_retry_delay_ms, "initial retry delay")?,
            max_retry_delay: ms_to_duration(row.max_retry_delay_ms, "max retry delay")?,
            retry_delay_multiplier: row.retry_delay_multiplier,
            retry_timeout: ms_to_duration(row.retry_timeout_ms, "retry timeout duration")?,
            enable_exponential_backoff: row.enable_exponential_backoff,
            enable_dead_letter_queue: row.enable_dead_letter_queue,
        };
        settings.validate()?;

        Ok(Self {
            id: row.id,
            channel,
            settings,
            is_active: row.is_active,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

/// Per-channel retry policies with an installation-wide fallback.
pub struct RetryPolicies {
    by_channel: RwLock<HashMap<Channel, RetryConfiguration>>,
    default: RwLock<RetryConfiguration>,
}

impl Default for RetryPolicies {
    fn default() -> Self {
        Self::new()
    }
}

impl RetryPolicies {
    /// Registry preloaded with the built-in per-channel defaults.
    pub fn new() -> Self {
        let by_channel = Channel::ALL
            .iter()
            .map(|c| (*c, RetryConfiguration::default_for_channel(*c)))
            .collect();
        Self {
            by_channel: RwLock::new(by_channel),
            default: RwLock::new(RetryConfiguration::installation_default()),
        }
    }

    /// Build the registry from stored configurations. Stored rows override
    /// the built-in defaults; a row without a channel replaces the fallback.
    pub fn from_configurations(configs: impl IntoIterator<Item = RetryConfiguration>) -> Self {
        let policies = Self::new();
        for config in configs {
            policies.set(config);
        }
        policies
    }

    /// Policy applied to `channel`.
    pub fn for_channel(&self, channel: Channel) -> RetryConfiguration {
        self.by_channel
            .read()
            .get(&channel)
            .filter(|c| c.is_active())
            .cloned()
            .unwrap_or_else(|| self.default.read().clone())
    }

    pub fn set(&self, config: RetryConfiguration) {
        match config.channel() {
            Some(channel) => {
                self.by_channel.write().insert(channel, config);
            }
            None => *self.default.write() = config,
        }
    }

    /// Drop a channel override so the installation default applies.
    pub fn clear(&self, channel: Channel) {
        self.by_channel.write().remove(&channel);
    }

    pub fn default_policy(&self) -> RetryConfiguration {
        self.default.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn settings() -> RetrySettings {
        RetrySettings::exponential(3, Duration::from_secs(30), Duration::from_secs(300), 2.0)
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let config = RetryConfiguration::new(None, settings()).unwrap();
        assert_eq!(config.calculate_retry_delay(0), Duration::from_secs(30));
        assert_eq!(config.calculate_retry_delay(1), Duration::from_secs(30));
        assert_eq!(config.calculate_retry_delay(2), Duration::from_secs(60));
        assert_eq!(config.calculate_retry_delay(3), Duration::from_secs(120));
        assert_eq!(config.calculate_retry_delay(5), Duration::from_secs(300));
        assert_eq!(config.calculate_retry_delay(1000), Duration::from_secs(300));
    }

    #[test]
    fn backoff_is_monotonic_and_bounded() {
        let config = RetryConfiguration::default_for_channel(Channel::Email);
        let mut previous = Duration::ZERO;
        for attempt in 1..=12 {
            let delay = config.calculate_retry_delay(attempt);
            assert!(delay >= previous);
            assert!(delay <= config.max_retry_delay());
            previous = delay;
        }
        assert_eq!(config.calculate_retry_delay(2), Duration::from_secs(90));
    }

    #[test]
    fn disabled_backoff_uses_initial_delay() {
        let config = RetryConfiguration::new(
            None,
            RetrySettings {
                enable_exponential_backoff: false,
                ..settings()
            },
        )
        .unwrap();
        for attempt in 1..6 {
            assert_eq!(config.calculate_retry_delay(attempt), Duration::from_secs(30));
        }
    }

    #[test]
    fn validation_messages() {
        let err = RetryConfiguration::new(
            None,
            RetrySettings {
                max_retry_attempts: 11,
                ..settings()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("between 0 and 10"));

        let err = RetryConfiguration::new(
            None,
            RetrySettings {
                max_retry_delay: Duration::from_secs(10),
                ..settings()
            },
        )
        .unwrap_err();
        assert!(err.to_string().contains("greater than or equal to initial delay"));

        for multiplier in [0.5, f64::NAN, f64::INFINITY] {
            let err = RetryConfiguration::new(
                None,
                RetrySettings {
                    retry_delay_multiplier: multiplier,
                    ..settings()
                },
            )
            .unwrap_err();
            assert!(err.to_string().contains("at least 1.0"));
        }
    }

    #[test]
    fn should_retry_respects_attempts_and_error_kind() {
        let config = RetryConfiguration::new(None, settings()).unwrap();
        let transient = ChannelError::Transport("connection reset".into());
        assert!(config.should_retry(0, &transient));
        assert!(config.should_retry(2, &transient));
        assert!(!config.should_retry(3, &transient));
        assert!(!config.should_retry(7, &transient));

        for text in ["Unauthorized", "chat not found", "Invalid recipient", "FORBIDDEN"] {
            assert!(!config.should_retry(0, &ChannelError::Other(text.into())));
        }
        assert!(!config.should_retry(0, &ChannelError::InvalidRecipient("x".into())));
    }

    #[test]
    fn inactive_config_never_retries() {
        let mut config = RetryConfiguration::new(None, settings()).unwrap();
        config.deactivate().unwrap();
        assert!(!config.should_retry(0, &ChannelError::Transport("x".into())));
        assert!(matches!(
            config.deactivate(),
            Err(AppError::RetryConfigurationAlreadyInactive)
        ));
        config.activate().unwrap();
        assert!(matches!(
            config.activate(),
            Err(AppError::RetryConfigurationAlreadyActive)
        ));
    }

    #[test]
    fn update_revalidates() {
        let mut config = RetryConfiguration::new(None, settings()).unwrap();
        let bad = RetrySettings {
            max_retry_attempts: -1,
            ..settings()
        };
        assert!(config.update_configuration(bad).is_err());
        assert_eq!(config.max_retry_attempts(), 3);

        let good = RetrySettings {
            max_retry_attempts: 5,
            ..settings()
        };
        config.update_configuration(good).unwrap();
        assert_eq!(config.max_retry_attempts(), 5);
    }

    #[test]
    fn retry_window() {
        let start = Utc::now();
        let bounded = RetryConfiguration::installation_default();
        assert!(bounded.retry_window_open(start, start + chrono::Duration::minutes(29)));
        assert!(!bounded.retry_window_open(start, start + chrono::Duration::minutes(31)));

        let unbounded = RetryConfiguration::default_for_channel(Channel::Telegram);
        assert!(unbounded.retry_window_open(start, start + chrono::Duration::days(30)));
    }

    #[test]
    fn negative_stored_durations_are_rejected() {
        let mut row = RetryConfiguration::installation_default().to_row();
        row.initial_retry_delay_ms = -5;
        let err = RetryConfiguration::try_from(row).unwrap_err();
        assert!(err.to_string().contains("initial retry delay cannot be negative"));
    }

    #[test]
    fn policies_fall_back_to_default() {
        let policies = RetryPolicies::new();
        assert_eq!(policies.for_channel(Channel::Email).max_retry_attempts(), 5);

        policies.clear(Channel::Email);
        assert_eq!(policies.for_channel(Channel::Email).max_retry_attempts(), 3);
        assert!(policies.for_channel(Channel::Email).channel().is_none());

        let mut inactive = RetryConfiguration::default_for_channel(Channel::Webhook);
        inactive.deactivate().unwrap();
        policies.set(inactive);
        assert_eq!(
            policies.for_channel(Channel::Webhook).initial_retry_delay(),
            Duration::from_secs(30)
        );
    }
}

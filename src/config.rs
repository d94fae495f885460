use std::env;
use std::str::FromStr;
use std::time::Duration;

use serde::Deserialize;

use crate::services::channels::SmtpSettings;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub database: DatabaseConfig,
    pub delivery: DeliveryConfig,
    pub rate_limit: RateLimitConfig,
    pub telegram: TelegramConfig,
    pub email: EmailConfig,
    pub slack: SlackConfig,
    pub webhook: WebhookConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    pub url: String,
    pub max_connections: u32,
}

#[derive(Debug, Clone, Deserialize)]
pub struct DeliveryConfig {
    /// Whether the queue worker runs at all.
    pub enabled: bool,
    /// How often (seconds) the worker drains the queue.
    pub poll_interval_seconds: u64,
    /// Maximum notifications claimed per poll.
    pub batch_size: usize,
    /// Maximum parallel sends within one poll.
    pub concurrency: usize,
    /// Upper bound (seconds) for one channel send.
    pub send_timeout_seconds: u64,
    /// A claim older than this (seconds) is considered abandoned.
    pub processing_timeout_seconds: u64,
    /// Terminal notifications older than this (hours) are purged.
    pub retention_hours: u64,
    /// How often (seconds) the purge runs.
    pub cleanup_interval_seconds: u64,
}

impl DeliveryConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_seconds)
    }

    pub fn send_timeout(&self) -> Duration {
        Duration::from_secs(self.send_timeout_seconds)
    }

    pub fn processing_timeout(&self) -> Duration {
        Duration::from_secs(self.processing_timeout_seconds)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_seconds)
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    /// Admit `max + burst` requests during the first quarter of each window.
    pub burst_enabled: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TelegramConfig {
    pub bot_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct EmailConfig {
    pub smtp_host: Option<String>,
    pub smtp_port: u16,
    pub smtp_username: Option<String>,
    pub smtp_password: Option<String>,
    pub from_address: Option<String>,
    pub from_name: String,
}

impl EmailConfig {
    /// SMTP settings when both a host and a sender address are configured.
    pub fn smtp_settings(&self) -> Option<SmtpSettings> {
        Some(SmtpSettings {
            host: self.smtp_host.clone()?,
            port: self.smtp_port,
            username: self.smtp_username.clone(),
            password: self.smtp_password.clone(),
            from_address: self.from_address.clone()?,
            from_name: self.from_name.clone(),
        })
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SlackConfig {
    pub enabled: bool,
    /// Used when a Slack notification has no webhook URL as recipient.
    pub default_webhook_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct WebhookConfig {
    pub enabled: bool,
    pub signing_secret: Option<String>,
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" => Some(true),
        "0" | "false" | "no" => Some(false),
        _ => None,
    }
}

fn env_bool(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .and_then(|v| parse_bool(&v))
        .unwrap_or(default)
}

fn env_or<T: FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

fn env_non_empty(key: &str) -> Option<String> {
    env::var(key).ok().filter(|v| !v.trim().is_empty())
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        dotenvy::dotenv().ok();

        let defaults = Config::default();

        let config = Config {
            server: ServerConfig {
                host: env::var("HOST").unwrap_or_else(|_| defaults.server.host.clone()),
                port: env::var("PORT")
                    .unwrap_or_else(|_| defaults.server.port.to_string())
                    .parse()
                    .map_err(|_| ConfigError::InvalidValue("PORT".to_string()))?,
            },
            database: DatabaseConfig {
                url: env::var("DATABASE_URL").unwrap_or_else(|_| defaults.database.url.clone()),
                max_connections: env_or(
                    "DATABASE_MAX_CONNECTIONS",
                    defaults.database.max_connections,
                ),
            },
            delivery: DeliveryConfig {
                enabled: env_bool("DELIVERY_ENABLED", defaults.delivery.enabled),
                poll_interval_seconds: env_or(
                    "DELIVERY_POLL_INTERVAL_SECONDS",
                    defaults.delivery.poll_interval_seconds,
                ),
                batch_size: env_or("DELIVERY_BATCH_SIZE", defaults.delivery.batch_size),
                concurrency: env_or("DELIVERY_CONCURRENCY", defaults.delivery.concurrency),
                send_timeout_seconds: env_or(
                    "DELIVERY_SEND_TIMEOUT_SECONDS",
                    defaults.delivery.send_timeout_seconds,
                ),
                processing_timeout_seconds: env_or(
                    "DELIVERY_PROCESSING_TIMEOUT_SECONDS",
                    defaults.delivery.processing_timeout_seconds,
                ),
                retention_hours: env_or(
                    "DELIVERY_RETENTION_HOURS",
                    defaults.delivery.retention_hours,
                ),
                cleanup_interval_seconds: env_or(
                    "DELIVERY_CLEANUP_INTERVAL_SECONDS",
                    defaults.delivery.cleanup_interval_seconds,
                ),
            },
            rate_limit: RateLimitConfig {
                burst_enabled: env_bool(
                    "RATE_LIMIT_BURST_ENABLED",
                    defaults.rate_limit.burst_enabled,
                ),
            },
            telegram: TelegramConfig {
                bot_token: env_non_empty("TELEGRAM_BOT_TOKEN"),
            },
            email: EmailConfig {
                smtp_host: env_non_empty("SMTP_HOST"),
                smtp_port: env::var("SMTP_PORT")
                    .map(|v| {
                        v.parse()
                            .map_err(|_| ConfigError::InvalidValue("SMTP_PORT".to_string()))
                    })
                    .unwrap_or(Ok(defaults.email.smtp_port))?,
                smtp_username: env_non_empty("SMTP_USERNAME"),
                smtp_password: env_non_empty("SMTP_PASSWORD"),
                from_address: env_non_empty("SMTP_FROM_ADDRESS"),
                from_name: env::var("SMTP_FROM_NAME")
                    .unwrap_or_else(|_| defaults.email.from_name.clone()),
            },
            slack: SlackConfig {
                enabled: env_bool("SLACK_ENABLED", defaults.slack.enabled),
                default_webhook_url: env_non_empty("SLACK_WEBHOOK_URL"),
            },
            webhook: WebhookConfig {
                enabled: env_bool("WEBHOOK_ENABLED", defaults.webhook.enabled),
                signing_secret: env_non_empty("WEBHOOK_SIGNING_SECRET"),
            },
        };

        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.delivery.batch_size == 0 {
            return Err(ConfigError::InvalidValue("DELIVERY_BATCH_SIZE".to_string()));
        }
        if self.delivery.concurrency == 0 {
            return Err(ConfigError::InvalidValue("DELIVERY_CONCURRENCY".to_string()));
        }
        if self.delivery.poll_interval_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "DELIVERY_POLL_INTERVAL_SECONDS".to_string(),
            ));
        }
        if self.delivery.send_timeout_seconds == 0 {
            return Err(ConfigError::InvalidValue(
                "DELIVERY_SEND_TIMEOUT_SECONDS".to_string(),
            ));
        }
        // A claim must outlive the longest send, or another drain reclaims
        // the item mid-send.
        if self.delivery.processing_timeout_seconds <= self.delivery.send_timeout_seconds {
            return Err(ConfigError::InvalidValue(
                "DELIVERY_PROCESSING_TIMEOUT_SECONDS".to_string(),
            ));
        }
        if self.email.smtp_host.is_some() && self.email.from_address.is_none() {
            return Err(ConfigError::MissingEnv("SMTP_FROM_ADDRESS".to_string()));
        }
        Ok(())
    }
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing required environment variable: {0}")]
    MissingEnv(String),

    #[error("Invalid value for environment variable: {0}")]
    InvalidValue(String),
}

impl Default for Config {
    fn default() -> Self {
        Config {
            server: ServerConfig {
                host: "0.0.0.0".to_string(),
                port: 8080,
            },
            database: DatabaseConfig {
                url: "sqlite://data/notifier.db".to_string(),
                max_connections: 5,
            },
            delivery: DeliveryConfig {
                enabled: true,
                poll_interval_seconds: 5,
                batch_size: 50,
                concurrency: 10,
                send_timeout_seconds: 30,
                processing_timeout_seconds: 300,
                retention_hours: 24 * 7,
                cleanup_interval_seconds: 3600,
            },
            rate_limit: RateLimitConfig {
                burst_enabled: false,
            },
            telegram: TelegramConfig { bot_token: None },
            email: EmailConfig {
                smtp_host: None,
                smtp_port: 587,
                smtp_username: None,
                smtp_password: None,
                from_address: None,
                from_name: "CI/CD Notifier".to_string(),
            },
            slack: SlackConfig {
                enabled: true,
                default_webhook_url: None,
            },
            webhook: WebhookConfig {
                enabled: true,
                signing_secret: None,
            },
        }
    }
}

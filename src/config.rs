// src/config.rs

use std::collections::HashSet;
use std::env;
use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("{0} must be set")]
    Missing(&'static str),

    #[error("{name} has an invalid value: {value}")]
    Invalid { name: &'static str, value: String },
}

/// Runtime settings, read once at startup from the environment.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub bind_addr: String,
    pub webhook_secret: String,
    pub token_secret: String,
    pub token_issuer: String,
    pub token_audience: String,
    pub service_api_key: String,
    pub idempotency_ttl: Duration,
    pub retry: RetrySettings,
    pub call_timeout: Duration,
    /// `None` means every purchased product grants access.
    pub access_product_ids: Option<HashSet<String>>,
    pub mail: Option<MailSettings>,
    pub rabbitmq_url: Option<String>,
}

#[derive(Debug, Clone, Copy)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub base_delay: Duration,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
        }
    }
}

#[derive(Debug, Clone)]
pub struct MailSettings {
    pub api_url: String,
    pub api_key: String,
    pub from: String,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let access_product_ids = env::var("ACCESS_PRODUCT_IDS").ok().and_then(|raw| {
            let ids: HashSet<String> = raw
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
            (!ids.is_empty()).then_some(ids)
        });

        let mail = match env::var("MAIL_API_URL").ok().filter(|v| !v.is_empty()) {
            Some(api_url) => Some(MailSettings {
                api_url,
                api_key: required("MAIL_API_KEY")?,
                from: env::var("MAIL_FROM")
                    .unwrap_or_else(|_| "Access Desk <no-reply@example.com>".to_string()),
            }),
            None => None,
        };

        Ok(Self {
            database_url: required("DATABASE_URL")?,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8065".to_string()),
            webhook_secret: required("WEBHOOK_SECRET")?,
            token_secret: required("TOKEN_SECRET")?,
            token_issuer: env::var("TOKEN_ISSUER")
                .unwrap_or_else(|_| "access-fulfillment".to_string()),
            token_audience: env::var("TOKEN_AUDIENCE")
                .unwrap_or_else(|_| "gated-experience".to_string()),
            service_api_key: required("SERVICE_API_KEY")?,
            idempotency_ttl: Duration::from_secs(parsed("IDEMPOTENCY_TTL_SECS", 86_400)?),
            retry: RetrySettings {
                max_attempts: parsed("RETRY_MAX_ATTEMPTS", 3)?,
                base_delay: Duration::from_millis(parsed("RETRY_BASE_DELAY_MS", 500)?),
            },
            call_timeout: Duration::from_millis(parsed("CALL_TIMEOUT_MS", 5_000)?),
            access_product_ids,
            mail,
            rabbitmq_url: env::var("RABBITMQ_URL").ok().filter(|v| !v.is_empty()),
        })
    }
}

fn required(name: &'static str) -> Result<String, ConfigError> {
    match env::var(name) {
        Ok(v) if !v.trim().is_empty() => Ok(v),
        _ => Err(ConfigError::Missing(name)),
    }
}

fn parsed<T: std::str::FromStr>(name: &'static str, default: T) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse::<T>()
            .map_err(|_| ConfigError::Invalid { name, value: raw }),
        Err(_) => Ok(default),
    }
}

//! Environment configuration.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::constants::*;
use crate::moderation::classify::{DEFAULT_API_BASE, DEFAULT_MODEL, GeminiSettings};
use crate::moderation::compress::DEFAULT_QUALITY;
use crate::moderation::{ModerationSettings, RetryPolicy};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} not found in environment variables.")]
    Missing(&'static str),
}

#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub db_max_connections: u32,
    pub gemini: GeminiSettings,
    pub cdn_base_url: String,
    pub batch_size: i64,
    pub concurrency: usize,
    pub fetch_timeout: Duration,
    pub classify_backoff: Duration,
    pub compression_quality: u8,
    pub port: u16,
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup. Blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let api_key = get("GEMINI_API_KEY").ok_or(ConfigError::Missing("GEMINI_API_KEY"))?;

        let gemini = GeminiSettings {
            api_key,
            model: get("GEMINI_MODEL").unwrap_or_else(|| DEFAULT_MODEL.to_string()),
            api_base: get("GEMINI_API_BASE").unwrap_or_else(|| DEFAULT_API_BASE.to_string()),
            timeout: Duration::from_secs(positive(
                &get,
                "CLASSIFY_TIMEOUT_SECS",
                DEFAULT_CLASSIFY_TIMEOUT_SECS,
            )),
        };

        Ok(Self {
            database_url: get("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            db_max_connections: positive(&get, "DB_MAX_CONNECTIONS", DEFAULT_DB_MAX_CONNECTIONS),
            gemini,
            cdn_base_url: get("CDN_BASE_URL")
                .map(|v| v.trim_end_matches('/').to_string())
                .unwrap_or_else(|| DEFAULT_CDN_BASE_URL.to_string()),
            batch_size: positive(&get, "LIMIT", DEFAULT_BATCH_SIZE),
            concurrency: positive(&get, "REVIEW_CONCURRENCY", DEFAULT_REVIEW_CONCURRENCY),
            fetch_timeout: Duration::from_secs(positive(
                &get,
                "FETCH_TIMEOUT_SECS",
                DEFAULT_FETCH_TIMEOUT_SECS,
            )),
            classify_backoff: Duration::from_millis(
                get("CLASSIFY_BACKOFF_MS")
                    .and_then(|s| s.parse().ok())
                    .unwrap_or(DEFAULT_CLASSIFY_BACKOFF_MS),
            ),
            compression_quality: get("COMPRESSION_QUALITY")
                .and_then(|s| s.parse().ok())
                .filter(|v: &u8| (1..=100).contains(v))
                .unwrap_or(DEFAULT_QUALITY),
            port: positive(&get, "PORT", DEFAULT_PORT),
        })
    }

    pub fn moderation_settings(&self) -> ModerationSettings {
        ModerationSettings {
            compression_quality: self.compression_quality,
            compression: RetryPolicy::immediate(2),
            classification: RetryPolicy::new(3, self.classify_backoff),
        }
    }
}

fn positive<T, G>(get: &G, key: &str, default: T) -> T
where
    T: FromStr + PartialOrd + Default,
    G: Fn(&str) -> Option<String>,
{
    get(key)
        .and_then(|s| s.parse().ok())
        .filter(|v| *v > T::default())
        .unwrap_or(default)
}

//! services/api/src/config.rs
//!
//! Defines the application's configuration structure and loading logic.
//!
//! All configuration is loaded from environment variables at startup. The `.env`
//! file is used for local development.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;
use story_reader_core::entitlement::{TierLimits, TierTable};
use story_reader_core::refresh::RefreshConfig;
use story_reader_core::session::{SessionConfig, MAX_ABANDONED_CAP_SECONDS};
use story_reader_core::tracker::TrackerConfig;
use tracing::Level;

/// A custom error type for configuration loading failures.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Missing the environment variable {0}")]
    MissingVar(String),
    #[error("Invalid value for the environment variable {0}: {1}")]
    InvalidValue(String, String),
}

/// Holds all configuration loaded from the environment at startup.
#[derive(Clone, Debug)]
pub struct Config {
    pub bind_address: SocketAddr,
    pub database_url: String,
    pub log_level: Level,
    pub tiers: TierTable,
    pub tracker: TrackerConfig,
    pub session: SessionConfig,
    pub refresh: RefreshConfig,
}

impl Config {
    /// Loads configuration from environment variables.
    ///
    /// It will look for a `.env` file in the current directory for development,
    /// but this is skipped in test environments to ensure tests are hermetic.
    pub fn from_env() -> Result<Self, ConfigError> {
        // Only load from .env in non-test mode to avoid contamination.
        if !cfg!(test) {
            dotenvy::dotenv().ok();
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from any key lookup.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        // --- Server and Database Settings ---
        let bind_address = parse_or(&lookup, "BIND_ADDRESS", "0.0.0.0:3000".parse::<SocketAddr>())?;

        let database_url =
            lookup("DATABASE_URL").ok_or_else(|| ConfigError::MissingVar("DATABASE_URL".to_string()))?;

        let log_level_str = lookup("RUST_LOG").unwrap_or_else(|| "INFO".to_string());
        let log_level = log_level_str.parse::<Level>().map_err(|_| {
            ConfigError::InvalidValue(
                "RUST_LOG".to_string(),
                format!("'{}' is not a valid log level", log_level_str),
            )
        })?;

        // --- Tier Limits ---
        let defaults = TierTable::default();
        let free_max_progress: f64 =
            parse_or(&lookup, "FREE_MAX_STORY_PROGRESS", Ok(defaults.free.max_story_progress))?;
        if !(0.0..=1.0).contains(&free_max_progress) {
            return Err(ConfigError::InvalidValue(
                "FREE_MAX_STORY_PROGRESS".to_string(),
                format!("{} is not a fraction between 0 and 1", free_max_progress),
            ));
        }
        let tiers = TierTable {
            free: TierLimits {
                daily_generations: parse_or(&lookup, "FREE_DAILY_GENERATIONS", Ok(0))?,
                lifetime_generations: Some(parse_or(&lookup, "FREE_LIFETIME_GENERATIONS", Ok(3))?),
                monthly_audio_seconds: Some(parse_or(&lookup, "FREE_MONTHLY_AUDIO_SECONDS", Ok(600))?),
                max_story_progress: free_max_progress,
            },
            premium: TierLimits {
                monthly_audio_seconds: Some(parse_or(
                    &lookup,
                    "PREMIUM_MONTHLY_AUDIO_SECONDS",
                    Ok(36_000),
                )?),
                ..defaults.premium
            },
        };

        // --- Engine Timings ---
        let tracker = TrackerConfig {
            correction_delay: millis(&lookup, "SCROLL_CORRECTION_DELAY_MS", 150)?,
            restore_delay: millis(&lookup, "RESTORE_SETTLE_DELAY_MS", 300)?,
            ..TrackerConfig::default()
        };
        let abandoned_cap_seconds: i64 =
            parse_or(&lookup, "ABANDONED_SESSION_CAP_SECONDS", Ok(3600))?;
        if !(0..=MAX_ABANDONED_CAP_SECONDS).contains(&abandoned_cap_seconds) {
            return Err(ConfigError::InvalidValue(
                "ABANDONED_SESSION_CAP_SECONDS".to_string(),
                format!(
                    "{} is not between 0 and {} seconds",
                    abandoned_cap_seconds, MAX_ABANDONED_CAP_SECONDS
                ),
            ));
        }
        let session = SessionConfig {
            min_completed_seconds: parse_or(&lookup, "SESSION_MIN_COMPLETED_SECONDS", Ok(30))?,
            abandoned_cap_seconds,
        };
        let refresh = RefreshConfig {
            min_interval: millis(&lookup, "REFRESH_MIN_INTERVAL_MS", 5000)?,
            settle_delay: millis(&lookup, "REFRESH_SETTLE_MS", 500)?,
        };

        Ok(Self {
            bind_address,
            database_url,
            log_level,
            tiers,
            tracker,
            session,
            refresh,
        })
    }
}

fn parse_or<F, T>(lookup: &F, key: &str, default: Result<T, T::Err>) -> Result<T, ConfigError>
where
    F: Fn(&str) -> Option<String>,
    T: FromStr,
    T::Err: std::fmt::Display,
{
    let parsed = match lookup(key) {
        Some(raw) => raw.trim().parse::<T>(),
        None => default,
    };
    parsed.map_err(|e| ConfigError::InvalidValue(key.to_string(), e.to_string()))
}

fn millis<F>(lookup: &F, key: &str, default: u64) -> Result<Duration, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    parse_or(lookup, key, Ok(default)).map(Duration::from_millis)
}

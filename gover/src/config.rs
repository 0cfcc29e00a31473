//! Process configuration from the environment.
//!
//! `.env` is loaded first when present. Runtime tunables for the queue, the
//! consumer and feature flags live in the database, not here.

use std::path::PathBuf;

use crate::logging::{DEFAULT_LOG_FILTER, LogFormat, LoggingSettings};
use crate::{Error, Result};

pub const DEFAULT_DATABASE_URL: &str = "sqlite:gover.db?mode=rwc";

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub database_url: String,
    pub logging: LoggingSettings,
    /// Persisted bilibili cookie for the message-stream provider.
    pub cookie_file: Option<PathBuf>,
    /// Keyword rules for the built-in dispatcher.
    pub danmaku_rules: Option<PathBuf>,
}

impl AppConfig {
    /// Load `.env` (if any) and read the process environment.
    pub fn from_env() -> Result<Self> {
        if let Err(e) = dotenvy::dotenv()
            && !e.not_found()
        {
            return Err(Error::config(format!("failed to load .env: {e}")));
        }
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary variable lookup.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let format = match var("GOVER_LOG_FORMAT") {
            Some(raw) => raw
                .parse::<LogFormat>()
                .map_err(|_| Error::config(format!("GOVER_LOG_FORMAT must be pretty or json, got {raw}")))?,
            None => LogFormat::default(),
        };

        Ok(Self {
            database_url: var("DATABASE_URL").unwrap_or_else(|| DEFAULT_DATABASE_URL.to_string()),
            logging: LoggingSettings {
                filter: var("GOVER_LOG").unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string()),
                format,
                log_dir: var("GOVER_LOG_DIR").map(PathBuf::from),
            },
            cookie_file: var("GOVER_COOKIE_FILE").map(PathBuf::from),
            danmaku_rules: var("GOVER_DANMAKU_RULES").map(PathBuf::from),
        })
    }
}

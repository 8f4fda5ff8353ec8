use std::env;
use std::net::SocketAddr;

use thiserror::Error;

const DEFAULT_BIND_ADDR: &str = "127.0.0.1:8890";
const DEFAULT_LOG_FILTER: &str = "info";
const DEFAULT_BATCH_LIMIT: usize = 50;
const DEFAULT_SYNC_ORIGIN_HEADER: &str = "x-funil-sync-origin";

#[derive(Debug, Clone)]
pub struct Config {
    pub bind_addr: SocketAddr,
    pub log_filter: String,
    /// Base URL of the managed database's REST surface.
    pub database_url: String,
    /// Service-role key. Doubles as the legacy exact-match bearer credential.
    pub service_key: String,
    /// Shared secret for trusted server-to-server invocations (cron).
    pub internal_secret: Option<String>,
    /// Header name stamped on card writes so the outbound-sync trigger can
    /// skip integration-origin updates. Empty disables loop prevention.
    pub sync_origin_header: Option<String>,
    /// Events fetched per invocation.
    pub batch_limit: usize,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable {0}")]
    MissingVar(&'static str),
    #[error("invalid FUNIL_BIND_ADDR value '{value}': {source}")]
    InvalidBindAddr {
        value: String,
        source: std::net::AddrParseError,
    },
    #[error("invalid FUNIL_BATCH_LIMIT value '{0}'")]
    InvalidBatchLimit(String),
}

impl Config {
    pub fn from_env() -> Result<Self, ConfigError> {
        let bind_addr_raw = env::var("FUNIL_BIND_ADDR")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_BIND_ADDR.to_string());
        let bind_addr = bind_addr_raw
            .parse()
            .map_err(|source| ConfigError::InvalidBindAddr {
                value: bind_addr_raw,
                source,
            })?;

        let log_filter = env::var("FUNIL_LOG_FILTER")
            .ok()
            .filter(|value| !value.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_LOG_FILTER.to_string());

        let database_url = env::var("FUNIL_DATABASE_URL")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingVar("FUNIL_DATABASE_URL"))?;

        let service_key = env::var("FUNIL_SERVICE_KEY")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty())
            .ok_or(ConfigError::MissingVar("FUNIL_SERVICE_KEY"))?;

        let internal_secret = env::var("FUNIL_INTERNAL_SECRET")
            .ok()
            .map(|value| value.trim().to_string())
            .filter(|value| !value.is_empty());

        // Set but empty means "explicitly disabled".
        let sync_origin_header = match env::var("FUNIL_SYNC_ORIGIN_HEADER") {
            Ok(value) => Some(value.trim().to_string()).filter(|value| !value.is_empty()),
            Err(_) => Some(DEFAULT_SYNC_ORIGIN_HEADER.to_string()),
        };

        let batch_limit = match env::var("FUNIL_BATCH_LIMIT") {
            Ok(raw) => raw
                .trim()
                .parse::<usize>()
                .ok()
                .filter(|limit| *limit > 0)
                .ok_or(ConfigError::InvalidBatchLimit(raw))?,
            Err(_) => DEFAULT_BATCH_LIMIT,
        };

        Ok(Self {
            bind_addr,
            log_filter,
            database_url,
            service_key,
            internal_secret,
            sync_origin_header,
            batch_limit,
        })
    }

    #[cfg(test)]
    pub fn for_tests() -> Self {
        Self {
            bind_addr: SocketAddr::from(([127, 0, 0, 1], 0)),
            log_filter: DEFAULT_LOG_FILTER.to_string(),
            database_url: "http://localhost:54321".to_string(),
            service_key: "test-service-key".to_string(),
            internal_secret: Some("test-internal-secret".to_string()),
            sync_origin_header: Some(DEFAULT_SYNC_ORIGIN_HEADER.to_string()),
            batch_limit: DEFAULT_BATCH_LIMIT,
        }
    }
}

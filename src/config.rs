//! Configuration module for squadstats.
//!
//! Loads configuration from environment variables with sensible defaults.

use std::env;
use std::time::Duration;

/// Runtime configuration loaded from environment variables.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
    /// Path to the SQLite database file (default: "squadstats.db")
    pub db_path: String,
    /// Timeout for every remote request (default: 120s)
    pub request_timeout: Duration,
    /// User-Agent sent to stats sites
    pub user_agent: String,
    /// Sortie import period in watch mode (default: 1h)
    pub import_interval: Duration,
    /// Online roster period in watch mode (default: 5m)
    pub online_interval: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            db_path: "squadstats.db".to_string(),
            request_timeout: Duration::from_secs(120),
            user_agent: concat!("squadstats/", env!("CARGO_PKG_VERSION")).to_string(),
            import_interval: Duration::from_secs(3600),
            online_interval: Duration::from_secs(300),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// Environment variables:
    /// - `SQUADSTATS_DB_PATH`: Database file path (default: "squadstats.db")
    /// - `SQUADSTATS_REQUEST_TIMEOUT`: seconds (default: 120)
    /// - `SQUADSTATS_USER_AGENT`: User-Agent header (default: "squadstats/<version>")
    /// - `SQUADSTATS_IMPORT_INTERVAL`: seconds (default: 3600)
    /// - `SQUADSTATS_ONLINE_INTERVAL`: seconds (default: 300)
    pub fn load() -> Self {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut cfg = Self::default();

        if let Some(db_path) = lookup("SQUADSTATS_DB_PATH").filter(|s| !s.trim().is_empty()) {
            cfg.db_path = db_path;
        }
        if let Some(agent) = lookup("SQUADSTATS_USER_AGENT").filter(|s| !s.trim().is_empty()) {
            cfg.user_agent = agent;
        }

        let seconds = |key: &str| {
            lookup(key)
                .and_then(|s| s.trim().parse::<u64>().ok())
                .filter(|&secs| secs > 0)
                .map(Duration::from_secs)
        };
        if let Some(timeout) = seconds("SQUADSTATS_REQUEST_TIMEOUT") {
            cfg.request_timeout = timeout;
        }
        if let Some(interval) = seconds("SQUADSTATS_IMPORT_INTERVAL") {
            cfg.import_interval = interval;
        }
        if let Some(interval) = seconds("SQUADSTATS_ONLINE_INTERVAL") {
            cfg.online_interval = interval;
        }

        cfg
    }
}

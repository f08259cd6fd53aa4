//! Runtime configuration of a sync context.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;

pub const DEFAULT_API_URL: &str = "http://localhost:82/api/v1";

/// Everything needed to build a foreground context or a background worker.
#[derive(Clone)]
pub struct SyncConfig {
    /// Base URL of the REST API, without trailing slash.
    pub api_url: String,
    /// Bearer token sent with every request.
    pub auth_token: Option<String>,
    /// SQLite database file shared by all contexts of the app.
    pub db_path: PathBuf,
    /// Upper bound for a single remote call.
    pub request_timeout: Duration,
    /// How long connectivity must hold before a reconnection drain is signalled.
    pub settle_delay: Duration,
    /// Safety-net tick of the background worker.
    pub poll_interval: Duration,
    /// Expiry of the drain lease; renewed before every operation.
    pub lease_ttl: Duration,
}

impl core::fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("SyncConfig")
            .field("api_url", &self.api_url)
            .field("auth_token", &self.auth_token.as_ref().map(|_| "<redacted>"))
            .field("db_path", &self.db_path)
            .field("request_timeout", &self.request_timeout)
            .field("settle_delay", &self.settle_delay)
            .field("poll_interval", &self.poll_interval)
            .field("lease_ttl", &self.lease_ttl)
            .finish()
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_API_URL.to_string(),
            auth_token: None,
            db_path: default_db_path().unwrap_or_else(|_| PathBuf::from("visitsync.db")),
            request_timeout: Duration::from_secs(10),
            settle_delay: Duration::from_secs(1),
            poll_interval: Duration::from_secs(30),
            lease_ttl: Duration::from_secs(60),
        }
    }
}

impl SyncConfig {
    /// Read configuration from `VISITSYNC_*` environment variables.
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build configuration from an arbitrary key lookup (environment, file, test map).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let mut config = Self::default();

        if let Some(url) = lookup("VISITSYNC_API_URL") {
            config.api_url = url.trim_end_matches('/').to_string();
        }
        config.auth_token = lookup("VISITSYNC_AUTH_TOKEN").filter(|t| !t.is_empty());

        config.db_path = match lookup("VISITSYNC_DB_PATH") {
            Some(path) => PathBuf::from(path),
            None => default_db_path()?,
        };

        if let Some(secs) = lookup("VISITSYNC_TIMEOUT_SECS") {
            let secs: u64 = secs
                .parse()
                .with_context(|| format!("VISITSYNC_TIMEOUT_SECS must be a number of seconds, got {secs:?}"))?;
            config.request_timeout = Duration::from_secs(secs);
        }

        Ok(config)
    }

    /// Configuration for tests and tools that bring their own database file.
    pub fn with_db_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.db_path = path.into();
        self
    }
}

/// `{data_dir}/visitsync/visitsync.db`
pub fn default_db_path() -> anyhow::Result<PathBuf> {
    let base = dirs::data_dir().context("could not resolve the user data directory")?;
    Ok(base.join("visitsync").join("visitsync.db"))
}

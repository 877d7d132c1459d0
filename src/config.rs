//! Engine configuration.
//!
//! Defaults match the production deployment: 5 s request timeout, 30 s
//! polling, 200 ms debounce and a 500 ms settle delay after writes. Values
//! can be overridden from `CARDAPIO_*` environment variables; the endpoint
//! and admin session fall back to the OS credential store.

use std::fmt;
use std::path::PathBuf;
use std::time::Duration;

use zeroize::Zeroizing;

use crate::credentials;
use crate::error::SyncError;
use crate::retry::RetryPolicy;

pub const ENV_ENDPOINT_URL: &str = "CARDAPIO_ENDPOINT_URL";
pub const ENV_DATA_DIR: &str = "CARDAPIO_DATA_DIR";
pub const ENV_SESSION_TOKEN: &str = "CARDAPIO_SESSION_TOKEN";
pub const ENV_POLL_INTERVAL_SECS: &str = "CARDAPIO_POLL_INTERVAL_SECS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "CARDAPIO_REQUEST_TIMEOUT_MS";

const DEFAULT_DATA_DIR: &str = ".cardapio";
const MIN_POLL_INTERVAL_SECS: u64 = 5;

#[derive(Clone)]
pub struct SyncConfig {
    /// Base URL of the menu server, normalised by [`normalize_endpoint_url`].
    pub endpoint_url: String,
    pub sync_path: String,
    pub logo_path: String,
    pub site_config_path: String,
    pub session_cookie: String,
    pub session_token: Option<Zeroizing<String>>,
    pub request_timeout: Duration,
    /// Per-request retries inside the remote store.
    pub fetch_retry: RetryPolicy,
    /// Whole-cycle retries inside the synced-data engine.
    pub refresh_retry: RetryPolicy,
    pub poll_interval: Duration,
    pub debounce: Duration,
    pub post_write_delay: Duration,
    pub data_dir: PathBuf,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            endpoint_url: String::new(),
            sync_path: "/api/sync".into(),
            logo_path: "/api/logo".into(),
            site_config_path: "/api/site-config".into(),
            session_cookie: "admin_session".into(),
            session_token: None,
            request_timeout: Duration::from_secs(5),
            fetch_retry: RetryPolicy::new(3, Duration::from_millis(300)),
            refresh_retry: RetryPolicy::new(2, Duration::from_secs(1)),
            poll_interval: Duration::from_secs(30),
            debounce: Duration::from_millis(200),
            post_write_delay: Duration::from_millis(500),
            data_dir: PathBuf::from(DEFAULT_DATA_DIR),
        }
    }
}

impl fmt::Debug for SyncConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncConfig")
            .field("endpoint_url", &self.endpoint_url)
            .field("sync_path", &self.sync_path)
            .field("logo_path", &self.logo_path)
            .field("site_config_path", &self.site_config_path)
            .field("session_cookie", &self.session_cookie)
            .field(
                "session_token",
                &self.session_token.as_ref().map(|_| "<redacted>"),
            )
            .field("request_timeout", &self.request_timeout)
            .field("fetch_retry", &self.fetch_retry)
            .field("refresh_retry", &self.refresh_retry)
            .field("poll_interval", &self.poll_interval)
            .field("debounce", &self.debounce)
            .field("post_write_delay", &self.post_write_delay)
            .field("data_dir", &self.data_dir)
            .finish()
    }
}

impl SyncConfig {
    pub fn new(endpoint_url: &str) -> Self {
        Self {
            endpoint_url: normalize_endpoint_url(endpoint_url),
            ..Self::default()
        }
    }

    /// Read configuration from the process environment, falling back to the
    /// credential store for the endpoint and session token.
    pub fn from_env() -> Result<Self, SyncError> {
        let mut config = Self::from_lookup(|key| std::env::var(key).ok())?;
        if config.endpoint_url.is_empty() {
            if let Some(url) = credentials::get_credential(credentials::KEY_ENDPOINT_URL) {
                config.endpoint_url = normalize_endpoint_url(&url);
            }
        }
        if config.session_token.is_none() {
            config.session_token = credentials::get_credential(credentials::KEY_SESSION_TOKEN);
        }
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from an arbitrary key lookup. Missing keys keep
    /// their defaults; malformed numbers are rejected.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let non_empty = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };
        let mut config = Self::default();

        if let Some(url) = non_empty(ENV_ENDPOINT_URL) {
            config.endpoint_url = normalize_endpoint_url(&url);
        }
        if let Some(dir) = non_empty(ENV_DATA_DIR) {
            config.data_dir = PathBuf::from(dir);
        }
        if let Some(token) = non_empty(ENV_SESSION_TOKEN) {
            config.session_token = Some(Zeroizing::new(token));
        }
        if let Some(raw) = non_empty(ENV_POLL_INTERVAL_SECS) {
            let secs = parse_u64(ENV_POLL_INTERVAL_SECS, &raw)?;
            config.poll_interval = Duration::from_secs(secs.max(MIN_POLL_INTERVAL_SECS));
        }
        if let Some(raw) = non_empty(ENV_REQUEST_TIMEOUT_MS) {
            let ms = parse_u64(ENV_REQUEST_TIMEOUT_MS, &raw)?;
            if ms == 0 {
                return Err(SyncError::Config(format!(
                    "{ENV_REQUEST_TIMEOUT_MS} must be greater than zero"
                )));
            }
            config.request_timeout = Duration::from_millis(ms);
        }
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.endpoint_url.is_empty() {
            return Err(SyncError::Config(format!(
                "menu server URL missing: set {ENV_ENDPOINT_URL}"
            )));
        }
        Ok(())
    }

    pub fn cache_path(&self) -> PathBuf {
        self.data_dir.join("menu-cache.db")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.data_dir.join("logs")
    }

    /// Log directory from the process environment alone, so logging can be
    /// up before anything touches the credential store.
    pub fn env_log_dir() -> PathBuf {
        Self::log_dir_from_lookup(|key| std::env::var(key).ok())
    }

    pub fn log_dir_from_lookup<F>(lookup: F) -> PathBuf
    where
        F: Fn(&str) -> Option<String>,
    {
        lookup(ENV_DATA_DIR)
            .map(|dir| dir.trim().to_string())
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from(DEFAULT_DATA_DIR))
            .join("logs")
    }
}

fn parse_u64(key: &str, raw: &str) -> Result<u64, SyncError> {
    raw.parse::<u64>()
        .map_err(|_| SyncError::Config(format!("{key} must be a whole number, got \"{raw}\"")))
}

/// Normalise the menu server URL:
/// - ensure a scheme is present (https, or http for localhost)
/// - strip trailing slashes
/// - strip a trailing `/api` segment
pub fn normalize_endpoint_url(url: &str) -> String {
    let mut url = url.trim().to_string();
    if url.is_empty() {
        return url;
    }

    if !url.starts_with("http://") && !url.starts_with("https://") {
        if url.starts_with("localhost") || url.starts_with("127.0.0.1") {
            url = format!("http://{url}");
        } else {
            url = format!("https://{url}");
        }
    }

    while url.ends_with('/') {
        url.pop();
    }
    if url.ends_with("/api") {
        url.truncate(url.len() - 4);
    }
    while url.ends_with('/') {
        url.pop();
    }

    url
}

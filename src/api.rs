//! Menu server client.
//!
//! [`RemoteStore`] is the seam the synced-data engine and the action layer
//! talk through. [`HttpRemoteStore`] implements it over the sync, logo and
//! site-config endpoints with per-request timeouts, exponential-backoff
//! retries and a short read cache bounded by the server's `max-age`.

use std::sync::Mutex;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, CACHE_CONTROL, CONTENT_TYPE, COOKIE};
use reqwest::{Client, Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::{debug, info, trace};
use zeroize::Zeroizing;

use crate::config::SyncConfig;
use crate::error::SyncError;
use crate::models::{Category, Logo, MenuSnapshot, Product, SiteConfig};
use crate::retry::RetryPolicy;

/// Source of truth for menu data.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Read the full menu. Fails with [`SyncError::Validation`] when the
    /// response lacks `categories` or `products`.
    async fn fetch_all(&self) -> Result<MenuSnapshot, SyncError>;

    /// Replace server state with the given sets. The server upserts every
    /// submitted row and deletes absent rows, except reserved system records.
    async fn push_all(&self, products: &[Product], categories: &[Category])
        -> Result<(), SyncError>;

    async fn fetch_logo(&self) -> Result<Option<Logo>, SyncError>;

    /// Set or clear (`None`) the site logo.
    async fn push_logo(&self, logo: Option<&Logo>) -> Result<(), SyncError>;

    async fn fetch_site_config(&self) -> Result<SiteConfig, SyncError>;

    async fn push_site_config(&self, key: &str, value: &Value) -> Result<(), SyncError>;

    /// Drop any read-side cache so the next fetch goes to the network.
    fn invalidate(&self) {}
}

// ---------------------------------------------------------------------------
// Error mapping
// ---------------------------------------------------------------------------

/// Convert a `reqwest::Error` into a transport error.
fn transport_error(url: &str, err: &reqwest::Error) -> SyncError {
    if err.is_connect() {
        return SyncError::Connect {
            url: url.to_string(),
        };
    }
    if err.is_builder() {
        return SyncError::Config(format!("Invalid menu server URL: {url}"));
    }
    SyncError::Network {
        url: url.to_string(),
        message: err.to_string(),
    }
}

fn status_message(status: StatusCode) -> String {
    match status.as_u16() {
        400 => "Menu server rejected the data".to_string(),
        404 => "Menu server endpoint not found".to_string(),
        429 => "Too many requests to the menu server".to_string(),
        s if s >= 500 => format!("Menu server error (HTTP {s})"),
        s => format!("Unexpected response from menu server (HTTP {s})"),
    }
}

/// Map a non-2xx response into an error, keeping server-provided details.
fn status_error(status: StatusCode, body_text: &str) -> SyncError {
    let detail = serde_json::from_str::<Value>(body_text).ok().and_then(|json| {
        let message = json
            .get("error")
            .or_else(|| json.get("message"))
            .and_then(Value::as_str)
            .map(ToString::to_string);
        let details = json.get("details").or_else(|| json.get("errors")).cloned();
        match (message, details) {
            (Some(m), Some(d)) => Some(format!("{m}: {d}")),
            (Some(m), None) => Some(m),
            (None, Some(d)) => Some(d.to_string()),
            (None, None) => None,
        }
    });
    let detail = detail.or_else(|| {
        let trimmed = body_text.trim();
        (!trimmed.is_empty()).then(|| trimmed.to_string())
    });

    match status.as_u16() {
        401 | 403 => SyncError::Unauthorized,
        400 | 422 => SyncError::Validation(detail.unwrap_or_else(|| status_message(status))),
        s => SyncError::Status {
            status: s,
            message: match detail {
                Some(d) => format!("{}: {d}", status_message(status)),
                None => status_message(status),
            },
        },
    }
}

/// Extract `max-age` from a `Cache-Control` header value.
pub fn parse_max_age(cache_control: &str) -> Option<Duration> {
    cache_control
        .split(',')
        .map(str::trim)
        .find_map(|directive| directive.strip_prefix("max-age="))
        .and_then(|secs| secs.trim().parse::<u64>().ok())
        .map(Duration::from_secs)
}

fn response_max_age(headers: &HeaderMap) -> Option<Duration> {
    headers
        .get(CACHE_CONTROL)
        .and_then(|v| v.to_str().ok())
        .and_then(parse_max_age)
}

// ---------------------------------------------------------------------------
// HTTP implementation
// ---------------------------------------------------------------------------

struct CachedRead {
    fetched_at: Instant,
    max_age: Duration,
    snapshot: MenuSnapshot,
}

pub struct HttpRemoteStore {
    client: Client,
    base_url: String,
    sync_path: String,
    logo_path: String,
    site_config_path: String,
    session_cookie: String,
    session_token: Option<Zeroizing<String>>,
    timeout: Duration,
    retry: RetryPolicy,
    read_cache: Mutex<Option<CachedRead>>,
}

impl HttpRemoteStore {
    pub fn new(config: &SyncConfig) -> Result<Self, SyncError> {
        config.validate()?;
        let client = Client::builder()
            .build()
            .map_err(|e| SyncError::Config(format!("Failed to create HTTP client: {e}")))?;
        Ok(Self {
            client,
            base_url: config.endpoint_url.clone(),
            sync_path: config.sync_path.clone(),
            logo_path: config.logo_path.clone(),
            site_config_path: config.site_config_path.clone(),
            session_cookie: config.session_cookie.clone(),
            session_token: config.session_token.clone(),
            timeout: config.request_timeout,
            retry: config.fetch_retry,
            read_cache: Mutex::new(None),
        })
    }

    pub fn set_session_token(&mut self, token: Option<Zeroizing<String>>) {
        self.session_token = token;
    }

    fn cached_snapshot(&self) -> Option<MenuSnapshot> {
        let guard = self.read_cache.lock().ok()?;
        let cached = guard.as_ref()?;
        (cached.fetched_at.elapsed() < cached.max_age).then(|| cached.snapshot.clone())
    }

    fn store_snapshot(&self, snapshot: &MenuSnapshot, max_age: Option<Duration>) {
        if let Ok(mut guard) = self.read_cache.lock() {
            *guard = max_age.filter(|age| !age.is_zero()).map(|max_age| CachedRead {
                fetched_at: Instant::now(),
                max_age,
                snapshot: snapshot.clone(),
            });
        }
    }

    /// One request with timeout. Dropping the send future on timeout aborts
    /// the underlying connection.
    async fn send_once(
        &self,
        method: Method,
        path: &str,
        body: Option<&Value>,
        authenticated: bool,
    ) -> Result<(HeaderMap, String), SyncError> {
        let url = format!("{}{path}", self.base_url);
        let mut req = self
            .client
            .request(method.clone(), &url)
            .header(CACHE_CONTROL, "no-cache");

        if authenticated {
            let token = self
                .session_token
                .as_ref()
                .ok_or(SyncError::Unauthorized)?;
            req = req.header(COOKIE, format!("{}={}", self.session_cookie, token.as_str()));
        }
        if let Some(b) = body {
            req = req.header(CONTENT_TYPE, "application/json").json(b);
        }

        trace!(method = %method, url = %url, "menu server request");
        let exchange = async {
            let resp = req.send().await.map_err(|e| transport_error(&url, &e))?;
            let status = resp.status();
            let headers = resp.headers().clone();
            let text = resp.text().await.map_err(|e| transport_error(&url, &e))?;
            Ok::<_, SyncError>((status, headers, text))
        };

        let (status, headers, text) = tokio::time::timeout(self.timeout, exchange)
            .await
            .map_err(|_| SyncError::Timeout {
                url: url.clone(),
                timeout_ms: self.timeout.as_millis() as u64,
            })??;

        if !status.is_success() {
            return Err(status_error(status, &text));
        }
        Ok((headers, text))
    }

    async fn request(
        &self,
        method: Method,
        path: &str,
        body: Option<Value>,
        authenticated: bool,
    ) -> Result<(HeaderMap, String), SyncError> {
        let label = format!("{method} {path}");
        self.retry
            .run(&label, || {
                self.send_once(method.clone(), path, body.as_ref(), authenticated)
            })
            .await
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<(HeaderMap, T), SyncError> {
        let (headers, text) = self.request(Method::GET, path, None, false).await?;
        let parsed = serde_json::from_str::<T>(&text)
            .map_err(|e| SyncError::Validation(format!("unexpected response from {path}: {e}")))?;
        Ok((headers, parsed))
    }
}

#[derive(serde::Deserialize)]
struct LogoResponse {
    #[serde(default)]
    logo: Option<String>,
}

#[derive(serde::Deserialize)]
struct SiteConfigResponse {
    #[serde(default)]
    config: SiteConfig,
}

#[async_trait]
impl RemoteStore for HttpRemoteStore {
    async fn fetch_all(&self) -> Result<MenuSnapshot, SyncError> {
        if let Some(snapshot) = self.cached_snapshot() {
            trace!("menu fetch served from read cache");
            return Ok(snapshot);
        }
        let (headers, snapshot) = self.get_json::<MenuSnapshot>(&self.sync_path).await?;
        debug!(
            categories = snapshot.categories.len(),
            products = snapshot.products.len(),
            "menu fetched"
        );
        self.store_snapshot(&snapshot, response_max_age(&headers));
        Ok(snapshot)
    }

    async fn push_all(
        &self,
        products: &[Product],
        categories: &[Category],
    ) -> Result<(), SyncError> {
        let body = serde_json::json!({
            "categories": categories,
            "products": products,
        });
        self.request(Method::POST, &self.sync_path, Some(body), true)
            .await?;
        self.invalidate();
        info!(
            categories = categories.len(),
            products = products.len(),
            "menu pushed"
        );
        Ok(())
    }

    async fn fetch_logo(&self) -> Result<Option<Logo>, SyncError> {
        let (_, resp) = self.get_json::<LogoResponse>(&self.logo_path).await?;
        Ok(resp
            .logo
            .filter(|image| !image.trim().is_empty())
            .map(Logo::new))
    }

    async fn push_logo(&self, logo: Option<&Logo>) -> Result<(), SyncError> {
        let body = serde_json::json!({ "logo": logo.map(|l| l.image.as_str()) });
        self.request(Method::POST, &self.logo_path, Some(body), true)
            .await?;
        self.invalidate();
        Ok(())
    }

    async fn fetch_site_config(&self) -> Result<SiteConfig, SyncError> {
        let (_, resp) = self
            .get_json::<SiteConfigResponse>(&self.site_config_path)
            .await?;
        Ok(resp.config)
    }

    async fn push_site_config(&self, key: &str, value: &Value) -> Result<(), SyncError> {
        let body = serde_json::json!({ "key": key, "value": value });
        self.request(Method::POST, &self.site_config_path, Some(body), true)
            .await?;
        self.invalidate();
        Ok(())
    }

    fn invalidate(&self) {
        if let Ok(mut guard) = self.read_cache.lock() {
            *guard = None;
        }
    }
}

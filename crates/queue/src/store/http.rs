//! HTTP KvStore for REST key-value namespaces
//!
//! Speaks the Workers-KV style REST surface:
//!
//! ```text
//! GET    {base}/values/{key}                      -> 200 body | 404
//! PUT    {base}/values/{key}?expiration_ttl={s}   -> 200
//! DELETE {base}/values/{key}                      -> 200 | 404
//! GET    {base}/keys?prefix={p}&cursor={c}        -> {"result":[{"name":..}],"result_info":{"cursor":..}}
//! ```

use std::time::Duration;

use async_trait::async_trait;
use reqwest::StatusCode;
use serde::Deserialize;
use tracing::{debug, instrument, trace};
use url::Url;

use super::kv::{KvStore, StoreError};

/// Connection settings for [`HttpKvStore`]
#[derive(Clone)]
pub struct HttpKvConfig {
    /// Namespace base URL, e.g. `https://api.example.com/kv/namespaces/abc`
    pub base_url: String,
    /// Bearer token (optional for local emulators)
    pub token: Option<String>,
    /// Timeout for point operations
    pub request_timeout: Duration,
    /// Timeout for each page of a `list` call
    pub list_timeout: Duration,
}

impl std::fmt::Debug for HttpKvConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpKvConfig")
            .field("base_url", &self.base_url)
            .field("token", &self.token.as_ref().map(|_| "***"))
            .field("request_timeout", &self.request_timeout)
            .field("list_timeout", &self.list_timeout)
            .finish()
    }
}

impl HttpKvConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            token: None,
            request_timeout: Duration::from_secs(5),
            list_timeout: Duration::from_secs(15),
        }
    }

    pub fn with_token(mut self, token: impl Into<String>) -> Self {
        self.token = Some(token.into());
        self
    }

    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = timeout;
        self
    }

    pub fn with_list_timeout(mut self, timeout: Duration) -> Self {
        self.list_timeout = timeout;
        self
    }

    /// Create configuration from environment variables
    ///
    /// Environment variables:
    /// - `TASKRELAY_KV_URL`: namespace base URL (required)
    /// - `TASKRELAY_KV_TOKEN`: bearer token
    /// - `TASKRELAY_KV_TIMEOUT_SECS`: point operation timeout (default: 5)
    /// - `TASKRELAY_KV_LIST_TIMEOUT_SECS`: list page timeout (default: 15)
    pub fn from_env() -> Result<Self, crate::config::ConfigError> {
        let base_url = std::env::var("TASKRELAY_KV_URL")
            .map_err(|_| crate::config::ConfigError::Missing("TASKRELAY_KV_URL"))?;

        let mut config = Self::new(base_url);
        config.token = std::env::var("TASKRELAY_KV_TOKEN").ok();
        if let Some(secs) = crate::config::env_secs("TASKRELAY_KV_TIMEOUT_SECS")? {
            config.request_timeout = secs;
        }
        if let Some(secs) = crate::config::env_secs("TASKRELAY_KV_LIST_TIMEOUT_SECS")? {
            config.list_timeout = secs;
        }
        Ok(config)
    }
}

#[derive(Debug, Deserialize)]
struct ListResponse {
    #[serde(default)]
    result: Vec<ListedKey>,
    #[serde(default)]
    result_info: Option<ResultInfo>,
}

#[derive(Debug, Deserialize)]
struct ListedKey {
    name: String,
}

#[derive(Debug, Deserialize)]
struct ResultInfo {
    #[serde(default)]
    cursor: Option<String>,
}

/// Remote KV namespace accessed over HTTP
pub struct HttpKvStore {
    base: Url,
    token: Option<String>,
    http: reqwest::Client,
    request_timeout: Duration,
    list_timeout: Duration,
}

impl HttpKvStore {
    /// Build a store client. Fails if the base URL does not parse.
    pub fn new(config: HttpKvConfig) -> Result<Self, StoreError> {
        // A trailing slash keeps `join` from replacing the last path segment
        let mut base = config.base_url.trim_end_matches('/').to_string();
        base.push('/');
        let base = Url::parse(&base)
            .map_err(|e| StoreError::Unavailable(format!("invalid KV base url: {e}")))?;

        let http = reqwest::Client::builder()
            .build()
            .map_err(|e| StoreError::Unavailable(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            base,
            token: config.token,
            http,
            request_timeout: config.request_timeout,
            list_timeout: config.list_timeout,
        })
    }

    fn value_url(&self, key: &str) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Unavailable("KV base url cannot be a base".to_string()))?
            .pop_if_empty()
            .push("values")
            .push(key);
        Ok(url)
    }

    fn keys_url(&self) -> Result<Url, StoreError> {
        let mut url = self.base.clone();
        url.path_segments_mut()
            .map_err(|_| StoreError::Unavailable("KV base url cannot be a base".to_string()))?
            .pop_if_empty()
            .push("keys");
        Ok(url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn error_for(response: reqwest::Response) -> StoreError {
        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return StoreError::RateLimited;
        }
        let message = response.text().await.unwrap_or_default();
        if status.is_server_error() {
            StoreError::Unavailable(format!("HTTP {}: {}", status.as_u16(), message))
        } else {
            StoreError::Http {
                status: status.as_u16(),
                message,
            }
        }
    }
}

fn transport_error(e: reqwest::Error) -> StoreError {
    if e.is_timeout() {
        StoreError::Timeout
    } else {
        StoreError::Unavailable(e.to_string())
    }
}

#[async_trait]
impl KvStore for HttpKvStore {
    #[instrument(skip(self))]
    async fn get(&self, key: &str) -> Result<Option<String>, StoreError> {
        let url = self.value_url(key)?;
        let response = self
            .authorize(self.http.get(url))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            StatusCode::NOT_FOUND => Ok(None),
            status if status.is_success() => {
                let body = response.text().await.map_err(transport_error)?;
                Ok(Some(body))
            }
            _ => Err(Self::error_for(response).await),
        }
    }

    #[instrument(skip(self, value), fields(bytes = value.len()))]
    async fn put(&self, key: &str, value: String, ttl: Option<Duration>) -> Result<(), StoreError> {
        let mut url = self.value_url(key)?;
        if let Some(ttl) = ttl {
            url.query_pairs_mut()
                .append_pair("expiration_ttl", &ttl.as_secs().max(1).to_string());
        }

        let response = self
            .authorize(self.http.put(url))
            .timeout(self.request_timeout)
            .body(value)
            .send()
            .await
            .map_err(transport_error)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(Self::error_for(response).await)
        }
    }

    #[instrument(skip(self))]
    async fn delete(&self, key: &str) -> Result<(), StoreError> {
        let url = self.value_url(key)?;
        let response = self
            .authorize(self.http.delete(url))
            .timeout(self.request_timeout)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() || status == StatusCode::NOT_FOUND {
            Ok(())
        } else {
            Err(Self::error_for(response).await)
        }
    }

    #[instrument(skip(self))]
    async fn list(&self, prefix: &str) -> Result<Vec<String>, StoreError> {
        let mut keys = Vec::new();
        let mut cursor: Option<String> = None;
        let mut pages = 0usize;

        loop {
            let mut url = self.keys_url()?;
            {
                let mut query = url.query_pairs_mut();
                query.append_pair("prefix", prefix);
                if let Some(cursor) = &cursor {
                    query.append_pair("cursor", cursor);
                }
            }

            let response = self
                .authorize(self.http.get(url))
                .timeout(self.list_timeout)
                .send()
                .await
                .map_err(transport_error)?;

            if !response.status().is_success() {
                return Err(Self::error_for(response).await);
            }

            let page: ListResponse = response
                .json()
                .await
                .map_err(|e| StoreError::Serialization(format!("invalid list response: {e}")))?;
            pages += 1;
            trace!(page = pages, count = page.result.len(), "Listed key page");

            keys.extend(page.result.into_iter().map(|k| k.name));

            cursor = page
                .result_info
                .and_then(|info| info.cursor)
                .filter(|c| !c.is_empty());
            if cursor.is_none() {
                break;
            }
        }

        debug!(count = keys.len(), pages, "Listed keys");
        Ok(keys)
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::header;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::{FetchError, Result, TransportOptions};

/// Issues the network call for one attempt.
///
/// Implementations must observe `cancel` and return
/// [`FetchError::Cancelled`] promptly once it fires. The controller also drops
/// the returned future when it cancels an attempt, so a late completion is
/// never observed.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn fetch(&self, url: &str, cancel: CancellationToken) -> Result<Value>;
}

#[async_trait]
impl<T: Transport + ?Sized> Transport for Arc<T> {
    async fn fetch(&self, url: &str, cancel: CancellationToken) -> Result<Value> {
        (**self).fetch(url, cancel).await
    }
}

/// `reqwest`-backed GET transport for JSON endpoints.
#[derive(Clone)]
pub struct HttpTransport {
    http: reqwest::Client,
    authorization: Option<String>,
    options: TransportOptions,
}

impl fmt::Debug for HttpTransport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HttpTransport")
            .field(
                "authorization",
                &self.authorization.as_ref().map(|_| "<redacted>"),
            )
            .field("options", &self.options)
            .finish()
    }
}

impl Default for HttpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl HttpTransport {
    /// Creates a transport without a base URL; request URLs must be absolute.
    pub fn new() -> Self {
        Self {
            http: reqwest::Client::new(),
            authorization: None,
            options: TransportOptions::default(),
        }
    }

    /// Creates a transport that resolves relative URLs against `base_url`.
    ///
    /// Example: base `"https://sample/api/"` and url `"posts/1"` request
    /// `"https://sample/api/posts/1"`.
    pub fn with_base_url(base_url: impl Into<String>) -> Self {
        let mut transport = Self::new();
        transport.options.base_url = Some(base_url.into());
        transport
    }

    /// Creates a transport from environment variables.
    ///
    /// Reads:
    /// - `REFETCH_BASE_URL` — prefix for relative request URLs
    /// - `REFETCH_TOKEN` — optional access token (Bearer prefix optional)
    ///
    /// # Example
    ///
    /// ```no_run
    /// use refetch::HttpTransport;
    ///
    /// let transport = HttpTransport::from_env().expect("missing REFETCH_BASE_URL");
    /// ```
    pub fn from_env() -> Result<Self> {
        let base_url = std::env::var("REFETCH_BASE_URL").map_err(|_| {
            FetchError::Config("missing REFETCH_BASE_URL environment variable".to_owned())
        })?;
        if base_url.trim().is_empty() {
            return Err(FetchError::Config(
                "REFETCH_BASE_URL is set but empty".to_owned(),
            ));
        }

        let transport = Self::with_base_url(base_url.trim());
        match std::env::var("REFETCH_TOKEN") {
            Ok(token) if !token.trim().is_empty() => Ok(transport.with_bearer_token(token)),
            _ => Ok(transport),
        }
    }

    /// Replaces timeout, base URL and default headers.
    pub fn with_options(mut self, opts: TransportOptions) -> Self {
        self.options = opts;
        self
    }

    /// Sends `Authorization: Bearer <token>` with every request.
    ///
    /// If the token is missing the `Bearer ` prefix, it is added automatically.
    pub fn with_bearer_token(mut self, token: impl AsRef<str>) -> Self {
        self.authorization = Some(normalize_bearer_authorization(token.as_ref()));
        self
    }

    /// Adds a default header, replacing an existing one with the same name.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        let name = name.into();
        self.options
            .headers
            .retain(|(existing, _)| !existing.eq_ignore_ascii_case(&name));
        self.options.headers.push((name, value.into()));
        self
    }

    pub fn options(&self) -> &TransportOptions {
        &self.options
    }

    fn resolve_url(&self, url: &str) -> String {
        let is_absolute = url.starts_with("http://") || url.starts_with("https://");
        match self.options.base_url.as_deref() {
            Some(base) if !is_absolute => format!(
                "{}/{}",
                base.trim_end_matches('/'),
                url.trim_start_matches('/')
            ),
            _ => url.to_owned(),
        }
    }

    async fn get_json(&self, target: &str) -> Result<Value> {
        let mut request = self
            .http
            .get(target)
            .timeout(Duration::from_millis(self.options.timeout_ms));
        for (name, value) in &self.options.headers {
            request = request.header(name.as_str(), value.as_str());
        }
        if let Some(authorization) = &self.authorization {
            request = request.header(header::AUTHORIZATION, authorization);
        }

        let response = request.send().await.map_err(FetchError::Transport)?;
        let status = response.status();
        let body = response.text().await.map_err(FetchError::Transport)?;

        if !status.is_success() {
            return Err(FetchError::Http {
                status: status.as_u16(),
                body,
            });
        }

        if body.trim().is_empty() {
            return Ok(Value::Null);
        }

        serde_json::from_str(&body).map_err(|err| {
            FetchError::Decode(format!("invalid JSON response: {err}; body: {body}"))
        })
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn fetch(&self, url: &str, cancel: CancellationToken) -> Result<Value> {
        let target = self.resolve_url(url);

        #[cfg(feature = "tracing")]
        tracing::trace!(url = %target, "sending GET request");

        tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(FetchError::Cancelled),
            result = self.get_json(&target) => result,
        }
    }
}

fn normalize_bearer_authorization(token: &str) -> String {
    let trimmed = token.trim();
    let prefix = trimmed.get(..7);
    if prefix.is_some_and(|value| value.eq_ignore_ascii_case("bearer ")) {
        trimmed.to_owned()
    } else {
        format!("Bearer {trimmed}")
    }
}

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::{ErrorInfo, Result};

/// Minimum time `loading` stays visible when the floor is enabled.
pub const DEFAULT_MIN_LOADING: Duration = Duration::from_millis(2_000);

/// Maps a raw JSON payload into the controller's result type.
pub type Transformer<T> = Arc<dyn Fn(Value) -> Result<T> + Send + Sync>;
/// Invoked once per successful attempt with the transformed result.
pub type SuccessHook<T> = Arc<dyn Fn(&T) + Send + Sync>;
/// Invoked once per terminal failure, after the retry budget is spent.
pub type ErrorHook = Arc<dyn Fn(&ErrorInfo) + Send + Sync>;

/// Configures one [`FetchController`](crate::FetchController).
pub struct FetchConfig<T> {
    /// Resource to fetch, resolved by the transport.
    pub url: String,
    /// Fetch as soon as the controller is constructed.
    pub auto_fetch: bool,
    /// Optional payload transformer. Without one the payload is deserialized
    /// into `T` as-is.
    pub transformer: Option<Transformer<T>>,
    pub on_success: Option<SuccessHook<T>>,
    pub on_error: Option<ErrorHook>,
    /// Re-fetch period after the first success. `None` disables polling.
    pub poll_interval: Option<Duration>,
    /// Number of retries after a failed attempt before the failure is surfaced.
    pub retry_on_fail_count: u32,
    /// Fixed delay between a failure and its retry.
    pub retry_on_fail_interval: Duration,
    /// Floor for how long `loading` stays set once an attempt starts.
    /// Zero disables the floor.
    pub min_loading: Duration,
}

impl<T> FetchConfig<T> {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            auto_fetch: true,
            transformer: None,
            on_success: None,
            on_error: None,
            poll_interval: None,
            retry_on_fail_count: 0,
            retry_on_fail_interval: Duration::from_millis(1_000),
            min_loading: Duration::ZERO,
        }
    }

    pub fn with_auto_fetch(mut self, auto_fetch: bool) -> Self {
        self.auto_fetch = auto_fetch;
        self
    }

    pub fn with_transformer<F>(mut self, transformer: F) -> Self
    where
        F: Fn(Value) -> Result<T> + Send + Sync + 'static,
    {
        self.transformer = Some(Arc::new(transformer));
        self
    }

    pub fn with_on_success<F>(mut self, hook: F) -> Self
    where
        F: Fn(&T) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(hook));
        self
    }

    pub fn with_on_error<F>(mut self, hook: F) -> Self
    where
        F: Fn(&ErrorInfo) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(hook));
        self
    }

    /// Enables polling. A zero interval disables it.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = Some(interval).filter(|interval| !interval.is_zero());
        self
    }

    pub fn with_retry(mut self, count: u32, interval: Duration) -> Self {
        self.retry_on_fail_count = count;
        self.retry_on_fail_interval = interval;
        self
    }

    pub fn with_min_loading(mut self, floor: Duration) -> Self {
        self.min_loading = floor;
        self
    }

    pub(crate) fn poll_period(&self) -> Option<Duration> {
        self.poll_interval.filter(|interval| !interval.is_zero())
    }
}

impl<T> Clone for FetchConfig<T> {
    fn clone(&self) -> Self {
        Self {
            url: self.url.clone(),
            auto_fetch: self.auto_fetch,
            transformer: self.transformer.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            poll_interval: self.poll_interval,
            retry_on_fail_count: self.retry_on_fail_count,
            retry_on_fail_interval: self.retry_on_fail_interval,
            min_loading: self.min_loading,
        }
    }
}

impl<T> fmt::Debug for FetchConfig<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FetchConfig")
            .field("url", &self.url)
            .field("auto_fetch", &self.auto_fetch)
            .field("transformer", &self.transformer.is_some())
            .field("on_success", &self.on_success.is_some())
            .field("on_error", &self.on_error.is_some())
            .field("poll_interval", &self.poll_interval)
            .field("retry_on_fail_count", &self.retry_on_fail_count)
            .field("retry_on_fail_interval", &self.retry_on_fail_interval)
            .field("min_loading", &self.min_loading)
            .finish()
    }
}

/// Configures [`HttpTransport`](crate::HttpTransport).
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransportOptions {
    /// Prefix for relative request URLs.
    pub base_url: Option<String>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Headers sent with every request.
    pub headers: Vec<(String, String)>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            base_url: None,
            timeout_ms: 10_000,
            headers: vec![("Content-Type".to_owned(), "application/json".to_owned())],
        }
    }
}

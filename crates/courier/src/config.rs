use std::time::Duration;

use reqwest::Client;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tracing::debug;

use crate::error::RequestError;

pub const DEFAULT_USER_AGENT: &str = concat!("courier/", env!("CARGO_PKG_VERSION"));

/// Budget applied to a call that does not set its own timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(10_000);

pub const DEFAULT_REFRESH_PATH: &str = "/auth/token/refresh";

/// Configurable options for the API client
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Address prefixed to every relative request path, e.g. `https://example.com/api`
    pub base_url: String,

    /// Timeout for a single call when the request does not override it.
    /// Covers dispatch and, outside streaming mode, reading the body.
    pub default_timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// User agent string
    pub user_agent: String,

    /// Headers sent with every request
    pub headers: HeaderMap,

    /// Path (relative to `base_url`) of the token refresh endpoint
    pub refresh_path: String,

    /// Capacity of the client event broadcast channel
    pub event_capacity: usize,

    /// Maximum idle connections to keep per host
    pub pool_max_idle_per_host: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: String::new(),
            default_timeout: DEFAULT_TIMEOUT,
            connect_timeout: Duration::from_secs(5),
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: ClientConfig::get_default_headers(),
            refresh_path: DEFAULT_REFRESH_PATH.to_owned(),
            event_capacity: 64,
            pool_max_idle_per_host: 10,
        }
    }
}

impl ClientConfig {
    pub fn new(base_url: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_user_agent(mut self, user_agent: impl Into<String>) -> Self {
        self.user_agent = user_agent.into();
        self
    }

    pub fn with_refresh_path(mut self, path: impl Into<String>) -> Self {
        self.refresh_path = path.into();
        self
    }

    pub fn with_event_capacity(mut self, capacity: usize) -> Self {
        self.event_capacity = capacity.max(1);
        self
    }

    /// Add a default header. Custom headers take precedence over defaults for the same name.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self, RequestError> {
        let header_name = HeaderName::from_bytes(name.as_bytes())
            .map_err(|e| RequestError::invalid_header(name, e.to_string()))?;
        let header_value =
            HeaderValue::from_str(value).map_err(|e| RequestError::invalid_header(name, e.to_string()))?;
        self.headers.insert(header_name, header_value);
        Ok(self)
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::ACCEPT,
            HeaderValue::from_static("application/json, text/event-stream, */*;q=0.8"),
        );

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,zh-CN;q=0.3,zh;q=0.2"),
        );
        default_headers
    }
}

/// Create a reqwest Client with the provided configuration
pub fn create_client(config: &ClientConfig) -> Result<Client, RequestError> {
    let mut client_builder = Client::builder()
        .pool_max_idle_per_host(config.pool_max_idle_per_host)
        .user_agent(&config.user_agent)
        .default_headers(config.headers.clone());

    // The per-call budget is enforced by the executor; only the connect phase is bounded here.
    if !config.connect_timeout.is_zero() {
        client_builder = client_builder.connect_timeout(config.connect_timeout);
    }

    debug!(base_url = %config.base_url, "Building HTTP client");
    client_builder.build().map_err(RequestError::from)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::new("http://127.0.0.1:8000/api");
        assert_eq!(config.base_url, "http://127.0.0.1:8000/api");
        assert_eq!(config.default_timeout, Duration::from_millis(10_000));
        assert_eq!(config.refresh_path, "/auth/token/refresh");
        assert!(config.headers.contains_key(reqwest::header::ACCEPT));
    }

    #[test]
    fn custom_header_overrides_default() {
        let config = ClientConfig::default()
            .with_header("accept", "application/json")
            .unwrap();
        assert_eq!(
            config.headers.get(reqwest::header::ACCEPT).unwrap(),
            "application/json"
        );
    }

    #[test]
    fn rejects_invalid_header() {
        let err = ClientConfig::default()
            .with_header("bad header", "x")
            .unwrap_err();
        assert!(matches!(err, RequestError::InvalidHeader { .. }));
    }
}

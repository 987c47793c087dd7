use std::env;
use std::time::Duration;

pub const DEFAULT_API_URL: &str = "http://localhost:5000/api";
pub const API_URL_ENV: &str = "PUBLIC_API_URL";
pub const REQUEST_TIMEOUT_ENV: &str = "API_REQUEST_TIMEOUT_SECS";

const CACHE_TTL: Duration = Duration::from_secs(30);
const RETRY_DELAY: Duration = Duration::from_millis(1000);
const REQUEST_TIMEOUT: Duration = Duration::from_secs(15);

/// Settings for talking to the statistics backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    /// Base URL every endpoint path is appended to, without a trailing slash.
    pub base_url: String,
    /// How long a successful response is served from cache.
    pub cache_ttl: Duration,
    /// Backoff unit; attempt `n` waits `retry_delay * (n + 1)` before the next one.
    pub retry_delay: Duration,
    /// Upper bound on a single attempt. `None` waits forever.
    pub request_timeout: Option<Duration>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self::with_base_url(DEFAULT_API_URL)
    }
}

impl ApiConfig {
    pub fn with_base_url(base_url: &str) -> Self {
        Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            cache_ttl: CACHE_TTL,
            retry_delay: RETRY_DELAY,
            request_timeout: Some(REQUEST_TIMEOUT),
        }
    }

    /// Reads `PUBLIC_API_URL` and `API_REQUEST_TIMEOUT_SECS`, falling back to
    /// the local development defaults when unset or blank.
    pub fn from_env() -> Self {
        let base_url = env::var(API_URL_ENV)
            .ok()
            .filter(|url| !url.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_API_URL.to_string());

        let mut config = Self::with_base_url(&base_url);
        if let Ok(raw) = env::var(REQUEST_TIMEOUT_ENV) {
            config.request_timeout = parse_timeout(&raw).unwrap_or(config.request_timeout);
        }
        config
    }
}

/// `0` disables the timeout; anything unparsable is ignored.
fn parse_timeout(raw: &str) -> Option<Option<Duration>> {
    match raw.trim().parse::<u64>() {
        Ok(0) => Some(None),
        Ok(secs) => Some(Some(Duration::from_secs(secs))),
        Err(_) => None,
    }
}

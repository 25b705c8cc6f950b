use std::str::FromStr;
use std::time::Duration;

pub const DEFAULT_BASE_URL: &str = "https://gate.dataloop.ai/api/v1";

/// Client settings, read from `DLOOP_*` environment variables.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientConfig {
    pub base_url: String,
    pub token: Option<String>,
    pub page_size: u32,
    pub decode_workers: usize,
    pub timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            token: None,
            page_size: 100,
            decode_workers: 8,
            timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    pub fn from_env() -> Self {
        let d = Self::default();
        Self {
            base_url: std::env::var("DLOOP_BASE_URL").unwrap_or(d.base_url),
            token: std::env::var("DLOOP_TOKEN").ok().filter(|t| !t.is_empty()),
            page_size: env_or("DLOOP_PAGE_SIZE", d.page_size).max(1),
            decode_workers: env_or("DLOOP_DECODE_WORKERS", d.decode_workers).max(1),
            timeout: Duration::from_secs(env_or("DLOOP_HTTP_TIMEOUT_SECS", d.timeout.as_secs())),
        }
    }

    pub fn with_base_url(mut self, url: impl Into<String>) -> Self {
        self.base_url = url.into();
        self
    }

    pub fn with_token(mut self, token: Option<String>) -> Self {
        if token.is_some() {
            self.token = token;
        }
        self
    }
}

/// Parse an env var, falling back to `default` when unset or malformed.
pub fn env_or<T: FromStr>(key: &str, default: T) -> T {
    std::env::var(key).ok().and_then(|s| s.parse::<T>().ok()).unwrap_or(default)
}

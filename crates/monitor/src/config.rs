//! Monitor configuration.
//!
//! All fields have sensible defaults for a local development server. In
//! production, override via environment variables (see
//! [`MonitorConfig::from_env`]).

use std::time::Duration;

use reqwest::Url;

use crate::reconnect::ReconnectConfig;

/// Poll interval used when the requested one is unusable.
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2_000;
/// Largest poll interval accepted as-is.
pub const MAX_POLL_INTERVAL_MS: i64 = 60_000;
/// Polls per execution before polling for it halts.
pub const MAX_POLL_ITERATIONS: u32 = 1_000;
/// Executions polled per tick.
pub const MAX_POLLED_EXECUTIONS: usize = 50;

const DEFAULT_API_URL: &str = "http://localhost:8000/api";

/// Errors raised while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("{var} has an invalid value: {value:?}")]
    Invalid { var: &'static str, value: String },

    #[error("Invalid URL {url}: {reason}")]
    InvalidUrl { url: String, reason: String },
}

/// Resolve the interval the poller actually uses.
///
/// Non-positive values and values above [`MAX_POLL_INTERVAL_MS`] fall
/// back to [`DEFAULT_POLL_INTERVAL_MS`] instead of being rejected.
pub fn effective_poll_interval(requested_ms: i64) -> Duration {
    if requested_ms <= 0 || requested_ms > MAX_POLL_INTERVAL_MS {
        Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
    } else {
        Duration::from_millis(requested_ms as u64)
    }
}

/// Poller settings.
#[derive(Debug, Clone)]
pub struct PollConfig {
    /// Effective tick interval, already clamped.
    pub interval: Duration,
    /// Iteration ceiling per execution.
    pub max_iterations: u32,
    /// Cardinality ceiling per tick.
    pub max_polled: usize,
}

impl PollConfig {
    /// Build a poll config from a raw, possibly invalid, interval.
    pub fn from_interval_ms(requested_ms: i64) -> Self {
        let interval = effective_poll_interval(requested_ms);
        if interval.as_millis() as i64 != requested_ms {
            tracing::warn!(
                requested_ms,
                effective_ms = interval.as_millis() as u64,
                "Poll interval out of range, using default",
            );
        }
        Self {
            interval,
            ..Self::default()
        }
    }
}

impl Default for PollConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MS),
            max_iterations: MAX_POLL_ITERATIONS,
            max_polled: MAX_POLLED_EXECUTIONS,
        }
    }
}

/// Configuration for a [`SubscriptionCoordinator`](crate::coordinator::SubscriptionCoordinator).
#[derive(Debug, Clone)]
pub struct MonitorConfig {
    /// Base URL of the status endpoint (e.g. `http://host:8000/api`).
    pub api_url: String,
    /// Base URL of the push endpoint (e.g. `ws://host:8000`).
    pub ws_url: String,
    pub poll: PollConfig,
    pub reconnect: ReconnectConfig,
    /// Open push channels for subscriptions.
    pub enable_push: bool,
    /// Register subscriptions with the poller.
    pub enable_polling: bool,
}

impl MonitorConfig {
    /// Defaults for `api_url`, deriving the push URL from it.
    pub fn new(api_url: impl Into<String>) -> Result<Self, ConfigError> {
        let api_url = api_url.into().trim_end_matches('/').to_string();
        let ws_url = derive_ws_url(&api_url)?;
        Ok(Self {
            api_url,
            ws_url,
            poll: PollConfig::default(),
            reconnect: ReconnectConfig::default(),
            enable_push: true,
            enable_polling: true,
        })
    }

    /// Set the poll interval, clamping unusable values to the default.
    pub fn with_poll_interval_ms(mut self, requested_ms: i64) -> Self {
        self.poll = PollConfig {
            max_iterations: self.poll.max_iterations,
            max_polled: self.poll.max_polled,
            ..PollConfig::from_interval_ms(requested_ms)
        };
        self
    }

    /// Load configuration from environment variables with defaults.
    ///
    /// | Env Var                            | Default                      |
    /// |------------------------------------|------------------------------|
    /// | `FLOWWATCH_API_URL`                | `http://localhost:8000/api`  |
    /// | `FLOWWATCH_WS_URL`                 | derived from the API URL     |
    /// | `FLOWWATCH_POLL_INTERVAL_MS`       | `2000`                       |
    /// | `FLOWWATCH_MAX_RECONNECT_ATTEMPTS` | `5`                          |
    /// | `FLOWWATCH_ENABLE_PUSH`            | `true`                       |
    /// | `FLOWWATCH_ENABLE_POLLING`         | `true`                       |
    pub fn from_env() -> Result<Self, ConfigError> {
        let api_url =
            std::env::var("FLOWWATCH_API_URL").unwrap_or_else(|_| DEFAULT_API_URL.into());
        let mut config = Self::new(api_url)?;

        if let Ok(ws_url) = std::env::var("FLOWWATCH_WS_URL") {
            config.ws_url = ws_url.trim_end_matches('/').to_string();
        }

        if let Some(ms) = env_parse::<i64>("FLOWWATCH_POLL_INTERVAL_MS")? {
            config = config.with_poll_interval_ms(ms);
        }

        if let Some(attempts) = env_parse::<u32>("FLOWWATCH_MAX_RECONNECT_ATTEMPTS")? {
            config.reconnect.max_attempts = attempts;
        }

        if let Some(enabled) = env_bool("FLOWWATCH_ENABLE_PUSH")? {
            config.enable_push = enabled;
        }

        if let Some(enabled) = env_bool("FLOWWATCH_ENABLE_POLLING")? {
            config.enable_polling = enabled;
        }

        Ok(config)
    }

    /// Push-channel URL for one execution.
    pub fn channel_url(&self, execution_id: &str) -> String {
        format!("{}/ws/executions/{}", self.ws_url, execution_id)
    }
}

/// `http://host:8000/api` -> `ws://host:8000`, `https` -> `wss`.
pub fn derive_ws_url(api_url: &str) -> Result<String, ConfigError> {
    let invalid = |reason: String| ConfigError::InvalidUrl {
        url: api_url.to_string(),
        reason,
    };

    let mut url = Url::parse(api_url).map_err(|e| invalid(e.to_string()))?;
    let scheme = match url.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(invalid(format!("unsupported scheme {other}"))),
    };
    url.set_scheme(scheme)
        .map_err(|_| invalid(format!("cannot switch scheme to {scheme}")))?;
    url.set_path("");
    url.set_query(None);
    url.set_fragment(None);

    Ok(url.as_str().trim_end_matches('/').to_string())
}

fn env_parse<T: std::str::FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Invalid { var, value }),
        Err(_) => Ok(None),
    }
}

fn env_bool(var: &'static str) -> Result<Option<bool>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(Some(true)),
            "0" | "false" | "no" | "off" => Ok(Some(false)),
            _ => Err(ConfigError::Invalid { var, value }),
        },
        Err(_) => Ok(None),
    }
}

use std::env;
use std::time::Duration;
use thiserror::Error;
use url::Url;

use crate::gate::GateSettings;
use crate::status::StatusSettings;
use crate::transport::backoff::BackoffPolicy;

const DEFAULT_SIGNALING_URL: &str = "ws://127.0.0.1:8000/ws";
const DEFAULT_API_URL: &str = "http://127.0.0.1:8000/api/";
const DEFAULT_STATUS_PATH: &str = "/status";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} is required")]
    Missing(&'static str),
    #[error("invalid url for {field}: {reason}")]
    InvalidUrl { field: &'static str, reason: String },
    #[error("invalid value for {key}: {value}")]
    InvalidValue { key: &'static str, value: String },
}

/// Settings for one signaling connection.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransportConfig {
    /// Base under which endpoint paths are joined.
    pub base_url: Url,
    pub heartbeat_interval: Duration,
    pub backoff: BackoffPolicy,
}

impl TransportConfig {
    /// No inbound traffic for this long closes the socket.
    pub fn liveness_timeout(&self) -> Duration {
        self.heartbeat_interval * 3
    }
}

/// Builder for [`TransportConfig`].
pub struct TransportConfigBuilder {
    url: Option<String>,
    heartbeat_interval: Option<Duration>,
    reconnect_base: Option<Duration>,
    reconnect_max: Option<Duration>,
    max_attempts: Option<u32>,
}

impl TransportConfigBuilder {
    pub fn new() -> Self {
        Self {
            url: None,
            heartbeat_interval: None,
            reconnect_base: None,
            reconnect_max: None,
            max_attempts: None,
        }
    }

    pub fn url(mut self, url: impl Into<String>) -> Self {
        self.url = Some(url.into());
        self
    }

    pub fn heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = Some(interval);
        self
    }

    pub fn reconnect_base(mut self, delay: Duration) -> Self {
        self.reconnect_base = Some(delay);
        self
    }

    pub fn reconnect_max(mut self, delay: Duration) -> Self {
        self.reconnect_max = Some(delay);
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = Some(attempts);
        self
    }

    pub fn build(self) -> Result<TransportConfig, ConfigError> {
        let raw = self.url.ok_or(ConfigError::Missing("signaling url"))?;
        let base_url = normalize_ws_url(&raw)?;

        let defaults = BackoffPolicy::default();
        let heartbeat_interval = self.heartbeat_interval.unwrap_or(Duration::from_secs(5));
        if heartbeat_interval.is_zero() {
            return Err(ConfigError::InvalidValue {
                key: "heartbeat interval",
                value: "0".into(),
            });
        }
        let base = self.reconnect_base.unwrap_or(defaults.base);
        let max = self.reconnect_max.unwrap_or(defaults.max);
        if base.is_zero() || base > max {
            return Err(ConfigError::InvalidValue {
                key: "reconnect delay",
                value: format!("base {base:?} max {max:?}"),
            });
        }

        Ok(TransportConfig {
            base_url,
            heartbeat_interval,
            backoff: BackoffPolicy {
                base,
                max,
                max_attempts: self.max_attempts,
            },
        })
    }
}

impl Default for TransportConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Process configuration, read from `PROCTOR_*` environment variables.
#[derive(Debug, Clone)]
pub struct ProctorConfig {
    pub transport: TransportConfig,
    pub api_url: Url,
    pub status_path: String,
    pub status_grace: Duration,
    pub countdown: Duration,
    pub consent_pages: usize,
}

impl ProctorConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut builder = TransportConfigBuilder::new().url(
            lookup("PROCTOR_SIGNALING_URL").unwrap_or_else(|| DEFAULT_SIGNALING_URL.to_string()),
        );
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PROCTOR_HEARTBEAT_MS")? {
            builder = builder.heartbeat_interval(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PROCTOR_RECONNECT_BASE_MS")? {
            builder = builder.reconnect_base(Duration::from_millis(ms));
        }
        if let Some(ms) = parse_var::<u64, _>(&lookup, "PROCTOR_RECONNECT_MAX_MS")? {
            builder = builder.reconnect_max(Duration::from_millis(ms));
        }
        if let Some(attempts) = parse_var::<u32, _>(&lookup, "PROCTOR_RECONNECT_ATTEMPTS")? {
            builder = builder.max_attempts(attempts);
        }
        let transport = builder.build()?;

        let api_raw = lookup("PROCTOR_API_URL").unwrap_or_else(|| DEFAULT_API_URL.to_string());
        let api_url = normalize_http_url(&api_raw)?;

        let status_path =
            lookup("PROCTOR_STATUS_PATH").unwrap_or_else(|| DEFAULT_STATUS_PATH.to_string());
        let status_grace = parse_var::<u64, _>(&lookup, "PROCTOR_STATUS_GRACE_MS")?
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_secs(1));
        let countdown = parse_var::<u64, _>(&lookup, "PROCTOR_COUNTDOWN_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(Duration::from_secs(5));
        let consent_pages = parse_var::<usize, _>(&lookup, "PROCTOR_CONSENT_PAGES")?.unwrap_or(3);
        if consent_pages == 0 {
            return Err(ConfigError::InvalidValue {
                key: "PROCTOR_CONSENT_PAGES",
                value: "0".into(),
            });
        }

        Ok(Self {
            transport,
            api_url,
            status_path,
            status_grace,
            countdown,
            consent_pages,
        })
    }
}

impl ProctorConfig {
    pub fn status_settings(&self) -> StatusSettings {
        StatusSettings {
            path: self.status_path.clone(),
            grace: self.status_grace,
        }
    }

    pub fn gate_settings(&self) -> GateSettings {
        GateSettings {
            countdown: self.countdown,
            consent_pages: self.consent_pages,
            ..GateSettings::default()
        }
    }
}

fn parse_var<T, F>(lookup: &F, key: &'static str) -> Result<Option<T>, ConfigError>
where
    T: std::str::FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::InvalidValue { key, value: raw }),
    }
}

/// Accepts `ws`, `wss`, `http`, `https` or a bare host; answers a
/// websocket url with `localhost` pinned to IPv4.
pub fn normalize_ws_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let with_scheme = if let Some(rest) = trimmed.strip_prefix("https://") {
        format!("wss://{rest}")
    } else if let Some(rest) = trimmed.strip_prefix("http://") {
        format!("ws://{rest}")
    } else if trimmed.starts_with("ws://") || trimmed.starts_with("wss://") {
        trimmed.to_string()
    } else {
        format!("ws://{trimmed}")
    };
    parse_pinned(&with_scheme, "signaling url")
}

fn normalize_http_url(raw: &str) -> Result<Url, ConfigError> {
    let trimmed = raw.trim();
    let mut with_scheme = if trimmed.starts_with("http://") || trimmed.starts_with("https://") {
        trimmed.to_string()
    } else {
        format!("http://{trimmed}")
    };
    if !with_scheme.ends_with('/') {
        with_scheme.push('/');
    }
    parse_pinned(&with_scheme, "api url")
}

fn parse_pinned(raw: &str, field: &'static str) -> Result<Url, ConfigError> {
    let mut url = Url::parse(raw).map_err(|err| ConfigError::InvalidUrl {
        field,
        reason: err.to_string(),
    })?;
    if url.host_str() == Some("localhost") {
        url.set_host(Some("127.0.0.1"))
            .map_err(|err| ConfigError::InvalidUrl {
                field,
                reason: err.to_string(),
            })?;
    }
    Ok(url)
}

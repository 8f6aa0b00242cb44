//! Environment-backed runtime configuration for `jobline-probe`.

use std::{env, error::Error, fmt, time::Duration};

use jobline_core::{ChannelOrigin, DispatcherConfig, LiveChannelConfig, ReconnectBackoff, RetryPolicy};
use url::Url;

const DEFAULT_API_BASE_URL: &str = "http://127.0.0.1:8188";
const DEFAULT_LIVE_PATH: &str = "/ws";
const DEFAULT_REQUEST_TIMEOUT_MS: u64 = 30_000;
const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;
const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_INFLIGHT_GRACE_MS: u64 = 5_000;
const DEFAULT_RECONNECT_BASE_DELAY_MS: u64 = 1_000;
const DEFAULT_RECONNECT_MAX_DELAY_MS: u64 = 30_000;
const DEFAULT_RECONNECT_MAX_ATTEMPTS: u32 = 10;
const DEFAULT_KEEPALIVE_INTERVAL_MS: u64 = 30_000;
const DEFAULT_PROBE_ENDPOINT: &str = "/models";
const DEFAULT_PROBE_CACHE_TTL_MS: u64 = 60_000;

/// Runtime configuration used by the probe.
#[derive(Debug, Clone, PartialEq)]
pub struct ProbeConfig {
    /// Base URL of the engine's REST API.
    pub api_base_url: Url,
    /// Host, scheme and path of the live channel.
    pub live_origin: ChannelOrigin,
    /// Live channel port. `None` disables the channel.
    pub live_port: Option<u16>,
    pub request_timeout: Duration,
    pub retry: RetryPolicy,
    pub inflight_grace: Duration,
    pub reconnect: ReconnectBackoff,
    pub keepalive_interval: Duration,
    /// Read-only endpoint pulled on startup and after every change event.
    pub probe_endpoint: String,
    pub probe_cache_ttl: Duration,
}

impl ProbeConfig {
    /// Parse configuration from environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    fn from_lookup<F>(mut lookup: F) -> Result<Self, ConfigError>
    where
        F: FnMut(&str) -> Option<String>,
    {
        let base_raw = optional_trimmed_env("JOBLINE_API_BASE_URL", &mut lookup)
            .unwrap_or_else(|| DEFAULT_API_BASE_URL.to_owned());
        let api_base_url = Url::parse(&base_raw).map_err(|err| ConfigError::InvalidValue {
            key: "JOBLINE_API_BASE_URL",
            value: base_raw.clone(),
            reason: err.to_string(),
        })?;
        if !matches!(api_base_url.scheme(), "http" | "https") {
            return Err(ConfigError::InvalidValue {
                key: "JOBLINE_API_BASE_URL",
                value: base_raw,
                reason: "scheme must be http or https".to_owned(),
            });
        }
        let Some(base_host) = api_base_url.host_str().map(str::to_owned) else {
            return Err(ConfigError::InvalidValue {
                key: "JOBLINE_API_BASE_URL",
                value: base_raw,
                reason: "missing host".to_owned(),
            });
        };

        let live_host =
            optional_trimmed_env("JOBLINE_LIVE_HOST", &mut lookup).unwrap_or(base_host);
        let live_secure = parse_optional_bool("JOBLINE_LIVE_SECURE", &mut lookup)?
            .unwrap_or(api_base_url.scheme() == "https");
        let live_path = optional_trimmed_env("JOBLINE_LIVE_PATH", &mut lookup)
            .unwrap_or_else(|| DEFAULT_LIVE_PATH.to_owned());
        let live_port = parse_optional_u16("JOBLINE_LIVE_PORT", &mut lookup)?;

        let request_timeout_ms = parse_nonzero_u64(
            "JOBLINE_REQUEST_TIMEOUT_MS",
            DEFAULT_REQUEST_TIMEOUT_MS,
            &mut lookup,
        )?;
        let retry_max_attempts = parse_nonzero_u32(
            "JOBLINE_RETRY_MAX_ATTEMPTS",
            DEFAULT_RETRY_MAX_ATTEMPTS,
            &mut lookup,
        )?;
        let retry_base_delay_ms = parse_optional_u64_with_default(
            "JOBLINE_RETRY_BASE_DELAY_MS",
            DEFAULT_RETRY_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let honor_retry_after =
            parse_optional_bool("JOBLINE_RETRY_HONOR_RETRY_AFTER", &mut lookup)?.unwrap_or(false);
        let inflight_grace_ms = parse_optional_u64_with_default(
            "JOBLINE_INFLIGHT_GRACE_MS",
            DEFAULT_INFLIGHT_GRACE_MS,
            &mut lookup,
        )?;
        let reconnect_base_delay_ms = parse_nonzero_u64(
            "JOBLINE_RECONNECT_BASE_DELAY_MS",
            DEFAULT_RECONNECT_BASE_DELAY_MS,
            &mut lookup,
        )?;
        let reconnect_max_delay_ms = parse_nonzero_u64(
            "JOBLINE_RECONNECT_MAX_DELAY_MS",
            DEFAULT_RECONNECT_MAX_DELAY_MS,
            &mut lookup,
        )?;
        let reconnect_max_attempts = parse_nonzero_u32(
            "JOBLINE_RECONNECT_MAX_ATTEMPTS",
            DEFAULT_RECONNECT_MAX_ATTEMPTS,
            &mut lookup,
        )?;
        let keepalive_interval_ms = parse_nonzero_u64(
            "JOBLINE_KEEPALIVE_INTERVAL_MS",
            DEFAULT_KEEPALIVE_INTERVAL_MS,
            &mut lookup,
        )?;
        let probe_endpoint = optional_trimmed_env("JOBLINE_PROBE_ENDPOINT", &mut lookup)
            .unwrap_or_else(|| DEFAULT_PROBE_ENDPOINT.to_owned());
        let probe_cache_ttl_ms = parse_nonzero_u64(
            "JOBLINE_PROBE_CACHE_TTL_MS",
            DEFAULT_PROBE_CACHE_TTL_MS,
            &mut lookup,
        )?;

        if reconnect_max_delay_ms < reconnect_base_delay_ms {
            return Err(ConfigError::InvalidValue {
                key: "JOBLINE_RECONNECT_MAX_DELAY_MS",
                value: reconnect_max_delay_ms.to_string(),
                reason: format!("must be at least the base delay ({reconnect_base_delay_ms})"),
            });
        }

        Ok(Self {
            api_base_url,
            live_origin: ChannelOrigin::new(live_host, live_secure).with_path(live_path),
            live_port,
            request_timeout: Duration::from_millis(request_timeout_ms),
            retry: RetryPolicy::new(retry_max_attempts, retry_base_delay_ms)
                .honor_retry_after(honor_retry_after),
            inflight_grace: Duration::from_millis(inflight_grace_ms),
            reconnect: ReconnectBackoff::new(
                reconnect_base_delay_ms,
                reconnect_max_delay_ms,
                reconnect_max_attempts,
            ),
            keepalive_interval: Duration::from_millis(keepalive_interval_ms),
            probe_endpoint,
            probe_cache_ttl: Duration::from_millis(probe_cache_ttl_ms),
        })
    }

    pub fn dispatcher_config(&self) -> DispatcherConfig {
        DispatcherConfig {
            inflight_grace: self.inflight_grace,
        }
    }

    pub fn live_channel_config(&self) -> LiveChannelConfig {
        LiveChannelConfig::new(self.live_origin.clone())
            .with_keepalive_interval(self.keepalive_interval)
            .with_backoff(self.reconnect.clone())
    }
}

/// Errors produced while parsing runtime configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// An environment variable could not be parsed.
    InvalidValue {
        key: &'static str,
        value: String,
        reason: String,
    },
}

impl fmt::Display for ConfigError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidValue { key, value, reason } => {
                write!(f, "invalid {key}='{value}': {reason}")
            }
        }
    }
}

impl Error for ConfigError {}

fn optional_trimmed_env<F>(key: &'static str, lookup: &mut F) -> Option<String>
where
    F: FnMut(&str) -> Option<String>,
{
    lookup(key)
        .map(|value| value.trim().to_owned())
        .filter(|value| !value.is_empty())
}

fn parse_optional_u16<F>(key: &'static str, lookup: &mut F) -> Result<Option<u16>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u16>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64<F>(key: &'static str, lookup: &mut F) -> Result<Option<u64>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    value
        .parse::<u64>()
        .map(Some)
        .map_err(|err| ConfigError::InvalidValue {
            key,
            value,
            reason: err.to_string(),
        })
}

fn parse_optional_u64_with_default<F>(
    key: &'static str,
    default: u64,
    lookup: &mut F,
) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    Ok(parse_optional_u64(key, lookup)?.unwrap_or(default))
}

fn parse_nonzero_u64<F>(key: &'static str, default: u64, lookup: &mut F) -> Result<u64, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = parse_optional_u64_with_default(key, default, lookup)?;
    if value == 0 {
        return Err(ConfigError::InvalidValue {
            key,
            value: "0".to_owned(),
            reason: "must be at least 1".to_owned(),
        });
    }
    Ok(value)
}

fn parse_nonzero_u32<F>(key: &'static str, default: u32, lookup: &mut F) -> Result<u32, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let value = parse_nonzero_u64(key, u64::from(default), lookup)?;
    u32::try_from(value).map_err(|err| ConfigError::InvalidValue {
        key,
        value: value.to_string(),
        reason: err.to_string(),
    })
}

fn parse_optional_bool<F>(key: &'static str, lookup: &mut F) -> Result<Option<bool>, ConfigError>
where
    F: FnMut(&str) -> Option<String>,
{
    let Some(value) = optional_trimmed_env(key, lookup) else {
        return Ok(None);
    };
    match value.to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(Some(true)),
        "0" | "false" | "no" | "off" => Ok(Some(false)),
        _ => Err(ConfigError::InvalidValue {
            key,
            value,
            reason: "expected a boolean (true/false)".to_owned(),
        }),
    }
}

//! Configuration management for flagproxy.
//!
//! Configuration is set via environment variables:
//! - `FLAGPROXY_CONTROL_PLANE_URL` - Optional. Base URL of the upstream
//!   control plane. Defaults to `https://config.feature-flags.example.com`.
//! - `FLAGPROXY_BEARER_TOKEN` - Required. Bearer token minted via
//!   `POST /proxy/auth`, used to authenticate every upstream call.
//! - `FLAGPROXY_ACCOUNT_ID` - Required. `Harness-Accountid` header value.
//! - `FLAGPROXY_PROXY_KEY` - Required. The proxy key whose scope this
//!   instance serves.
//! - `FLAGPROXY_SDK_INFO` - Optional. `Harness-Sdk-Info` header value.
//!   Defaults to `flagproxy/<crate-version>`.
//! - `FLAGPROXY_REDIS_URL` - Optional. If unset, the in-memory K/V store is
//!   used instead of Redis (single-process / offline mode).
//! - `FLAGPROXY_REDIS_TTL_SECS` - Optional. TTL applied to `Set` on the
//!   remote store. Defaults to unbounded (`0` = no TTL).
//! - `FLAGPROXY_HOT_CACHE_TTL_SECS` - Optional. Process-local hot cache
//!   entry TTL. Defaults to `300`.
//! - `FLAGPROXY_MEMOIZE_TTL_SECS` - Optional. Memoize layer entry TTL.
//!   Defaults to `300`.
//! - `FLAGPROXY_METRICS_ADDR` - Optional. Bind address for `/healthz` and
//!   `/metrics`. Defaults to `127.0.0.1:8000`.
//! - `FLAGPROXY_READ_REPLICA` - Optional boolean. When `true`, this
//!   instance runs as a read replica (component H) instead of talking to
//!   the control plane directly. Defaults to `false`.

use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {0}: {1}")]
    InvalidValue(String, String),
}

/// Top-level configuration for the proxy process.
#[derive(Debug, Clone)]
pub struct Config {
    pub control_plane_url: String,
    pub bearer_token: String,
    pub account_id: String,
    pub proxy_key: String,
    pub sdk_info: String,

    pub redis_url: Option<String>,
    pub redis_ttl: Option<Duration>,

    pub hot_cache_ttl: Duration,
    pub memoize_ttl: Duration,

    pub metrics_addr: String,

    pub read_replica: bool,
}

impl Config {
    /// Load configuration from environment variables.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError::MissingEnvVar` if a required variable is
    /// unset, or `ConfigError::InvalidValue` if a numeric variable fails to
    /// parse.
    pub fn from_env() -> Result<Self, ConfigError> {
        let control_plane_url = std::env::var("FLAGPROXY_CONTROL_PLANE_URL")
            .unwrap_or_else(|_| "https://config.feature-flags.example.com".to_string());

        let bearer_token = std::env::var("FLAGPROXY_BEARER_TOKEN")
            .map_err(|_| ConfigError::MissingEnvVar("FLAGPROXY_BEARER_TOKEN".to_string()))?;

        let account_id = std::env::var("FLAGPROXY_ACCOUNT_ID")
            .map_err(|_| ConfigError::MissingEnvVar("FLAGPROXY_ACCOUNT_ID".to_string()))?;

        let proxy_key = std::env::var("FLAGPROXY_PROXY_KEY")
            .map_err(|_| ConfigError::MissingEnvVar("FLAGPROXY_PROXY_KEY".to_string()))?;

        let sdk_info = std::env::var("FLAGPROXY_SDK_INFO")
            .unwrap_or_else(|_| format!("flagproxy/{}", env!("CARGO_PKG_VERSION")));

        let redis_url = std::env::var("FLAGPROXY_REDIS_URL").ok();

        let redis_ttl_secs = std::env::var("FLAGPROXY_REDIS_TTL_SECS")
            .unwrap_or_else(|_| "0".to_string())
            .parse::<u64>()
            .map_err(|e| {
                ConfigError::InvalidValue("FLAGPROXY_REDIS_TTL_SECS".to_string(), e.to_string())
            })?;
        let redis_ttl = if redis_ttl_secs == 0 {
            None
        } else {
            Some(Duration::from_secs(redis_ttl_secs))
        };

        let hot_cache_ttl_secs = std::env::var("FLAGPROXY_HOT_CACHE_TTL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .map_err(|e| {
                ConfigError::InvalidValue(
                    "FLAGPROXY_HOT_CACHE_TTL_SECS".to_string(),
                    e.to_string(),
                )
            })?;

        let memoize_ttl_secs = std::env::var("FLAGPROXY_MEMOIZE_TTL_SECS")
            .unwrap_or_else(|_| "300".to_string())
            .parse::<u64>()
            .map_err(|e| {
                ConfigError::InvalidValue("FLAGPROXY_MEMOIZE_TTL_SECS".to_string(), e.to_string())
            })?;

        let metrics_addr =
            std::env::var("FLAGPROXY_METRICS_ADDR").unwrap_or_else(|_| "127.0.0.1:8000".to_string());

        let read_replica = crate::util::env_var_bool("FLAGPROXY_READ_REPLICA", false);

        Ok(Self {
            control_plane_url,
            bearer_token,
            account_id,
            proxy_key,
            sdk_info,
            redis_url,
            redis_ttl,
            hot_cache_ttl: Duration::from_secs(hot_cache_ttl_secs),
            memoize_ttl: Duration::from_secs(memoize_ttl_secs),
            metrics_addr,
            read_replica,
        })
    }

    /// Build a config with explicit values (used by tests).
    #[cfg(test)]
    pub fn for_test() -> Self {
        Self {
            control_plane_url: "http://localhost:9999".to_string(),
            bearer_token: "test-token".to_string(),
            account_id: "acct".to_string(),
            proxy_key: "pk".to_string(),
            sdk_info: "flagproxy/test".to_string(),
            redis_url: None,
            redis_ttl: None,
            hot_cache_ttl: Duration::from_secs(300),
            memoize_ttl: Duration::from_secs(300),
            metrics_addr: "127.0.0.1:0".to_string(),
            read_replica: false,
        }
    }
}

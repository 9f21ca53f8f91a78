//! Configuration management

use anyhow::{bail, Result};
use std::path::PathBuf;
use std::time::Duration;

use crate::telemetry::ReconnectPolicy;

/// Reconnect delay strategy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectMode {
    Fixed,
    Exponential,
}

/// Client configuration
#[derive(Debug, Clone)]
pub struct Config {
    /// Base URL of the authentication service
    pub auth_url: String,

    /// Auth request timeout in seconds
    pub auth_timeout_secs: u64,

    /// Streaming telemetry endpoint (ws:// or wss://)
    pub telemetry_url: String,

    /// File backing the durable session store
    pub session_path: PathBuf,

    /// Synthetic heartbeat interval
    pub heartbeat_interval: Duration,

    /// Reconnect strategy
    pub reconnect_mode: ReconnectMode,

    /// Fixed delay, or base delay for exponential backoff
    pub reconnect_delay: Duration,

    /// Cap for exponential backoff
    pub reconnect_max_delay: Duration,

    /// Gate the telemetry channel on an authenticated session
    pub telemetry_require_session: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            auth_url: "http://localhost:8080".to_string(),
            auth_timeout_secs: 30,
            telemetry_url: "ws://localhost:8080/ws/telemetry".to_string(),
            session_path: crate::session::storage::default_path(),
            heartbeat_interval: Duration::from_millis(5000),
            reconnect_mode: ReconnectMode::Exponential,
            reconnect_delay: Duration::from_millis(3000),
            reconnect_max_delay: Duration::from_millis(30000),
            telemetry_require_session: false,
        }
    }
}

impl Config {
    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let auth_url = std::env::var("SENTINEL_AUTH_URL").unwrap_or(defaults.auth_url);
        let telemetry_url = std::env::var("SENTINEL_TELEMETRY_URL").unwrap_or(defaults.telemetry_url);

        let session_path = std::env::var("SENTINEL_SESSION_PATH")
            .map(PathBuf::from)
            .unwrap_or(defaults.session_path);

        let auth_timeout_secs = std::env::var("SENTINEL_AUTH_TIMEOUT")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(defaults.auth_timeout_secs);

        let heartbeat_interval = env_millis("SENTINEL_HEARTBEAT_MS").unwrap_or(defaults.heartbeat_interval);
        let reconnect_delay = env_millis("SENTINEL_RECONNECT_MS").unwrap_or(defaults.reconnect_delay);
        let reconnect_max_delay =
            env_millis("SENTINEL_RECONNECT_MAX_MS").unwrap_or(defaults.reconnect_max_delay);

        let reconnect_mode = match std::env::var("SENTINEL_RECONNECT_MODE") {
            Ok(mode) => parse_reconnect_mode(&mode)?,
            Err(_) => defaults.reconnect_mode,
        };

        let telemetry_require_session = std::env::var("SENTINEL_TELEMETRY_REQUIRE_SESSION")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let config = Self {
            auth_url,
            auth_timeout_secs,
            telemetry_url,
            session_path,
            heartbeat_interval,
            reconnect_mode,
            reconnect_delay,
            reconnect_max_delay,
            telemetry_require_session,
        };
        config.validate()?;
        Ok(config)
    }

    /// Reject timings that would spin the telemetry event loop
    pub fn validate(&self) -> Result<()> {
        if self.heartbeat_interval.is_zero() {
            bail!("SENTINEL_HEARTBEAT_MS must be greater than zero");
        }
        if self.reconnect_delay.is_zero() {
            bail!("SENTINEL_RECONNECT_MS must be greater than zero");
        }
        Ok(())
    }

    /// Reconnect policy derived from the mode and delays
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        match self.reconnect_mode {
            ReconnectMode::Fixed => ReconnectPolicy::Fixed(self.reconnect_delay),
            ReconnectMode::Exponential => ReconnectPolicy::Exponential {
                base: self.reconnect_delay,
                max: self.reconnect_max_delay.max(self.reconnect_delay),
                jitter: 0.2,
            },
        }
    }
}

fn env_millis(key: &str) -> Option<Duration> {
    std::env::var(key)
        .ok()
        .and_then(|v| v.parse::<u64>().ok())
        .map(Duration::from_millis)
}

fn parse_reconnect_mode(value: &str) -> Result<ReconnectMode> {
    match value.to_lowercase().as_str() {
        "fixed" => Ok(ReconnectMode::Fixed),
        "exponential" | "backoff" => Ok(ReconnectMode::Exponential),
        other => bail!("Unknown SENTINEL_RECONNECT_MODE: {}", other),
    }
}

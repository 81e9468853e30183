use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::netstat::NetStatConfig;

/// Jitter seed used when the config does not set one.
pub const DEFAULT_RETRY_SEED: u64 = 0xDA7A;

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SupervisorConfigInput {
    pub retry: RetryConfigInput,
    pub session: SessionConfigInput,
    pub netstat: NetStatConfigInput,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct RetryConfigInput {
    pub default: Option<String>,
    pub secondary: Option<String>,
    pub seed: Option<u64>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct SessionConfigInput {
    pub pool_size: Option<usize>,
    pub apn_delay_ms: Option<u64>,
    pub context_poll_ms: Option<u64>,
    pub data_enabled_on_boot: Option<bool>,
    pub data_roaming: Option<bool>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct NetStatConfigInput {
    pub poll_ms: Option<u64>,
    pub screen_off_poll_ms: Option<u64>,
    pub stall_packet_threshold: Option<u64>,
    pub stall_poll_limit: Option<u32>,
    pub max_reset_count: Option<u32>,
}

/// Retry spec strings. `None` falls through to the built-in spec.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub default_spec: Option<String>,
    pub secondary_spec: Option<String>,
    pub seed: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            default_spec: None,
            secondary_spec: None,
            seed: DEFAULT_RETRY_SEED,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionConfig {
    pub pool_size: usize,
    /// Pause between trying consecutive waiting APNs.
    pub apn_delay: Duration,
    /// Active-context query period while connected.
    pub context_poll: Duration,
    /// Initial state of the default capability. Also decides whether setup
    /// may proceed before the network reports attach.
    pub data_enabled_on_boot: bool,
    pub data_roaming: bool,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            pool_size: 1,
            apn_delay: Duration::from_millis(5000),
            context_poll: Duration::from_millis(5000),
            data_enabled_on_boot: true,
            data_roaming: false,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SupervisorConfig {
    pub retry: RetryConfig,
    pub session: SessionConfig,
    pub netstat: NetStatConfig,
}

impl SupervisorConfigInput {
    pub fn resolve(self) -> Result<SupervisorConfig, ConfigError> {
        let session_defaults = SessionConfig::default();
        let netstat_defaults = NetStatConfig::default();

        let retry = RetryConfig {
            default_spec: non_empty(self.retry.default),
            secondary_spec: non_empty(self.retry.secondary),
            seed: self.retry.seed.unwrap_or(DEFAULT_RETRY_SEED),
        };

        let pool_size = self.session.pool_size.unwrap_or(session_defaults.pool_size);
        if pool_size == 0 {
            return Err(ConfigError::InvalidValue(
                "session.pool_size must be at least 1".into(),
            ));
        }
        let session = SessionConfig {
            pool_size,
            apn_delay: self
                .session
                .apn_delay_ms
                .map(Duration::from_millis)
                .unwrap_or(session_defaults.apn_delay),
            context_poll: positive_ms(
                "session.context_poll_ms",
                self.session.context_poll_ms,
                session_defaults.context_poll,
            )?,
            data_enabled_on_boot: self
                .session
                .data_enabled_on_boot
                .unwrap_or(session_defaults.data_enabled_on_boot),
            data_roaming: self
                .session
                .data_roaming
                .unwrap_or(session_defaults.data_roaming),
        };

        let stall_poll_limit = self
            .netstat
            .stall_poll_limit
            .unwrap_or(netstat_defaults.stall_poll_limit);
        if stall_poll_limit == 0 {
            return Err(ConfigError::InvalidValue(
                "netstat.stall_poll_limit must be at least 1".into(),
            ));
        }
        let netstat = NetStatConfig {
            poll: positive_ms("netstat.poll_ms", self.netstat.poll_ms, netstat_defaults.poll)?,
            screen_off_poll: positive_ms(
                "netstat.screen_off_poll_ms",
                self.netstat.screen_off_poll_ms,
                netstat_defaults.screen_off_poll,
            )?,
            stall_packet_threshold: self
                .netstat
                .stall_packet_threshold
                .unwrap_or(netstat_defaults.stall_packet_threshold)
                .max(1),
            stall_poll_limit,
            max_reset_count: self
                .netstat
                .max_reset_count
                .unwrap_or(netstat_defaults.max_reset_count),
        };

        Ok(SupervisorConfig {
            retry,
            session,
            netstat,
        })
    }
}

impl SupervisorConfig {
    pub fn from_toml_str(input: &str) -> Result<Self, ConfigError> {
        if input.trim().is_empty() {
            return Ok(SupervisorConfig::default());
        }
        let parsed: SupervisorConfigInput =
            toml::from_str(input).map_err(|e| ConfigError::Toml(e.to_string()))?;
        parsed.resolve()
    }
}

fn non_empty(value: Option<String>) -> Option<String> {
    value.filter(|v| !v.trim().is_empty())
}

fn positive_ms(key: &str, value: Option<u64>, default: Duration) -> Result<Duration, ConfigError> {
    match value {
        None => Ok(default),
        Some(0) => Err(ConfigError::InvalidValue(format!("{key} must be positive"))),
        Some(ms) => Ok(Duration::from_millis(ms)),
    }
}

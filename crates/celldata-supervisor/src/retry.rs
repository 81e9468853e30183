//! # Retry Policy
//!
//! Computes the delay before the next data-setup attempt from a declarative,
//! operator-supplied spec string:
//!
//! ```text
//!   max_retries=3, 5000, 5000, 5000
//!   default_randomization=2000, 5000, 10000, 80000:5000
//!   max_retries=infinite, 1000, 4000
//! ```
//!
//! Plain integers are delays in milliseconds, `delay:jitter` adds up to
//! `jitter` ms of uniform randomization to that entry, `default_randomization`
//! sets the jitter for entries that follow without one. When `max_retries`
//! is absent the cap equals the number of delays.
//!
//! Configuration goes through a three-level fallback chain
//! (primary → built-in → linear) that always leaves a usable policy.

use std::fmt;
use std::time::Duration;

use rand::rngs::StdRng;
use rand::{RngExt as _, SeedableRng};
use tracing::{debug, error, warn};

use crate::error::ConfigError;

/// Built-in spec for the default capability.
pub const DEFAULT_DATA_RETRY_CONFIG: &str = "default_randomization=2000,5000,10000,20000,40000,\
80000:5000,160000:5000,320000:5000,640000:5000,1280000:5000,1800000:5000";

/// Built-in spec for secondary capabilities (mms, supl, ...).
pub const SECONDARY_DATA_RETRY_CONFIG: &str = "max_retries=3, 5000, 5000, 5000";

/// Largest delay or jitter a spec entry may carry (one day).
pub const MAX_RETRY_DELAY_MS: u64 = 86_400_000;

/// Last-resort fixed sequence used when no spec string parses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LinearRetry {
    pub max_retries: u32,
    pub delay_ms: u64,
    pub jitter_ms: u64,
}

impl LinearRetry {
    pub const DEFAULT: LinearRetry = LinearRetry {
        max_retries: 20,
        delay_ms: 2000,
        jitter_ms: 1000,
    };

    pub const SECONDARY: LinearRetry = LinearRetry {
        max_retries: 3,
        delay_ms: 333,
        jitter_ms: 0,
    };
}

/// Which level of the fallback chain produced the active configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetrySource {
    Primary,
    BuiltIn,
    Linear,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct RetryEntry {
    delay_ms: u64,
    jitter_ms: u64,
}

/// Retry delay sequence with a monotonic attempt cursor.
pub struct RetryPolicy {
    entries: Vec<RetryEntry>,
    max_retries: u32,
    retry_forever: bool,
    forever_configured: bool,
    attempt: u32,
    rng: StdRng,
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("entries", &self.entries)
            .field("max_retries", &self.max_retries)
            .field("retry_forever", &self.retry_forever)
            .field("attempt", &self.attempt)
            .finish()
    }
}

impl RetryPolicy {
    /// Unconfigured policy: a single zero delay, no retries.
    pub fn new(seed: u64) -> Self {
        RetryPolicy {
            entries: vec![RetryEntry {
                delay_ms: 0,
                jitter_ms: 0,
            }],
            max_retries: 0,
            retry_forever: false,
            forever_configured: false,
            attempt: 0,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// Build a policy through the full fallback chain.
    pub fn from_chain(
        primary: Option<&str>,
        builtin: &str,
        linear: LinearRetry,
        seed: u64,
    ) -> (Self, RetrySource) {
        let mut policy = RetryPolicy::new(seed);
        let source = policy.configure_with_fallback(primary, builtin, linear);
        (policy, source)
    }

    /// Parse `spec` and replace the current configuration. On error the
    /// previous configuration is left untouched.
    pub fn configure(&mut self, spec: &str) -> Result<(), ConfigError> {
        let parsed = parse_spec(spec)?;
        self.entries = parsed.entries;
        self.max_retries = parsed.max_retries;
        self.retry_forever = parsed.retry_forever;
        self.forever_configured = parsed.retry_forever;
        self.attempt = 0;
        Ok(())
    }

    /// Fixed sequence: `max_retries` attempts of `delay_ms` + jitter.
    pub fn configure_linear(&mut self, linear: LinearRetry) {
        self.entries = vec![RetryEntry {
            delay_ms: linear.delay_ms,
            jitter_ms: linear.jitter_ms,
        }];
        self.max_retries = linear.max_retries;
        self.retry_forever = false;
        self.forever_configured = false;
        self.attempt = 0;
    }

    /// Try `primary`, then `builtin`, then the linear sequence.
    pub fn configure_with_fallback(
        &mut self,
        primary: Option<&str>,
        builtin: &str,
        linear: LinearRetry,
    ) -> RetrySource {
        if let Some(spec) = primary {
            match self.configure(spec) {
                Ok(()) => return RetrySource::Primary,
                Err(e) => warn!(spec, error = %e, "retry spec rejected, using built-in"),
            }
        }
        match self.configure(builtin) {
            Ok(()) => RetrySource::BuiltIn,
            Err(e) => {
                error!(spec = builtin, error = %e, "built-in retry spec rejected, using linear");
                self.configure_linear(linear);
                RetrySource::Linear
            }
        }
    }

    /// Delay before the next attempt. Past the end of the list the last
    /// entry repeats.
    pub fn next_delay(&mut self) -> Duration {
        let idx = (self.attempt as usize).min(self.entries.len().saturating_sub(1));
        let Some(entry) = self.entries.get(idx).copied() else {
            return Duration::ZERO;
        };
        let jitter = if entry.jitter_ms > 0 {
            self.rng.random_range(0..entry.jitter_ms)
        } else {
            0
        };
        Duration::from_millis(entry.delay_ms.saturating_add(jitter))
    }

    pub fn is_retry_needed(&self) -> bool {
        self.retry_forever || self.attempt < self.max_retries
    }

    /// Advance the cursor. Saturates at the cap so the last delay keeps
    /// being reused once the policy switches to unlimited mode.
    pub fn increase_attempt(&mut self) {
        self.attempt = (self.attempt + 1).min(self.max_retries);
        debug!(attempt = self.attempt, max = self.max_retries, "retry attempt advanced");
    }

    pub fn reset(&mut self) {
        self.attempt = 0;
    }

    /// Keep retrying indefinitely at the last configured delay.
    pub fn retry_forever_using_last_timeout(&mut self) {
        self.retry_forever = true;
    }

    /// Drop an unlimited mode entered at runtime; a spec that asked for
    /// `max_retries=infinite` stays unlimited.
    pub fn clear_retry_forever(&mut self) {
        self.retry_forever = self.forever_configured;
    }

    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    pub fn is_retry_forever(&self) -> bool {
        self.retry_forever
    }

    /// Configured base delays (without jitter), in order.
    pub fn delays(&self) -> Vec<Duration> {
        self.entries
            .iter()
            .map(|e| Duration::from_millis(e.delay_ms))
            .collect()
    }
}

struct ParsedSpec {
    entries: Vec<RetryEntry>,
    max_retries: u32,
    retry_forever: bool,
}

fn parse_spec(spec: &str) -> Result<ParsedSpec, ConfigError> {
    let spec = spec.trim().trim_matches('"').trim();
    if spec.is_empty() {
        return Err(ConfigError::EmptyRetrySpec);
    }

    let mut entries = Vec::new();
    let mut default_jitter = 0u64;
    let mut max_retries = None;
    let mut retry_forever = false;

    for raw in spec.split(',') {
        let item = raw.trim();
        if item.is_empty() {
            return Err(ConfigError::InvalidRetryEntry(raw.to_string()));
        }
        if let Some((key, value)) = item.split_once('=') {
            let value = value.trim();
            match key.trim() {
                "default_randomization" => default_jitter = parse_ms(value, item)?,
                "max_retries" => {
                    if value.eq_ignore_ascii_case("infinite") {
                        retry_forever = true;
                    } else {
                        max_retries = Some(
                            value
                                .parse::<u32>()
                                .map_err(|_| ConfigError::InvalidRetryEntry(item.to_string()))?,
                        );
                    }
                }
                other => return Err(ConfigError::UnknownRetryKey(other.to_string())),
            }
            continue;
        }
        let entry = match item.split_once(':') {
            Some((delay, jitter)) => RetryEntry {
                delay_ms: parse_ms(delay.trim(), item)?,
                jitter_ms: parse_ms(jitter.trim(), item)?,
            },
            None => RetryEntry {
                delay_ms: parse_ms(item, item)?,
                jitter_ms: default_jitter,
            },
        };
        entries.push(entry);
    }

    if entries.is_empty() {
        return Err(ConfigError::NoDelays);
    }
    let max_retries = max_retries.unwrap_or(entries.len() as u32);
    Ok(ParsedSpec {
        entries,
        max_retries,
        retry_forever,
    })
}

fn parse_ms(value: &str, item: &str) -> Result<u64, ConfigError> {
    let ms = value
        .parse::<u64>()
        .map_err(|_| ConfigError::InvalidRetryEntry(item.to_string()))?;
    if ms > MAX_RETRY_DELAY_MS {
        return Err(ConfigError::RetryDelayTooLarge {
            entry: item.to_string(),
            max_ms: MAX_RETRY_DELAY_MS,
        });
    }
    Ok(ms)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(spec: &str) -> RetryPolicy {
        let mut p = RetryPolicy::new(1);
        p.configure(spec).unwrap();
        p
    }

    // ─── Parsing ────────────────────────────────────────────────────────

    #[test]
    fn plain_delays_cap_at_list_length() {
        let p = policy("1000, 2000, 3000");
        assert_eq!(p.max_retries(), 3);
        assert_eq!(
            p.delays(),
            vec![
                Duration::from_millis(1000),
                Duration::from_millis(2000),
                Duration::from_millis(3000)
            ]
        );
    }

    #[test]
    fn explicit_max_retries_overrides_length() {
        let p = policy("max_retries=5, 500");
        assert_eq!(p.max_retries(), 5);
        assert_eq!(p.delays().len(), 1);
    }

    #[test]
    fn infinite_max_retries() {
        let p = policy("max_retries=infinite, 100, 200");
        assert!(p.is_retry_forever());
        assert!(p.is_retry_needed());
    }

    #[test]
    fn builtin_specs_parse() {
        let p = policy(DEFAULT_DATA_RETRY_CONFIG);
        assert_eq!(p.max_retries(), 11);
        let p = policy(SECONDARY_DATA_RETRY_CONFIG);
        assert_eq!(p.max_retries(), 3);
    }

    #[test]
    fn quoted_spec_is_accepted() {
        let p = policy("\"max_retries=2, 10, 20\"");
        assert_eq!(p.max_retries(), 2);
    }

    #[test]
    fn malformed_specs_are_rejected() {
        let mut p = RetryPolicy::new(1);
        assert_eq!(p.configure(""), Err(ConfigError::EmptyRetrySpec));
        assert_eq!(p.configure("max_retries=3"), Err(ConfigError::NoDelays));
        assert!(matches!(
            p.configure("1000, abc"),
            Err(ConfigError::InvalidRetryEntry(_))
        ));
        assert!(matches!(
            p.configure("backoff=2, 1000"),
            Err(ConfigError::UnknownRetryKey(_))
        ));
        assert!(matches!(
            p.configure("1000,,2000"),
            Err(ConfigError::InvalidRetryEntry(_))
        ));
        assert!(matches!(
            p.configure("-5"),
            Err(ConfigError::InvalidRetryEntry(_))
        ));
    }

    #[test]
    fn failed_configure_keeps_previous() {
        let mut p = policy("100, 200");
        assert!(p.configure("nonsense").is_err());
        assert_eq!(p.max_retries(), 2);
        assert_eq!(p.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn out_of_range_delays_are_rejected() {
        let mut p = policy("100");
        assert_eq!(
            p.configure("18446744073709551615:1000"),
            Err(ConfigError::RetryDelayTooLarge {
                entry: "18446744073709551615:1000".into(),
                max_ms: MAX_RETRY_DELAY_MS,
            })
        );
        assert!(matches!(
            p.configure("1000:86400001"),
            Err(ConfigError::RetryDelayTooLarge { .. })
        ));
        assert!(matches!(
            p.configure("default_randomization=99999999999, 1000"),
            Err(ConfigError::RetryDelayTooLarge { .. })
        ));
        assert_eq!(p.next_delay(), Duration::from_millis(100));

        let mut p = policy("86400000:86400000");
        assert!(p.next_delay() < Duration::from_millis(2 * MAX_RETRY_DELAY_MS));
    }

    #[test]
    fn oversized_primary_falls_back_to_builtin() {
        let (mut p, source) = RetryPolicy::from_chain(
            Some("max_retries=2, 18446744073709551615"),
            SECONDARY_DATA_RETRY_CONFIG,
            LinearRetry::SECONDARY,
            1,
        );
        assert_eq!(source, RetrySource::BuiltIn);
        assert_eq!(p.next_delay(), Duration::from_millis(5000));
    }

    // ─── Fallback Chain ─────────────────────────────────────────────────

    #[test]
    fn chain_uses_primary_when_valid() {
        let (p, source) = RetryPolicy::from_chain(
            Some("max_retries=2, 10, 20"),
            SECONDARY_DATA_RETRY_CONFIG,
            LinearRetry::SECONDARY,
            1,
        );
        assert_eq!(source, RetrySource::Primary);
        assert_eq!(p.max_retries(), 2);
    }

    #[test]
    fn chain_falls_back_to_builtin() {
        let (p, source) = RetryPolicy::from_chain(
            Some("garbage"),
            SECONDARY_DATA_RETRY_CONFIG,
            LinearRetry::SECONDARY,
            1,
        );
        assert_eq!(source, RetrySource::BuiltIn);
        assert_eq!(p.delays(), vec![Duration::from_millis(5000); 3]);

        let (_, source) =
            RetryPolicy::from_chain(None, DEFAULT_DATA_RETRY_CONFIG, LinearRetry::DEFAULT, 1);
        assert_eq!(source, RetrySource::BuiltIn);
    }

    #[test]
    fn chain_falls_back_to_linear() {
        let (mut p, source) =
            RetryPolicy::from_chain(Some("garbage"), "also garbage", LinearRetry::DEFAULT, 1);
        assert_eq!(source, RetrySource::Linear);
        assert_eq!(p.max_retries(), 20);
        for _ in 0..25 {
            let d = p.next_delay();
            assert!(d >= Duration::from_millis(2000) && d < Duration::from_millis(3000));
            p.increase_attempt();
        }
        assert!(!p.is_retry_needed());
    }

    // ─── Sequencing ─────────────────────────────────────────────────────

    #[test]
    fn bounded_policy_exhausts_after_cap() {
        let mut p = policy("max_retries=3, 100, 200, 300");
        let mut seen = Vec::new();
        while p.is_retry_needed() {
            seen.push(p.next_delay());
            p.increase_attempt();
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300)
            ]
        );
        assert_eq!(p.attempt(), 3);
    }

    #[test]
    fn unlimited_policy_clamps_to_last_delay() {
        let mut p = policy("max_retries=infinite, 100, 200, 300");
        let mut seen = Vec::new();
        for _ in 0..4 {
            seen.push(p.next_delay());
            p.increase_attempt();
        }
        assert_eq!(
            seen,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(300),
                Duration::from_millis(300)
            ]
        );
    }

    #[test]
    fn retry_forever_reuses_last_timeout() {
        let mut p = policy("max_retries=2, 1000, 4000");
        p.increase_attempt();
        p.increase_attempt();
        assert!(!p.is_retry_needed());

        p.retry_forever_using_last_timeout();
        for _ in 0..5 {
            assert!(p.is_retry_needed());
            assert_eq!(p.next_delay(), Duration::from_millis(4000));
            p.increase_attempt();
        }
        assert_eq!(p.attempt(), 2);
    }

    #[test]
    fn clearing_forever_restores_configured_mode() {
        let mut bounded = policy("max_retries=1, 10");
        bounded.retry_forever_using_last_timeout();
        bounded.clear_retry_forever();
        assert!(!bounded.is_retry_forever());

        let mut unlimited = policy("max_retries=infinite, 10");
        unlimited.clear_retry_forever();
        assert!(unlimited.is_retry_forever());
    }

    #[test]
    fn reset_returns_to_first_delay() {
        let mut p = policy("100, 200");
        p.increase_attempt();
        assert_eq!(p.next_delay(), Duration::from_millis(200));
        p.reset();
        assert_eq!(p.attempt(), 0);
        assert_eq!(p.next_delay(), Duration::from_millis(100));
    }

    #[test]
    fn jitter_stays_within_bounds() {
        let mut p = policy("default_randomization=50, 100, 200:10");
        for _ in 0..50 {
            let d = p.next_delay();
            assert!(d >= Duration::from_millis(100) && d < Duration::from_millis(150));
        }
        p.increase_attempt();
        for _ in 0..50 {
            let d = p.next_delay();
            assert!(d >= Duration::from_millis(200) && d < Duration::from_millis(210));
        }
    }

    #[test]
    fn unconfigured_policy_never_retries() {
        let mut p = RetryPolicy::new(0);
        assert!(!p.is_retry_needed());
        assert_eq!(p.next_delay(), Duration::ZERO);
    }
}

//! Channel timing and retry policy.
//!
//! Timeouts are policy, not protocol constants. Defaults can be overridden
//! from `PCN_*` environment variables.

use std::env;
use std::time::Duration;
use tracing::warn;

/// Adapter retry policy.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts per adapter call, including the first.
    pub max_attempts: u32,
    /// Pause between attempts.
    pub backoff: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: Duration::from_millis(500),
        }
    }
}

/// Channel lifecycle configuration
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ChannelConfig {
    /// Window for the counterparty to confirm a new MSContract
    pub confirmation_timeout: Duration,
    /// Window for the counterparty to counter-sign a VPC proposal
    pub negotiation_timeout: Duration,
    /// Window for the counterparty to answer a close or dispute
    pub response_timeout: Duration,
    /// Window for the counterparty to answer a state proposal
    pub proposal_timeout: Duration,
    /// Supervisor tick
    pub supervisor_interval: Duration,
    /// Supervisor executes expired closes itself
    pub auto_fallback: bool,
    /// Adapter retry policy
    pub adapter_retry: RetryPolicy,
    /// Live queue size per subscriber
    pub subscriber_buffer: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            confirmation_timeout: Duration::from_secs(3600),
            negotiation_timeout: Duration::from_secs(600),
            response_timeout: Duration::from_secs(3600),
            proposal_timeout: Duration::from_secs(120),
            supervisor_interval: Duration::from_secs(1),
            auto_fallback: true,
            adapter_retry: RetryPolicy::default(),
            subscriber_buffer: 256,
        }
    }
}

impl ChannelConfig {
    /// Create configuration from environment variables.
    ///
    /// # Environment Variables
    ///
    /// - `PCN_CONFIRMATION_TIMEOUT_SECS` (default: 3600)
    /// - `PCN_NEGOTIATION_TIMEOUT_SECS` (default: 600)
    /// - `PCN_RESPONSE_TIMEOUT_SECS` (default: 3600)
    /// - `PCN_PROPOSAL_TIMEOUT_SECS` (default: 120)
    /// - `PCN_SUPERVISOR_INTERVAL_MS` (default: 1000)
    /// - `PCN_AUTO_FALLBACK` (default: true)
    /// - `PCN_ADAPTER_MAX_ATTEMPTS` (default: 3)
    /// - `PCN_ADAPTER_BACKOFF_MS` (default: 500)
    /// - `PCN_SUBSCRIBER_BUFFER` (default: 256)
    ///
    /// Unparseable values keep the default and log a warning.
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            confirmation_timeout: env_secs(
                "PCN_CONFIRMATION_TIMEOUT_SECS",
                defaults.confirmation_timeout,
            ),
            negotiation_timeout: env_secs(
                "PCN_NEGOTIATION_TIMEOUT_SECS",
                defaults.negotiation_timeout,
            ),
            response_timeout: env_secs("PCN_RESPONSE_TIMEOUT_SECS", defaults.response_timeout),
            proposal_timeout: env_secs("PCN_PROPOSAL_TIMEOUT_SECS", defaults.proposal_timeout),
            supervisor_interval: env_parse("PCN_SUPERVISOR_INTERVAL_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.supervisor_interval),
            auto_fallback: env::var("PCN_AUTO_FALLBACK")
                .map(|v| !(v.eq_ignore_ascii_case("false") || v == "0"))
                .unwrap_or(defaults.auto_fallback),
            adapter_retry: RetryPolicy {
                max_attempts: env_parse("PCN_ADAPTER_MAX_ATTEMPTS")
                    .map(|n: u32| n.max(1))
                    .unwrap_or(defaults.adapter_retry.max_attempts),
                backoff: env_parse("PCN_ADAPTER_BACKOFF_MS")
                    .map(Duration::from_millis)
                    .unwrap_or(defaults.adapter_retry.backoff),
            },
            subscriber_buffer: env_parse("PCN_SUBSCRIBER_BUFFER")
                .unwrap_or(defaults.subscriber_buffer),
        }
    }

    /// Tight timings with no retry pauses, for tests.
    pub fn for_testing() -> Self {
        Self {
            supervisor_interval: Duration::from_millis(10),
            adapter_retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::ZERO,
            },
            ..Self::default()
        }
    }
}

fn env_secs(key: &str, default: Duration) -> Duration {
    env_parse(key).map(Duration::from_secs).unwrap_or(default)
}

fn env_parse<V: std::str::FromStr>(key: &str) -> Option<V> {
    let raw = env::var(key).ok()?;
    match raw.trim().parse() {
        Ok(v) => Some(v),
        Err(_) => {
            warn!(key, value = %raw, "Ignoring unparseable configuration value");
            None
        }
    }
}

/// Milliseconds in a duration, saturating at `u64::MAX`.
pub(crate) fn millis(d: Duration) -> u64 {
    u64::try_from(d.as_millis()).unwrap_or(u64::MAX)
}

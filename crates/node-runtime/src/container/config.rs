//! # Node Configuration
//!
//! Unified configuration for the channel core, logging and the node's
//! on-chain identities.
//!
//! ## Security Requirements
//!
//! - `PCN_SIGNING_KEY` is read once and never logged
//! - A malformed address or key aborts startup instead of falling back

use std::env;

use channel_core::{ChannelConfig, NodeSettings};
use channel_telemetry::TelemetryConfig;
use shared_types::Address;
use thiserror::Error;

/// Complete node configuration.
#[derive(Clone, Default)]
pub struct NodeConfig {
    /// Channel lifecycle timings and retry policy.
    pub channel: ChannelConfig,
    /// Logging configuration.
    pub telemetry: TelemetryConfig,
    /// Own, LibSig and VPC contract addresses.
    pub settings: NodeSettings,
    /// secp256k1 secret for the own address.
    pub signing_key: Option<[u8; 32]>,
}

impl std::fmt::Debug for NodeConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeConfig")
            .field("channel", &self.channel)
            .field("telemetry", &self.telemetry)
            .field("settings", &self.settings)
            .field("signing_key", &self.signing_key.map(|_| "<redacted>"))
            .finish()
    }
}

impl NodeConfig {
    /// Load configuration from the environment.
    ///
    /// # Environment Variables
    ///
    /// - `PCN_OWN_ADDRESS`: hex address whose event log the node streams
    /// - `PCN_LIBSIG_ADDRESS`: signature library contract
    /// - `PCN_VPC_ADDRESS`: VPC contract (VPC registration and closing need it)
    /// - `PCN_SIGNING_KEY`: 32-byte hex secret for the own address
    ///
    /// Timing variables are read by [`ChannelConfig::from_env`], logging
    /// variables by [`TelemetryConfig::from_env`].
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| env::var(name).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Result<Self, ConfigError> {
        let address = |name: &'static str| -> Result<Option<Address>, ConfigError> {
            lookup(name)
                .map(|value| {
                    value.parse::<Address>().map_err(|_| ConfigError::InvalidAddress {
                        variable: name,
                        value,
                    })
                })
                .transpose()
        };

        let settings = NodeSettings {
            own_address: address("PCN_OWN_ADDRESS")?,
            lib_sig_address: address("PCN_LIBSIG_ADDRESS")?,
            vpc_address: address("PCN_VPC_ADDRESS")?,
        };
        let signing_key = lookup("PCN_SIGNING_KEY")
            .map(|value| parse_secret(&value))
            .transpose()?;

        Ok(Self {
            channel: ChannelConfig::from_env(),
            telemetry: TelemetryConfig::from_env(),
            settings,
            signing_key,
        })
    }
}

fn parse_secret(value: &str) -> Result<[u8; 32], ConfigError> {
    let digits = value.trim().strip_prefix("0x").unwrap_or(value.trim());
    let bytes = hex::decode(digits).map_err(|_| ConfigError::InvalidSigningKey)?;
    bytes
        .as_slice()
        .try_into()
        .map_err(|_| ConfigError::InvalidSigningKey)
}

/// Configuration errors.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    /// Address variable is not 20 hex bytes.
    #[error("{variable} is not a valid address: {value}")]
    InvalidAddress {
        /// Environment variable name.
        variable: &'static str,
        /// Rejected value.
        value: String,
    },

    /// Signing key is not 32 hex bytes. The value is withheld.
    #[error("PCN_SIGNING_KEY must be 32 bytes (64 hex chars)")]
    InvalidSigningKey,

    /// Signing key does not belong to the configured own address.
    #[error("PCN_SIGNING_KEY belongs to {derived}, not PCN_OWN_ADDRESS {configured}")]
    SigningKeyMismatch {
        /// `PCN_OWN_ADDRESS`.
        configured: Address,
        /// Address of the signing key.
        derived: Address,
    },

    /// Signing key is not a valid secp256k1 scalar.
    #[error("PCN_SIGNING_KEY rejected: {0}")]
    KeyRejected(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let vars: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |name| vars.get(name).cloned()
    }

    #[test]
    fn test_empty_environment() {
        let config = NodeConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.settings, NodeSettings::default());
        assert!(config.signing_key.is_none());
    }

    #[test]
    fn test_addresses_parsed() {
        let config = NodeConfig::from_lookup(lookup(&[
            ("PCN_OWN_ADDRESS", "0xaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa"),
            ("PCN_VPC_ADDRESS", "2222222222222222222222222222222222222222"),
        ]))
        .unwrap();
        assert_eq!(config.settings.own_address, Some(Address::new([0xaa; 20])));
        assert_eq!(config.settings.vpc_address, Some(Address::new([0x22; 20])));
        assert!(config.settings.lib_sig_address.is_none());
    }

    #[test]
    fn test_bad_address_rejected() {
        let err = NodeConfig::from_lookup(lookup(&[("PCN_LIBSIG_ADDRESS", "0x1234")])).unwrap_err();
        assert!(matches!(
            err,
            ConfigError::InvalidAddress {
                variable: "PCN_LIBSIG_ADDRESS",
                ..
            }
        ));
    }

    #[test]
    fn test_signing_key() {
        let key = "0x".to_string() + &"01".repeat(32);
        let config = NodeConfig::from_lookup(lookup(&[("PCN_SIGNING_KEY", &key)])).unwrap();
        assert_eq!(config.signing_key, Some([1u8; 32]));

        assert_eq!(
            NodeConfig::from_lookup(lookup(&[("PCN_SIGNING_KEY", "abcd")])).unwrap_err(),
            ConfigError::InvalidSigningKey
        );
    }

    #[test]
    fn test_debug_redacts_key() {
        let config = NodeConfig {
            signing_key: Some([0x42; 32]),
            ..NodeConfig::default()
        };
        let rendered = format!("{config:?}");
        assert!(rendered.contains("<redacted>"));
        assert!(!rendered.contains("66, 66"));
    }
}

//! # Outbound Ports
//!
//! Traits for external dependencies: the chain, the clock and key custody.

use async_trait::async_trait;
use shared_crypto::Hash;
use shared_types::{Address, ChannelId, ChannelState, Signature, Timestamp};
use thiserror::Error;

/// Errors reported by a blockchain adapter.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AdapterError {
    /// The transaction was rejected on chain.
    #[error("Transaction reverted: {reason}")]
    Reverted { reason: String },

    /// The chain endpoint could not be reached.
    #[error("Chain unavailable: {0}")]
    Unavailable(String),

    /// A higher version is already registered.
    #[error("Stale version {submitted}, chain holds {onchain}")]
    StaleVersion { submitted: u64, onchain: u64 },
}

/// Receipt of an included transaction.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TxReceipt {
    /// Transaction hash.
    pub tx_hash: Hash,
    /// Channel the transaction acted on.
    pub channel_id: ChannelId,
    /// Version of the submitted state, if any.
    pub version: Option<u64>,
}

/// Blockchain adapter - outbound port.
///
/// Every call is idempotent under retry by channel id and version.
#[async_trait]
pub trait BlockchainAdapter: Send + Sync {
    /// Register a state on chain.
    async fn register_state(
        &self,
        channel_id: ChannelId,
        state: &ChannelState,
    ) -> Result<TxReceipt, AdapterError>;

    /// Submit a close, optionally with the state to close on.
    async fn close_channel(
        &self,
        channel_id: ChannelId,
        state: Option<&ChannelState>,
    ) -> Result<TxReceipt, AdapterError>;

    /// Settle a closed channel.
    async fn execute_settle(&self, channel_id: ChannelId) -> Result<TxReceipt, AdapterError>;

    /// Return funds of an unconfirmed channel.
    async fn refund(&self, channel_id: ChannelId) -> Result<TxReceipt, AdapterError>;
}

/// Time source trait for testability
pub trait TimeSource: Send + Sync {
    /// Current time in milliseconds since the Unix epoch.
    fn now(&self) -> Timestamp;
}

/// System time implementation
#[derive(Clone, Copy, Debug, Default)]
pub struct SystemTimeSource;

impl TimeSource for SystemTimeSource {
    fn now(&self) -> Timestamp {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .map(|d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
            // Clock before Unix epoch - return 0 rather than panic
            .unwrap_or(0)
    }
}

/// Errors from a state signer.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SignerError {
    /// No key held for the address.
    #[error("No signing key for {0}")]
    UnknownAddress(Address),

    /// The key failed to sign.
    #[error("Signing failed: {0}")]
    Failed(String),
}

/// Key custody - outbound port.
///
/// Signs state digests on behalf of locally held addresses.
pub trait StateSigner: Send + Sync {
    /// Sign a 32-byte digest as `address`.
    fn sign_digest(&self, address: &Address, digest: &Hash) -> Result<Signature, SignerError>;

    /// Whether a key for `address` is held.
    fn holds(&self, address: &Address) -> bool;
}

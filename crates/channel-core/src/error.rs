//! Error types for the channel lifecycle core.
//!
//! Validation errors never mutate state. Timing errors are recoverable
//! through the fallback paths. `AdapterFailure` is terminal for the call
//! and is also reported to both participants through the event log.

use shared_types::{Amount, ChannelId, Timestamp};
use thiserror::Error;

/// Channel lifecycle errors
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ChannelError {
    /// Unknown channel id
    #[error("Channel not found: {channel_id}")]
    NotFound { channel_id: ChannelId },

    /// Operation not valid in the current lifecycle state
    #[error("Invalid state for {operation}: {reason}")]
    InvalidState {
        operation: &'static str,
        reason: String,
    },

    /// Proposal version is not current + 1
    #[error("Version conflict: expected {expected}, got {actual}")]
    VersionConflict { expected: u64, actual: u64 },

    /// Cryptographic verification failed
    #[error("Invalid signature: {reason}")]
    SignatureInvalid { reason: String },

    /// Counter-signed payload differs from the proposed one
    #[error("Signed payload does not match the proposal")]
    SignatureMismatch,

    /// Another proposal is outstanding on this channel
    #[error("Proposal in flight on {channel_id} (version {version})")]
    ProposalInFlight { channel_id: ChannelId, version: u64 },

    /// An on-chain call for this channel has not returned yet
    #[error("Chain call {operation} in flight on {channel_id}")]
    ChainCallInFlight {
        channel_id: ChannelId,
        operation: &'static str,
    },

    /// Called after the deadline
    #[error("Deadline exceeded: deadline {deadline}, now {now}")]
    DeadlineExceeded { deadline: Timestamp, now: Timestamp },

    /// Called before the deadline
    #[error("Too early: deadline {deadline}, now {now}")]
    TooEarly { deadline: Timestamp, now: Timestamp },

    /// Counterparty rejected the proposal
    #[error("Proposal declined: {reason}")]
    Declined { reason: String },

    /// On-chain call failed after every retry
    #[error("Adapter failure in {operation}: {reason}")]
    AdapterFailure {
        operation: &'static str,
        reason: String,
    },

    /// Blocked amounts would exceed the parent's committed funds
    #[error("Funds exceeded: requested {requested}, available {available}")]
    FundsExceeded { requested: Amount, available: Amount },

    /// MSContract already confirmed
    #[error("Channel already confirmed: {channel_id}")]
    AlreadyConfirmed { channel_id: ChannelId },

    /// Id already present in the registry
    #[error("Channel already exists: {channel_id}")]
    AlreadyExists { channel_id: ChannelId },

    /// A required node setting is missing
    #[error("Not configured: {setting}")]
    NotConfigured { setting: &'static str },
}

impl ChannelError {
    /// Synchronous validation error; the channel was not touched.
    pub fn is_validation(&self) -> bool {
        matches!(
            self,
            Self::NotFound { .. }
                | Self::InvalidState { .. }
                | Self::VersionConflict { .. }
                | Self::SignatureInvalid { .. }
                | Self::SignatureMismatch
                | Self::ProposalInFlight { .. }
                | Self::ChainCallInFlight { .. }
                | Self::FundsExceeded { .. }
                | Self::AlreadyConfirmed { .. }
                | Self::AlreadyExists { .. }
                | Self::NotConfigured { .. }
        )
    }

    /// Timing error, recoverable through a fallback.
    pub fn is_timing(&self) -> bool {
        matches!(self, Self::DeadlineExceeded { .. } | Self::TooEarly { .. })
    }

    pub(crate) fn invalid_state(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            operation,
            reason: reason.into(),
        }
    }

    pub(crate) fn signature(reason: impl Into<String>) -> Self {
        Self::SignatureInvalid {
            reason: reason.into(),
        }
    }
}

/// Result type for channel operations
pub type ChannelResult<T> = Result<T, ChannelError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_classes() {
        assert!(ChannelError::SignatureMismatch.is_validation());
        assert!(ChannelError::TooEarly {
            deadline: 10,
            now: 5
        }
        .is_timing());
        assert!(!ChannelError::Declined {
            reason: "no".into()
        }
        .is_validation());
    }

    #[test]
    fn test_version_conflict_message() {
        let err = ChannelError::VersionConflict {
            expected: 3,
            actual: 5,
        };
        assert!(err.to_string().contains("expected 3, got 5"));
    }
}

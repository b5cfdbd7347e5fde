//! # Channel Events
//!
//! Entries of the per-address event log. Every entry carries a snapshot of
//! the channel taken at the moment the transition was committed.

use serde::{Deserialize, Serialize};
use shared_types::{Address, Channel, ChannelId, DeadlineKind, Timestamp};

/// What happened to a channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EventKind {
    // =========================================================================
    // MSCONTRACT LIFECYCLE
    // =========================================================================
    /// Channel inserted in the registry.
    Created,
    /// Counterparty confirmed and funded an MSContract.
    Confirmed,
    /// Funds returned after a missed confirmation.
    Refunded,
    /// MSContract settled on chain.
    Closed,

    // =========================================================================
    // STATE UPDATE HANDSHAKE
    // =========================================================================
    /// A proposer-signed state awaits the recipient's response.
    StateProposed,
    /// A new state was confirmed by both participants.
    StateUpdated,
    /// The counterparty declined the outstanding proposal.
    ProposalDeclined {
        /// Reason given by the decliner.
        reason: String,
    },
    /// The outstanding proposal was discarded unanswered.
    ProposalExpired,

    // =========================================================================
    // VPC LIFECYCLE
    // =========================================================================
    /// Initial VPC state signed by both participants.
    Negotiated,
    /// VPC state submitted to chain.
    Registered,
    /// VPC ready for payments.
    Activated,
    /// Close submitted to chain (either layer).
    Closing,
    /// VPC settled and released from its parent.
    Settled,
    /// VPC negotiation expired.
    Abandoned,

    // =========================================================================
    // SUPERVISION
    // =========================================================================
    /// A lifecycle deadline passed and a fallback is now callable.
    DeadlineExpired {
        /// Which phase expired.
        deadline: DeadlineKind,
    },
    /// An on-chain operation failed after every retry.
    Failed {
        /// Adapter operation name.
        operation: String,
        /// Last error reported by the adapter.
        reason: String,
    },
}

impl EventKind {
    /// Whether this entry belongs to the propose/respond handshake.
    ///
    /// Such entries are addressed to one side only.
    #[must_use]
    pub fn is_proposal(&self) -> bool {
        matches!(self, Self::StateProposed)
    }

    /// Short name for logs.
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Created => "created",
            Self::Confirmed => "confirmed",
            Self::Refunded => "refunded",
            Self::Closed => "closed",
            Self::StateProposed => "state_proposed",
            Self::StateUpdated => "state_updated",
            Self::ProposalDeclined { .. } => "proposal_declined",
            Self::ProposalExpired => "proposal_expired",
            Self::Negotiated => "negotiated",
            Self::Registered => "registered",
            Self::Activated => "activated",
            Self::Closing => "closing",
            Self::Settled => "settled",
            Self::Abandoned => "abandoned",
            Self::DeadlineExpired { .. } => "deadline_expired",
            Self::Failed { .. } => "failed",
        }
    }
}

/// One entry of an address's event log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelEvent {
    /// Dispatcher-wide sequence number, strictly increasing in commit order.
    pub seq: u64,
    /// Address whose log holds this entry.
    pub recipient: Address,
    /// What happened.
    pub kind: EventKind,
    /// Channel snapshot after the transition.
    pub channel: Channel,
    /// When the entry was appended.
    pub recorded_at: Timestamp,
}

impl ChannelEvent {
    /// Channel this entry is about.
    #[must_use]
    pub fn channel_id(&self) -> ChannelId {
        self.channel.id
    }
}

/// Selects which entries of a log a subscription receives.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EventFilter {
    /// Restrict to one channel. `None` means every channel.
    pub channel: Option<ChannelId>,
}

impl EventFilter {
    /// Every entry in the log.
    #[must_use]
    pub fn all() -> Self {
        Self { channel: None }
    }

    /// Entries of a single channel.
    #[must_use]
    pub fn channel(id: ChannelId) -> Self {
        Self { channel: Some(id) }
    }

    /// Check if an entry passes the filter.
    #[must_use]
    pub fn matches(&self, event: &ChannelEvent) -> bool {
        self.channel.map_or(true, |id| event.channel.id == id)
    }
}

//! # Channel Entities
//!
//! Channel states, lifecycle statuses and the `Channel` record kept in the
//! registry.
//!
//! ## Lifecycles
//!
//! ```text
//! MSContract:  PendingConfirm ──→ Open ──→ Closing ──→ Closed
//!                    │
//!                    └──→ Refunded
//!
//! VPC:         Proposed ──→ Negotiated ──→ Registered ──→ Active ──→ Closing ──→ Settled
//!                 │  │                         ↑
//!                 │  └────── (finalize) ───────┘
//!                 └──→ Abandoned
//! ```

use crate::entities::{Amount, Balances, ChannelId, Participants, Party, Signature, Timestamp};
use serde::{Deserialize, Serialize};
use std::fmt;

// =============================================================================
// SIGNED STATE
// =============================================================================

/// Signature slots of a channel state.
///
/// A proposal carries exactly one signature, which also identifies the
/// proposer. A confirmed state carries both.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateSignatures {
    /// No signature yet.
    Unsigned,
    /// Signed only by the proposing party.
    SignedByProposer {
        /// Who signed.
        proposer: Party,
        /// The proposer's signature.
        signature: Signature,
    },
    /// Signed by both parties.
    SignedByBoth {
        /// Participant A's signature.
        a: Signature,
        /// Participant B's signature.
        b: Signature,
    },
}

impl StateSignatures {
    /// Signature in the slot of `party`, if filled.
    pub fn signature_of(&self, party: Party) -> Option<&Signature> {
        match (self, party) {
            (Self::Unsigned, _) => None,
            (Self::SignedByProposer { proposer, signature }, p) if *proposer == p => {
                Some(signature)
            }
            (Self::SignedByProposer { .. }, _) => None,
            (Self::SignedByBoth { a, .. }, Party::A) => Some(a),
            (Self::SignedByBoth { b, .. }, Party::B) => Some(b),
        }
    }

    /// The proposer, for single-signed states.
    pub fn proposer(&self) -> Option<Party> {
        match self {
            Self::SignedByProposer { proposer, .. } => Some(*proposer),
            _ => None,
        }
    }

    /// Whether both slots are filled.
    pub fn is_fully_signed(&self) -> bool {
        matches!(self, Self::SignedByBoth { .. })
    }
}

/// A versioned channel state.
///
/// The signed payload is `(channel_id, version, balances)`; `signatures`
/// is never part of it.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelState {
    /// Channel this state belongs to.
    pub channel_id: ChannelId,
    /// Monotonically increasing version.
    pub version: u64,
    /// Balances (MSContract) or blocked amounts (VPC) per participant.
    pub balances: Balances,
    /// Signature slots.
    pub signatures: StateSignatures,
}

impl ChannelState {
    /// Create an unsigned state.
    pub fn unsigned(channel_id: ChannelId, version: u64, balances: Balances) -> Self {
        Self {
            channel_id,
            version,
            balances,
            signatures: StateSignatures::Unsigned,
        }
    }

    /// Same state with the given signatures.
    pub fn with_signatures(mut self, signatures: StateSignatures) -> Self {
        self.signatures = signatures;
        self
    }

    /// Whether two states sign the identical payload.
    pub fn same_payload(&self, other: &ChannelState) -> bool {
        self.channel_id == other.channel_id
            && self.version == other.version
            && self.balances == other.balances
    }
}

// =============================================================================
// LIFECYCLE STATUSES
// =============================================================================

/// Channel layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelKind {
    /// Bilateral on-chain root channel.
    MsContract,
    /// Virtual payment channel nested under an MSContract.
    Vpc,
}

/// MSContract state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MsContractStatus {
    /// Created, waiting for the counterparty to confirm.
    #[default]
    PendingConfirm,
    /// Confirmed and funded.
    Open,
    /// Close submitted, waiting for acknowledgement or deadline.
    Closing,
    /// Funds returned after a missed confirmation.
    Refunded,
    /// Settled on chain.
    Closed,
}

impl MsContractStatus {
    /// Check if transition is valid.
    pub fn can_transition_to(&self, next: MsContractStatus) -> bool {
        matches!(
            (self, next),
            (Self::PendingConfirm, Self::Open)
                | (Self::PendingConfirm, Self::Refunded)
                | (Self::Open, Self::Closing)
                | (Self::Closing, Self::Closed)
        )
    }

    /// Check if terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Refunded | Self::Closed)
    }
}

/// VPC state machine.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VpcStatus {
    /// Initial state proposed and self-signed.
    #[default]
    Proposed,
    /// Initial state signed by both.
    Negotiated,
    /// Submitted to chain.
    Registered,
    /// Registration included on chain; payments allowed.
    Active,
    /// Close submitted.
    Closing,
    /// Settled on chain and released from the parent.
    Settled,
    /// Negotiation deadline expired before confirmation.
    Abandoned,
}

impl VpcStatus {
    /// Check if transition is valid.
    pub fn can_transition_to(&self, next: VpcStatus) -> bool {
        matches!(
            (self, next),
            (Self::Proposed, Self::Negotiated)
                | (Self::Proposed, Self::Abandoned)
                | (Self::Proposed, Self::Registered)
                | (Self::Negotiated, Self::Registered)
                | (Self::Registered, Self::Active)
                | (Self::Active, Self::Closing)
                | (Self::Closing, Self::Settled)
        )
    }

    /// Check if terminal state.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Settled | Self::Abandoned)
    }
}

/// Status of a channel in either layer.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelStatus {
    /// Root channel status.
    MsContract(MsContractStatus),
    /// Virtual channel status.
    Vpc(VpcStatus),
}

impl ChannelStatus {
    /// Layer of the channel.
    pub fn kind(&self) -> ChannelKind {
        match self {
            Self::MsContract(_) => ChannelKind::MsContract,
            Self::Vpc(_) => ChannelKind::Vpc,
        }
    }

    /// Check if terminal state.
    pub fn is_terminal(&self) -> bool {
        match self {
            Self::MsContract(s) => s.is_terminal(),
            Self::Vpc(s) => s.is_terminal(),
        }
    }

    /// Whether state updates may be proposed in this status.
    pub fn accepts_updates(&self) -> bool {
        matches!(
            self,
            Self::MsContract(MsContractStatus::Open) | Self::Vpc(VpcStatus::Active)
        )
    }
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::MsContract(s) => write!(f, "MsContract::{:?}", s),
            Self::Vpc(s) => write!(f, "Vpc::{:?}", s),
        }
    }
}

// =============================================================================
// DEADLINES & PROPOSALS
// =============================================================================

/// Lifecycle phase a deadline guards.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum DeadlineKind {
    /// Counterparty must confirm an MSContract.
    Confirmation,
    /// Counterparty must counter-sign a VPC proposal.
    Negotiation,
    /// Counterparty must answer a close / dispute.
    Response,
}

/// Wall-clock deadline attached to the current lifecycle phase.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Deadline {
    /// Which phase this deadline guards.
    pub kind: DeadlineKind,
    /// Expiry time.
    pub at: Timestamp,
    /// Set once the expiry has been announced to the participants.
    pub announced: bool,
}

impl Deadline {
    /// Arm a new deadline.
    pub fn new(kind: DeadlineKind, at: Timestamp) -> Self {
        Self {
            kind,
            at,
            announced: false,
        }
    }

    /// Check if the deadline has passed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.at
    }
}

/// A not-yet-confirmed state awaiting the counterparty.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingProposal {
    /// Proposed state, signed by the proposer only.
    pub state: ChannelState,
    /// Who proposed it.
    pub proposer: Party,
    /// Response deadline.
    pub deadline: Timestamp,
}

impl PendingProposal {
    /// Check if the response window has closed.
    pub fn is_expired(&self, now: Timestamp) -> bool {
        now > self.deadline
    }
}

/// How a VPC close was initiated.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum CloseKind {
    /// Both parties agree on the latest state; settles immediately.
    Mutual,
    /// A different version was submitted; settles after the response window.
    Dispute,
}

/// Funds accounting of a channel.
///
/// For an MSContract, `committed` is the on-chain deposit and `blocked` the
/// sum of amounts locked by its VPC children. For a VPC, `committed` is the
/// total it blocks in its parent and `blocked` stays zero.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Funds {
    /// Funds committed to the channel.
    pub committed: Amount,
    /// Funds locked by nested channels.
    pub blocked: Amount,
}

impl Funds {
    /// Funds still free to block.
    pub fn available(&self) -> Amount {
        self.committed.saturating_sub(self.blocked)
    }
}

// =============================================================================
// CHANNEL
// =============================================================================

/// A channel as held in the registry.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Channel {
    /// Registry key (a VPC uses its Sid).
    pub id: ChannelId,
    /// Lifecycle status; also determines the kind.
    pub status: ChannelStatus,
    /// The two participants.
    pub participants: Participants,
    /// Latest state signed by both participants.
    pub current_state: Option<ChannelState>,
    /// Last state submitted to chain. May carry a single signature when
    /// registration was forced after a missed negotiation deadline.
    pub onchain_state: Option<ChannelState>,
    /// Outstanding proposal, at most one.
    pub pending_proposal: Option<PendingProposal>,
    /// Parent MSContract of a VPC.
    pub parent: Option<ChannelId>,
    /// Active deadline of the current phase.
    pub deadline: Option<Deadline>,
    /// Funds accounting.
    pub funds: Funds,
    /// Set when a VPC enters `Closing`.
    pub close_kind: Option<CloseKind>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Time of the last committed mutation.
    pub updated_at: Timestamp,
}

impl Channel {
    /// New MSContract in `PendingConfirm`.
    pub fn new_ms_contract(
        id: ChannelId,
        participants: Participants,
        now: Timestamp,
        confirm_by: Timestamp,
    ) -> Self {
        Self {
            id,
            status: ChannelStatus::MsContract(MsContractStatus::PendingConfirm),
            participants,
            current_state: None,
            onchain_state: None,
            pending_proposal: None,
            parent: None,
            deadline: Some(Deadline::new(DeadlineKind::Confirmation, confirm_by)),
            funds: Funds::default(),
            close_kind: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// New VPC in `Proposed`, nested under `parent`.
    pub fn new_vpc(
        id: ChannelId,
        parent: ChannelId,
        participants: Participants,
        proposal: PendingProposal,
        blocked: Amount,
        now: Timestamp,
    ) -> Self {
        let negotiate_by = proposal.deadline;
        Self {
            id,
            status: ChannelStatus::Vpc(VpcStatus::Proposed),
            participants,
            current_state: None,
            onchain_state: None,
            pending_proposal: Some(proposal),
            parent: Some(parent),
            deadline: Some(Deadline::new(DeadlineKind::Negotiation, negotiate_by)),
            funds: Funds {
                committed: blocked,
                blocked: Amount::zero(),
            },
            close_kind: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Layer of the channel.
    pub fn kind(&self) -> ChannelKind {
        self.status.kind()
    }

    /// Version of the latest confirmed state.
    pub fn current_version(&self) -> Option<u64> {
        self.current_state.as_ref().map(|s| s.version)
    }

    /// Version the next proposal must carry.
    ///
    /// One past the highest of the confirmed and the on-chain state, or 0
    /// when neither exists.
    pub fn next_version(&self) -> u64 {
        let onchain = self.onchain_state.as_ref().map(|s| s.version);
        self.current_version()
            .max(onchain)
            .map_or(0, |v| v.saturating_add(1))
    }

    /// Whether this is a VPC nested under `parent` that has not settled.
    pub fn is_active_child_of(&self, parent: &ChannelId) -> bool {
        self.parent.as_ref() == Some(parent) && !self.status.is_terminal()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::entities::{Address, U256};

    fn participants() -> Participants {
        Participants::new(Address::new([1u8; 20]), Address::new([2u8; 20]))
    }

    #[test]
    fn test_ms_contract_transitions() {
        use MsContractStatus::*;
        assert!(PendingConfirm.can_transition_to(Open));
        assert!(PendingConfirm.can_transition_to(Refunded));
        assert!(Open.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Closed));
        assert!(!Open.can_transition_to(Refunded));
        assert!(!Refunded.can_transition_to(Open));
    }

    #[test]
    fn test_vpc_transitions() {
        use VpcStatus::*;
        assert!(Proposed.can_transition_to(Negotiated));
        assert!(Proposed.can_transition_to(Abandoned));
        assert!(Negotiated.can_transition_to(Registered));
        assert!(Registered.can_transition_to(Active));
        assert!(Active.can_transition_to(Closing));
        assert!(Closing.can_transition_to(Settled));
        assert!(!Active.can_transition_to(Settled));
        assert!(!Abandoned.can_transition_to(Negotiated));
    }

    #[test]
    fn test_terminal_statuses() {
        assert!(ChannelStatus::MsContract(MsContractStatus::Refunded).is_terminal());
        assert!(ChannelStatus::Vpc(VpcStatus::Settled).is_terminal());
        assert!(!ChannelStatus::Vpc(VpcStatus::Active).is_terminal());
    }

    #[test]
    fn test_signature_slots() {
        let sig = Signature([9u8; 65]);
        let single = StateSignatures::SignedByProposer {
            proposer: Party::B,
            signature: sig,
        };
        assert_eq!(single.signature_of(Party::B), Some(&sig));
        assert_eq!(single.signature_of(Party::A), None);
        assert_eq!(single.proposer(), Some(Party::B));
        assert!(!single.is_fully_signed());

        let both = StateSignatures::SignedByBoth { a: sig, b: sig };
        assert!(both.is_fully_signed());
        assert_eq!(both.proposer(), None);
    }

    #[test]
    fn test_same_payload_ignores_signatures() {
        let id = ChannelId::new([3u8; 32]);
        let s1 = ChannelState::unsigned(id, 1, Balances::new(U256::from(5), U256::zero()));
        let s2 = s1.clone().with_signatures(StateSignatures::SignedByBoth {
            a: Signature([1u8; 65]),
            b: Signature([2u8; 65]),
        });
        assert!(s1.same_payload(&s2));

        let mut s3 = s1.clone();
        s3.version = 2;
        assert!(!s1.same_payload(&s3));
    }

    #[test]
    fn test_next_version() {
        let mut channel = Channel::new_ms_contract(ChannelId::new([1u8; 32]), participants(), 0, 10);
        assert_eq!(channel.next_version(), 0);

        channel.current_state = Some(ChannelState::unsigned(channel.id, 4, Balances::default()));
        assert_eq!(channel.next_version(), 5);

        channel.onchain_state = Some(ChannelState::unsigned(channel.id, 6, Balances::default()));
        assert_eq!(channel.next_version(), 7);
    }

    #[test]
    fn test_deadline_expiry_is_strict() {
        let deadline = Deadline::new(DeadlineKind::Confirmation, 100);
        assert!(!deadline.is_expired(100));
        assert!(deadline.is_expired(101));
    }

    #[test]
    fn test_funds_available() {
        let funds = Funds {
            committed: U256::from(100),
            blocked: U256::from(30),
        };
        assert_eq!(funds.available(), U256::from(70));
    }
}

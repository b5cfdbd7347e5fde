//! # State Update Engine
//!
//! Signed propose/respond handshake advancing a channel's version. Used by
//! both layers for payments within an `Open` MSContract or `Active` VPC.
//!
//! ```text
//! proposer                    engine                       counterparty
//!    │ propose_state(v+1) ──→ pending = v+1 ── StateProposed ──→ │
//!    │      (waits)                                              │
//!    │                        verify both slots ←── respond_state(Accept)
//!    │ ←── Accepted(v+1) ──── current = v+1 ─── StateUpdated ──→ │
//! ```
//!
//! A proposal is resolved exactly once: accepted, declined, or expired.
//! The proposer's waiting call is completed through a oneshot channel.

use crate::domain::{
    invariant_balances_within_funds, invariant_single_proposal, invariant_version_continuity,
    verify_confirmed, verify_proposal,
};
use crate::error::{ChannelError, ChannelResult};
use crate::ports::inbound::StateResponse;
use crate::ports::outbound::TimeSource;
use crate::registry::{ChannelGuard, ChannelRegistry};
use channel_telemetry::log_channel_event;
use parking_lot::Mutex;
use shared_bus::{EventDispatcher, EventKind, EventPublisher};
use shared_types::{Channel, ChannelId, ChannelState, PendingProposal, Timestamp};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tracing::debug;

/// How an outstanding proposal was resolved.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ProposalOutcome {
    /// Both signatures verified; the state is now current.
    Accepted(ChannelState),
    /// Counterparty declined.
    Declined(String),
    /// Deadline passed before an answer.
    Expired,
}

/// Handle on a submitted proposal.
pub struct ProposalTicket {
    /// The stored proposal.
    pub state: ChannelState,
    /// Response deadline.
    pub deadline: Timestamp,
    outcome: oneshot::Receiver<ProposalOutcome>,
}

/// State update engine.
pub struct StateUpdateEngine<T: TimeSource> {
    registry: Arc<ChannelRegistry>,
    events: EventDispatcher,
    clock: Arc<T>,
    proposal_timeout: Duration,
    waiters: Mutex<HashMap<ChannelId, oneshot::Sender<ProposalOutcome>>>,
}

impl<T: TimeSource> StateUpdateEngine<T> {
    /// Create an engine over a registry.
    pub fn new(
        registry: Arc<ChannelRegistry>,
        events: EventDispatcher,
        clock: Arc<T>,
        proposal_timeout: Duration,
    ) -> Self {
        Self {
            registry,
            events,
            clock,
            proposal_timeout,
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Store a proposer-signed state as the channel's pending proposal.
    ///
    /// Rejects a wrong version, a second live proposal, a state that is not
    /// signed by exactly one participant, and balances above the channel's
    /// funds. An expired proposal is discarded first.
    pub async fn propose_state(
        &self,
        channel_id: ChannelId,
        state: ChannelState,
    ) -> ChannelResult<ProposalTicket> {
        let guard = self.registry.lock(&channel_id).await?;
        let now = self.clock.now();
        let mut channel = guard.snapshot();

        if !channel.status.accepts_updates() {
            return Err(ChannelError::invalid_state(
                "propose_state",
                format!("channel is {}", channel.status),
            ));
        }
        if state.channel_id != channel_id {
            return Err(ChannelError::invalid_state(
                "propose_state",
                format!("state belongs to {}", state.channel_id),
            ));
        }
        invariant_single_proposal(&channel, now)?;
        invariant_version_continuity(&channel, state.version)?;
        invariant_balances_within_funds(&channel, &state.balances)?;
        let proposer = verify_proposal(&channel.participants, &state)?;

        if channel.pending_proposal.is_some() {
            self.discard_proposal(&guard, &mut channel, now);
        }

        let deadline = now.saturating_add(crate::config::millis(self.proposal_timeout));
        channel.pending_proposal = Some(PendingProposal {
            state: state.clone(),
            proposer,
            deadline,
        });
        channel.updated_at = now;
        guard.commit(channel.clone());

        let (tx, rx) = oneshot::channel();
        self.waiters.lock().insert(channel_id, tx);

        let counterparty = channel.participants.address(proposer.counterparty());
        self.events
            .publish(&[counterparty], EventKind::StateProposed, &channel);
        log_channel_event!(
            info,
            "engine",
            "State proposed",
            channel_id,
            version = state.version,
            proposer = %proposer
        );

        Ok(ProposalTicket {
            state,
            deadline,
            outcome: rx,
        })
    }

    /// Wait for the counterparty's answer to a proposal.
    ///
    /// `Declined` carries the reason. An expiry, or no answer within the
    /// proposal timeout, is `DeadlineExceeded`.
    pub async fn await_outcome(&self, ticket: ProposalTicket) -> ChannelResult<ChannelState> {
        let deadline = ticket.deadline;
        let outcome = tokio::time::timeout(self.proposal_timeout, ticket.outcome).await;

        match outcome {
            Ok(Ok(ProposalOutcome::Accepted(state))) => Ok(state),
            Ok(Ok(ProposalOutcome::Declined(reason))) => Err(ChannelError::Declined { reason }),
            Ok(Ok(ProposalOutcome::Expired)) | Ok(Err(_)) | Err(_) => {
                Err(ChannelError::DeadlineExceeded {
                    deadline,
                    now: self.clock.now(),
                })
            }
        }
    }

    /// Answer the outstanding proposal.
    ///
    /// On acceptance both slots must verify against the proposed payload and
    /// the version must still be the next one. A decline clears the proposal
    /// and leaves the version unchanged. A late answer discards the proposal
    /// and fails with `DeadlineExceeded`.
    pub async fn respond_state(
        &self,
        channel_id: ChannelId,
        response: StateResponse,
    ) -> ChannelResult<()> {
        let guard = self.registry.lock(&channel_id).await?;
        let now = self.clock.now();
        let mut channel = guard.snapshot();

        let pending = channel.pending_proposal.clone().ok_or_else(|| {
            ChannelError::invalid_state("respond_state", "no proposal outstanding")
        })?;

        if pending.is_expired(now) {
            self.discard_proposal(&guard, &mut channel, now);
            return Err(ChannelError::DeadlineExceeded {
                deadline: pending.deadline,
                now,
            });
        }

        match response {
            StateResponse::Accept(state) => {
                Self::verify_counter_signed(&channel, &pending.state, &state)?;

                channel.current_state = Some(state.clone());
                channel.pending_proposal = None;
                channel.updated_at = now;
                guard.commit(channel.clone());

                self.resolve(channel_id, ProposalOutcome::Accepted(state.clone()));
                self.events.publish(
                    &channel.participants.both(),
                    EventKind::StateUpdated,
                    &channel,
                );
                log_channel_event!(
                    info,
                    "engine",
                    "State confirmed",
                    channel_id,
                    version = state.version
                );
            }
            StateResponse::Decline { reason } => {
                channel.pending_proposal = None;
                channel.updated_at = now;
                guard.commit(channel.clone());

                self.resolve(channel_id, ProposalOutcome::Declined(reason.clone()));
                self.events.publish(
                    &channel.participants.both(),
                    EventKind::ProposalDeclined {
                        reason: reason.clone(),
                    },
                    &channel,
                );
                log_channel_event!(
                    info,
                    "engine",
                    "Proposal declined",
                    channel_id,
                    version = pending.state.version,
                    reason = %reason
                );
            }
        }
        Ok(())
    }

    /// Discard the channel's proposal if its deadline has passed.
    ///
    /// Returns `true` if a proposal was discarded.
    pub async fn expire_proposal(&self, channel_id: ChannelId) -> ChannelResult<bool> {
        let guard = self.registry.lock(&channel_id).await?;
        let now = self.clock.now();
        let mut channel = guard.snapshot();

        let expired = channel
            .pending_proposal
            .as_ref()
            .is_some_and(|p| p.is_expired(now));
        if expired && channel.status.accepts_updates() {
            self.discard_proposal(&guard, &mut channel, now);
            return Ok(true);
        }
        Ok(false)
    }

    /// Check a counter-signed state against the proposal it answers.
    ///
    /// The payload must be identical, the version must be the channel's next
    /// one, and both slots must verify.
    pub fn verify_counter_signed(
        channel: &Channel,
        proposal: &ChannelState,
        response: &ChannelState,
    ) -> ChannelResult<()> {
        if !proposal.same_payload(response) {
            return Err(ChannelError::SignatureMismatch);
        }
        invariant_version_continuity(channel, response.version)?;
        verify_confirmed(&channel.participants, response)
    }

    /// Drop the pending proposal of a locked channel and commit.
    ///
    /// The proposer's waiting call completes with `DeadlineExceeded`.
    pub(crate) fn discard_proposal(&self, guard: &ChannelGuard, channel: &mut Channel, now: Timestamp) {
        let Some(pending) = channel.pending_proposal.take() else {
            return;
        };
        channel.updated_at = now;
        guard.commit(channel.clone());

        self.resolve(channel.id, ProposalOutcome::Expired);
        self.events.publish(
            &channel.participants.both(),
            EventKind::ProposalExpired,
            channel,
        );
        debug!(
            channel_id = %channel.id,
            version = pending.state.version,
            "Expired proposal discarded"
        );
    }

    fn resolve(&self, channel_id: ChannelId, outcome: ProposalOutcome) {
        if let Some(waiter) = self.waiters.lock().remove(&channel_id) {
            // The proposer may have stopped waiting
            let _ = waiter.send(outcome);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{KeyringSigner, ManualClock};
    use crate::domain::{state_digest, with_counter_signature};
    use crate::ports::outbound::StateSigner;
    use shared_bus::EventFilter;
    use shared_types::{
        Address, Balances, ChannelStatus, MsContractStatus, Participants, Party, StateSignatures,
        U256,
    };

    const TIMEOUT: Duration = Duration::from_secs(10);

    struct Setup {
        engine: StateUpdateEngine<ManualClock>,
        registry: Arc<ChannelRegistry>,
        events: EventDispatcher,
        clock: Arc<ManualClock>,
        signer: KeyringSigner,
        participants: Participants,
        id: ChannelId,
    }

    fn setup() -> Setup {
        let registry = Arc::new(ChannelRegistry::new());
        let events = EventDispatcher::new();
        let clock = Arc::new(ManualClock::new(5_000));
        let signer = KeyringSigner::new();
        let participants = Participants::new(signer.generate(), signer.generate());
        let id = ChannelId::new([7; 32]);

        let mut channel = Channel::new_ms_contract(id, participants, 5_000, 10_000);
        channel.status = ChannelStatus::MsContract(MsContractStatus::Open);
        channel.deadline = None;
        channel.funds.committed = U256::from(100);
        registry.insert(channel).unwrap();

        let engine = StateUpdateEngine::new(registry.clone(), events.clone(), clock.clone(), TIMEOUT);
        Setup {
            engine,
            registry,
            events,
            clock,
            signer,
            participants,
            id,
        }
    }

    fn balances(a: u64, b: u64) -> Balances {
        Balances::new(U256::from(a), U256::from(b))
    }

    fn sign(s: &Setup, party: Party, state: &ChannelState) -> shared_types::Signature {
        s.signer
            .sign_digest(&s.participants.address(party), &state_digest(state))
            .unwrap()
    }

    fn proposal(s: &Setup, version: u64, a: u64, b: u64) -> ChannelState {
        let unsigned = ChannelState::unsigned(s.id, version, balances(a, b));
        let signature = sign(s, Party::A, &unsigned);
        unsigned.with_signatures(StateSignatures::SignedByProposer {
            proposer: Party::A,
            signature,
        })
    }

    fn accept(s: &Setup, proposal: &ChannelState) -> StateResponse {
        StateResponse::Accept(with_counter_signature(proposal, sign(s, Party::B, proposal)).unwrap())
    }

    fn bob(s: &Setup) -> Address {
        s.participants.address(Party::B)
    }

    #[tokio::test]
    async fn test_accept_advances_version() {
        let s = setup();
        let p = proposal(&s, 0, 60, 40);
        let ticket = s.engine.propose_state(s.id, p.clone()).await.unwrap();

        s.engine.respond_state(s.id, accept(&s, &p)).await.unwrap();
        let confirmed = s.engine.await_outcome(ticket).await.unwrap();

        assert_eq!(confirmed.version, 0);
        assert!(confirmed.signatures.is_fully_signed());
        let channel = s.registry.get(&s.id).unwrap();
        assert_eq!(channel.current_version(), Some(0));
        assert!(channel.pending_proposal.is_none());
    }

    #[tokio::test]
    async fn test_proposal_routed_to_counterparty_only() {
        let s = setup();
        let p = proposal(&s, 0, 60, 40);
        s.engine.propose_state(s.id, p.clone()).await.unwrap();

        let alice = s.participants.address(Party::A);
        assert!(s.events.history(&alice, &EventFilter::channel(s.id)).is_empty());
        let to_bob = s.events.history(&bob(&s), &EventFilter::channel(s.id));
        assert_eq!(to_bob.len(), 1);
        assert_eq!(to_bob[0].kind, EventKind::StateProposed);

        s.engine.respond_state(s.id, accept(&s, &p)).await.unwrap();
        assert_eq!(s.events.history(&alice, &EventFilter::channel(s.id)).len(), 1);
    }

    #[tokio::test]
    async fn test_wrong_version_rejected() {
        let s = setup();
        assert!(matches!(
            s.engine.propose_state(s.id, proposal(&s, 1, 50, 50)).await,
            Err(ChannelError::VersionConflict {
                expected: 0,
                actual: 1
            })
        ));
    }

    #[tokio::test]
    async fn test_second_proposal_in_flight() {
        let s = setup();
        s.engine
            .propose_state(s.id, proposal(&s, 0, 50, 50))
            .await
            .unwrap();
        assert!(matches!(
            s.engine.propose_state(s.id, proposal(&s, 0, 40, 60)).await,
            Err(ChannelError::ProposalInFlight { .. })
        ));
    }

    #[tokio::test]
    async fn test_balances_above_commitment_rejected() {
        let s = setup();
        assert!(matches!(
            s.engine.propose_state(s.id, proposal(&s, 0, 90, 20)).await,
            Err(ChannelError::FundsExceeded { .. })
        ));
    }

    #[tokio::test]
    async fn test_unsigned_and_fully_signed_proposals_rejected() {
        let s = setup();
        let unsigned = ChannelState::unsigned(s.id, 0, balances(50, 50));
        assert!(s.engine.propose_state(s.id, unsigned).await.is_err());

        let p = proposal(&s, 0, 50, 50);
        let StateResponse::Accept(both) = accept(&s, &p) else {
            unreachable!()
        };
        assert!(s.engine.propose_state(s.id, both).await.is_err());
        assert!(s.registry.get(&s.id).unwrap().pending_proposal.is_none());
    }

    #[tokio::test]
    async fn test_decline_keeps_version() {
        let s = setup();
        let ticket = s
            .engine
            .propose_state(s.id, proposal(&s, 0, 50, 50))
            .await
            .unwrap();
        s.engine
            .respond_state(
                s.id,
                StateResponse::Decline {
                    reason: "insufficient".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(
            s.engine.await_outcome(ticket).await,
            Err(ChannelError::Declined {
                reason: "insufficient".into()
            })
        );
        let channel = s.registry.get(&s.id).unwrap();
        assert_eq!(channel.current_version(), None);
        assert!(channel.pending_proposal.is_none());
    }

    #[tokio::test]
    async fn test_late_response_discards_proposal() {
        let s = setup();
        let p = proposal(&s, 0, 50, 50);
        let ticket = s.engine.propose_state(s.id, p.clone()).await.unwrap();
        s.clock.advance(TIMEOUT + Duration::from_millis(1));

        assert!(matches!(
            s.engine.respond_state(s.id, accept(&s, &p)).await,
            Err(ChannelError::DeadlineExceeded { .. })
        ));
        assert!(matches!(
            s.engine.await_outcome(ticket).await,
            Err(ChannelError::DeadlineExceeded { .. })
        ));
        assert!(s.registry.get(&s.id).unwrap().pending_proposal.is_none());

        // Free for a new proposal at the same version
        s.engine
            .propose_state(s.id, proposal(&s, 0, 40, 60))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_expire_proposal_only_after_deadline() {
        let s = setup();
        s.engine
            .propose_state(s.id, proposal(&s, 0, 50, 50))
            .await
            .unwrap();
        assert!(!s.engine.expire_proposal(s.id).await.unwrap());

        s.clock.advance(TIMEOUT + Duration::from_millis(1));
        assert!(s.engine.expire_proposal(s.id).await.unwrap());
        assert!(!s.engine.expire_proposal(s.id).await.unwrap());

        let last = s
            .events
            .history(&bob(&s), &EventFilter::channel(s.id))
            .pop()
            .unwrap();
        assert_eq!(last.kind, EventKind::ProposalExpired);
    }

    #[tokio::test]
    async fn test_respond_without_proposal() {
        let s = setup();
        assert!(matches!(
            s.engine
                .respond_state(s.id, StateResponse::Decline { reason: "x".into() })
                .await,
            Err(ChannelError::InvalidState { .. })
        ));
    }
}

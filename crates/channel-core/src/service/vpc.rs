//! # VPC Lifecycle
//!
//! Virtual channels are opened off-chain inside an `Open` MSContract and
//! only touch the chain to register, close and settle.
//!
//! ```text
//! Proposed ──confirm──→ Negotiated ──register──→ Registered ──→ Active
//!    │  │                                            ↑            │
//!    │  └──── finalize_register (after deadline) ────┘          close
//!    │                                                            ↓
//!    └── late confirm / abandon (after deadline) ──→ Abandoned  Closing ──execute──→ Settled
//! ```
//!
//! Blocking funds in the parent happens under the parent's lock. Settling
//! and abandoning lock the child first, then the parent. Settled and
//! abandoned VPCs leave the registry; their history stays in the event log.
//!
//! A VPC registered by the proposer alone has no fully signed state. It is
//! closed on the registered initial state as a dispute, so the counterparty
//! gets the response window before it settles.

use super::{set_vpc_status, vpc_status, ChannelService};
use crate::domain::{
    derive_sid, fresh_nonce, invariant_funds_within_commitment, invariant_single_proposal,
    state_digest, verify_confirmed,
};
use crate::engine::StateUpdateEngine;
use crate::error::{ChannelError, ChannelResult};
use crate::ports::inbound::VpcProposal;
use crate::ports::outbound::{BlockchainAdapter, StateSigner, TimeSource};
use crate::registry::ChannelGuard;
use channel_telemetry::log_channel_event;
use shared_bus::{EventKind, EventPublisher};
use shared_types::{
    Channel, ChannelId, ChannelState, CloseKind, Deadline, DeadlineKind, MsContractStatus,
    PendingProposal, StateSignatures, Timestamp, VpcStatus,
};
use tracing::{debug, warn};

impl<A, T, S> ChannelService<A, T, S>
where
    A: BlockchainAdapter,
    T: TimeSource,
    S: StateSigner,
{
    /// Propose a VPC under an open MSContract.
    ///
    /// Blocks the requested balances in the parent, signs the initial state
    /// (version 0) as the proposer and returns it for the counterparty.
    pub async fn vpc_propose(&self, request: VpcProposal) -> ChannelResult<ChannelState> {
        let parent_guard = self.registry().lock(&request.parent).await?;
        let now = self.now();
        let mut parent = parent_guard.snapshot();

        let parent_status = super::ms_status(&parent, "propose_vpc")?;
        if parent_status != MsContractStatus::Open {
            return Err(ChannelError::invalid_state(
                "propose_vpc",
                format!("parent is {:?}", parent_status),
            ));
        }
        let proposer = parent
            .participants
            .party_of(&request.proposer)
            .ok_or_else(|| {
                ChannelError::invalid_state(
                    "propose_vpc",
                    format!("{} is not a participant of the parent", request.proposer),
                )
            })?;
        let new_blocked = invariant_funds_within_commitment(&parent, &request.blocked)?;
        let locked = new_blocked - parent.funds.blocked;

        let nonce = request.nonce.unwrap_or_else(fresh_nonce);
        let sid = derive_sid(&parent.participants.a, &parent.participants.b, &nonce);
        let id = ChannelId::from(sid);
        if self.registry().contains(&id) {
            return Err(ChannelError::AlreadyExists { channel_id: id });
        }

        let unsigned = ChannelState::unsigned(id, 0, request.blocked);
        let signature = self
            .signer()
            .sign_digest(&request.proposer, &state_digest(&unsigned))
            .map_err(|e| ChannelError::signature(e.to_string()))?;
        let state = unsigned.with_signatures(StateSignatures::SignedByProposer {
            proposer,
            signature,
        });

        let proposal = PendingProposal {
            state: state.clone(),
            proposer,
            deadline: self.deadline_after(now, self.config().negotiation_timeout),
        };
        let child = Channel::new_vpc(id, parent.id, parent.participants, proposal, locked, now);
        self.registry().insert(child.clone())?;

        parent.funds.blocked = new_blocked;
        parent.updated_at = now;
        parent_guard.commit(parent);

        self.notify(EventKind::Created, &child);
        let counterparty = child.participants.address(proposer.counterparty());
        self.events()
            .publish(&[counterparty], EventKind::StateProposed, &child);
        log_channel_event!(
            info,
            "vpc",
            "VPC proposed",
            id,
            parent = %request.parent,
            proposer = %proposer,
            blocked = %locked
        );
        Ok(state)
    }

    /// Accept a proposed VPC with the counterparty's signature added.
    ///
    /// A late answer abandons the VPC and releases its funds in the parent.
    pub async fn vpc_confirm(&self, state: ChannelState) -> ChannelResult<ChannelState> {
        let id = state.channel_id;
        let guard = self.registry().lock(&id).await?;
        let now = self.now();
        let mut channel = guard.snapshot();

        match vpc_status(&channel, "confirm_proposed_vpc")? {
            VpcStatus::Proposed => {}
            // Registered by the proposer alone after the deadline
            _ if channel.current_state.is_none() => {
                return Err(ChannelError::DeadlineExceeded {
                    deadline: self.negotiation_deadline(&channel),
                    now,
                });
            }
            status => {
                return Err(ChannelError::invalid_state(
                    "confirm_proposed_vpc",
                    format!("channel is {:?}", status),
                ));
            }
        }

        let pending = channel.pending_proposal.clone().ok_or_else(|| {
            ChannelError::invalid_state("confirm_proposed_vpc", "no initial state outstanding")
        })?;
        if pending.is_expired(now) {
            self.abandon(guard, channel, now, "confirm_proposed_vpc").await?;
            return Err(ChannelError::DeadlineExceeded {
                deadline: pending.deadline,
                now,
            });
        }

        StateUpdateEngine::<T>::verify_counter_signed(&channel, &pending.state, &state)?;

        set_vpc_status(&mut channel, VpcStatus::Negotiated, "confirm_proposed_vpc")?;
        channel.current_state = Some(state.clone());
        channel.pending_proposal = None;
        channel.updated_at = now;
        guard.commit(channel.clone());

        self.notify(EventKind::Negotiated, &channel);
        log_channel_event!(info, "vpc", "VPC negotiated", id);
        Ok(state)
    }

    /// Register the negotiated initial state on chain and activate.
    pub async fn vpc_register(&self, channel_id: ChannelId, state: ChannelState) -> ChannelResult<Channel> {
        self.require_vpc_contract()?;
        let guard = self.registry().lock(&channel_id).await?;
        let channel = guard.snapshot();

        let status = vpc_status(&channel, "state_register")?;
        if status != VpcStatus::Negotiated {
            return Err(ChannelError::invalid_state(
                "state_register",
                format!("channel is {:?}", status),
            ));
        }
        let current = channel.current_state.clone().ok_or_else(|| {
            ChannelError::invalid_state("state_register", "no negotiated state")
        })?;
        if state.version != current.version {
            return Err(ChannelError::VersionConflict {
                expected: current.version,
                actual: state.version,
            });
        }
        if !current.same_payload(&state) {
            return Err(ChannelError::SignatureMismatch);
        }
        verify_confirmed(&channel.participants, &state)?;

        let chain = self.chain();
        let submitted = &state;
        let guard = self
            .submit_unlocked(guard, "register_state", &channel, move || {
                chain.register_state(channel_id, submitted)
            })
            .await?;

        self.activate(&guard, channel, state, "state_register")
    }

    /// Register without the counterparty once negotiation is overdue.
    ///
    /// Registers the negotiated state if there is one, otherwise the
    /// proposer-signed initial state.
    pub async fn vpc_finalize_register(&self, channel_id: ChannelId) -> ChannelResult<Channel> {
        self.require_vpc_contract()?;
        let guard = self.registry().lock(&channel_id).await?;
        let now = self.now();
        let channel = guard.snapshot();

        let state = match vpc_status(&channel, "finalize_register")? {
            VpcStatus::Proposed => channel
                .pending_proposal
                .as_ref()
                .map(|p| p.state.clone()),
            VpcStatus::Negotiated => channel.current_state.clone(),
            status => {
                return Err(ChannelError::invalid_state(
                    "finalize_register",
                    format!("channel is {:?}", status),
                ));
            }
        }
        .ok_or_else(|| ChannelError::invalid_state("finalize_register", "no initial state"))?;

        let deadline = channel
            .deadline
            .ok_or_else(|| ChannelError::invalid_state("finalize_register", "no negotiation deadline"))?;
        if !deadline.is_expired(now) {
            return Err(ChannelError::TooEarly {
                deadline: deadline.at,
                now,
            });
        }

        let chain = self.chain();
        let submitted = &state;
        let guard = self
            .submit_unlocked(guard, "register_state", &channel, move || {
                chain.register_state(channel_id, submitted)
            })
            .await?;

        self.activate(&guard, channel, state, "finalize_register")
    }

    /// Give up on a proposed VPC once negotiation is overdue.
    ///
    /// Either side may call it instead of `finalize_register`. The blocked
    /// amounts return to the parent and the VPC leaves the registry.
    pub async fn vpc_abandon(&self, channel_id: ChannelId) -> ChannelResult<Channel> {
        let guard = self.registry().lock(&channel_id).await?;
        let now = self.now();
        let channel = guard.snapshot();

        let status = vpc_status(&channel, "abandon_proposed_vpc")?;
        if status != VpcStatus::Proposed {
            return Err(ChannelError::invalid_state(
                "abandon_proposed_vpc",
                format!("channel is {:?}", status),
            ));
        }
        let deadline = channel.deadline.ok_or_else(|| {
            ChannelError::invalid_state("abandon_proposed_vpc", "no negotiation deadline")
        })?;
        if !deadline.is_expired(now) {
            return Err(ChannelError::TooEarly {
                deadline: deadline.at,
                now,
            });
        }

        self.abandon(guard, channel, now, "abandon_proposed_vpc").await
    }

    /// Close an active VPC on the highest state either side can prove.
    ///
    /// Closing on the node's own latest state is mutual. Submitting a higher
    /// state than the node holds opens a dispute with a response window, as
    /// does closing on the registered state of a VPC that never got a fully
    /// signed one.
    pub async fn vpc_close(&self, channel_id: ChannelId, state: ChannelState) -> ChannelResult<Channel> {
        self.require_vpc_contract()?;
        let guard = self.registry().lock(&channel_id).await?;
        let now = self.now();
        let mut channel = guard.snapshot();

        let status = vpc_status(&channel, "close_virtual_channel")?;
        if status != VpcStatus::Active {
            return Err(ChannelError::invalid_state(
                "close_virtual_channel",
                format!("channel is {:?}", status),
            ));
        }
        if state.channel_id != channel_id {
            return Err(ChannelError::invalid_state(
                "close_virtual_channel",
                format!("state belongs to {}", state.channel_id),
            ));
        }
        invariant_single_proposal(&channel, now)?;
        if channel.onchain_state.as_ref() != Some(&state) {
            verify_confirmed(&channel.participants, &state)?;
        }

        let selected = match &channel.current_state {
            Some(current) if current.version > state.version => current.clone(),
            Some(current) if current.version == state.version => {
                if !current.same_payload(&state) {
                    return Err(ChannelError::SignatureMismatch);
                }
                current.clone()
            }
            _ => state,
        };
        if let Some(onchain) = &channel.onchain_state {
            if selected.version < onchain.version {
                return Err(ChannelError::VersionConflict {
                    expected: onchain.version,
                    actual: selected.version,
                });
            }
        }
        let close_kind = if channel.current_version() == Some(selected.version) {
            CloseKind::Mutual
        } else {
            CloseKind::Dispute
        };

        if channel.pending_proposal.is_some() {
            self.engine().discard_proposal(&guard, &mut channel, now);
        }

        let chain = self.chain();
        let submitted = &selected;
        let guard = self
            .submit_unlocked(guard, "close_channel", &channel, move || {
                chain.close_channel(channel_id, Some(submitted))
            })
            .await?;

        let now = self.now();
        set_vpc_status(&mut channel, VpcStatus::Closing, "close_virtual_channel")?;
        channel.deadline = match close_kind {
            CloseKind::Mutual => None,
            CloseKind::Dispute => Some(Deadline::new(
                DeadlineKind::Response,
                self.deadline_after(now, self.config().response_timeout),
            )),
        };
        channel.close_kind = Some(close_kind);
        if selected.signatures.is_fully_signed() {
            channel.current_state = Some(selected.clone());
        }
        channel.onchain_state = Some(selected.clone());
        channel.updated_at = now;
        guard.commit(channel.clone());

        self.notify(EventKind::Closing, &channel);
        log_channel_event!(
            info,
            "vpc",
            "VPC closing",
            channel_id,
            version = selected.version,
            close_kind = ?close_kind
        );
        Ok(channel)
    }

    /// Settle a closing VPC, release its funds in the parent and drop it
    /// from the registry.
    pub async fn vpc_execute_close(&self, channel_id: ChannelId) -> ChannelResult<Channel> {
        self.require_vpc_contract()?;
        let guard = self.registry().lock(&channel_id).await?;
        let now = self.now();
        let mut channel = guard.snapshot();

        let status = vpc_status(&channel, "execute_close_virtual_channel")?;
        if status != VpcStatus::Closing {
            return Err(ChannelError::invalid_state(
                "execute_close_virtual_channel",
                format!("channel is {:?}", status),
            ));
        }
        if channel.close_kind == Some(CloseKind::Dispute) {
            if let Some(deadline) = channel.deadline.filter(|d| !d.is_expired(now)) {
                return Err(ChannelError::TooEarly {
                    deadline: deadline.at,
                    now,
                });
            }
        }

        let chain = self.chain();
        let guard = self
            .submit_unlocked(guard, "execute_settle", &channel, move || {
                chain.execute_settle(channel_id)
            })
            .await?;

        let now = self.now();
        self.release_parent_funds(&channel, now).await;

        set_vpc_status(&mut channel, VpcStatus::Settled, "execute_close_virtual_channel")?;
        channel.deadline = None;
        channel.updated_at = now;
        guard.commit(channel.clone());

        self.notify(EventKind::Settled, &channel);
        self.registry().delete(&channel_id);
        log_channel_event!(
            info,
            "vpc",
            "VPC settled",
            channel_id,
            version = ?channel.onchain_state.as_ref().map(|s| s.version)
        );
        Ok(channel)
    }

    // =========================================================================
    // INTERNALS
    // =========================================================================

    /// Commit `Registered` then `Active` for a VPC whose state is on chain.
    fn activate(
        &self,
        guard: &ChannelGuard,
        mut channel: Channel,
        registered: ChannelState,
        operation: &'static str,
    ) -> ChannelResult<Channel> {
        let now = self.now();
        let id = channel.id;
        let version = registered.version;

        set_vpc_status(&mut channel, VpcStatus::Registered, operation)?;
        channel.onchain_state = Some(registered);
        channel.pending_proposal = None;
        channel.deadline = None;
        channel.updated_at = now;
        guard.commit(channel.clone());
        self.notify(EventKind::Registered, &channel);

        set_vpc_status(&mut channel, VpcStatus::Active, operation)?;
        guard.commit(channel.clone());
        self.notify(EventKind::Activated, &channel);

        log_channel_event!(info, "vpc", "VPC active", id, version = version);
        Ok(channel)
    }

    /// Mark an overdue proposed VPC abandoned, unblock its funds and drop
    /// it from the registry.
    async fn abandon(
        &self,
        guard: ChannelGuard,
        mut channel: Channel,
        now: Timestamp,
        operation: &'static str,
    ) -> ChannelResult<Channel> {
        set_vpc_status(&mut channel, VpcStatus::Abandoned, operation)?;
        channel.pending_proposal = None;
        channel.deadline = None;
        channel.updated_at = now;

        self.release_parent_funds(&channel, now).await;
        guard.commit(channel.clone());

        self.notify(EventKind::Abandoned, &channel);
        self.registry().delete(&channel.id);
        drop(guard);
        log_channel_event!(warn, "vpc", "VPC abandoned", channel.id, operation = operation);
        Ok(channel)
    }

    /// Return a child's locked amount to its parent's available funds.
    ///
    /// The caller holds the child's lock.
    async fn release_parent_funds(&self, child: &Channel, now: Timestamp) {
        let Some(parent_id) = child.parent else {
            return;
        };
        match self.registry().lock(&parent_id).await {
            Ok(parent_guard) => {
                let mut parent = parent_guard.snapshot();
                parent.funds.blocked = parent.funds.blocked.saturating_sub(child.funds.committed);
                parent.updated_at = now;
                parent_guard.commit(parent);
                debug!(
                    channel_id = %child.id,
                    parent = %parent_id,
                    released = %child.funds.committed,
                    "Parent funds released"
                );
            }
            Err(e) => warn!(channel_id = %child.id, parent = %parent_id, error = %e, "Parent not found"),
        }
    }

    /// Negotiation deadline of a VPC, derived from its creation time.
    fn negotiation_deadline(&self, channel: &Channel) -> Timestamp {
        self.deadline_after(channel.created_at, self.config().negotiation_timeout)
    }
}

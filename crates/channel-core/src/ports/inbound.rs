//! # Inbound Ports
//!
//! The node's RPC surface. Transport and encoding live outside the core;
//! a transport maps each call one to one onto this trait.

use crate::error::ChannelResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use shared_bus::Subscription;
use shared_types::{Address, Amount, Balances, Channel, ChannelId, ChannelState};

/// Request to open a VPC under an MSContract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VpcProposal {
    /// Parent MSContract.
    pub parent: ChannelId,
    /// Proposing participant; must be a locally held key.
    pub proposer: Address,
    /// Amounts blocked in the parent per participant.
    pub blocked: Balances,
    /// Sid nonce. Drawn from the OS CSPRNG when absent.
    pub nonce: Option<[u8; 32]>,
}

/// Counterparty's answer to a state proposal.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum StateResponse {
    /// The proposed state carrying both signatures.
    Accept(ChannelState),
    /// Rejection with a reason.
    Decline {
        /// Why the proposal was rejected.
        reason: String,
    },
}

/// Addresses configured on the node.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeSettings {
    /// Address whose event log `receive_updates` streams.
    pub own_address: Option<Address>,
    /// Signature library contract.
    pub lib_sig_address: Option<Address>,
    /// VPC contract; required for VPC on-chain operations.
    pub vpc_address: Option<Address>,
}

/// Primary channel API
#[async_trait]
pub trait ChannelApi: Send + Sync {
    // =========================================================================
    // NODE
    // =========================================================================

    /// Snapshot of every channel in the registry.
    async fn get_channels(&self) -> Vec<Channel>;

    /// Replay and stream the own address's event log.
    async fn receive_updates(&self) -> ChannelResult<Subscription>;

    /// Set the signature library contract address.
    async fn set_lib_sig_address(&self, address: Address);

    /// Set the VPC contract address.
    async fn set_vpc_address(&self, address: Address);

    /// Set the node's own participant address.
    async fn set_own_address(&self, address: Address);

    /// Current node settings.
    async fn settings(&self) -> NodeSettings;

    // =========================================================================
    // MSCONTRACT
    // =========================================================================

    /// Create an MSContract between `alice` and `bob`.
    async fn create_new_ms_channel(&self, alice: Address, bob: Address) -> ChannelResult<Channel>;

    /// Confirm and fund an MSContract; returns the counterparty's channel stream.
    async fn confirm_channel(&self, channel_id: ChannelId, amount: Amount) -> ChannelResult<Subscription>;

    /// Resume the own address's stream of one channel.
    async fn subscribe_to_channel(&self, channel_id: ChannelId) -> ChannelResult<Subscription>;

    /// Refund an unconfirmed MSContract after its deadline.
    async fn refund_channel(&self, channel_id: ChannelId) -> ChannelResult<()>;

    /// Close an MSContract, or acknowledge a close already in progress.
    async fn close_ms_contract(&self, channel_id: ChannelId) -> ChannelResult<()>;

    /// Settle a closing MSContract after the response deadline.
    async fn finalize_close_ms_contract(&self, channel_id: ChannelId) -> ChannelResult<()>;

    // =========================================================================
    // VPC
    // =========================================================================

    /// Propose a VPC; returns the proposer-signed initial state.
    async fn propose_vpc(&self, proposal: VpcProposal) -> ChannelResult<ChannelState>;

    /// Counter-sign a proposed VPC; returns the confirmed initial state.
    async fn confirm_proposed_vpc(&self, state: ChannelState) -> ChannelResult<ChannelState>;

    /// Register the negotiated state on chain.
    async fn state_register(&self, channel_id: ChannelId, state: ChannelState) -> ChannelResult<()>;

    /// Force registration after the negotiation deadline.
    async fn finalize_register(&self, channel_id: ChannelId) -> ChannelResult<()>;

    /// Abandon an unconfirmed VPC after the negotiation deadline and unblock
    /// its funds in the parent.
    async fn abandon_proposed_vpc(&self, channel_id: ChannelId) -> ChannelResult<()>;

    /// Close a VPC by mutual agreement or dispute.
    async fn close_virtual_channel(&self, channel_id: ChannelId, state: ChannelState) -> ChannelResult<()>;

    /// Settle a closing VPC and release its funds in the parent.
    async fn execute_close_virtual_channel(&self, channel_id: ChannelId) -> ChannelResult<()>;

    // =========================================================================
    // STATE UPDATES
    // =========================================================================

    /// Propose a new state and wait for the counterparty's answer.
    async fn propose_new_channel_state(
        &self,
        channel_id: ChannelId,
        state: ChannelState,
    ) -> ChannelResult<ChannelState>;

    /// Answer the outstanding proposal.
    async fn respond_new_channel_state(
        &self,
        channel_id: ChannelId,
        response: StateResponse,
    ) -> ChannelResult<()>;
}

//! # Test Harness
//!
//! A single node holding both participants' keys, driven by a manual clock
//! and backed by the in-memory chain.

use std::sync::Arc;
use std::time::Duration;

use channel_core::domain::{state_digest, with_counter_signature};
use channel_core::{
    ChannelApi, ChannelConfig, ChannelResult, ChannelService, InMemoryChain, KeyringSigner,
    ManualClock, NodeSettings, StateResponse, StateSigner, VpcProposal,
};
use shared_bus::{ChannelEvent, Subscription};
use shared_types::{
    Address, Balances, Channel, ChannelId, ChannelState, Participants, Party, StateSignatures,
    U256,
};
use tokio::time::timeout;

/// Concrete service type under test.
pub type Service = ChannelService<InMemoryChain, ManualClock, KeyringSigner>;

/// Node fixture with Alice and Bob.
pub struct TestNode {
    pub service: Arc<Service>,
    pub chain: Arc<InMemoryChain>,
    pub clock: Arc<ManualClock>,
    pub signer: Arc<KeyringSigner>,
    pub alice: Address,
    pub bob: Address,
}

impl TestNode {
    /// Node with the testing config and the VPC contract configured.
    pub fn new() -> Self {
        Self::with_config(ChannelConfig::for_testing())
    }

    pub fn with_config(config: ChannelConfig) -> Self {
        let chain = Arc::new(InMemoryChain::new());
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let signer = Arc::new(KeyringSigner::new());
        let alice = signer.generate();
        let bob = signer.generate();

        let service = ChannelService::new(config, chain.clone(), clock.clone(), signer.clone())
            .with_settings(NodeSettings {
                own_address: Some(alice),
                lib_sig_address: Some(Address::new([0x11; 20])),
                vpc_address: Some(Address::new([0x22; 20])),
            });

        Self {
            service: Arc::new(service),
            chain,
            clock,
            signer,
            alice,
            bob,
        }
    }

    pub fn participants(&self) -> Participants {
        Participants::new(self.alice, self.bob)
    }

    pub fn address(&self, party: Party) -> Address {
        self.participants().address(party)
    }

    /// Move the clock just past `window`.
    pub fn advance_past(&self, window: Duration) {
        self.clock.advance(window + Duration::from_millis(1));
    }

    // =========================================================================
    // SIGNING
    // =========================================================================

    /// State signed by `proposer` only.
    pub fn proposal(&self, proposer: Party, channel_id: ChannelId, version: u64, balances: Balances) -> ChannelState {
        let unsigned = ChannelState::unsigned(channel_id, version, balances);
        let signature = self
            .signer
            .sign_digest(&self.address(proposer), &state_digest(&unsigned))
            .expect("sign");
        unsigned.with_signatures(StateSignatures::SignedByProposer {
            proposer,
            signature,
        })
    }

    /// Add the counterparty's signature to a proposal.
    pub fn counter_sign(&self, proposal: &ChannelState) -> ChannelState {
        let proposer = proposal.signatures.proposer().expect("proposer-signed");
        let signature = self
            .signer
            .sign_digest(&self.address(proposer.counterparty()), &state_digest(proposal))
            .expect("sign");
        with_counter_signature(proposal, signature).expect("counter-sign")
    }

    /// State signed by both participants.
    pub fn confirmed(&self, channel_id: ChannelId, version: u64, balances: Balances) -> ChannelState {
        self.counter_sign(&self.proposal(Party::A, channel_id, version, balances))
    }

    // =========================================================================
    // LIFECYCLE SHORTCUTS
    // =========================================================================

    /// MSContract confirmed by Bob with `amount`.
    pub async fn open_ms_contract(&self, amount: u64) -> Channel {
        let channel = self
            .service
            .create_new_ms_channel(self.alice, self.bob)
            .await
            .expect("create");
        self.service
            .ms_confirm(channel.id, U256::from(amount))
            .await
            .expect("confirm")
    }

    /// Proposed, negotiated and registered VPC.
    pub async fn open_vpc(&self, parent: ChannelId, blocked_a: u64, blocked_b: u64) -> Channel {
        let proposal = self
            .service
            .propose_vpc(VpcProposal {
                parent,
                proposer: self.alice,
                blocked: balances(blocked_a, blocked_b),
                nonce: None,
            })
            .await
            .expect("propose vpc");
        let confirmed = self
            .service
            .confirm_proposed_vpc(self.counter_sign(&proposal))
            .await
            .expect("confirm vpc");
        self.service
            .vpc_register(proposal.channel_id, confirmed)
            .await
            .expect("register")
    }

    /// Propose and accept a state through the engine.
    pub async fn pay(&self, channel_id: ChannelId, version: u64, balances: Balances) -> ChannelResult<ChannelState> {
        let proposal = self.proposal(Party::A, channel_id, version, balances);
        let engine = self.service.engine();
        let ticket = engine.propose_state(channel_id, proposal.clone()).await?;
        engine
            .respond_state(channel_id, StateResponse::Accept(self.counter_sign(&proposal)))
            .await?;
        engine.await_outcome(ticket).await
    }

    pub fn channel(&self, id: &ChannelId) -> Channel {
        self.service.registry().get(id).expect("channel in registry")
    }
}

impl Default for TestNode {
    fn default() -> Self {
        Self::new()
    }
}

pub fn balances(a: u64, b: u64) -> Balances {
    Balances::new(U256::from(a), U256::from(b))
}

/// Next entry of a subscription, failing after one second.
pub async fn next_event(sub: &mut Subscription) -> ChannelEvent {
    timeout(Duration::from_secs(1), sub.recv())
        .await
        .expect("timed out waiting for event")
        .expect("subscription closed")
}

//! # Channel Service
//!
//! Application service wiring the registry, the state update engine, the
//! event dispatcher and the outbound ports together. Lifecycle operations
//! live in [`ms_contract`] and [`vpc`]; this module holds the shared plumbing
//! and the [`ChannelApi`] implementation.
//!
//! Every mutating operation follows the same shape:
//!
//! ```text
//! lock channel → snapshot → validate → commit → publish
//!                              │
//!                    mark busy, unlock → adapter call (retried) → relock
//! ```
//!
//! Validation failures return before anything is written. The channel lock
//! is not held while the adapter retries; the busy mark turns other
//! writers away until the result is committed. An adapter call that fails
//! on every attempt leaves the channel untouched and reports a `Failed`
//! entry to both participants.

pub mod ms_contract;
pub mod vpc;

use crate::config::{millis, ChannelConfig};
use crate::engine::StateUpdateEngine;
use crate::error::{ChannelError, ChannelResult};
use crate::ports::inbound::{ChannelApi, NodeSettings, StateResponse, VpcProposal};
use crate::ports::outbound::{
    AdapterError, BlockchainAdapter, StateSigner, TimeSource, TxReceipt,
};
use crate::registry::{ChannelGuard, ChannelRegistry};
use async_trait::async_trait;
use parking_lot::RwLock;
use shared_bus::{EventDispatcher, EventFilter, EventKind, EventPublisher, ReplayFrom, Subscription};
use shared_types::{
    Address, Amount, Channel, ChannelId, ChannelState, ChannelStatus, MsContractStatus,
    Timestamp, VpcStatus,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Channel service - implements [`ChannelApi`].
pub struct ChannelService<A, T, S>
where
    A: BlockchainAdapter,
    T: TimeSource,
    S: StateSigner,
{
    config: ChannelConfig,
    registry: Arc<ChannelRegistry>,
    engine: StateUpdateEngine<T>,
    events: EventDispatcher,
    chain: Arc<A>,
    clock: Arc<T>,
    signer: Arc<S>,
    settings: RwLock<NodeSettings>,
}

impl<A, T, S> ChannelService<A, T, S>
where
    A: BlockchainAdapter,
    T: TimeSource,
    S: StateSigner,
{
    /// Create a service with an empty registry.
    pub fn new(config: ChannelConfig, chain: Arc<A>, clock: Arc<T>, signer: Arc<S>) -> Self {
        let registry = Arc::new(ChannelRegistry::new());
        let events = EventDispatcher::with_capacity(config.subscriber_buffer);
        let engine = StateUpdateEngine::new(
            registry.clone(),
            events.clone(),
            clock.clone(),
            config.proposal_timeout,
        );

        Self {
            config,
            registry,
            engine,
            events,
            chain,
            clock,
            signer,
            settings: RwLock::new(NodeSettings::default()),
        }
    }

    /// Start from the given node settings.
    pub fn with_settings(self, settings: NodeSettings) -> Self {
        *self.settings.write() = settings;
        self
    }

    /// Channel registry.
    pub fn registry(&self) -> &Arc<ChannelRegistry> {
        &self.registry
    }

    /// Event dispatcher.
    pub fn events(&self) -> &EventDispatcher {
        &self.events
    }

    /// State update engine.
    pub fn engine(&self) -> &StateUpdateEngine<T> {
        &self.engine
    }

    /// Active configuration.
    pub fn config(&self) -> &ChannelConfig {
        &self.config
    }

    /// Clock used for every deadline.
    pub fn clock(&self) -> &Arc<T> {
        &self.clock
    }

    pub(crate) fn now(&self) -> Timestamp {
        self.clock.now()
    }

    pub(crate) fn deadline_after(&self, now: Timestamp, window: Duration) -> Timestamp {
        now.saturating_add(millis(window))
    }

    pub(crate) fn signer(&self) -> &S {
        &self.signer
    }

    pub(crate) fn chain(&self) -> &A {
        &self.chain
    }

    /// The VPC contract address; every VPC on-chain call needs it.
    pub(crate) fn require_vpc_contract(&self) -> ChannelResult<Address> {
        self.settings
            .read()
            .vpc_address
            .ok_or(ChannelError::NotConfigured {
                setting: "vpc_address",
            })
    }

    fn require_own_address(&self) -> ChannelResult<Address> {
        self.settings
            .read()
            .own_address
            .ok_or(ChannelError::NotConfigured {
                setting: "own_address",
            })
    }

    /// Append an entry to both participants' logs.
    pub(crate) fn notify(&self, kind: EventKind, channel: &Channel) -> u64 {
        self.events
            .publish(&channel.participants.both(), kind, channel)
    }

    /// Run an adapter call under the retry policy.
    ///
    /// On the final failure both participants get a `Failed` entry carrying
    /// the unchanged channel, and the call returns `AdapterFailure`.
    pub(crate) async fn submit<F, Fut>(
        &self,
        operation: &'static str,
        channel: &Channel,
        call: F,
    ) -> ChannelResult<TxReceipt>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<TxReceipt, AdapterError>>,
    {
        let policy = &self.config.adapter_retry;
        let attempts = policy.max_attempts.max(1);
        let mut last_error = None;

        for attempt in 1..=attempts {
            match call().await {
                Ok(receipt) => {
                    debug!(
                        operation,
                        channel_id = %channel.id,
                        attempt,
                        tx_hash = ?receipt.tx_hash,
                        "Adapter call succeeded"
                    );
                    return Ok(receipt);
                }
                Err(e) => {
                    warn!(
                        operation,
                        channel_id = %channel.id,
                        attempt,
                        max_attempts = attempts,
                        error = %e,
                        "Adapter call failed"
                    );
                    last_error = Some(e);
                    if attempt < attempts && !policy.backoff.is_zero() {
                        tokio::time::sleep(policy.backoff).await;
                    }
                }
            }
        }

        let reason = last_error.map(|e| e.to_string()).unwrap_or_default();
        error!(
            operation,
            channel_id = %channel.id,
            reason = %reason,
            "Adapter call failed on every attempt"
        );
        self.notify(
            EventKind::Failed {
                operation: operation.to_string(),
                reason: reason.clone(),
            },
            channel,
        );
        Err(ChannelError::AdapterFailure { operation, reason })
    }

    /// [`submit`](Self::submit) with the channel lock released for the
    /// duration of the call.
    ///
    /// Returns the lock taken back once the call succeeded.
    pub(crate) async fn submit_unlocked<F, Fut>(
        &self,
        guard: ChannelGuard,
        operation: &'static str,
        channel: &Channel,
        call: F,
    ) -> ChannelResult<ChannelGuard>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<TxReceipt, AdapterError>>,
    {
        let in_flight = guard.begin_chain_call(operation);
        let result = self.submit(operation, channel, call).await;
        let guard = in_flight.relock().await;
        result.map(|_| guard)
    }
}

// =============================================================================
// STATUS HELPERS
// =============================================================================

/// MSContract status of `channel`, or `InvalidState` for a VPC.
pub(crate) fn ms_status(channel: &Channel, operation: &'static str) -> ChannelResult<MsContractStatus> {
    match channel.status {
        ChannelStatus::MsContract(status) => Ok(status),
        ChannelStatus::Vpc(_) => Err(ChannelError::invalid_state(
            operation,
            format!("{} is a virtual channel", channel.id),
        )),
    }
}

/// VPC status of `channel`, or `InvalidState` for an MSContract.
pub(crate) fn vpc_status(channel: &Channel, operation: &'static str) -> ChannelResult<VpcStatus> {
    match channel.status {
        ChannelStatus::Vpc(status) => Ok(status),
        ChannelStatus::MsContract(_) => Err(ChannelError::invalid_state(
            operation,
            format!("{} is not a virtual channel", channel.id),
        )),
    }
}

pub(crate) fn set_ms_status(
    channel: &mut Channel,
    next: MsContractStatus,
    operation: &'static str,
) -> ChannelResult<()> {
    let current = ms_status(channel, operation)?;
    if !current.can_transition_to(next) {
        return Err(ChannelError::invalid_state(
            operation,
            format!("cannot move from {:?} to {:?}", current, next),
        ));
    }
    channel.status = ChannelStatus::MsContract(next);
    Ok(())
}

pub(crate) fn set_vpc_status(
    channel: &mut Channel,
    next: VpcStatus,
    operation: &'static str,
) -> ChannelResult<()> {
    let current = vpc_status(channel, operation)?;
    if !current.can_transition_to(next) {
        return Err(ChannelError::invalid_state(
            operation,
            format!("cannot move from {:?} to {:?}", current, next),
        ));
    }
    channel.status = ChannelStatus::Vpc(next);
    Ok(())
}

// =============================================================================
// RPC SURFACE
// =============================================================================

#[async_trait]
impl<A, T, S> ChannelApi for ChannelService<A, T, S>
where
    A: BlockchainAdapter + 'static,
    T: TimeSource + 'static,
    S: StateSigner + 'static,
{
    async fn get_channels(&self) -> Vec<Channel> {
        self.registry.list_all()
    }

    async fn receive_updates(&self) -> ChannelResult<Subscription> {
        let own = self.require_own_address()?;
        Ok(self
            .events
            .subscribe(own, EventFilter::all(), ReplayFrom::Beginning))
    }

    async fn set_lib_sig_address(&self, address: Address) {
        self.settings.write().lib_sig_address = Some(address);
        info!(address = %address, "Signature library address set");
    }

    async fn set_vpc_address(&self, address: Address) {
        self.settings.write().vpc_address = Some(address);
        info!(address = %address, "VPC contract address set");
    }

    async fn set_own_address(&self, address: Address) {
        self.settings.write().own_address = Some(address);
        info!(address = %address, "Own address set");
    }

    async fn settings(&self) -> NodeSettings {
        self.settings.read().clone()
    }

    async fn create_new_ms_channel(&self, alice: Address, bob: Address) -> ChannelResult<Channel> {
        self.ms_create(alice, bob).await
    }

    async fn confirm_channel(
        &self,
        channel_id: ChannelId,
        amount: Amount,
    ) -> ChannelResult<Subscription> {
        let channel = self.ms_confirm(channel_id, amount).await?;
        Ok(self.events.subscribe(
            channel.participants.b,
            EventFilter::channel(channel_id),
            ReplayFrom::Beginning,
        ))
    }

    async fn subscribe_to_channel(&self, channel_id: ChannelId) -> ChannelResult<Subscription> {
        let own = self.require_own_address()?;
        // Settled VPCs leave the registry but keep their log entries
        if !self.registry.contains(&channel_id)
            && self
                .events
                .history(&own, &EventFilter::channel(channel_id))
                .is_empty()
        {
            return Err(ChannelError::NotFound { channel_id });
        }
        Ok(self.events.resume(own, channel_id))
    }

    async fn refund_channel(&self, channel_id: ChannelId) -> ChannelResult<()> {
        self.ms_refund(channel_id).await.map(|_| ())
    }

    async fn close_ms_contract(&self, channel_id: ChannelId) -> ChannelResult<()> {
        self.ms_close(channel_id).await.map(|_| ())
    }

    async fn finalize_close_ms_contract(&self, channel_id: ChannelId) -> ChannelResult<()> {
        self.ms_finalize_close(channel_id).await.map(|_| ())
    }

    async fn propose_vpc(&self, proposal: VpcProposal) -> ChannelResult<ChannelState> {
        self.vpc_propose(proposal).await
    }

    async fn confirm_proposed_vpc(&self, state: ChannelState) -> ChannelResult<ChannelState> {
        self.vpc_confirm(state).await
    }

    async fn state_register(&self, channel_id: ChannelId, state: ChannelState) -> ChannelResult<()> {
        self.vpc_register(channel_id, state).await.map(|_| ())
    }

    async fn finalize_register(&self, channel_id: ChannelId) -> ChannelResult<()> {
        self.vpc_finalize_register(channel_id).await.map(|_| ())
    }

    async fn abandon_proposed_vpc(&self, channel_id: ChannelId) -> ChannelResult<()> {
        self.vpc_abandon(channel_id).await.map(|_| ())
    }

    async fn close_virtual_channel(
        &self,
        channel_id: ChannelId,
        state: ChannelState,
    ) -> ChannelResult<()> {
        self.vpc_close(channel_id, state).await.map(|_| ())
    }

    async fn execute_close_virtual_channel(&self, channel_id: ChannelId) -> ChannelResult<()> {
        self.vpc_execute_close(channel_id).await.map(|_| ())
    }

    async fn propose_new_channel_state(
        &self,
        channel_id: ChannelId,
        state: ChannelState,
    ) -> ChannelResult<ChannelState> {
        let ticket = self.engine.propose_state(channel_id, state).await?;
        self.engine.await_outcome(ticket).await
    }

    async fn respond_new_channel_state(
        &self,
        channel_id: ChannelId,
        response: StateResponse,
    ) -> ChannelResult<()> {
        self.engine.respond_state(channel_id, response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapters::{ChainOp, InMemoryChain, KeyringSigner, ManualClock};
    use shared_types::Participants;

    fn service() -> ChannelService<InMemoryChain, ManualClock, KeyringSigner> {
        ChannelService::new(
            ChannelConfig::for_testing(),
            Arc::new(InMemoryChain::new()),
            Arc::new(ManualClock::new(1_000)),
            Arc::new(KeyringSigner::new()),
        )
    }

    fn channel() -> Channel {
        let participants = Participants::new(Address::new([1u8; 20]), Address::new([2u8; 20]));
        Channel::new_ms_contract(ChannelId::new([7u8; 32]), participants, 0, 10)
    }

    #[tokio::test]
    async fn test_submit_retries_then_succeeds() {
        let svc = service();
        let ch = channel();
        svc.chain.fail_next(2);

        let (chain, id) = (svc.chain(), ch.id);
        let receipt = svc
            .submit("refund", &ch, move || chain.refund(id))
            .await
            .unwrap();

        assert_eq!(receipt.channel_id, ch.id);
        assert_eq!(svc.chain.call_count(ChainOp::Refund, &ch.id), 3);
        assert!(svc
            .events
            .history(&ch.participants.a, &EventFilter::all())
            .is_empty());
    }

    #[tokio::test]
    async fn test_submit_reports_terminal_failure() {
        let svc = service();
        let ch = channel();
        svc.chain.fail_next(3);

        let (chain, id) = (svc.chain(), ch.id);
        let result = svc.submit("refund", &ch, move || chain.refund(id)).await;

        assert!(matches!(
            result,
            Err(ChannelError::AdapterFailure {
                operation: "refund",
                ..
            })
        ));
        for addr in ch.participants.both() {
            let log = svc.events.history(&addr, &EventFilter::all());
            assert_eq!(log.len(), 1);
            assert!(matches!(log[0].kind, EventKind::Failed { .. }));
        }
    }

    #[tokio::test]
    async fn test_node_settings() {
        let svc = service();
        assert!(matches!(
            svc.receive_updates().await,
            Err(ChannelError::NotConfigured {
                setting: "own_address"
            })
        ));
        assert!(svc.require_vpc_contract().is_err());

        svc.set_own_address(Address::new([1u8; 20])).await;
        svc.set_vpc_address(Address::new([9u8; 20])).await;
        svc.set_lib_sig_address(Address::new([8u8; 20])).await;

        let settings = svc.settings().await;
        assert_eq!(settings.vpc_address, Some(Address::new([9u8; 20])));
        assert_eq!(settings.lib_sig_address, Some(Address::new([8u8; 20])));
        assert!(svc.receive_updates().await.is_ok());
    }

    #[test]
    fn test_status_guard_rejects_skipping() {
        let mut ch = channel();
        assert!(set_ms_status(&mut ch, MsContractStatus::Closed, "test").is_err());
        assert!(set_ms_status(&mut ch, MsContractStatus::Open, "test").is_ok());
        assert!(vpc_status(&ch, "test").is_err());
    }
}

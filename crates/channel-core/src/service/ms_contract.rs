//! # MSContract Lifecycle
//!
//! ```text
//! PendingConfirm ──confirm──→ Open ──close──→ Closing ──ack / deadline──→ Closed
//!       │
//!       └──deadline + refund──→ Refunded
//! ```

use super::{ms_status, set_ms_status, ChannelService};
use crate::domain::{derive_channel_id, fresh_nonce, invariant_no_active_children, invariant_single_proposal};
use crate::error::{ChannelError, ChannelResult};
use crate::ports::outbound::{BlockchainAdapter, StateSigner, TimeSource};
use crate::registry::ChannelGuard;
use channel_telemetry::log_channel_event;
use shared_bus::EventKind;
use shared_types::{
    Address, Amount, Channel, ChannelId, Deadline, DeadlineKind, MsContractStatus, Participants,
};

impl<A, T, S> ChannelService<A, T, S>
where
    A: BlockchainAdapter,
    T: TimeSource,
    S: StateSigner,
{
    /// Create an MSContract awaiting `bob`'s confirmation.
    pub async fn ms_create(&self, alice: Address, bob: Address) -> ChannelResult<Channel> {
        if alice == bob {
            return Err(ChannelError::invalid_state(
                "create_ms_contract",
                "participants must be distinct",
            ));
        }

        let now = self.now();
        let id = derive_channel_id(&alice, &bob, &fresh_nonce());
        let confirm_by = self.deadline_after(now, self.config().confirmation_timeout);
        let channel = Channel::new_ms_contract(id, Participants::new(alice, bob), now, confirm_by);

        self.registry().insert(channel.clone())?;
        self.notify(EventKind::Created, &channel);
        log_channel_event!(
            info,
            "ms_contract",
            "MSContract created",
            id,
            alice = %alice,
            bob = %bob,
            confirm_by = confirm_by
        );
        Ok(channel)
    }

    /// Confirm and fund a pending MSContract.
    ///
    /// Late confirmation fails with `DeadlineExceeded`; the creator can then
    /// refund.
    pub async fn ms_confirm(&self, channel_id: ChannelId, amount: Amount) -> ChannelResult<Channel> {
        let guard = self.registry().lock(&channel_id).await?;
        let now = self.now();
        let mut channel = guard.snapshot();

        match ms_status(&channel, "confirm_channel")? {
            MsContractStatus::PendingConfirm => {}
            MsContractStatus::Open | MsContractStatus::Closing | MsContractStatus::Closed => {
                return Err(ChannelError::AlreadyConfirmed { channel_id });
            }
            MsContractStatus::Refunded => {
                return Err(ChannelError::invalid_state(
                    "confirm_channel",
                    "channel was refunded",
                ));
            }
        }
        if let Some(deadline) = channel.deadline.filter(|d| d.is_expired(now)) {
            return Err(ChannelError::DeadlineExceeded {
                deadline: deadline.at,
                now,
            });
        }

        set_ms_status(&mut channel, MsContractStatus::Open, "confirm_channel")?;
        channel.funds.committed = amount;
        channel.deadline = None;
        channel.updated_at = now;
        guard.commit(channel.clone());

        self.notify(EventKind::Confirmed, &channel);
        log_channel_event!(
            info,
            "ms_contract",
            "MSContract confirmed",
            channel_id,
            amount = %amount
        );
        Ok(channel)
    }

    /// Return the creator's funds once confirmation is overdue.
    pub async fn ms_refund(&self, channel_id: ChannelId) -> ChannelResult<Channel> {
        let guard = self.registry().lock(&channel_id).await?;
        let now = self.now();
        let mut channel = guard.snapshot();

        let status = ms_status(&channel, "refund_channel")?;
        if status != MsContractStatus::PendingConfirm {
            return Err(ChannelError::invalid_state(
                "refund_channel",
                format!("channel is {:?}", status),
            ));
        }
        let deadline = channel.deadline.ok_or_else(|| {
            ChannelError::invalid_state("refund_channel", "no confirmation deadline")
        })?;
        if !deadline.is_expired(now) {
            return Err(ChannelError::TooEarly {
                deadline: deadline.at,
                now,
            });
        }

        let chain = self.chain();
        let guard = self
            .submit_unlocked(guard, "refund", &channel, move || chain.refund(channel_id))
            .await?;

        set_ms_status(&mut channel, MsContractStatus::Refunded, "refund_channel")?;
        channel.deadline = None;
        channel.updated_at = self.now();
        guard.commit(channel.clone());

        self.notify(EventKind::Refunded, &channel);
        log_channel_event!(info, "ms_contract", "MSContract refunded", channel_id);
        Ok(channel)
    }

    /// Close an open MSContract, or acknowledge a close in progress.
    ///
    /// The first call submits the close and opens the response window. A
    /// second call while `Closing` is the counterparty's acknowledgement and
    /// settles immediately.
    pub async fn ms_close(&self, channel_id: ChannelId) -> ChannelResult<Channel> {
        let guard = self.registry().lock(&channel_id).await?;
        let now = self.now();
        let mut channel = guard.snapshot();

        match ms_status(&channel, "close_ms_contract")? {
            MsContractStatus::Open => {
                let children = self.registry().children_of(&channel_id);
                invariant_no_active_children(&channel, &children)?;
                invariant_single_proposal(&channel, now)?;
                if channel.pending_proposal.is_some() {
                    self.engine().discard_proposal(&guard, &mut channel, now);
                }

                let chain = self.chain();
                let state = channel.current_state.as_ref();
                let guard = self
                    .submit_unlocked(guard, "close_channel", &channel, move || {
                        chain.close_channel(channel_id, state)
                    })
                    .await?;

                let now = self.now();
                set_ms_status(&mut channel, MsContractStatus::Closing, "close_ms_contract")?;
                channel.deadline = Some(Deadline::new(
                    DeadlineKind::Response,
                    self.deadline_after(now, self.config().response_timeout),
                ));
                channel.updated_at = now;
                guard.commit(channel.clone());

                self.notify(EventKind::Closing, &channel);
                log_channel_event!(
                    info,
                    "ms_contract",
                    "MSContract closing",
                    channel_id,
                    version = ?channel.current_version()
                );
                Ok(channel)
            }
            MsContractStatus::Closing => {
                self.settle_ms_contract(guard, channel, "close_ms_contract")
                    .await
            }
            status => Err(ChannelError::invalid_state(
                "close_ms_contract",
                format!("channel is {:?}", status),
            )),
        }
    }

    /// Settle a closing MSContract after the response window.
    pub async fn ms_finalize_close(&self, channel_id: ChannelId) -> ChannelResult<Channel> {
        let guard = self.registry().lock(&channel_id).await?;
        let now = self.now();
        let channel = guard.snapshot();

        let status = ms_status(&channel, "finalize_close_ms_contract")?;
        if status != MsContractStatus::Closing {
            return Err(ChannelError::invalid_state(
                "finalize_close_ms_contract",
                format!("channel is {:?}", status),
            ));
        }
        if let Some(deadline) = channel.deadline.filter(|d| !d.is_expired(now)) {
            return Err(ChannelError::TooEarly {
                deadline: deadline.at,
                now,
            });
        }

        self.settle_ms_contract(guard, channel, "finalize_close_ms_contract")
            .await
    }

    async fn settle_ms_contract(
        &self,
        guard: ChannelGuard,
        mut channel: Channel,
        operation: &'static str,
    ) -> ChannelResult<Channel> {
        let channel_id = channel.id;
        let chain = self.chain();
        let guard = self
            .submit_unlocked(guard, "execute_settle", &channel, move || {
                chain.execute_settle(channel_id)
            })
            .await?;

        set_ms_status(&mut channel, MsContractStatus::Closed, operation)?;
        channel.deadline = None;
        channel.updated_at = self.now();
        guard.commit(channel.clone());

        self.notify(EventKind::Closed, &channel);
        log_channel_event!(
            info,
            "ms_contract",
            "MSContract closed",
            channel_id,
            version = ?channel.current_version()
        );
        Ok(channel)
    }
}

#[cfg(test)]
mod tests {
    use crate::adapters::{ChainOp, InMemoryChain, KeyringSigner, ManualClock};
    use crate::config::{ChannelConfig, RetryPolicy};
    use crate::error::ChannelError;
    use crate::service::ChannelService;
    use shared_bus::{EventFilter, EventKind};
    use shared_types::{Address, Balances, ChannelState, ChannelStatus, MsContractStatus, U256};
    use std::sync::Arc;
    use std::time::Duration;

    type Service = ChannelService<InMemoryChain, ManualClock, KeyringSigner>;

    fn setup() -> (Service, Arc<InMemoryChain>, Arc<ManualClock>) {
        let chain = Arc::new(InMemoryChain::new());
        let clock = Arc::new(ManualClock::new(1_000));
        let svc = ChannelService::new(
            ChannelConfig::for_testing(),
            chain.clone(),
            clock.clone(),
            Arc::new(KeyringSigner::new()),
        );
        (svc, chain, clock)
    }

    fn alice() -> Address {
        Address::new([0xaa; 20])
    }

    fn bob() -> Address {
        Address::new([0xbb; 20])
    }

    #[tokio::test]
    async fn test_create_rejects_self_channel() {
        let (svc, _, _) = setup();
        assert!(matches!(
            svc.ms_create(alice(), alice()).await,
            Err(ChannelError::InvalidState { .. })
        ));
        assert!(svc.registry().is_empty());
    }

    #[tokio::test]
    async fn test_confirm_opens_channel() {
        let (svc, _, _) = setup();
        let ch = svc.ms_create(alice(), bob()).await.unwrap();

        let confirmed = svc.ms_confirm(ch.id, U256::from(100)).await.unwrap();
        assert_eq!(confirmed.status, ChannelStatus::MsContract(MsContractStatus::Open));
        assert_eq!(confirmed.funds.committed, U256::from(100));
        assert!(confirmed.deadline.is_none());

        assert!(matches!(
            svc.ms_confirm(ch.id, U256::from(100)).await,
            Err(ChannelError::AlreadyConfirmed { .. })
        ));
    }

    #[tokio::test]
    async fn test_late_confirm_then_refund() {
        let (svc, chain, clock) = setup();
        let ch = svc.ms_create(alice(), bob()).await.unwrap();

        assert!(matches!(
            svc.ms_refund(ch.id).await,
            Err(ChannelError::TooEarly { .. })
        ));

        clock.advance(svc.config().confirmation_timeout + Duration::from_millis(1));
        assert!(matches!(
            svc.ms_confirm(ch.id, U256::from(100)).await,
            Err(ChannelError::DeadlineExceeded { .. })
        ));

        let refunded = svc.ms_refund(ch.id).await.unwrap();
        assert_eq!(
            refunded.status,
            ChannelStatus::MsContract(MsContractStatus::Refunded)
        );
        assert!(chain.record(&ch.id).unwrap().refunded);
        assert!(matches!(
            svc.ms_confirm(ch.id, U256::from(100)).await,
            Err(ChannelError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_refund_of_open_channel_rejected() {
        let (svc, _, _) = setup();
        let ch = svc.ms_create(alice(), bob()).await.unwrap();
        svc.ms_confirm(ch.id, U256::from(10)).await.unwrap();

        assert!(matches!(
            svc.ms_refund(ch.id).await,
            Err(ChannelError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_close_then_acknowledge() {
        let (svc, chain, _) = setup();
        let ch = svc.ms_create(alice(), bob()).await.unwrap();
        svc.ms_confirm(ch.id, U256::from(10)).await.unwrap();

        let closing = svc.ms_close(ch.id).await.unwrap();
        assert_eq!(closing.status, ChannelStatus::MsContract(MsContractStatus::Closing));
        assert!(closing.deadline.is_some());

        let closed = svc.ms_close(ch.id).await.unwrap();
        assert_eq!(closed.status, ChannelStatus::MsContract(MsContractStatus::Closed));
        assert!(chain.record(&ch.id).unwrap().settled);

        let kinds: Vec<EventKind> = svc
            .events()
            .history(&bob(), &EventFilter::channel(ch.id))
            .into_iter()
            .map(|e| e.kind)
            .collect();
        assert_eq!(
            kinds,
            vec![
                EventKind::Created,
                EventKind::Confirmed,
                EventKind::Closing,
                EventKind::Closed
            ]
        );
    }

    #[tokio::test]
    async fn test_finalize_close_waits_for_deadline() {
        let (svc, _, clock) = setup();
        let ch = svc.ms_create(alice(), bob()).await.unwrap();
        svc.ms_confirm(ch.id, U256::from(10)).await.unwrap();
        svc.ms_close(ch.id).await.unwrap();

        assert!(matches!(
            svc.ms_finalize_close(ch.id).await,
            Err(ChannelError::TooEarly { .. })
        ));

        clock.advance(svc.config().response_timeout + Duration::from_millis(1));
        let closed = svc.ms_finalize_close(ch.id).await.unwrap();
        assert_eq!(closed.status, ChannelStatus::MsContract(MsContractStatus::Closed));
    }

    #[tokio::test]
    async fn test_adapter_failure_leaves_channel_open() {
        let (svc, chain, _) = setup();
        let ch = svc.ms_create(alice(), bob()).await.unwrap();
        svc.ms_confirm(ch.id, U256::from(10)).await.unwrap();

        chain.fail_next(3);
        assert!(matches!(
            svc.ms_close(ch.id).await,
            Err(ChannelError::AdapterFailure { .. })
        ));
        assert_eq!(chain.call_count(ChainOp::Close, &ch.id), 3);
        assert_eq!(
            svc.registry().get(&ch.id).unwrap().status,
            ChannelStatus::MsContract(MsContractStatus::Open)
        );

        let last = svc
            .events()
            .history(&alice(), &EventFilter::channel(ch.id))
            .pop()
            .unwrap();
        assert!(matches!(last.kind, EventKind::Failed { .. }));
    }

    #[tokio::test]
    async fn test_retried_close_does_not_hold_channel_lock() {
        let chain = Arc::new(InMemoryChain::new());
        let config = ChannelConfig {
            adapter_retry: RetryPolicy {
                max_attempts: 3,
                backoff: Duration::from_millis(200),
            },
            ..ChannelConfig::for_testing()
        };
        let svc = Arc::new(ChannelService::new(
            config,
            chain.clone(),
            Arc::new(ManualClock::new(1_000)),
            Arc::new(KeyringSigner::new()),
        ));
        let ch = svc.ms_create(alice(), bob()).await.unwrap();
        svc.ms_confirm(ch.id, U256::from(10)).await.unwrap();

        chain.fail_next(2);
        let closing = {
            let svc = svc.clone();
            let id = ch.id;
            tokio::spawn(async move { svc.ms_close(id).await })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // Other writers are answered at once instead of queueing behind the retries
        let update = ChannelState::unsigned(ch.id, 1, Balances::new(U256::from(5), U256::from(5)));
        let rejected = tokio::time::timeout(
            Duration::from_millis(50),
            svc.engine().propose_state(ch.id, update),
        )
        .await
        .expect("writer blocked by the close");
        assert!(matches!(
            rejected,
            Err(ChannelError::ChainCallInFlight {
                operation: "close_channel",
                ..
            })
        ));
        let second_close = tokio::time::timeout(Duration::from_millis(50), svc.ms_close(ch.id))
            .await
            .expect("writer blocked by the close");
        assert!(matches!(
            second_close,
            Err(ChannelError::ChainCallInFlight { .. })
        ));
        assert_eq!(
            svc.registry().get(&ch.id).unwrap().status,
            ChannelStatus::MsContract(MsContractStatus::Open)
        );

        let closed = closing.await.unwrap().unwrap();
        assert_eq!(closed.status, ChannelStatus::MsContract(MsContractStatus::Closing));
        assert_eq!(chain.call_count(ChainOp::Close, &ch.id), 3);

        // The lock is free again once the close is committed
        let settled = svc.ms_close(ch.id).await.unwrap();
        assert_eq!(settled.status, ChannelStatus::MsContract(MsContractStatus::Closed));
    }
}

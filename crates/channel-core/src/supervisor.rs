//! # Timeout Supervisor
//!
//! Periodic sweep over the registry that turns passed deadlines into
//! events, discards unanswered proposals and, when enabled, runs the
//! close fallbacks itself.
//!
//! | Status | Deadline | Action |
//! |--------|----------|--------|
//! | any accepting updates | proposal deadline | discard proposal |
//! | `PendingConfirm` | confirmation | announce (refund callable) |
//! | `Proposed` / `Negotiated` | negotiation | announce (finalize register callable) |
//! | `Closing` | response | execute close, or announce when auto fallback is off |
//!
//! Nothing is done for a channel whose deadline has not passed. Each
//! deadline is announced once.

use crate::error::{ChannelError, ChannelResult};
use crate::ports::outbound::{BlockchainAdapter, StateSigner, TimeSource};
use crate::service::ChannelService;
use shared_bus::EventKind;
use shared_types::{ChannelId, ChannelKind, ChannelStatus, DeadlineKind, MsContractStatus, VpcStatus};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

/// Counters from one sweep.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    /// Unanswered proposals discarded.
    pub proposals_expired: usize,
    /// `DeadlineExpired` entries published.
    pub deadlines_announced: usize,
    /// Close fallbacks executed.
    pub fallbacks_executed: usize,
    /// Close fallbacks that failed; retried next sweep.
    pub fallbacks_failed: usize,
}

impl SweepReport {
    /// Whether the sweep did anything.
    pub fn is_empty(&self) -> bool {
        *self == Self::default()
    }
}

/// Deadline supervisor.
pub struct Supervisor<A, T, S>
where
    A: BlockchainAdapter,
    T: TimeSource,
    S: StateSigner,
{
    service: Arc<ChannelService<A, T, S>>,
    interval: Duration,
}

impl<A, T, S> Supervisor<A, T, S>
where
    A: BlockchainAdapter + 'static,
    T: TimeSource + 'static,
    S: StateSigner + 'static,
{
    /// Create a supervisor ticking at the service's configured interval.
    pub fn new(service: Arc<ChannelService<A, T, S>>) -> Self {
        let interval = service.config().supervisor_interval;
        Self { service, interval }
    }

    /// Run on a background task until `shutdown` turns `true`.
    pub fn spawn(self, shutdown: watch::Receiver<bool>) -> JoinHandle<()> {
        tokio::spawn(self.run(shutdown))
    }

    /// Sweep on every tick until `shutdown` turns `true` or its sender drops.
    pub async fn run(self, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        info!(interval_ms = self.interval.as_millis() as u64, "Supervisor started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    let report = self.sweep().await;
                    if !report.is_empty() {
                        debug!(?report, "Supervisor sweep");
                    }
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("Supervisor stopped");
    }

    /// One pass over every channel in the registry.
    pub async fn sweep(&self) -> SweepReport {
        let mut report = SweepReport::default();
        let now = self.service.clock().now();

        for channel in self.service.registry().list_all() {
            if channel.status.is_terminal() {
                continue;
            }

            let proposal_expired = channel
                .pending_proposal
                .as_ref()
                .is_some_and(|p| p.is_expired(now));
            if proposal_expired && channel.status.accepts_updates() {
                match self.service.engine().expire_proposal(channel.id).await {
                    Ok(true) => report.proposals_expired += 1,
                    Ok(false) => {}
                    Err(e) => debug!(channel_id = %channel.id, error = %e, "Proposal expiry skipped"),
                }
            }

            let Some(deadline) = channel.deadline else {
                continue;
            };
            if !deadline.is_expired(now) {
                continue;
            }

            let closing = matches!(
                channel.status,
                ChannelStatus::MsContract(MsContractStatus::Closing)
                    | ChannelStatus::Vpc(VpcStatus::Closing)
            );
            if closing && deadline.kind == DeadlineKind::Response && self.service.config().auto_fallback {
                match self.fallback_close(channel.id, channel.kind()).await {
                    Ok(()) => report.fallbacks_executed += 1,
                    Err(e @ ChannelError::ChainCallInFlight { .. }) => {
                        debug!(channel_id = %channel.id, error = %e, "Close fallback deferred");
                    }
                    Err(e) => {
                        report.fallbacks_failed += 1;
                        warn!(channel_id = %channel.id, error = %e, "Close fallback failed");
                    }
                }
                continue;
            }

            if !deadline.announced {
                match self.announce(channel.id).await {
                    Ok(true) => report.deadlines_announced += 1,
                    Ok(false) => {}
                    Err(e) => debug!(channel_id = %channel.id, error = %e, "Announcement skipped"),
                }
            }
        }

        report
    }

    async fn fallback_close(&self, channel_id: ChannelId, kind: ChannelKind) -> ChannelResult<()> {
        match kind {
            ChannelKind::MsContract => self.service.ms_finalize_close(channel_id).await?,
            ChannelKind::Vpc => self.service.vpc_execute_close(channel_id).await?,
        };
        info!(channel_id = %channel_id, ?kind, "Close fallback executed");
        Ok(())
    }

    /// Publish `DeadlineExpired` once for the channel's current deadline.
    async fn announce(&self, channel_id: ChannelId) -> ChannelResult<bool> {
        let guard = self.service.registry().lock(&channel_id).await?;
        let now = self.service.clock().now();
        let mut channel = guard.snapshot();

        let Some(mut deadline) = channel.deadline else {
            return Ok(false);
        };
        if deadline.announced || !deadline.is_expired(now) || channel.status.is_terminal() {
            return Ok(false);
        }

        deadline.announced = true;
        channel.deadline = Some(deadline);
        guard.commit(channel.clone());

        self.service.notify(
            EventKind::DeadlineExpired {
                deadline: deadline.kind,
            },
            &channel,
        );
        info!(
            channel_id = %channel_id,
            deadline = ?deadline.kind,
            status = %channel.status,
            "Deadline expired"
        );
        Ok(true)
    }
}

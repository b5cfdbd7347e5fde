//! In-memory blockchain adapter.
//!
//! Implements `BlockchainAdapter` by recording what the chain would hold.
//! Failures can be injected for tests.

use crate::ports::outbound::{AdapterError, BlockchainAdapter, TxReceipt};
use async_trait::async_trait;
use parking_lot::RwLock;
use shared_crypto::keccak256_many;
use shared_types::{ChannelId, ChannelState};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, Ordering};
use tracing::{debug, info};

/// On-chain record of one channel.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChainRecord {
    /// Highest registered state.
    pub registered: Option<ChannelState>,
    /// Version submitted with the latest close, if any.
    pub closed_at_version: Option<Option<u64>>,
    /// Settlement executed.
    pub settled: bool,
    /// Refund executed.
    pub refunded: bool,
}

/// Adapter operation, as seen by the chain.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ChainOp {
    /// `register_state`
    Register,
    /// `close_channel`
    Close,
    /// `execute_settle`
    Settle,
    /// `refund`
    Refund,
}

/// In-memory chain for tests and local runs.
pub struct InMemoryChain {
    records: RwLock<HashMap<ChannelId, ChainRecord>>,
    calls: RwLock<Vec<(ChainOp, ChannelId)>>,
    fail_next: AtomicU32,
}

impl InMemoryChain {
    /// Create an empty chain.
    pub fn new() -> Self {
        Self {
            records: RwLock::new(HashMap::new()),
            calls: RwLock::new(Vec::new()),
            fail_next: AtomicU32::new(0),
        }
    }

    /// Make the next `n` calls fail with `Unavailable`.
    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    /// On-chain record of a channel.
    pub fn record(&self, channel_id: &ChannelId) -> Option<ChainRecord> {
        self.records.read().get(channel_id).cloned()
    }

    /// Number of calls of `op` for a channel, failed ones included.
    pub fn call_count(&self, op: ChainOp, channel_id: &ChannelId) -> usize {
        self.calls
            .read()
            .iter()
            .filter(|(o, id)| *o == op && id == channel_id)
            .count()
    }

    fn begin(&self, op: ChainOp, channel_id: ChannelId) -> Result<(), AdapterError> {
        self.calls.write().push((op, channel_id));

        let injected = self
            .fail_next
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            debug!(op = ?op, channel_id = %channel_id, "Injected chain failure");
            return Err(AdapterError::Unavailable("injected failure".to_string()));
        }
        Ok(())
    }

    fn receipt(op: ChainOp, channel_id: ChannelId, version: Option<u64>) -> TxReceipt {
        let tag = [op as u8];
        let version_bytes = version.unwrap_or(u64::MAX).to_be_bytes();
        TxReceipt {
            tx_hash: keccak256_many(&[&tag, channel_id.as_bytes(), &version_bytes]),
            channel_id,
            version,
        }
    }
}

impl Default for InMemoryChain {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BlockchainAdapter for InMemoryChain {
    async fn register_state(
        &self,
        channel_id: ChannelId,
        state: &ChannelState,
    ) -> Result<TxReceipt, AdapterError> {
        self.begin(ChainOp::Register, channel_id)?;

        let mut records = self.records.write();
        let record = records.entry(channel_id).or_default();
        if let Some(current) = &record.registered {
            if current.version > state.version {
                return Err(AdapterError::StaleVersion {
                    submitted: state.version,
                    onchain: current.version,
                });
            }
        }
        record.registered = Some(state.clone());

        info!(channel_id = %channel_id, version = state.version, "State registered on chain");
        Ok(Self::receipt(ChainOp::Register, channel_id, Some(state.version)))
    }

    async fn close_channel(
        &self,
        channel_id: ChannelId,
        state: Option<&ChannelState>,
    ) -> Result<TxReceipt, AdapterError> {
        self.begin(ChainOp::Close, channel_id)?;

        let version = state.map(|s| s.version);
        let mut records = self.records.write();
        let record = records.entry(channel_id).or_default();
        if record.settled {
            return Err(AdapterError::Reverted {
                reason: "channel already settled".to_string(),
            });
        }
        if let Some(state) = state {
            let higher = record
                .registered
                .as_ref()
                .map_or(true, |r| state.version >= r.version);
            if higher {
                record.registered = Some(state.clone());
            }
        }
        record.closed_at_version = Some(version);

        info!(channel_id = %channel_id, version = ?version, "Close submitted on chain");
        Ok(Self::receipt(ChainOp::Close, channel_id, version))
    }

    async fn execute_settle(&self, channel_id: ChannelId) -> Result<TxReceipt, AdapterError> {
        self.begin(ChainOp::Settle, channel_id)?;

        let mut records = self.records.write();
        let record = records.entry(channel_id).or_default();
        if record.closed_at_version.is_none() {
            return Err(AdapterError::Reverted {
                reason: "settle before close".to_string(),
            });
        }
        record.settled = true;

        info!(channel_id = %channel_id, "Channel settled on chain");
        Ok(Self::receipt(ChainOp::Settle, channel_id, None))
    }

    async fn refund(&self, channel_id: ChannelId) -> Result<TxReceipt, AdapterError> {
        self.begin(ChainOp::Refund, channel_id)?;

        let mut records = self.records.write();
        records.entry(channel_id).or_default().refunded = true;

        info!(channel_id = %channel_id, "Refund executed on chain");
        Ok(Self::receipt(ChainOp::Refund, channel_id, None))
    }
}
